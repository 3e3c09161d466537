//! Scratch workspace and permanent case output
//!
//! A [`Workspace`] owns `{scratch_root}/{caseID}/`. It is removed only by
//! [`Workspace::complete`]; a workspace dropped on a failure path stays on
//! disk for postmortem inspection and is reused by the next run of the same
//! case.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::case::CaseId;
use crate::enums::{Modality, PassId};
use crate::error::{Error, Result};
use crate::stager::channel_file_name;

pub struct Workspace {
    root: PathBuf,
    case_id: CaseId,
    extension: String,
    completed: bool,
}

impl Workspace {
    /// Creates (or reopens) the scratch tree of `case_id`.
    pub fn acquire(scratch_root: &Path, case_id: &CaseId, extension: &str) -> Result<Self> {
        let root = scratch_root.join(case_id.as_str());
        let workspace = Self {
            root,
            case_id: case_id.clone(),
            extension: extension.to_string(),
            completed: false,
        };
        for dir in [
            workspace.dicom_dir(Modality::Ct),
            workspace.dicom_dir(Modality::Pet),
            workspace.converted_dir(),
            workspace.registration_dir(),
            workspace.views_dir(),
            workspace.inference_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }
        info!(case_id = %case_id, root = %workspace.root.display(), "Acquired workspace");
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dicom_dir(&self, modality: Modality) -> PathBuf {
        self.root.join("dicom").join(modality.stem())
    }

    pub fn converted_dir(&self) -> PathBuf {
        self.root.join("converted")
    }

    /// `converted/{ct|pet}.{ext}`
    pub fn converted(&self, modality: Modality) -> PathBuf {
        self.converted_dir()
            .join(format!("{}.{}", modality.stem(), self.extension))
    }

    pub fn registration_dir(&self) -> PathBuf {
        self.root.join("registration")
    }

    pub fn aligned_pet(&self) -> PathBuf {
        self.registration_dir()
            .join(format!("pet_aligned.{}", self.extension))
    }

    pub fn registration_matrix(&self) -> PathBuf {
        self.registration_dir().join("pet_to_ct.txt")
    }

    pub fn views_dir(&self) -> PathBuf {
        self.root.join("views")
    }

    pub fn view_dir(&self, pass: PassId) -> PathBuf {
        self.views_dir().join(pass.dir_name())
    }

    pub fn inference_dir(&self) -> PathBuf {
        self.root.join("inference")
    }

    /// Raw output directory handed to the inference engine for `pass`.
    pub fn pass_output_dir(&self, pass: PassId) -> PathBuf {
        self.inference_dir().join(pass.dir_name())
    }

    /// Copies a DICOM series into the workspace, replacing an earlier import.
    ///
    /// Returns the number of files copied.
    pub fn import_dicom(&self, source: &Path, modality: Modality) -> Result<usize> {
        if !source.is_dir() {
            return Err(Error::io(
                source,
                std::io::Error::new(std::io::ErrorKind::NotFound, "DICOM directory not found"),
            ));
        }
        let dest = self.dicom_dir(modality);
        if dest.exists() {
            fs::remove_dir_all(&dest).map_err(|e| Error::io(&dest, e))?;
        }
        fs::create_dir_all(&dest).map_err(|e| Error::io(&dest, e))?;

        let mut copied = 0;
        for entry in WalkDir::new(source).follow_links(true) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(source).to_path_buf();
                Error::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(source)
                .unwrap_or_else(|_| entry.path());
            let target = dest.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            fs::copy(entry.path(), &target).map_err(|e| Error::io(entry.path(), e))?;
            copied += 1;
        }
        debug!(%modality, files = copied, "Imported DICOM series");
        Ok(copied)
    }

    /// True when the DICOM directory of `modality` holds at least one file.
    pub fn has_dicom(&self, modality: Modality) -> bool {
        WalkDir::new(self.dicom_dir(modality))
            .into_iter()
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_type().is_file())
    }

    /// Ends the run successfully, removing the scratch tree unless `retain`.
    pub fn complete(mut self, retain: bool) -> Result<()> {
        self.completed = true;
        if retain {
            info!(root = %self.root.display(), "Keeping workspace");
            return Ok(());
        }
        fs::remove_dir_all(&self.root).map_err(|e| Error::io(&self.root, e))?;
        info!(case_id = %self.case_id, "Removed workspace");
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.completed {
            warn!(
                case_id = %self.case_id,
                root = %self.root.display(),
                "Run did not complete, workspace left for inspection"
            );
        }
    }
}

/// Permanent per-case output tree, `{output_root}/{caseID}/`.
#[derive(Clone, Debug)]
pub struct CaseOutput {
    dir: PathBuf,
    case_id: CaseId,
    extension: String,
}

impl CaseOutput {
    pub fn new(output_root: &Path, case_id: &CaseId, extension: &str) -> Self {
        Self {
            dir: output_root.join(case_id.as_str()),
            case_id: case_id.clone(),
            extension: extension.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))
    }

    /// `{caseID}_{index:04}.{ext}`
    pub fn channel(&self, index: usize) -> PathBuf {
        self.dir
            .join(channel_file_name(self.case_id.as_str(), index, &self.extension))
    }

    /// `{pass_a|pass_b}/{caseID}.{ext}`
    pub fn segmentation(&self, pass: PassId) -> PathBuf {
        self.dir
            .join(pass.dir_name())
            .join(self.case_id.segmentation_file(&self.extension))
    }

    /// `{caseID}_seg_final.{ext}`
    pub fn final_segmentation(&self) -> PathBuf {
        self.dir.join(self.case_id.final_file(&self.extension))
    }
}

/// Copies `src` to `dest` so `dest` is either absent or complete.
pub fn promote(src: &Path, dest: &Path) -> Result<()> {
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    let temp = tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(dir)
        .map_err(|e| Error::io(dir, e))?;
    fs::copy(src, temp.path()).map_err(|e| Error::io(src, e))?;
    temp.persist(dest).map_err(|e| Error::io(dest, e.error))?;
    debug!(src = %src.display(), dest = %dest.display(), "Promoted artifact");
    Ok(())
}
