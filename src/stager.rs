//! Modality isolation
//!
//! Builds a view directory that exposes only the channels a consumer is
//! allowed to see, re-indexed in the consumer's order. A model trained on a
//! given channel set silently degrades when fed a different one, so a view
//! never contains anything but the requested files.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::case::CaseId;
use crate::enums::CopyMode;
use crate::error::{Error, Result};
use crate::nifti_io::NIFTI_EXTENSIONS;

/// `{caseID}_{index:04}.{ext}`
pub fn channel_file_name(case_id: &str, index: usize, extension: &str) -> String {
    format!("{case_id}_{index:04}.{extension}")
}

/// A staged view directory and the files it contains, in channel order.
#[derive(Debug, Clone)]
pub struct StagedView {
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

pub struct Stager {
    /// Channel names of the source case, in source index order
    layout: Vec<String>,
    copy_mode: CopyMode,
}

impl Stager {
    pub fn new(layout: Vec<String>, copy_mode: CopyMode) -> Self {
        Self { layout, copy_mode }
    }

    /// Source index of `channel`, if it is part of the layout.
    pub fn index_of(&self, channel: &str) -> Option<usize> {
        self.layout.iter().position(|name| name == channel)
    }

    /// Stages the `allowed` channels of `case_id` from `source_dir` into `dest_dir`.
    ///
    /// `dest_dir` is emptied first. Every source file is located before
    /// anything is created, so a missing channel leaves no partial view.
    pub fn stage(
        &self,
        source_dir: &Path,
        case_id: &CaseId,
        allowed: &[String],
        dest_dir: &Path,
    ) -> Result<StagedView> {
        if allowed.is_empty() {
            return Err(Error::Config("a view needs at least one channel".to_string()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = allowed.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(Error::Config(format!("channel {dup} listed twice")));
        }

        let sources = allowed
            .iter()
            .map(|channel| self.locate(source_dir, case_id, channel))
            .collect::<Result<Vec<_>>>()?;

        reset_dir(dest_dir)?;
        let mut files = Vec::with_capacity(sources.len());
        for (target_index, (source, extension)) in sources.iter().enumerate() {
            let target = dest_dir.join(channel_file_name(case_id.as_str(), target_index, extension));
            materialize(source, &target, self.copy_mode)?;
            debug!(source = %source.display(), target = %target.display(), "Staged channel");
            files.push(target);
        }

        info!(
            case_id = %case_id,
            channels = ?allowed,
            dir = %dest_dir.display(),
            "Staged isolated view"
        );
        Ok(StagedView {
            dir: dest_dir.to_path_buf(),
            files,
        })
    }

    fn locate(
        &self,
        source_dir: &Path,
        case_id: &CaseId,
        channel: &str,
    ) -> Result<(PathBuf, &'static str)> {
        let missing = |index: usize| Error::MissingChannel {
            case_id: case_id.to_string(),
            channel: channel.to_string(),
            index,
            dir: source_dir.to_path_buf(),
        };
        let index = self.index_of(channel).ok_or_else(|| missing(self.layout.len()))?;

        NIFTI_EXTENSIONS
            .into_iter()
            .map(|ext| (source_dir.join(channel_file_name(case_id.as_str(), index, ext)), ext))
            .find(|(path, _)| path.is_file())
            .ok_or_else(|| missing(index))
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    }
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))
}

/// Links or copies `src` to `dst`, replacing any existing entry.
pub fn materialize(src: &Path, dst: &Path, mode: CopyMode) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    if dst.symlink_metadata().is_ok() {
        fs::remove_file(dst).map_err(|e| Error::io(dst, e))?;
    }
    let result = match mode {
        CopyMode::Symlink => {
            let target = fs::canonicalize(src).map_err(|e| Error::io(src, e))?;
            symlink(&target, dst)
        }
        CopyMode::Hardlink => fs::hard_link(src, dst),
        CopyMode::Copy => fs::copy(src, dst).map(|_| ()),
    };
    result.map_err(|e| Error::io(dst, e))
}

#[cfg(unix)]
fn symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(windows)]
fn symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(src, dst)
}
