//! Conversion and registration collaborators
//!
//! Both are modelled as traits so the pipeline can run against fakes in
//! tests. Command-line implementations shell out through
//! [`CommandTemplate`]; the built-in converter uses [`VolumeLoader`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::enums::{Modality, SortBy};
use crate::external::{CommandTemplate, TemplateValue, ToolError};
use crate::nifti_io;
use crate::volume_loader::VolumeLoader;

/// Turns one DICOM series into a NIfTI volume.
#[async_trait]
pub trait DicomConverter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Converts the series in `dicom_dir` and writes it to `dest`.
    async fn convert(&self, dicom_dir: &Path, modality: Modality, dest: &Path)
    -> Result<(), ToolError>;
}

/// Aligns a moving volume onto a fixed volume's grid (affine).
#[async_trait]
pub trait Registrar: Send + Sync {
    fn name(&self) -> &'static str;

    /// Writes the resampled moving image to `aligned` and the transform to `matrix`.
    async fn register(
        &self,
        moving: &Path,
        fixed: &Path,
        aligned: &Path,
        matrix: &Path,
    ) -> Result<(), ToolError>;
}

/// Runs an external converter such as `dcm2niix`.
///
/// Placeholders: `{dicom_dir}`, `{out_dir}`, `{name}` (file stem without
/// extension), `{output}` (full destination path), `{modality}`.
pub struct CommandConverter {
    template: CommandTemplate,
    timeout: Option<Duration>,
}

impl CommandConverter {
    pub fn new(template: CommandTemplate, timeout: Option<Duration>) -> Self {
        Self { template, timeout }
    }

    /// `dcm2niix -z y -b n -f {name} -o {out_dir} {dicom_dir}`
    pub fn dcm2niix() -> CommandTemplate {
        CommandTemplate::new(
            "dcm2niix",
            &["-z", "y", "-b", "n", "-f", "{name}", "-o", "{out_dir}", "{dicom_dir}"],
        )
    }
}

#[async_trait]
impl DicomConverter for CommandConverter {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn convert(
        &self,
        dicom_dir: &Path,
        modality: Modality,
        dest: &Path,
    ) -> Result<(), ToolError> {
        let out_dir = dest
            .parent()
            .ok_or_else(|| ToolError::Other(format!("{} has no parent", dest.display())))?;
        let file_name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ToolError::Other(format!("{} has no file name", dest.display())))?;
        let stem = nifti_io::extension_of(dest)
            .and_then(|ext| file_name.strip_suffix(&format!(".{ext}")))
            .unwrap_or(file_name);

        let values: HashMap<&str, TemplateValue> = HashMap::from([
            ("dicom_dir", dicom_dir.into()),
            ("out_dir", out_dir.into()),
            ("name", stem.into()),
            ("output", dest.into()),
            ("modality", modality.to_string().into()),
        ]);
        self.template.command(&values, self.timeout).run().await?;

        if !dest.is_file() {
            return Err(ToolError::MissingOutput(dest.to_path_buf()));
        }
        Ok(())
    }
}

/// In-process conversion with the DICOM series loader.
pub struct BuiltinConverter {
    sort_by: SortBy,
}

impl BuiltinConverter {
    pub fn new(sort_by: SortBy) -> Self {
        Self { sort_by }
    }
}

#[async_trait]
impl DicomConverter for BuiltinConverter {
    fn name(&self) -> &'static str {
        "builtin"
    }

    async fn convert(
        &self,
        dicom_dir: &Path,
        modality: Modality,
        dest: &Path,
    ) -> Result<(), ToolError> {
        let dicom_dir = dicom_dir.to_path_buf();
        let dest = dest.to_path_buf();
        let sort_by = self.sort_by;

        tokio::task::spawn_blocking(move || {
            let volume = VolumeLoader::load_from_directory(&dicom_dir, sort_by)
                .map_err(|e| ToolError::Other(e.to_string()))?;
            nifti_io::write_image(&dest, &volume).map_err(|e| ToolError::Other(e.to_string()))?;
            info!(%modality, dims = ?volume.geometry().dims, "Converted DICOM series");
            Ok(())
        })
        .await
        .map_err(|e| ToolError::Other(format!("conversion task failed: {e}")))?
    }
}

/// Runs an external affine registration tool such as NiftyReg `reg_aladin`.
///
/// Placeholders: `{moving}`, `{fixed}`, `{aligned}`, `{matrix}`.
pub struct CommandRegistrar {
    template: CommandTemplate,
    timeout: Option<Duration>,
}

impl CommandRegistrar {
    pub fn new(template: CommandTemplate, timeout: Option<Duration>) -> Self {
        Self { template, timeout }
    }

    /// `reg_aladin -ref {fixed} -flo {moving} -res {aligned} -aff {matrix}`
    pub fn reg_aladin() -> CommandTemplate {
        CommandTemplate::new(
            "reg_aladin",
            &["-ref", "{fixed}", "-flo", "{moving}", "-res", "{aligned}", "-aff", "{matrix}"],
        )
    }
}

#[async_trait]
impl Registrar for CommandRegistrar {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn register(
        &self,
        moving: &Path,
        fixed: &Path,
        aligned: &Path,
        matrix: &Path,
    ) -> Result<(), ToolError> {
        let values: HashMap<&str, TemplateValue> = HashMap::from([
            ("moving", moving.into()),
            ("fixed", fixed.into()),
            ("aligned", aligned.into()),
            ("matrix", matrix.into()),
        ]);
        self.template.command(&values, self.timeout).run().await?;

        for output in [aligned, matrix] {
            if !output.is_file() {
                return Err(ToolError::MissingOutput(output.to_path_buf()));
            }
        }
        Ok(())
    }
}
