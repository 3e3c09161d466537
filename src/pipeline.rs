//! End-to-end run of one case
//!
//! Stages run in [`Stage::ORDER`]. Each stage has a postcondition on disk; a
//! stage whose postcondition already holds is skipped unless the run is
//! forced or an earlier stage ran, which lets an interrupted case resume
//! where it stopped. Every failure is wrapped in [`Error::Stage`] naming the
//! case and the stage.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::case::CaseId;
use crate::config::{Config, ConverterKind};
use crate::enums::{Modality, PassId, Stage};
use crate::error::{Error, Result};
use crate::fusion::{self, FusionReport};
use crate::inference::{
    CommandInferenceEngine, DualPassCoordinator, InferenceEngine, PassRequest,
};
use crate::nifti_io;
use crate::stager::Stager;
use crate::tools::{BuiltinConverter, CommandConverter, CommandRegistrar, DicomConverter, Registrar};
use crate::workspace::{CaseOutput, Workspace, promote};

/// Outcome of a successful run.
#[derive(Clone, Debug)]
pub struct PipelineReport {
    pub case_id: CaseId,
    pub final_path: PathBuf,
    /// Stages whose outputs were already present
    pub skipped: Vec<Stage>,
    pub fusion: FusionReport,
}

pub struct Pipeline {
    config: Config,
    case_id: CaseId,
    ct_dicom: PathBuf,
    pet_dicom: PathBuf,
    force: bool,
    converter: Box<dyn DicomConverter>,
    registrar: Box<dyn Registrar>,
    engine: Box<dyn InferenceEngine>,
}

impl Pipeline {
    /// Creates a pipeline with the external tools named by `config`.
    pub fn new(config: Config, case_id: CaseId, ct_dicom: &Path, pet_dicom: &Path) -> Self {
        let timeout = config.tool_timeout();
        let converter: Box<dyn DicomConverter> = match config.converter.kind {
            ConverterKind::Dcm2niix => {
                Box::new(CommandConverter::new(config.converter.command.clone(), timeout))
            }
            ConverterKind::Builtin => Box::new(BuiltinConverter::new(config.converter.sort_by)),
        };
        let registrar = Box::new(CommandRegistrar::new(config.registration.clone(), timeout));
        let engine = Box::new(CommandInferenceEngine::new(config.inference.clone(), timeout));

        Self {
            config,
            case_id,
            ct_dicom: ct_dicom.to_path_buf(),
            pet_dicom: pet_dicom.to_path_buf(),
            force: false,
            converter,
            registrar,
            engine,
        }
    }

    /// Re-runs every stage even when its outputs exist.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_converter(mut self, converter: Box<dyn DicomConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_registrar(mut self, registrar: Box<dyn Registrar>) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn with_engine(mut self, engine: Box<dyn InferenceEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn case_output(&self) -> CaseOutput {
        CaseOutput::new(&self.config.output_root, &self.case_id, &self.config.extension)
    }

    /// Runs all stages. On failure the scratch workspace is left in place.
    pub async fn run(&self) -> Result<PipelineReport> {
        self.config.validate()?;
        let workspace = Workspace::acquire(
            &self.config.scratch_root,
            &self.case_id,
            &self.config.extension,
        )?;
        let output = self.case_output();
        output.create()?;
        info!(case_id = %self.case_id, output = %output.dir().display(), "Starting pipeline");

        let mut skipped = Vec::new();
        let mut fusion = None;
        // Once a stage has run, outputs of the stages after it are stale.
        let mut ran_upstream = self.force;
        for stage in Stage::ORDER {
            if stage == Stage::Cleanup {
                break;
            }
            if !ran_upstream && self.is_satisfied(stage, &workspace, &output) {
                info!(case_id = %self.case_id, %stage, "Outputs present, skipping stage");
                skipped.push(stage);
                continue;
            }

            info!(case_id = %self.case_id, %stage, "Running stage");
            ran_upstream = true;
            let report = self
                .run_stage(stage, &workspace, &output)
                .await
                .map_err(|source| self.stage_error(stage, source))?;
            if report.is_some() {
                fusion = report;
            }
        }

        let fusion = fusion.ok_or_else(|| {
            self.stage_error(Stage::Fuse, Error::Config("fusion did not run".to_string()))
        })?;
        workspace
            .complete(self.config.keep_workspace)
            .map_err(|source| self.stage_error(Stage::Cleanup, source))?;

        let final_path = output.final_segmentation();
        info!(case_id = %self.case_id, path = %final_path.display(), "Pipeline finished");
        Ok(PipelineReport {
            case_id: self.case_id.clone(),
            final_path,
            skipped,
            fusion,
        })
    }

    fn stage_error(&self, stage: Stage, source: Error) -> Error {
        Error::Stage {
            case_id: self.case_id.to_string(),
            stage,
            source: Box::new(source),
        }
    }

    /// Scratch stages also count as done once the channels are published,
    /// since the scratch tree is gone after a completed run.
    fn is_satisfied(&self, stage: Stage, workspace: &Workspace, output: &CaseOutput) -> bool {
        let published = || self.channels_consistent(output);
        match stage {
            Stage::Import => {
                (workspace.has_dicom(Modality::Ct) && workspace.has_dicom(Modality::Pet))
                    || published()
            }
            Stage::Convert => {
                (workspace.converted(Modality::Ct).is_file()
                    && workspace.converted(Modality::Pet).is_file())
                    || published()
            }
            Stage::Register => {
                (workspace.aligned_pet().is_file() && workspace.registration_matrix().is_file())
                    || published()
            }
            Stage::Stage => self.channels_consistent(output),
            Stage::Infer => {
                output.segmentation(PassId::A).is_file() && output.segmentation(PassId::B).is_file()
            }
            Stage::Fuse | Stage::Cleanup => false,
        }
    }

    /// All permanent channels exist and share one grid.
    fn channels_consistent(&self, output: &CaseOutput) -> bool {
        let mut geometries = (0..self.config.channels.len())
            .map(|index| nifti_io::read_geometry(&output.channel(index)));
        let Some(Ok(first)) = geometries.next() else {
            return false;
        };
        geometries.all(|geometry| {
            geometry.is_ok_and(|geometry| first.ensure_matches(&geometry).is_ok())
        })
    }

    async fn run_stage(
        &self,
        stage: Stage,
        workspace: &Workspace,
        output: &CaseOutput,
    ) -> Result<Option<FusionReport>> {
        match stage {
            Stage::Import => self.import(workspace)?,
            Stage::Convert => self.convert(workspace).await?,
            Stage::Register => self.register(workspace).await?,
            Stage::Stage => self.stage_channels(workspace, output)?,
            Stage::Infer => self.infer(workspace, output).await?,
            Stage::Fuse => return self.fuse(output).await.map(Some),
            Stage::Cleanup => {}
        }
        Ok(None)
    }

    fn import(&self, workspace: &Workspace) -> Result<()> {
        for (modality, source) in [(Modality::Ct, &self.ct_dicom), (Modality::Pet, &self.pet_dicom)] {
            let copied = workspace.import_dicom(source, modality)?;
            if copied == 0 {
                return Err(Error::io(
                    source,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "no DICOM files found"),
                ));
            }
            info!(%modality, files = copied, "Imported DICOM series");
        }
        Ok(())
    }

    async fn convert(&self, workspace: &Workspace) -> Result<()> {
        for modality in [Modality::Ct, Modality::Pet] {
            let dest = workspace.converted(modality);
            let partial = partial_path(&dest)?;
            remove_if_exists(&partial)?;

            self.converter
                .convert(&workspace.dicom_dir(modality), modality, &partial)
                .await
                .map_err(|source| Error::Conversion {
                    modality: modality.to_string(),
                    source,
                })?;
            fs::rename(&partial, &dest).map_err(|e| Error::io(&dest, e))?;
            info!(%modality, converter = self.converter.name(), "Converted series");
        }
        Ok(())
    }

    async fn register(&self, workspace: &Workspace) -> Result<()> {
        let aligned = workspace.aligned_pet();
        let matrix = workspace.registration_matrix();
        let partial_aligned = partial_path(&aligned)?;
        let partial_matrix = partial_path(&matrix)?;
        for path in [&partial_aligned, &partial_matrix, &aligned, &matrix] {
            remove_if_exists(path)?;
        }

        self.registrar
            .register(
                &workspace.converted(Modality::Pet),
                &workspace.converted(Modality::Ct),
                &partial_aligned,
                &partial_matrix,
            )
            .await
            .map_err(Error::Registration)?;

        fs::rename(&partial_matrix, &matrix).map_err(|e| Error::io(&matrix, e))?;
        fs::rename(&partial_aligned, &aligned).map_err(|e| Error::io(&aligned, e))?;
        info!(registrar = self.registrar.name(), "Registered PET onto CT");
        Ok(())
    }

    /// Publishes CT and aligned PET as the case's channel files.
    fn stage_channels(&self, workspace: &Workspace, output: &CaseOutput) -> Result<()> {
        let sources = self
            .config
            .channels
            .iter()
            .map(|name| channel_source(workspace, name))
            .collect::<Result<Vec<_>>>()?;

        let reference = nifti_io::read_geometry(&sources[0])?;
        for source in &sources[1..] {
            reference
                .ensure_matches(&nifti_io::read_geometry(source)?)
                .map_err(|reason| {
                    Error::GeometryMismatch(format!(
                        "{} vs {}: {reason}",
                        sources[0].display(),
                        source.display()
                    ))
                })?;
        }

        for (index, source) in sources.iter().enumerate() {
            promote(source, &output.channel(index))?;
        }
        info!(case_id = %self.case_id, channels = ?self.config.channels, "Staged case channels");
        Ok(())
    }

    async fn infer(&self, workspace: &Workspace, output: &CaseOutput) -> Result<()> {
        let stager = Stager::new(self.config.channels.clone(), self.config.copy_mode);
        let request = |pass: PassId| -> Result<PassRequest> {
            let spec = self.config.pass(pass);
            let view = stager.stage(output.dir(), &self.case_id, &spec.channels, &workspace.view_dir(pass))?;
            Ok(PassRequest {
                case_id: self.case_id.clone(),
                pass,
                spec: spec.clone(),
                input_dir: view.dir,
                output_dir: workspace.pass_output_dir(pass),
                extension: self.config.extension.clone(),
            })
        };
        let pass_a = request(PassId::A)?;
        let pass_b = request(PassId::B)?;

        let coordinator = DualPassCoordinator::new(self.engine.as_ref(), self.config.concurrent_passes);
        let results = coordinator.run(&self.case_id, &pass_a, &pass_b).await?;
        for result in &results {
            promote(&result.path, &output.segmentation(result.pass))?;
        }
        Ok(())
    }

    async fn fuse(&self, output: &CaseOutput) -> Result<FusionReport> {
        let base = output.segmentation(PassId::A);
        let overlay = output.segmentation(PassId::B);
        let dest = output.final_segmentation();
        let options = self.config.fusion_options();

        let joined = {
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || fusion::fuse_files(&base, &overlay, &dest, &options))
                .await
        };
        joined.map_err(|e| Error::io(&dest, std::io::Error::other(e)))?
    }
}

/// Where the permanent channel `name` comes from inside the workspace.
fn channel_source(workspace: &Workspace, name: &str) -> Result<PathBuf> {
    if name.eq_ignore_ascii_case("CT") {
        Ok(workspace.converted(Modality::Ct))
    } else if name.eq_ignore_ascii_case("PET") {
        Ok(workspace.aligned_pet())
    } else {
        Err(Error::Config(format!("no pipeline source for channel {name}")))
    }
}

/// `dir/.partial-{name}`; external tools write here before the rename.
fn partial_path(dest: &Path) -> Result<PathBuf> {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Config(format!("{} has no file name", dest.display())))?;
    Ok(dest.with_file_name(format!(".partial-{name}")))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            warn!(path = %path.display(), "Removed leftover file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_path_keeps_directory_and_extension() {
        let partial = partial_path(Path::new("/w/converted/ct.nii.gz")).unwrap();
        assert_eq!(partial, Path::new("/w/converted/.partial-ct.nii.gz"));
        assert_eq!(nifti_io::extension_of(&partial), Some("nii.gz"));
    }

    #[test]
    fn channel_sources_map_to_workspace_files() {
        let scratch = tempfile::tempdir().unwrap();
        let case = CaseId::new("c1").unwrap();
        let workspace = Workspace::acquire(scratch.path(), &case, "nii").unwrap();

        assert_eq!(
            channel_source(&workspace, "CT").unwrap(),
            workspace.converted(Modality::Ct)
        );
        assert_eq!(channel_source(&workspace, "pet").unwrap(), workspace.aligned_pet());
        assert!(matches!(channel_source(&workspace, "MR"), Err(Error::Config(_))));
        workspace.complete(false).unwrap();
    }
}
