//! Dual-pass inference coordination
//!
//! Pass A and pass B see the same case through different isolated views and
//! write to different directories. They share no mutable state, so one
//! failing never stops the other; every failure is reported together.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::case::CaseId;
use crate::enums::PassId;
use crate::error::{Error, InferenceFailure, InferenceFailures, Result};
use crate::external::{CommandTemplate, TemplateValue, ToolError};

/// Model selection of one pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassSpec {
    /// Model/task identifier, e.g. `Task006`
    pub task: String,
    /// Network configuration, e.g. `3d_fullres`
    pub model: String,
    pub folds: Vec<String>,
    pub checkpoint: String,
    /// Channels the model was trained on, in its channel-index order
    pub channels: Vec<String>,
    /// Appended verbatim after the rendered template
    pub extra_args: Vec<String>,
}

impl Default for PassSpec {
    fn default() -> Self {
        Self {
            task: String::new(),
            model: "3d_fullres".to_string(),
            folds: vec!["0".to_string()],
            checkpoint: "model_final_checkpoint".to_string(),
            channels: vec!["CT".to_string()],
            extra_args: Vec::new(),
        }
    }
}

impl PassSpec {
    /// Coarse multi-organ + tumor model on CT and PET, single fold.
    pub fn default_pass_a() -> Self {
        Self {
            task: "Task006".to_string(),
            channels: vec!["CT".to_string(), "PET".to_string()],
            ..Self::default()
        }
    }

    /// CT-only tumor specialist, five-fold ensemble.
    pub fn default_pass_b() -> Self {
        Self {
            task: "Task212".to_string(),
            folds: (0..5).map(|f| f.to_string()).collect(),
            ..Self::default()
        }
    }
}

/// Everything an engine needs to run one pass over one case.
#[derive(Clone, Debug)]
pub struct PassRequest {
    pub case_id: CaseId,
    pub pass: PassId,
    pub spec: PassSpec,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub extension: String,
}

impl PassRequest {
    /// `{output_dir}/{caseID}.{ext}`
    pub fn expected_output(&self) -> PathBuf {
        self.output_dir
            .join(self.case_id.segmentation_file(&self.extension))
    }
}

/// Segmentation produced by one pass.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentationResult {
    pub case_id: CaseId,
    pub pass: PassId,
    pub path: PathBuf,
}

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Runs the model of `request` over its input view, writing into its output directory.
    async fn predict(&self, request: &PassRequest) -> Result<(), ToolError>;
}

/// Engine backed by a command-line predictor.
///
/// Placeholders: `{input}`, `{output}`, `{task}`, `{model}`, `{folds}`
/// (expands to one argument per fold), `{checkpoint}`, `{case_id}`.
pub struct CommandInferenceEngine {
    template: CommandTemplate,
    timeout: Option<Duration>,
}

impl CommandInferenceEngine {
    pub fn new(template: CommandTemplate, timeout: Option<Duration>) -> Self {
        Self { template, timeout }
    }

    /// nnU-Net v1 predictor.
    pub fn nnunet_predict() -> CommandTemplate {
        CommandTemplate::new(
            "nnUNet_predict",
            &[
                "-i", "{input}", "-o", "{output}", "-t", "{task}", "-m", "{model}", "-f",
                "{folds}", "-chk", "{checkpoint}",
            ],
        )
    }
}

#[async_trait]
impl InferenceEngine for CommandInferenceEngine {
    async fn predict(&self, request: &PassRequest) -> Result<(), ToolError> {
        let spec = &request.spec;
        let values: HashMap<&str, TemplateValue> = HashMap::from([
            ("input", request.input_dir.as_path().into()),
            ("output", request.output_dir.as_path().into()),
            ("task", spec.task.as_str().into()),
            ("model", spec.model.as_str().into()),
            ("folds", spec.folds.clone().into()),
            ("checkpoint", spec.checkpoint.as_str().into()),
            ("case_id", request.case_id.as_str().into()),
        ]);
        let mut command = self.template.command(&values, self.timeout);
        command.args.extend(spec.extra_args.iter().cloned());
        command.run().await?;
        Ok(())
    }
}

pub struct DualPassCoordinator<'a> {
    engine: &'a dyn InferenceEngine,
    concurrent: bool,
}

impl<'a> DualPassCoordinator<'a> {
    pub fn new(engine: &'a dyn InferenceEngine, concurrent: bool) -> Self {
        Self { engine, concurrent }
    }

    /// Runs one pass from a clean output directory and checks its output.
    pub async fn run_pass(&self, request: &PassRequest) -> Result<SegmentationResult, ToolError> {
        reset_dir(&request.output_dir)?;
        info!(
            case_id = %request.case_id,
            pass = %request.pass,
            task = %request.spec.task,
            folds = ?request.spec.folds,
            "Starting inference pass"
        );

        self.engine.predict(request).await?;

        let path = request.expected_output();
        if !path.is_file() {
            return Err(ToolError::MissingOutput(path));
        }
        info!(case_id = %request.case_id, pass = %request.pass, "Inference pass finished");
        Ok(SegmentationResult {
            case_id: request.case_id.clone(),
            pass: request.pass,
            path,
        })
    }

    /// Runs both passes; succeeds only if both do.
    pub async fn run(
        &self,
        case_id: &CaseId,
        pass_a: &PassRequest,
        pass_b: &PassRequest,
    ) -> Result<[SegmentationResult; 2]> {
        let (a, b) = if self.concurrent {
            tokio::join!(self.run_pass(pass_a), self.run_pass(pass_b))
        } else {
            let a = self.run_pass(pass_a).await;
            let b = self.run_pass(pass_b).await;
            (a, b)
        };

        match (a, b) {
            (Ok(a), Ok(b)) => Ok([a, b]),
            (a, b) => {
                let failures: Vec<_> = [(PassId::A, a.err()), (PassId::B, b.err())]
                    .into_iter()
                    .filter_map(|(pass, err)| err.map(|source| InferenceFailure { pass, source }))
                    .collect();
                for failure in &failures {
                    error!(case_id = %case_id, pass = %failure.pass, error = %failure.source, "Inference pass failed");
                }
                Err(Error::Inference {
                    case_id: case_id.to_string(),
                    failures: InferenceFailures(failures),
                })
            }
        }
    }
}

fn reset_dir(dir: &Path) -> Result<(), ToolError> {
    let io = |e: std::io::Error| ToolError::Other(format!("{}: {e}", dir.display()));
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(io)?;
    }
    fs::create_dir_all(dir).map_err(io)
}
