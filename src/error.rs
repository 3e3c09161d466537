//! Error taxonomy shared by every pipeline stage

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::enums::{PassId, Stage};
use crate::external::ToolError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A channel the consumer requires is not present in the case directory
    #[error("case {case_id}: channel {channel} (index {index:04}) missing from {}", .dir.display())]
    MissingChannel {
        case_id: String,
        channel: String,
        index: usize,
        dir: PathBuf,
    },

    #[error("geometry mismatch: {0}")]
    GeometryMismatch(String),

    #[error("invalid tumor label {label}: {reason}")]
    InvalidLabel { label: u32, reason: &'static str },

    #[error("case {case_id}: inference failed ({failures})")]
    Inference {
        case_id: String,
        failures: InferenceFailures,
    },

    #[error("{modality} conversion failed: {source}")]
    Conversion {
        modality: String,
        #[source]
        source: ToolError,
    },

    #[error("registration failed: {0}")]
    Registration(#[source] ToolError),

    #[error("case {case_id}: stage '{stage}' failed: {source}")]
    Stage {
        case_id: String,
        stage: Stage,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid case id '{0}'")]
    InvalidCaseId(String),

    #[error("invalid volume {}: {reason}", .path.display())]
    Volume { path: PathBuf, reason: String },

    #[error("NIfTI error on {}: {source}", .path.display())]
    Nifti {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for scripting callers; one code per failure category.
    ///
    /// Code 2 is shared with command-line usage errors reported by clap:
    /// both mean the invocation itself is wrong.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Stage { source, .. } => source.exit_code(),
            Error::Config(_) | Error::InvalidCaseId(_) => 2,
            Error::MissingChannel { .. } => 3,
            Error::GeometryMismatch(_) => 4,
            Error::InvalidLabel { .. } => 5,
            Error::Inference { .. } => 6,
            Error::Conversion { .. } => 7,
            Error::Registration(_) => 8,
            Error::Volume { .. } | Error::Nifti { .. } | Error::Io { .. } => 1,
        }
    }

    /// Innermost error, looking through stage wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// A single failed inference pass.
#[derive(Debug)]
pub struct InferenceFailure {
    pub pass: PassId,
    pub source: ToolError,
}

/// Every failed pass of one coordinator run; never empty.
#[derive(Debug)]
pub struct InferenceFailures(pub Vec<InferenceFailure>);

impl InferenceFailures {
    pub fn passes(&self) -> Vec<PassId> {
        self.0.iter().map(|failure| failure.pass).collect()
    }
}

impl fmt::Display for InferenceFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.pass, failure.source)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_category() {
        let missing = Error::MissingChannel {
            case_id: "c1".into(),
            channel: "CT".into(),
            index: 0,
            dir: PathBuf::from("/tmp"),
        };
        let geometry = Error::GeometryMismatch("dims".into());
        let label = Error::InvalidLabel {
            label: 0,
            reason: "reserved",
        };
        let codes = [missing.exit_code(), geometry.exit_code(), label.exit_code()];
        assert_eq!(codes, [3, 4, 5]);
    }

    #[test]
    fn stage_wrapper_keeps_inner_exit_code() {
        let err = Error::Stage {
            case_id: "c1".into(),
            stage: Stage::Fuse,
            source: Box::new(Error::GeometryMismatch("dims".into())),
        };
        assert_eq!(err.exit_code(), 4);
        assert!(matches!(err.root(), Error::GeometryMismatch(_)));
        let message = err.to_string();
        assert!(message.contains("c1"));
        assert!(message.contains("fuse"));
    }

    #[test]
    fn inference_failures_list_every_pass() {
        let failures = InferenceFailures(vec![
            InferenceFailure {
                pass: PassId::A,
                source: ToolError::TimedOut {
                    program: "nnUNet_predict".into(),
                    secs: 5,
                },
            },
            InferenceFailure {
                pass: PassId::B,
                source: ToolError::MissingOutput(PathBuf::from("/out/c1.nii.gz")),
            },
        ]);
        let text = failures.to_string();
        assert!(text.contains("pass A"));
        assert!(text.contains("pass B"));
        assert_eq!(failures.passes(), vec![PassId::A, PassId::B]);
    }
}
