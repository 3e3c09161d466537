use serde::{Deserialize, Serialize};
use std::fmt;

/// Slice ordering used by the built-in DICOM series loader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}

/// Input series of a case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Modality {
    Ct,
    Pet,
}

impl Modality {
    /// Directory/file stem used inside the workspace.
    pub fn stem(self) -> &'static str {
        match self {
            Modality::Ct => "ct",
            Modality::Pet => "pet",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Ct => f.write_str("CT"),
            Modality::Pet => f.write_str("PET"),
        }
    }
}

/// Identifies which inference pass produced a segmentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassId {
    /// Multi-channel coarse model (organs + tumor).
    A,
    /// Single-channel tumor specialist, fold ensemble.
    B,
}

impl PassId {
    pub fn dir_name(self) -> &'static str {
        match self {
            PassId::A => "pass_a",
            PassId::B => "pass_b",
        }
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassId::A => f.write_str("pass A"),
            PassId::B => f.write_str("pass B"),
        }
    }
}

/// How staged files are materialized in a view directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CopyMode {
    #[default]
    Symlink,
    Hardlink,
    Copy,
}

/// Which override voxels claim the tumor label during fusion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideMatch {
    /// The override voxel must equal the tumor label.
    #[default]
    Label,
    /// Any non-zero override voxel is tumor.
    AnyNonZero,
}

/// Pipeline stages in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Import,
    Convert,
    Register,
    Stage,
    Infer,
    Fuse,
    Cleanup,
}

impl Stage {
    pub const ORDER: [Stage; 7] = [
        Stage::Import,
        Stage::Convert,
        Stage::Register,
        Stage::Stage,
        Stage::Infer,
        Stage::Fuse,
        Stage::Cleanup,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Import => "import",
            Stage::Convert => "convert",
            Stage::Register => "register",
            Stage::Stage => "stage",
            Stage::Infer => "infer",
            Stage::Fuse => "fuse",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}
