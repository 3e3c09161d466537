//! # segfusion
//!
//! Single-case PET/CT segmentation pipeline that fuses the results of two
//! inference passes into one label map.
//!
//! A case runs through these stages:
//!  - Import: the raw CT and PET DICOM series are copied into a scratch
//!    workspace
//!  - Convert: each series becomes a NIfTI volume (`dcm2niix` or the
//!    built-in series loader)
//!  - Register: PET is aligned onto the CT grid by an external affine
//!    registration tool
//!  - Stage: CT and aligned PET are published as the case's channel files
//!    `{caseID}_0000`, `{caseID}_0001`
//!  - Infer: pass A (coarse multi-organ model, all channels) and pass B (CT
//!    only tumor specialist, fold ensemble) each run over an isolated view
//!    that contains nothing but the channels the model was trained on
//!  - Fuse: the tumor label of pass A is replaced by the mask of pass B
//!  - Cleanup: the scratch workspace is removed
//!
//! Stages whose outputs already exist are skipped, so an interrupted case
//! resumes where it stopped. A failed run leaves its workspace on disk and
//! never leaves a partial final segmentation behind.
//!
//! Inference and registration are external programs described by
//! [`CommandTemplate`]s; both sit behind traits so alternative backends (or
//! test fakes) can be plugged in.
//!
//! # Examples
//!
//! ## Running the whole pipeline
//!
//! ```no_run
//! # use segfusion::{CaseId, Config, Pipeline};
//! # use std::path::Path;
//! # async fn run() -> segfusion::error::Result<()> {
//! let config = Config::load(None)?;
//! let case_id = CaseId::new("s0001")?;
//! let report = Pipeline::new(config, case_id, Path::new("dicom/ct"), Path::new("dicom/pet"))
//!     .run()
//!     .await?;
//! println!("final mask: {}", report.final_path.display());
//! # Ok(())
//! # }
//! ```
//!
//! ## Fusing two existing segmentations
//!
//! ```no_run
//! # use segfusion::fusion::{fuse_files, FusionOptions};
//! # use std::path::Path;
//! let report = fuse_files(
//!     Path::new("pass_a/s0001.nii.gz"),
//!     Path::new("pass_b/s0001.nii.gz"),
//!     Path::new("s0001_seg_final.nii.gz"),
//!     &FusionOptions::new(6),
//! )
//! .expect("should have fused both segmentations");
//! println!("{:?}", report.branch);
//! ```

pub mod case;
pub mod config;
pub mod enums;
pub mod error;
pub mod external;
pub mod fusion;
pub mod inference;
pub mod nifti_io;
pub mod pipeline;
pub mod stager;
pub mod tools;
pub mod volume;
pub mod volume_loader;
pub mod workspace;

pub use case::CaseId;
pub use config::Config;
pub use error::{Error, Result};
pub use external::CommandTemplate;
pub use pipeline::{Pipeline, PipelineReport};
