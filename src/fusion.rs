//! Tumor label fusion
//!
//! Merges a multi-class "base" segmentation with a tumor-only "override"
//! segmentation. The override owns the tumor label: wherever it claims a
//! voxel the output is tumor, and the base's own tumor voxels are cleared to
//! background. Every other base label passes through untouched.
//!
//! When the override claims nothing anywhere, a single global policy decides
//! between erasing the base tumor (default) and keeping it as-is.

use std::path::Path;

use ndarray::{Array3, Zip};
use rayon::prelude::*;
use tracing::info;

use crate::enums::OverrideMatch;
use crate::error::{Error, Result};
use crate::nifti_io;
use crate::volume::LabelVolume;

/// Parameters of one fusion call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FusionOptions {
    /// Label value of tumor in both segmentations; must be non-zero
    pub tumor_label: u32,
    /// Keep the base tumor when the override has no tumor voxels at all
    pub keep_base_if_override_empty: bool,
    pub override_match: OverrideMatch,
}

impl FusionOptions {
    pub fn new(tumor_label: u32) -> Self {
        Self {
            tumor_label,
            keep_base_if_override_empty: false,
            override_match: OverrideMatch::Label,
        }
    }

    pub fn keep_base_if_override_empty(mut self, keep: bool) -> Self {
        self.keep_base_if_override_empty = keep;
        self
    }

    pub fn override_match(mut self, mode: OverrideMatch) -> Self {
        self.override_match = mode;
        self
    }

    /// Tumor label as stored in a [`LabelVolume`].
    pub fn label(&self) -> Result<u16> {
        if self.tumor_label == 0 {
            return Err(Error::InvalidLabel {
                label: 0,
                reason: "0 is reserved for background",
            });
        }
        u16::try_from(self.tumor_label).map_err(|_| Error::InvalidLabel {
            label: self.tumor_label,
            reason: "does not fit 16-bit label storage",
        })
    }
}

/// Which of the mutually exclusive fusion rules produced the output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FusionBranch {
    /// The override claimed at least one voxel.
    Override,
    /// The override was empty; base tumor erased.
    EmptyOverrideErased,
    /// The override was empty; base kept unchanged.
    EmptyOverrideKeptBase,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FusionReport {
    pub branch: FusionBranch,
    /// Voxels claimed by the override
    pub override_voxels: usize,
    /// Tumor voxels in the base before fusion
    pub base_tumor_voxels: usize,
    /// Tumor voxels in the output
    pub fused_tumor_voxels: usize,
}

/// Fuses `base` and `overlay` (the override segmentation).
///
/// Both volumes must share geometry; the output carries it. The transform is
/// pure and deterministic.
pub fn fuse(
    base: &LabelVolume,
    overlay: &LabelVolume,
    options: &FusionOptions,
) -> Result<(LabelVolume, FusionReport)> {
    let tumor = options.label()?;
    base.geometry()
        .ensure_matches(overlay.geometry())
        .map_err(Error::GeometryMismatch)?;

    let claims = |v: u16| match options.override_match {
        OverrideMatch::Label => v == tumor,
        OverrideMatch::AnyNonZero => v != 0,
    };

    let override_voxels = overlay.data().par_iter().filter(|&&v| claims(v)).count();
    let base_tumor_voxels = base.count_label(tumor);

    let mut fused = Array3::<u16>::zeros(base.dim());
    let branch = if override_voxels > 0 {
        Zip::from(&mut fused)
            .and(base.data())
            .and(overlay.data())
            .par_for_each(|out, &a, &b| {
                *out = if claims(b) {
                    tumor
                } else if a == tumor {
                    0
                } else {
                    a
                };
            });
        FusionBranch::Override
    } else if options.keep_base_if_override_empty {
        fused.assign(base.data());
        FusionBranch::EmptyOverrideKeptBase
    } else {
        Zip::from(&mut fused)
            .and(base.data())
            .par_for_each(|out, &a| *out = if a == tumor { 0 } else { a });
        FusionBranch::EmptyOverrideErased
    };

    let fused = LabelVolume::new(fused, base.geometry().clone())
        .ok_or_else(|| Error::GeometryMismatch("fused shape disagrees with base".to_string()))?;
    let report = FusionReport {
        branch,
        override_voxels,
        base_tumor_voxels,
        fused_tumor_voxels: fused.count_label(tumor),
    };
    Ok((fused, report))
}

/// Reads both segmentations, fuses them and atomically writes `out`.
///
/// Nothing is written unless every precondition holds.
pub fn fuse_files(
    base_path: &Path,
    override_path: &Path,
    out: &Path,
    options: &FusionOptions,
) -> Result<FusionReport> {
    options.label()?;
    let base = nifti_io::read_labels(base_path)?;
    let overlay = nifti_io::read_labels(override_path)?;

    let (fused, report) = fuse(&base, &overlay, options)?;
    nifti_io::write_labels_atomic(out, &fused)?;

    match report.branch {
        FusionBranch::Override => info!(
            tumor_label = options.tumor_label,
            override_voxels = report.override_voxels,
            base_tumor_voxels = report.base_tumor_voxels,
            "Replaced tumor label using override mask"
        ),
        FusionBranch::EmptyOverrideErased => info!(
            tumor_label = options.tumor_label,
            base_tumor_voxels = report.base_tumor_voxels,
            "Override empty, removed tumor label from base"
        ),
        FusionBranch::EmptyOverrideKeptBase => info!(
            tumor_label = options.tumor_label,
            base_tumor_voxels = report.base_tumor_voxels,
            "Override empty, kept base tumor unchanged"
        ),
    }
    info!(out = %out.display(), "Wrote fused segmentation");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Geometry;
    use ndarray::s;

    const ORGAN: u16 = 2;
    const TUMOR: u16 = 1;

    fn volume(data: Array3<u16>) -> LabelVolume {
        let (x, y, z) = data.dim();
        LabelVolume::new(data, Geometry::new([x, y, z], [1.0; 3])).unwrap()
    }

    fn base() -> LabelVolume {
        let mut data = Array3::from_elem((10, 10, 10), ORGAN);
        data.slice_mut(s![1..3, 1..3, 1..3]).fill(TUMOR);
        volume(data)
    }

    fn overlay() -> LabelVolume {
        let mut data = Array3::zeros((10, 10, 10));
        data.slice_mut(s![6..8, 6..8, 6..8]).fill(TUMOR);
        volume(data)
    }

    #[test]
    fn override_replaces_tumor_and_clears_base_tumor() {
        let (fused, report) = fuse(&base(), &overlay(), &FusionOptions::new(1)).unwrap();

        for ((x, y, z), &v) in fused.data().indexed_iter() {
            let in_override = (6..8).contains(&x) && (6..8).contains(&y) && (6..8).contains(&z);
            let in_base_tumor = (1..3).contains(&x) && (1..3).contains(&y) && (1..3).contains(&z);
            let expected = if in_override {
                TUMOR
            } else if in_base_tumor {
                0
            } else {
                ORGAN
            };
            assert_eq!(v, expected, "voxel ({x}, {y}, {z})");
        }
        assert_eq!(report.branch, FusionBranch::Override);
        assert_eq!(report.override_voxels, 8);
        assert_eq!(report.base_tumor_voxels, 8);
        assert_eq!(report.fused_tumor_voxels, 8);
    }

    #[test]
    fn override_dominates_whatever_base_holds() {
        let mut base_data = Array3::from_elem((4, 4, 4), 3u16);
        base_data[[0, 0, 0]] = 0;
        base_data[[1, 1, 1]] = TUMOR;
        let overlay_data = Array3::from_elem((4, 4, 4), TUMOR);

        let (fused, _) = fuse(&volume(base_data), &volume(overlay_data), &FusionOptions::new(1)).unwrap();

        assert!(fused.data().iter().all(|&v| v == TUMOR));
    }

    #[test]
    fn empty_override_erases_base_tumor_by_default() {
        let empty = volume(Array3::zeros((10, 10, 10)));
        let (fused, report) = fuse(&base(), &empty, &FusionOptions::new(1)).unwrap();

        assert_eq!(fused.count_label(TUMOR), 0);
        assert_eq!(fused.count_label(0), 8);
        assert_eq!(fused.count_label(ORGAN), 992);
        assert_eq!(report.branch, FusionBranch::EmptyOverrideErased);
    }

    #[test]
    fn empty_override_keeps_base_when_fallback_enabled() {
        let empty = volume(Array3::zeros((10, 10, 10)));
        let options = FusionOptions::new(1).keep_base_if_override_empty(true);

        let (fused, report) = fuse(&base(), &empty, &options).unwrap();

        assert_eq!(fused, base());
        assert_eq!(report.branch, FusionBranch::EmptyOverrideKeptBase);
    }

    #[test]
    fn fallback_flag_is_ignored_when_override_has_tumor() {
        let options = FusionOptions::new(1).keep_base_if_override_empty(true);
        let (with_flag, _) = fuse(&base(), &overlay(), &options).unwrap();
        let (without_flag, _) = fuse(&base(), &overlay(), &FusionOptions::new(1)).unwrap();
        assert_eq!(with_flag, without_flag);
    }

    #[test]
    fn base_without_tumor_gains_override_voxels() {
        let plain = volume(Array3::from_elem((10, 10, 10), ORGAN));
        let (fused, _) = fuse(&plain, &overlay(), &FusionOptions::new(1)).unwrap();
        assert_eq!(fused.count_label(TUMOR), 8);
        assert_eq!(fused.count_label(ORGAN), 992);
    }

    #[test]
    fn both_free_of_tumor_returns_base() {
        let plain = volume(Array3::from_elem((10, 10, 10), ORGAN));
        let empty = volume(Array3::zeros((10, 10, 10)));
        let (fused, _) = fuse(&plain, &empty, &FusionOptions::new(1)).unwrap();
        assert_eq!(fused, plain);
    }

    #[test]
    fn non_tumor_override_labels_do_not_claim_voxels() {
        let mut overlay_data = Array3::zeros((10, 10, 10));
        overlay_data[[5, 5, 5]] = 4u16;
        let options = FusionOptions::new(1).keep_base_if_override_empty(true);

        let (fused, report) = fuse(&base(), &volume(overlay_data), &options).unwrap();

        assert_eq!(report.branch, FusionBranch::EmptyOverrideKeptBase);
        assert_eq!(fused, base());
    }

    #[test]
    fn any_nonzero_mode_maps_binary_override_onto_tumor_label() {
        let mut base_data = Array3::from_elem((10, 10, 10), ORGAN);
        base_data.slice_mut(s![0..2, 0..2, 0..2]).fill(6);
        let options = FusionOptions::new(6).override_match(OverrideMatch::AnyNonZero);

        let (fused, report) = fuse(&volume(base_data), &overlay(), &options).unwrap();

        assert_eq!(report.override_voxels, 8);
        assert_eq!(fused.count_label(6), 8);
        assert_eq!(fused.data()[[6, 6, 6]], 6);
        assert_eq!(fused.data()[[0, 0, 0]], 0);
        assert_eq!(fused.count_label(TUMOR), 0);
    }

    #[test]
    fn zero_and_oversized_labels_are_rejected() {
        let zero = fuse(&base(), &overlay(), &FusionOptions::new(0)).unwrap_err();
        assert!(matches!(zero, Error::InvalidLabel { label: 0, .. }));

        let huge = fuse(&base(), &overlay(), &FusionOptions::new(70_000)).unwrap_err();
        assert!(matches!(huge, Error::InvalidLabel { label: 70_000, .. }));
    }

    #[test]
    fn mismatched_geometry_is_rejected() {
        let smaller = volume(Array3::zeros((10, 10, 9)));
        let err = fuse(&base(), &smaller, &FusionOptions::new(1)).unwrap_err();
        assert!(matches!(err, Error::GeometryMismatch(_)));

        let shifted = LabelVolume::new(
            Array3::zeros((10, 10, 10)),
            Geometry::new([10, 10, 10], [1.0; 3]).with_origin([0.0, 0.0, 2.0]),
        )
        .unwrap();
        let err = fuse(&base(), &shifted, &FusionOptions::new(1)).unwrap_err();
        assert!(matches!(err, Error::GeometryMismatch(_)));
    }
}
