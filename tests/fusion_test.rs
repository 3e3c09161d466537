mod common;

use std::fs;

use common::*;
use segfusion::{
    Error,
    enums::OverrideMatch,
    fusion::{FusionBranch, FusionOptions, fuse_files},
    nifti_io,
    volume::{Geometry, LabelVolume},
};

struct Inputs {
    dir: tempfile::TempDir,
}

impl Inputs {
    fn new(base: &LabelVolume, overlay: &LabelVolume) -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_labels(&dir.path().join("pass_a.nii.gz"), base);
        write_labels(&dir.path().join("pass_b.nii.gz"), overlay);
        Self { dir }
    }

    fn fuse(&self, out: &str, options: &FusionOptions) -> segfusion::Result<segfusion::fusion::FusionReport> {
        fuse_files(
            &self.dir.path().join("pass_a.nii.gz"),
            &self.dir.path().join("pass_b.nii.gz"),
            &self.dir.path().join(out),
            options,
        )
    }

    fn read(&self, out: &str) -> LabelVolume {
        nifti_io::read_labels(&self.dir.path().join(out)).unwrap()
    }
}

#[test]
fn override_tumor_replaces_base_tumor() {
    let geometry = ct_geometry();
    let inputs = Inputs::new(&base_segmentation(&geometry), &override_segmentation(&geometry));

    let report = inputs.fuse("final.nii.gz", &FusionOptions::new(TUMOR.into())).unwrap();

    assert_eq!(report.branch, FusionBranch::Override);
    let fused = inputs.read("final.nii.gz");
    fused.geometry().ensure_matches(&geometry).unwrap();
    for (index, &label) in fused.data().indexed_iter() {
        let expected = if in_cube(index, 6, 8) {
            TUMOR
        } else if in_cube(index, 1, 3) {
            0
        } else {
            ORGAN
        };
        assert_eq!(label, expected, "voxel {index:?}");
    }
}

#[test]
fn empty_override_branches_on_fallback_flag() {
    let geometry = ct_geometry();
    let base = base_segmentation(&geometry);
    let inputs = Inputs::new(&base, &LabelVolume::empty_like(&base));

    inputs.fuse("erased.nii.gz", &FusionOptions::new(TUMOR.into())).unwrap();
    let kept_options = FusionOptions::new(TUMOR.into()).keep_base_if_override_empty(true);
    inputs.fuse("kept.nii.gz", &kept_options).unwrap();

    let erased = inputs.read("erased.nii.gz");
    assert_eq!(erased.count_label(TUMOR), 0);
    assert_eq!(erased.count_label(0), 8);
    assert_eq!(inputs.read("kept.nii.gz").data(), base.data());
}

#[test]
fn fusing_twice_produces_identical_bytes() {
    let geometry = ct_geometry();
    let inputs = Inputs::new(&base_segmentation(&geometry), &override_segmentation(&geometry));
    let options = FusionOptions::new(TUMOR.into());

    inputs.fuse("first.nii.gz", &options).unwrap();
    inputs.fuse("second.nii.gz", &options).unwrap();
    let before = fs::read(inputs.dir.path().join("first.nii.gz")).unwrap();
    inputs.fuse("first.nii.gz", &options).unwrap();

    let again = fs::read(inputs.dir.path().join("first.nii.gz")).unwrap();
    assert_eq!(before, again);
    assert_eq!(before, fs::read(inputs.dir.path().join("second.nii.gz")).unwrap());
}

#[test]
fn geometry_mismatch_writes_nothing() {
    let geometry = ct_geometry();
    let shifted = geometry.clone().with_origin([-5.0, -5.0, 102.0]);
    let inputs = Inputs::new(&base_segmentation(&geometry), &override_segmentation(&shifted));

    let err = inputs.fuse("final.nii.gz", &FusionOptions::new(TUMOR.into())).unwrap_err();

    assert!(matches!(err, Error::GeometryMismatch(_)));
    assert_eq!(err.exit_code(), 4);
    assert!(!inputs.dir.path().join("final.nii.gz").exists());
}

#[test]
fn different_dimensions_are_rejected() {
    let small = Geometry::new([8, 8, 8], [1.0, 1.0, 2.0]);
    let inputs = Inputs::new(&base_segmentation(&ct_geometry()), &cube(&small, 0, TUMOR, 1, 2));

    let err = inputs.fuse("final.nii.gz", &FusionOptions::new(TUMOR.into())).unwrap_err();

    assert!(matches!(err, Error::GeometryMismatch(_)));
}

#[test]
fn zero_tumor_label_is_rejected_before_reading_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("final.nii.gz");

    let err = fuse_files(
        &dir.path().join("missing_a.nii.gz"),
        &dir.path().join("missing_b.nii.gz"),
        &out,
        &FusionOptions::new(0),
    )
    .unwrap_err();

    assert!(matches!(err, Error::InvalidLabel { label: 0, .. }));
    assert_eq!(err.exit_code(), 5);
    assert!(!out.exists());
}

#[test]
fn binary_override_is_accepted_in_any_nonzero_mode() {
    let geometry = ct_geometry();
    let binary = cube(&geometry, 0, 1, 6, 8);
    let inputs = Inputs::new(&base_segmentation(&geometry), &binary);

    let strict = inputs.fuse("strict.nii.gz", &FusionOptions::new(TUMOR.into())).unwrap();
    let options = FusionOptions::new(TUMOR.into()).override_match(OverrideMatch::AnyNonZero);
    let lenient = inputs.fuse("lenient.nii.gz", &options).unwrap();

    assert_eq!(strict.branch, FusionBranch::EmptyOverrideErased);
    assert_eq!(lenient.branch, FusionBranch::Override);
    assert_eq!(inputs.read("lenient.nii.gz").count_label(TUMOR), 8);
}
