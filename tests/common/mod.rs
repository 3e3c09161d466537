//! Shared fixtures for the integration tests: volume builders and fake
//! converter, registrar and inference engine.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ndarray::{Array3, s};
use segfusion::{
    Config,
    enums::{Modality, PassId},
    external::ToolError,
    inference::{InferenceEngine, PassRequest},
    nifti_io,
    tools::{DicomConverter, Registrar},
    volume::{Geometry, ImageVolume, LabelVolume},
};

pub const ORGAN: u16 = 2;
pub const TUMOR: u16 = 6;
pub const SIZE: usize = 10;

pub fn ct_geometry() -> Geometry {
    Geometry::new([SIZE; 3], [1.0, 1.0, 2.0]).with_origin([-5.0, -5.0, 100.0])
}

/// Label volume filled with `background` and `value` inside the cube `lo..hi`.
pub fn cube(geometry: &Geometry, background: u16, value: u16, lo: usize, hi: usize) -> LabelVolume {
    let [x, y, z] = geometry.dims;
    let mut data = Array3::from_elem((x, y, z), background);
    data.slice_mut(s![lo..hi, lo..hi, lo..hi]).fill(value);
    LabelVolume::new(data, geometry.clone()).unwrap()
}

/// Base segmentation: organ everywhere, tumor in `1..3`.
pub fn base_segmentation(geometry: &Geometry) -> LabelVolume {
    cube(geometry, ORGAN, TUMOR, 1, 3)
}

/// Override segmentation: tumor in `6..8`.
pub fn override_segmentation(geometry: &Geometry) -> LabelVolume {
    cube(geometry, 0, TUMOR, 6, 8)
}

pub fn write_labels(path: &Path, volume: &LabelVolume) {
    nifti_io::write_labels(path, volume).unwrap();
}

pub fn in_cube(index: (usize, usize, usize), lo: usize, hi: usize) -> bool {
    let r = lo..hi;
    r.contains(&index.0) && r.contains(&index.1) && r.contains(&index.2)
}

/// Fake DICOM series directories with one file each.
pub fn dicom_inputs(root: &Path) -> (PathBuf, PathBuf) {
    let ct = root.join("dicom_ct");
    let pet = root.join("dicom_pet");
    for dir in [&ct, &pet] {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("IM0001.dcm"), "DICM").unwrap();
    }
    (ct, pet)
}

pub fn test_config(root: &Path) -> Config {
    Config {
        output_root: root.join("out"),
        scratch_root: root.join("scratch"),
        ..Config::default()
    }
}

fn tool_failure(program: &str) -> ToolError {
    ToolError::Failed {
        program: program.to_string(),
        code: Some(1),
        stderr: "simulated failure".to_string(),
    }
}

/// Writes a CT volume on [`ct_geometry`] and a coarser PET volume.
#[derive(Default)]
pub struct FakeConverter {
    pub fail: Option<Modality>,
}

#[async_trait]
impl DicomConverter for FakeConverter {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn convert(&self, _dicom_dir: &Path, modality: Modality, dest: &Path) -> Result<(), ToolError> {
        if self.fail == Some(modality) {
            return Err(tool_failure("fake-dcm2niix"));
        }
        let geometry = match modality {
            Modality::Ct => ct_geometry(),
            Modality::Pet => Geometry::new([SIZE / 2; 3], [2.0, 2.0, 4.0]),
        };
        let [x, y, z] = geometry.dims;
        let volume = ImageVolume::new(Array3::from_elem((x, y, z), 1.0), geometry).unwrap();
        nifti_io::write_image(dest, &volume).map_err(|e| ToolError::Other(e.to_string()))
    }
}

/// Resamples by writing a blank image on the fixed grid.
pub struct FakeRegistrar;

#[async_trait]
impl Registrar for FakeRegistrar {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn register(&self, _moving: &Path, fixed: &Path, aligned: &Path, matrix: &Path) -> Result<(), ToolError> {
        let geometry = nifti_io::read_geometry(fixed).map_err(|e| ToolError::Other(e.to_string()))?;
        let [x, y, z] = geometry.dims;
        let volume = ImageVolume::new(Array3::zeros((x, y, z)), geometry).unwrap();
        nifti_io::write_image(aligned, &volume).map_err(|e| ToolError::Other(e.to_string()))?;
        fs::write(matrix, "1 0 0 0\n0 1 0 0\n0 0 1 0\n0 0 0 1\n").map_err(|e| ToolError::Other(e.to_string()))
    }
}

/// One recorded engine invocation.
#[derive(Clone, Debug)]
pub struct EngineCall {
    pub pass: PassId,
    /// File names present in the input view
    pub inputs: Vec<String>,
}

/// Pass A writes [`base_segmentation`], pass B [`override_segmentation`],
/// both on the grid of the first staged channel.
#[derive(Clone, Default)]
pub struct FakeEngine {
    pub fail: Vec<PassId>,
    pub empty_override: bool,
    pub calls: Arc<Mutex<Vec<EngineCall>>>,
}

impl FakeEngine {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceEngine for FakeEngine {
    async fn predict(&self, request: &PassRequest) -> Result<(), ToolError> {
        let mut inputs: Vec<String> = fs::read_dir(&request.input_dir)
            .map_err(|e| ToolError::Other(e.to_string()))?
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        inputs.sort();
        self.calls.lock().unwrap().push(EngineCall {
            pass: request.pass,
            inputs: inputs.clone(),
        });

        if self.fail.contains(&request.pass) {
            return Err(tool_failure("fake-nnunet"));
        }
        let geometry = nifti_io::read_geometry(&request.input_dir.join(&inputs[0]))
            .map_err(|e| ToolError::Other(e.to_string()))?;
        let segmentation = match (request.pass, self.empty_override) {
            (PassId::A, _) => base_segmentation(&geometry),
            (PassId::B, false) => override_segmentation(&geometry),
            (PassId::B, true) => LabelVolume::empty_like(&base_segmentation(&geometry)),
        };
        nifti_io::write_labels(&request.expected_output(), &segmentation)
            .map_err(|e| ToolError::Other(e.to_string()))
    }
}
