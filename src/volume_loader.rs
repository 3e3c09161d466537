use crate::{
    enums::SortBy,
    volume::{Geometry, ImageVolume},
};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, s};
use rayon::prelude::*;
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// Per-slice data needed to place the slice in patient space.
struct Slice {
    order: Option<f64>,
    position: Option<[f64; 3]>,
    image: Array2<f32>,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a volume from DICOM objects of a single series
    ///
    /// Pixel values have the modality LUT applied (HU for CT). The returned
    /// geometry is in RAS world coordinates, like NIfTI.
    ///
    /// # Errors
    ///
    /// Returns error if no valid images found or dimensions are inconsistent
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        sort_by: SortBy,
    ) -> Result<ImageVolume, VolumeLoaderError> {
        let orientation = Self::get_orientation(dicom_objects);
        let normal = cross(orientation[0], orientation[1]);

        let mut slices: Vec<_> = dicom_objects
            .par_iter()
            .filter_map(|dicom_object| Self::extract_slice(dicom_object, sort_by, normal))
            .collect();

        if slices.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        Self::sort_slices(&mut slices, sort_by);
        Self::validate_dimensions(&slices)?;

        let (row_spacing, col_spacing) =
            Self::get_pixel_spacing(dicom_objects).ok_or(VolumeLoaderError::MissingSpacing)?;
        let slice_spacing = Self::get_slice_spacing(&slices)
            .or_else(|| Self::get_slice_thickness(dicom_objects))
            .ok_or(VolumeLoaderError::MissingSpacing)?;

        let data = Self::build_volume_array(&slices);
        let (x, y, z) = data.dim();

        // DICOM patient space is LPS; NIfTI expects RAS.
        let flip = [-1.0, -1.0, 1.0];
        let origin = slices[0].position.unwrap_or([0.0; 3]);
        let mut direction = [[0.0; 3]; 3];
        for r in 0..3 {
            direction[r] = [
                flip[r] * orientation[0][r],
                flip[r] * orientation[1][r],
                flip[r] * normal[r],
            ];
        }
        let geometry = Geometry::new([x, y, z], [col_spacing, row_spacing, slice_spacing])
            .with_origin([flip[0] * origin[0], flip[1] * origin[1], origin[2]])
            .with_direction(direction);

        debug!(dims = ?geometry.dims, spacing = ?geometry.spacing, "Loaded DICOM series");
        ImageVolume::new(data, geometry).ok_or(VolumeLoaderError::InconsistentDimensions)
    }

    /// Load a volume from file paths
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path>],
        sort_by: SortBy,
    ) -> Result<ImageVolume, VolumeLoaderError> {
        let objects: Result<Vec<_>, _> =
            paths.iter().map(|path| open_file(path.as_ref())).collect();

        Self::load_from_dicom_objects(&objects?, sort_by)
    }

    /// Load a volume from a directory tree containing .dcm files
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<ImageVolume, VolumeLoaderError> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(path.as_ref()) {
            let entry = entry.map_err(std::io::Error::from)?;
            let is_dcm = entry
                .path()
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"));
            if entry.file_type().is_file() && is_dcm {
                paths.push(entry.into_path());
            }
        }

        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        // Deterministic order for SortBy::None
        paths.sort();

        Self::load_from_file_paths(&paths, sort_by)
    }

    fn extract_slice(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: SortBy,
        normal: [f64; 3],
    ) -> Option<Slice> {
        let position = Self::get_position(dicom_object);
        let order = Self::get_sort_order(dicom_object, sort_by, position, normal)?;
        let image = Self::decode_image(dicom_object)?;
        Some(Slice {
            order,
            position,
            image,
        })
    }

    fn get_sort_order(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: SortBy,
        position: Option<[f64; 3]>,
        normal: [f64; 3],
    ) -> Option<Option<f64>> {
        match sort_by {
            SortBy::ImagePositionPatient => {
                let pos = position?;
                Some(Some(dot(pos, normal)))
            }
            SortBy::TablePosition => {
                let pos = dicom_object
                    .element(tags::TABLE_POSITION)
                    .ok()?
                    .to_float64()
                    .ok();
                Some(pos)
            }
            SortBy::InstanceNumber => {
                let num = dicom_object
                    .element(tags::INSTANCE_NUMBER)
                    .ok()?
                    .to_int::<i32>()
                    .ok()
                    .map(f64::from);
                Some(num)
            }
            SortBy::None => Some(Some(0.0)),
        }
    }

    fn get_position(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<[f64; 3]> {
        let pos = dicom_object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()?
            .to_multi_float64()
            .ok()?;
        (pos.len() >= 3).then(|| [pos[0], pos[1], pos[2]])
    }

    /// Row and column direction cosines; identity axes when absent.
    fn get_orientation(dicom_objects: &[FileDicomObject<InMemDicomObject>]) -> [[f64; 3]; 2] {
        dicom_objects
            .iter()
            .find_map(|dicom_object| {
                let iop = dicom_object
                    .element(tags::IMAGE_ORIENTATION_PATIENT)
                    .ok()?
                    .to_multi_float64()
                    .ok()?;
                (iop.len() >= 6).then(|| [[iop[0], iop[1], iop[2]], [iop[3], iop[4], iop[5]]])
            })
            .unwrap_or([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]])
    }

    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<f32>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    fn sort_slices(slices: &mut [Slice], sort_by: SortBy) {
        if !matches!(sort_by, SortBy::None) {
            slices.sort_by(|a, b| {
                a.order
                    .partial_cmp(&b.order)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }

    fn validate_dimensions(slices: &[Slice]) -> Result<(), VolumeLoaderError> {
        let first_dim = slices[0].image.dim();
        if slices.iter().any(|slice| slice.image.dim() != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    /// Builds an `[x, y, z]` array: columns are x, rows are y, slices are z.
    fn build_volume_array(slices: &[Slice]) -> Array3<f32> {
        let (height, width) = slices[0].image.dim();
        let depth = slices.len();
        let mut volume = Array3::<f32>::zeros((width, height, depth));

        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![.., .., i]).assign(&slice.image.t());
        }

        volume
    }

    fn get_pixel_spacing(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
    ) -> Option<(f64, f64)> {
        dicom_objects.iter().find_map(|dicom_object| {
            let pixel_spacing = dicom_object
                .element(tags::PIXEL_SPACING)
                .ok()?
                .to_multi_float64()
                .ok()?;
            (pixel_spacing.len() >= 2).then(|| (pixel_spacing[0], pixel_spacing[1]))
        })
    }

    /// Distance between the first two sorted slice positions.
    fn get_slice_spacing(slices: &[Slice]) -> Option<f64> {
        let first = slices.first()?.position?;
        let second = slices.get(1)?.position?;
        let distance = (0..3)
            .map(|i| (second[i] - first[i]).powi(2))
            .sum::<f64>()
            .sqrt();
        (distance > 1e-6).then_some(distance)
    }

    fn get_slice_thickness(dicom_objects: &[FileDicomObject<InMemDicomObject>]) -> Option<f64> {
        dicom_objects.iter().find_map(|dicom_object| {
            dicom_object
                .element(tags::SLICE_THICKNESS)
                .ok()?
                .to_float64()
                .ok()
        })
    }
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
