//! NIfTI reading and writing for label and image volumes
//!
//! Geometry is decoded from the sform when present, then the qform
//! quaternion, then plain pixdim scaling. Volumes are always written with an
//! sform so a written file reads back with the same geometry.

use std::path::{Path, PathBuf};

use ndarray::Array3;
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use tracing::debug;

use crate::error::{Error, Result};
use crate::volume::{Geometry, ImageVolume, LabelVolume, Volume};

/// Extensions recognized as NIfTI, longest first.
pub const NIFTI_EXTENSIONS: [&str; 2] = ["nii.gz", "nii"];

/// Reads the geometry of a NIfTI file without loading voxel data.
pub fn read_geometry(path: &Path) -> Result<Geometry> {
    let header = NiftiHeader::from_file(path).map_err(|source| nifti_error(path, source))?;
    geometry_from_header(&header, path)
}

/// Reads a segmentation; every voxel must be an integer in `0..=u16::MAX`.
pub fn read_labels(path: &Path) -> Result<LabelVolume> {
    let (values, geometry) = read_voxels(path)?;
    let mut labels = Vec::with_capacity(values.len());
    for value in values {
        if value < 0.0 || value.fract() != 0.0 || value > f64::from(u16::MAX) {
            return Err(Error::Volume {
                path: path.to_path_buf(),
                reason: format!("voxel value {value} is not a valid label"),
            });
        }
        labels.push(value as u16);
    }
    build(path, labels, geometry)
}

/// Reads an intensity image.
pub fn read_image(path: &Path) -> Result<ImageVolume> {
    let (values, geometry) = read_voxels(path)?;
    let data = values.into_iter().map(|v| v as f32).collect();
    build(path, data, geometry)
}

pub fn write_labels(path: &Path, volume: &LabelVolume) -> Result<()> {
    let header = header_for(volume.geometry());
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(volume.data())
        .map_err(|source| nifti_error(path, source))
}

pub fn write_image(path: &Path, volume: &ImageVolume) -> Result<()> {
    let header = header_for(volume.geometry());
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(volume.data())
        .map_err(|source| nifti_error(path, source))
}

/// Writes `volume` so that `path` is either absent or complete.
///
/// Data goes to a hidden temporary in the destination directory that keeps
/// the NIfTI extension (gzip is chosen from the file name), then is renamed
/// onto `path`.
pub fn write_labels_atomic(path: &Path, volume: &LabelVolume) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let suffix = format!(".{}", extension_of(path).unwrap_or("nii"));
    let temp = tempfile::Builder::new()
        .prefix(".partial-")
        .suffix(&suffix)
        .tempfile_in(dir)
        .map_err(|source| Error::io(dir, source))?;

    write_labels(temp.path(), volume)?;
    temp.persist(path)
        .map_err(|err| Error::io(path, err.error))?;
    debug!(path = %path.display(), "Atomically wrote label volume");
    Ok(())
}

/// Returns the NIfTI extension of `path` (without leading dot), if any.
pub fn extension_of(path: &Path) -> Option<&'static str> {
    let name = path.file_name()?.to_str()?;
    NIFTI_EXTENSIONS
        .into_iter()
        .find(|ext| name.ends_with(&format!(".{ext}")))
}

fn read_voxels(path: &Path) -> Result<(Vec<f64>, Geometry)> {
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|source| nifti_error(path, source))?;
    let geometry = geometry_from_header(obj.header(), path)?;
    let array = obj
        .into_volume()
        .into_ndarray::<f64>()
        .map_err(|source| nifti_error(path, source))?;

    let shape = array.shape().to_vec();
    let spatial = shape.len() == 3 || (shape.len() == 4 && shape[3] == 1);
    if !spatial || shape[..3] != geometry.dims {
        return Err(Error::Volume {
            path: path.to_path_buf(),
            reason: format!("expected a 3D volume, found shape {shape:?}"),
        });
    }
    // Logical (row-major) order over [x, y, z(, 1)] matches Array3 standard layout.
    let values = array.iter().copied().collect();
    Ok((values, geometry))
}

fn build<T>(path: &Path, data: Vec<T>, geometry: Geometry) -> Result<Volume<T>> {
    let [x, y, z] = geometry.dims;
    let array = Array3::from_shape_vec((x, y, z), data).map_err(|e| Error::Volume {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Volume::new(array, geometry).ok_or_else(|| Error::Volume {
        path: path.to_path_buf(),
        reason: "voxel data disagrees with header dimensions".to_string(),
    })
}

fn header_for(geometry: &Geometry) -> NiftiHeader {
    let mut header = NiftiHeader::default();
    header.pixdim[0] = 1.0;
    for axis in 0..3 {
        header.pixdim[axis + 1] = geometry.spacing[axis] as _;
    }
    let affine = geometry.affine();
    header.srow_x = [
        affine[0][0] as _,
        affine[0][1] as _,
        affine[0][2] as _,
        affine[0][3] as _,
    ];
    header.srow_y = [
        affine[1][0] as _,
        affine[1][1] as _,
        affine[1][2] as _,
        affine[1][3] as _,
    ];
    header.srow_z = [
        affine[2][0] as _,
        affine[2][1] as _,
        affine[2][2] as _,
        affine[2][3] as _,
    ];
    header.sform_code = 1;
    header.qform_code = 0;
    // NIFTI_UNITS_MM
    header.xyzt_units = 2;
    header
}

fn geometry_from_header(header: &NiftiHeader, path: &Path) -> Result<Geometry> {
    let ndim = header.dim[0] as usize;
    let trailing_singleton = (4..=ndim.min(7)).all(|i| header.dim[i] as usize == 1);
    if !(3..=7).contains(&ndim) || !trailing_singleton {
        return Err(Error::Volume {
            path: path.to_path_buf(),
            reason: format!("expected a 3D volume, header declares {ndim} dimensions"),
        });
    }
    let dims = [
        header.dim[1] as usize,
        header.dim[2] as usize,
        header.dim[3] as usize,
    ];
    let pixdim = [
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64,
    ];

    let affine = if header.sform_code > 0 {
        [
            header.srow_x.map(|v| v as f64),
            header.srow_y.map(|v| v as f64),
            header.srow_z.map(|v| v as f64),
        ]
    } else if header.qform_code > 0 {
        let b = header.quatern_b as f64;
        let c = header.quatern_c as f64;
        let d = header.quatern_d as f64;
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let (dx, dy, dz) = (pixdim[0], pixdim[1], pixdim[2] * qfac);
        [
            [
                (a * a + b * b - c * c - d * d) * dx,
                (2.0 * b * c - 2.0 * a * d) * dy,
                (2.0 * b * d + 2.0 * a * c) * dz,
                header.quatern_x as f64,
            ],
            [
                (2.0 * b * c + 2.0 * a * d) * dx,
                (a * a + c * c - b * b - d * d) * dy,
                (2.0 * c * d - 2.0 * a * b) * dz,
                header.quatern_y as f64,
            ],
            [
                (2.0 * b * d - 2.0 * a * c) * dx,
                (2.0 * c * d + 2.0 * a * b) * dy,
                (a * a + d * d - c * c - b * b) * dz,
                header.quatern_z as f64,
            ],
        ]
    } else {
        [
            [pixdim[0], 0.0, 0.0, 0.0],
            [0.0, pixdim[1], 0.0, 0.0],
            [0.0, 0.0, pixdim[2], 0.0],
        ]
    };
    Ok(Geometry::from_affine(dims, affine))
}

fn nifti_error(path: &Path, source: nifti::NiftiError) -> Error {
    Error::Nifti {
        path: PathBuf::from(path),
        source,
    }
}
