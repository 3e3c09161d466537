use ndarray::Array3;
use rayon::prelude::*;

/// Absolute tolerance used when comparing spacing, origin and direction.
pub const GEOMETRY_TOLERANCE: f64 = 1e-5;

/// Spatial metadata of a voxel grid in RAS world coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    /// Number of voxels along x, y, z
    pub dims: [usize; 3],
    /// Voxel size in mm along x, y, z
    pub spacing: [f64; 3],
    /// World position of voxel (0, 0, 0)
    pub origin: [f64; 3],
    /// Unit axis vectors; `direction[row][col]`, column `c` is voxel axis `c`
    pub direction: [[f64; 3]; 3],
}

impl Geometry {
    pub fn new(dims: [usize; 3], spacing: [f64; 3]) -> Self {
        Self {
            dims,
            spacing,
            origin: [0.0; 3],
            direction: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    pub fn with_origin(mut self, origin: [f64; 3]) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_direction(mut self, direction: [[f64; 3]; 3]) -> Self {
        self.direction = direction;
        self
    }

    /// Voxel-to-world matrix rows (3x4), direction scaled by spacing.
    pub fn affine(&self) -> [[f64; 4]; 3] {
        let mut rows = [[0.0; 4]; 3];
        for (r, row) in rows.iter_mut().enumerate() {
            for c in 0..3 {
                row[c] = self.direction[r][c] * self.spacing[c];
            }
            row[3] = self.origin[r];
        }
        rows
    }

    /// Splits a voxel-to-world matrix back into spacing, direction and origin.
    pub fn from_affine(dims: [usize; 3], affine: [[f64; 4]; 3]) -> Self {
        let mut spacing = [0.0; 3];
        let mut direction = [[0.0; 3]; 3];
        for c in 0..3 {
            let norm = (0..3)
                .map(|r| affine[r][c] * affine[r][c])
                .sum::<f64>()
                .sqrt();
            spacing[c] = norm;
            for r in 0..3 {
                direction[r][c] = if norm > 1e-9 {
                    affine[r][c] / norm
                } else if r == c {
                    1.0
                } else {
                    0.0
                };
            }
        }
        Self {
            dims,
            spacing,
            origin: [affine[0][3], affine[1][3], affine[2][3]],
            direction,
        }
    }

    /// Checks that `other` describes the same grid.
    ///
    /// Dimensions must be equal; spacing, origin and direction may differ by
    /// at most [`GEOMETRY_TOLERANCE`]. The error names the first difference.
    pub fn ensure_matches(&self, other: &Geometry) -> Result<(), String> {
        if self.dims != other.dims {
            return Err(format!("dimensions {:?} vs {:?}", self.dims, other.dims));
        }
        if !close(&self.spacing, &other.spacing) {
            return Err(format!("spacing {:?} vs {:?}", self.spacing, other.spacing));
        }
        if !close(&self.origin, &other.origin) {
            return Err(format!("origin {:?} vs {:?}", self.origin, other.origin));
        }
        let differs = self
            .direction
            .iter()
            .zip(other.direction.iter())
            .any(|(a, b)| !close(a, b));
        if differs {
            return Err(format!(
                "direction {:?} vs {:?}",
                self.direction, other.direction
            ));
        }
        Ok(())
    }
}

fn close(a: &[f64; 3], b: &[f64; 3]) -> bool {
    a.iter()
        .zip(b.iter())
        .all(|(x, y)| (x - y).abs() <= GEOMETRY_TOLERANCE)
}

/// A voxel grid with immutable geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct Volume<T> {
    data: Array3<T>,
    geometry: Geometry,
}

/// Segmentation labels; 0 is background.
pub type LabelVolume = Volume<u16>;

/// Scanner intensities (HU for CT).
pub type ImageVolume = Volume<f32>;

impl<T> Volume<T> {
    /// Wraps `data` (indexed `[x, y, z]`) with its geometry.
    ///
    /// Returns `None` if the array shape disagrees with `geometry.dims`.
    pub fn new(data: Array3<T>, geometry: Geometry) -> Option<Self> {
        let (x, y, z) = data.dim();
        if [x, y, z] != geometry.dims {
            return None;
        }
        Some(Self { data, geometry })
    }

    /// Get the dimensions of the volume (x, y, z)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<T> {
        &self.data
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }
}

impl LabelVolume {
    /// All-background volume on the grid of `reference`.
    pub fn empty_like<U>(reference: &Volume<U>) -> Self {
        let geometry = reference.geometry.clone();
        let [x, y, z] = geometry.dims;
        Self {
            data: Array3::zeros((x, y, z)),
            geometry,
        }
    }

    /// Number of voxels carrying `label`.
    pub fn count_label(&self, label: u16) -> usize {
        self.data.par_iter().filter(|&&v| v == label).count()
    }
}
