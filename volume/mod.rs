//! Volumetric collaborators: masking a 3-D volume to a flat voxel vector and
//! back, and suppressing small connected clusters of a thresholded map.

pub mod clusters;
pub mod io;

pub use clusters::ClusterFilter;
pub use io::{read_volume, write_volume};

use ndarray::{Array1, Array3, ArrayView1};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed volume {path} at line {line}: {message}")]
    Malformed {
        path: String,
        line: usize,
        message: String,
    },
    #[error("volume dimensions {found:?} do not match the mask dimensions {expected:?}")]
    DimensionMismatch {
        expected: [usize; 3],
        found: [usize; 3],
    },
    #[error("voxel vector has {found} entries but the mask contains {expected} voxels")]
    LengthMismatch { expected: usize, found: usize },
    #[error("the brain mask does not contain any voxels")]
    EmptyMask,
}

/// A dense 3-D volume with its voxel spacing in millimetres.
#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    pub data: Array3<f64>,
    pub spacing: [f64; 3],
}

impl Volume {
    pub fn new(data: Array3<f64>) -> Self {
        Self {
            data,
            spacing: [1.0, 1.0, 1.0],
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        let shape = self.data.shape();
        [shape[0], shape[1], shape[2]]
    }

    pub fn voxel_volume(&self) -> f64 {
        self.spacing.iter().product()
    }

    /// Lesion volume in mm^3: the number of non-zero voxels times the volume
    /// of one voxel.
    pub fn nonzero_volume(&self) -> f64 {
        let count = self.data.iter().filter(|&&v| v > 0.0).count();
        count as f64 * self.voxel_volume()
    }
}

/// Converts between volumes and flat voxel vectors under a fixed mask.
pub trait VolumeMasker {
    fn n_voxels(&self) -> usize;
    fn mask(&self, volume: &Volume) -> Result<Array1<f64>, VolumeError>;
    fn unmask(&self, values: ArrayView1<'_, f64>) -> Result<Volume, VolumeError>;
}

/// A binary brain mask over a 3-D grid. Masked voxels are enumerated in C
/// (row-major) order of the grid.
#[derive(Clone, Debug)]
pub struct BrainMask {
    dims: [usize; 3],
    spacing: [f64; 3],
    /// Flat grid offset of each masked voxel.
    offsets: Vec<usize>,
    /// Masked index for every grid offset, `usize::MAX` outside the mask.
    lookup: Vec<usize>,
}

impl BrainMask {
    /// Every voxel of a `dims` grid participates.
    pub fn full(dims: [usize; 3], spacing: [f64; 3]) -> Result<Self, VolumeError> {
        let total: usize = dims.iter().product();
        Self::from_offsets(dims, spacing, (0..total).collect())
    }

    /// Voxels with a non-zero value in `volume` participate.
    pub fn from_volume(volume: &Volume) -> Result<Self, VolumeError> {
        let offsets = volume
            .data
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v != 0.0)
            .map(|(offset, _)| offset)
            .collect();
        Self::from_offsets(volume.dims(), volume.spacing, offsets)
    }

    fn from_offsets(
        dims: [usize; 3],
        spacing: [f64; 3],
        offsets: Vec<usize>,
    ) -> Result<Self, VolumeError> {
        if offsets.is_empty() {
            return Err(VolumeError::EmptyMask);
        }
        let total: usize = dims.iter().product();
        let mut lookup = vec![usize::MAX; total];
        for (index, &offset) in offsets.iter().enumerate() {
            lookup[offset] = index;
        }
        Ok(Self {
            dims,
            spacing,
            offsets,
            lookup,
        })
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub(crate) fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub(crate) fn masked_index(&self, offset: usize) -> Option<usize> {
        match self.lookup[offset] {
            usize::MAX => None,
            index => Some(index),
        }
    }
}

impl VolumeMasker for BrainMask {
    fn n_voxels(&self) -> usize {
        self.offsets.len()
    }

    fn mask(&self, volume: &Volume) -> Result<Array1<f64>, VolumeError> {
        if volume.dims() != self.dims {
            return Err(VolumeError::DimensionMismatch {
                expected: self.dims,
                found: volume.dims(),
            });
        }
        let flat = volume
            .data
            .as_slice()
            .map(|slice| slice.to_vec())
            .unwrap_or_else(|| volume.data.iter().copied().collect());
        Ok(self.offsets.iter().map(|&offset| flat[offset]).collect())
    }

    fn unmask(&self, values: ArrayView1<'_, f64>) -> Result<Volume, VolumeError> {
        if values.len() != self.offsets.len() {
            return Err(VolumeError::LengthMismatch {
                expected: self.offsets.len(),
                found: values.len(),
            });
        }
        let mut data = Array3::<f64>::zeros((self.dims[0], self.dims[1], self.dims[2]));
        if let Some(flat) = data.as_slice_mut() {
            for (&offset, &value) in self.offsets.iter().zip(values.iter()) {
                flat[offset] = value;
            }
        }
        Ok(Volume {
            data,
            spacing: self.spacing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn cube(values: Vec<f64>) -> Volume {
        Volume::new(Array3::from_shape_vec((2, 2, 2), values).unwrap())
    }

    #[test]
    fn mask_and_unmask_restore_masked_voxels() {
        let template = cube(vec![1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0]);
        let mask = BrainMask::from_volume(&template).unwrap();
        assert_eq!(mask.n_voxels(), 4);

        let image = cube(vec![0.5, 9.0, 1.5, 2.5, 9.0, 9.0, 3.5, 9.0]);
        let masked = mask.mask(&image).unwrap();
        assert_eq!(masked, array![0.5, 1.5, 2.5, 3.5]);

        let restored = mask.unmask(masked.view()).unwrap();
        assert_eq!(
            restored.data.iter().copied().collect::<Vec<_>>(),
            vec![0.5, 0.0, 1.5, 2.5, 0.0, 0.0, 3.5, 0.0]
        );
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let mask = BrainMask::full([2, 2, 2], [1.0; 3]).unwrap();
        let other = Volume::new(Array3::zeros((2, 2, 3)));
        assert!(matches!(
            mask.mask(&other),
            Err(VolumeError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            mask.unmask(array![1.0, 2.0].view()),
            Err(VolumeError::LengthMismatch {
                expected: 8,
                found: 2
            })
        ));
    }

    #[test]
    fn empty_mask_is_an_error() {
        let blank = cube(vec![0.0; 8]);
        assert!(matches!(
            BrainMask::from_volume(&blank),
            Err(VolumeError::EmptyMask)
        ));
    }

    #[test]
    fn lesion_volume_counts_nonzero_voxels() {
        let mut lesion = cube(vec![1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        lesion.spacing = [2.0, 1.0, 1.5];
        assert!((lesion.nonzero_volume() - 9.0).abs() < 1e-12);
    }
}
