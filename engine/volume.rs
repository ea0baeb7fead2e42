//! Volume containers with explicit dimensions.
//!
//! A `Series` is the 4D binary observation dataset (x, y, z, observation); a
//! `Volume` is one 3D scalar map; a `VolumeMask` restricts which voxels
//! participate in a scan. All dimension mismatches are input errors caught
//! before any voxel is visited.

use ndarray::{Array3, Array4};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error(
        "mask dimensions {mask:?} do not match series spatial dimensions {series:?}"
    )]
    MaskShapeMismatch { mask: [usize; 3], series: [usize; 3] },
    #[error(
        "series has {observations} observations but the dependent variable has {variable} entries"
    )]
    ObservationCountMismatch { observations: usize, variable: usize },
}

/// A 4D series: spatial dims plus one value per observation.
#[derive(Clone, Debug)]
pub struct Series {
    data: Array4<f64>,
}

impl Series {
    pub fn new(data: Array4<f64>) -> Self {
        Self { data }
    }

    /// Spatial dimensions (x, y, z).
    pub fn spatial_dims(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }

    /// Number of observations (the fourth axis).
    pub fn n_observations(&self) -> usize {
        self.data.shape()[3]
    }

    pub fn value(&self, x: usize, y: usize, z: usize, obs: usize) -> f64 {
        self.data[[x, y, z, obs]]
    }

    /// The series' own derived mask: voxels with at least one nonzero
    /// observation. An external mask is intersected with this one.
    pub fn derived_mask(&self) -> VolumeMask {
        let [dx, dy, dz] = self.spatial_dims();
        let mut mask = VolumeMask::none([dx, dy, dz]);
        for x in 0..dx {
            for y in 0..dy {
                for z in 0..dz {
                    let any = (0..self.n_observations()).any(|t| self.value(x, y, z, t) != 0.0);
                    mask.set(x, y, z, any);
                }
            }
        }
        mask
    }
}

/// One 3D scalar map, e.g. a statistic or p-value map.
pub type Volume = Array3<f64>;

/// Inclusion flags over (x, y, z).
#[derive(Clone, Debug)]
pub struct VolumeMask {
    flags: Array3<bool>,
}

impl VolumeMask {
    /// A mask including every voxel of the given dims.
    pub fn all(dims: [usize; 3]) -> Self {
        Self { flags: Array3::from_elem(dims, true) }
    }

    /// A mask excluding every voxel.
    pub fn none(dims: [usize; 3]) -> Self {
        Self { flags: Array3::from_elem(dims, false) }
    }

    /// Builds a mask from a scalar volume: nonzero means included.
    pub fn from_volume(volume: &Volume) -> Self {
        Self { flags: volume.mapv(|v| v != 0.0) }
    }

    /// Intersects with another mask in place.
    pub fn intersect(&mut self, other: &VolumeMask) -> Result<(), VolumeError> {
        if self.dims() != other.dims() {
            return Err(VolumeError::MaskShapeMismatch {
                mask: other.dims(),
                series: self.dims(),
            });
        }
        self.flags.zip_mut_with(&other.flags, |a, &b| *a = *a && b);
        Ok(())
    }

    pub fn dims(&self) -> [usize; 3] {
        let s = self.flags.shape();
        [s[0], s[1], s[2]]
    }

    pub fn included(&self, x: usize, y: usize, z: usize) -> bool {
        self.flags[[x, y, z]]
    }

    pub fn set(&mut self, x: usize, y: usize, z: usize, included: bool) {
        self.flags[[x, y, z]] = included;
    }

    /// Number of included voxels.
    pub fn count(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn mask_intersection() {
        let mut a = VolumeMask::all([2, 2, 1]);
        let mut volume = Array3::zeros([2, 2, 1]);
        volume[[0, 0, 0]] = 1.0;
        volume[[1, 1, 0]] = 2.0;
        let b = VolumeMask::from_volume(&volume);
        a.intersect(&b).unwrap();
        assert!(a.included(0, 0, 0));
        assert!(!a.included(0, 1, 0));
        assert_eq!(a.count(), 2);
    }

    #[test]
    fn mismatched_masks_rejected() {
        let mut a = VolumeMask::all([2, 2, 2]);
        let b = VolumeMask::all([2, 2, 1]);
        assert!(matches!(a.intersect(&b), Err(VolumeError::MaskShapeMismatch { .. })));
    }
}
