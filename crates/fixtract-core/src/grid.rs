//! Voxel grid geometry.
//!
//! A [`VoxelGrid`] places voxel centres at integer coordinates; voxel `v`
//! occupies the half-open cube `[v - 0.5, v + 0.5)` in continuous voxel
//! space. Scanner space is related by a per-axis scaling plus translation
//! (`scanner = origin + spacing ∘ voxel`).

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Geometry of a 3-D voxel grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoxelGrid {
    /// Number of voxels along each axis.
    pub dim: [usize; 3],
    /// Voxel edge lengths in millimetres.
    pub spacing: [f64; 3],
    /// Scanner-space position of the centre of voxel `(0, 0, 0)`.
    pub origin: [f64; 3],
}

impl VoxelGrid {
    /// Construct a grid with the given dimensions, spacing and origin.
    #[must_use]
    pub fn new(dim: [usize; 3], spacing: [f64; 3], origin: [f64; 3]) -> Self {
        Self {
            dim,
            spacing,
            origin,
        }
    }

    /// Isotropic grid with its first voxel centre at the scanner origin.
    #[must_use]
    pub fn isotropic(dim: [usize; 3], spacing: f64) -> Self {
        Self::new(dim, [spacing; 3], [0.0; 3])
    }

    /// Total number of voxels.
    #[must_use]
    pub fn nvoxels(&self) -> usize {
        self.dim[0] * self.dim[1] * self.dim[2]
    }

    /// Volume of one voxel in mm³.
    #[must_use]
    pub fn voxel_volume(&self) -> f64 {
        self.spacing[0] * self.spacing[1] * self.spacing[2]
    }

    /// Smallest voxel edge length.
    #[must_use]
    pub fn min_spacing(&self) -> f64 {
        self.spacing[0].min(self.spacing[1]).min(self.spacing[2])
    }

    /// Row-major linear index of an in-bounds voxel.
    #[must_use]
    pub fn linear(&self, v: [usize; 3]) -> usize {
        (v[2] * self.dim[1] + v[1]) * self.dim[0] + v[0]
    }

    /// Inverse of [`Self::linear`].
    #[must_use]
    pub fn unlinear(&self, index: usize) -> [usize; 3] {
        let x = index % self.dim[0];
        let rest = index / self.dim[0];
        [x, rest % self.dim[1], rest / self.dim[1]]
    }

    /// Whether a signed voxel coordinate lies inside the grid.
    #[must_use]
    pub fn contains(&self, v: [i64; 3]) -> bool {
        (0..3).all(|a| v[a] >= 0 && (v[a] as usize) < self.dim[a])
    }

    /// Voxel (continuous) → scanner coordinates.
    #[must_use]
    pub fn voxel_to_scanner(&self, v: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(
            self.origin[0] + self.spacing[0] * v[0],
            self.origin[1] + self.spacing[1] * v[1],
            self.origin[2] + self.spacing[2] * v[2],
        )
    }

    /// Scanner → voxel (continuous) coordinates.
    #[must_use]
    pub fn scanner_to_voxel(&self, p: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(
            (p[0] - self.origin[0]) / self.spacing[0],
            (p[1] - self.origin[1]) / self.spacing[1],
            (p[2] - self.origin[2]) / self.spacing[2],
        )
    }

    /// Nearest voxel to a continuous voxel-space position.
    #[must_use]
    pub fn round(v: &Vector3<f64>) -> [i64; 3] {
        [
            v[0].round() as i64,
            v[1].round() as i64,
            v[2].round() as i64,
        ]
    }

    /// Whether two grids describe the same sampling of scanner space.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        const TOL: f64 = 1e-6;
        self.dim == other.dim
            && (0..3).all(|a| {
                (self.spacing[a] - other.spacing[a]).abs() < TOL
                    && (self.origin[a] - other.origin[a]).abs() < TOL
            })
    }

    /// Iterate voxel coordinates in grid (x-fastest) order.
    pub fn voxels(&self) -> impl Iterator<Item = [usize; 3]> + '_ {
        (0..self.nvoxels()).map(|i| self.unlinear(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_unlinear_roundtrip() {
        let g = VoxelGrid::isotropic([3, 4, 5], 2.0);
        for i in 0..g.nvoxels() {
            assert_eq!(g.linear(g.unlinear(i)), i);
        }
    }

    #[test]
    fn scanner_voxel_roundtrip() {
        let g = VoxelGrid::new([4, 4, 4], [2.0, 2.5, 3.0], [-1.0, 5.0, 0.5]);
        let v = Vector3::new(1.25, 2.0, 3.75);
        let back = g.scanner_to_voxel(&g.voxel_to_scanner(&v));
        assert!((back - v).norm() < 1e-12);
    }

    #[test]
    fn grid_order_is_x_fastest() {
        let g = VoxelGrid::isotropic([2, 2, 1], 1.0);
        let order: Vec<_> = g.voxels().collect();
        assert_eq!(order, vec![[0, 0, 0], [1, 0, 0], [0, 1, 0], [1, 1, 0]]);
    }
}
