//! Image interpolation in continuous voxel space.
//!
//! Cubic interpolation uses the Catmull-Rom kernel over a 4³ neighbourhood;
//! linear interpolation uses the usual 2³ trilinear blend. Out-of-grid
//! samples clamp to the nearest edge voxel, so a query anywhere in space is
//! well defined.

use crate::image::{Image3, Image4};

/// Catmull-Rom kernel weights for fractional offset `t ∈ [0, 1)`.
///
/// Weights apply to samples at relative positions `{-1, 0, +1, +2}` and sum
/// to 1 for any `t`.
#[inline]
fn cubic_weights(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        0.5 * (-t3 + 2.0 * t2 - t),
        0.5 * (3.0 * t3 - 5.0 * t2 + 2.0),
        0.5 * (-3.0 * t3 + 4.0 * t2 + t),
        0.5 * (t3 - t2),
    ]
}

#[inline]
fn clamp_index(i: i64, dim: usize) -> usize {
    i.clamp(0, dim as i64 - 1) as usize
}

#[inline]
fn floor_frac(x: f64) -> (i64, f64) {
    let f = x.floor();
    (f as i64, x - f)
}

/// Cubic sample of a scalar image at continuous voxel position `p`.
pub fn cubic3(image: &Image3<f64>, p: [f64; 3]) -> f64 {
    let dim = image.grid.dim;
    let (ix, tx) = floor_frac(p[0]);
    let (iy, ty) = floor_frac(p[1]);
    let (iz, tz) = floor_frac(p[2]);
    let wx = cubic_weights(tx);
    let wy = cubic_weights(ty);
    let wz = cubic_weights(tz);

    let mut sum = 0.0;
    for (kz, &wz_k) in wz.iter().enumerate() {
        let z = clamp_index(iz - 1 + kz as i64, dim[2]);
        for (ky, &wy_k) in wy.iter().enumerate() {
            let y = clamp_index(iy - 1 + ky as i64, dim[1]);
            for (kx, &wx_k) in wx.iter().enumerate() {
                let x = clamp_index(ix - 1 + kx as i64, dim[0]);
                sum += wx_k * wy_k * wz_k * image.get([x, y, z]);
            }
        }
    }
    sum
}

/// Trilinear sample of one channel of a 4-D image at continuous voxel
/// position `p`.
pub fn linear4(image: &Image4<f64>, p: [f64; 3], channel: usize) -> f64 {
    let dim = image.grid.dim;
    let (ix, tx) = floor_frac(p[0]);
    let (iy, ty) = floor_frac(p[1]);
    let (iz, tz) = floor_frac(p[2]);

    let mut sum = 0.0;
    for kz in 0..2 {
        let wz = if kz == 0 { 1.0 - tz } else { tz };
        let z = clamp_index(iz + kz, dim[2]);
        for ky in 0..2 {
            let wy = if ky == 0 { 1.0 - ty } else { ty };
            let y = clamp_index(iy + ky, dim[1]);
            for kx in 0..2 {
                let wx = if kx == 0 { 1.0 - tx } else { tx };
                let x = clamp_index(ix + kx, dim[0]);
                sum += wx * wy * wz * image.get([x, y, z], channel);
            }
        }
    }
    sum
}

/// Cubic sample of one channel of a 4-D image at continuous voxel position.
pub fn cubic4(image: &Image4<f64>, p: [f64; 3], channel: usize) -> f64 {
    let dim = image.grid.dim;
    let (ix, tx) = floor_frac(p[0]);
    let (iy, ty) = floor_frac(p[1]);
    let (iz, tz) = floor_frac(p[2]);
    let wx = cubic_weights(tx);
    let wy = cubic_weights(ty);
    let wz = cubic_weights(tz);

    let mut sum = 0.0;
    for (kz, &wz_k) in wz.iter().enumerate() {
        let z = clamp_index(iz - 1 + kz as i64, dim[2]);
        for (ky, &wy_k) in wy.iter().enumerate() {
            let y = clamp_index(iy - 1 + ky as i64, dim[1]);
            for (kx, &wx_k) in wx.iter().enumerate() {
                let x = clamp_index(ix - 1 + kx as i64, dim[0]);
                sum += wx_k * wy_k * wz_k * image.get([x, y, z], channel);
            }
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::VoxelGrid;

    #[test]
    fn cubic_weights_partition_unity() {
        for &t in &[0.0, 0.25, 0.5, 0.99] {
            let w = cubic_weights(t);
            let sum: f64 = w.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn cubic_reproduces_constant_image() {
        let grid = VoxelGrid::isotropic([5, 5, 5], 1.0);
        let img = Image3::from_data(grid, vec![3.5; 125]).unwrap();
        for &p in &[[2.0, 2.0, 2.0], [1.3, 0.7, 3.9], [-1.0, 6.0, 2.5]] {
            assert!((cubic3(&img, p) - 3.5).abs() < 1e-12);
        }
    }

    #[test]
    fn cubic_interpolates_on_grid_points() {
        let grid = VoxelGrid::isotropic([6, 1, 1], 1.0);
        let data: Vec<f64> = (0..6).map(|x| x as f64 * 2.0).collect();
        let img = Image3::from_data(grid, data).unwrap();
        // The Catmull-Rom kernel interpolates sample values exactly.
        assert!((cubic3(&img, [3.0, 0.0, 0.0]) - 6.0).abs() < 1e-12);
        // And reproduces linear ramps away from the clamped edges.
        assert!((cubic3(&img, [2.5, 0.0, 0.0]) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn linear_blends_channels_independently() {
        let grid = VoxelGrid::isotropic([2, 1, 1], 1.0);
        let mut img = Image4::zeros(grid, 2);
        img.voxel_mut([0, 0, 0]).copy_from_slice(&[0.0, 1.0]);
        img.voxel_mut([1, 0, 0]).copy_from_slice(&[1.0, 0.0]);
        assert!((linear4(&img, [0.5, 0.0, 0.0], 0) - 0.5).abs() < 1e-12);
        assert!((linear4(&img, [0.25, 0.0, 0.0], 1) - 0.75).abs() < 1e-12);
    }
}
