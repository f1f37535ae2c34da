//! Parallel segmentation of a whole FOD image.
//!
//! Voxels are independent, so segmentation fans out over a rayon pool; the
//! collected results come back in grid order, which keeps the downstream
//! fixel-map build bit-exact regardless of thread scheduling.

use crate::lobe::VoxelLobes;
use crate::segmenter::Segmenter;
use anyhow::{ensure, Result};
use fixtract_core::sh;
use fixtract_core::{Image3, Image4};
use rayon::prelude::*;

/// Segment every voxel of an FOD image, in grid order.
///
/// Voxels where `mask` is zero (when provided) are skipped. The mask must
/// share the FOD image's voxel grid.
pub fn segment_image(
    fod: &Image4<f64>,
    mask: Option<&Image3<f64>>,
    segmenter: &Segmenter,
) -> Result<Vec<VoxelLobes>> {
    ensure!(
        fod.channels == sh::n_coefs(segmenter.lmax()),
        "FOD image carries {} coefficients but the segmenter expects lmax {} ({})",
        fod.channels,
        segmenter.lmax(),
        sh::n_coefs(segmenter.lmax())
    );
    if let Some(mask) = mask {
        ensure!(
            mask.grid.matches(&fod.grid),
            "mask voxel grid does not match FOD image grid"
        );
    }

    let results: Vec<VoxelLobes> = (0..fod.grid.nvoxels())
        .into_par_iter()
        .map(|linear| {
            let voxel = fod.grid.unlinear(linear);
            if let Some(mask) = mask {
                if *mask.get(voxel) == 0.0 {
                    return VoxelLobes::empty(voxel);
                }
            }
            segmenter.segment(fod.voxel(voxel), voxel)
        })
        .collect();

    let nlobes: usize = results.iter().map(|v| v.lobes.len()).sum();
    tracing::debug!(
        voxels = results.len(),
        lobes = nlobes,
        "FOD segmentation complete"
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::SegmenterConfig;
    use fixtract_core::sh::delta;
    use fixtract_core::{DirectionSet, VoxelGrid};
    use nalgebra::Vector3;
    use std::sync::Arc;

    #[test]
    fn segments_only_masked_voxels_in_grid_order() {
        let dirs = Arc::new(DirectionSet::hemisphere_1281());
        let config = SegmenterConfig {
            peak_value_threshold: 0.5,
            ..SegmenterConfig::default()
        };
        let segmenter = Segmenter::new(dirs, 8, config).unwrap();

        let grid = VoxelGrid::isotropic([2, 1, 1], 2.0);
        let coefs = delta(&Vector3::new(0.0, 0.0, 1.0), 8);
        let mut fod = Image4::zeros(grid.clone(), coefs.len());
        fod.voxel_mut([0, 0, 0]).copy_from_slice(&coefs);
        fod.voxel_mut([1, 0, 0]).copy_from_slice(&coefs);

        let mut mask = Image3::zeros(grid);
        *mask.get_mut([1, 0, 0]) = 1.0;

        let out = segment_image(&fod, Some(&mask), &segmenter).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].voxel, [0, 0, 0]);
        assert!(out[0].lobes.is_empty());
        assert_eq!(out[1].voxel, [1, 0, 0]);
        assert_eq!(out[1].lobes.len(), 1);
    }
}
