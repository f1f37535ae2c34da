//! Processing-weight derivation.
//!
//! Model weights scale each fixel's contribution to both sums of μ and to
//! the cost function. They come from (in priority order) an explicit
//! per-fixel data file, an explicit voxel image, a 5TT anatomical image
//! (white-matter fraction squared), or default to unity.

use anyhow::{bail, ensure, Context, Result};
use fixtract_core::tissue::{self, N_TISSUES};
use fixtract_core::{interp, io, Image3, Image4, VoxelGrid};
use std::path::{Path, PathBuf};

/// Where the model's processing weights come from.
#[derive(Clone, Debug, Default)]
pub enum WeightSource {
    /// All fixels weigh 1.
    #[default]
    Unit,
    /// Per-fixel data file (values validated to lie in `[0, 1]`).
    FixelFile(PathBuf),
    /// Voxel image (resampled with clamping when the grid mismatches).
    VoxelImage(PathBuf),
    /// Derive from the loaded 5TT image (WM fraction squared).
    FiveTt,
}

/// Load a 5TT image and bring it onto the model grid.
///
/// User input is verified strictly (out-of-range or non-finite fractions
/// are fatal); a grid mismatch triggers cubic resampling with clamping of
/// the derived values to `[0, 1]`.
pub fn load_5tt(path: &Path, grid: &VoxelGrid) -> Result<Image4<f64>> {
    let image: Image4<f64> = io::read_auto(path)?;
    image
        .validate()
        .with_context(|| format!("validating 5TT image {}", path.display()))?;
    tissue::verify_5tt(&image).with_context(|| format!("verifying 5TT image {}", path.display()))?;

    if image.grid.matches(grid) {
        tracing::info!("5TT image voxel grid matches the model; importing directly");
        return Ok(image);
    }

    tracing::info!("5TT image voxel grid does not match the model; regridding");
    let mut out = Image4::zeros(grid.clone(), N_TISSUES);
    for v in grid.voxels() {
        let scanner = grid.voxel_to_scanner(&nalgebra::Vector3::new(
            v[0] as f64,
            v[1] as f64,
            v[2] as f64,
        ));
        let p = image.grid.scanner_to_voxel(&scanner);
        let p = [p[0], p[1], p[2]];
        for c in 0..N_TISSUES {
            let value = interp::cubic4(&image, p, c);
            out.voxel_mut(v)[c] = if value.is_finite() {
                value.clamp(0.0, 1.0)
            } else {
                0.0
            };
        }
    }
    Ok(out)
}

/// Derive the voxel-wise processing weights for a model grid.
///
/// Returns `None` for [`WeightSource::FixelFile`], which is applied
/// per fixel by the caller instead.
pub fn voxel_weights(
    source: &WeightSource,
    grid: &VoxelGrid,
    act: Option<&Image4<f64>>,
) -> Result<Option<Image3<f64>>> {
    match source {
        WeightSource::Unit | WeightSource::FixelFile(_) => Ok(None),
        WeightSource::VoxelImage(path) => Ok(Some(weights_from_image(path, grid)?)),
        WeightSource::FiveTt => {
            let act = act.ok_or_else(|| {
                anyhow::anyhow!("5TT-derived model weights requested but no 5TT image loaded")
            })?;
            Ok(Some(weights_from_5tt(act)?))
        }
    }
}

fn weights_from_image(path: &Path, grid: &VoxelGrid) -> Result<Image3<f64>> {
    let image: Image3<f64> = io::read_auto(path)?;
    image
        .validate()
        .with_context(|| format!("validating model weights image {}", path.display()))?;

    if image.grid.matches(grid) {
        tracing::info!("model weights image lies on the model grid; importing directly");
        for v in grid.voxels() {
            let w = *image.get(v);
            ensure!(
                w.is_finite() && (0.0..=1.0).contains(&w),
                "invalid model weight {w} at voxel {v:?} in {}; values must lie in [0, 1]",
                path.display()
            );
        }
        return Ok(image);
    }

    tracing::warn!(
        "model weights image {} does not lie on the model grid; \
         resampling with cubic interpolation and clamping to [0, 1]",
        path.display()
    );
    let mut out = Image3::zeros(grid.clone());
    let mut all_zero = true;
    for v in grid.voxels() {
        let scanner = grid.voxel_to_scanner(&nalgebra::Vector3::new(
            v[0] as f64,
            v[1] as f64,
            v[2] as f64,
        ));
        let p = image.grid.scanner_to_voxel(&scanner);
        let value = interp::cubic3(&image, [p[0], p[1], p[2]]);
        let clamped = if value.is_finite() {
            value.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if clamped > 0.0 {
            all_zero = false;
        }
        *out.get_mut(v) = clamped;
    }
    if all_zero {
        bail!(
            "model weights image {} resampled to all-zero on the model grid; \
             check image registration",
            path.display()
        );
    }
    Ok(out)
}

/// Weights from a (grid-matched) 5TT image: WM fraction squared.
fn weights_from_5tt(act: &Image4<f64>) -> Result<Image3<f64>> {
    let mut out = Image3::zeros(act.grid.clone());
    let mut all_zero = true;
    for v in act.grid.voxels() {
        let wm = *act.get(v, 2);
        let weight = if wm.is_finite() { wm * wm } else { 0.0 };
        if weight > 0.0 {
            all_zero = false;
        }
        *out.get_mut(v) = weight;
    }
    if all_zero {
        bail!("model weights derived from the 5TT image are all zero; check 5TT image / registration");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("fixtract_weights_{name}_{nanos}.json"));
        p
    }

    fn act_image(wm: f64) -> Image4<f64> {
        let mut act = Image4::zeros(VoxelGrid::isotropic([2, 1, 1], 1.0), N_TISSUES);
        for v in [[0, 0, 0], [1, 0, 0]] {
            act.voxel_mut(v)[2] = wm;
        }
        act
    }

    #[test]
    fn wm_squared_heuristic() {
        let act = act_image(0.5);
        let weights = voxel_weights(&WeightSource::FiveTt, &act.grid, Some(&act))
            .unwrap()
            .unwrap();
        assert!((*weights.get([0, 0, 0]) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn all_zero_5tt_weights_fatal() {
        let act = act_image(0.0);
        assert!(voxel_weights(&WeightSource::FiveTt, &act.grid, Some(&act)).is_err());
    }

    #[test]
    fn matched_grid_image_with_invalid_value_fatal() {
        let grid = VoxelGrid::isotropic([2, 1, 1], 1.0);
        let mut img = Image3::zeros(grid.clone());
        *img.get_mut([0, 0, 0]) = 1.5;
        let path = tmp_path("badweight");
        io::write_auto(&path, &img).unwrap();
        assert!(weights_from_image(&path, &grid).is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn mismatched_grid_is_resampled_and_clamped() {
        // Source grid is shifted but overlapping; constant value 2.0 clamps
        // down to 1.0 everywhere.
        let source_grid = VoxelGrid::new([4, 4, 4], [1.0, 1.0, 1.0], [-1.0, -1.0, -1.0]);
        let img = Image3::from_data(source_grid, vec![2.0; 64]).unwrap();
        let path = tmp_path("resample");
        io::write_auto(&path, &img).unwrap();
        let grid = VoxelGrid::isotropic([2, 2, 2], 1.0);
        let out = weights_from_image(&path, &grid).unwrap();
        for v in grid.voxels() {
            assert!((out.get(v) - 1.0).abs() < 1e-9);
        }
        let _ = std::fs::remove_file(path);
    }
}
