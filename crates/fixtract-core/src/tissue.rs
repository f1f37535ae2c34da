//! Five-tissue-type (5TT) anatomical image handling.
//!
//! A 5TT image is a 4-D image whose last axis holds, in order: cortical
//! grey matter, sub-cortical grey matter, white matter, CSF and
//! pathological tissue. Fractions lie in `[0, 1]` and sum to at most one
//! per voxel.

use crate::image::Image4;
use crate::interp;
use anyhow::{ensure, Result};

/// Number of tissue channels.
pub const N_TISSUES: usize = 5;

/// Tissue fractions sampled at one location.
#[derive(Clone, Copy, Debug, Default)]
pub struct Tissues {
    /// Cortical grey matter fraction.
    pub cgm: f64,
    /// Sub-cortical grey matter fraction.
    pub sgm: f64,
    /// White matter fraction.
    pub wm: f64,
    /// CSF fraction.
    pub csf: f64,
    /// Pathological tissue fraction.
    pub path: f64,
}

impl Tissues {
    /// Build from a five-channel slice, sanitising non-finite values to 0.
    #[must_use]
    pub fn from_channels(values: &[f64]) -> Self {
        let clean = |v: f64| if v.is_finite() { v } else { 0.0 };
        Self {
            cgm: clean(values[0]),
            sgm: clean(values[1]),
            wm: clean(values[2]),
            csf: clean(values[3]),
            path: clean(values[4]),
        }
    }

    /// Sample a 5TT image at a continuous voxel-space position (trilinear).
    #[must_use]
    pub fn sample(image: &Image4<f64>, voxel_pos: [f64; 3]) -> Self {
        let mut values = [0.0; N_TISSUES];
        for (c, value) in values.iter_mut().enumerate() {
            *value = interp::linear4(image, voxel_pos, c);
        }
        Self::from_channels(&values)
    }

    /// Total grey matter fraction.
    #[must_use]
    pub fn gm(&self) -> f64 {
        self.cgm + self.sgm
    }

    /// Whether any tissue is present at this location.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.cgm + self.sgm + self.wm + self.csf + self.path > 0.0
    }
}

/// Verify the basic 5TT contract on a user-provided image.
///
/// Out-of-range fractions in user input are fatal; non-finite values are
/// likewise rejected here rather than silently sanitised, because this is
/// the user-input boundary.
pub fn verify_5tt(image: &Image4<f64>) -> Result<()> {
    ensure!(
        image.channels == N_TISSUES,
        "5TT image must carry {N_TISSUES} tissue channels, found {}",
        image.channels
    );
    for v in image.grid.voxels() {
        let channels = image.voxel(v);
        let mut sum = 0.0;
        for &value in channels {
            ensure!(
                value.is_finite() && (0.0..=1.0).contains(&value),
                "5TT fraction {value} at voxel {v:?} outside [0, 1]"
            );
            sum += value;
        }
        ensure!(
            sum <= 1.0 + 1e-6,
            "5TT fractions at voxel {v:?} sum to {sum} > 1"
        );
    }
    Ok(())
}
