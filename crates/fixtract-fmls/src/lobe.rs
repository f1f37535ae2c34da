//! Transient per-voxel FOD lobe representation.

use fixtract_core::{DirIndex, DirectionSet};
use nalgebra::Vector3;

/// One FOD lobe under construction or awaiting conversion into a fixel.
///
/// The dixel mask and per-direction amplitude values span the whole
/// direction set; the mean direction accumulates the amplitude-weighted
/// unit-vector sum and is normalised by [`FodLobe::finalise`].
#[derive(Clone, Debug)]
pub struct FodLobe {
    mask: Vec<bool>,
    values: Vec<f64>,
    max_peak_value: f64,
    peak_dirs: Vec<Vector3<f64>>,
    mean_dir: Vector3<f64>,
    lsq_dir: Option<Vector3<f64>>,
    integral: f64,
    neg: bool,
}

impl FodLobe {
    /// Seed a new lobe at one direction bin.
    #[must_use]
    pub fn new(dirs: &DirectionSet, seed: DirIndex, value: f64, weight: f64) -> Self {
        let mut mask = vec![false; dirs.len()];
        let mut values = vec![0.0; dirs.len()];
        mask[seed as usize] = true;
        values[seed as usize] = value;
        let seed_dir = *dirs.direction(seed);
        Self {
            mask,
            values,
            max_peak_value: value.abs(),
            peak_dirs: vec![seed_dir],
            mean_dir: seed_dir * value.abs() * weight,
            lsq_dir: None,
            integral: (value * weight).abs(),
            neg: value <= 0.0,
        }
    }

    /// Grow the lobe by one direction bin.
    pub fn add(&mut self, dirs: &DirectionSet, bin: DirIndex, value: f64, weight: f64) {
        debug_assert!((value <= 0.0 && self.neg) || (value >= 0.0 && !self.neg));
        self.mask[bin as usize] = true;
        self.values[bin as usize] = value;
        let dir = *dirs.direction(bin);
        let multiplier = if self.mean_dir.dot(&dir) > 0.0 { 1.0 } else { -1.0 };
        self.mean_dir += dir * (multiplier * value.abs() * weight);
        self.integral += (value * weight).abs();
    }

    /// Absorb another lobe of the same sign.
    pub fn merge(&mut self, that: &FodLobe) {
        debug_assert_eq!(self.neg, that.neg);
        for (m, &o) in self.mask.iter_mut().zip(&that.mask) {
            *m |= o;
        }
        for (v, &o) in self.values.iter_mut().zip(&that.values) {
            *v += o;
        }
        if that.max_peak_value > self.max_peak_value {
            self.max_peak_value = that.max_peak_value;
            let mut peaks = that.peak_dirs.clone();
            peaks.extend(self.peak_dirs.iter().copied());
            self.peak_dirs = peaks;
        } else {
            self.peak_dirs.extend(that.peak_dirs.iter().copied());
        }
        let multiplier = if self.mean_dir.dot(&that.mean_dir) > 0.0 {
            1.0
        } else {
            -1.0
        };
        self.mean_dir += that.mean_dir * that.integral * multiplier;
        self.integral += that.integral;
    }

    /// Replace a peak with its Newton-refined direction and value.
    pub fn revise_peak(&mut self, index: usize, dir: Vector3<f64>, value: f64) {
        debug_assert!(!self.neg);
        self.peak_dirs[index] = dir;
        if index == 0 {
            self.max_peak_value = value;
        }
    }

    /// Normalise the accumulated mean direction to unit length.
    pub fn finalise(&mut self) {
        self.mean_dir.normalize_mut();
    }

    /// Record the least-squares (geodesic) mean direction.
    pub fn set_lsq_dir(&mut self, dir: Vector3<f64>) {
        self.lsq_dir = Some(dir);
    }

    /// Dixel mask over the direction set.
    #[must_use]
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    /// Signed per-direction amplitude values.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Amplitude of the maximal peak.
    #[must_use]
    pub fn max_peak_value(&self) -> f64 {
        self.max_peak_value
    }

    /// Number of discrete peaks merged into this lobe.
    #[must_use]
    pub fn num_peaks(&self) -> usize {
        self.peak_dirs.len()
    }

    /// Direction of the `i`-th peak (the first is the maximal one).
    #[must_use]
    pub fn peak_dir(&self, i: usize) -> &Vector3<f64> {
        &self.peak_dirs[i]
    }

    /// Amplitude-weighted mean direction (unit length after `finalise`).
    #[must_use]
    pub fn mean_dir(&self) -> &Vector3<f64> {
        &self.mean_dir
    }

    /// Least-squares mean direction, when computed.
    #[must_use]
    pub fn lsq_dir(&self) -> Option<&Vector3<f64>> {
        self.lsq_dir.as_ref()
    }

    /// Amplitude integral (Σ |amplitude| · solid-angle weight).
    #[must_use]
    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Whether this is a negative (noise) lobe.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.neg
    }
}

/// Segmentation result for one voxel.
#[derive(Clone, Debug, Default)]
pub struct VoxelLobes {
    /// Voxel coordinate within the FOD image grid.
    pub voxel: [usize; 3],
    /// Retained lobes, sorted by integral in descending order.
    pub lobes: Vec<FodLobe>,
    /// Dense direction→lobe offsets; the lobe count is the "no lobe"
    /// sentinel. Empty when the voxel holds no lobes.
    pub lut: Vec<u8>,
}

impl VoxelLobes {
    /// Empty result for a voxel.
    #[must_use]
    pub fn empty(voxel: [usize; 3]) -> Self {
        Self {
            voxel,
            lobes: Vec::new(),
            lut: Vec::new(),
        }
    }
}
