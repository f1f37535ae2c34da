//! The FMLS segmenter proper.

use crate::lobe::{FodLobe, VoxelLobes};
use anyhow::{ensure, Result};
use fixtract_core::sh::{self, PrecomputedAl, ShTransform};
use fixtract_core::{DirIndex, DirectionSet};
use nalgebra::Vector3;
use std::sync::Arc;

/// Default absolute threshold on the integral of a positive lobe.
pub const DEFAULT_INTEGRAL_THRESHOLD: f64 = 0.0;
/// Default absolute threshold on the refined peak amplitude of a lobe.
pub const DEFAULT_PEAK_VALUE_THRESHOLD: f64 = 0.1;
/// Default bridge-to-peak amplitude ratio above which touching lobes merge.
/// 1.0 never merges lobes generated from discrete peaks.
pub const DEFAULT_LOBE_MERGE_RATIO: f64 = 1.0;

/// Tuning options for the segmenter. All fields are optional refinements of
/// the defaults above.
#[derive(Clone, Copy, Debug)]
pub struct SegmenterConfig {
    /// Discard positive lobes whose integral falls below this value.
    pub integral_threshold: f64,
    /// Discard lobes whose maximal refined peak falls below this value.
    pub peak_value_threshold: f64,
    /// Bridge-to-peak ratio controlling merging across a discrete valley,
    /// in `[0, 1]`.
    pub lobe_merge_ratio: f64,
    /// Keep at most this many lobes per voxel (0 = unbounded).
    pub max_num_fixels: usize,
    /// Compute the least-squares (geodesic) mean direction per lobe.
    pub calculate_lsq_dir: bool,
    /// Disable both amplitude thresholds; every positive lobe is retained.
    pub disable_all_thresholds: bool,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            integral_threshold: DEFAULT_INTEGRAL_THRESHOLD,
            peak_value_threshold: DEFAULT_PEAK_VALUE_THRESHOLD,
            lobe_merge_ratio: DEFAULT_LOBE_MERGE_RATIO,
            max_num_fixels: 0,
            calculate_lsq_dir: false,
            disable_all_thresholds: false,
        }
    }
}

/// Segments one voxel's SH coefficients into fibre lobes.
///
/// Holds the SH→amplitude transform and the precomputed associated-Legendre
/// table, so construct once and share across worker threads.
pub struct Segmenter {
    dirs: Arc<DirectionSet>,
    lmax: usize,
    transform: ShTransform,
    precomputer: PrecomputedAl,
    integral_threshold: f64,
    peak_value_threshold: f64,
    lobe_merge_ratio: f64,
    max_num_fixels: usize,
    calculate_lsq_dir: bool,
}

impl Segmenter {
    /// Build a segmenter for the given direction set and harmonic order.
    pub fn new(dirs: Arc<DirectionSet>, lmax: usize, config: SegmenterConfig) -> Result<Self> {
        ensure!(lmax % 2 == 0, "SH order must be even, got {lmax}");
        ensure!(
            (0.0..=1.0).contains(&config.lobe_merge_ratio),
            "lobe merge ratio {} outside [0, 1]",
            config.lobe_merge_ratio
        );
        let directions: Vec<Vector3<f64>> =
            (0..dirs.len()).map(|i| *dirs.direction(i as DirIndex)).collect();
        let transform = ShTransform::new(&directions, lmax);
        let precomputer = PrecomputedAl::new(lmax, 2 * dirs.len());
        let (integral_threshold, peak_value_threshold) = if config.disable_all_thresholds {
            (0.0, 0.0)
        } else {
            (config.integral_threshold, config.peak_value_threshold)
        };
        Ok(Self {
            dirs,
            lmax,
            transform,
            precomputer,
            integral_threshold,
            peak_value_threshold,
            lobe_merge_ratio: config.lobe_merge_ratio,
            max_num_fixels: config.max_num_fixels,
            calculate_lsq_dir: config.calculate_lsq_dir,
        })
    }

    /// Harmonic order this segmenter was built for.
    #[must_use]
    pub fn lmax(&self) -> usize {
        self.lmax
    }

    /// The direction set amplitudes are sampled onto.
    #[must_use]
    pub fn directions(&self) -> &Arc<DirectionSet> {
        &self.dirs
    }

    /// Segment one voxel.
    #[must_use]
    pub fn segment(&self, coefs: &[f64], voxel: [usize; 3]) -> VoxelLobes {
        debug_assert_eq!(coefs.len(), sh::n_coefs(self.lmax));

        if coefs[0] <= 0.0 || !coefs[0].is_finite() {
            return VoxelLobes::empty(voxel);
        }

        let values = self.transform.sh2amp(coefs);

        // Dixels in descending order of |amplitude|; the stable sort keeps
        // index order among exact ties.
        let mut dixels_in_order: Vec<(DirIndex, f64)> = (0..self.dirs.len() as DirIndex)
            .map(|i| (i, values[i as usize]))
            .collect();
        dixels_in_order.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));

        if dixels_in_order[0].1 <= 0.0 {
            return VoxelLobes::empty(voxel);
        }

        let mut lobes: Vec<FodLobe> = Vec::new();
        let can_add = |lobes: &[FodLobe], amplitude: f64, dixel: DirIndex, lobe: usize| -> bool {
            ((amplitude <= 0.0 && lobes[lobe].is_negative())
                || (amplitude > 0.0 && !lobes[lobe].is_negative()))
                && self.dirs.mask_adjacent(lobes[lobe].mask(), dixel)
        };

        let mut retrospective_assignments: Vec<DirIndex> = Vec::new();

        for &(dixel, amplitude) in &dixels_in_order {
            let adj_lobes: Vec<usize> = (0..lobes.len())
                .filter(|&l| can_add(&lobes, amplitude, dixel, l))
                .collect();

            if adj_lobes.is_empty() {
                lobes.push(FodLobe::new(
                    &self.dirs,
                    dixel,
                    amplitude,
                    self.dirs.weight(dixel),
                ));
            } else if adj_lobes.len() == 1 {
                lobes[adj_lobes[0]].add(&self.dirs, dixel, amplitude, self.dirs.weight(dixel));
            } else if amplitude.abs() / lobes[adj_lobes[adj_lobes.len() - 1]].max_peak_value()
                > self.lobe_merge_ratio
            {
                // The bridge amplitude is high relative to the smallest
                // adjoining peak: agglomerate all adjoining lobes.
                for j in 1..adj_lobes.len() {
                    let absorbed = lobes[adj_lobes[j]].clone();
                    lobes[adj_lobes[0]].merge(&absorbed);
                }
                lobes[adj_lobes[0]].add(&self.dirs, dixel, amplitude, self.dirs.weight(dixel));
                for &j in adj_lobes.iter().skip(1).rev() {
                    lobes.remove(j);
                }
            } else {
                retrospective_assignments.push(dixel);
            }
        }

        // Dixels that touched multiple lobes during segmentation are
        // assigned only now, so the assignment cannot influence subsequent
        // segmentation; each goes to the lobe with the maximal amplitude
        // among the dixel's neighbours (not the lobe with the higher peak),
        // preserving the seam between touching lobes.
        for dixel in retrospective_assignments {
            let amplitude = values[dixel as usize];
            let mut best_adjacent = 0.0;
            let mut target = None;
            for l in 0..lobes.len() {
                if can_add(&lobes, amplitude, dixel, l) {
                    let mut adjacent_amplitude = 0.0_f64;
                    for &d in self.dirs.adjacent(dixel) {
                        adjacent_amplitude =
                            adjacent_amplitude.max(lobes[l].values()[d as usize].abs());
                    }
                    if adjacent_amplitude > best_adjacent {
                        best_adjacent = adjacent_amplitude;
                        target = Some(l);
                    }
                }
            }
            if let Some(l) = target {
                lobes[l].add(&self.dirs, dixel, amplitude, self.dirs.weight(dixel));
            }
        }

        // Discard negative and sub-threshold lobes; refine surviving peaks.
        let mut retained: Vec<FodLobe> = Vec::with_capacity(lobes.len());
        for mut lobe in lobes {
            if lobe.is_negative() || lobe.integral() < self.integral_threshold {
                continue;
            }
            for peak_index in 0..lobe.num_peaks() {
                let seed = *lobe.peak_dir(peak_index);
                let (newton_dir, newton_value) =
                    sh::get_peak(coefs, self.lmax, &seed, &self.precomputer);
                if !newton_value.is_finite() || !newton_dir.iter().all(|v| v.is_finite()) {
                    continue;
                }
                // The refined direction must still be nearer to this peak
                // than to any other peak of the lobe, and must remain inside
                // the lobe's dixel mask; otherwise the refinement silently
                // merged into a different peak and is rejected.
                let mut max_dp = 0.0;
                let mut nearest = lobe.num_peaks();
                for j in 0..lobe.num_peaks() {
                    let dp = newton_dir.dot(lobe.peak_dir(j)).abs();
                    if dp > max_dp {
                        max_dp = dp;
                        nearest = j;
                    }
                }
                if nearest != peak_index {
                    continue;
                }
                let nearest_dir_index = self.dirs.assign(&newton_dir);
                if lobe.mask()[nearest_dir_index as usize] {
                    lobe.revise_peak(peak_index, newton_dir, newton_value);
                }
            }
            if lobe.max_peak_value() < self.peak_value_threshold {
                continue;
            }
            lobe.finalise();
            retained.push(lobe);
        }

        retained.sort_by(|a, b| b.integral().total_cmp(&a.integral()));
        if self.max_num_fixels > 0 && retained.len() > self.max_num_fixels {
            retained.truncate(self.max_num_fixels);
        }

        if self.calculate_lsq_dir {
            for lobe in &mut retained {
                self.compute_lsq_dir(lobe);
            }
        }

        let lut = build_lut(self.dirs.len(), &retained);
        VoxelLobes {
            voxel,
            lobes: retained,
            lut,
        }
    }

    /// Least-squares mean direction by tangent-plane averaging
    /// (Buss & Fillmore spherical averages), iterated to convergence.
    fn compute_lsq_dir(&self, lobe: &mut FodLobe) {
        let mut lsq_dir = *lobe.mean_dir();

        loop {
            let mut tx = Vector3::new(0.0, 0.0, 1.0).cross(&lsq_dir);
            if tx.norm_squared() < 1e-12 {
                tx = Vector3::new(0.0, 1.0, 0.0).cross(&lsq_dir);
            }
            let tx = tx.normalize();
            let ty = lsq_dir.cross(&tx).normalize();
            let tz = lsq_dir;

            let mut u = Vector3::zeros();
            let mut sum_weights = 0.0;
            for d in 0..self.dirs.len() as DirIndex {
                let value = lobe.values()[d as usize];
                if value == 0.0 {
                    continue;
                }
                let dir = self.dirs.direction(d);
                // Project onto the tangent plane at the current estimate.
                let mut p = Vector3::new(dir.dot(&tx), dir.dot(&ty), dir.dot(&tz));
                if p[2] < 0.0 {
                    p = -p;
                }
                p[2] = 0.0;

                let dp = lsq_dir.dot(dir).abs();
                let theta = if dp < 1.0 { dp.acos() } else { 0.0 };
                let log_transform = if theta != 0.0 { theta / theta.sin() } else { 1.0 };
                u += p * (value * log_transform);
                sum_weights += value;
            }

            u /= sum_weights;
            let r = u.norm();
            let exp_transform = if r != 0.0 { r.sin() / r } else { 1.0 };
            u *= exp_transform;

            // Back from the tangent plane to Euclidean space.
            let update = tx * u[0] + ty * u[1] + tz * u[2];
            lsq_dir = (lsq_dir + update).normalize();

            if update.norm() <= 1e-6 {
                break;
            }
        }

        lobe.set_lsq_dir(lsq_dir);
    }
}

/// Dense direction→lobe lookup table; the retained lobe count acts as the
/// "no lobe" sentinel.
fn build_lut(ndirs: usize, lobes: &[FodLobe]) -> Vec<u8> {
    if lobes.is_empty() {
        return Vec::new();
    }
    let sentinel = lobes.len().min(u8::MAX as usize) as u8;
    let mut lut = vec![sentinel; ndirs];
    for (offset, lobe) in lobes.iter().enumerate().take(u8::MAX as usize) {
        for (d, &in_mask) in lobe.mask().iter().enumerate() {
            if in_mask {
                lut[d] = offset as u8;
            }
        }
    }
    lut
}
