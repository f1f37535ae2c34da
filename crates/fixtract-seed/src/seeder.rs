//! The dynamic seeder proper.

use crate::atomic::{AtomicF32, AtomicF64, Latch};
use fixtract_core::tissue::Tissues;
use fixtract_core::FixelIndex;
use fixtract_model::{Model, TrackContribution};
use nalgebra::Vector3;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// TD sum at commencement, preventing a divide-by-zero in the first μ.
const INITIAL_TD_SUM: f64 = 1e-6;
/// Initial per-fixel seeding probability. Smaller is slower to start but
/// lets under-reconstructed fixels be seeded more densely later.
const INITIAL_PROB: f32 = 1e-3;
/// Fixels with `fd·weight` below this never have their probability
/// updated; their seeding statistics would be too noisy to act on.
const MIN_UPDATEABLE_INTEGRAL: f64 = 0.1;
/// Give up a single seed request after this many rejected samples.
const MAX_SEED_ATTEMPTS: u64 = 100_000;

/// A drawn seed: a scanner-space position and the fixel direction.
#[derive(Clone, Copy, Debug)]
pub struct Seed {
    /// Scanner-space seed position.
    pub position: Vector3<f64>,
    /// Direction of the fixel the seed was drawn from.
    pub direction: Vector3<f64>,
}

/// Per-fixel mutable seeding state, all lock-free.
struct SeedState {
    td: AtomicF64,
    latch: Latch,
    old_prob: AtomicF32,
    applied_prob: AtomicF32,
    track_count_at_last_update: AtomicU64,
    seed_count: AtomicU64,
}

impl SeedState {
    fn new() -> Self {
        Self {
            td: AtomicF64::new(0.0),
            latch: Latch::default(),
            old_prob: AtomicF32::new(INITIAL_PROB),
            applied_prob: AtomicF32::new(INITIAL_PROB),
            track_count_at_last_update: AtomicU64::new(0),
            seed_count: AtomicU64::new(0),
        }
    }
}

/// A fixel model extended with concurrent seeding state.
///
/// The seeder is simultaneously the seed source for the streamline
/// generator and the mapping target of the generated streamlines; each
/// accepted streamline drives down the seed probability of the fixels it
/// reconstructs.
pub struct DynamicSeeder {
    model: Model,
    state: Vec<SeedState>,
    voxel_of_fixel: Vec<u32>,
    updatable: Vec<bool>,
    target_count: u64,
    track_count: AtomicU64,
    attempts: AtomicU64,
    seeds: AtomicU64,
    td_sum: AtomicF64,
}

impl DynamicSeeder {
    /// Wrap a freshly-built model (zero TD) for dynamic seeding towards
    /// `target_count` streamlines.
    #[must_use]
    pub fn new(model: Model, target_count: u64) -> Self {
        let nfixels = model.nfixels();
        let mut voxel_of_fixel = vec![0u32; nfixels];
        for v in model.grid().voxels() {
            if let Some(map_voxel) = model.map_voxel(v) {
                let linear = model.grid().linear(v) as u32;
                for f in map_voxel.first..(map_voxel.first + map_voxel.count) {
                    voxel_of_fixel[f as usize] = linear;
                }
            }
        }
        // For small or unreliable fixels, the seeding probability is never
        // perturbed from its initial value.
        let updatable: Vec<bool> = (0..nfixels)
            .map(|i| model.fixels.fd[i] * model.fixels.weight[i] >= MIN_UPDATEABLE_INTEGRAL)
            .collect();
        let masked = updatable.iter().filter(|&&u| !u).count();
        tracing::debug!(nfixels, masked, target_count, "dynamic seeder initialised");
        Self {
            state: (0..nfixels).map(|_| SeedState::new()).collect(),
            voxel_of_fixel,
            updatable,
            model,
            target_count,
            track_count: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            seeds: AtomicU64::new(0),
            td_sum: AtomicF64::new(INITIAL_TD_SUM),
        }
    }

    /// Borrow the wrapped model.
    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Current proportionality coefficient against the atomic TD sum.
    #[must_use]
    pub fn mu(&self) -> f64 {
        self.model.fd_sum() / self.td_sum.load()
    }

    /// Streamlines accepted so far.
    #[must_use]
    pub fn track_count(&self) -> u64 {
        self.track_count.load(Ordering::Relaxed)
    }

    /// Current atomic TD of one fixel.
    #[must_use]
    pub fn fixel_td(&self, fixel: FixelIndex) -> f64 {
        self.state[fixel as usize].td.load()
    }

    /// Seeds drawn from one fixel so far.
    #[must_use]
    pub fn fixel_seed_count(&self, fixel: FixelIndex) -> u64 {
        self.state[fixel as usize].seed_count.load(Ordering::Relaxed)
    }

    /// Draw one seed, or `None` if the sampler exhausts its attempt budget
    /// (e.g. every fixel has converged to probability zero).
    pub fn get_seed<R: Rng>(&self, rng: &mut R) -> Option<Seed> {
        let nfixels = self.model.nfixels();
        if nfixels == 0 {
            return None;
        }
        let mut this_attempts = 0u64;
        loop {
            this_attempts += 1;
            if this_attempts > MAX_SEED_ATTEMPTS {
                return None;
            }
            let fixel = rng.random_range(0..nfixels);
            let state = &self.state[fixel];

            let seed_prob = if self.updatable[fixel] {
                state.latch.acquire();
                let seed_prob = self.derive_seed_prob(fixel);
                // Keep the latch until the applied probability is written,
                // so the quadruple moves atomically.
                let accepted = seed_prob > rng.random::<f32>();
                let seed = if accepted {
                    self.try_place_seed(fixel, rng)
                } else {
                    None
                };
                state.applied_prob.store(seed_prob);
                if seed.is_some() {
                    state.seed_count.fetch_add(1, Ordering::Relaxed);
                }
                state.latch.release();
                if let Some(seed) = seed {
                    self.attempts.fetch_add(this_attempts, Ordering::Relaxed);
                    self.seeds.fetch_add(1, Ordering::Relaxed);
                    return Some(seed);
                }
                continue;
            } else {
                state.old_prob.load()
            };

            if seed_prob > rng.random::<f32>() {
                if let Some(seed) = self.try_place_seed(fixel, rng) {
                    self.attempts.fetch_add(this_attempts, Ordering::Relaxed);
                    self.seeds.fetch_add(1, Ordering::Relaxed);
                    self.state[fixel].seed_count.fetch_add(1, Ordering::Relaxed);
                    return Some(seed);
                }
            }
        }
    }

    /// Current seed probability of a fixel (latch held by the caller).
    ///
    /// A fixel that has received no streamline density yet keeps its
    /// cumulative probability (force-seed regime); otherwise the
    /// probability shrinks as `μ·TD/FD` approaches one, with the target
    /// count progressively doubled so probabilities move faster early on.
    fn derive_seed_prob(&self, fixel: usize) -> f32 {
        let state = &self.state[fixel];
        let td = state.td.load();
        let ratio = self.mu() * td / self.model.fixels.fd[fixel];
        let current_trackcount = self.track_count.load(Ordering::Relaxed);
        let cumulative = self.cumulative_prob(fixel, current_trackcount);
        if td == 0.0 {
            return cumulative;
        }
        if ratio >= 1.0 || current_trackcount == 0 {
            return 0.0;
        }
        let s_zero = self.target_count.min(2 * current_trackcount) as f32;
        let current = current_trackcount as f32;
        let ratio = ratio as f32;
        let prob = cumulative * (s_zero - current * ratio) / (ratio * (s_zero - current));
        prob.clamp(0.0, 1.0)
    }

    /// Fold the applied probability into the cumulative (time-averaged)
    /// probability; latch held by the caller.
    fn cumulative_prob(&self, fixel: usize, track_count: u64) -> f32 {
        let state = &self.state[fixel];
        let old = state.old_prob.load();
        let last = state.track_count_at_last_update.load(Ordering::Relaxed);
        if track_count > last {
            let cumulative = ((last as f32 * old)
                + ((track_count - last) as f32 * state.applied_prob.load()))
                / track_count as f32;
            state.old_prob.store(cumulative);
            state
                .track_count_at_last_update
                .store(track_count, Ordering::Relaxed);
            cumulative
        } else {
            old
        }
    }

    /// Draw a uniform sub-voxel position for an accepted fixel and apply
    /// the optional anatomical admissibility check.
    fn try_place_seed<R: Rng>(&self, fixel: usize, rng: &mut R) -> Option<Seed> {
        let grid = self.model.grid();
        let v = grid.unlinear(self.voxel_of_fixel[fixel] as usize);
        let voxel_pos = Vector3::new(
            v[0] as f64 + rng.random::<f64>() - 0.5,
            v[1] as f64 + rng.random::<f64>() - 0.5,
            v[2] as f64 + rng.random::<f64>() - 0.5,
        );
        let mut position = grid.voxel_to_scanner(&voxel_pos);

        if let Some(act) = self.model.act() {
            if !self.check_act_seed(act, &mut position) {
                return None;
            }
            // The interface search may have moved the point; it must not
            // have left the fixel's voxel.
            let back = grid.scanner_to_voxel(&position);
            if fixtract_core::VoxelGrid::round(&back)
                != [v[0] as i64, v[1] as i64, v[2] as i64]
            {
                return None;
            }
        }

        Some(Seed {
            position,
            direction: self.model.fixels.dir[fixel],
        })
    }

    /// CSF seeds are rejected outright; white-matter-dominant positions are
    /// accepted as-is, and grey-matter-dominant positions are nudged
    /// towards the grey/white interface.
    fn check_act_seed(&self, act: &fixtract_core::Image4<f64>, position: &mut Vector3<f64>) -> bool {
        let sample = |p: &Vector3<f64>| {
            let v = self.model.grid().scanner_to_voxel(p);
            Tissues::sample(act, [v[0], v[1], v[2]])
        };
        let tissues = sample(position);
        if tissues.csf > tissues.wm + tissues.gm() {
            return false;
        }
        if tissues.wm > tissues.gm() {
            return true;
        }
        // Walk towards the grey/white interface (wm − gm = 0) along the
        // finite-difference gradient of the tissue contrast.
        let mut p = *position;
        let step = 0.1 * self.model.grid().min_spacing();
        for _ in 0..10 {
            let t = sample(&p);
            let contrast = t.wm - t.gm();
            if contrast.abs() < 0.1 {
                *position = p;
                return true;
            }
            let mut gradient = Vector3::zeros();
            for axis in 0..3 {
                let mut fwd = p;
                fwd[axis] += step;
                let mut bwd = p;
                bwd[axis] -= step;
                let tf = sample(&fwd);
                let tb = sample(&bwd);
                gradient[axis] = ((tf.wm - tf.gm()) - (tb.wm - tb.gm())) / (2.0 * step);
            }
            let norm2 = gradient.norm_squared();
            if norm2 < 1e-12 {
                return false;
            }
            p -= gradient * (contrast / norm2);
        }
        false
    }

    /// Ingest one generated streamline's mapped contribution.
    ///
    /// Returns `false` once the target track count has been reached, which
    /// signals the generator to wind down; the contribution is not applied
    /// in that case.
    pub fn add_contribution(&self, contribution: &TrackContribution) -> bool {
        if !contribution.is_empty() {
            let new_count = self.track_count.fetch_add(1, Ordering::Relaxed) + 1;
            if new_count >= self.target_count {
                return false;
            }
        }
        for &(fixel, length) in contribution.entries() {
            self.state[fixel as usize].td.fetch_add(f64::from(length));
        }
        self.td_sum.fetch_add(contribution.total_contribution());
        true
    }

    /// Log the sampling statistics accumulated over the run.
    pub fn report_statistics(&self) {
        tracing::info!(
            attempts = self.attempts.load(Ordering::Relaxed),
            seeds = self.seeds.load(Ordering::Relaxed),
            tracks = self.track_count.load(Ordering::Relaxed),
            "dynamic seeding sampling statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixtract_core::dataset::{DatasetWriter, IndexImage, LookupImage};
    use fixtract_core::{DirIndex, DirectionSet, VoxelGrid};
    use fixtract_model::ModelConfig;
    use rand::{rngs::StdRng, SeedableRng};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, OnceLock};

    fn dirs() -> Arc<DirectionSet> {
        static DIRS: OnceLock<Arc<DirectionSet>> = OnceLock::new();
        DIRS.get_or_init(|| Arc::new(DirectionSet::hemisphere_1281()))
            .clone()
    }

    fn tmp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("fixtract_seed_{name}_{nanos}"));
        p
    }

    /// Two-voxel dataset, one +x fixel per voxel, fd = 1 each.
    fn two_fixel_model(dir: &Path) -> Model {
        let d = dirs();
        let x = Vector3::new(1.0, 0.0, 0.0);
        let mut table = vec![1u8; d.len()];
        for bin in 0..d.len() {
            if d.direction(bin as DirIndex).dot(&x).abs() > 0.9 {
                table[bin] = 0;
            }
        }
        let index = IndexImage {
            grid: VoxelGrid::new([2, 1, 1], [10.0; 3], [0.0; 3]),
            nfixels: 2,
            counts: vec![1, 1],
            offsets: vec![0, 1],
        };
        let lookup = LookupImage {
            ndirs: d.len() as u32,
            tables: vec![table.clone(), table],
        };
        let fd = [1.0, 1.0];
        DatasetWriter {
            index: &index,
            directions: &[x, x],
            lookup: Some(&lookup),
            metrics: &[("fd", &fd)],
        }
        .write(dir)
        .unwrap();
        Model::open_dataset(dir, dirs(), &ModelConfig::default()).unwrap()
    }

    fn contribution(fixel: FixelIndex, length: f32) -> TrackContribution {
        TrackContribution::new(vec![(fixel, length)], f64::from(length), f64::from(length))
    }

    #[test]
    fn force_seed_regime_before_any_tracks() {
        let dir = tmp_dir("force");
        let seeder = DynamicSeeder::new(two_fixel_model(&dir), 1000);
        let mut rng = StdRng::seed_from_u64(3);
        // With all TDs zero every fixel keeps its initial probability, so a
        // seed is eventually drawn.
        let seed = seeder.get_seed(&mut rng).expect("seed in force regime");
        assert!((seed.direction - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-12);
        // Position lies inside one of the two voxels.
        assert!(seed.position[0] > -5.0 && seed.position[0] < 15.0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn seeding_biases_towards_under_reconstructed_fixels() {
        let dir = tmp_dir("bias");
        let seeder = DynamicSeeder::new(two_fixel_model(&dir), 10_000);
        // Fixel 0 heavily reconstructed, fixel 1 barely; both non-zero so
        // neither is in the force-seed regime.
        for _ in 0..180 {
            assert!(seeder.add_contribution(&contribution(0, 1.0)));
        }
        for _ in 0..20 {
            assert!(seeder.add_contribution(&contribution(1, 0.05)));
        }
        let ratio0 = seeder.mu() * seeder.fixel_td(0) / 1.0;
        let ratio1 = seeder.mu() * seeder.fixel_td(1) / 1.0;
        assert!(ratio0 > 1.0);
        assert!(ratio1 < 1.0);

        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..100_000 {
            let _ = seeder.get_seed(&mut rng);
        }
        // The over-reconstructed fixel's probability collapses to zero; the
        // empirical seed counts are inversely monotone in μ·TD/FD.
        assert!(seeder.fixel_seed_count(1) > seeder.fixel_seed_count(0));
        assert!(seeder.fixel_seed_count(1) > 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn target_count_terminates_mapping() {
        let dir = tmp_dir("target");
        let seeder = DynamicSeeder::new(two_fixel_model(&dir), 3);
        assert!(seeder.add_contribution(&contribution(0, 1.0)));
        assert!(seeder.add_contribution(&contribution(1, 1.0)));
        // The third accepted track reaches the target.
        assert!(!seeder.add_contribution(&contribution(0, 1.0)));
        assert_eq!(seeder.track_count(), 3);
        // Empty contributions never trip the counter.
        let empty = TrackContribution::new(Vec::new(), 0.0, 0.0);
        assert!(seeder.add_contribution(&empty));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn mu_tracks_atomic_td_sum() {
        let dir = tmp_dir("mu");
        let seeder = DynamicSeeder::new(two_fixel_model(&dir), 100);
        assert!(seeder.mu() > 1e5); // almost-zero TD sum
        seeder.add_contribution(&contribution(0, 1.0));
        seeder.add_contribution(&contribution(1, 1.0));
        // fd_sum = 2, td_sum ≈ 2.
        assert!((seeder.mu() - 1.0).abs() < 1e-5);
        let _ = std::fs::remove_dir_all(dir);
    }
}
