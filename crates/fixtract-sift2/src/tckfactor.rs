//! The SIFT2 coefficient optimiser.

use crate::line_search::{FixelTerm, LineSearchFunctor};
use crate::units::Units;
use crate::LineSearch;
use anyhow::{bail, Context, Result};
use fixtract_model::{Model, TrackContribution};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Default Tikhonov regularisation coefficient.
pub const DEFAULT_REG_TIKHONOV: f64 = 0.0;
/// Default total-variation regularisation coefficient.
pub const DEFAULT_REG_TV: f64 = 0.1;
/// Default minimum reconstructed-density fraction below which a fixel is
/// excluded from optimisation.
pub const DEFAULT_MIN_TD_FRAC: f64 = 0.1;
/// Default minimum number of iterations before testing convergence.
pub const DEFAULT_MIN_ITERS: usize = 10;
/// Default maximum number of iterations.
pub const DEFAULT_MAX_ITERS: usize = 1000;
/// Default maximum per-iteration coefficient step.
pub const DEFAULT_MAX_COEFF_STEP: f64 = 1.0;
/// Default minimum fractional cost decrease per iteration.
pub const DEFAULT_MIN_CF_DECREASE: f64 = 2.5e-5;

/// Tuning options for the optimiser.
#[derive(Clone, Copy, Debug)]
pub struct Sift2Config {
    /// Tikhonov regularisation coefficient λ_T.
    pub reg_tikhonov: f64,
    /// Total-variation regularisation coefficient λ_V.
    pub reg_tv: f64,
    /// Exclude fixels whose `μ·TD/FD` falls below this fraction.
    pub min_td_frac: f64,
    /// Minimum iterations before convergence may fire.
    pub min_iters: usize,
    /// Maximum iterations.
    pub max_iters: usize,
    /// Lower bound on any coefficient (−∞ allowed).
    pub min_coeff: f64,
    /// Upper bound on any coefficient (+∞ allowed).
    pub max_coeff: f64,
    /// Maximum coefficient change per iteration.
    pub max_coeff_step: f64,
    /// Convergence threshold on the fractional cost decrease.
    pub min_cf_decrease: f64,
    /// Line-search backend.
    pub line_search: LineSearch,
}

impl Default for Sift2Config {
    fn default() -> Self {
        Self {
            reg_tikhonov: DEFAULT_REG_TIKHONOV,
            reg_tv: DEFAULT_REG_TV,
            min_td_frac: DEFAULT_MIN_TD_FRAC,
            min_iters: DEFAULT_MIN_ITERS,
            max_iters: DEFAULT_MAX_ITERS,
            min_coeff: f64::NEG_INFINITY,
            max_coeff: f64::INFINITY,
            max_coeff_step: DEFAULT_MAX_COEFF_STEP,
            min_cf_decrease: DEFAULT_MIN_CF_DECREASE,
            line_search: LineSearch::Newton,
        }
    }
}

/// Per-streamline weighting-coefficient estimator over a mapped model.
pub struct TckFactor {
    model: Model,
    contributions: Vec<Option<TrackContribution>>,
    coefficients: Vec<f64>,
    // Algorithm-specific fixel columns, attached by index.
    orig_td: Vec<f64>,
    excluded: Vec<bool>,
    mean_coeff: Vec<f64>,
    config: Sift2Config,
    reg_multiplier_tikhonov: f64,
    reg_multiplier_tv: f64,
    csv_path: Option<PathBuf>,
}

impl TckFactor {
    /// Wrap a mapped model; coefficients start at zero (factor one), and
    /// streamlines that traverse no fixel are rejected outright
    /// (`c = −∞`).
    #[must_use]
    pub fn new(
        model: Model,
        contributions: Vec<Option<TrackContribution>>,
        config: Sift2Config,
    ) -> Self {
        let nfixels = model.nfixels();
        let coefficients = contributions
            .iter()
            .map(|c| match c {
                Some(c) if !c.is_empty() => 0.0,
                _ => f64::NEG_INFINITY,
            })
            .collect();
        let mut factor = Self {
            model,
            contributions,
            coefficients,
            orig_td: vec![0.0; nfixels],
            excluded: vec![false; nfixels],
            mean_coeff: vec![0.0; nfixels],
            config,
            reg_multiplier_tikhonov: 0.0,
            reg_multiplier_tv: 0.0,
            csv_path: None,
        };
        factor.set_reg_lambdas(config.reg_tikhonov, config.reg_tv);
        factor
    }

    /// Write a per-iteration CSV audit to this path.
    pub fn set_csv_path(&mut self, path: PathBuf) {
        self.csv_path = Some(path);
    }

    /// Borrow the underlying model.
    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The raw coefficients (one per streamline; `−∞` = rejected).
    #[must_use]
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Current proportionality coefficient.
    #[must_use]
    pub fn mu(&self) -> f64 {
        self.model.mu()
    }

    /// Scale the user-facing λ values by `Σw·FD² / n_streamlines` so they
    /// are dimensionless with respect to the data term.
    pub fn set_reg_lambdas(&mut self, lambda_tikhonov: f64, lambda_tv: f64) {
        let n = self.contributions.len().max(1);
        let a: f64 = (0..self.model.nfixels())
            .map(|i| self.model.fixels.weight[i] * self.model.fixels.fd[i].powi(2))
            .sum::<f64>()
            / n as f64;
        self.reg_multiplier_tikhonov = lambda_tikhonov * a;
        self.reg_multiplier_tv = lambda_tv * a;
    }

    /// Latch the freshly-mapped track densities before optimisation.
    pub fn store_orig_tds(&mut self) {
        self.orig_td.copy_from_slice(&self.model.fixels.td);
    }

    /// Exclude under-reconstructed fixels from the optimisation: any fixel
    /// with no streamline density, zero weight, or `μ·TD < frac·FD` drops
    /// out of the cost function and of every contribution list. The
    /// `excluded` latch is irreversible.
    pub fn remove_excluded_fixels(&mut self) {
        let mu = self.model.mu();
        let frac = self.config.min_td_frac;
        let mut n_excluded = 0usize;
        for i in 0..self.model.nfixels() {
            if self.excluded[i] {
                continue;
            }
            let td = self.model.fixels.td[i];
            let fd = self.model.fixels.fd[i];
            let weight = self.model.fixels.weight[i];
            if td <= 0.0 || weight <= 0.0 || mu * td < frac * fd {
                self.excluded[i] = true;
                self.model.fixels.weight[i] = 0.0;
                n_excluded += 1;
            }
        }
        tracing::info!(
            excluded = n_excluded,
            total = self.model.nfixels(),
            "fixels excluded from optimisation"
        );

        // Strip excluded fixels from every contribution and rebuild sums.
        let excluded = std::mem::take(&mut self.excluded);
        let weights = self.model.fixels.weight.clone();
        for contribution in self.contributions.iter_mut().flatten() {
            *contribution =
                contribution.retain_fixels(|f| !excluded[f as usize], &weights);
        }
        self.excluded = excluded;
        self.model.recompute_fd_sum();
        let td_sum: f64 = self
            .contributions
            .iter()
            .flatten()
            .map(TrackContribution::total_contribution)
            .sum();
        self.model.set_td_sum(td_sum);
    }

    /// Data term plus both regularisation terms.
    #[must_use]
    pub fn calc_cost(&self) -> (f64, f64, f64) {
        let data = self.model.calc_cost();
        let mut tikhonov = 0.0;
        let mut tv = 0.0;
        for (contribution, &c) in self.contributions.iter().zip(&self.coefficients) {
            let Some(contribution) = contribution else {
                continue;
            };
            if !c.is_finite() {
                continue;
            }
            tikhonov += self.reg_multiplier_tikhonov * c * c;
            for &(f, l) in contribution.entries() {
                let dc = c - self.mean_coeff[f as usize];
                tv += self.reg_multiplier_tv * f64::from(l) * dc * dc;
            }
        }
        (data, tikhonov, tv)
    }

    /// Refresh the per-fixel mean-coefficient cache (`Σ c·l / orig_TD`,
    /// zeroed where fewer than two streamlines pass through).
    fn update_mean_coeffs(&mut self) {
        self.mean_coeff.iter_mut().for_each(|m| *m = 0.0);
        for (contribution, &c) in self.contributions.iter().zip(&self.coefficients) {
            let Some(contribution) = contribution else {
                continue;
            };
            if !c.is_finite() {
                continue;
            }
            for &(f, l) in contribution.entries() {
                self.mean_coeff[f as usize] += c * f64::from(l);
            }
        }
        for i in 0..self.mean_coeff.len() {
            if self.orig_td[i] > 0.0 && self.model.fixels.count[i] >= 2 {
                self.mean_coeff[i] /= self.orig_td[i];
            } else {
                self.mean_coeff[i] = 0.0;
            }
        }
    }

    /// Recompute every fixel's TD (and the TD sum) from the coefficients;
    /// runs as a parallel fold over streamlines.
    fn update_fixel_tds(&mut self) {
        let nfixels = self.model.nfixels();
        let (td, count) = self
            .contributions
            .par_iter()
            .zip(self.coefficients.par_iter())
            .fold(
                || (vec![0.0_f64; nfixels], vec![0_u32; nfixels]),
                |(mut td, mut count), (contribution, &c)| {
                    if let Some(contribution) = contribution {
                        if c.is_finite() {
                            let factor = c.exp();
                            for &(f, l) in contribution.entries() {
                                td[f as usize] += factor * f64::from(l);
                                count[f as usize] += 1;
                            }
                        }
                    }
                    (td, count)
                },
            )
            .reduce(
                || (vec![0.0_f64; nfixels], vec![0_u32; nfixels]),
                |(mut ta, mut ca), (tb, cb)| {
                    for (a, b) in ta.iter_mut().zip(&tb) {
                        *a += b;
                    }
                    for (a, b) in ca.iter_mut().zip(&cb) {
                        *a += b;
                    }
                    (ta, ca)
                },
            );

        let td_sum: f64 = td
            .iter()
            .zip(&self.model.fixels.weight)
            .map(|(&t, &w)| t * w)
            .sum();
        self.model.fixels.td = td;
        self.model.fixels.count = count;
        self.model.set_td_sum(td_sum);
    }

    /// One streamline's line search; returns the new coefficient.
    fn line_search(&self, index: usize, mu: f64) -> f64 {
        let c0 = self.coefficients[index];
        let Some(contribution) = &self.contributions[index] else {
            return c0;
        };
        if !c0.is_finite() || contribution.is_empty() {
            return c0;
        }
        let factor0 = c0.exp();
        let terms: Vec<FixelTerm> = contribution
            .entries()
            .iter()
            .map(|&(f, l)| {
                let f = f as usize;
                let length = f64::from(l);
                FixelTerm {
                    weight: self.model.fixels.weight[f],
                    fd: self.model.fixels.fd[f],
                    td_other: (self.model.fixels.td[f] - factor0 * length).max(0.0),
                    length,
                    mean_coeff: self.mean_coeff[f],
                }
            })
            .collect();
        let functor = LineSearchFunctor::new(
            terms,
            mu,
            self.reg_multiplier_tikhonov,
            self.reg_multiplier_tv,
        );
        let lo = (c0 - self.config.max_coeff_step).max(self.config.min_coeff);
        let hi = (c0 + self.config.max_coeff_step).min(self.config.max_coeff);
        functor.minimise(c0, lo, hi, self.config.line_search)
    }

    /// Run the non-linear optimisation to convergence.
    pub fn estimate_factors(&mut self) -> Result<()> {
        let (data0, tik0, tv0) = self.calc_cost();
        let init_cf = data0 + tik0 + tv0;
        if !init_cf.is_finite() {
            bail!("cost function is non-finite at start of optimisation");
        }

        let mut csv = match &self.csv_path {
            Some(path) => {
                let f = File::create(path)
                    .with_context(|| format!("create CSV audit file {}", path.display()))?;
                let mut w = BufWriter::new(f);
                writeln!(w, "Iteration,Data,Tikhonov,TV,Total,Mu")?;
                writeln!(w, "0,{data0},{tik0},{tv0},{init_cf},{}", self.model.mu())?;
                Some(w)
            }
            None => None,
        };

        let mut previous_cf = init_cf;
        for iteration in 1..=self.config.max_iters {
            self.update_mean_coeffs();
            let mu = self.model.mu();

            let new_coefficients: Vec<f64> = (0..self.coefficients.len())
                .into_par_iter()
                .map(|i| self.line_search(i, mu))
                .collect();
            self.coefficients = new_coefficients;

            self.update_fixel_tds();

            let (data, tikhonov, tv) = self.calc_cost();
            let cf = data + tikhonov + tv;
            if !cf.is_finite() {
                bail!("cost function became non-finite during optimisation (iteration {iteration})");
            }
            if let Some(w) = csv.as_mut() {
                writeln!(
                    w,
                    "{iteration},{data},{tikhonov},{tv},{cf},{}",
                    self.model.mu()
                )?;
            }
            let fractional_decrease = (previous_cf - cf) / init_cf;
            tracing::info!(
                iteration,
                cost = cf,
                fractional_decrease,
                "SIFT2 iteration complete"
            );
            if iteration >= self.config.min_iters && fractional_decrease < self.config.min_cf_decrease
            {
                tracing::info!(iteration, "optimisation converged");
                break;
            }
            previous_cf = cf;
        }

        if let Some(mut w) = csv.take() {
            w.flush()?;
        }
        Ok(())
    }

    /// Linear one-shot estimation: each streamline's factor is the average
    /// along its length of `FD/TD`, normalised by μ (the AFCSA estimate).
    pub fn calc_afcsa(&mut self) {
        let mu = self.model.mu();
        let td = self.model.fixels.td.clone();
        let fd = self.model.fixels.fd.clone();
        for (contribution, c) in self.contributions.iter().zip(self.coefficients.iter_mut()) {
            let Some(contribution) = contribution else {
                *c = f64::NEG_INFINITY;
                continue;
            };
            if contribution.is_empty() {
                *c = f64::NEG_INFINITY;
                continue;
            }
            let mut sum_lengths = 0.0;
            let mut sum_volume = 0.0;
            for &(f, l) in contribution.entries() {
                let f = f as usize;
                if td[f] > 0.0 {
                    sum_volume += f64::from(l) * fd[f] / td[f];
                    sum_lengths += f64::from(l);
                }
            }
            *c = if sum_lengths > 0.0 {
                (sum_volume / (sum_lengths * mu)).ln()
            } else {
                f64::NEG_INFINITY
            };
        }
        self.update_fixel_tds();
        let (data, tikhonov, tv) = self.calc_cost();
        tracing::info!(
            cost = data + tikhonov + tv,
            mu = self.model.mu(),
            "cost function after AFCSA estimation"
        );
    }

    /// Shannon entropy of the streamline weight distribution, with the
    /// uniform-distribution maximum for reference.
    #[must_use]
    pub fn weight_entropy(&self) -> (f64, f64) {
        let factors: Vec<f64> = self
            .coefficients
            .iter()
            .filter(|c| c.is_finite())
            .map(|c| c.exp())
            .collect();
        let total: f64 = factors.iter().sum();
        if total <= 0.0 || factors.is_empty() {
            return (0.0, 0.0);
        }
        let entropy = -factors
            .iter()
            .filter(|&&f| f > 0.0)
            .map(|&f| {
                let p = f / total;
                p * p.ln()
            })
            .sum::<f64>();
        (entropy, (factors.len() as f64).ln())
    }

    /// Log the weight entropy at completion.
    pub fn report_entropy(&self) {
        let (entropy, maximum) = self.weight_entropy();
        tracing::info!(
            entropy,
            maximum,
            effective_streamlines = entropy.exp(),
            "streamline weight entropy"
        );
    }

    /// Write the weighting factors in the requested units. The units are
    /// recorded as a leading header comment and μ as a trailing one.
    pub fn output_factors(&self, path: &Path, units: Units) -> Result<()> {
        let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut w = BufWriter::new(f);
        writeln!(w, "# units: {units}")?;
        let scale = units.scale(self.model.mu(), self.model.grid().voxel_volume());
        for &c in &self.coefficients {
            let factor = if c.is_finite() { c.exp() * scale } else { 0.0 };
            writeln!(w, "{factor}")?;
        }
        writeln!(w, "# mu: {}", self.model.mu())?;
        w.flush()?;
        Ok(())
    }

    /// Write the raw coefficients (natural-log basis), one per line.
    pub fn output_coefficients(&self, path: &Path) -> Result<()> {
        let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut w = BufWriter::new(f);
        for &c in &self.coefficients {
            writeln!(w, "{c}")?;
        }
        w.flush()?;
        Ok(())
    }

    /// Write per-fixel debug data files (original TD and streamline count).
    pub fn output_td_images(&self, directory: &Path) -> Result<()> {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("creating debug output directory {}", directory.display()))?;
        fixtract_core::dataset::write_metric_file(
            &directory.join("orig_td_fixel.cbor"),
            &self.orig_td,
        )?;
        let counts: Vec<f64> = self.model.fixels.count.iter().map(|&c| f64::from(c)).collect();
        fixtract_core::dataset::write_metric_file(
            &directory.join("trackcount_fixel.cbor"),
            &counts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use fixtract_core::dataset::{DatasetWriter, IndexImage, LookupImage};
    use fixtract_core::{DirIndex, DirectionSet, VoxelGrid};
    use fixtract_model::ModelConfig;
    use fixtract_trace::generator::straight_track;
    use fixtract_trace::{Properties, TrackWriter};
    use nalgebra::Vector3;
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
        p.push(format!("fixtract_sift2_{name}_{nanos}"));
        p
    }

    /// A homogeneous map: `n` voxels along x, one +x fixel each (fd = 1),
    /// and one unit-length streamline through each fixel.
    fn homogeneous_factor(dir: &Path, n: usize, config: Sift2Config) -> TckFactor {
        let d = dirs();
        let x = Vector3::new(1.0, 0.0, 0.0);
        let mut table = vec![1u8; d.len()];
        for bin in 0..d.len() {
            if d.direction(bin as DirIndex).dot(&x).abs() > 0.9 {
                table[bin] = 0;
            }
        }
        let index = IndexImage {
            grid: VoxelGrid::new([n, 1, 1], [10.0; 3], [0.0; 3]),
            nfixels: n as u32,
            counts: vec![1; n],
            offsets: (0..n as u32).collect(),
        };
        let lookup = LookupImage {
            ndirs: d.len() as u32,
            tables: vec![table; n],
        };
        let directions = vec![x; n];
        let fd = vec![1.0; n];
        DatasetWriter {
            index: &index,
            directions: &directions,
            lookup: Some(&lookup),
            metrics: &[("fd", &fd)],
        }
        .write(dir)
        .unwrap();

        let tracks = dir.join("tracks.tck");
        let mut props = Properties::new();
        props.set("step_size", "0.5");
        let mut writer = TrackWriter::create(&tracks, &props).unwrap();
        for i in 0..n {
            let x0 = 10.0 * i as f64;
            writer
                .write(&straight_track(
                    &Vector3::new(x0 - 0.5, 0.0, 0.0),
                    &Vector3::new(x0 + 0.5, 0.0, 0.0),
                    0.5,
                ))
                .unwrap();
        }
        writer.finish().unwrap();

        let mut model = Model::open_dataset(dir, dirs(), &ModelConfig::default()).unwrap();
        let contributions = model.map_streamlines(&tracks).unwrap();
        let mut factor = TckFactor::new(model, contributions, config);
        factor.store_orig_tds();
        factor.remove_excluded_fixels();
        factor
    }

    #[test]
    fn linear_mode_on_homogeneous_map_yields_unit_factors() {
        let dir = tmp_dir("linear");
        let n = 6;
        let mut factor = homogeneous_factor(&dir, n, Sift2Config::default());
        assert_relative_eq!(factor.mu(), 1.0, epsilon = 1e-9);

        factor.calc_afcsa();
        for &c in factor.coefficients() {
            assert_relative_eq!(c.exp(), 1.0, epsilon = 1e-9);
        }
        let (entropy, maximum) = factor.weight_entropy();
        assert_relative_eq!(entropy, (n as f64).ln(), epsilon = 1e-9);
        assert_relative_eq!(entropy, maximum, epsilon = 1e-12);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn zero_step_limit_is_a_fixed_point() {
        let dir = tmp_dir("fixedpoint");
        let config = Sift2Config {
            max_coeff_step: 0.0,
            min_iters: 1,
            max_iters: 1,
            ..Sift2Config::default()
        };
        let mut factor = homogeneous_factor(&dir, 4, config);
        factor.estimate_factors().unwrap();
        for &c in factor.coefficients() {
            assert_eq!(c, 0.0);
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn optimisation_is_stable_at_a_perfect_fit() {
        let dir = tmp_dir("stable");
        let config = Sift2Config {
            min_iters: 1,
            max_iters: 20,
            ..Sift2Config::default()
        };
        let mut factor = homogeneous_factor(&dir, 4, config);
        factor.estimate_factors().unwrap();
        // The homogeneous map is already perfectly reconstructed; weights
        // stay at unity.
        for &c in factor.coefficients() {
            assert!(c.abs() < 1e-6, "coefficient drifted to {c}");
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn unit_conversion_is_voxel_volume() {
        let dir = tmp_dir("units");
        let mut factor = homogeneous_factor(&dir, 3, Sift2Config::default());
        factor.calc_afcsa();

        let mm2 = dir.join("weights_mm2.txt");
        let afd = dir.join("weights_afd.txt");
        factor.output_factors(&mm2, Units::Mm2).unwrap();
        factor.output_factors(&afd, Units::AfdPerMm).unwrap();

        let parse = |path: &Path| -> Vec<f64> {
            std::fs::read_to_string(path)
                .unwrap()
                .lines()
                .filter(|l| !l.starts_with('#'))
                .map(|l| l.parse().unwrap())
                .collect()
        };
        let volume = factor.model().grid().voxel_volume();
        for (a, b) in parse(&mm2).iter().zip(parse(&afd).iter()) {
            assert_relative_eq!(*a, b * volume, epsilon = 1e-9);
        }

        let text = std::fs::read_to_string(&mm2).unwrap();
        assert!(text.starts_with("# units: mm^2"));
        assert!(text.trim_end().ends_with(&format!("# mu: {}", factor.mu())));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn excluded_fixels_drop_out_of_contributions() {
        let dir = tmp_dir("excluded");
        // Two-fixel map where only the first fixel receives streamlines.
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
        .write(&dir)
        .unwrap();

        let tracks = dir.join("tracks.tck");
        let mut props = Properties::new();
        props.set("step_size", "0.5");
        let mut writer = TrackWriter::create(&tracks, &props).unwrap();
        writer
            .write(&straight_track(
                &Vector3::new(-0.5, 0.0, 0.0),
                &Vector3::new(0.5, 0.0, 0.0),
                0.5,
            ))
            .unwrap();
        writer.finish().unwrap();

        let mut model = Model::open_dataset(&dir, dirs(), &ModelConfig::default()).unwrap();
        let contributions = model.map_streamlines(&tracks).unwrap();
        let mut factor = TckFactor::new(model, contributions, Sift2Config::default());
        factor.store_orig_tds();
        factor.remove_excluded_fixels();

        // The unreached fixel is excluded; its weight is zeroed and the
        // data term sees only the reconstructed fixel.
        assert_eq!(factor.model().fixels.weight[1], 0.0);
        assert_relative_eq!(factor.mu(), 1.0, epsilon = 1e-9);
        let _ = std::fs::remove_dir_all(dir);
    }
}
