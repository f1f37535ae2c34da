//! The shared fixel table and model base.

use crate::contribution::TrackContribution;
use crate::mapper::{determine_upsample_ratio, TrackMapper};
use crate::weights::{self, WeightSource};
use anyhow::{bail, ensure, Context, Result};
use fixtract_core::dataset::Dataset;
use fixtract_core::tissue::Tissues;
use fixtract_core::{sh, DirIndex, DirectionSet, FixelIndex, Image3, Image4, VoxelGrid};
use fixtract_fmls::{segment_image, Segmenter, SegmenterConfig, VoxelLobes};
use fixtract_trace::{track_length, Track, TrackReader};
use nalgebra::Vector3;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which lobe direction becomes the fixel direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DirectionChoice {
    /// Amplitude-weighted mean direction (the default).
    #[default]
    Mean,
    /// Maximal peak direction.
    Peak,
    /// Least-squares (geodesic) mean direction.
    Lsq,
}

/// Model construction options shared by every front-end.
#[derive(Clone, Debug, Default)]
pub struct ModelConfig {
    /// Optional 5TT anatomical image.
    pub act_5tt: Option<PathBuf>,
    /// Processing-weight source; defaults to 5TT derivation when a 5TT
    /// image is supplied, unit weights otherwise.
    pub weights: Option<WeightSource>,
    /// Fixel direction choice for FOD-derived models.
    pub direction_choice: DirectionChoice,
    /// Explicit sub-voxel upsampling ratio for streamline mapping
    /// (otherwise auto-resolved per tractogram).
    pub upsample_ratio: Option<usize>,
}

/// Columnar per-fixel storage.
///
/// Algorithms attach their own columns by index rather than extending a
/// fixel struct, which keeps the hot loops contiguous.
#[derive(Clone, Debug, Default)]
pub struct FixelTable {
    /// Fixel direction (unit vectors).
    pub dir: Vec<Vector3<f64>>,
    /// Fibre density (FOD lobe integral, possibly tissue-scaled).
    pub fd: Vec<f64>,
    /// Accumulated streamline track density.
    pub td: Vec<f64>,
    /// Streamline count through the fixel.
    pub count: Vec<u32>,
    /// Processing weight in `[0, 1]`.
    pub weight: Vec<f64>,
}

impl FixelTable {
    /// Number of fixels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fd.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fd.is_empty()
    }

    fn push(&mut self, dir: Vector3<f64>, fd: f64, weight: f64) {
        self.dir.push(dir);
        self.fd.push(fd);
        self.td.push(0.0);
        self.count.push(0);
        self.weight.push(weight);
    }

    /// `μ·TD − FD` of one fixel.
    #[inline]
    #[must_use]
    pub fn diff(&self, i: FixelIndex, mu: f64) -> f64 {
        let i = i as usize;
        self.td[i] * mu - self.fd[i]
    }

    /// Weighted cost of one fixel: `w·(μ·TD − FD)²`.
    #[inline]
    #[must_use]
    pub fn cost(&self, i: FixelIndex, mu: f64) -> f64 {
        let d = self.diff(i, mu);
        self.weight[i as usize] * d * d
    }

    /// Weighted `∂cost/∂μ` of one fixel.
    #[inline]
    #[must_use]
    pub fn d_cost_d_mu(&self, i: FixelIndex, mu: f64) -> f64 {
        2.0 * self.td[i as usize] * self.diff(i, mu) * self.weight[i as usize]
    }

    /// Weighted cost with a streamline's length removed from TD.
    #[inline]
    #[must_use]
    pub fn cost_wo_track(&self, i: FixelIndex, mu: f64, length: f64) -> f64 {
        let i_us = i as usize;
        let d = (self.td[i_us] - length).max(0.0) * mu - self.fd[i_us];
        self.weight[i_us] * d * d
    }

    /// Weighted cost evaluated at an explicit TD value.
    #[inline]
    #[must_use]
    pub fn cost_manual_td(&self, i: FixelIndex, mu: f64, manual_td: f64) -> f64 {
        let d = manual_td * mu - self.fd[i as usize];
        self.weight[i as usize] * d * d
    }

    /// Quantisation scale of one fixel: the cost were TD to hold one extra
    /// streamline of this length at perfect reconstruction.
    #[inline]
    #[must_use]
    pub fn quantisation(&self, i: FixelIndex, mu: f64, length: f64) -> f64 {
        self.cost_manual_td(i, mu, self.fd[i as usize] / mu + length)
    }
}

/// Per-voxel record of the voxel→fixel index.
#[derive(Clone, Debug)]
pub struct MapVoxel {
    /// Index of the voxel's first fixel in the table.
    pub first: FixelIndex,
    /// Number of fixels in the voxel.
    pub count: u32,
    /// Dense per-direction offsets (`count` is the "no lobe" sentinel).
    pub lut: Vec<u8>,
}

impl MapVoxel {
    /// Fixel containing a direction bin, if any.
    #[must_use]
    pub fn dir2fixel(&self, dir: DirIndex) -> Option<FixelIndex> {
        let offset = u32::from(*self.lut.get(dir as usize)?);
        (offset < self.count).then(|| self.first + offset)
    }
}

/// The fixel map / model base shared by SIFT, SIFT2 and the dynamic seeder.
pub struct Model {
    grid: VoxelGrid,
    dirs: Arc<DirectionSet>,
    voxels: Vec<Option<MapVoxel>>,
    /// Per-fixel columns.
    pub fixels: FixelTable,
    fd_sum: f64,
    td_sum: f64,
    act: Option<Image4<f64>>,
    upsample_ratio: Option<usize>,
}

impl Model {
    /// Build a model by segmenting an FOD spherical-harmonic image.
    pub fn from_fod_image(
        fod: &Image4<f64>,
        dirs: Arc<DirectionSet>,
        seg_config: SegmenterConfig,
        config: &ModelConfig,
    ) -> Result<Self> {
        fod.validate().context("validating FOD image")?;
        let lmax = sh::lmax_for_ncoefs(fod.channels)
            .context("FOD image channel count is not an SH series")?;
        let segmenter = Segmenter::new(dirs.clone(), lmax, seg_config)?;

        let act = match &config.act_5tt {
            Some(path) => Some(weights::load_5tt(path, &fod.grid)?),
            None => None,
        };
        let source = resolve_weight_source(config, act.is_some())?;
        let proc = weights::voxel_weights(&source, &fod.grid, act.as_ref())?;

        let lobes = segment_image(fod, None, &segmenter)?;
        Ok(Self::from_lobes(
            fod.grid.clone(),
            dirs,
            &lobes,
            proc.as_ref(),
            act,
            config,
        ))
    }

    /// Assemble a model from per-voxel segmentation results (grid order).
    #[must_use]
    pub fn from_lobes(
        grid: VoxelGrid,
        dirs: Arc<DirectionSet>,
        lobes: &[VoxelLobes],
        proc: Option<&Image3<f64>>,
        act: Option<Image4<f64>>,
        config: &ModelConfig,
    ) -> Self {
        let mut voxels: Vec<Option<MapVoxel>> = vec![None; grid.nvoxels()];
        let mut fixels = FixelTable::default();
        let mut fd_sum = 0.0;

        for voxel_lobes in lobes {
            if voxel_lobes.lobes.is_empty() {
                continue;
            }
            let weight = proc.map_or(1.0, |p| *p.get(voxel_lobes.voxel));
            let map_voxel = MapVoxel {
                first: fixels.len() as FixelIndex,
                count: voxel_lobes.lobes.len() as u32,
                lut: voxel_lobes.lut.clone(),
            };
            voxels[grid.linear(voxel_lobes.voxel)] = Some(map_voxel);
            for lobe in &voxel_lobes.lobes {
                let dir = match config.direction_choice {
                    DirectionChoice::Mean => *lobe.mean_dir(),
                    DirectionChoice::Peak => *lobe.peak_dir(0),
                    DirectionChoice::Lsq => lobe.lsq_dir().copied().unwrap_or(*lobe.mean_dir()),
                };
                fixels.push(dir, lobe.integral(), weight);
                fd_sum += lobe.integral() * weight;
            }
        }

        tracing::info!(
            nfixels = fixels.len(),
            fd_sum,
            "fixel model assembled from FOD segmentation"
        );
        Self {
            grid,
            dirs,
            voxels,
            fixels,
            fd_sum,
            td_sum: 0.0,
            act,
            upsample_ratio: config.upsample_ratio,
        }
    }

    /// Open a model from an on-disk fixel dataset.
    ///
    /// `fd_path` is either the fibre-density data file inside a dataset
    /// directory, or the directory itself (in which case the `fd` metric is
    /// used).
    pub fn open_dataset(
        fd_path: &Path,
        dirs: Arc<DirectionSet>,
        config: &ModelConfig,
    ) -> Result<Self> {
        let (directory, metric): (&Path, String) = if fd_path.is_dir() {
            (fd_path, "fd".to_owned())
        } else {
            let stem = fd_path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| anyhow::anyhow!("cannot derive metric name from {}", fd_path.display()))?;
            let parent = fd_path
                .parent()
                .ok_or_else(|| anyhow::anyhow!("{} has no parent directory", fd_path.display()))?;
            (parent, stem.to_owned())
        };

        let dataset = Dataset::open(directory)?;
        let fd = dataset.read_metric(&metric)?;
        for (i, &value) in fd.iter().enumerate() {
            ensure!(
                value.is_finite() && value >= 0.0,
                "fibre density of fixel {i} is {value}; densities must be finite and non-negative"
            );
        }

        let grid = dataset.index.grid.clone();
        let act = match &config.act_5tt {
            Some(path) => Some(weights::load_5tt(path, &grid)?),
            None => None,
        };
        let source = resolve_weight_source(config, act.is_some())?;

        // Per-fixel weights: either a fixel data file, or voxel-wise values
        // spread over each voxel's fixels.
        let nfixels = dataset.nfixels();
        let weight: Vec<f64> = match &source {
            WeightSource::FixelFile(path) => {
                let values = fixtract_core::dataset::read_metric_file(path, nfixels)?;
                for (i, &w) in values.iter().enumerate() {
                    ensure!(
                        w.is_finite() && (0.0..=1.0).contains(&w),
                        "fixel-wise model weight {w} of fixel {i} outside [0, 1]"
                    );
                }
                values
            }
            _ => match weights::voxel_weights(&source, &grid, act.as_ref())? {
                Some(proc) => {
                    let mut weight = vec![1.0; nfixels];
                    for v in grid.voxels() {
                        let (first, count) = dataset.index.voxel(v);
                        let w = *proc.get(v);
                        for f in first..(first + count) {
                            weight[f as usize] = w;
                        }
                    }
                    weight
                }
                None => vec![1.0; nfixels],
            },
        };

        // Voxel→fixel lookup: taken from the dataset where present,
        // otherwise derived by nearest fixel direction.
        let has_lookup = dataset.lookup.is_some();
        if !has_lookup {
            tracing::warn!(
                "fixel dataset {} carries no lookup image; \
                 deriving direction assignment from fixel directions",
                directory.display()
            );
        }
        let mut voxels: Vec<Option<MapVoxel>> = vec![None; grid.nvoxels()];
        for v in grid.voxels() {
            let (first, count) = dataset.index.voxel(v);
            if count == 0 {
                continue;
            }
            let lut = match &dataset.lookup {
                Some(lookup) => lookup.tables[grid.linear(v)].clone(),
                None => nearest_fixel_lut(&dirs, &dataset.directions[first as usize..(first + count) as usize]),
            };
            voxels[grid.linear(v)] = Some(MapVoxel { first, count, lut });
        }

        let mut fixels = FixelTable::default();
        let mut fd_sum = 0.0;
        for i in 0..nfixels {
            fixels.push(dataset.directions[i], fd[i], weight[i]);
            fd_sum += fd[i] * weight[i];
        }

        tracing::info!(
            nfixels,
            fd_sum,
            source = %directory.display(),
            "fixel model opened from dataset"
        );
        Ok(Self {
            grid,
            dirs,
            voxels,
            fixels,
            fd_sum,
            td_sum: 0.0,
            act,
            upsample_ratio: config.upsample_ratio,
        })
    }

    /// Voxel grid of the model.
    #[must_use]
    pub fn grid(&self) -> &VoxelGrid {
        &self.grid
    }

    /// Direction set shared with the mapper.
    #[must_use]
    pub fn dirs(&self) -> &Arc<DirectionSet> {
        &self.dirs
    }

    /// The loaded 5TT image, when present.
    #[must_use]
    pub fn act(&self) -> Option<&Image4<f64>> {
        self.act.as_ref()
    }

    /// Number of fixels.
    #[must_use]
    pub fn nfixels(&self) -> usize {
        self.fixels.len()
    }

    /// Per-voxel record, if the voxel holds fixels.
    #[must_use]
    pub fn map_voxel(&self, v: [usize; 3]) -> Option<&MapVoxel> {
        self.voxels[self.grid.linear(v)].as_ref()
    }

    /// Fixel containing a (voxel, direction) pair, if any.
    #[must_use]
    pub fn dix2fixel(&self, voxel: [usize; 3], dir: DirIndex) -> Option<FixelIndex> {
        self.map_voxel(voxel).and_then(|mv| mv.dir2fixel(dir))
    }

    /// ΣFD·w over all fixels.
    #[must_use]
    pub fn fd_sum(&self) -> f64 {
        self.fd_sum
    }

    /// ΣTD·w over all fixels.
    #[must_use]
    pub fn td_sum(&self) -> f64 {
        self.td_sum
    }

    /// The proportionality coefficient `μ = ΣFD·w / ΣTD·w`.
    #[must_use]
    pub fn mu(&self) -> f64 {
        self.fd_sum / self.td_sum
    }

    /// Adjust the TD sum directly (SIFT removal bookkeeping).
    pub fn add_td_sum(&mut self, delta: f64) {
        self.td_sum += delta;
    }

    /// Replace the TD sum (SIFT2 recomputation).
    pub fn set_td_sum(&mut self, value: f64) {
        self.td_sum = value;
    }

    /// Recompute ΣFD·w after fibre densities or weights changed.
    pub fn recompute_fd_sum(&mut self) {
        self.fd_sum = (0..self.fixels.len())
            .map(|i| self.fixels.fd[i] * self.fixels.weight[i])
            .sum();
    }

    /// Scale fibre densities down by the grey-matter fraction heuristic
    /// (`fd *= 1 − cgm − 0.5·sgm`); requires a loaded 5TT image.
    pub fn scale_fds_by_gm(&mut self) -> Result<()> {
        let Some(act) = &self.act else {
            bail!("cannot scale fibre densities by GM fraction; no 5TT image data provided");
        };
        for v in self.grid.voxels() {
            let Some(map_voxel) = &self.voxels[self.grid.linear(v)] else {
                continue;
            };
            let tissues = Tissues::from_channels(act.voxel(v));
            let multiplier = 1.0 - tissues.cgm - 0.5 * tissues.sgm;
            for f in map_voxel.first..(map_voxel.first + map_voxel.count) {
                self.fixels.fd[f as usize] *= multiplier;
            }
        }
        self.recompute_fd_sum();
        Ok(())
    }

    /// The global cost function `C(μ) = Σᵢ wᵢ·(μ·TDᵢ − FDᵢ)²`.
    #[must_use]
    pub fn calc_cost(&self) -> f64 {
        let mu = self.mu();
        (0..self.fixels.len() as FixelIndex)
            .map(|i| self.fixels.cost(i, mu))
            .sum()
    }

    /// Map one streamline into a [`TrackContribution`].
    #[must_use]
    pub fn map_track(&self, mapper: &TrackMapper, track: &Track) -> TrackContribution {
        let mut per_fixel: std::collections::HashMap<FixelIndex, f64> =
            std::collections::HashMap::new();
        for segment in mapper.map(track) {
            if let Some(fixel) = self.dix2fixel(segment.voxel, segment.dir) {
                *per_fixel.entry(fixel).or_insert(0.0) += segment.length;
            }
        }
        let mut entries: Vec<(FixelIndex, f32)> = per_fixel
            .into_iter()
            .map(|(f, l)| (f, l as f32))
            .collect();
        entries.sort_by_key(|&(f, _)| f);
        let total_contribution = entries
            .iter()
            .map(|&(f, l)| self.fixels.weight[f as usize] * f64::from(l))
            .sum();
        TrackContribution::new(entries, total_contribution, track_length(track))
    }

    /// Apply one streamline's contribution to the TD columns and sums.
    pub fn apply_contribution(&mut self, contribution: &TrackContribution) {
        for &(f, l) in contribution.entries() {
            self.fixels.td[f as usize] += f64::from(l);
            self.fixels.count[f as usize] += 1;
        }
        self.td_sum += contribution.total_contribution();
    }

    /// Undo one streamline's length in a single fixel (SIFT removal); TD is
    /// floored at zero to absorb floating-point drift.
    pub fn remove_track_length(&mut self, fixel: FixelIndex, length: f64) {
        let i = fixel as usize;
        self.fixels.td[i] = (self.fixels.td[i] - length).max(0.0);
        self.fixels.count[i] = self.fixels.count[i].saturating_sub(1);
    }

    /// Map an entire tractogram, updating the model and returning the
    /// per-streamline contributions (indexed by streamline).
    pub fn map_streamlines(&mut self, path: &Path) -> Result<Vec<Option<TrackContribution>>> {
        let mut reader = TrackReader::open(path)?;
        let declared = reader.properties().count();
        let step_size = reader.properties().step_size();

        let mut tracks: Vec<Track> = Vec::with_capacity(declared.unwrap_or(0) as usize);
        while let Some(track) = reader.next_track()? {
            tracks.push(track);
        }
        if tracks.is_empty() {
            bail!(
                "cannot map streamlines: track file \"{}\" is empty",
                path.display()
            );
        }

        // Auto-resolve the upsampling ratio: explicit configuration wins,
        // then the header step size, then the observed maximum step.
        let step = step_size.unwrap_or_else(|| {
            tracks
                .iter()
                .flat_map(|t| t.windows(2))
                .map(|w| (w[1] - w[0]).norm())
                .fold(0.0, f64::max)
        });
        let ratio = self
            .upsample_ratio
            .unwrap_or_else(|| determine_upsample_ratio(&self.grid, step, 0.1));
        let mapper = TrackMapper::new(self.grid.clone(), self.dirs.clone(), ratio);
        tracing::info!(
            count = tracks.len(),
            upsample_ratio = ratio,
            "mapping streamlines onto fixel model"
        );

        let contributions: Vec<Option<TrackContribution>> = tracks
            .par_iter()
            .map(|track| Some(self.map_track(&mapper, track)))
            .collect();

        for contribution in contributions.iter().flatten() {
            self.apply_contribution(contribution);
        }

        tracing::info!(
            mu = self.mu(),
            "proportionality coefficient after streamline mapping"
        );
        Ok(contributions)
    }
}

/// Default weight source: 5TT derivation when a 5TT image is present,
/// otherwise unit weights.
fn resolve_weight_source(config: &ModelConfig, have_act: bool) -> Result<WeightSource> {
    Ok(match &config.weights {
        Some(source) => source.clone(),
        None if have_act => WeightSource::FiveTt,
        None => WeightSource::Unit,
    })
}

/// Fallback per-voxel lookup table assigning each direction bin to the
/// angularly nearest of the voxel's fixels.
fn nearest_fixel_lut(dirs: &DirectionSet, fixel_dirs: &[Vector3<f64>]) -> Vec<u8> {
    let mut lut = vec![0u8; dirs.len()];
    for d in 0..dirs.len() {
        let dir = dirs.direction(d as DirIndex);
        let mut best = 0usize;
        let mut best_dp = -1.0;
        for (f, fd) in fixel_dirs.iter().enumerate().take(u8::MAX as usize) {
            let dp = dir.dot(fd).abs();
            if dp > best_dp {
                best_dp = dp;
                best = f;
            }
        }
        lut[d] = best as u8;
    }
    lut
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixtract_core::dataset::{DatasetWriter, IndexImage, LookupImage};
    use fixtract_trace::generator::straight_track;
    use fixtract_trace::{Properties, TrackWriter};
    use std::sync::OnceLock;

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
        p.push(format!("fixtract_model_{name}_{nanos}"));
        p
    }

    /// One-voxel dataset holding a single fixel along +x with the given fd.
    fn single_fixel_dataset(dir: &Path, fd_value: f64) {
        let d = dirs();
        let x = Vector3::new(1.0, 0.0, 0.0);
        let x_bin = d.assign(&x);
        let mut tables = vec![vec![1u8; d.len()]];
        tables[0][x_bin as usize] = 0;
        // Make the whole x-ish cone map to the fixel so straight x-aligned
        // tracks land in it.
        for bin in 0..d.len() {
            if d.direction(bin as DirIndex).dot(&x).abs() > 0.9 {
                tables[0][bin] = 0;
            }
        }
        let index = IndexImage {
            grid: VoxelGrid::isotropic([1, 1, 1], 10.0),
            nfixels: 1,
            counts: vec![1],
            offsets: vec![0],
        };
        let lookup = LookupImage {
            ndirs: d.len() as u32,
            tables,
        };
        let fd = [fd_value];
        DatasetWriter {
            index: &index,
            directions: &[x],
            lookup: Some(&lookup),
            metrics: &[("fd", &fd)],
        }
        .write(dir)
        .unwrap();
    }

    fn write_tracks(path: &Path, tracks: &[Track]) {
        let mut props = Properties::new();
        props.set("step_size", "0.5");
        let mut writer = TrackWriter::create(path, &props).unwrap();
        for t in tracks {
            writer.write(t).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn single_voxel_model_matches_hand_computation() {
        let dir = tmp_dir("single");
        single_fixel_dataset(&dir, 1.0);
        let model_path = dir.clone();
        let mut model =
            Model::open_dataset(&model_path, dirs(), &ModelConfig::default()).unwrap();
        assert_eq!(model.nfixels(), 1);
        assert!((model.fd_sum() - 1.0).abs() < 1e-12);

        // Two x-aligned streamlines of lengths 1 and 2, inside the voxel.
        let tracks_path = dir.join("tracks.tck");
        let t1 = straight_track(
            &Vector3::new(-0.5, 0.0, 0.0),
            &Vector3::new(0.5, 0.0, 0.0),
            0.5,
        );
        let t2 = straight_track(
            &Vector3::new(-1.0, 0.0, 0.0),
            &Vector3::new(1.0, 0.0, 0.0),
            0.5,
        );
        write_tracks(&tracks_path, &[t1, t2]);

        let contributions = model.map_streamlines(&tracks_path).unwrap();
        assert_eq!(contributions.len(), 2);
        assert!((model.fixels.td[0] - 3.0).abs() < 1e-6);
        assert_eq!(model.fixels.count[0], 2);
        assert!((model.mu() - 1.0 / 3.0).abs() < 1e-6);
        // Perfect reconstruction at μ = 1/3: zero cost.
        assert!(model.calc_cost() < 1e-12);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn mu_is_invariant_to_streamline_order() {
        let dir = tmp_dir("order");
        single_fixel_dataset(&dir, 2.0);

        let t1 = straight_track(
            &Vector3::new(-2.0, 0.0, 0.0),
            &Vector3::new(2.0, 0.0, 0.0),
            0.5,
        );
        let t2 = straight_track(
            &Vector3::new(-1.0, 1.0, 0.0),
            &Vector3::new(1.5, 1.0, 0.0),
            0.5,
        );
        let t3 = straight_track(
            &Vector3::new(0.0, -1.0, 0.0),
            &Vector3::new(1.0, -1.0, 0.0),
            0.5,
        );

        let forward = dir.join("fwd.tck");
        let reverse = dir.join("rev.tck");
        write_tracks(&forward, &[t1.clone(), t2.clone(), t3.clone()]);
        write_tracks(&reverse, &[t3, t2, t1]);

        let mut m1 = Model::open_dataset(&dir, dirs(), &ModelConfig::default()).unwrap();
        m1.map_streamlines(&forward).unwrap();
        let mut m2 = Model::open_dataset(&dir, dirs(), &ModelConfig::default()).unwrap();
        m2.map_streamlines(&reverse).unwrap();
        assert!((m1.mu() - m2.mu()).abs() < 1e-9);
        assert!((m1.td_sum() - m2.td_sum()).abs() < 1e-9);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_tractogram_is_fatal() {
        let dir = tmp_dir("empty");
        single_fixel_dataset(&dir, 1.0);
        let tracks_path = dir.join("tracks.tck");
        write_tracks(&tracks_path, &[]);
        let mut model = Model::open_dataset(&dir, dirs(), &ModelConfig::default()).unwrap();
        assert!(model.map_streamlines(&tracks_path).is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn mapper_conservation_within_fixel_voxels() {
        let dir = tmp_dir("conserve");
        single_fixel_dataset(&dir, 1.0);
        let model = Model::open_dataset(&dir, dirs(), &ModelConfig::default()).unwrap();
        let mapper = TrackMapper::new(model.grid().clone(), dirs(), 1);

        // 4 mm inside the voxel (x from -2 to 2); all of it maps to the
        // only fixel because the lookup covers the x cone.
        let track = straight_track(
            &Vector3::new(-2.0, 0.0, 0.0),
            &Vector3::new(2.0, 0.0, 0.0),
            0.5,
        );
        let contribution = model.map_track(&mapper, &track);
        let mapped: f64 = contribution
            .entries()
            .iter()
            .map(|&(_, l)| f64::from(l))
            .sum();
        assert!((mapped - 4.0).abs() < 1e-6);
        assert!((contribution.total_length() - 4.0).abs() < 1e-6);
        let _ = std::fs::remove_dir_all(dir);
    }
}
