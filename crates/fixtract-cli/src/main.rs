//! `fixtract`: tractogram quantification CLI.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fixtract_core::dataset::{DatasetWriter, IndexImage, LookupImage};
use fixtract_core::{io, sh, DirectionSet, Image3, Image4};
use fixtract_fmls::{segment_image, Segmenter, SegmenterConfig};
use fixtract_model::{DirectionChoice, Model, ModelConfig, WeightSource};
use fixtract_sift::Sifter;
use fixtract_sift2::{LineSearch, Sift2Config, TckFactor, Units};
use nalgebra::Vector3;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "fixtract",
    about = "Diffusion MRI tractogram quantification (FOD segmentation, SIFT, SIFT2)",
    version = env!("CARGO_PKG_VERSION"),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Args, Debug, Clone)]
struct FmlsOptions {
    /// Threshold on the absolute integral of positive FOD lobes
    #[arg(long, default_value_t = fixtract_fmls::segmenter::DEFAULT_INTEGRAL_THRESHOLD)]
    fmls_integral: f64,

    /// Threshold on the peak amplitude of positive FOD lobes
    #[arg(long, default_value_t = fixtract_fmls::segmenter::DEFAULT_PEAK_VALUE_THRESHOLD)]
    fmls_peak_value: f64,

    /// Disable all FOD lobe thresholding; every positive lobe is retained
    #[arg(long)]
    fmls_no_thresholds: bool,

    /// Bridge-to-peak amplitude ratio above which touching lobes merge
    #[arg(long, default_value_t = fixtract_fmls::segmenter::DEFAULT_LOBE_MERGE_RATIO)]
    fmls_lobe_merge_ratio: f64,

    /// Keep at most this many fixels per voxel (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    max_num_fixels: usize,

    /// Compute least-squares (geodesic) mean directions
    #[arg(long)]
    lsq_directions: bool,
}

impl FmlsOptions {
    fn to_config(&self) -> SegmenterConfig {
        SegmenterConfig {
            integral_threshold: self.fmls_integral,
            peak_value_threshold: self.fmls_peak_value,
            lobe_merge_ratio: self.fmls_lobe_merge_ratio,
            max_num_fixels: self.max_num_fixels,
            calculate_lsq_dir: self.lsq_directions,
            disable_all_thresholds: self.fmls_no_thresholds,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
struct ModelOptions {
    /// 5TT anatomical image for model-weight derivation
    #[arg(long)]
    act: Option<PathBuf>,

    /// Model weights as a per-fixel data file
    #[arg(long, conflicts_with = "weights_image")]
    model_weights: Option<PathBuf>,

    /// Model weights as a voxel image
    #[arg(long)]
    weights_image: Option<PathBuf>,

    /// Scale fibre densities down by the grey-matter fraction (requires --act)
    #[arg(long)]
    fd_scale_gm: bool,

    /// Explicit sub-voxel upsampling ratio for streamline mapping
    #[arg(long)]
    upsample: Option<usize>,

    /// Directory for debugging outputs of the fixel model state
    #[arg(long)]
    output_debug: Option<PathBuf>,
}

impl ModelOptions {
    fn to_config(&self) -> ModelConfig {
        let weights = if let Some(path) = &self.model_weights {
            Some(WeightSource::FixelFile(path.clone()))
        } else {
            self.weights_image
                .as_ref()
                .map(|path| WeightSource::VoxelImage(path.clone()))
        };
        ModelConfig {
            act_5tt: self.act.clone(),
            weights,
            direction_choice: DirectionChoice::Mean,
            upsample_ratio: self.upsample,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Segment an FOD spherical-harmonic image into a fixel dataset
    Fod2fixel {
        /// Input FOD SH image (.json/.cbor)
        in_fod: PathBuf,
        /// Output fixel dataset directory
        out_dir: PathBuf,

        /// Optional voxel mask image; zero voxels are skipped
        #[arg(long)]
        mask: Option<PathBuf>,

        #[command(flatten)]
        fmls: FmlsOptions,
    },

    /// Filter a tractogram so streamline densities match fibre densities
    Sift {
        /// Input track file
        in_tracks: PathBuf,
        /// Fibre-density fixel data file (or fixel dataset directory)
        in_fd: PathBuf,
        /// Output filtered track file
        out_tracks: PathBuf,

        /// Terminate once this many streamlines remain
        #[arg(long)]
        term_number: Option<usize>,

        /// Terminate on the cost / streamline-density decrease ratio
        #[arg(long)]
        term_ratio: Option<f64>,

        /// Terminate once the proportionality coefficient exceeds this
        #[arg(long)]
        term_mu: Option<f64>,

        /// Construct the model but do not filter
        #[arg(long)]
        nofilter: bool,

        /// Emit intermediate filtered tractograms at these remaining counts
        #[arg(long, value_delimiter = ',')]
        output_at_counts: Vec<usize>,

        /// Per-iteration CSV audit output
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Write the final proportionality coefficient to a text file
        #[arg(long)]
        out_mu: Option<PathBuf>,

        /// Write the binary per-streamline selection mask to a text file
        #[arg(long)]
        out_selection: Option<PathBuf>,

        #[command(flatten)]
        model: ModelOptions,
    },

    /// Estimate per-streamline weighting factors (SIFT2)
    Sift2 {
        /// Input track file
        in_tracks: PathBuf,
        /// Input FOD SH image (.json/.cbor)
        in_fod: PathBuf,
        /// Output per-streamline weights text file
        out_weights: PathBuf,

        /// Physical units of the output weights
        #[arg(long)]
        units: Option<String>,

        /// Tikhonov regularisation coefficient
        #[arg(long, default_value_t = fixtract_sift2::tckfactor::DEFAULT_REG_TIKHONOV)]
        reg_tikhonov: f64,

        /// Total-variation regularisation coefficient
        #[arg(long, default_value_t = fixtract_sift2::tckfactor::DEFAULT_REG_TV)]
        reg_tv: f64,

        /// Exclude fixels reconstructed below this density fraction
        #[arg(long, default_value_t = fixtract_sift2::tckfactor::DEFAULT_MIN_TD_FRAC)]
        min_td_frac: f64,

        /// Minimum iterations before testing convergence
        #[arg(long, default_value_t = fixtract_sift2::tckfactor::DEFAULT_MIN_ITERS)]
        min_iters: usize,

        /// Maximum iterations
        #[arg(long, default_value_t = fixtract_sift2::tckfactor::DEFAULT_MAX_ITERS)]
        max_iters: usize,

        /// Minimum weighting factor per streamline
        #[arg(long, conflicts_with = "min_coeff")]
        min_factor: Option<f64>,

        /// Minimum weighting coefficient per streamline
        #[arg(long)]
        min_coeff: Option<f64>,

        /// Maximum weighting factor per streamline
        #[arg(long, conflicts_with = "max_coeff")]
        max_factor: Option<f64>,

        /// Maximum weighting coefficient per streamline
        #[arg(long)]
        max_coeff: Option<f64>,

        /// Maximum coefficient change per iteration
        #[arg(long, default_value_t = fixtract_sift2::tckfactor::DEFAULT_MAX_COEFF_STEP)]
        max_coeff_step: f64,

        /// Convergence threshold on the fractional cost decrease
        #[arg(long, default_value_t = fixtract_sift2::tckfactor::DEFAULT_MIN_CF_DECREASE)]
        min_cf_decrease: f64,

        /// One-shot linear (AFCSA) estimation instead of optimisation
        #[arg(long)]
        linear: bool,

        /// Line-search backend for the per-streamline sub-problem
        #[arg(long, value_enum, default_value_t = LineSearchOpt::Newton)]
        line_search: LineSearchOpt,

        /// Write the raw weighting coefficients to a second text file
        #[arg(long)]
        out_coeffs: Option<PathBuf>,

        /// Per-iteration CSV audit output
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Write the final proportionality coefficient to a text file
        #[arg(long)]
        out_mu: Option<PathBuf>,

        #[command(flatten)]
        fmls: FmlsOptions,

        #[command(flatten)]
        model: ModelOptions,
    },
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, ValueEnum)]
enum LineSearchOpt {
    Newton,
    GoldenSection,
    Quadratic,
}

impl From<LineSearchOpt> for LineSearch {
    fn from(value: LineSearchOpt) -> Self {
        match value {
            LineSearchOpt::Newton => Self::Newton,
            LineSearchOpt::GoldenSection => Self::GoldenSection,
            LineSearchOpt::Quadratic => Self::Quadratic,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Fod2fixel {
            in_fod,
            out_dir,
            mask,
            fmls,
        } => fod2fixel(&in_fod, &out_dir, mask.as_deref(), &fmls),
        Cmd::Sift {
            in_tracks,
            in_fd,
            out_tracks,
            term_number,
            term_ratio,
            term_mu,
            nofilter,
            output_at_counts,
            csv,
            out_mu,
            out_selection,
            model,
        } => sift(SiftArgs {
            in_tracks,
            in_fd,
            out_tracks,
            term_number,
            term_ratio,
            term_mu,
            nofilter,
            output_at_counts,
            csv,
            out_mu,
            out_selection,
            model,
        }),
        Cmd::Sift2 {
            in_tracks,
            in_fod,
            out_weights,
            units,
            reg_tikhonov,
            reg_tv,
            min_td_frac,
            min_iters,
            max_iters,
            min_factor,
            min_coeff,
            max_factor,
            max_coeff,
            max_coeff_step,
            min_cf_decrease,
            linear,
            line_search,
            out_coeffs,
            csv,
            out_mu,
            fmls,
            model,
        } => sift2(Sift2Args {
            in_tracks,
            in_fod,
            out_weights,
            units,
            reg_tikhonov,
            reg_tv,
            min_td_frac,
            min_iters,
            max_iters,
            min_factor,
            min_coeff,
            max_factor,
            max_coeff,
            max_coeff_step,
            min_cf_decrease,
            linear,
            line_search,
            out_coeffs,
            csv,
            out_mu,
            fmls,
            model,
        }),
    }
}

/// Initialize tracing with an env-driven filter (default INFO).
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_level(true).compact();
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

fn write_mu_file(path: &Path, mu: f64) -> Result<()> {
    let mut f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    writeln!(f, "{mu}")?;
    Ok(())
}

/* ------------------------------- fod2fixel ------------------------------- */

fn fod2fixel(in_fod: &Path, out_dir: &Path, mask: Option<&Path>, fmls: &FmlsOptions) -> Result<()> {
    let fod: Image4<f64> = io::read_auto(in_fod)?;
    fod.validate()
        .with_context(|| format!("validating FOD image {}", in_fod.display()))?;
    let lmax = sh::lmax_for_ncoefs(fod.channels)
        .context("FOD image channel count is not an SH series")?;
    info!(lmax, "segmenting FOD image");

    let mask_image: Option<Image3<f64>> = match mask {
        Some(path) => {
            let image: Image3<f64> = io::read_auto(path)?;
            image
                .validate()
                .with_context(|| format!("validating mask image {}", path.display()))?;
            Some(image)
        }
        None => None,
    };

    let dirs = std::sync::Arc::new(DirectionSet::hemisphere_1281());
    let segmenter = Segmenter::new(dirs.clone(), lmax, fmls.to_config())?;
    let lobes = segment_image(&fod, mask_image.as_ref(), &segmenter)?;

    // Assemble the dataset images in grid order.
    let nvoxels = fod.grid.nvoxels();
    let mut counts = vec![0u32; nvoxels];
    let mut offsets = vec![0u32; nvoxels];
    let mut tables: Vec<Vec<u8>> = vec![Vec::new(); nvoxels];
    let mut directions: Vec<Vector3<f64>> = Vec::new();
    let mut fd: Vec<f64> = Vec::new();
    let mut peak_value: Vec<f64> = Vec::new();
    for voxel_lobes in &lobes {
        if voxel_lobes.lobes.is_empty() {
            continue;
        }
        let linear = fod.grid.linear(voxel_lobes.voxel);
        counts[linear] = voxel_lobes.lobes.len() as u32;
        offsets[linear] = directions.len() as u32;
        tables[linear] = voxel_lobes.lut.clone();
        for lobe in &voxel_lobes.lobes {
            directions.push(if fmls.lsq_directions {
                lobe.lsq_dir().copied().unwrap_or(*lobe.mean_dir())
            } else {
                *lobe.mean_dir()
            });
            fd.push(lobe.integral());
            peak_value.push(lobe.max_peak_value());
        }
    }

    let index = IndexImage {
        grid: fod.grid.clone(),
        nfixels: directions.len() as u32,
        counts,
        offsets,
    };
    let lookup = LookupImage {
        ndirs: dirs.len() as u32,
        tables,
    };
    DatasetWriter {
        index: &index,
        directions: &directions,
        lookup: Some(&lookup),
        metrics: &[("fd", &fd), ("peak_value", &peak_value)],
    }
    .write(out_dir)?;

    println!(
        "Segmented {} -> {} fixels in {}",
        in_fod.display(),
        index.nfixels,
        out_dir.display()
    );
    Ok(())
}

/* --------------------------------- sift ---------------------------------- */

struct SiftArgs {
    in_tracks: PathBuf,
    in_fd: PathBuf,
    out_tracks: PathBuf,
    term_number: Option<usize>,
    term_ratio: Option<f64>,
    term_mu: Option<f64>,
    nofilter: bool,
    output_at_counts: Vec<usize>,
    csv: Option<PathBuf>,
    out_mu: Option<PathBuf>,
    out_selection: Option<PathBuf>,
    model: ModelOptions,
}

fn sift(args: SiftArgs) -> Result<()> {
    let dirs = std::sync::Arc::new(DirectionSet::hemisphere_1281());
    let mut model = Model::open_dataset(&args.in_fd, dirs, &args.model.to_config())?;

    if args.model.fd_scale_gm {
        model.scale_fds_by_gm()?;
    }

    if let Some(debug_dir) = &args.model.output_debug {
        fixtract_model::output::output_debug_init(&model, debug_dir)?;
    }

    let contributions = model.map_streamlines(&args.in_tracks)?;

    if let Some(debug_dir) = &args.model.output_debug {
        fixtract_model::output::output_all_debug(&model, debug_dir, "before")?;
    }

    let mut sifter = Sifter::new(model, contributions, args.in_tracks.clone());

    if !args.nofilter {
        if let Some(n) = args.term_number {
            sifter.set_term_number(n);
        }
        if let Some(r) = args.term_ratio {
            sifter.set_term_ratio(r);
        }
        if let Some(mu) = args.term_mu {
            sifter.set_term_mu(mu);
        }
        if let Some(csv) = args.csv.clone() {
            sifter.set_csv_path(csv);
        }
        if !args.output_at_counts.is_empty() {
            sifter.set_regular_outputs(&args.output_at_counts, args.out_tracks.clone());
            if let Some(debug_dir) = &args.model.output_debug {
                sifter.set_debug_dir(debug_dir.clone());
            }
        }

        sifter.perform_filtering()?;

        if let Some(debug_dir) = &args.model.output_debug {
            fixtract_model::output::output_all_debug(sifter.model(), debug_dir, "after")?;
        }

        sifter.output_filtered_tracks(&args.out_tracks)?;
        println!(
            "Filtered {} -> {} ({} of {} streamlines retained)",
            args.in_tracks.display(),
            args.out_tracks.display(),
            sifter.remaining(),
            sifter.num_tracks()
        );

        if let Some(path) = &args.out_selection {
            sifter.output_selection(path)?;
        }
    }

    if let Some(path) = &args.out_mu {
        write_mu_file(path, sifter.mu())?;
    }
    Ok(())
}

/* --------------------------------- sift2 --------------------------------- */

struct Sift2Args {
    in_tracks: PathBuf,
    in_fod: PathBuf,
    out_weights: PathBuf,
    units: Option<String>,
    reg_tikhonov: f64,
    reg_tv: f64,
    min_td_frac: f64,
    min_iters: usize,
    max_iters: usize,
    min_factor: Option<f64>,
    min_coeff: Option<f64>,
    max_factor: Option<f64>,
    max_coeff: Option<f64>,
    max_coeff_step: f64,
    min_cf_decrease: f64,
    linear: bool,
    line_search: LineSearchOpt,
    out_coeffs: Option<PathBuf>,
    csv: Option<PathBuf>,
    out_mu: Option<PathBuf>,
    fmls: FmlsOptions,
    model: ModelOptions,
}

/// Resolve the output units: command line first, then the
/// `FIXTRACT_SIFT2_UNITS` configuration key (for restoring the legacy
/// `NOS` default), then `mm^2`.
fn resolve_units(explicit: Option<&str>) -> Result<Units> {
    if let Some(s) = explicit {
        return s.parse().context("interpreting --units");
    }
    if let Ok(from_env) = std::env::var("FIXTRACT_SIFT2_UNITS") {
        return from_env
            .parse()
            .context("interpreting FIXTRACT_SIFT2_UNITS configuration value");
    }
    Ok(Units::default())
}

fn sift2(args: Sift2Args) -> Result<()> {
    if args.out_weights.extension().and_then(|e| e.to_str()) == Some("tck") {
        bail!("output of the sift2 command is a text file of weights, not a track file");
    }
    let units = resolve_units(args.units.as_deref())?;

    let min_coeff = match (args.min_factor, args.min_coeff) {
        (Some(factor), None) => {
            if factor > 0.0 {
                factor.ln()
            } else {
                f64::NEG_INFINITY
            }
        }
        (None, Some(coeff)) => coeff,
        (None, None) => f64::NEG_INFINITY,
        (Some(_), Some(_)) => unreachable!("clap enforces mutual exclusion"),
    };
    let max_coeff = match (args.max_factor, args.max_coeff) {
        (Some(factor), None) => factor.ln(),
        (None, Some(coeff)) => coeff,
        (None, None) => f64::INFINITY,
        (Some(_), Some(_)) => unreachable!("clap enforces mutual exclusion"),
    };

    let fod: Image4<f64> = io::read_auto(&args.in_fod)?;
    let dirs = std::sync::Arc::new(DirectionSet::hemisphere_1281());
    let mut model = Model::from_fod_image(&fod, dirs, args.fmls.to_config(), &args.model.to_config())?;

    if args.model.fd_scale_gm {
        model.scale_fds_by_gm()?;
    }
    if let Some(debug_dir) = &args.model.output_debug {
        fixtract_model::output::output_debug_init(&model, debug_dir)?;
    }

    let contributions = model.map_streamlines(&args.in_tracks)?;

    let config = Sift2Config {
        reg_tikhonov: args.reg_tikhonov,
        reg_tv: args.reg_tv,
        min_td_frac: args.min_td_frac,
        min_iters: args.min_iters,
        max_iters: args.max_iters,
        min_coeff,
        max_coeff,
        max_coeff_step: args.max_coeff_step,
        min_cf_decrease: args.min_cf_decrease,
        line_search: args.line_search.into(),
    };
    let mut tckfactor = TckFactor::new(model, contributions, config);
    tckfactor.store_orig_tds();
    tckfactor.remove_excluded_fixels();

    if let Some(debug_dir) = &args.model.output_debug {
        tckfactor.output_td_images(debug_dir)?;
        fixtract_model::output::output_all_debug(tckfactor.model(), debug_dir, "before")?;
    }

    if args.linear {
        tckfactor.calc_afcsa();
    } else {
        if let Some(csv) = args.csv.clone() {
            tckfactor.set_csv_path(csv);
        }
        tckfactor.estimate_factors()?;
    }

    tckfactor.report_entropy();
    tckfactor.output_factors(&args.out_weights, units)?;
    println!(
        "Estimated weights for {} streamlines ({units} units) -> {}",
        tckfactor.coefficients().len(),
        args.out_weights.display()
    );

    if let Some(path) = &args.out_coeffs {
        tckfactor.output_coefficients(path)?;
    }
    if let Some(debug_dir) = &args.model.output_debug {
        fixtract_model::output::output_all_debug(tckfactor.model(), debug_dir, "after")?;
    }
    if let Some(path) = &args.out_mu {
        info!(
            "the proportionality coefficient is also recorded in the weights file header comments"
        );
        write_mu_file(path, tckfactor.mu())?;
    }
    Ok(())
}
