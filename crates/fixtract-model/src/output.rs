//! Debug and audit outputs of the model state.
//!
//! All outputs are per-fixel data files in the dataset format, plus a
//! CSV scatter plot of fibre density against (scaled) track density, so
//! reconstruction quality can be inspected before and after an algorithm
//! runs.

use crate::model::Model;
use anyhow::{Context, Result};
use fixtract_core::dataset::write_metric_file;
use fixtract_core::FixelIndex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Write the filter-invariant target (fibre density) data file.
pub fn output_target_fixel(model: &Model, path: &Path) -> Result<()> {
    write_metric_file(path, &model.fixels.fd)
}

/// Write the current (μ-scaled) track density data file.
pub fn output_tdi_fixel(model: &Model, path: &Path) -> Result<()> {
    let mu = model.mu();
    let tdi: Vec<f64> = model.fixels.td.iter().map(|&td| td * mu).collect();
    write_metric_file(path, &tdi)
}

/// Write per-fixel difference and cost data files.
pub fn output_errors_fixel(model: &Model, diff_path: &Path, cost_path: &Path) -> Result<()> {
    let mu = model.mu();
    let n = model.nfixels() as FixelIndex;
    let diff: Vec<f64> = (0..n).map(|i| model.fixels.diff(i, mu)).collect();
    let cost: Vec<f64> = (0..n).map(|i| model.fixels.cost(i, mu)).collect();
    write_metric_file(diff_path, &diff)?;
    write_metric_file(cost_path, &cost)
}

/// Write a per-fixel scatter-plot CSV (`fd, td, td·μ, weight`).
pub fn output_scatterplot(model: &Model, path: &Path) -> Result<()> {
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::new(f);
    writeln!(w, "fibre_density,track_density,scaled_track_density,weight")?;
    let mu = model.mu();
    for i in 0..model.nfixels() {
        writeln!(
            w,
            "{},{},{},{}",
            model.fixels.fd[i],
            model.fixels.td[i],
            model.fixels.td[i] * mu,
            model.fixels.weight[i]
        )?;
    }
    w.flush()?;
    Ok(())
}

/// Write the full prefixed debug bundle into a directory.
pub fn output_all_debug(model: &Model, directory: &Path, prefix: &str) -> Result<()> {
    std::fs::create_dir_all(directory)
        .with_context(|| format!("creating debug output directory {}", directory.display()))?;
    output_tdi_fixel(model, &directory.join(format!("{prefix}_tdi_fixel.cbor")))?;
    output_errors_fixel(
        model,
        &directory.join(format!("{prefix}_diff_fixel.cbor")),
        &directory.join(format!("{prefix}_cost_fixel.cbor")),
    )?;
    output_scatterplot(model, &directory.join(format!("{prefix}_scatterplot.csv")))?;
    Ok(())
}

/// Write the filter-invariant outputs (once per run).
pub fn output_debug_init(model: &Model, directory: &Path) -> Result<()> {
    std::fs::create_dir_all(directory)
        .with_context(|| format!("creating debug output directory {}", directory.display()))?;
    output_target_fixel(model, &directory.join("target_fixel.cbor"))
}
