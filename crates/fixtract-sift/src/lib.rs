//! SIFT: spherical-deconvolution informed filtering of tractograms.
//!
//! Streamlines are removed one at a time, most-beneficial first, until the
//! per-fixel streamline densities match the fibre densities as closely as
//! the discrete representation allows (or a user-supplied termination
//! criterion is met). Gradients are recomputed in parallel whenever any of
//! the acceptance guards detects that the current estimates have gone
//! stale.

pub mod sifter;
pub mod sorter;

pub use sifter::{RecalcReason, Sifter};
