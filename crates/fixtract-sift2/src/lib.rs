//! SIFT2: continuous per-streamline weighting by non-linear optimisation.
//!
//! Instead of removing streamlines, every streamline receives a weighting
//! coefficient `c_s` (physical factor `exp(c_s)`) estimated so that the
//! weighted streamline densities match the fibre densities, under Tikhonov
//! and total-variation regularisation. Each iteration runs an independent
//! 1-D line search per streamline in parallel, then recomputes the fixel
//! track densities from the new coefficients.

pub mod line_search;
pub mod tckfactor;
pub mod units;

pub use tckfactor::{Sift2Config, TckFactor};
pub use units::Units;

/// Line-search backend for the per-streamline 1-D sub-problem.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LineSearch {
    /// Bounded damped Newton iteration (the default).
    #[default]
    Newton,
    /// Golden-section search over the trust interval.
    GoldenSection,
    /// Iterated quadratic (parabolic) interpolation.
    Quadratic,
}
