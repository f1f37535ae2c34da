//! The shared fixel–streamline model.
//!
//! [`Model`] owns the per-fixel columns (fibre density, track density,
//! streamline count, processing weight, direction) together with the
//! voxel→fixel index, and exposes the aggregate proportionality
//! coefficient `μ = ΣFD·w / ΣTD·w`. It is built either by segmenting an
//! FOD image (via `fixtract-fmls`) or by opening an on-disk fixel dataset,
//! and is populated by mapping a tractogram through the precise
//! [`mapper::TrackMapper`].

pub mod contribution;
pub mod mapper;
pub mod model;
pub mod output;
pub mod weights;

pub use contribution::TrackContribution;
pub use mapper::{determine_upsample_ratio, MappedSegment, TrackMapper};
pub use model::{DirectionChoice, Model, ModelConfig};
pub use weights::WeightSource;
