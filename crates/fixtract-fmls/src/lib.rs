//! FMLS: segmentation of per-voxel FOD spherical-harmonic series into
//! discrete, directed fibre lobes.
//!
//! Each voxel's SH coefficients are sampled onto the fixed direction set
//! and the resulting amplitudes are walked in descending magnitude order,
//! growing connected lobes over the direction mesh. Surviving positive
//! lobes carry their amplitude integral, refined peak direction(s) and a
//! dense direction→lobe lookup table consumed by the fixel model.

pub mod driver;
pub mod lobe;
pub mod segmenter;

pub use driver::segment_image;
pub use lobe::{FodLobe, VoxelLobes};
pub use segmenter::{Segmenter, SegmenterConfig};
