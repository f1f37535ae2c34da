//! Core building blocks shared by every fixtract crate.
//!
//! This crate owns the geometry and format layer of the toolkit:
//!
//! - the fixed hemispherical [`DirectionSet`] with its constant-time
//!   nearest-direction [`DirectionSet::assign`] lookup;
//! - the spherical-harmonic collaborator in [`sh`] (evaluation, delta
//!   functions, precomputed associated-Legendre tables, peak refinement);
//! - [`VoxelGrid`] geometry plus dense [`Image3`] / [`Image4`] containers
//!   with JSON/CBOR auto-detected I/O;
//! - the on-disk fixel dataset directory format in [`dataset`];
//! - five-tissue-type accessors in [`tissue`].

pub mod dataset;
pub mod directions;
pub mod grid;
pub mod image;
pub mod interp;
pub mod io;
pub mod sh;
pub mod tissue;

pub use directions::{DirIndex, DirectionSet};
pub use grid::VoxelGrid;
pub use image::{Image3, Image4};

/// Streamline identifier within a tractogram.
pub type TrackIndex = u32;

/// Fixel identifier within a model.
pub type FixelIndex = u32;
