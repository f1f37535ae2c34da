//! Dynamic seeding: seed selection biased by the reconstruction deficit.
//!
//! The seeder wraps the shared fixel model with per-fixel atomic state so
//! that streamline generators and the mapping pipeline can read and write
//! it concurrently: track density moves through compare-exchange loops, and
//! the probability quadruple behind each fixel is serialised by a per-fixel
//! spin latch. No global lock is taken anywhere.

pub mod atomic;
pub mod seeder;

pub use seeder::{DynamicSeeder, Seed};
