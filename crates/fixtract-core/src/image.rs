//! Dense 3-D and 4-D image containers.
//!
//! Channel data of an [`Image4`] is stored voxel-major (all channels of a
//! voxel are contiguous), which is the access pattern of every consumer in
//! this workspace: FOD segmentation reads one voxel's SH vector at a time,
//! and 5TT lookups read one voxel's five tissue fractions at a time.

use crate::grid::VoxelGrid;
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// A scalar 3-D image on a [`VoxelGrid`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Image3<T> {
    /// Grid geometry.
    pub grid: VoxelGrid,
    data: Vec<T>,
}

impl<T: Clone + Default> Image3<T> {
    /// Allocate a zero-filled image.
    #[must_use]
    pub fn zeros(grid: VoxelGrid) -> Self {
        let n = grid.nvoxels();
        Self {
            grid,
            data: vec![T::default(); n],
        }
    }
}

impl<T> Image3<T> {
    /// Wrap existing data; the length must equal the voxel count.
    pub fn from_data(grid: VoxelGrid, data: Vec<T>) -> Result<Self> {
        ensure!(
            data.len() == grid.nvoxels(),
            "image data length {} does not match voxel count {}",
            data.len(),
            grid.nvoxels()
        );
        Ok(Self { grid, data })
    }

    /// Value at a voxel.
    pub fn get(&self, v: [usize; 3]) -> &T {
        &self.data[self.grid.linear(v)]
    }

    /// Mutable value at a voxel.
    pub fn get_mut(&mut self, v: [usize; 3]) -> &mut T {
        let i = self.grid.linear(v);
        &mut self.data[i]
    }

    /// Raw data slice in grid order.
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Validate an image deserialized from disk.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.data.len() == self.grid.nvoxels(),
            "image data length {} does not match voxel count {}",
            self.data.len(),
            self.grid.nvoxels()
        );
        Ok(())
    }
}

/// A multi-channel 3-D image (4-D data) on a [`VoxelGrid`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Image4<T> {
    /// Grid geometry.
    pub grid: VoxelGrid,
    /// Number of channels per voxel (the fourth axis).
    pub channels: usize,
    data: Vec<T>,
}

impl<T: Clone + Default> Image4<T> {
    /// Allocate a zero-filled image.
    #[must_use]
    pub fn zeros(grid: VoxelGrid, channels: usize) -> Self {
        let n = grid.nvoxels() * channels;
        Self {
            grid,
            channels,
            data: vec![T::default(); n],
        }
    }
}

impl<T> Image4<T> {
    /// Wrap existing voxel-major data.
    pub fn from_data(grid: VoxelGrid, channels: usize, data: Vec<T>) -> Result<Self> {
        ensure!(
            data.len() == grid.nvoxels() * channels,
            "image data length {} does not match {} voxels x {} channels",
            data.len(),
            grid.nvoxels(),
            channels
        );
        Ok(Self {
            grid,
            channels,
            data,
        })
    }

    /// All channels of one voxel.
    pub fn voxel(&self, v: [usize; 3]) -> &[T] {
        let base = self.grid.linear(v) * self.channels;
        &self.data[base..base + self.channels]
    }

    /// Mutable channels of one voxel.
    pub fn voxel_mut(&mut self, v: [usize; 3]) -> &mut [T] {
        let base = self.grid.linear(v) * self.channels;
        &mut self.data[base..base + self.channels]
    }

    /// One channel of one voxel.
    pub fn get(&self, v: [usize; 3], channel: usize) -> &T {
        &self.data[self.grid.linear(v) * self.channels + channel]
    }

    /// Validate an image deserialized from disk.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.channels > 0,
            "4-D image must carry at least one channel"
        );
        ensure!(
            self.data.len() == self.grid.nvoxels() * self.channels,
            "image data length {} does not match {} voxels x {} channels",
            self.data.len(),
            self.grid.nvoxels(),
            self.channels
        );
        Ok(())
    }
}
