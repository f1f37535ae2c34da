//! On-disk fixel dataset directory format.
//!
//! A dataset is a directory holding:
//!
//! - `index.{json,cbor}`: the voxel grid, the authoritative fixel count,
//!   and per-voxel `(count, first_fixel_index)` records;
//! - `directions.{json,cbor}`: one unit vector per fixel;
//! - per-metric data files (`fd`, `peak_value`, ...): one value per fixel;
//! - optionally `lookup.{json,cbor}`: a dense per-voxel table mapping each
//!   member of the direction set to the offset of its containing fixel
//!   within the voxel (the per-voxel fixel count acts as the "no lobe"
//!   sentinel).

use crate::grid::VoxelGrid;
use crate::io;
use anyhow::{anyhow, bail, ensure, Context, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The per-voxel index image of a fixel dataset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexImage {
    /// Voxel grid shared by every image of the dataset.
    pub grid: VoxelGrid,
    /// Authoritative number of fixels.
    pub nfixels: u32,
    /// Per-voxel fixel count, in grid order.
    pub counts: Vec<u32>,
    /// Per-voxel first fixel index, in grid order (0 where the count is 0).
    pub offsets: Vec<u32>,
}

impl IndexImage {
    /// Validate internal consistency after deserialization.
    pub fn validate(&self) -> Result<()> {
        let n = self.grid.nvoxels();
        ensure!(
            self.counts.len() == n && self.offsets.len() == n,
            "index image holds {} / {} records for {} voxels",
            self.counts.len(),
            self.offsets.len(),
            n
        );
        for (i, (&count, &first)) in self.counts.iter().zip(&self.offsets).enumerate() {
            if count > 0 {
                ensure!(
                    first + count <= self.nfixels,
                    "voxel {i} references fixels {first}..{} beyond nfixels {}",
                    first + count,
                    self.nfixels
                );
            }
        }
        Ok(())
    }

    /// `(first_fixel_index, count)` of a voxel.
    #[must_use]
    pub fn voxel(&self, v: [usize; 3]) -> (u32, u32) {
        let i = self.grid.linear(v);
        (self.offsets[i], self.counts[i])
    }
}

/// Per-fixel directions data file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectionsFile {
    /// One unit vector per fixel.
    pub directions: Vec<[f64; 3]>,
}

/// A scalar per-fixel metric data file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataFile {
    /// One value per fixel.
    pub values: Vec<f64>,
}

/// Optional dense per-voxel direction→fixel lookup tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LookupImage {
    /// Size of the direction set the tables are defined against.
    pub ndirs: u32,
    /// Per voxel (grid order): empty where the voxel holds no fixels,
    /// otherwise `ndirs` offsets with the voxel's fixel count as sentinel.
    pub tables: Vec<Vec<u8>>,
}

/// An open fixel dataset.
pub struct Dataset {
    /// Directory the dataset was read from.
    pub directory: PathBuf,
    /// Index image.
    pub index: IndexImage,
    /// Per-fixel directions.
    pub directions: Vec<Vector3<f64>>,
    /// Optional per-voxel direction lookup tables.
    pub lookup: Option<LookupImage>,
}

impl Dataset {
    /// Open a dataset directory, reading index, directions and (if present)
    /// the lookup image.
    pub fn open(directory: &Path) -> Result<Self> {
        ensure!(
            directory.is_dir(),
            "fixel dataset {} is not a directory",
            directory.display()
        );
        let index_path = io::find_by_stem(directory, "index")
            .ok_or_else(|| anyhow!("no index image in fixel dataset {}", directory.display()))?;
        let index: IndexImage = io::read_auto(&index_path)?;
        index
            .validate()
            .with_context(|| format!("validating {}", index_path.display()))?;

        let dirs_path = io::find_by_stem(directory, "directions").ok_or_else(|| {
            anyhow!(
                "no directions data file in fixel dataset {}",
                directory.display()
            )
        })?;
        let dirs_file: DirectionsFile = io::read_auto(&dirs_path)?;
        ensure!(
            dirs_file.directions.len() == index.nfixels as usize,
            "directions file holds {} rows for {} fixels",
            dirs_file.directions.len(),
            index.nfixels
        );
        let directions = dirs_file
            .directions
            .iter()
            .map(|d| Vector3::new(d[0], d[1], d[2]))
            .collect();

        let lookup = match io::find_by_stem(directory, "lookup") {
            Some(path) => {
                let lookup: LookupImage = io::read_auto(&path)?;
                validate_lookup(&lookup, &index)
                    .with_context(|| format!("validating {}", path.display()))?;
                Some(lookup)
            }
            None => None,
        };

        Ok(Self {
            directory: directory.to_owned(),
            index,
            directions,
            lookup,
        })
    }

    /// Number of fixels in the dataset.
    #[must_use]
    pub fn nfixels(&self) -> usize {
        self.index.nfixels as usize
    }

    /// Read a per-fixel metric data file by stem (e.g. `"fd"`).
    pub fn read_metric(&self, stem: &str) -> Result<Vec<f64>> {
        let path = io::find_by_stem(&self.directory, stem).ok_or_else(|| {
            anyhow!(
                "no {stem} data file in fixel dataset {}",
                self.directory.display()
            )
        })?;
        read_metric_file(&path, self.nfixels())
    }
}

/// Read a per-fixel metric data file, validating its length.
pub fn read_metric_file(path: &Path, nfixels: usize) -> Result<Vec<f64>> {
    let data: DataFile = io::read_auto(path)?;
    ensure!(
        data.values.len() == nfixels,
        "data file {} holds {} values for {} fixels",
        path.display(),
        data.values.len(),
        nfixels
    );
    Ok(data.values)
}

/// Write a per-fixel metric data file.
pub fn write_metric_file(path: &Path, values: &[f64]) -> Result<()> {
    io::write_auto(
        path,
        &DataFile {
            values: values.to_vec(),
        },
    )
}

fn validate_lookup(lookup: &LookupImage, index: &IndexImage) -> Result<()> {
    ensure!(
        lookup.tables.len() == index.grid.nvoxels(),
        "lookup image holds {} tables for {} voxels",
        lookup.tables.len(),
        index.grid.nvoxels()
    );
    for (i, table) in lookup.tables.iter().enumerate() {
        let count = index.counts[i];
        if table.is_empty() {
            ensure!(count == 0, "voxel {i} has fixels but an empty lookup table");
            continue;
        }
        ensure!(
            table.len() == lookup.ndirs as usize,
            "voxel {i} lookup table has {} entries for {} directions",
            table.len(),
            lookup.ndirs
        );
        if table.iter().any(|&offset| u32::from(offset) > count) {
            bail!("voxel {i} lookup table references an offset beyond its fixel count");
        }
    }
    Ok(())
}

/// Writer-side bundle for creating a dataset directory in one call.
pub struct DatasetWriter<'a> {
    /// Index image to write.
    pub index: &'a IndexImage,
    /// Per-fixel directions.
    pub directions: &'a [Vector3<f64>],
    /// Optional lookup image.
    pub lookup: Option<&'a LookupImage>,
    /// Named per-fixel metrics, e.g. `[("fd", …), ("peak_value", …)]`.
    pub metrics: &'a [(&'a str, &'a [f64])],
}

impl DatasetWriter<'_> {
    /// Create (or overwrite) a dataset directory with CBOR payloads.
    pub fn write(&self, directory: &Path) -> Result<()> {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("creating fixel dataset directory {}", directory.display()))?;
        self.index
            .validate()
            .context("validating index image before write")?;
        io::write_auto(directory.join("index.cbor"), self.index)?;
        let directions = DirectionsFile {
            directions: self.directions.iter().map(|d| [d[0], d[1], d[2]]).collect(),
        };
        io::write_auto(directory.join("directions.cbor"), &directions)?;
        if let Some(lookup) = self.lookup {
            validate_lookup(lookup, self.index).context("validating lookup image before write")?;
            io::write_auto(directory.join("lookup.cbor"), lookup)?;
        }
        for (stem, values) in self.metrics {
            ensure!(
                values.len() == self.index.nfixels as usize,
                "metric {stem} holds {} values for {} fixels",
                values.len(),
                self.index.nfixels
            );
            write_metric_file(&directory.join(format!("{stem}.cbor")), values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("fixtract_dataset_{name}_{nanos}"));
        p
    }

    fn small_index() -> IndexImage {
        // 2x1x1 grid; two fixels in the first voxel, none in the second.
        IndexImage {
            grid: VoxelGrid::isotropic([2, 1, 1], 2.0),
            nfixels: 2,
            counts: vec![2, 0],
            offsets: vec![0, 0],
        }
    }

    #[test]
    fn roundtrip_preserves_everything() {
        let dir = tmp_dir("roundtrip");
        let index = small_index();
        let directions = vec![Vector3::new(0.0, 0.0, 1.0), Vector3::new(1.0, 0.0, 0.0)];
        let lookup = LookupImage {
            ndirs: 4,
            tables: vec![vec![0, 0, 1, 2], vec![]],
        };
        let fd = [0.75, 0.5];
        DatasetWriter {
            index: &index,
            directions: &directions,
            lookup: Some(&lookup),
            metrics: &[("fd", &fd)],
        }
        .write(&dir)
        .unwrap();

        let back = Dataset::open(&dir).unwrap();
        assert_eq!(back.nfixels(), 2);
        assert_eq!(back.index.voxel([0, 0, 0]), (0, 2));
        assert_eq!(back.index.voxel([1, 0, 0]), (0, 0));
        assert!((back.directions[1] - directions[1]).norm() < 1e-12);
        assert_eq!(back.lookup.as_ref().unwrap().tables[0], vec![0, 0, 1, 2]);
        assert_eq!(back.read_metric("fd").unwrap(), fd.to_vec());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn inconsistent_index_rejected() {
        let mut index = small_index();
        index.nfixels = 1;
        assert!(index.validate().is_err());
    }

    #[test]
    fn metric_length_mismatch_rejected() {
        let dir = tmp_dir("badmetric");
        let index = small_index();
        let directions = vec![Vector3::new(0.0, 0.0, 1.0), Vector3::new(1.0, 0.0, 0.0)];
        let fd = [1.0];
        let result = DatasetWriter {
            index: &index,
            directions: &directions,
            lookup: None,
            metrics: &[("fd", &fd)],
        }
        .write(&dir);
        assert!(result.is_err());
        let _ = std::fs::remove_dir_all(dir);
    }
}
