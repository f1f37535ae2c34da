//! Physical units of exported streamline weights.

use anyhow::{bail, Error, Result};
use std::fmt;
use std::str::FromStr;

/// Units in which SIFT2 weights are written.
///
/// The default changed from `NOS` to `mm²` in a previous generation of the
/// tools; the CLI accepts a configuration key to restore the old default,
/// and the chosen units are always recorded in the output file header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Units {
    /// Number-of-streamlines basis: export `exp(c_s)` directly.
    Nos,
    /// Fibre density per millimetre: export `μ·exp(c_s)`.
    AfdPerMm,
    /// Cross-sectional area in mm²: export `μ·V·exp(c_s)` (V the voxel
    /// volume), invariant to the FOD grid resolution.
    #[default]
    Mm2,
}

impl Units {
    /// The multiplier applied to `exp(c_s)` on export.
    #[must_use]
    pub fn scale(self, mu: f64, voxel_volume: f64) -> f64 {
        match self {
            Self::Nos => 1.0,
            Self::AfdPerMm => mu,
            Self::Mm2 => mu * voxel_volume,
        }
    }
}

impl FromStr for Units {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nos" | "none" => Ok(Self::Nos),
            "afd/mm" | "afd.mm-1" | "afd.mm^-1" => Ok(Self::AfdPerMm),
            "mm2" | "mm^2" => Ok(Self::Mm2),
            other => bail!("unable to interpret \"{other}\" as streamline weight units"),
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nos => "NOS",
            Self::AfdPerMm => "AFD/mm",
            Self::Mm2 => "mm^2",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_aliases() {
        for s in ["NOS", "none"] {
            assert_eq!(s.parse::<Units>().unwrap(), Units::Nos);
        }
        for s in ["AFD/mm", "AFD.mm-1", "afd.mm^-1"] {
            assert_eq!(s.parse::<Units>().unwrap(), Units::AfdPerMm);
        }
        for s in ["mm2", "MM^2"] {
            assert_eq!(s.parse::<Units>().unwrap(), Units::Mm2);
        }
        assert!("parsecs".parse::<Units>().is_err());
    }

    #[test]
    fn scales() {
        assert_eq!(Units::Nos.scale(0.5, 8.0), 1.0);
        assert_eq!(Units::AfdPerMm.scale(0.5, 8.0), 0.5);
        assert_eq!(Units::Mm2.scale(0.5, 8.0), 4.0);
    }
}
