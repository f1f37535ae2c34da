//! Per-streamline fixel contributions.

use fixtract_core::FixelIndex;

/// The immutable record of one streamline's passage through the model:
/// which fixels it traverses and how much length it deposits in each.
///
/// Entries store fixel indices, never references; the fixel table is the
/// owner and is not moved after construction.
#[derive(Clone, Debug)]
pub struct TrackContribution {
    entries: Vec<(FixelIndex, f32)>,
    total_contribution: f64,
    total_length: f64,
}

impl TrackContribution {
    /// Bundle a streamline's per-fixel lengths with its weighted total
    /// contribution (`Σ wᵢ·lᵢ`) and its full length.
    #[must_use]
    pub fn new(entries: Vec<(FixelIndex, f32)>, total_contribution: f64, total_length: f64) -> Self {
        Self {
            entries,
            total_contribution,
            total_length,
        }
    }

    /// Number of fixels this streamline traverses.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.entries.len()
    }

    /// Whether the streamline traverses no fixel at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(fixel_index, length)` pairs.
    #[must_use]
    pub fn entries(&self) -> &[(FixelIndex, f32)] {
        &self.entries
    }

    /// Weighted total contribution to ΣTD·w.
    #[must_use]
    pub fn total_contribution(&self) -> f64 {
        self.total_contribution
    }

    /// Full streamline length (including sub-segments outside any fixel).
    #[must_use]
    pub fn total_length(&self) -> f64 {
        self.total_length
    }

    /// Rebuild with a subset of entries (used when fixels are excluded from
    /// optimisation); the caller supplies the recomputed weighted total.
    #[must_use]
    pub fn retain_fixels(&self, keep: impl Fn(FixelIndex) -> bool, weights: &[f64]) -> Self {
        let entries: Vec<(FixelIndex, f32)> = self
            .entries
            .iter()
            .copied()
            .filter(|&(f, _)| keep(f))
            .collect();
        let total_contribution = entries
            .iter()
            .map(|&(f, l)| weights[f as usize] * f64::from(l))
            .sum();
        Self {
            entries,
            total_contribution,
            total_length: self.total_length,
        }
    }
}
