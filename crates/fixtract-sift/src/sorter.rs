//! Multi-threaded block sorter over the per-streamline gradient vector.
//!
//! The gradient vector is split into blocks which are sorted in parallel;
//! a k-way heap merge then hands candidates to the single-threaded removal
//! loop lazily, so the full vector is never sorted when only its head is
//! consumed. Small blocks raise re-sort overhead, large blocks waste the
//! sort effort; the caller picks the size with the `2000·N/N_remaining`
//! heuristic.
//!
//! Candidates are ranked most-negative gradient first; exact ties fall to
//! the streamline with the larger contribution, so that removal from a
//! perfectly-fit region is deterministic and sheds the most density first.

use fixtract_core::TrackIndex;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One streamline's gradient estimate, ready for ranking.
#[derive(Clone, Copy, Debug)]
pub struct GradientEntry {
    /// Streamline index, or `TrackIndex::MAX` for removed streamlines.
    pub index: TrackIndex,
    /// Predicted cost decrease were the streamline removed.
    pub gradient: f64,
    /// The streamline's weighted total contribution (tie-break key).
    pub contribution: f64,
}

impl GradientEntry {
    /// Placeholder for a removed streamline; sorts after live entries.
    #[must_use]
    pub fn removed() -> Self {
        Self {
            index: TrackIndex::MAX,
            gradient: f64::MAX,
            contribution: 0.0,
        }
    }

    /// Ranking: ascending gradient, then descending contribution. NaN
    /// gradients sort last.
    fn rank(&self, other: &Self) -> Ordering {
        self.gradient
            .total_cmp(&other.gradient)
            .then_with(|| other.contribution.total_cmp(&self.contribution))
    }
}

/// Heap item ordered so the best-ranked block head pops first.
struct HeadOfBlock {
    entry: GradientEntry,
    block: usize,
}

impl PartialEq for HeadOfBlock {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeadOfBlock {}
impl PartialOrd for HeadOfBlock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeadOfBlock {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap (a max-heap) pops the best rank first.
        other
            .entry
            .rank(&self.entry)
            .then_with(|| other.block.cmp(&self.block))
    }
}

/// Lazily merged view over block-sorted gradients.
pub struct GradientSorter {
    blocks: Vec<Vec<GradientEntry>>,
    cursors: Vec<usize>,
    heap: BinaryHeap<HeadOfBlock>,
}

impl GradientSorter {
    /// Sort `entries` in parallel blocks of `block_size` and prepare the
    /// lazy merge.
    #[must_use]
    pub fn new(entries: &[GradientEntry], block_size: usize) -> Self {
        let block_size = block_size.max(16);
        let mut blocks: Vec<Vec<GradientEntry>> = entries
            .chunks(block_size)
            .map(<[GradientEntry]>::to_vec)
            .collect();
        blocks
            .par_iter_mut()
            .for_each(|block| block.sort_unstable_by(GradientEntry::rank));

        let mut heap = BinaryHeap::with_capacity(blocks.len());
        for (b, block) in blocks.iter().enumerate() {
            if let Some(first) = block.first() {
                heap.push(HeadOfBlock {
                    entry: *first,
                    block: b,
                });
            }
        }
        Self {
            cursors: vec![0; blocks.len()],
            blocks,
            heap,
        }
    }

    /// Next live candidate in rank order, or `None` when every entry has
    /// been consumed.
    pub fn get(&mut self) -> Option<GradientEntry> {
        loop {
            let head = self.heap.pop()?;
            let block = head.block;
            let entry = self.blocks[block][self.cursors[block]];
            self.cursors[block] += 1;
            if let Some(next) = self.blocks[block].get(self.cursors[block]) {
                self.heap.push(HeadOfBlock {
                    entry: *next,
                    block,
                });
            }
            if entry.index != TrackIndex::MAX {
                return Some(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: TrackIndex, gradient: f64) -> GradientEntry {
        GradientEntry {
            index,
            gradient,
            contribution: 1.0,
        }
    }

    #[test]
    fn yields_entries_in_ascending_gradient_order() {
        let entries: Vec<GradientEntry> = [3.0, -1.0, 0.5, -7.0, 2.0, -0.25]
            .iter()
            .enumerate()
            .map(|(i, &g)| entry(i as TrackIndex, g))
            .collect();
        for block_size in [16, 2, 3] {
            let mut sorter = GradientSorter::new(&entries, block_size);
            let mut gradients = Vec::new();
            while let Some(e) = sorter.get() {
                gradients.push(e.gradient);
            }
            assert_eq!(gradients, vec![-7.0, -1.0, -0.25, 0.5, 2.0, 3.0]);
        }
    }

    #[test]
    fn ties_prefer_larger_contribution() {
        let entries = vec![
            GradientEntry {
                index: 0,
                gradient: -1.0,
                contribution: 1.0,
            },
            GradientEntry {
                index: 1,
                gradient: -1.0,
                contribution: 2.0,
            },
        ];
        let mut sorter = GradientSorter::new(&entries, 16);
        assert_eq!(sorter.get().unwrap().index, 1);
        assert_eq!(sorter.get().unwrap().index, 0);
    }

    #[test]
    fn removed_entries_are_skipped() {
        let mut entries = vec![entry(0, -2.0), GradientEntry::removed(), entry(2, -1.0)];
        entries.push(GradientEntry::removed());
        let mut sorter = GradientSorter::new(&entries, 2);
        assert_eq!(sorter.get().unwrap().index, 0);
        assert_eq!(sorter.get().unwrap().index, 2);
        assert!(sorter.get().is_none());
    }

    #[test]
    fn nan_gradients_sort_last() {
        let entries = vec![entry(0, f64::NAN), entry(1, -1.0)];
        let mut sorter = GradientSorter::new(&entries, 16);
        assert_eq!(sorter.get().unwrap().index, 1);
        assert_eq!(sorter.get().unwrap().index, 0);
    }
}
