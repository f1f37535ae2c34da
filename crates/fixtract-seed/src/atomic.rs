//! Lock-free atomic primitives for the shared fixel state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// An `f64` updated by compare-exchange over its bit pattern.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    /// Wrap an initial value.
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    /// Relaxed load.
    #[must_use]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Relaxed store.
    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Add `delta` via a compare-exchange loop; returns the new value.
    pub fn fetch_add(&self, delta: f64) -> f64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return f64::from_bits(next),
                Err(observed) => current = observed,
            }
        }
    }
}

/// An `f32` stored in an atomic cell; writes are expected to happen under
/// an external latch, reads are free.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    /// Wrap an initial value.
    #[must_use]
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    /// Relaxed load.
    #[must_use]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Relaxed store.
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// A spin latch serialising read-modify-write of a fixel's seed state.
#[derive(Debug, Default)]
pub struct Latch(AtomicBool);

impl Latch {
    /// Spin until the latch is acquired.
    pub fn acquire(&self) {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    /// Release the latch.
    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_f64_accumulates() {
        let a = AtomicF64::new(1.5);
        assert_eq!(a.fetch_add(2.5), 4.0);
        assert_eq!(a.load(), 4.0);
        a.store(0.25);
        assert_eq!(a.load(), 0.25);
    }

    #[test]
    fn atomic_f64_is_consistent_under_contention() {
        let a = AtomicF64::new(0.0);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..10_000 {
                        a.fetch_add(1.0);
                    }
                });
            }
        });
        assert_eq!(a.load(), 40_000.0);
    }

    #[test]
    fn latch_round_trip() {
        let latch = Latch::default();
        latch.acquire();
        latch.release();
        latch.acquire();
        latch.release();
    }
}
