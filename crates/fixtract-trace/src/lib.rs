//! Streaming tractogram I/O.
//!
//! A track file is a text header (`key: value` lines terminated by `END`)
//! followed by an opaque binary stream of polylines: little-endian `f32`
//! triples, with a NaN triple separating streamlines and an infinity triple
//! terminating the stream. The reader yields one streamline at a time and
//! never materialises the tractogram; the writer counts streamlines and
//! back-patches the `count` header field on completion.

pub mod generator;
pub mod properties;
pub mod tck;

pub use properties::Properties;
pub use tck::{TrackReader, TrackWriter};

use nalgebra::Vector3;

/// One streamline: an ordered sequence of scanner-space points.
pub type Track = Vec<Vector3<f64>>;

/// Total length of a streamline in millimetres.
#[must_use]
pub fn track_length(track: &[Vector3<f64>]) -> f64 {
    track.windows(2).map(|w| (w[1] - w[0]).norm()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_length_sums_segments() {
        let track = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(1.0, 2.0, 0.0),
        ];
        assert!((track_length(&track) - 3.0).abs() < 1e-12);
        assert_eq!(track_length(&[]), 0.0);
    }
}
