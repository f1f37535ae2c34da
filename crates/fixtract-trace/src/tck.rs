//! Track-file reader and writer.

use crate::{Properties, Track};
use anyhow::{bail, ensure, Context, Result};
use nalgebra::Vector3;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

const MAGIC: &str = "fixtract tracks";
/// Width of the zero-padded `count` field, so it can be patched in place.
const COUNT_WIDTH: usize = 10;

/// Streaming track-file reader.
///
/// Iterate to obtain one streamline at a time; header properties are
/// available before the first streamline is read.
pub struct TrackReader {
    reader: BufReader<File>,
    properties: Properties,
    finished: bool,
}

impl TrackReader {
    /// Open a track file and parse its header.
    pub fn open(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut reader = BufReader::new(f);

        let mut line = String::new();
        reader.read_line(&mut line).context("read track magic")?;
        ensure!(
            line.trim_end() == MAGIC,
            "{} is not a track file (bad magic)",
            path.display()
        );

        let mut properties = Properties::new();
        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .with_context(|| format!("read track header in {}", path.display()))?;
            if n == 0 {
                bail!("track file {} ends inside its header", path.display());
            }
            let trimmed = line.trim_end();
            if trimmed == "END" {
                break;
            }
            match trimmed.split_once(':') {
                Some((key, value)) => properties.set(key.trim(), value.trim()),
                None => bail!(
                    "malformed track header line {trimmed:?} in {}",
                    path.display()
                ),
            }
        }

        Ok(Self {
            reader,
            properties,
            finished: false,
        })
    }

    /// Header properties.
    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    fn read_triple(&mut self) -> Result<Option<[f32; 3]>> {
        let mut buf = [0u8; 12];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("read track data"),
        }
        let triple = [
            f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            f32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            f32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        ];
        Ok(Some(triple))
    }

    /// Read the next streamline, or `None` at end of stream.
    pub fn next_track(&mut self) -> Result<Option<Track>> {
        if self.finished {
            return Ok(None);
        }
        let mut track = Track::new();
        loop {
            match self.read_triple()? {
                None => {
                    // Missing terminator: tolerate, but flag the truncation.
                    self.finished = true;
                    if track.is_empty() {
                        return Ok(None);
                    }
                    tracing::warn!("track file ends without terminator");
                    return Ok(Some(track));
                }
                Some(t) if t[0].is_nan() => {
                    return Ok(Some(track));
                }
                Some(t) if t[0].is_infinite() => {
                    self.finished = true;
                    if track.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(track));
                }
                Some(t) => {
                    track.push(Vector3::new(
                        f64::from(t[0]),
                        f64::from(t[1]),
                        f64::from(t[2]),
                    ));
                }
            }
        }
    }
}

impl Iterator for TrackReader {
    type Item = Result<Track>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_track().transpose()
    }
}

/// Track-file writer; `finish` back-patches the streamline count.
pub struct TrackWriter {
    writer: BufWriter<File>,
    count_offset: u64,
    count: u64,
}

impl TrackWriter {
    /// Create a track file with the given header properties.
    ///
    /// Any `count` property supplied by the caller is ignored; the true
    /// count is patched in when the writer is finished.
    pub fn create(path: &Path, properties: &Properties) -> Result<Self> {
        let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut writer = BufWriter::new(f);
        writeln!(writer, "{MAGIC}")?;
        writeln!(writer, "datatype: Float32LE")?;
        for (key, value) in properties.iter() {
            if key != "count" && key != "datatype" {
                writeln!(writer, "{key}: {value}")?;
            }
        }
        write!(writer, "count: ")?;
        writer.flush()?;
        let count_offset = writer.get_mut().stream_position()?;
        writeln!(writer, "{:0width$}", 0, width = COUNT_WIDTH)?;
        writeln!(writer, "END")?;
        Ok(Self {
            writer,
            count_offset,
            count: 0,
        })
    }

    /// Append one streamline (an empty slice records a removed streamline).
    pub fn write(&mut self, track: &[Vector3<f64>]) -> Result<()> {
        for p in track {
            for value in [p[0] as f32, p[1] as f32, p[2] as f32] {
                self.writer.write_all(&value.to_le_bytes())?;
            }
        }
        for _ in 0..3 {
            self.writer.write_all(&f32::NAN.to_le_bytes())?;
        }
        self.count += 1;
        Ok(())
    }

    /// Number of streamlines written so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Write the terminator and patch the header count.
    pub fn finish(mut self) -> Result<u64> {
        for _ in 0..3 {
            self.writer.write_all(&f32::INFINITY.to_le_bytes())?;
        }
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(self.count_offset))?;
        write!(
            file,
            "{:0width$}",
            self.count.min(10u64.pow(COUNT_WIDTH as u32) - 1),
            width = COUNT_WIDTH
        )?;
        file.flush()?;
        Ok(self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track_length;
    use std::path::PathBuf;

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("fixtract_tck_{name}_{nanos}.tck"));
        p
    }

    #[test]
    fn roundtrip_preserves_tracks_and_properties() {
        let path = tmp_path("roundtrip");
        let mut props = Properties::new();
        props.set("step_size", "0.5");

        let tracks = vec![
            vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(0.5, 0.0, 0.0),
                Vector3::new(1.0, 0.0, 0.0),
            ],
            vec![Vector3::new(1.0, 2.0, 3.0), Vector3::new(1.0, 2.5, 3.0)],
        ];

        let mut writer = TrackWriter::create(&path, &props).unwrap();
        for t in &tracks {
            writer.write(t).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 2);

        let mut reader = TrackReader::open(&path).unwrap();
        assert_eq!(reader.properties().count(), Some(2));
        assert_eq!(reader.properties().step_size(), Some(0.5));
        let mut back = Vec::new();
        while let Some(track) = reader.next_track().unwrap() {
            back.push(track);
        }
        assert_eq!(back.len(), tracks.len());
        for (a, b) in back.iter().zip(&tracks) {
            assert_eq!(a.len(), b.len());
            assert!((track_length(a) - track_length(b)).abs() < 1e-6);
        }
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn empty_tracks_are_preserved() {
        let path = tmp_path("empty");
        let mut writer = TrackWriter::create(&path, &Properties::new()).unwrap();
        writer.write(&[]).unwrap();
        writer
            .write(&[Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)])
            .unwrap();
        writer.finish().unwrap();

        let reader = TrackReader::open(&path).unwrap();
        let tracks: Vec<_> = reader.map(Result::unwrap).collect();
        assert_eq!(tracks.len(), 2);
        assert!(tracks[0].is_empty());
        assert_eq!(tracks[1].len(), 2);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn non_track_file_rejected() {
        let path = tmp_path("bogus");
        std::fs::write(&path, b"something else entirely\n").unwrap();
        assert!(TrackReader::open(&path).is_err());
        let _ = std::fs::remove_file(path);
    }
}
