//! Serialization helpers shared by images, fixel datasets and model outputs.
//!
//! JSON and CBOR read/write with extension-based auto-detection. Unknown or
//! missing extensions are rejected for reads and default to JSON for writes,
//! so that a mistyped path fails loudly on input but never loses data on
//! output.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Ensure the parent directory for a file exists (no-op if none).
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating parent directory {}", dir.display()))?;
        }
    }
    Ok(())
}

/// Read any deserializable value from **JSON**.
pub fn read_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let rdr = BufReader::new(f);
    serde_json::from_reader(rdr).with_context(|| format!("deserialize JSON {}", path.display()))
}

/// Write any serializable value to **JSON** (pretty).
pub fn write_json<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::new(f);
    serde_json::to_writer_pretty(&mut w, value)
        .with_context(|| format!("serialize JSON {}", path.display()))?;
    w.flush().with_context(|| "flush JSON writer")?;
    Ok(())
}

/// Read any deserializable value from **CBOR**.
pub fn read_cbor<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut rdr = BufReader::new(f);
    ciborium::de::from_reader(&mut rdr)
        .with_context(|| format!("deserialize CBOR {}", path.display()))
}

/// Write any serializable value to **CBOR**.
pub fn write_cbor<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::new(f);
    ciborium::ser::into_writer(value, &mut w)
        .with_context(|| format!("serialize CBOR {}", path.display()))?;
    w.flush().with_context(|| "flush CBOR writer")?;
    Ok(())
}

/// Auto-detect **read** by extension (`.json` / `.cbor`, case-insensitive).
pub fn read_auto<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    match ext_lower(path.as_ref()).as_deref() {
        Some("json") => read_json(path),
        Some("cbor") => read_cbor(path),
        Some(other) => Err(anyhow!(
            "unsupported extension: .{other} (supported: .json, .cbor)"
        )),
        None => Err(anyhow!(
            "path {} has no extension (expected .json or .cbor)",
            path.as_ref().display()
        )),
    }
}

/// Auto-detect **write** (defaults to JSON if unknown/missing).
pub fn write_auto<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    match ext_lower(path.as_ref()).as_deref() {
        Some("cbor") => write_cbor(path, value),
        _ => write_json(path, value),
    }
}

/// Locate `<dir>/<stem>.json` or `<dir>/<stem>.cbor`, preferring CBOR.
///
/// Returns `None` when neither exists; an ambiguous pair is resolved in
/// favour of CBOR (the denser of the two).
pub fn find_by_stem(dir: &Path, stem: &str) -> Option<PathBuf> {
    for ext in ["cbor", "json"] {
        let candidate = dir.join(format!("{stem}.{ext}"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[inline]
fn ext_lower(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        values: Vec<f64>,
    }

    fn tmp_path(name: &str, ext: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("fixtract_core_io_{name}_{nanos}.{ext}"));
        p
    }

    #[test]
    fn json_roundtrip() {
        let path = tmp_path("payload", "json");
        let v = Payload {
            name: "fd".into(),
            values: vec![0.25, 1.5],
        };
        write_auto(&path, &v).unwrap();
        let back: Payload = read_auto(&path).unwrap();
        assert_eq!(back, v);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn cbor_roundtrip() {
        let path = tmp_path("payload", "cbor");
        let v = Payload {
            name: "td".into(),
            values: vec![3.0],
        };
        write_auto(&path, &v).unwrap();
        let back: Payload = read_auto(&path).unwrap();
        assert_eq!(back, v);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn unknown_extension_rejected_on_read() {
        assert!(read_auto::<Payload, _>("weights.bin").is_err());
    }
}
