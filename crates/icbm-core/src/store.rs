//! On-disk layout and gzip JSON file I/O.
//!
//! # Storage Format
//!
//! ```text
//! <data>/
//!   <tap>.tsv                    chart data, "<unix secs>\t<ratio>" per line
//!   <tap>/
//!     yyyymmddhhmmss.json.gz     raw update file, one per ingested batch
//!     yyyymmdd.json.gz           era bundle, one per closed day
//!     archive/
//!       yyyymmddhhmmss.json.gz   raw update files already bundled
//! ```
//!
//! Every stored file name is a zero-padded UTC timestamp, so lexicographic
//! order is chronological order.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::error::{IcbmError, Result};

/// Suffix shared by raw update files and bundles.
pub const GZ_JSON_SUFFIX: &str = ".json.gz";

/// Subdirectory of a tap directory receiving bundled raw update files.
pub const ARCHIVE_DIR: &str = "archive";

/// Digits in a daily era label (`yyyymmdd`).
pub const ERA_DIGITS: usize = 8;

/// Digits in a raw update file stamp (`yyyymmddhhmmss`).
pub const STAMP_DIGITS: usize = 14;

const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const ERA_FORMAT: &str = "%Y%m%d";

/// Paths into the data directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tap_dir(&self, tap: &str) -> PathBuf {
        self.root.join(tap)
    }

    pub fn archive_dir(&self, tap: &str) -> PathBuf {
        self.tap_dir(tap).join(ARCHIVE_DIR)
    }

    /// Chart data file for a tap. Lives beside, not inside, the tap directory.
    pub fn chart_path(&self, tap: &str) -> PathBuf {
        self.root.join(format!("{tap}.tsv"))
    }

    /// Path of a stored file (`label` is an era label or a full stamp).
    pub fn stamped_path(&self, tap: &str, label: &str) -> PathBuf {
        self.tap_dir(tap).join(format!("{label}{GZ_JSON_SUFFIX}"))
    }

    /// Names of every tap directory under the data root.
    /// A missing root means no taps yet.
    pub fn tap_names(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IcbmError::io("couldn't read data directory", &self.root, e)),
        };

        let mut taps: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.is_empty() && crate::sample::sanitize(name) == *name)
            .collect();
        taps.sort();
        Ok(taps)
    }

    /// File names in a tap directory accepted by `keep`, sorted ascending.
    pub fn list_files(&self, tap: &str, keep: impl Fn(&str) -> bool) -> Result<Vec<String>> {
        let dir = self.tap_dir(tap);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IcbmError::io("couldn't read tap directory", &dir, e)),
        };

        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| keep(name))
            .collect();
        names.sort();
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// File names
// ---------------------------------------------------------------------------

/// The digit stem of a `<digits>.json.gz` name, if it has `min..=max` digits.
fn stamp_stem(name: &str, min: usize, max: usize) -> Option<&str> {
    let stem = name.strip_suffix(GZ_JSON_SUFFIX)?;
    let ok = (min..=max).contains(&stem.len()) && stem.bytes().all(|b| b.is_ascii_digit());
    ok.then_some(stem)
}

/// `yyyymmddhhmmss.json.gz`
pub fn is_raw_update_name(name: &str) -> bool {
    stamp_stem(name, STAMP_DIGITS, STAMP_DIGITS).is_some()
}

/// Bundles and raw update files: 8 to 14 digits then `.json.gz`.
pub fn is_stored_name(name: &str) -> bool {
    stamp_stem(name, ERA_DIGITS, STAMP_DIGITS).is_some()
}

/// Daily era label (`yyyymmdd`) of a stored file name.
pub fn era_label(name: &str) -> Option<&str> {
    stamp_stem(name, ERA_DIGITS, STAMP_DIGITS).map(|stem| &stem[..ERA_DIGITS])
}

/// Calendar date named by a stored file name's leading eight digits.
pub fn era_date(name: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(era_label(name)?, ERA_FORMAT).ok()
}

pub fn era_label_for(date: NaiveDate) -> String {
    date.format(ERA_FORMAT).to_string()
}

/// Stamp used to name a raw update file written at `at`.
pub fn update_stamp(at: DateTime<Utc>) -> String {
    at.format(STAMP_FORMAT).to_string()
}

// ---------------------------------------------------------------------------
// gzip JSON
// ---------------------------------------------------------------------------

/// Write `bytes` gzip-compressed to `path` through a temp file in the same
/// directory, renamed into place once complete. The gzip header records the
/// final file name (without `.gz`), `comment` and the write time.
pub fn write_gz(path: &Path, bytes: &[u8], comment: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| IcbmError::io("couldn't create directory", dir, e))?;

    let inner_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.trim_end_matches(".gz").to_string())
        .unwrap_or_default();
    let mtime = u32::try_from(Utc::now().timestamp()).unwrap_or(0);

    let tmp = NamedTempFile::new_in(dir)
        .map_err(|e| IcbmError::io("couldn't create tempfile in", dir, e))?;
    let mut gz = GzBuilder::new()
        .filename(inner_name)
        .comment(comment)
        .mtime(mtime)
        .write(tmp, Compression::default());
    gz.write_all(bytes)
        .map_err(|e| IcbmError::io("couldn't write compressed", path, e))?;
    let tmp = gz
        .finish()
        .map_err(|e| IcbmError::io("couldn't finish compressed", path, e))?;
    tmp.persist(path)
        .map_err(|e| IcbmError::io("couldn't rename tempfile to", path, e.error))?;
    Ok(())
}

/// Read and decode a gzip JSON file.
pub fn read_gz_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| IcbmError::io("couldn't open", path, e))?;
    let mut bytes = Vec::new();
    GzDecoder::new(BufReader::new(file))
        .read_to_end(&mut bytes)
        .map_err(|source| IcbmError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_slice(&bytes).map_err(|e| IcbmError::Decode {
        path: path.to_path_buf(),
        source: e.into(),
    })
}
