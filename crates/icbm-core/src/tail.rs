//! Crash-safe tail trimming.
//!
//! [`trim_to_last_lines`] keeps only the newest lines of an append-only file.
//! The replacement is written to a temp file in the same directory and renamed
//! over the original, so a crash at any point leaves either the old or the new
//! content in place, never a truncated file.
//!
//! The whole file is read into memory. That suits chart files capped at a few
//! thousand short lines; it is not a general purpose `tail`.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{IcbmError, Result};

const TEMP_PREFIX: &str = "icbm-data-";

/// Rewrite `path` so only its last `n` newline-terminated lines remain.
///
/// Files with `n` lines or fewer are left untouched. A missing or unreadable
/// file is an error.
pub fn trim_to_last_lines(path: &Path, n: usize) -> Result<()> {
    let content = fs::read(path).map_err(|e| IcbmError::io("couldn't open for reading", path, e))?;

    let Some(idx) = nth_from_end(&content, b'\n', n.saturating_add(1)) else {
        return Ok(());
    };
    replace_file(path, &content[idx + 1..])
}

/// Atomically replace `path` with `bytes` via a synced temp file in the same
/// directory. On failure `path` is untouched and the temp file is gone.
fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| IcbmError::io("couldn't create tempfile in", dir, e))?;

    // On any early return the NamedTempFile is dropped, which removes it.
    write_all(&mut tmp, bytes)?;
    tmp.persist(path)
        .map_err(|e| IcbmError::io("couldn't rename tempfile over", path, e.error))?;
    Ok(())
}

fn write_all(tmp: &mut NamedTempFile, bytes: &[u8]) -> Result<()> {
    tmp.write_all(bytes)
        .and_then(|()| tmp.flush())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| IcbmError::io("couldn't write to tempfile", tmp.path(), e))
}

/// Position of the `n`th `needle` in `haystack`, counting backward from the
/// end (`n == 1` is the last occurrence).
pub fn nth_from_end(haystack: &[u8], needle: u8, n: usize) -> Option<usize> {
    if n == 0 {
        return None;
    }
    haystack
        .iter()
        .enumerate()
        .rev()
        .filter(|&(_, &b)| b == needle)
        .nth(n - 1)
        .map(|(i, _)| i)
}
