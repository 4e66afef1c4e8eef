//! Era consolidation ("repack").
//!
//! Raw update files pile up one per ingested batch. Repacking walks a tap's
//! directory oldest first, merges every closed day's files into one report,
//! saves that as `<yyyymmdd>.json.gz` and moves the originals into
//! `archive/`. Files from the current day are left alone, so the job can run
//! while ingestion keeps writing.
//!
//! Originals are only moved after their era's bundle has been written. A run
//! interrupted at any point can simply be repeated.

use std::fs;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};

use crate::error::{IcbmError, Result};
use crate::report::{Report, append_batch};
use crate::sample::TelemetryBatch;
use crate::store::{self, Store};

/// What one repack run did for one tap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepackSummary {
    pub tap: String,
    /// Era labels bundled, in order.
    pub eras: Vec<String>,
    /// Raw update files moved into `archive/`.
    pub archived: usize,
    /// Files that could not be read and were left in place.
    pub skipped: Vec<String>,
    /// Files left for a later run: the current era, or everything after the
    /// time budget ran out.
    pub deferred: usize,
    /// The time budget ran out before every closed era was processed.
    pub out_of_time: bool,
}

/// The era currently being accumulated.
struct OpenEra {
    label: String,
    report: Option<Arc<Report>>,
    files: Vec<String>,
}

/// Repack one tap, treating the current UTC day as the open era.
pub fn repack(store: &Store, tap: &str) -> Result<RepackSummary> {
    repack_at(store, tap, Utc::now().date_naive(), None)
}

/// Repack one tap as if `today` were the current day.
///
/// `deadline` is checked before each era is opened; an era once started is
/// always finished.
pub fn repack_at(
    store: &Store,
    tap: &str,
    today: NaiveDate,
    deadline: Option<Instant>,
) -> Result<RepackSummary> {
    let files = store.list_files(tap, store::is_raw_update_name)?;
    let today_label = store::era_label_for(today);
    let mut summary = RepackSummary {
        tap: tap.to_string(),
        ..Default::default()
    };
    let mut open: Option<OpenEra> = None;

    for (i, name) in files.iter().enumerate() {
        let Some(label) = store::era_label(name) else {
            continue;
        };
        if label >= today_label.as_str() {
            summary.deferred = files.len() - i;
            break;
        }

        if open.as_ref().is_none_or(|era| era.label != label) {
            if let Some(era) = open.take() {
                close_era(store, tap, era, &mut summary)?;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                log::info!("repack of {tap} out of time before era {label}");
                summary.out_of_time = true;
                summary.deferred = files.len() - i;
                break;
            }
            open = Some(open_era(store, tap, label)?);
        }
        let Some(era) = open.as_mut() else {
            continue;
        };

        let path = store.tap_dir(tap).join(name);
        match store::read_gz_json::<TelemetryBatch>(&path) {
            Ok(mut batch) => {
                batch.tap_name = tap.to_string();
                era.report = Some(append_batch(era.report.take(), batch));
                era.files.push(name.clone());
            }
            Err(e) => {
                log::warn!("skipping {}: {e}", path.display());
                summary.skipped.push(name.clone());
            }
        }
    }

    if let Some(era) = open.take() {
        close_era(store, tap, era, &mut summary)?;
    }
    Ok(summary)
}

/// Start an era, picking up the bundle an earlier run left for it.
///
/// An unreadable bundle is an error: the era is not rewritten until someone
/// has looked at it.
fn open_era(store: &Store, tap: &str, label: &str) -> Result<OpenEra> {
    let bundle = store.stamped_path(tap, label);
    let report = if bundle.is_file() {
        let mut batch: TelemetryBatch = store::read_gz_json(&bundle)?;
        batch.tap_name = tap.to_string();
        log::debug!("era {label} for {tap} extends {}", bundle.display());
        Some(append_batch(None, batch))
    } else {
        None
    };
    Ok(OpenEra {
        label: label.to_string(),
        report,
        files: Vec::new(),
    })
}

/// Save an era's bundle, then move its raw files into `archive/`.
fn close_era(store: &Store, tap: &str, era: OpenEra, summary: &mut RepackSummary) -> Result<()> {
    let Some(report) = era.report else {
        // every file in the era failed to decode
        return Ok(());
    };
    if era.files.is_empty() {
        return Ok(());
    }

    // raw files still present after a crash between save and move are
    // already in the bundle
    let dropped = report.dedup();
    if dropped > 0 {
        log::info!("era {} for {tap}: dropped {dropped} duplicate samples", era.label);
    }
    report.save(store, &era.label, &format!("rollup for era {}", era.label))?;

    let archive = store.archive_dir(tap);
    fs::create_dir_all(&archive)
        .map_err(|e| IcbmError::io("couldn't create archive directory", &archive, e))?;
    for name in &era.files {
        let from = store.tap_dir(tap).join(name);
        fs::rename(&from, archive.join(name))
            .map_err(|e| IcbmError::io("couldn't move to archive", &from, e))?;
    }

    let (fine, stable) = report.counts();
    log::info!(
        "wrote era {} for {tap}: {} files, {fine} fine, {stable} stable samples",
        era.label,
        era.files.len()
    );
    summary.archived += era.files.len();
    summary.eras.push(era.label);
    Ok(())
}

/// Repack every tap under the data root. A tap that fails is logged and
/// does not stop the others; the shared deadline does.
pub fn repack_all(
    store: &Store,
    today: NaiveDate,
    deadline: Option<Instant>,
) -> Result<Vec<RepackSummary>> {
    let mut done = Vec::new();
    for tap in store.tap_names()? {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            log::info!("repack out of time, {tap} and later taps left for next run");
            break;
        }
        match repack_at(store, &tap, today, deadline) {
            Ok(summary) => done.push(summary),
            Err(e) => log::error!("repack of {tap} failed: {e}"),
        }
    }
    Ok(done)
}
