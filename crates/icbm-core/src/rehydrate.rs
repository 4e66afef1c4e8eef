//! Startup replay of stored files into the registry.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::Result;
use crate::registry::TapRegistry;
use crate::sample::TelemetryBatch;
use crate::store::{self, Store};

/// Counts from one rehydration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RehydrateSummary {
    pub taps: usize,
    pub files_loaded: usize,
    /// Files dated before the retention window.
    pub files_too_old: usize,
    /// Files that could not be read.
    pub files_skipped: usize,
}

/// Replay every bundle and unarchived raw file within `retention` into
/// `registry`, then apply the retention window to each tap.
pub fn rehydrate(store: &Store, registry: &TapRegistry, retention: Duration) -> Result<RehydrateSummary> {
    rehydrate_at(store, registry, retention, Utc::now())
}

/// [`rehydrate`] against an explicit clock.
///
/// The age test uses the date in the file name only, so a file from the
/// cutoff day is loaded whole and its older samples are dropped afterwards
/// by the retention pass.
pub fn rehydrate_at(
    store: &Store,
    registry: &TapRegistry,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<RehydrateSummary> {
    let oldest = now
        .checked_sub_signed(TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
        .date_naive();

    let mut summary = RehydrateSummary::default();
    for tap in store.tap_names()? {
        let files = store.list_files(&tap, store::is_stored_name)?;
        if files.is_empty() {
            continue;
        }
        summary.taps += 1;

        for name in files {
            if store::era_date(&name).is_none_or(|d| d < oldest) {
                summary.files_too_old += 1;
                continue;
            }
            let path = store.tap_dir(&tap).join(&name);
            match store::read_gz_json::<TelemetryBatch>(&path) {
                Ok(mut batch) => {
                    batch.tap_name = tap.clone();
                    registry.append(batch);
                    summary.files_loaded += 1;
                }
                Err(e) => {
                    log::warn!("skipping {}: {e}", path.display());
                    summary.files_skipped += 1;
                }
            }
        }
        // a raw file left behind after its era was bundled appears twice
        if let Some(report) = registry.get(&tap) {
            let dropped = report.dedup();
            if dropped > 0 {
                log::info!("{tap}: dropped {dropped} duplicate samples");
            }
        }
    }
    registry.keep_since_at(retention, now);

    log::info!(
        "rehydrated {} taps from {} files ({} older than retention, {} unreadable)",
        registry.len(),
        summary.files_loaded,
        summary.files_too_old,
        summary.files_skipped
    );
    Ok(summary)
}
