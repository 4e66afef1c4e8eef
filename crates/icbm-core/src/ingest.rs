//! Ingestion pipeline: one decoded batch in, live state and files out.
//!
//! For each batch:
//! 1. merge into the tap's live report, then apply the retention window
//! 2. append one chart line per stable sample and cap the chart file
//! 3. persist the batch as a raw update file named by the current time
//!
//! Steps 2 and 3 are best effort. Their failures are logged and counted but
//! never undo step 1, and a chart failure does not stop the raw write.

use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::{IcbmError, Result};
use crate::registry::TapRegistry;
use crate::sample::{TelemetryBatch, chart_ratio, sanitize};
use crate::store::{self, Store};
use crate::tail::trim_to_last_lines;

/// Outcome of a successful ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReceipt {
    pub tap: String,
    pub fine_added: usize,
    pub stable_added: usize,
    /// Raw update file written, or `None` when persisting it failed.
    pub raw_file: Option<PathBuf>,
    /// Whether the chart file was appended and trimmed.
    pub chart_updated: bool,
}

/// Applies incoming batches to a registry and the data directory.
pub struct Ingestor {
    config: EngineConfig,
    store: Store,
    registry: Arc<TapRegistry>,
    metrics: Arc<IngestMetrics>,
}

impl Ingestor {
    pub fn new(config: EngineConfig, registry: Arc<TapRegistry>) -> Self {
        Self {
            store: Store::new(&config.data_dir),
            config,
            registry,
            metrics: Arc::new(IngestMetrics::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TapRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    pub fn ingest(&self, batch: TelemetryBatch) -> Result<IngestReceipt> {
        self.ingest_at(batch, Utc::now())
    }

    /// [`Ingestor::ingest`] against an explicit clock.
    pub fn ingest_at(&self, mut batch: TelemetryBatch, now: DateTime<Utc>) -> Result<IngestReceipt> {
        let tap = sanitize(&batch.tap_name);
        if tap.is_empty() {
            return Err(IcbmError::InvalidTapName(batch.tap_name));
        }
        batch.tap_name = tap.clone();

        let fine_added = batch.fine_samples.len();
        let stable_added = batch.stable_samples.len();
        let chart = chart_lines(&batch);
        for s in &batch.stable_samples {
            self.metrics.record_fill(s.published_fill_ratio);
        }
        let raw = serde_json::to_vec(&batch);

        let report = self.registry.append_within(batch, self.config.retention, now);
        self.metrics.data_points.fetch_add(stable_added as u64, Ordering::Relaxed);

        let chart_updated = match self.update_chart(&tap, &chart) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("couldn't update chart data for {tap}: {e}");
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        };

        let raw_file = match raw
            .map_err(|source| IcbmError::Encode {
                tap: tap.clone(),
                source,
            })
            .and_then(|bytes| self.persist_raw(&tap, &bytes, now))
        {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!("couldn't store raw update for {tap}: {e}");
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        log::info!("update for {tap}: {fine_added} fine, {stable_added} stable samples");
        Ok(IngestReceipt {
            tap,
            fine_added,
            stable_added,
            raw_file,
            chart_updated,
        })
    }

    fn update_chart(&self, tap: &str, lines: &str) -> Result<()> {
        let path = self.store.chart_path(tap);
        append_lines(&path, lines)?;
        trim_to_last_lines(&path, self.config.chart_lines)
    }

    fn persist_raw(&self, tap: &str, bytes: &[u8], now: DateTime<Utc>) -> Result<PathBuf> {
        let path = self.store.stamped_path(tap, &store::update_stamp(now));
        store::write_gz(&path, bytes, &format!("icbm update for {tap}"))?;
        Ok(path)
    }
}

/// `<unix secs>\t<clamped ratio>\n` for every stable sample.
fn chart_lines(batch: &TelemetryBatch) -> String {
    let mut out = String::new();
    for s in &batch.stable_samples {
        let _ = writeln!(out, "{}\t{}", s.timestamp.timestamp(), chart_ratio(s));
    }
    out
}

fn append_lines(path: &Path, lines: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| IcbmError::io("couldn't create directory", dir, e))?;
    }
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| IcbmError::io("couldn't open data file for appending", path, e))?;
    f.write_all(lines.as_bytes())
        .map_err(|e| IcbmError::io("couldn't append chart data to", path, e))
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Rough usage counters, logged and reset periodically.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub data_points: AtomicU64,
    pub api_logins: AtomicU64,
    pub bad_logins: AtomicU64,
    pub bad_json: AtomicU64,
    pub errors: AtomicU64,
    fill: Mutex<FillWindow>,
}

#[derive(Debug, Default, Clone, Copy)]
struct FillWindow {
    min: Option<f64>,
    max: Option<f64>,
    sum: f64,
    count: u64,
}

/// Counters for one reporting period. Fill figures are percentages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub data_points: u64,
    pub api_logins: u64,
    pub bad_logins: u64,
    pub bad_json: u64,
    pub errors: u64,
    pub fill_min: Option<f64>,
    pub fill_max: Option<f64>,
    pub fill_avg: Option<f64>,
}

impl IngestMetrics {
    fn record_fill(&self, ratio: f64) {
        let mut w = match self.fill.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        w.min = Some(w.min.map_or(ratio, |m| m.min(ratio)));
        w.max = Some(w.max.map_or(ratio, |m| m.max(ratio)));
        w.sum += ratio;
        w.count += 1;
    }

    /// Read and reset every counter.
    pub fn take(&self) -> MetricsSnapshot {
        let w = {
            let mut guard = match self.fill.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        let pct = |x: f64| (x * 1000.0).round() / 10.0;
        MetricsSnapshot {
            data_points: self.data_points.swap(0, Ordering::Relaxed),
            api_logins: self.api_logins.swap(0, Ordering::Relaxed),
            bad_logins: self.bad_logins.swap(0, Ordering::Relaxed),
            bad_json: self.bad_json.swap(0, Ordering::Relaxed),
            errors: self.errors.swap(0, Ordering::Relaxed),
            fill_min: w.min.map(pct),
            fill_max: w.max.map(pct),
            fill_avg: (w.count > 0).then(|| pct(w.sum / w.count as f64)),
        }
    }
}
