//! Per-tap aggregate of fine and stable sample series.
//!
//! A [`Report`] owns both series behind one mutex together with a `sorted`
//! flag. Appends are cheap: they concatenate and clear the flag. Anything
//! that depends on order (trim, retention cutoff, rollup, save, summary)
//! sorts first, at most once, while holding the same lock.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::error::{IcbmError, Result};
use crate::sample::{Sample, TelemetryBatch};
use crate::store::{self, Store};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Thread-safe aggregate for one tap.
#[derive(Debug)]
pub struct Report {
    tap_name: String,
    state: Mutex<ReportState>,
}

#[derive(Debug, Default)]
struct ReportState {
    raw_mass_full: i64,
    raw_mass_tare: i64,
    fine: Vec<Sample>,
    stable: Vec<Sample>,
    sorted: bool,
}

impl ReportState {
    /// Stable sort of both series by timestamp. No-op when already sorted.
    /// Callers hold the report lock.
    fn sort(&mut self) {
        if self.sorted {
            return;
        }
        self.fine.sort_by_key(|s| s.timestamp);
        self.stable.sort_by_key(|s| s.timestamp);
        self.sorted = true;
    }

    fn append(&mut self, batch: TelemetryBatch) {
        if !batch.is_empty() {
            self.sorted = false;
        }
        self.fine.extend(batch.fine_samples);
        self.stable.extend(batch.stable_samples);
        self.raw_mass_full = batch.raw_mass_full;
        self.raw_mass_tare = batch.raw_mass_tare;
    }
}

impl Report {
    /// An empty report.
    pub fn new(tap_name: impl Into<String>) -> Self {
        Self {
            tap_name: tap_name.into(),
            state: Mutex::new(ReportState {
                sorted: true,
                ..Default::default()
            }),
        }
    }

    /// A report seeded from one batch, named after the batch's tap.
    pub fn from_batch(batch: TelemetryBatch) -> Self {
        let report = Self::new(batch.tap_name.clone());
        report.lock().append(batch);
        report
    }

    pub fn tap_name(&self) -> &str {
        &self.tap_name
    }

    fn lock(&self) -> MutexGuard<'_, ReportState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::error!(
                    "report lock for {} poisoned; continuing with inner state",
                    self.tap_name
                );
                poisoned.into_inner()
            }
        }
    }

    /// Concatenate a batch onto this report. Sample order is restored lazily.
    /// The batch's tare/full masses replace the current ones.
    pub fn append(&self, batch: TelemetryBatch) {
        self.lock().append(batch);
    }

    /// Keep at most the newest `max` samples of each series.
    pub fn trim(&self, max: usize) {
        let mut st = self.lock();
        st.sort();
        keep_last(&mut st.fine, max);
        keep_last(&mut st.stable, max);
    }

    /// Drop every sample at or before `now - window`.
    pub fn keep_since(&self, window: Duration) {
        self.keep_since_at(window, Utc::now());
    }

    /// [`Report::keep_since`] against an explicit clock.
    pub fn keep_since_at(&self, window: Duration, now: DateTime<Utc>) {
        let cutoff = now
            .checked_sub_signed(to_delta(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut st = self.lock();
        st.sort();
        keep_after(&mut st.fine, cutoff);
        keep_after(&mut st.stable, cutoff);
    }

    /// Downsample each series to at most one sample per `bucket`.
    ///
    /// This is decimation, not averaging: walking forward in time, a sample is
    /// kept only when it is more than `bucket` after the last *kept* sample.
    /// The first sample of each series always survives.
    pub fn rollup(&self, bucket: Duration) {
        let bucket = to_delta(bucket);
        let mut st = self.lock();
        st.sort();
        decimate(&mut st.fine, bucket);
        decimate(&mut st.stable, bucket);
    }

    /// Drop exact duplicate samples, keeping the first of each. Returns how
    /// many were removed.
    pub fn dedup(&self) -> usize {
        let mut st = self.lock();
        st.sort();
        let before = st.fine.len() + st.stable.len();
        dedup_sorted(&mut st.fine);
        dedup_sorted(&mut st.stable);
        before - st.fine.len() - st.stable.len()
    }

    /// Write the whole aggregate, sorted, as `<tap>/<label>.json.gz`.
    /// An existing file for the same label is replaced.
    pub fn save(&self, store: &Store, label: &str, comment: &str) -> Result<PathBuf> {
        let path = store.stamped_path(&self.tap_name, label);
        let mut st = self.lock();
        st.sort();
        let bytes = serde_json::to_vec(&snapshot_of(&self.tap_name, &st)).map_err(|source| {
            IcbmError::Encode {
                tap: self.tap_name.clone(),
                source,
            }
        })?;
        store::write_gz(&path, &bytes, comment)?;
        Ok(path)
    }

    /// Sorted copy of the aggregate in wire form.
    pub fn snapshot(&self) -> TelemetryBatch {
        let mut st = self.lock();
        st.sort();
        snapshot_of(&self.tap_name, &st)
    }

    /// `(fine, stable)` sample counts.
    pub fn counts(&self) -> (usize, usize) {
        let st = self.lock();
        (st.fine.len(), st.stable.len())
    }

    pub fn is_empty(&self) -> bool {
        let st = self.lock();
        st.fine.is_empty() && st.stable.is_empty()
    }

    /// Whether the series are currently known to be in order.
    pub fn is_sorted(&self) -> bool {
        self.lock().sorted
    }

    /// Statistics over the stable series.
    pub fn summary(&self) -> TapSummary {
        let mut st = self.lock();
        st.sort();

        let ratios: Vec<f64> = st.stable.iter().map(|s| s.published_fill_ratio).collect();
        let range = match (st.stable.first(), st.stable.last()) {
            (Some(first), Some(last)) if st.stable.len() > 1 => {
                Some(format_span(last.timestamp - first.timestamp))
            }
            _ => None,
        };

        TapSummary {
            tap: self.tap_name.clone(),
            fine_samples: st.fine.len(),
            stable_samples: st.stable.len(),
            raw_mass_full: st.raw_mass_full,
            raw_mass_tare: st.raw_mass_tare,
            latest: st.stable.last().copied(),
            average_fill: average(&ratios),
            stdev_fill: stdev(&ratios),
            cached_range: range,
        }
    }
}

/// Append onto `report`, allocating a fresh report seeded from `batch` when
/// there is none yet. Either way the live report is returned.
pub fn append_batch(report: Option<Arc<Report>>, batch: TelemetryBatch) -> Arc<Report> {
    match report {
        Some(existing) => {
            existing.append(batch);
            existing
        }
        None => Arc::new(Report::from_batch(batch)),
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// What the status page shows for a tap.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TapSummary {
    pub tap: String,
    pub fine_samples: usize,
    pub stable_samples: usize,
    pub raw_mass_full: i64,
    pub raw_mass_tare: i64,
    /// Newest stable sample.
    pub latest: Option<Sample>,
    /// Mean of the stable published fill ratios.
    pub average_fill: Option<f64>,
    /// Population standard deviation of the stable published fill ratios.
    pub stdev_fill: Option<f64>,
    /// Span from the oldest to the newest stable sample, e.g. `"3d4h15m"`.
    pub cached_range: Option<String>,
}

fn average(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().sum::<f64>() / xs.len() as f64)
}

fn stdev(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    let n = xs.len() as f64;
    let sum: f64 = xs.iter().sum();
    let squared: f64 = xs.iter().map(|x| x * x).sum();
    Some(((squared - sum * sum / n) / n).max(0.0).sqrt())
}

fn format_span(span: TimeDelta) -> String {
    let mins = span.num_minutes().max(0);
    format!("{}d{}h{}m", mins / 1440, (mins / 60) % 24, mins % 60)
}

// ---------------------------------------------------------------------------
// Series helpers (all expect sorted input)
// ---------------------------------------------------------------------------

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

fn snapshot_of(tap_name: &str, st: &ReportState) -> TelemetryBatch {
    TelemetryBatch {
        tap_name: tap_name.to_string(),
        raw_mass_full: st.raw_mass_full,
        raw_mass_tare: st.raw_mass_tare,
        fine_samples: st.fine.clone(),
        stable_samples: st.stable.clone(),
    }
}

fn keep_last(samples: &mut Vec<Sample>, max: usize) {
    if samples.len() > max {
        samples.drain(..samples.len() - max);
    }
}

fn keep_after(samples: &mut Vec<Sample>, cutoff: DateTime<Utc>) {
    let from = samples.partition_point(|s| s.timestamp <= cutoff);
    samples.drain(..from);
}

fn dedup_sorted(samples: &mut Vec<Sample>) {
    let mut kept: Vec<Sample> = Vec::with_capacity(samples.len());
    // start of the run of kept samples sharing the current timestamp
    let mut run = 0;
    for s in samples.drain(..) {
        if kept.last().is_some_and(|last| last.timestamp != s.timestamp) {
            run = kept.len();
        }
        if !kept[run..].contains(&s) {
            kept.push(s);
        }
    }
    *samples = kept;
}

fn decimate(samples: &mut Vec<Sample>, bucket: TimeDelta) {
    let mut anchor: Option<DateTime<Utc>> = None;
    samples.retain(|s| {
        let keep = anchor.is_none_or(|t| {
            t.checked_add_signed(bucket)
                .is_some_and(|limit| s.timestamp > limit)
        });
        if keep {
            anchor = Some(s.timestamp);
        }
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::seq::SliceRandom;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()
    }

    fn sample_at(ts: DateTime<Utc>, ratio: f64) -> Sample {
        Sample {
            published_fill_ratio: ratio,
            raw_fill_ratio: ratio,
            raw_mass: (ratio * 1_000_000.0) as i64,
            timestamp: ts,
        }
    }

    fn batch(tap: &str, fine_secs: &[i64], stable_secs: &[i64]) -> TelemetryBatch {
        TelemetryBatch {
            tap_name: tap.to_string(),
            raw_mass_full: 800_000,
            raw_mass_tare: 300_000,
            fine_samples: fine_secs
                .iter()
                .map(|&s| sample_at(t0() + TimeDelta::seconds(s), 0.5))
                .collect(),
            stable_samples: stable_secs
                .iter()
                .map(|&s| sample_at(t0() + TimeDelta::seconds(s), 0.5))
                .collect(),
        }
    }

    fn stable_secs(report: &Report) -> Vec<i64> {
        report
            .snapshot()
            .stable_samples
            .iter()
            .map(|s| (s.timestamp - t0()).num_seconds())
            .collect()
    }

    fn fine_secs(report: &Report) -> Vec<i64> {
        report
            .snapshot()
            .fine_samples
            .iter()
            .map(|s| (s.timestamp - t0()).num_seconds())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Append / sort
    // -----------------------------------------------------------------------

    #[test]
    fn test_append_to_absent_seeds_report() {
        let report = append_batch(None, batch("beta", &[1, 2], &[2]));
        assert_eq!(report.tap_name(), "beta");
        assert_eq!(report.counts(), (2, 1));
    }

    #[test]
    fn test_append_returns_same_report() {
        let first = append_batch(None, batch("beta", &[1], &[]));
        let second = append_batch(Some(Arc::clone(&first)), batch("beta", &[2], &[3]));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.counts(), (2, 1));
    }

    #[test]
    fn test_append_clears_sorted_flag_and_sort_restores() {
        let report = Report::new("beta");
        assert!(report.is_sorted());
        report.append(batch("beta", &[5, 1, 3], &[9, 7]));
        assert!(!report.is_sorted());
        assert_eq!(fine_secs(&report), vec![1, 3, 5]);
        assert_eq!(stable_secs(&report), vec![7, 9]);
        assert!(report.is_sorted());
    }

    #[test]
    fn test_empty_append_keeps_sorted_flag() {
        let report = Report::new("beta");
        report.append(batch("beta", &[], &[]));
        assert!(report.is_sorted());
    }

    #[test]
    fn test_masses_are_last_write_wins() {
        let report = Report::new("beta");
        let mut a = batch("beta", &[1], &[]);
        a.raw_mass_full = 1;
        a.raw_mass_tare = 2;
        let mut b = batch("beta", &[0], &[]);
        b.raw_mass_full = 10;
        b.raw_mass_tare = 20;
        report.append(a);
        report.append(b);
        let snap = report.snapshot();
        assert_eq!((snap.raw_mass_full, snap.raw_mass_tare), (10, 20));
    }

    #[test]
    fn test_sort_is_stable_for_equal_timestamps() {
        let ts = t0();
        let report = Report::new("beta");
        report.append(TelemetryBatch {
            tap_name: "beta".to_string(),
            stable_samples: vec![sample_at(ts, 0.1), sample_at(ts, 0.2)],
            ..Default::default()
        });
        report.append(TelemetryBatch {
            tap_name: "beta".to_string(),
            stable_samples: vec![sample_at(ts - TimeDelta::seconds(1), 0.0)],
            ..Default::default()
        });
        let ratios: Vec<f64> = report
            .snapshot()
            .stable_samples
            .iter()
            .map(|s| s.published_fill_ratio)
            .collect();
        assert_eq!(ratios, vec![0.0, 0.1, 0.2]);
    }

    #[test]
    fn test_concurrent_appends_commute() {
        let mut batches: Vec<TelemetryBatch> = (0..32)
            .map(|i| batch("beta", &[i * 3, i * 3 + 1], &[i * 3 + 2]))
            .collect();
        batches.shuffle(&mut rand::rng());

        let report = Arc::new(Report::new("beta"));
        std::thread::scope(|s| {
            for chunk in batches.chunks(4) {
                let report = Arc::clone(&report);
                s.spawn(move || {
                    for b in chunk {
                        report.append(b.clone());
                    }
                });
            }
        });

        let expected_fine: Vec<i64> = (0..32).flat_map(|i| [i * 3, i * 3 + 1]).collect();
        let expected_stable: Vec<i64> = (0..32).map(|i| i * 3 + 2).collect();
        assert_eq!(fine_secs(&report), expected_fine);
        assert_eq!(stable_secs(&report), expected_stable);
    }

    // -----------------------------------------------------------------------
    // Trim
    // -----------------------------------------------------------------------

    #[test]
    fn test_trim_keeps_newest_suffix_per_series() {
        let report = Report::new("beta");
        report.append(batch("beta", &[4, 0, 3, 1, 2], &[10, 11]));
        report.trim(3);
        assert_eq!(fine_secs(&report), vec![2, 3, 4]);
        // shorter series untouched
        assert_eq!(stable_secs(&report), vec![10, 11]);
    }

    #[test]
    fn test_trim_never_grows() {
        let report = Report::new("beta");
        report.append(batch("beta", &[1, 2], &[1]));
        report.trim(100);
        assert_eq!(report.counts(), (2, 1));
        report.trim(0);
        assert!(report.is_empty());
    }

    // -----------------------------------------------------------------------
    // KeepSince
    // -----------------------------------------------------------------------

    #[test]
    fn test_keep_since_drops_at_or_before_cutoff() {
        let report = Report::new("beta");
        report.append(batch("beta", &[0, 10, 20, 30], &[5, 25]));
        let now = t0() + TimeDelta::seconds(30);
        report.keep_since_at(Duration::from_secs(20), now);
        // cutoff = 10s; strictly after is kept
        assert_eq!(fine_secs(&report), vec![20, 30]);
        assert_eq!(stable_secs(&report), vec![25]);
    }

    #[test]
    fn test_keep_since_is_idempotent() {
        let report = Report::new("beta");
        report.append(batch("beta", &[30, 0, 20, 10], &[5, 25]));
        let now = t0() + TimeDelta::seconds(40);
        report.keep_since_at(Duration::from_secs(25), now);
        let once = report.snapshot();
        report.keep_since_at(Duration::from_secs(25), now);
        assert_eq!(report.snapshot(), once);
    }

    #[test]
    fn test_keep_since_everything_stale_empties() {
        let report = Report::new("beta");
        report.append(batch("beta", &[0, 1], &[2]));
        report.keep_since_at(Duration::from_secs(1), t0() + TimeDelta::days(1));
        assert!(report.is_empty());
    }

    #[test]
    fn test_keep_since_huge_window_keeps_all() {
        let report = Report::new("beta");
        report.append(batch("beta", &[0, 1], &[2]));
        report.keep_since(Duration::MAX);
        assert_eq!(report.counts(), (2, 1));
    }

    // -----------------------------------------------------------------------
    // Rollup
    // -----------------------------------------------------------------------

    #[test]
    fn test_rollup_decimates_against_last_kept() {
        let report = Report::new("beta");
        report.append(batch("beta", &[0, 5, 10, 11, 21, 22, 40], &[100, 101]));
        report.rollup(Duration::from_secs(10));
        // 10 is not more than 10s after 0; 11 is. 21 is not more than 10s after 11.
        assert_eq!(fine_secs(&report), vec![0, 11, 22, 40]);
        // each series keeps its own first sample
        assert_eq!(stable_secs(&report), vec![100]);
    }

    #[test]
    fn test_rollup_output_spacing() {
        let secs: Vec<i64> = (0..500).map(|i| (i * 7919) % 1000).collect();
        let report = Report::new("beta");
        report.append(batch("beta", &secs, &[]));
        let first = *secs.iter().min().unwrap();
        report.rollup(Duration::from_secs(13));
        let kept = fine_secs(&report);
        assert_eq!(kept[0], first);
        for pair in kept.windows(2) {
            assert!(pair[1] - pair[0] > 13, "{pair:?}");
        }
    }

    #[test]
    fn test_rollup_zero_bucket_only_dedups_equal_timestamps() {
        let report = Report::new("beta");
        report.append(batch("beta", &[1, 1, 2, 3, 3], &[]));
        report.rollup(Duration::ZERO);
        assert_eq!(fine_secs(&report), vec![1, 2, 3]);
    }

    #[test]
    fn test_dedup_removes_only_exact_duplicates() {
        let report = Report::new("beta");
        let twice = TelemetryBatch {
            tap_name: "beta".to_string(),
            stable_samples: vec![
                sample_at(t0(), 0.1),
                sample_at(t0(), 0.2),
                sample_at(t0() + TimeDelta::seconds(1), 0.3),
            ],
            ..Default::default()
        };
        report.append(twice.clone());
        report.append(twice);
        // same timestamp, different reading
        report.append(batch("beta", &[], &[1]));

        assert_eq!(report.dedup(), 3);
        let ratios: Vec<f64> = report
            .snapshot()
            .stable_samples
            .iter()
            .map(|s| s.published_fill_ratio)
            .collect();
        assert_eq!(ratios, vec![0.1, 0.2, 0.3, 0.5]);
        assert_eq!(report.dedup(), 0);
    }

    // -----------------------------------------------------------------------
    // Save / summary
    // -----------------------------------------------------------------------

    #[test]
    fn test_save_writes_sorted_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(tmp.path());
        let report = Report::new("beta");
        report.append(batch("beta", &[3, 1, 2], &[9, 8]));

        let path = report.save(&store, "20220101", "rollup for era 20220101").unwrap();
        assert_eq!(path, store.stamped_path("beta", "20220101"));

        let stored: TelemetryBatch = store::read_gz_json(&path).unwrap();
        assert_eq!(stored, report.snapshot());
        let secs: Vec<i64> = stored
            .fine_samples
            .iter()
            .map(|s| (s.timestamp - t0()).num_seconds())
            .collect();
        assert_eq!(secs, vec![1, 2, 3]);
    }

    #[test]
    fn test_save_overwrites_existing_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(tmp.path());

        let a = Report::from_batch(batch("beta", &[1], &[]));
        a.save(&store, "20220101", "first").unwrap();
        let b = Report::from_batch(batch("beta", &[2, 3], &[]));
        let path = b.save(&store, "20220101", "second").unwrap();

        let stored: TelemetryBatch = store::read_gz_json(&path).unwrap();
        assert_eq!(stored.fine_samples.len(), 2);
    }

    #[test]
    fn test_summary_statistics() {
        let report = Report::new("beta");
        report.append(TelemetryBatch {
            tap_name: "beta".to_string(),
            raw_mass_full: 800_000,
            raw_mass_tare: 300_000,
            fine_samples: vec![],
            stable_samples: vec![
                sample_at(t0() + TimeDelta::minutes(3 * 1440 + 4 * 60 + 15), 0.75),
                sample_at(t0(), 0.25),
            ],
        });

        let summary = report.summary();
        assert_eq!(summary.stable_samples, 2);
        assert_eq!(summary.average_fill, Some(0.5));
        assert_eq!(summary.stdev_fill, Some(0.25));
        assert_eq!(summary.cached_range.as_deref(), Some("3d4h15m"));
        assert_eq!(summary.latest.map(|s| s.published_fill_ratio), Some(0.75));
    }

    #[test]
    fn test_summary_of_empty_report() {
        let summary = Report::new("beta").summary();
        assert_eq!(summary.latest, None);
        assert_eq!(summary.average_fill, None);
        assert_eq!(summary.cached_range, None);
    }
}
