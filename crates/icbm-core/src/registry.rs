//! Live per-tap state.
//!
//! The registry maps each tap name to its one live [`Report`]. Resolving a
//! name (and allocating on first sight) happens under the registry's own lock;
//! mutating a report happens under that report's lock, so taps never block
//! each other once resolved.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::report::{Report, TapSummary};
use crate::sample::TelemetryBatch;

/// Process-wide tap state, shared by handle.
#[derive(Debug, Default)]
pub struct TapRegistry {
    taps: RwLock<HashMap<String, Arc<Report>>>,
}

impl TapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Report>>> {
        match self.taps.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::error!("tap registry lock poisoned; continuing with inner state");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Report>>> {
        match self.taps.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::error!("tap registry lock poisoned; continuing with inner state");
                poisoned.into_inner()
            }
        }
    }

    /// Merge a batch into its tap's report, creating the report on first
    /// sight. Returns the live report.
    ///
    /// The batch lands while the registry lock is held, so a concurrent
    /// [`TapRegistry::keep_since_at`] or [`TapRegistry::trim`] can't drop the
    /// report between lookup and append.
    pub fn append(&self, batch: TelemetryBatch) -> Arc<Report> {
        {
            let taps = self.read();
            if let Some(report) = taps.get(&batch.tap_name) {
                report.append(batch);
                return Arc::clone(report);
            }
        }

        let mut taps = self.write();
        // another writer may have created it since the read lock was released
        if let Some(report) = taps.get(&batch.tap_name) {
            report.append(batch);
            return Arc::clone(report);
        }
        let report = Arc::new(Report::from_batch(batch));
        taps.insert(report.tap_name().to_string(), Arc::clone(&report));
        report
    }

    /// [`TapRegistry::append`] then drop everything in that tap older than
    /// `retention` before `now`.
    pub fn append_within(
        &self,
        batch: TelemetryBatch,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Arc<Report> {
        let report = self.append(batch);
        report.keep_since_at(retention, now);
        report
    }

    pub fn get(&self, tap: &str) -> Option<Arc<Report>> {
        self.read().get(tap).cloned()
    }

    pub fn tap_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn summary(&self, tap: &str) -> Option<TapSummary> {
        self.get(tap).map(|report| report.summary())
    }

    /// Apply the retention window to every tap, dropping taps left empty.
    pub fn keep_since(&self, retention: Duration) {
        self.keep_since_at(retention, Utc::now());
    }

    pub fn keep_since_at(&self, retention: Duration, now: DateTime<Utc>) {
        for report in self.reports() {
            report.keep_since_at(retention, now);
        }
        self.drop_empty();
    }

    /// Cap a tap's series at `max` samples each. A tap trimmed to nothing is
    /// removed. Unknown taps are ignored.
    pub fn trim(&self, tap: &str, max: usize) {
        if let Some(report) = self.get(tap) {
            report.trim(max);
            self.drop_empty();
        }
    }

    /// Downsample a tap's series. Unknown taps are ignored.
    pub fn rollup(&self, tap: &str, bucket: Duration) {
        if let Some(report) = self.get(tap) {
            report.rollup(bucket);
        }
    }

    fn reports(&self) -> Vec<Arc<Report>> {
        self.read().values().cloned().collect()
    }

    fn drop_empty(&self) {
        self.write().retain(|tap, report| {
            let keep = !report.is_empty();
            if !keep {
                log::debug!("dropping empty report for {tap}");
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Sample;
    use chrono::TimeDelta;

    fn batch(tap: &str, ages_secs: &[i64]) -> TelemetryBatch {
        let now = Utc::now();
        let samples: Vec<Sample> = ages_secs
            .iter()
            .map(|&age| Sample {
                published_fill_ratio: 0.5,
                raw_fill_ratio: 0.6,
                raw_mass: 600_000,
                timestamp: now - TimeDelta::seconds(age),
            })
            .collect();
        TelemetryBatch {
            tap_name: tap.to_string(),
            raw_mass_full: 800_000,
            raw_mass_tare: 300_000,
            fine_samples: samples.clone(),
            stable_samples: samples,
        }
    }

    #[test]
    fn test_first_append_creates_report() {
        let registry = TapRegistry::new();
        assert!(registry.get("beta").is_none());
        let report = registry.append(batch("beta", &[1, 2]));
        assert_eq!(report.counts(), (2, 2));
        assert!(Arc::ptr_eq(&report, &registry.get("beta").unwrap()));
        assert_eq!(registry.tap_names(), vec!["beta"]);
    }

    #[test]
    fn test_taps_are_independent() {
        let registry = TapRegistry::new();
        registry.append(batch("alpha", &[1]));
        registry.append(batch("beta", &[1, 2, 3]));
        assert_eq!(registry.get("alpha").unwrap().counts(), (1, 1));
        assert_eq!(registry.get("beta").unwrap().counts(), (3, 3));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_first_sight_allocates_once() {
        let registry = Arc::new(TapRegistry::new());
        std::thread::scope(|s| {
            for _ in 0..16 {
                let registry = Arc::clone(&registry);
                s.spawn(move || {
                    registry.append(batch("new-tap", &[1]));
                });
            }
        });
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("new-tap").unwrap().counts(), (16, 16));
    }

    #[test]
    fn test_append_within_applies_retention() {
        let registry = TapRegistry::new();
        let report = registry.append_within(
            batch("beta", &[10, 7200]),
            Duration::from_secs(3600),
            Utc::now(),
        );
        assert_eq!(report.counts(), (1, 1));
    }

    #[test]
    fn test_append_racing_retention_is_never_orphaned() {
        for _ in 0..200 {
            let registry = TapRegistry::new();
            registry.append(batch("beta", &[90_000]));
            std::thread::scope(|s| {
                s.spawn(|| registry.keep_since(Duration::from_secs(3600)));
                s.spawn(|| {
                    registry.append(batch("beta", &[1]));
                });
            });
            // the fresh sample is in whichever report the registry holds now
            assert_eq!(registry.get("beta").map(|r| r.counts()), Some((1, 1)));
        }
    }

    #[test]
    fn test_trim_to_empty_removes_tap() {
        let registry = TapRegistry::new();
        registry.append(batch("beta", &[1, 2]));
        registry.trim("beta", 1);
        assert_eq!(registry.get("beta").unwrap().counts(), (1, 1));
        registry.trim("beta", 0);
        assert!(registry.get("beta").is_none());
        registry.trim("ghost", 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_keep_since_over_all_taps() {
        let registry = TapRegistry::new();
        registry.append(batch("fresh", &[5]));
        registry.append(batch("stale", &[90_000]));
        registry.keep_since(Duration::from_secs(3600));
        assert_eq!(registry.tap_names(), vec!["fresh"]);
    }

    #[test]
    fn test_summary_and_rollup() {
        let registry = TapRegistry::new();
        registry.append(batch("beta", &[0, 1, 2, 120]));
        registry.rollup("beta", Duration::from_secs(60));
        let summary = registry.summary("beta").unwrap();
        assert_eq!(summary.stable_samples, 2);
        assert_eq!(summary.fine_samples, 2);
        assert!(registry.summary("ghost").is_none());
    }
}
