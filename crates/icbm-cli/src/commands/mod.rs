pub mod repack;
pub mod serve;
pub mod status;
pub mod trim;

use icbm_core::TapSummary;

/// A ratio as a percentage with one decimal, `-` when absent.
pub fn percent(ratio: Option<f64>) -> String {
    match ratio {
        Some(r) => format!("{:.1}%", r * 100.0),
        None => "-".to_string(),
    }
}

pub const SUMMARY_HEADER: &str = "TAP                       FINE   STABLE   LATEST   AVERAGE          RANGE";

/// One line of the status table.
pub fn summary_row(s: &TapSummary) -> String {
    let average = match (s.average_fill, s.stdev_fill) {
        (Some(avg), Some(dev)) => format!("{} ± {}", percent(Some(avg)), percent(Some(dev))),
        _ => "-".to_string(),
    };
    format!(
        "{:<24} {:>6} {:>8} {:>8}   {:<16} {}",
        s.tap,
        s.fine_samples,
        s.stable_samples,
        percent(s.latest.map(|l| l.published_fill_ratio)),
        average,
        s.cached_range.as_deref().unwrap_or("-"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> TapSummary {
        TapSummary {
            tap: "Lunarville-beta".to_string(),
            fine_samples: 6,
            stable_samples: 2,
            raw_mass_full: 800_000,
            raw_mass_tare: 300_000,
            latest: None,
            average_fill: Some(0.5033),
            stdev_fill: Some(0.012),
            cached_range: Some("0d1h5m".to_string()),
        }
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(Some(0.5033333333333333)), "50.3%");
        assert_eq!(percent(Some(1.0)), "100.0%");
        assert_eq!(percent(None), "-");
    }

    #[test]
    fn test_summary_row() {
        let row = summary_row(&summary());
        assert!(row.starts_with("Lunarville-beta"));
        assert!(row.contains("50.3% ± 1.2%"), "{row}");
        assert!(row.ends_with("0d1h5m"));
    }

    #[test]
    fn test_summary_row_without_samples() {
        let mut s = summary();
        s.average_fill = None;
        s.stdev_fill = None;
        s.cached_range = None;
        let row = summary_row(&s);
        assert!(row.ends_with(" -"), "{row}");
    }
}
