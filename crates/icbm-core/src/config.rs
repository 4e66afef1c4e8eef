//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default retention window for the live registry.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(31 * 24 * 3600);

/// Default number of lines kept in each chart data file.
pub const DEFAULT_CHART_LINES: usize = 10_000;

/// Settings shared by ingestion, archival and rehydration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory holding one subdirectory per tap.
    pub data_dir: PathBuf,
    /// Samples older than this are dropped from the live registry and
    /// bundles older than this are not rehydrated.
    pub retention: Duration,
    /// Maximum number of lines kept in a tap's chart file.
    pub chart_lines: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            retention: DEFAULT_RETENTION,
            chart_lines: DEFAULT_CHART_LINES,
        }
    }
}

/// Parse a duration string like "250ms", "30s", "15m", "6h" or "31d".
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();

    let (numeric, multiplier) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 1u64)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1000)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60_000)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3_600_000)
    } else if let Some(rest) = s.strip_suffix('d') {
        (rest, 86_400_000)
    } else {
        (s, 1000)
    };

    let value: u64 = numeric
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {s:?}"))?;
    value
        .checked_mul(multiplier)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration out of range: {s:?}"))
}
