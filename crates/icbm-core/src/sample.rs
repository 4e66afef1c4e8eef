//! Telemetry wire types.
//!
//! Field names on the wire are the ones the fridge firmware sends
//! (`FridgeName`, `RawSamples`, `PubFillRatio`, ...). The same encoding is used
//! for raw update files and era bundles on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IcbmError, Result};

/// One reading from a tap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Fill ratio as published by the device. Not clamped; may fall outside
    /// `[0, 1]` when the scale drifts.
    #[serde(rename = "PubFillRatio")]
    pub published_fill_ratio: f64,
    #[serde(rename = "RawFillRatio")]
    pub raw_fill_ratio: f64,
    #[serde(rename = "RawMass")]
    pub raw_mass: i64,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// A decoded telemetry payload, or a snapshot of a whole aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBatch {
    #[serde(rename = "FridgeName")]
    pub tap_name: String,
    #[serde(rename = "RawMassFull", default)]
    pub raw_mass_full: i64,
    #[serde(rename = "RawMassTare", default)]
    pub raw_mass_tare: i64,
    /// Seconds-scale readings.
    #[serde(rename = "RawSamples", default)]
    pub fine_samples: Vec<Sample>,
    /// Minutes-scale smoothed readings, used for charting.
    #[serde(rename = "StableSamples", default)]
    pub stable_samples: Vec<Sample>,
}

impl TelemetryBatch {
    /// Decode a request body. The tap name is sanitized; a name that is empty
    /// afterwards is rejected.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let mut batch: TelemetryBatch = serde_json::from_slice(body)?;
        let clean = sanitize(&batch.tap_name);
        if clean.is_empty() {
            return Err(IcbmError::InvalidTapName(batch.tap_name));
        }
        batch.tap_name = clean;
        Ok(batch)
    }

    pub fn is_empty(&self) -> bool {
        self.fine_samples.is_empty() && self.stable_samples.is_empty()
    }
}

/// Strip everything but ASCII alphanumerics, `-` and `.` from a tap name.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .collect()
}

/// Chart ratio: the published fill ratio pinned into `[0, 1]`.
pub fn chart_ratio(sample: &Sample) -> f64 {
    sample.published_fill_ratio.clamp(0.0, 1.0)
}
