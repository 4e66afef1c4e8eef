//! # icbm-core
//!
//! **Internet Connected Beverage Monitor: tap telemetry engine.**
//!
//! Each tap (a fridge with a scale under the keg) posts batches of fill-level
//! samples. This crate keeps a bounded recent history per tap in memory and
//! files every batch on disk, consolidating old batches into one bundle per
//! day.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use icbm_core::{EngineConfig, Ingestor, TapRegistry, TelemetryBatch};
//!
//! let config = EngineConfig::default();
//! let registry = Arc::new(TapRegistry::new());
//! icbm_core::rehydrate(&icbm_core::Store::new(&config.data_dir), &registry, config.retention)?;
//!
//! let ingestor = Ingestor::new(config, Arc::clone(&registry));
//! let batch = TelemetryBatch::from_json(br#"{"FridgeName": "beta"}"#)?;
//! ingestor.ingest(batch)?;
//! # Ok::<(), icbm_core::IcbmError>(())
//! ```
//!
//! ## Architecture
//!
//! device → [`Ingestor`] → [`TapRegistry`] ([`Report`] per tap) + chart file + raw update file
//!
//! raw update files → [`repack`] → daily bundles → [`rehydrate`] at startup
//!
//! See [`store`] for the on-disk layout.

pub mod archive;
pub mod config;
pub mod error;
pub mod ingest;
pub mod registry;
pub mod rehydrate;
pub mod report;
pub mod sample;
pub mod store;
pub mod tail;

pub use archive::{RepackSummary, repack, repack_all, repack_at};
pub use config::{DEFAULT_CHART_LINES, DEFAULT_RETENTION, EngineConfig, parse_duration};
pub use error::{IcbmError, Result};
pub use ingest::{IngestMetrics, IngestReceipt, Ingestor, MetricsSnapshot};
pub use registry::TapRegistry;
pub use rehydrate::{RehydrateSummary, rehydrate, rehydrate_at};
pub use report::{Report, TapSummary, append_batch};
pub use sample::{Sample, TelemetryBatch, chart_ratio, sanitize};
pub use store::Store;
pub use tail::trim_to_last_lines;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
