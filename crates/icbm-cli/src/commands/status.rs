use std::path::Path;
use std::time::Duration;

use icbm_core::{Store, TapRegistry, TapSummary, sanitize};

use super::{SUMMARY_HEADER, summary_row};

pub fn run(data_dir: &Path, retention: Duration, tap: Option<&str>, json: bool) {
    let registry = TapRegistry::new();
    if let Err(e) = icbm_core::rehydrate(&Store::new(data_dir), &registry, retention) {
        eprintln!("Failed to read {}: {e}", data_dir.display());
        std::process::exit(1);
    }

    let names = match tap {
        Some(tap) => vec![sanitize(tap)],
        None => registry.tap_names(),
    };
    let summaries: Vec<TapSummary> = names.iter().filter_map(|t| registry.summary(t)).collect();

    if json {
        match serde_json::to_string_pretty(&summaries) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Failed to encode summary: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    if summaries.is_empty() {
        println!("No samples within {}s under {}", retention.as_secs(), data_dir.display());
        return;
    }
    println!("{SUMMARY_HEADER}");
    for s in &summaries {
        println!("{}", summary_row(s));
    }
}
