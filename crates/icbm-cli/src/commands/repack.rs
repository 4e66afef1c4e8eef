use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use icbm_core::{RepackSummary, Store, sanitize};

pub fn run(data_dir: &Path, tap: Option<&str>, budget: Option<Duration>) {
    let store = Store::new(data_dir);
    let today = Utc::now().date_naive();
    let deadline = budget.map(|b| Instant::now() + b);

    let result = match tap {
        Some(tap) => icbm_core::repack_at(&store, &sanitize(tap), today, deadline).map(|s| vec![s]),
        None => icbm_core::repack_all(&store, today, deadline),
    };
    let done = match result {
        Ok(done) => done,
        Err(e) => {
            eprintln!("Repack failed: {e}");
            std::process::exit(1);
        }
    };

    if done.is_empty() {
        println!("No taps under {}", data_dir.display());
        return;
    }
    for summary in &done {
        print_summary(summary);
    }
}

fn print_summary(s: &RepackSummary) {
    let eras = if s.eras.is_empty() {
        "nothing to bundle".to_string()
    } else {
        format!("bundled {}", s.eras.join(", "))
    };
    println!(
        "{:<24} {eras}; {} archived, {} left for later",
        s.tap, s.archived, s.deferred
    );
    for name in &s.skipped {
        println!("  skipped unreadable {name}");
    }
    if s.out_of_time {
        println!("  out of time, run again to continue");
    }
}
