//! CLI for icbm, the Internet Connected Beverage Monitor.

mod commands;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use icbm_core::{DEFAULT_CHART_LINES, EngineConfig, parse_duration};
use icbm_server::ServerConfig;

#[derive(Parser)]
#[command(name = "icbm")]
#[command(about = "icbm: the Internet Connected Beverage Monitor")]
#[command(version = icbm_core::VERSION)]
struct Cli {
    /// Data directory holding one subdirectory per tap
    #[arg(long, global = true, default_value = "data")]
    data: PathBuf,

    /// How far back the live view reaches (e.g. 31d, 12h)
    #[arg(long, global = true, default_value = "31d", value_parser = parse_duration)]
    retention: Duration,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rehydrate from disk and accept telemetry over HTTP until Ctrl-C
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8081")]
        listen: String,

        /// JSON API key table. Without one the server is read-only.
        #[arg(long)]
        users: Option<PathBuf>,

        /// Lines kept in each tap's chart file
        #[arg(long, default_value_t = DEFAULT_CHART_LINES)]
        chart_lines: usize,

        /// How often to consolidate closed days into bundles
        #[arg(long, default_value = "6h", value_parser = parse_duration)]
        repack_every: Duration,

        /// Time budget for one consolidation pass
        #[arg(long, default_value = "10m", value_parser = parse_duration)]
        repack_budget: Duration,

        /// Give up on a single upload after this long
        #[arg(long, default_value = "10s", value_parser = parse_duration)]
        ingest_timeout: Duration,

        /// How often to log usage statistics
        #[arg(long, default_value = "1h", value_parser = parse_duration)]
        stats_every: Duration,
    },

    /// Bundle every closed day's raw update files and archive the originals
    Repack {
        /// Only this tap (default: every tap)
        #[arg(long)]
        tap: Option<String>,

        /// Stop starting new days after this long
        #[arg(long, value_parser = parse_duration)]
        budget: Option<Duration>,
    },

    /// Keep only the last N lines of a file, replacing it atomically
    Trim {
        /// File to trim
        file: PathBuf,

        /// Lines to keep
        #[arg(long, default_value_t = DEFAULT_CHART_LINES)]
        lines: usize,
    },

    /// Summarize what a server started now would hold
    Status {
        /// Only this tap (default: every tap)
        #[arg(long)]
        tap: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            listen,
            users,
            chart_lines,
            repack_every,
            repack_budget,
            ingest_timeout,
            stats_every,
        } => commands::serve::run(
            EngineConfig {
                data_dir: cli.data,
                retention: cli.retention,
                chart_lines,
            },
            ServerConfig {
                listen,
                users_path: users,
                repack_every,
                repack_budget,
                ingest_timeout,
                stats_every,
            },
        ),
        Commands::Repack { tap, budget } => {
            commands::repack::run(&cli.data, tap.as_deref(), budget)
        }
        Commands::Trim { file, lines } => commands::trim::run(&file, lines),
        Commands::Status { tap, json } => {
            commands::status::run(&cli.data, cli.retention, tap.as_deref(), json)
        }
    }
}
