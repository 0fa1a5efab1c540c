//! frad-scan - one ripeness scan per invocation
//!
//! **Usage:**
//! ```bash
//! frad-scan [--count N] [--no-display] [--fake-sensor] [--config <file>] [--out-dir <dir>] [-v]
//! FORCE_FRUIT=banana frad-scan
//! AUTOTUNE="banana:r_over_g:>=:0.05" frad-scan
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use frad_scan::autotune_hook::AutotuneRequest;
use frad_scan::collaborators::Collaborators;
use frad_scan::config::LoggingConfig;
use frad_scan::{Pipeline, ScanConfig, ScanOptions};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Fruit ripeness scanner
#[derive(Parser, Debug)]
#[command(name = "frad-scan")]
#[command(about = "Scan one fruit and report its ripeness")]
#[command(version)]
struct Args {
    /// Readings to acquire (default from config)
    #[arg(long)]
    count: Option<usize>,

    /// Do not drive the status display
    #[arg(long)]
    no_display: bool,

    /// Allow simulated sensor readings when no sensor answers
    #[arg(long)]
    fake_sensor: bool,

    /// Config file (TOML); falls back to FRAD_CONFIG, then the user config dir
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory, overrides the config
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Skip classification and scan as this fruit
    #[arg(long, env = "FORCE_FRUIT")]
    force_fruit: Option<String>,

    /// Live threshold adjustment, `<fruit>:<feature>:<op>:<margin>`
    #[arg(long, env = "AUTOTUNE")]
    autotune: Option<String>,
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            registry
                .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
                .init();
        }
        None => registry.with(fmt::layer()).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        ScanConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(out_dir) = args.out_dir {
        if config.index_log == ScanConfig::default().index_log {
            config.index_log = out_dir.join("index_log.csv");
        }
        config.out_dir = out_dir;
    }
    if args.fake_sensor {
        config.acquisition.fake_sensor = true;
    }

    init_tracing(&config.logging, args.verbose)?;
    info!(out_dir = %config.out_dir.display(), "Starting frad-scan");

    let autotune = match args.autotune.as_deref().map(str::trim) {
        Some(request) if !request.is_empty() => {
            Some(request.parse::<AutotuneRequest>().context("Invalid AUTOTUNE request")?)
        }
        _ => None,
    };
    let options = ScanOptions {
        count: args.count,
        forced_fruit: args.force_fruit.filter(|f| !f.trim().is_empty()),
        autotune,
    };

    let collaborators = match Collaborators::from_config(&config, !args.no_display).await {
        Ok(collaborators) => collaborators,
        Err(e) => {
            error!(error = %e, "Cannot start scan");
            std::process::exit(1);
        }
    };

    let mut pipeline = Pipeline::new(config, collaborators);
    match pipeline.run(options).await {
        Ok(result) => {
            println!(
                "{} (confidence {:.2}) -> {}",
                result.decision.label,
                result.decision.confidence,
                result.files.result.display()
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, state = ?pipeline.state(), "Scan failed");
            std::process::exit(1);
        }
    }
}
