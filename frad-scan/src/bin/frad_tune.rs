//! frad-tune - offline accuracy evaluation, threshold search and stability checks
//!
//! **Usage:**
//! ```bash
//! frad-tune evaluate --fresh <dir> --bad <dir> --cal <file> [--json-out <file>]
//! frad-tune search --fresh <dir> --bad <dir> [--use-nir] [--write-cal --cal <file>] [--json-out <file>]
//! frad-tune stability repeat --dir <dir> --spot <name> [--json-out <file>]
//! frad-tune stability sep --a <dir> --b <dir> [--json-out <file>]
//! ```
//!
//! Exit status 2 means the data was insufficient for a verdict.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use frad_common::autotune::{self, default_feature_space};
use frad_common::calibration::load_calibration;
use frad_common::evaluation::{score_populations, write_json_report, AccuracyReport, LabeledRow};
use frad_common::index_log::{collect_csv_files, first_rows, load_population};
use frad_common::stability::{repeatability, separation};
use frad_common::{Error, FeatureRow};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Offline tuning tools for the ripeness scanner
#[derive(Parser, Debug)]
#[command(name = "frad-tune")]
#[command(about = "Evaluate and tune ripeness thresholds from recorded index rows")]
struct Args {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score a calibration's rules on labeled populations
    Evaluate {
        /// Directory of index-row files that should classify as ripe
        #[arg(long)]
        fresh: PathBuf,
        /// Directory of index-row files that should not
        #[arg(long)]
        bad: PathBuf,
        /// Calibration document holding the decision rules
        #[arg(long)]
        cal: PathBuf,
        #[arg(long, value_name = "FILE")]
        json_out: Option<PathBuf>,
    },

    /// Grid-search thresholds that best separate the populations
    Search {
        #[arg(long)]
        fresh: PathBuf,
        #[arg(long)]
        bad: PathBuf,
        /// Also tune nir_over_red
        #[arg(long)]
        use_nir: bool,
        /// Write the best rules into the calibration document
        #[arg(long, requires = "cal")]
        write_cal: bool,
        #[arg(long)]
        cal: Option<PathBuf>,
        #[arg(long, value_name = "FILE")]
        json_out: Option<PathBuf>,
    },

    /// Repeatability and separation checks
    Stability {
        #[command(subcommand)]
        mode: StabilityMode,
    },
}

#[derive(Subcommand, Debug)]
enum StabilityMode {
    /// Coefficient of variation over repeated runs of one spot
    Repeat {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value = "spot")]
        spot: String,
        #[arg(long, value_name = "FILE")]
        json_out: Option<PathBuf>,
    },

    /// Mean index difference between two groups
    Sep {
        #[arg(long)]
        a: PathBuf,
        #[arg(long)]
        b: PathBuf,
        #[arg(long, default_value = "A")]
        name_a: String,
        #[arg(long, default_value = "B")]
        name_b: String,
        #[arg(long, value_name = "FILE")]
        json_out: Option<PathBuf>,
    },
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(args.command) {
        let insufficient = e
            .chain()
            .any(|cause| matches!(cause.downcast_ref::<Error>(), Some(Error::InsufficientData(_))));
        error!("{:#}", e);
        std::process::exit(if insufficient { 2 } else { 1 });
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Evaluate {
            fresh,
            bad,
            cal,
            json_out,
        } => evaluate(&fresh, &bad, &cal, json_out.as_deref()),
        Command::Search {
            fresh,
            bad,
            use_nir,
            write_cal,
            cal,
            json_out,
        } => search(&fresh, &bad, use_nir, write_cal.then_some(cal).flatten(), json_out.as_deref()),
        Command::Stability { mode } => stability(mode),
    }
}

fn load_populations(fresh: &Path, bad: &Path) -> Result<(Vec<LabeledRow>, Vec<LabeledRow>)> {
    let fresh_rows = load_population(fresh)
        .with_context(|| format!("Failed to load fresh population {}", fresh.display()))?;
    let bad_rows = load_population(bad)
        .with_context(|| format!("Failed to load bad population {}", bad.display()))?;
    info!(fresh = fresh_rows.len(), bad = bad_rows.len(), "Populations loaded");
    Ok((fresh_rows, bad_rows))
}

fn print_report(report: &AccuracyReport) {
    println!(
        "accuracy {:.3}  (n={}  TP={} TN={} FP={} FN={})",
        report.accuracy,
        report.n,
        report.overall.tp,
        report.overall.tn,
        report.overall.fp,
        report.overall.fn_
    );
    for (distance, c) in &report.per_distance {
        println!(
            "  {:<8} accuracy {:.3}  (TP={} TN={} FP={} FN={})",
            distance,
            c.accuracy(),
            c.tp,
            c.tn,
            c.fp,
            c.fn_
        );
    }
    if !report.misclassified.is_empty() {
        println!("misclassified:");
        for path in &report.misclassified {
            println!("  {}", path.display());
        }
    }
}

fn evaluate(fresh: &Path, bad: &Path, cal: &Path, json_out: Option<&Path>) -> Result<()> {
    let profile = load_calibration(cal)
        .with_context(|| format!("Failed to load calibration {}", cal.display()))?;
    let Some(config) = profile.decision else {
        bail!("calibration {} has no decision rules", cal.display());
    };
    let (fresh_rows, bad_rows) = load_populations(fresh, bad)?;
    if fresh_rows.is_empty() && bad_rows.is_empty() {
        return Err(Error::InsufficientData("no index rows in either population".to_string()).into());
    }

    let report = score_populations(&fresh_rows, &bad_rows, &config);
    print_report(&report);
    if let Some(path) = json_out {
        write_json_report(path, &report)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
    }
    Ok(())
}

fn search(
    fresh: &Path,
    bad: &Path,
    use_nir: bool,
    write_cal: Option<PathBuf>,
    json_out: Option<&Path>,
) -> Result<()> {
    let (fresh_rows, bad_rows) = load_populations(fresh, bad)?;
    let space = default_feature_space(use_nir);
    let outcome = autotune::search(&fresh_rows, &bad_rows, &space)?;

    println!("best thresholds ({} combinations):", outcome.combinations);
    for (feature, value) in &outcome.thresholds {
        println!("  {} {} {:.6}", feature.name, feature.operator, value);
    }
    print_report(&outcome.report);

    if let Some(path) = json_out {
        write_json_report(path, &outcome)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
    }
    if let Some(cal) = write_cal {
        let backup = autotune::persist(&outcome.to_decision_config(), &cal)
            .with_context(|| format!("Failed to write calibration {}", cal.display()))?;
        println!("wrote {}", cal.display());
        if let Some(backup) = backup {
            println!("backup {}", backup.display());
        }
    }
    Ok(())
}

/// Feature rows of the first record of every CSV under `dir`
fn first_row_features(dir: &Path) -> Result<(Vec<FeatureRow>, Vec<PathBuf>)> {
    let files = collect_csv_files(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?;
    let rows = first_rows(&files)?;
    Ok(rows
        .into_iter()
        .map(|(path, record)| (record.features(), path))
        .unzip())
}

fn stability(mode: StabilityMode) -> Result<()> {
    match mode {
        StabilityMode::Repeat {
            dir,
            spot,
            json_out,
        } => {
            let (rows, files) = first_row_features(&dir)?;
            let report = repeatability(&spot, &rows, files);
            for (index, metric) in &report.metrics {
                println!(
                    "  {:<13} mean {}  cv {}  limit {:.2}  {}",
                    index,
                    fmt_opt(metric.mean),
                    fmt_opt(metric.cv),
                    metric.threshold,
                    if metric.pass { "PASS" } else { "FAIL" }
                );
            }
            println!("{} over {} runs: {}", report.spot, report.n, verdict(report.all_pass()));
            if let Some(path) = json_out {
                write_json_report(&path, &report)?;
            }
        }
        StabilityMode::Sep {
            a,
            b,
            name_a,
            name_b,
            json_out,
        } => {
            let (rows_a, _) = first_row_features(&a)?;
            let (rows_b, _) = first_row_features(&b)?;
            let report = separation(&name_a, &rows_a, &name_b, &rows_b);
            for (index, metric) in &report.deltas {
                println!(
                    "  {:<13} delta {}  min {}  {}",
                    index,
                    fmt_opt(metric.delta),
                    fmt_opt(metric.threshold),
                    if metric.pass { "PASS" } else { "FAIL" }
                );
            }
            if let Some(path) = json_out {
                write_json_report(&path, &report)?;
            }
        }
    }
    Ok(())
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.4}", v))
}

fn verdict(pass: bool) -> &'static str {
    if pass {
        "PASS"
    } else {
        "FAIL"
    }
}
