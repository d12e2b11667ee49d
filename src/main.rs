use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use rusqlite::Connection;
use std::env;
use std::path::{Path, PathBuf};

use enrollment_tracker::{
    load_all_metrics, load_roster_csv, run_tick, setup_database, CategoryBreakdown,
    MetricsExtension, PipelineConfig, Snapshot, TrendDirection,
};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("run") => run_once(&args[2..]),
        Some("history") => show_history(&args[2..]),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("Enrollment Tracker v{}", enrollment_tracker::VERSION);
    println!();
    println!("Usage:");
    println!("  enrollment-tracker run <roster.csv> [--date YYYY-MM-DD] [--config config.json]");
    println!("  enrollment-tracker history [n]");
    println!();
    println!("Environment:");
    println!("  ENROLLMENT_DB   Path to the SQLite database (default: enrollment.db)");
}

fn database_path() -> PathBuf {
    env::var("ENROLLMENT_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("enrollment.db"))
}

fn open_database() -> Result<Connection> {
    let path = database_path();
    let conn = Connection::open(&path)
        .with_context(|| format!("Failed to open database: {}", path.display()))?;
    setup_database(&conn)?;
    Ok(conn)
}

fn run_once(args: &[String]) -> Result<()> {
    let Some(roster_path) = args.first() else {
        bail!("Missing roster CSV path (usage: run <roster.csv> [--date YYYY-MM-DD])");
    };

    let mut date = Local::now().date_naive();
    let mut config = PipelineConfig::default();

    let mut index = 1;
    while index < args.len() {
        match args[index].as_str() {
            "--date" => {
                let value = args
                    .get(index + 1)
                    .context("--date requires a YYYY-MM-DD value")?;
                date = value
                    .parse::<NaiveDate>()
                    .with_context(|| format!("Invalid date: {}", value))?;
                index += 2;
            }
            "--config" => {
                let value = args.get(index + 1).context("--config requires a path")?;
                config = PipelineConfig::from_json_file(Path::new(value))?;
                index += 2;
            }
            other => bail!("Unknown argument: {}", other),
        }
    }

    println!("📊 Enrollment Tracker - Daily Run");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // 1. Load roster
    println!("\n📂 Loading roster...");
    let entities = load_roster_csv(Path::new(roster_path))?;
    println!("✓ Loaded {} roster rows", entities.len());

    // 2. Capture snapshot and run the tick
    let snapshot = Snapshot::capture(date, entities);
    println!("\n🔧 Processing snapshot for {}...", date);

    let mut conn = open_database()?;
    let extensions: Vec<Box<dyn MetricsExtension>> = vec![Box::new(CategoryBreakdown)];
    let report = run_tick(&mut conn, &config, snapshot, &extensions)?;

    // 3. Report
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ {}", report.summary());

    match report.baseline_date {
        Some(baseline) => println!("   Baseline: {}", baseline),
        None => println!("   Baseline: none (bootstrap run)"),
    }

    if !report.added.is_empty() {
        println!("   Joined:  {}", report.added.join(", "));
    }
    if !report.removed.is_empty() {
        println!("   Left:    {}", report.removed.join(", "));
    }

    let direction = match report.trend.direction {
        TrendDirection::Increasing => "increasing",
        TrendDirection::Stable => "stable",
        TrendDirection::Decreasing => "decreasing",
    };
    println!(
        "   Trend:   {} (slope {:+.2}, forecast {:.0} next period)",
        direction, report.trend.slope, report.trend.forecast_next
    );

    if report.anomaly.is_anomaly {
        println!(
            "🚨 Anomaly: net change {} outside expected {:.1}..{:.1}",
            report.anomaly.observed, report.anomaly.expected_range.0, report.anomaly.expected_range.1
        );
    }

    if !report.extension_metrics.is_empty() {
        let mut keys: Vec<&String> = report.extension_metrics.keys().collect();
        keys.sort();
        println!("   Breakdown:");
        for key in keys {
            println!("     {} = {}", key, report.extension_metrics[key]);
        }
    }

    Ok(())
}

fn show_history(args: &[String]) -> Result<()> {
    let limit: usize = match args.first() {
        Some(value) => value
            .parse()
            .with_context(|| format!("Invalid history length: {}", value))?,
        None => 30,
    };

    let conn = open_database()?;
    let records = load_all_metrics(&conn)?;

    if records.is_empty() {
        println!("No metrics recorded yet. Run: enrollment-tracker run <roster.csv>");
        return Ok(());
    }

    println!("📈 Metrics history (last {} of {} records)", limit.min(records.len()), records.len());
    let start = records.len().saturating_sub(limit);
    for record in &records[start..] {
        let marker = if record.anomaly_flag { " 🚨" } else { "" };
        println!("  {}{}", record.summary(), marker);
    }

    Ok(())
}
