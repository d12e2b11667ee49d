// 🔁 Pipeline - One scheduling tick of the enrollment tracker
//
// Plain function, no scheduler coupling: the orchestrator (cron, Airflow,
// a shell loop) calls `run_tick` once per tick with the current snapshot.
// Everything inside one tick is sequential and commits atomically; a failed
// run leaves the store exactly as it was, so the caller can simply re-run
// the same date.

use crate::anomaly::{AnomalyAssessment, AnomalyDetector, DEFAULT_ANOMALY_MULTIPLIER};
use crate::db;
use crate::delta::{Delta, DeltaEngine};
use crate::extensions::{run_extensions, MetricsExtension};
use crate::metrics::{MetricsCalculator, MetricsRecord, MetricsSeries};
use crate::snapshot::Snapshot;
use crate::trend::{TrendAnalyzer, TrendSummary, DEFAULT_ANALYSIS_WINDOW};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tuning knobs for one pipeline run. Always passed explicitly; there is no
/// global configuration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How many days of snapshots and metrics to keep loaded/stored
    #[serde(default = "default_retention_window")]
    pub retention_window_days: i64,

    /// Trailing window width shared by trend and anomaly analysis
    #[serde(default = "default_analysis_window")]
    pub analysis_window: usize,

    /// Deviation multiplier k for the anomaly rule
    #[serde(default = "default_anomaly_multiplier")]
    pub anomaly_multiplier: f64,

    /// Optional label (e.g. "Fall 2025") carried into reports
    #[serde(default)]
    pub term_label: Option<String>,
}

fn default_retention_window() -> i64 {
    30
}

fn default_analysis_window() -> usize {
    DEFAULT_ANALYSIS_WINDOW
}

fn default_anomaly_multiplier() -> f64 {
    DEFAULT_ANOMALY_MULTIPLIER
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            retention_window_days: default_retention_window(),
            analysis_window: default_analysis_window(),
            anomaly_multiplier: default_anomaly_multiplier(),
            term_label: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file; absent keys fall back to defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }
}

// ============================================================================
// RUN REPORT
// ============================================================================

/// Everything downstream reporting consumers need from one tick: the
/// finalized record, the raw change lists, and the trend/anomaly analysis.
/// Plain data - no formatting happens here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Identity of this run (UUID)
    pub run_id: String,

    pub date: NaiveDate,

    /// Baseline snapshot date, None on bootstrap
    pub baseline_date: Option<NaiveDate>,

    pub term_label: Option<String>,

    /// The finalized metrics record (anomaly_flag and trend_value populated)
    pub record: MetricsRecord,

    /// Sorted identifier lists for human-readable change reports
    pub added: Vec<String>,
    pub removed: Vec<String>,

    pub trend: TrendSummary,

    pub anomaly: AnomalyAssessment,

    /// Merged name → value outputs of the registered extensions
    pub extension_metrics: HashMap<String, f64>,
}

impl RunReport {
    pub fn summary(&self) -> String {
        let mut line = self.record.summary();
        if self.record.anomaly_flag {
            line.push_str(" [ANOMALY]");
        }
        line
    }
}

// ============================================================================
// RUN TICK
// ============================================================================

/// Process one snapshot: compare against the baseline, derive metrics,
/// extend the series, analyze trend and anomaly, and commit.
///
/// All-or-nothing: snapshot capture, metrics upsert, and retention pruning
/// commit in a single transaction. Re-running an already-processed date is
/// safe (idempotent capture + metrics upsert); submitting a date older than
/// the series maximum is rejected before anything commits.
pub fn run_tick(
    conn: &mut Connection,
    config: &PipelineConfig,
    current: Snapshot,
    extensions: &[Box<dyn MetricsExtension>],
) -> Result<RunReport> {
    log::info!("Processing snapshot for {} ({} entities)", current.date, current.count());

    let tx = conn.transaction()?;

    // 1. Capture the current snapshot (no-op when identical re-run)
    db::insert_snapshot(&tx, &current)?;

    // 2. Baseline = most recent prior snapshot; absence is bootstrap
    let baseline = db::find_baseline(&tx, current.date)?;
    let baseline_date = baseline.as_ref().map(|s| s.date);
    let baseline_ids = baseline
        .as_ref()
        .map(|s| s.id_set())
        .unwrap_or_else(HashSet::new);

    match baseline_date {
        Some(date) => log::info!("Comparing against baseline {}", date),
        None => log::info!("No baseline found - bootstrap run"),
    }

    // 3. Membership delta and the dated record
    let current_ids = current.id_set();
    let delta = DeltaEngine::compare(&baseline_ids, &current_ids);
    let mut record = MetricsCalculator::calculate(
        current.date,
        baseline_ids.len(),
        current_ids.len(),
        &delta,
    );

    // 4. Rebuild the series from the stored lookback, excluding any row
    //    for the current date (upsert-before-append on re-runs)
    let lookback = config.retention_window_days.max(0) as usize;
    let history: Vec<MetricsRecord> = db::load_metrics_window(&tx, lookback)?
        .into_iter()
        .filter(|r| r.date != current.date)
        .collect();
    let mut series = MetricsSeries::from_records(history)?;

    // 5. Anomaly check against the trailing window (new record excluded)
    let detector = AnomalyDetector::with_settings(config.analysis_window, config.anomaly_multiplier);
    let anomaly = detector.evaluate(&record, series.all());
    record.anomaly_flag = anomaly.is_anomaly;

    // 6. Ordering is enforced here: an out-of-order date aborts the run
    series.append(record.clone())?;

    // 7. Trend over the trailing window including the new record; only the
    //    newest record receives the forecast
    let analyzer = TrendAnalyzer::with_window(config.analysis_window);
    let trend = analyzer
        .analyze(series.window(config.analysis_window))
        .context("Trend analysis on a non-empty series cannot fail")?;
    record.trend_value = Some(trend.forecast_next);

    // 8. Plug-in metrics
    let extension_metrics = run_extensions(extensions, &current, &delta);

    // 9. Persist and commit
    db::append_or_replace_metric(&tx, &record)?;
    db::prune_snapshots(&tx, current.date, config.retention_window_days)?;
    tx.commit()?;

    log::info!(
        "Run complete: {} total ({} new, {} dropped, {:+} net)",
        record.total_current,
        record.new_count,
        record.dropped_count,
        record.net_change
    );

    Ok(RunReport {
        run_id: uuid::Uuid::new_v4().to_string(),
        date: current.date,
        baseline_date,
        term_label: config.term_label.clone(),
        added: delta.sorted_added(),
        removed: delta.sorted_removed(),
        record,
        trend,
        anomaly,
        extension_metrics,
    })
}

/// Convenience for reporting collaborators that want entity details for the
/// change lists: resolve removed ids against the baseline snapshot and added
/// ids against the current one.
pub fn resolve_changes<'a>(
    delta: &Delta,
    baseline: Option<&'a Snapshot>,
    current: &'a Snapshot,
) -> (Vec<&'a crate::snapshot::Entity>, Vec<&'a crate::snapshot::Entity>) {
    let added = delta
        .sorted_added()
        .iter()
        .filter_map(|id| current.find(id))
        .collect();

    let removed = match baseline {
        Some(snapshot) => delta
            .sorted_removed()
            .iter()
            .filter_map(|id| snapshot.find(id))
            .collect(),
        None => Vec::new(),
    };

    (added, removed)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::CategoryBreakdown;
    use crate::metrics::SeriesError;
    use crate::snapshot::Entity;
    use std::io::Write;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        conn
    }

    fn snapshot(date_str: &str, ids: &[&str]) -> Snapshot {
        Snapshot::capture(date(date_str), ids.iter().map(|id| Entity::new(id)).collect())
    }

    fn snapshot_of_size(date_str: &str, size: usize) -> Snapshot {
        let ids: Vec<String> = (0..size).map(|i| format!("S{:05}", i)).collect();
        Snapshot::capture(
            date(date_str),
            ids.iter().map(|id| Entity::new(id)).collect(),
        )
    }

    #[test]
    fn test_bootstrap_run() {
        let mut conn = test_conn();
        let config = PipelineConfig::default();

        let report = run_tick(&mut conn, &config, snapshot("2024-09-01", &["A", "B", "C"]), &[])
            .unwrap();

        assert!(report.baseline_date.is_none());
        assert_eq!(report.record.total_current, 3);
        assert_eq!(report.record.new_count, 3);
        assert_eq!(report.record.retention_rate, 100.0);
        assert!(!report.record.anomaly_flag);
        assert_eq!(report.added, vec!["A", "B", "C"]);
        assert!(report.removed.is_empty());
        // Single-point trend degenerates to the observed value
        assert_eq!(report.record.trend_value, Some(3.0));
    }

    #[test]
    fn test_second_day_run() {
        let mut conn = test_conn();
        let config = PipelineConfig::default();

        run_tick(&mut conn, &config, snapshot("2024-09-01", &["A", "B", "C"]), &[]).unwrap();
        let report = run_tick(
            &mut conn,
            &config,
            snapshot("2024-09-02", &["B", "C", "D", "E"]),
            &[],
        )
        .unwrap();

        assert_eq!(report.baseline_date, Some(date("2024-09-01")));
        assert_eq!(report.added, vec!["D", "E"]);
        assert_eq!(report.removed, vec!["A"]);
        assert_eq!(report.record.net_change, 1);
        assert!((report.record.retention_rate - 66.67).abs() < 0.01);
        assert_eq!(db::verify_metrics_count(&conn).unwrap(), 2);
    }

    #[test]
    fn test_rerun_same_date_is_idempotent() {
        let mut conn = test_conn();
        let config = PipelineConfig::default();
        let snap = snapshot("2024-09-01", &["A", "B"]);

        let first = run_tick(&mut conn, &config, snap.clone(), &[]).unwrap();
        let second = run_tick(&mut conn, &config, snap, &[]).unwrap();

        // One metrics row, identical derived values, fresh run identity
        assert_eq!(db::verify_metrics_count(&conn).unwrap(), 1);
        assert_eq!(first.record, second.record);
        assert_ne!(first.run_id, second.run_id);
    }

    #[test]
    fn test_out_of_order_date_is_rejected_without_commit() {
        let mut conn = test_conn();
        let config = PipelineConfig::default();

        run_tick(&mut conn, &config, snapshot("2024-09-05", &["A"]), &[]).unwrap();

        let err = run_tick(&mut conn, &config, snapshot("2024-09-01", &["A", "B"]), &[])
            .unwrap_err();
        let series_err = err.downcast_ref::<SeriesError>().unwrap();
        assert!(matches!(series_err, SeriesError::OutOfOrder { .. }));

        // Nothing from the failed run persisted
        assert_eq!(db::verify_metrics_count(&conn).unwrap(), 1);
        assert!(db::load_snapshot(&conn, date("2024-09-01")).unwrap().is_none());
    }

    #[test]
    fn test_anomalous_spike_is_flagged_and_still_stored() {
        let mut conn = test_conn();
        let config = PipelineConfig::default();

        // A stable-but-varying week: sizes drift by a few entities per day
        let sizes = [1000, 1005, 1011, 1015, 1021, 1026, 1030, 1035];
        for (index, &size) in sizes.iter().enumerate() {
            let day = format!("2024-09-{:02}", index + 1);
            run_tick(&mut conn, &config, snapshot_of_size(&day, size), &[]).unwrap();
        }

        // Then 200 arrivals at once
        let report = run_tick(&mut conn, &config, snapshot_of_size("2024-09-09", 1235), &[])
            .unwrap();

        assert!(report.record.anomaly_flag);
        assert!(report.anomaly.is_anomaly);
        // Flagged records are annotated, not withheld
        let stored = db::load_all_metrics(&conn).unwrap();
        assert!(stored.last().unwrap().anomaly_flag);
    }

    #[test]
    fn test_growing_week_forecasts_growth() {
        let mut conn = test_conn();
        let config = PipelineConfig::default();

        let sizes = [100, 102, 101, 105, 107, 110, 112];
        for (index, &size) in sizes.iter().enumerate() {
            let day = format!("2024-09-{:02}", index + 1);
            run_tick(&mut conn, &config, snapshot_of_size(&day, size), &[]).unwrap();
        }

        let stored = db::load_all_metrics(&conn).unwrap();
        let latest = stored.last().unwrap();
        assert!((latest.trend_value.unwrap() - 113.0).abs() < 2.0);
        assert!(latest.trend_value.unwrap() > 112.0);
    }

    #[test]
    fn test_extensions_feed_the_report() {
        let mut conn = test_conn();
        let config = PipelineConfig::default();
        let extensions: Vec<Box<dyn MetricsExtension>> = vec![Box::new(CategoryBreakdown)];

        let snap = Snapshot::capture(
            date("2024-09-01"),
            vec![
                Entity::with_category("S001", "Engineering"),
                Entity::with_category("S002", "Engineering"),
                Entity::with_category("S003", "Business"),
            ],
        );

        let report = run_tick(&mut conn, &config, snap, &extensions).unwrap();

        assert_eq!(report.extension_metrics.get("category.Engineering"), Some(&2.0));
        assert_eq!(report.extension_metrics.get("category.Business"), Some(&1.0));
    }

    #[test]
    fn test_retention_pruning_runs_with_the_tick() {
        let mut conn = test_conn();
        let config = PipelineConfig {
            retention_window_days: 5,
            ..PipelineConfig::default()
        };

        run_tick(&mut conn, &config, snapshot("2024-09-01", &["A"]), &[]).unwrap();
        run_tick(&mut conn, &config, snapshot("2024-09-10", &["A", "B"]), &[]).unwrap();

        // The 09-01 snapshot fell outside the 5-day retention window
        assert!(db::load_snapshot(&conn, date("2024-09-01")).unwrap().is_none());
        // Its metrics row is retained - the series is the durable history
        assert_eq!(db::verify_metrics_count(&conn).unwrap(), 2);
    }

    #[test]
    fn test_config_defaults_and_json_loading() {
        let config = PipelineConfig::default();
        assert_eq!(config.retention_window_days, 30);
        assert_eq!(config.analysis_window, 7);
        assert_eq!(config.anomaly_multiplier, 2.0);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"analysis_window": 14, "term_label": "Fall 2025"}"#)
            .unwrap();
        file.flush().unwrap();

        let loaded = PipelineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded.analysis_window, 14);
        assert_eq!(loaded.term_label.as_deref(), Some("Fall 2025"));
        // Unspecified keys keep their defaults
        assert_eq!(loaded.retention_window_days, 30);
    }

    #[test]
    fn test_resolve_changes_returns_entity_details() {
        let baseline = Snapshot::capture(
            date("2024-09-01"),
            vec![Entity::with_category("A", "Arts"), Entity::new("B")],
        );
        let current = Snapshot::capture(
            date("2024-09-02"),
            vec![Entity::new("B"), Entity::with_category("C", "Business")],
        );

        let delta = DeltaEngine::compare(&baseline.id_set(), &current.id_set());
        let (added, removed) = resolve_changes(&delta, Some(&baseline), &current);

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].id, "C");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].category.as_deref(), Some("Arts"));
    }
}
