// Enrollment Tracker - Core Library
// Snapshot-delta and metrics engine for tracking an enrolled population
// over time: membership deltas, retention/growth metrics, trend fitting,
// and anomaly flagging, with SQLite persistence between runs.

pub mod snapshot;
pub mod delta;
pub mod metrics;
pub mod trend;
pub mod anomaly;
pub mod extensions;
pub mod db;
pub mod pipeline;

// Re-export commonly used types
pub use snapshot::{
    Entity, Snapshot, SnapshotError,
    load_roster_csv,
};
pub use delta::{Delta, DeltaEngine};
pub use metrics::{
    MetricsCalculator, MetricsRecord, MetricsSeries, SeriesError,
};
pub use trend::{
    TrendAnalyzer, TrendDirection, TrendSummary, DEFAULT_ANALYSIS_WINDOW,
};
pub use anomaly::{
    AnomalyAssessment, AnomalyDetector, AnomalyKind, DEFAULT_ANOMALY_MULTIPLIER,
};
pub use extensions::{CategoryBreakdown, MetricsExtension, run_extensions};
pub use db::{
    setup_database, insert_snapshot, load_snapshot, find_baseline,
    load_metrics_window, load_all_metrics, append_or_replace_metric,
    prune_snapshots, verify_metrics_count, SnapshotInsert,
};
pub use pipeline::{run_tick, resolve_changes, PipelineConfig, RunReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
