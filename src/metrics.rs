// 📊 Metrics Engine - Dated change metrics and the historical series
//
// MetricsCalculator turns one delta into one dated record; MetricsSeries is
// the append-only, strictly date-ordered history those records accumulate
// into. Trend and anomaly analysis both read from the series, so ordering
// violations are rejected rather than repaired.

use crate::delta::Delta;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum SeriesError {
    /// A record for this date is already in the series. Idempotent re-runs
    /// go through the store's upsert, not through append.
    #[error("series already contains a record for {date}")]
    DuplicateDate { date: NaiveDate },

    /// Appends must be strictly increasing by date
    #[error("record for {date} is older than series maximum {latest}")]
    OutOfOrder { date: NaiveDate, latest: NaiveDate },
}

// ============================================================================
// METRICS RECORD
// ============================================================================

/// One row of change metrics for a processed date.
///
/// Immutable after creation except for `trend_value` and `anomaly_flag`,
/// which the trend analyzer and anomaly detector populate within the same
/// run. Invariant: `total_current = retained + new_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub date: NaiveDate,

    /// Population size of the baseline snapshot (0 on bootstrap)
    pub baseline_total: usize,

    /// Population size of the current snapshot
    pub total_current: usize,

    /// |added|
    pub new_count: usize,

    /// |removed|
    pub dropped_count: usize,

    /// new_count − dropped_count
    pub net_change: i64,

    /// retained / baseline × 100; 100.0 when the baseline is empty
    pub retention_rate: f64,

    /// net_change / baseline × 100; 0.0 when the baseline is empty
    pub growth_rate: f64,

    /// Set by the anomaly detector in the same run
    pub anomaly_flag: bool,

    /// Forecast of the next period's population, set by the trend analyzer
    pub trend_value: Option<f64>,
}

impl MetricsRecord {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} total ({} new, {} dropped, {:+} net, {:.2}% retention)",
            self.date,
            self.total_current,
            self.new_count,
            self.dropped_count,
            self.net_change,
            self.retention_rate
        )
    }
}

// ============================================================================
// METRICS CALCULATOR
// ============================================================================

/// Pure derivation of a metrics record from one delta plus snapshot sizes.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Compute the dated record for one snapshot comparison.
    ///
    /// Division-by-zero policy: an empty baseline means there was nothing to
    /// retain, so retention is defined as 100.0 (full retention) and growth
    /// as 0.0 rather than leaving either undefined. Deterministic: identical
    /// inputs yield bit-identical records.
    pub fn calculate(
        date: NaiveDate,
        baseline_size: usize,
        current_size: usize,
        delta: &Delta,
    ) -> MetricsRecord {
        let new_count = delta.added_count();
        let dropped_count = delta.removed_count();
        let net_change = new_count as i64 - dropped_count as i64;

        let retention_rate = if baseline_size == 0 {
            100.0
        } else {
            round2(delta.retained_count() as f64 / baseline_size as f64 * 100.0)
        };

        let growth_rate = if baseline_size == 0 {
            0.0
        } else {
            round2(net_change as f64 / baseline_size as f64 * 100.0)
        };

        MetricsRecord {
            date,
            baseline_total: baseline_size,
            total_current: current_size,
            new_count,
            dropped_count,
            net_change,
            retention_rate,
            growth_rate,
            anomaly_flag: false,
            trend_value: None,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// METRICS SERIES
// ============================================================================

/// Ordered-by-date, append-only history of metrics records.
///
/// Unique per date, monotonically increasing, gaps allowed when a run was
/// skipped. Rebuilt from the store at the start of each run; owned by that
/// run until it commits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSeries {
    records: Vec<MetricsRecord>,
}

impl MetricsSeries {
    pub fn new() -> Self {
        MetricsSeries { records: Vec::new() }
    }

    /// Rebuild a series from already-ordered store rows.
    ///
    /// Rows are appended one by one, so a store that somehow returns
    /// unordered or duplicated dates is rejected here instead of being
    /// silently reordered.
    pub fn from_records(records: Vec<MetricsRecord>) -> Result<Self, SeriesError> {
        let mut series = MetricsSeries::new();
        for record in records {
            series.append(record)?;
        }
        Ok(series)
    }

    /// Append a record; its date must be strictly after the current maximum.
    pub fn append(&mut self, record: MetricsRecord) -> Result<(), SeriesError> {
        if let Some(latest) = self.latest() {
            if record.date == latest.date {
                return Err(SeriesError::DuplicateDate { date: record.date });
            }
            if record.date < latest.date {
                return Err(SeriesError::OutOfOrder {
                    date: record.date,
                    latest: latest.date,
                });
            }
        }

        self.records.push(record);
        Ok(())
    }

    /// Last n records in date order (all of them when fewer exist)
    pub fn window(&self, n: usize) -> &[MetricsRecord] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    /// Full ordered history
    pub fn all(&self) -> &[MetricsRecord] {
        &self.records
    }

    pub fn latest(&self) -> Option<&MetricsRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
