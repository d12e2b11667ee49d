// 🚨 Anomaly Detector - Flags days whose net change breaks the recent pattern
//
// Statistical check against the trailing distribution of net changes: a new
// record is anomalous when it falls outside mean ± k·σ of the trailing
// window. Advisory only - a flagged record is still appended and reported,
// just annotated.

use crate::metrics::MetricsRecord;
use crate::trend::DEFAULT_ANALYSIS_WINDOW;
use serde::{Deserialize, Serialize};

/// Default deviation multiplier k
pub const DEFAULT_ANOMALY_MULTIPLIER: f64 = 2.0;

// ============================================================================
// ASSESSMENT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AnomalyKind {
    /// Net change far above the expected range
    Spike,
    /// Net change far below the expected range
    Drop,
}

/// Outcome of evaluating one new record against its trailing window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyAssessment {
    pub is_anomaly: bool,

    /// Spike or Drop when flagged, None otherwise
    pub kind: Option<AnomalyKind>,

    /// The net change that was evaluated
    pub observed: i64,

    /// Mean of trailing net changes (0.0 on cold start)
    pub mean: f64,

    /// Sample standard deviation of trailing net changes (0.0 on cold start)
    pub std_dev: f64,

    /// (mean − k·σ, mean + k·σ)
    pub expected_range: (f64, f64),

    /// Trailing records the statistics were computed over
    pub sample_size: usize,
}

impl AnomalyAssessment {
    fn normal(observed: i64, mean: f64, std_dev: f64, range: (f64, f64), n: usize) -> Self {
        AnomalyAssessment {
            is_anomaly: false,
            kind: None,
            observed,
            mean,
            std_dev,
            expected_range: range,
            sample_size: n,
        }
    }
}

// ============================================================================
// ANOMALY DETECTOR
// ============================================================================

pub struct AnomalyDetector {
    /// Trailing window width (default 7, shared with the trend analyzer)
    window: usize,

    /// Deviation multiplier k (default 2.0)
    multiplier: f64,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        AnomalyDetector::new()
    }
}

impl AnomalyDetector {
    pub fn new() -> Self {
        AnomalyDetector {
            window: DEFAULT_ANALYSIS_WINDOW,
            multiplier: DEFAULT_ANOMALY_MULTIPLIER,
        }
    }

    pub fn with_settings(window: usize, multiplier: f64) -> Self {
        AnomalyDetector {
            window: window.max(1),
            multiplier,
        }
    }

    /// Evaluate a new record against trailing history (which must exclude
    /// the new record itself).
    ///
    /// Policies:
    /// - cold start: fewer than 2 trailing records never flags
    /// - zero variance: a perfectly stable trailing window never flags
    pub fn evaluate(
        &self,
        new_record: &MetricsRecord,
        trailing: &[MetricsRecord],
    ) -> AnomalyAssessment {
        let observed = new_record.net_change;

        let start = trailing.len().saturating_sub(self.window);
        let window = &trailing[start..];
        let n = window.len();

        if n < 2 {
            // Not enough history to call anything unusual
            return AnomalyAssessment::normal(observed, 0.0, 0.0, (0.0, 0.0), n);
        }

        let changes: Vec<f64> = window.iter().map(|r| r.net_change as f64).collect();
        let mean = changes.iter().sum::<f64>() / n as f64;
        let std_dev = sample_std_dev(&changes, mean);

        let lower = mean - self.multiplier * std_dev;
        let upper = mean + self.multiplier * std_dev;
        let range = (lower, upper);

        if std_dev <= 0.0 {
            // A flat window would flag any nonzero deviation; suppress it
            return AnomalyAssessment::normal(observed, mean, std_dev, range, n);
        }

        let value = observed as f64;
        let kind = if value > upper {
            Some(AnomalyKind::Spike)
        } else if value < lower {
            Some(AnomalyKind::Drop)
        } else {
            None
        };

        if let Some(kind) = kind {
            log::warn!(
                "Anomalous net change {} on {} (expected {:.1}..{:.1})",
                observed,
                new_record.date,
                lower,
                upper
            );
            return AnomalyAssessment {
                is_anomaly: true,
                kind: Some(kind),
                observed,
                mean,
                std_dev,
                expected_range: range,
                sample_size: n,
            };
        }

        AnomalyAssessment::normal(observed, mean, std_dev, range, n)
    }
}

fn sample_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let sum_squares: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (sum_squares / (values.len() - 1) as f64).sqrt()
}

// ============================================================================
// TESTS
// ============================================================================
