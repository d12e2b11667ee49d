// 📈 Trend Analyzer - Moving average, linear fit, next-period forecast
//
// Fits population totals over a trailing window with closed-form ordinary
// least squares (no numerical library needed) and projects the value for the
// day immediately following the window. Pure: never mutates input records.

use crate::metrics::MetricsRecord;
use serde::{Deserialize, Serialize};

/// Default trailing window width, shared with the anomaly detector
pub const DEFAULT_ANALYSIS_WINDOW: usize = 7;

// ============================================================================
// TREND SUMMARY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrendDirection {
    Increasing,
    Stable,
    Decreasing,
}

/// Result of fitting the trailing window of population totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendSummary {
    /// Arithmetic mean of `total_current` over the window
    pub moving_average: f64,

    /// OLS slope of `total_current` against a zero-based day index
    pub slope: f64,

    /// OLS intercept (fitted value at day index 0)
    pub intercept: f64,

    /// Predicted `total_current` for the day after the window:
    /// intercept + slope × window_length
    pub forecast_next: f64,

    /// Increasing when slope > 1, Decreasing when slope < -1, else Stable
    pub direction: TrendDirection,

    /// Population standard deviation of `net_change` over the window
    pub volatility: f64,

    /// Last total minus first total across the window
    pub total_change: i64,

    /// Days elapsed between first and last window point
    pub days_analyzed: usize,
}

// ============================================================================
// TREND ANALYZER
// ============================================================================

pub struct TrendAnalyzer {
    /// Trailing window width (default 7)
    window: usize,
}

impl Default for TrendAnalyzer {
    fn default() -> Self {
        TrendAnalyzer::new()
    }
}

impl TrendAnalyzer {
    pub fn new() -> Self {
        TrendAnalyzer {
            window: DEFAULT_ANALYSIS_WINDOW,
        }
    }

    pub fn with_window(window: usize) -> Self {
        TrendAnalyzer {
            window: window.max(1),
        }
    }

    /// Analyze the trailing window of an ordered series.
    ///
    /// Uses the last `window` records, or all of them when fewer exist
    /// (minimum 1). With exactly one point the fit degenerates to
    /// slope 0.0, intercept = that point's value. Returns `None` only for
    /// an empty series.
    pub fn analyze(&self, records: &[MetricsRecord]) -> Option<TrendSummary> {
        if records.is_empty() {
            return None;
        }

        let start = records.len().saturating_sub(self.window);
        let window = &records[start..];
        let n = window.len();

        let totals: Vec<f64> = window.iter().map(|r| r.total_current as f64).collect();
        let moving_average = totals.iter().sum::<f64>() / n as f64;

        let (slope, intercept) = least_squares(&totals);
        let forecast_next = intercept + slope * n as f64;

        let direction = if slope > 1.0 {
            TrendDirection::Increasing
        } else if slope < -1.0 {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Stable
        };

        let changes: Vec<f64> = window.iter().map(|r| r.net_change as f64).collect();
        let volatility = population_std_dev(&changes);

        let total_change =
            window[n - 1].total_current as i64 - window[0].total_current as i64;

        log::debug!(
            "Trend over {} points: slope {:.3}, forecast {:.1}",
            n,
            slope,
            forecast_next
        );

        Some(TrendSummary {
            moving_average,
            slope,
            intercept,
            forecast_next,
            direction,
            volatility,
            total_change,
            days_analyzed: n - 1,
        })
    }
}

/// Closed-form OLS fit of y against x = 0..n-1; (slope, intercept).
/// A single point yields slope 0.0 and intercept = that value.
fn least_squares(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n < 2 {
        return (0.0, values.first().copied().unwrap_or(0.0));
    }

    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = values.iter().sum::<f64>() / n as f64;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (index, &value) in values.iter().enumerate() {
        let dx = index as f64 - x_mean;
        sxy += dx * (value - y_mean);
        sxx += dx * dx;
    }

    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;
    (slope, intercept)
}

fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

// ============================================================================
// TESTS
// ============================================================================
