// 🧩 Metrics Extensions - Capability-based plug-in metrics
//
// Extra per-run metrics are contributed through a single-method capability
// trait rather than subclassing the engine. The pipeline invokes zero or
// more registered extensions and merges their name → value outputs into the
// run report; the core never interprets them.

use crate::delta::Delta;
use crate::snapshot::Snapshot;
use std::collections::HashMap;

// ============================================================================
// EXTENSION TRAIT
// ============================================================================

/// One pluggable metrics capability.
///
/// Implementations must be pure with respect to their inputs: the snapshot
/// and delta are read-only and the same inputs must yield the same values.
pub trait MetricsExtension {
    /// Short identifier used to namespace the extension's output
    fn name(&self) -> &str;

    /// Compute named values from the current snapshot and its delta
    fn compute(&self, snapshot: &Snapshot, delta: &Delta) -> HashMap<String, f64>;
}

/// Run every registered extension, namespacing keys as `<name>.<key>`.
pub fn run_extensions(
    extensions: &[Box<dyn MetricsExtension>],
    snapshot: &Snapshot,
    delta: &Delta,
) -> HashMap<String, f64> {
    let mut merged = HashMap::new();

    for extension in extensions {
        let values = extension.compute(snapshot, delta);
        log::debug!("Extension {} produced {} values", extension.name(), values.len());
        for (key, value) in values {
            merged.insert(format!("{}.{}", extension.name(), key), value);
        }
    }

    merged
}

// ============================================================================
// BUILT-IN: CATEGORY BREAKDOWN
// ============================================================================

/// Headcount per category label in the current snapshot.
///
/// Entities without a category are grouped under `uncategorized`.
pub struct CategoryBreakdown;

impl MetricsExtension for CategoryBreakdown {
    fn name(&self) -> &str {
        "category"
    }

    fn compute(&self, snapshot: &Snapshot, _delta: &Delta) -> HashMap<String, f64> {
        let mut counts: HashMap<String, f64> = HashMap::new();

        for entity in &snapshot.entities {
            let label = entity
                .category
                .clone()
                .unwrap_or_else(|| "uncategorized".to_string());
            *counts.entry(label).or_insert(0.0) += 1.0;
        }

        counts
    }
}

// ============================================================================
// TESTS
// ============================================================================
