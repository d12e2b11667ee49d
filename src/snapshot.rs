// 📸 Snapshot Model - Point-in-time view of the enrolled population
//
// A snapshot is the full set of enrolled entities as of one calendar date.
// Captured once per pipeline tick, immutable afterwards, exactly one per date.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Roster row carried an empty identifier
    #[error("roster row {line} has an empty entity id")]
    EmptyId { line: usize },

    /// A different snapshot already exists for this date
    #[error("snapshot for {date} already captured with different contents")]
    DateConflict { date: NaiveDate },
}

// ============================================================================
// ENTITY
// ============================================================================

/// One tracked member of the population for a single snapshot date.
///
/// Only `id` participates in delta logic; the descriptive attributes are
/// carried through unchanged for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "student_id")]
    pub id: String,

    #[serde(rename = "student_name", default)]
    pub name: Option<String>,

    /// Grouping label (division/department in the source data)
    #[serde(rename = "division", default)]
    pub category: Option<String>,

    /// Any extra roster columns, kept verbatim
    #[serde(flatten, default)]
    pub attributes: HashMap<String, String>,
}

impl Entity {
    pub fn new(id: &str) -> Self {
        Entity {
            id: id.to_string(),
            name: None,
            category: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_category(id: &str, category: &str) -> Self {
        Entity {
            id: id.to_string(),
            name: None,
            category: Some(category.to_string()),
            attributes: HashMap::new(),
        }
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Immutable set of entities present on one calendar date.
///
/// Invariants:
/// - entity ids are unique within the snapshot (duplicates dropped on capture)
/// - one snapshot per date; re-captures must match the stored fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Stable identity (UUID) assigned at capture
    pub snapshot_id: String,

    /// The calendar date this snapshot represents
    pub date: NaiveDate,

    /// Entities present on that date, capture order preserved
    pub entities: Vec<Entity>,

    /// SHA-256 over the sorted id set; detects identical re-imports
    pub fingerprint: String,
}

impl Snapshot {
    /// Capture a snapshot from a roster, deduplicating entity ids.
    ///
    /// First occurrence of a duplicated id wins; duplicates are logged and
    /// dropped rather than failing the run, matching upstream roster exports
    /// that occasionally repeat rows.
    pub fn capture(date: NaiveDate, entities: Vec<Entity>) -> Self {
        let mut seen: HashSet<String> = HashSet::with_capacity(entities.len());
        let mut unique = Vec::with_capacity(entities.len());

        for entity in entities {
            if seen.insert(entity.id.clone()) {
                unique.push(entity);
            } else {
                log::warn!("duplicate entity id {} in {} roster, dropped", entity.id, date);
            }
        }

        let fingerprint = compute_fingerprint(&seen);

        Snapshot {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            date,
            entities: unique,
            fingerprint,
        }
    }

    /// The identifier set consumed by the delta engine
    pub fn id_set(&self) -> HashSet<String> {
        self.entities.iter().map(|e| e.id.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Look up an entity by id (linear scan; snapshots are small)
    pub fn find(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }
}

/// Fingerprint is order-independent: sorted ids joined and hashed
fn compute_fingerprint(ids: &HashSet<String>) -> String {
    let mut sorted: Vec<&String> = ids.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// ROSTER LOADING
// ============================================================================

/// Load a roster CSV into entities.
///
/// Expects a `student_id` column; `student_name` and `division` are optional
/// and any further columns land in `attributes`.
pub fn load_roster_csv(path: &Path) -> Result<Vec<Entity>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open roster CSV: {}", path.display()))?;

    let mut entities = Vec::new();

    for (index, result) in reader.deserialize().enumerate() {
        let entity: Entity = result
            .with_context(|| format!("Failed to parse roster row {}", index + 2))?;

        if entity.id.trim().is_empty() {
            // +2: header row plus one-based numbering
            return Err(SnapshotError::EmptyId { line: index + 2 }.into());
        }

        entities.push(entity);
    }

    log::info!("Loaded {} roster rows from {}", entities.len(), path.display());
    Ok(entities)
}

// ============================================================================
// TESTS
// ============================================================================
