// 🗄️ Persistence Layer - SQLite store for snapshots and the metrics series
//
// Snapshots are write-once per date: re-importing identical contents is a
// no-op, re-importing different contents for a captured date is rejected.
// Metrics rows are upserted so a re-run of the same date replaces its row
// instead of appending a duplicate.

use crate::metrics::MetricsRecord;
use crate::snapshot::{Entity, Snapshot, SnapshotError};
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Snapshots Table (one row per captured date)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS snapshots (
            date TEXT PRIMARY KEY,
            snapshot_id TEXT UNIQUE NOT NULL,
            fingerprint TEXT NOT NULL,
            entity_count INTEGER NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Entities Table (snapshot membership, attributes as JSON)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS entities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            snapshot_date TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            name TEXT,
            category TEXT,
            attributes TEXT,
            UNIQUE(snapshot_date, entity_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Metrics Table (the persisted series, one row per processed date)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS metrics (
            date TEXT PRIMARY KEY,
            baseline_total INTEGER NOT NULL,
            total_current INTEGER NOT NULL,
            new_count INTEGER NOT NULL,
            dropped_count INTEGER NOT NULL,
            net_change INTEGER NOT NULL,
            retention_rate REAL NOT NULL,
            growth_rate REAL NOT NULL,
            anomaly_flag INTEGER NOT NULL DEFAULT 0,
            trend_value REAL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entities_snapshot ON entities(snapshot_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entities_id ON entities(entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// SNAPSHOT STORE
// ============================================================================

/// Outcome of persisting a snapshot
#[derive(Debug, PartialEq)]
pub enum SnapshotInsert {
    Inserted,
    /// Identical snapshot already stored for this date (idempotent re-run)
    AlreadyCaptured,
}

/// Persist a snapshot.
///
/// Dates are ISO (`YYYY-MM-DD`) TEXT, so lexicographic order in SQL matches
/// date order. A date that is already captured with the same fingerprint is
/// skipped; a different fingerprint is a `SnapshotError::DateConflict`
/// because snapshots are immutable once captured.
pub fn insert_snapshot(conn: &Connection, snapshot: &Snapshot) -> Result<SnapshotInsert> {
    let date_str = snapshot.date.to_string();

    let existing: Option<String> = conn
        .query_row(
            "SELECT fingerprint FROM snapshots WHERE date = ?1",
            params![date_str],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(fingerprint) = existing {
        if fingerprint == snapshot.fingerprint {
            log::info!("Snapshot for {} already captured, skipping", snapshot.date);
            return Ok(SnapshotInsert::AlreadyCaptured);
        }
        return Err(SnapshotError::DateConflict { date: snapshot.date }.into());
    }

    conn.execute(
        "INSERT INTO snapshots (date, snapshot_id, fingerprint, entity_count)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            date_str,
            snapshot.snapshot_id,
            snapshot.fingerprint,
            snapshot.count() as i64,
        ],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO entities (snapshot_date, entity_id, name, category, attributes)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;

    for entity in &snapshot.entities {
        let attributes_json = serde_json::to_string(&entity.attributes)?;
        stmt.execute(params![
            date_str,
            entity.id,
            entity.name,
            entity.category,
            attributes_json,
        ])?;
    }

    log::info!("Captured snapshot for {}: {} entities", snapshot.date, snapshot.count());
    Ok(SnapshotInsert::Inserted)
}

/// Load the snapshot stored for a date, if any
pub fn load_snapshot(conn: &Connection, date: NaiveDate) -> Result<Option<Snapshot>> {
    let date_str = date.to_string();

    let header: Option<(String, String)> = conn
        .query_row(
            "SELECT snapshot_id, fingerprint FROM snapshots WHERE date = ?1",
            params![date_str],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((snapshot_id, fingerprint)) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT entity_id, name, category, attributes
         FROM entities
         WHERE snapshot_date = ?1
         ORDER BY id",
    )?;

    let entities = stmt
        .query_map(params![date_str], |row| {
            let attributes_json: Option<String> = row.get(3)?;
            let attributes: HashMap<String, String> = attributes_json
                .and_then(|json| serde_json::from_str(&json).ok())
                .unwrap_or_default();

            Ok(Entity {
                id: row.get(0)?,
                name: row.get(1)?,
                category: row.get(2)?,
                attributes,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(Snapshot {
        snapshot_id,
        date,
        entities,
        fingerprint,
    }))
}

/// The most recent snapshot strictly before `before` - the comparison
/// baseline. `None` on the first-ever run (bootstrap).
pub fn find_baseline(conn: &Connection, before: NaiveDate) -> Result<Option<Snapshot>> {
    let date_str: Option<String> = conn
        .query_row(
            "SELECT date FROM snapshots WHERE date < ?1 ORDER BY date DESC LIMIT 1",
            params![before.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    match date_str {
        Some(text) => {
            let date: NaiveDate = text
                .parse()
                .with_context(|| format!("Invalid snapshot date in store: {}", text))?;
            load_snapshot(conn, date)
        }
        None => Ok(None),
    }
}

/// Delete snapshots older than the retention window. Returns how many
/// snapshot dates were dropped.
pub fn prune_snapshots(conn: &Connection, as_of: NaiveDate, keep_days: i64) -> Result<usize> {
    let cutoff = (as_of - Duration::days(keep_days)).to_string();

    conn.execute("DELETE FROM entities WHERE snapshot_date < ?1", params![cutoff])?;
    let pruned = conn.execute("DELETE FROM snapshots WHERE date < ?1", params![cutoff])?;

    if pruned > 0 {
        log::info!("Pruned {} snapshots older than {}", pruned, cutoff);
    }
    Ok(pruned)
}

// ============================================================================
// METRICS STORE
// ============================================================================

/// Upsert one metrics row. This is the caller-side half of the series'
/// strict-append contract: a re-run for an already-processed date replaces
/// that date's row here instead of appending a duplicate to the series.
pub fn append_or_replace_metric(conn: &Connection, record: &MetricsRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metrics (
            date, baseline_total, total_current, new_count, dropped_count,
            net_change, retention_rate, growth_rate, anomaly_flag, trend_value
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.date.to_string(),
            record.baseline_total as i64,
            record.total_current as i64,
            record.new_count as i64,
            record.dropped_count as i64,
            record.net_change,
            record.retention_rate,
            record.growth_rate,
            record.anomaly_flag as i64,
            record.trend_value,
        ],
    )?;

    Ok(())
}

/// Last `n` metrics rows in ascending date order
pub fn load_metrics_window(conn: &Connection, n: usize) -> Result<Vec<MetricsRecord>> {
    let mut stmt = conn.prepare(
        "SELECT date, baseline_total, total_current, new_count, dropped_count,
                net_change, retention_rate, growth_rate, anomaly_flag, trend_value
         FROM metrics
         ORDER BY date DESC
         LIMIT ?1",
    )?;

    let mut records = stmt
        .query_map(params![n as i64], row_to_record)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    records.reverse();
    Ok(records)
}

/// Full metrics history in ascending date order
pub fn load_all_metrics(conn: &Connection) -> Result<Vec<MetricsRecord>> {
    let mut stmt = conn.prepare(
        "SELECT date, baseline_total, total_current, new_count, dropped_count,
                net_change, retention_rate, growth_rate, anomaly_flag, trend_value
         FROM metrics
         ORDER BY date",
    )?;

    let records = stmt
        .query_map([], row_to_record)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(records)
}

pub fn verify_metrics_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))?;
    Ok(count)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricsRecord> {
    let date_str: String = row.get(0)?;
    let date: NaiveDate = date_str.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("bad date: {}", date_str).into(),
        )
    })?;

    let baseline_total: i64 = row.get(1)?;
    let total_current: i64 = row.get(2)?;
    let new_count: i64 = row.get(3)?;
    let dropped_count: i64 = row.get(4)?;
    let anomaly_flag: i64 = row.get(8)?;

    Ok(MetricsRecord {
        date,
        baseline_total: baseline_total as usize,
        total_current: total_current as usize,
        new_count: new_count as usize,
        dropped_count: dropped_count as usize,
        net_change: row.get(5)?,
        retention_rate: row.get(6)?,
        growth_rate: row.get(7)?,
        anomaly_flag: anomaly_flag != 0,
        trend_value: row.get(9)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaEngine;
    use crate::metrics::MetricsCalculator;
    use std::collections::HashSet;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn snapshot(date_str: &str, ids: &[&str]) -> Snapshot {
        let entities = ids.iter().map(|id| Entity::new(id)).collect();
        Snapshot::capture(date(date_str), entities)
    }

    fn record_for(date_str: &str, current: &[&str], baseline: &[&str]) -> MetricsRecord {
        let baseline_ids: HashSet<String> = baseline.iter().map(|s| s.to_string()).collect();
        let current_ids: HashSet<String> = current.iter().map(|s| s.to_string()).collect();
        let delta = DeltaEngine::compare(&baseline_ids, &current_ids);
        MetricsCalculator::calculate(date(date_str), baseline_ids.len(), current_ids.len(), &delta)
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let conn = test_conn();
        let mut entity = Entity::with_category("S001", "Engineering");
        entity.name = Some("John Doe".to_string());
        entity.attributes.insert("level".to_string(), "Graduate".to_string());
        let original = Snapshot::capture(date("2024-09-01"), vec![entity, Entity::new("S002")]);

        insert_snapshot(&conn, &original).unwrap();
        let loaded = load_snapshot(&conn, date("2024-09-01")).unwrap().unwrap();

        assert_eq!(loaded.snapshot_id, original.snapshot_id);
        assert_eq!(loaded.fingerprint, original.fingerprint);
        assert_eq!(loaded.count(), 2);
        let entity = loaded.find("S001").unwrap();
        assert_eq!(entity.name.as_deref(), Some("John Doe"));
        assert_eq!(entity.category.as_deref(), Some("Engineering"));
        assert_eq!(entity.attributes.get("level").map(String::as_str), Some("Graduate"));
    }

    #[test]
    fn test_reimport_identical_snapshot_is_noop() {
        let conn = test_conn();
        let first = snapshot("2024-09-01", &["S001", "S002"]);
        // Same membership, fresh capture (new UUID, same fingerprint)
        let second = snapshot("2024-09-01", &["S002", "S001"]);

        assert_eq!(insert_snapshot(&conn, &first).unwrap(), SnapshotInsert::Inserted);
        assert_eq!(
            insert_snapshot(&conn, &second).unwrap(),
            SnapshotInsert::AlreadyCaptured
        );

        // Original identity survives the no-op
        let loaded = load_snapshot(&conn, date("2024-09-01")).unwrap().unwrap();
        assert_eq!(loaded.snapshot_id, first.snapshot_id);
    }

    #[test]
    fn test_reimport_different_contents_conflicts() {
        let conn = test_conn();
        insert_snapshot(&conn, &snapshot("2024-09-01", &["S001"])).unwrap();

        let err = insert_snapshot(&conn, &snapshot("2024-09-01", &["S001", "S002"])).unwrap_err();
        let snapshot_err = err.downcast_ref::<SnapshotError>().unwrap();
        assert!(matches!(snapshot_err, SnapshotError::DateConflict { .. }));
    }

    #[test]
    fn test_find_baseline_picks_most_recent_prior() {
        let conn = test_conn();
        insert_snapshot(&conn, &snapshot("2024-09-01", &["A"])).unwrap();
        insert_snapshot(&conn, &snapshot("2024-09-03", &["A", "B"])).unwrap();
        insert_snapshot(&conn, &snapshot("2024-09-05", &["A", "B", "C"])).unwrap();

        let baseline = find_baseline(&conn, date("2024-09-05")).unwrap().unwrap();
        assert_eq!(baseline.date, date("2024-09-03"));

        // Strictly before: the date itself does not count as its own baseline
        let none = find_baseline(&conn, date("2024-09-01")).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_metrics_upsert_replaces_same_date() {
        let conn = test_conn();
        let first = record_for("2024-09-02", &["A", "B"], &["A"]);
        append_or_replace_metric(&conn, &first).unwrap();

        let mut second = record_for("2024-09-02", &["A", "B", "C"], &["A"]);
        second.anomaly_flag = true;
        append_or_replace_metric(&conn, &second).unwrap();

        assert_eq!(verify_metrics_count(&conn).unwrap(), 1);
        let stored = load_all_metrics(&conn).unwrap();
        assert_eq!(stored[0].total_current, 3);
        assert!(stored[0].anomaly_flag);
    }

    #[test]
    fn test_metrics_window_is_ascending_tail() {
        let conn = test_conn();
        for day in 1..=9 {
            let record = record_for(&format!("2024-09-{:02}", day), &["A"], &["A"]);
            append_or_replace_metric(&conn, &record).unwrap();
        }

        let window = load_metrics_window(&conn, 3).unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].date, date("2024-09-07"));
        assert_eq!(window[2].date, date("2024-09-09"));
    }

    #[test]
    fn test_metrics_roundtrip_preserves_fields() {
        let conn = test_conn();
        let mut record = record_for("2024-09-02", &["B", "C", "D", "E"], &["A", "B", "C"]);
        record.trend_value = Some(104.5);
        append_or_replace_metric(&conn, &record).unwrap();

        let stored = load_all_metrics(&conn).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], record);
    }

    #[test]
    fn test_prune_snapshots_respects_retention() {
        let conn = test_conn();
        insert_snapshot(&conn, &snapshot("2024-08-01", &["A"])).unwrap();
        insert_snapshot(&conn, &snapshot("2024-08-20", &["A"])).unwrap();
        insert_snapshot(&conn, &snapshot("2024-09-01", &["A"])).unwrap();

        let pruned = prune_snapshots(&conn, date("2024-09-01"), 30).unwrap();

        assert_eq!(pruned, 1);
        assert!(load_snapshot(&conn, date("2024-08-01")).unwrap().is_none());
        assert!(load_snapshot(&conn, date("2024-08-20")).unwrap().is_some());
    }
}
