//! Persistent outbox for fieldstation.
//!
//! This module provides `SQLite`-based store-and-forward storage for decode
//! events: durable ordered records with upload-state tracking, plus the
//! audit logs for external position fixes and band changes.
//!
//! Records are handed to the uploader strictly in insertion order and a
//! record is never deleted while it is still unsent.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::band::Band;
use crate::decode::DecodeEvent;
use crate::error::{Error, Result};
use crate::position::{Position, PositionOrigin};

/// A persisted decode event with its upload state.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    /// Sequence id assigned at persistence time; strictly increasing.
    pub id: i64,
    /// The enriched event as it was persisted.
    pub event: DecodeEvent,
    /// Whether the record has been delivered to the remote collector.
    pub uploaded: bool,
    /// When the record was first marked uploaded.
    pub upload_timestamp: Option<DateTime<Utc>>,
    /// When the record was persisted.
    pub created_at: DateTime<Utc>,
}

/// Aggregate outbox counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    /// Total persisted records.
    pub total: i64,
    /// Records already delivered to the collector.
    pub uploaded: i64,
    /// Records still waiting for delivery.
    pub pending: i64,
    /// Distinct non-empty callsigns seen.
    pub unique_callsigns: i64,
    /// Distinct bands seen on persisted records.
    pub bands_seen: Vec<String>,
}

/// One entry from the band-change audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BandChange {
    /// Audit row id.
    pub id: i64,
    /// When the change was accepted.
    pub timestamp: DateTime<Utc>,
    /// The band changed to.
    pub band: Band,
    /// Who signaled the change.
    pub source: String,
}

/// Durable store for decode events awaiting upload.
///
/// The connection runs in WAL mode with `synchronous=FULL` so an append is
/// on disk before it returns; a crash immediately afterwards cannot lose
/// the record. All access is serialized through an internal mutex, so an
/// `Outbox` can be shared across tasks behind an `Arc`.
#[derive(Debug)]
pub struct Outbox {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
}

impl Outbox {
    /// Open or create an outbox database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    /// Initializes the schema if this is a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening outbox database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // FULL sync: an append must be durable before it returns
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        migrations::initialize_schema(&conn)?;

        info!("Outbox database opened at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory outbox for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("outbox connection lock poisoned"))
    }

    /// Persist a decode event and return its assigned sequence id.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; the event is then not durable
    /// and the caller treats the enrichment as failed.
    pub fn append(&self, event: &DecodeEvent) -> Result<i64> {
        let conn = self.lock()?;

        let position = event.position.as_ref();
        conn.execute(
            r"
            INSERT INTO decodes (
                timestamp, callsign, grid, snr, dt, frequency, band, message,
                latitude, longitude, altitude, speed, heading,
                position_timestamp, position_origin, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ",
            params![
                event.timestamp.to_rfc3339(),
                event.callsign,
                event.grid,
                event.snr,
                event.dt,
                i64::try_from(event.frequency).unwrap_or(i64::MAX),
                event.band.label(),
                event.message,
                position.map(|p| p.latitude),
                position.map(|p| p.longitude),
                position.map(|p| p.altitude),
                position.map(|p| p.speed),
                position.map(|p| p.heading),
                position.map(|p| p.timestamp.to_rfc3339()),
                position.map(|p| p.origin.to_string()),
                Utc::now().to_rfc3339(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        debug!("Appended decode {} ({})", id, event.callsign);
        Ok(id)
    }

    /// Fetch up to `limit` unsent records, strictly oldest-first by
    /// insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn unsent_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM decodes WHERE uploaded = 0 ORDER BY id ASC LIMIT ?1"
        ))?;

        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt
            .query_map([limit_i64], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Idempotently mark records as uploaded, stamping the upload time on
    /// the records that were not already marked.
    ///
    /// Returns the number of records newly marked. An empty id set is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn mark_uploaded(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let conn = self.lock()?;
        let placeholders = ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(",");

        // `uploaded = 0` in the predicate keeps the flag monotonic and the
        // upload timestamp first-write-only.
        let sql = format!(
            "UPDATE decodes SET uploaded = 1, upload_timestamp = ?1
             WHERE id IN ({placeholders}) AND uploaded = 0"
        );

        let now = Utc::now().to_rfc3339();
        let mut values: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(now)];
        values.extend(ids.iter().map(|id| rusqlite::types::Value::Integer(*id)));

        let affected = conn.execute(&sql, params_from_iter(values))?;
        if affected > 0 {
            info!("Marked {} decodes as uploaded", affected);
        }
        Ok(affected)
    }

    /// Aggregate counters, optionally windowed to records at or after
    /// `since`.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub fn stats(&self, since: Option<DateTime<Utc>>) -> Result<OutboxStats> {
        let conn = self.lock()?;
        let since_str = since.map(|s| s.to_rfc3339());

        let total: i64 = match &since_str {
            Some(since) => conn.query_row(
                "SELECT COUNT(*) FROM decodes WHERE timestamp >= ?1",
                [since],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM decodes", [], |row| row.get(0))?,
        };

        let uploaded: i64 = match &since_str {
            Some(since) => conn.query_row(
                "SELECT COUNT(*) FROM decodes WHERE timestamp >= ?1 AND uploaded = 1",
                [since],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM decodes WHERE uploaded = 1",
                [],
                |row| row.get(0),
            )?,
        };

        let unique_callsigns: i64 = match &since_str {
            Some(since) => conn.query_row(
                "SELECT COUNT(DISTINCT callsign) FROM decodes
                 WHERE timestamp >= ?1 AND callsign != ''",
                [since],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(DISTINCT callsign) FROM decodes WHERE callsign != ''",
                [],
                |row| row.get(0),
            )?,
        };

        let mut stmt = match &since_str {
            Some(_) => conn.prepare(
                "SELECT DISTINCT band FROM decodes
                 WHERE timestamp >= ?1 AND band != 'unknown' ORDER BY band",
            )?,
            None => conn.prepare(
                "SELECT DISTINCT band FROM decodes WHERE band != 'unknown' ORDER BY band",
            )?,
        };
        let bands_seen = match &since_str {
            Some(since) => stmt
                .query_map([since], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };

        Ok(OutboxStats {
            total,
            uploaded,
            pending: total - uploaded,
            unique_callsigns,
            bands_seen,
        })
    }

    /// Delete uploaded records older than the retention horizon.
    ///
    /// Unsent records are never deleted, regardless of age: losing unsent
    /// data is worse than unbounded growth.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let conn = self.lock()?;

        let deleted = conn.execute(
            "DELETE FROM decodes WHERE uploaded = 1 AND created_at < ?1",
            [cutoff.to_rfc3339()],
        )?;

        if deleted > 0 {
            info!("Cleaned up {} uploaded decodes", deleted);
        }
        Ok(deleted)
    }

    /// The most recent records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn recent(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM decodes ORDER BY id DESC LIMIT ?1"
        ))?;

        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt
            .query_map([limit_i64], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Total persisted records.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self) -> Result<i64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM decodes", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Append a position to the audit log.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn record_position(&self, position: &Position) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            r"
            INSERT INTO position_log (
                timestamp, latitude, longitude, altitude, speed, heading, origin, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                position.timestamp.to_rfc3339(),
                position.latitude,
                position.longitude,
                position.altitude,
                position.speed,
                position.heading,
                position.origin.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(
            "Logged {} position {}: {:.4}, {:.4}",
            position.origin, id, position.latitude, position.longitude
        );
        Ok(id)
    }

    /// The most recently logged position, optionally filtered by origin.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn latest_position(&self, origin: Option<PositionOrigin>) -> Result<Option<Position>> {
        let conn = self.lock()?;
        let row_to_position = |row: &rusqlite::Row| -> rusqlite::Result<Position> {
            let timestamp: String = row.get(0)?;
            let origin: String = row.get(6)?;
            Ok(Position {
                timestamp: parse_rfc3339(&timestamp),
                latitude: row.get(1)?,
                longitude: row.get(2)?,
                altitude: row.get::<_, Option<f64>>(3)?.unwrap_or_default(),
                speed: row.get::<_, Option<f64>>(4)?.unwrap_or_default(),
                heading: row.get::<_, Option<f64>>(5)?.unwrap_or_default(),
                origin: if origin == "local" {
                    PositionOrigin::Local
                } else {
                    PositionOrigin::External
                },
            })
        };

        let result = match origin {
            Some(origin) => conn
                .query_row(
                    "SELECT timestamp, latitude, longitude, altitude, speed, heading, origin
                     FROM position_log WHERE origin = ?1 ORDER BY id DESC LIMIT 1",
                    [origin.to_string()],
                    row_to_position,
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT timestamp, latitude, longitude, altitude, speed, heading, origin
                     FROM position_log ORDER BY id DESC LIMIT 1",
                    [],
                    row_to_position,
                )
                .optional()?,
        };

        Ok(result)
    }

    /// Append an accepted band change to the audit log.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn record_band_change(&self, band: Band, source: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO band_changes (timestamp, band, source, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                Utc::now().to_rfc3339(),
                band.label(),
                source,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!("Band change recorded: {} (source: {})", band, source);
        Ok(id)
    }

    /// Band-change history, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn band_changes(&self, limit: usize) -> Result<Vec<BandChange>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, band, source FROM band_changes
             ORDER BY id DESC LIMIT ?1",
        )?;

        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let changes = stmt
            .query_map([limit_i64], |row| {
                let timestamp: String = row.get(1)?;
                let band: String = row.get(2)?;
                Ok(BandChange {
                    id: row.get(0)?,
                    timestamp: parse_rfc3339(&timestamp),
                    band: Band::parse(&band).unwrap_or(Band::Unknown),
                    source: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(changes)
    }

    /// Distinct bands that have been signaled, optionally since a timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn bands_logged(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Band>> {
        let conn = self.lock()?;
        let mut stmt = match since {
            Some(_) => conn.prepare(
                "SELECT DISTINCT band FROM band_changes WHERE timestamp >= ?1 ORDER BY band",
            )?,
            None => conn.prepare("SELECT DISTINCT band FROM band_changes ORDER BY band")?,
        };

        let labels: Vec<String> = match since {
            Some(since) => stmt
                .query_map([since.to_rfc3339()], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };

        Ok(labels
            .iter()
            .filter_map(|label| Band::parse(label))
            .collect())
    }

    /// Convert a database row to an `OutboxRecord`.
    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<OutboxRecord> {
        let timestamp: String = row.get(1)?;
        let band: String = row.get(7)?;
        let latitude: Option<f64> = row.get(9)?;
        let longitude: Option<f64> = row.get(10)?;
        let position_timestamp: Option<String> = row.get(14)?;
        let position_origin: Option<String> = row.get(15)?;
        let upload_timestamp: Option<String> = row.get(17)?;
        let created_at: String = row.get(18)?;

        let position = match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Some(Position {
                timestamp: position_timestamp
                    .as_deref()
                    .map_or_else(|| parse_rfc3339(&timestamp), parse_rfc3339),
                latitude,
                longitude,
                altitude: row.get::<_, Option<f64>>(11)?.unwrap_or_default(),
                speed: row.get::<_, Option<f64>>(12)?.unwrap_or_default(),
                heading: row.get::<_, Option<f64>>(13)?.unwrap_or_default(),
                origin: if position_origin.as_deref() == Some("external") {
                    PositionOrigin::External
                } else {
                    PositionOrigin::Local
                },
            }),
            _ => None,
        };

        #[allow(clippy::cast_sign_loss)]
        let frequency = row.get::<_, i64>(6)?.max(0) as u64;

        Ok(OutboxRecord {
            id: row.get(0)?,
            event: DecodeEvent {
                timestamp: parse_rfc3339(&timestamp),
                callsign: row.get(2)?,
                grid: row.get(3)?,
                snr: row.get(4)?,
                dt: row.get(5)?,
                frequency,
                band: Band::parse(&band).unwrap_or(Band::Unknown),
                message: row.get(8)?,
                position,
            },
            uploaded: row.get::<_, i64>(16)? != 0,
            upload_timestamp: upload_timestamp.as_deref().map(parse_rfc3339),
            created_at: parse_rfc3339(&created_at),
        })
    }
}

/// Column list matching `row_to_record`'s index expectations.
const RECORD_COLUMNS: &str = "id, timestamp, callsign, grid, snr, dt, frequency, band, message, \
     latitude, longitude, altitude, speed, heading, position_timestamp, position_origin, \
     uploaded, upload_timestamp, created_at";

/// Parse an RFC 3339 timestamp, falling back to now on malformed data.
fn parse_rfc3339(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
