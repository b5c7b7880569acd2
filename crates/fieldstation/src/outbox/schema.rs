//! `SQLite` schema definitions for the fieldstation outbox.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the decodes table.
pub const CREATE_DECODES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS decodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    callsign TEXT NOT NULL DEFAULT '',
    grid TEXT NOT NULL DEFAULT '',
    snr INTEGER NOT NULL,
    dt REAL NOT NULL,
    frequency INTEGER NOT NULL,
    band TEXT NOT NULL,
    message TEXT NOT NULL,
    latitude REAL,
    longitude REAL,
    altitude REAL,
    speed REAL,
    heading REAL,
    position_timestamp TEXT,
    position_origin TEXT,
    uploaded INTEGER NOT NULL DEFAULT 0,
    upload_timestamp TEXT,
    created_at TEXT NOT NULL
)
";

/// SQL statement to create an index on the upload flag for batch queries.
pub const CREATE_UPLOADED_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_decodes_uploaded ON decodes(uploaded)
";

/// SQL statement to create an index on timestamp for windowed stats.
pub const CREATE_TIMESTAMP_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_decodes_timestamp ON decodes(timestamp)
";

/// SQL statement to create an index on callsign for stats queries.
pub const CREATE_CALLSIGN_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_decodes_callsign ON decodes(callsign)
";

/// SQL statement to create the external-position audit table.
pub const CREATE_POSITION_LOG_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS position_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    altitude REAL,
    speed REAL,
    heading REAL,
    origin TEXT NOT NULL,
    created_at TEXT NOT NULL
)
";

/// SQL statement to create an index on position timestamps.
pub const CREATE_POSITION_LOG_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_position_log_timestamp ON position_log(timestamp)
";

/// SQL statement to create the band-change audit table.
pub const CREATE_BAND_CHANGES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS band_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    band TEXT NOT NULL,
    source TEXT NOT NULL,
    created_at TEXT NOT NULL
)
";

/// SQL statement to create an index on band-change timestamps.
pub const CREATE_BAND_CHANGES_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_band_changes_timestamp ON band_changes(timestamp)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_DECODES_TABLE,
    CREATE_UPLOADED_INDEX,
    CREATE_TIMESTAMP_INDEX,
    CREATE_CALLSIGN_INDEX,
    CREATE_POSITION_LOG_TABLE,
    CREATE_POSITION_LOG_INDEX,
    CREATE_BAND_CHANGES_TABLE,
    CREATE_BAND_CHANGES_INDEX,
    CREATE_METADATA_TABLE,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_not_empty() {
        assert!(!SCHEMA_STATEMENTS.is_empty());
        for stmt in SCHEMA_STATEMENTS {
            assert!(!stmt.is_empty());
        }
    }

    #[test]
    fn test_create_decodes_table_contains_required_columns() {
        assert!(CREATE_DECODES_TABLE.contains("id INTEGER PRIMARY KEY"));
        assert!(CREATE_DECODES_TABLE.contains("timestamp TEXT NOT NULL"));
        assert!(CREATE_DECODES_TABLE.contains("uploaded INTEGER NOT NULL DEFAULT 0"));
        assert!(CREATE_DECODES_TABLE.contains("upload_timestamp TEXT"));
        assert!(CREATE_DECODES_TABLE.contains("created_at TEXT NOT NULL"));
    }

    #[test]
    fn test_audit_tables_present() {
        assert!(CREATE_POSITION_LOG_TABLE.contains("latitude REAL NOT NULL"));
        assert!(CREATE_BAND_CHANGES_TABLE.contains("band TEXT NOT NULL"));
    }

    #[test]
    fn test_create_metadata_table_structure() {
        assert!(CREATE_METADATA_TABLE.contains("key TEXT PRIMARY KEY"));
        assert!(CREATE_METADATA_TABLE.contains("value TEXT NOT NULL"));
    }
}
