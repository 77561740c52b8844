//! SQLite storage layer.
//!
//! One writer connection lives on the daemon loop thread (tracker, prune,
//! machine snapshots); the forensics worker holds its own connection whose
//! writes are partitioned by capture id. CLIs open read-only connections.

pub mod events;
pub mod forensics;
pub mod machine;
pub mod schema;

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::info;

use rh_common::{Error, Result};

pub use schema::{SCHEMA, SCHEMA_VERSION};

/// Seconds since epoch as a float, matching the `captured_at` columns.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "journal_size_limit", 16_777_216i64)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Open a writer connection with the standard pragmas.
pub fn open(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure(&conn)?;
    Ok(conn)
}

/// Open a read-only connection (UI and CLI side).
pub fn open_read_only(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        return Err(Error::DatabaseNotFound {
            path: db_path.display().to_string(),
        });
    }
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Initialize the database, recreating it on any schema-version mismatch.
///
/// No migrations: a mismatch (or an unreadable version) deletes the file
/// and its `-wal`/`-shm` sidecars and starts fresh.
pub fn init_database(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if db_path.exists() {
        let existing = Connection::open(db_path)
            .map_err(Error::from)
            .and_then(|conn| schema_version(&conn));
        match existing {
            Ok(version) if version == SCHEMA_VERSION => return Ok(()),
            Ok(version) => {
                info!(existing = version, expected = SCHEMA_VERSION, "schema mismatch, recreating");
                remove_database(db_path)?;
            }
            Err(_) => {
                // Corrupted or incompatible file.
                info!("unreadable database, recreating");
                remove_database(db_path)?;
            }
        }
    }

    let conn = Connection::open(db_path)?;
    configure(&conn)?;
    conn.execute_batch(SCHEMA)?;
    conn.execute(
        "INSERT OR REPLACE INTO daemon_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
        rusqlite::params!["schema_version", SCHEMA_VERSION.to_string(), now_epoch()],
    )?;
    info!(path = %db_path.display(), version = SCHEMA_VERSION, "database initialized");
    Ok(())
}

/// Remove the database file and its WAL/SHM sidecars.
fn remove_database(db_path: &Path) -> Result<()> {
    let remove = |p: &Path| -> Result<()> {
        match std::fs::remove_file(p) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    };
    remove(db_path)?;
    let base = db_path.display().to_string();
    remove(Path::new(&format!("{base}-wal")))?;
    remove(Path::new(&format!("{base}-shm")))?;
    Ok(())
}

/// Current on-disk schema version, 0 when unset.
pub fn schema_version(conn: &Connection) -> Result<i64> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM daemon_state WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
}

/// Get a value from the daemon_state key-value table.
pub fn get_daemon_state(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM daemon_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Set a value in the daemon_state key-value table.
pub fn set_daemon_state(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO daemon_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![key, value, now_epoch()],
    )?;
    Ok(())
}

/// Delete closed process events older than the cutoff; cascades take care
/// of snapshots, captures, trace rows, log entries, and buffer context.
/// Open events are never pruned, regardless of age.
pub fn prune_old_events(conn: &Connection, events_days: i64) -> Result<usize> {
    if events_days < 1 {
        return Err(Error::InvalidRetention { days: events_days });
    }
    let cutoff = now_epoch() - (events_days as f64) * 86_400.0;
    let deleted = conn.execute(
        "DELETE FROM process_events WHERE exit_time IS NOT NULL AND exit_time < ?1",
        [cutoff],
    )?;
    if deleted > 0 {
        info!(deleted, "pruned closed events");
    }
    Ok(deleted)
}

#[cfg(test)]
pub(crate) mod testutil {
    use rusqlite::Connection;

    /// Fresh in-memory database with the full schema applied.
    pub fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn.execute_batch(super::SCHEMA).unwrap();
        conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::events;
    use rh_common::SnapshotType;

    fn temp_db_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("data.db")
    }

    #[test]
    fn init_creates_schema_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db_path(&dir);
        init_database(&path).unwrap();

        let conn = open(&path).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        // All primary tables exist.
        for table in [
            "process_events",
            "process_snapshots",
            "forensic_captures",
            "trace_header",
            "trace_frame",
            "log_entries",
            "buffer_context",
            "machine_snapshots",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn init_twice_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db_path(&dir);
        init_database(&path).unwrap();

        // Write some data, then init again: nothing lost.
        {
            let conn = open(&path).unwrap();
            let event_id = events::create_process_event(
                &conn,
                42,
                "worker",
                1_700_000_000,
                1.0,
                rh_common::Band::Medium,
                35,
                rh_common::Band::Medium,
            )
            .unwrap();
            let score = events::testutil::score_fixture(42, 35);
            events::insert_process_snapshot(&conn, event_id, SnapshotType::Entry, &score).unwrap();
        }
        init_database(&path).unwrap();

        let conn = open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM process_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let snaps: i64 = conn
            .query_row("SELECT count(*) FROM process_snapshots", [], |r| r.get(0))
            .unwrap();
        assert_eq!(snaps, 1);
    }

    #[test]
    fn version_mismatch_recreates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db_path(&dir);
        init_database(&path).unwrap();

        {
            let conn = open(&path).unwrap();
            events::create_process_event(
                &conn,
                1,
                "old",
                1,
                1.0,
                rh_common::Band::High,
                70,
                rh_common::Band::High,
            )
            .unwrap();
            set_daemon_state(&conn, "schema_version", "1").unwrap();
        }

        init_database(&path).unwrap();
        let conn = open(&path).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let count: i64 = conn
            .query_row("SELECT count(*) FROM process_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0, "history is discarded by design");
    }

    #[test]
    fn corrupt_file_recreates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db_path(&dir);
        std::fs::write(&path, b"definitely not sqlite").unwrap();
        init_database(&path).unwrap();
        let conn = open(&path).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn daemon_state_round_trip() {
        let conn = testutil::memory_db();
        assert_eq!(get_daemon_state(&conn, "missing").unwrap(), None);
        set_daemon_state(&conn, "last_boot", "1700000000").unwrap();
        assert_eq!(
            get_daemon_state(&conn, "last_boot").unwrap().as_deref(),
            Some("1700000000")
        );
        set_daemon_state(&conn, "last_boot", "1700000001").unwrap();
        assert_eq!(
            get_daemon_state(&conn, "last_boot").unwrap().as_deref(),
            Some("1700000001")
        );
    }

    #[test]
    fn prune_rejects_zero_days() {
        let conn = testutil::memory_db();
        let err = prune_old_events(&conn, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidRetention { days: 0 }));
    }

    #[test]
    fn read_only_open_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");
        assert!(matches!(
            open_read_only(&path),
            Err(Error::DatabaseNotFound { .. })
        ));
    }
}
