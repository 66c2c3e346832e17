//! Database module for the measurement store
//!
//! Provides SQLite database initialization and connection management for the
//! four tracker tables (raw measurements, local network metrics, baselines,
//! analysis windows).

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Thread-safe database connection type
pub type DbConnection = Arc<Mutex<Connection>>;

/// Initialize the SQLite database
///
/// Opens (or creates) a SQLite database at the specified path, enables WAL
/// mode so readers stay unblocked during the single-writer workload, and runs
/// the idempotent schema batch.
///
/// # Arguments
/// * `db_path` - Path to the SQLite database file
///
/// # Returns
/// * `Ok(DbConnection)` - Thread-safe connection on success
/// * `Err` - Database initialization error
pub fn init_database(
    db_path: &Path,
) -> Result<DbConnection, Box<dyn std::error::Error + Send + Sync>> {
    let conn = Connection::open(db_path)?;

    // Set WAL mode for better concurrency
    // Note: pragma_update must be used instead of execute because
    // PRAGMA journal_mode returns a result row, and rusqlite's execute()
    // returns an error for statements that return rows.
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // Run migrations
    let schema_sql = include_str!("../migrations/001_tracker_schema.sql");
    conn.execute_batch(schema_sql)?;

    Ok(Arc::new(Mutex::new(conn)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_database_initialization() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path();

        let db = init_database(db_path).unwrap();

        // Verify tables were created
        let conn = db.lock().await;
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"raw_measurements".to_string()));
        assert!(tables.contains(&"local_network_metrics".to_string()));
        assert!(tables.contains(&"baselines".to_string()));
        assert!(tables.contains(&"analysis_windows".to_string()));
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path();

        // Opening twice must not fail
        drop(init_database(db_path).unwrap());
        drop(init_database(db_path).unwrap());
    }

    #[tokio::test]
    async fn test_timeout_duality_is_enforced() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = init_database(temp_file.path()).unwrap();
        let conn = db.lock().await;

        // timeout row carrying an RTT violates the CHECK
        let result = conn.execute(
            "INSERT INTO raw_measurements
                (timestamp_ms, channel, target_id, target_rtt_ms, timeout, local_network_rtt_ms, probe_method)
             VALUES (1000, 'whatsapp', 't', 120, 1, NULL, 'delete')",
            [],
        );
        assert!(result.is_err());

        // and so does a non-timeout row without one
        let result = conn.execute(
            "INSERT INTO raw_measurements
                (timestamp_ms, channel, target_id, target_rtt_ms, timeout, local_network_rtt_ms, probe_method)
             VALUES (1000, 'whatsapp', 't', NULL, 0, NULL, 'delete')",
            [],
        );
        assert!(result.is_err());
    }
}
