mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::Result;
use schema::INITIAL_SCHEMA;

/// Database wrapper providing connection management and schema initialization.
///
/// The connection lives behind a mutex so the registry, clusterer, classifier
/// and refiner can share one `Arc<Database>` across worker threads. Multi-
/// statement operations take the guard once and run a transaction on it, so
/// their writes never interleave with another component's.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens an in-memory SQLite database.
    ///
    /// Automatically initializes the schema on connection open.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Opens a file-based SQLite database at the given path.
    ///
    /// Creates the database file if it does not exist.
    /// Automatically initializes the schema on connection open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.execute_batch(INITIAL_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Locks and returns the underlying connection.
    ///
    /// Held for the duration of one operation; a poisoned lock means a
    /// writer panicked mid-operation, which we treat as unrecoverable.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn in_memory_opens_successfully() {
        assert!(Database::in_memory().is_ok());
    }

    #[test]
    fn schema_tables_exist() {
        let db = Database::in_memory().unwrap();

        let conn = db.connection();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in [
            "tags",
            "tag_synonyms",
            "categories",
            "tag_edges",
            "clusters",
            "documents",
            "document_tags",
            "document_categories",
            "classifier_models",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn foreign_keys_enabled() {
        let db = Database::in_memory().unwrap();

        let fk_enabled: i32 = db
            .connection()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();

        assert_eq!(fk_enabled, 1);
    }

    #[test]
    fn confidence_range_is_enforced() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();

        conn.execute(
            "INSERT INTO documents (content, created_at, updated_at) VALUES ('x', 0, 0)",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO tags (name, created_at) VALUES ('rust', 0)", [])
            .unwrap();

        let result = conn.execute(
            "INSERT INTO document_tags (document_id, tag_id, confidence, source, created_at)
             VALUES (1, 1, 1.5, 'user', 0)",
            [],
        );
        assert!(result.is_err(), "confidence above 1.0 must be rejected");
    }

    #[test]
    fn child_of_self_loop_is_rejected() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();

        conn.execute("INSERT INTO tags (name, created_at) VALUES ('rust', 0)", [])
            .unwrap();

        let result = conn.execute(
            "INSERT INTO tag_edges (edge_type, source_tag_id, target_id) VALUES ('child_of', 1, 1)",
            [],
        );
        assert!(result.is_err(), "self-loop must be rejected");
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        {
            let db = Database::open(&db_path).unwrap();
            db.connection()
                .execute("INSERT INTO tags (name, created_at) VALUES ('rust', 0)", [])
                .unwrap();
        }

        let db2 = Database::open(&db_path).unwrap();
        let count: i64 = db2
            .connection()
            .query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
