//! SQLite schema creation and migration for the memory store.
//!
//! The store is normally populated by the ingestion side of the system; the
//! recall engine only needs these tables to exist with the expected columns.

use rusqlite::Connection;

/// Current schema version.
const SCHEMA_VERSION: u32 = 2;

/// Run all migrations to bring the database up to date.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Get the current schema version from the database.
fn get_schema_version(conn: &Connection) -> u32 {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0)
}

/// Check if a column exists in a table (SQLite has no ADD COLUMN IF NOT EXISTS).
fn column_exists(conn: &Connection, table: &str, column: &str) -> bool {
    let sql = format!("PRAGMA table_info({})", table);
    let Ok(mut stmt) = conn.prepare(&sql) else {
        return false;
    };
    let Ok(rows) = stmt.query_map([], |row| row.get::<_, String>(1)) else {
        return false;
    };
    let names: Vec<String> = rows.filter_map(|r| r.ok()).collect();
    names.iter().any(|n| n == column)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "user_version", version)
}

/// Version 1: memory nodes plus the external-content FTS5 table kept in
/// sync by triggers.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        -- One row per layer of a conversation turn
        CREATE TABLE IF NOT EXISTS memory_nodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            turn_id TEXT NOT NULL,
            layer TEXT NOT NULL DEFAULT 'input',
            text TEXT NOT NULL DEFAULT '',
            summary TEXT NOT NULL DEFAULT '',
            who TEXT,
            timestamp INTEGER NOT NULL,
            affect_json TEXT,
            embedding BLOB
        );
        CREATE INDEX IF NOT EXISTS idx_nodes_turn ON memory_nodes(turn_id);
        CREATE INDEX IF NOT EXISTS idx_nodes_timestamp ON memory_nodes(timestamp);

        -- Keyword index over text and summary
        CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
            text,
            summary,
            content='memory_nodes',
            content_rowid='id'
        );

        CREATE TRIGGER IF NOT EXISTS memory_nodes_ai AFTER INSERT ON memory_nodes BEGIN
            INSERT INTO memory_fts(rowid, text, summary) VALUES (new.id, new.text, new.summary);
        END;
        CREATE TRIGGER IF NOT EXISTS memory_nodes_ad AFTER DELETE ON memory_nodes BEGIN
            INSERT INTO memory_fts(memory_fts, rowid, text, summary)
            VALUES ('delete', old.id, old.text, old.summary);
        END;
        CREATE TRIGGER IF NOT EXISTS memory_nodes_au AFTER UPDATE OF text, summary ON memory_nodes BEGIN
            INSERT INTO memory_fts(memory_fts, rowid, text, summary)
            VALUES ('delete', old.id, old.text, old.summary);
            INSERT INTO memory_fts(rowid, text, summary) VALUES (new.id, new.text, new.summary);
        END;
        ",
    )?;
    Ok(())
}

/// Version 2: forgetting-curve columns used by reinforcement and ecological scoring.
fn migrate_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    let columns = [
        ("strength", "REAL NOT NULL DEFAULT 1.0"),
        ("decay_rate", "REAL NOT NULL DEFAULT 0.01"),
        ("last_accessed", "INTEGER NOT NULL DEFAULT 0"),
        ("dismissal_count", "INTEGER NOT NULL DEFAULT 0"),
    ];
    for (name, decl) in columns {
        if !column_exists(conn, "memory_nodes", name) {
            conn.execute(
                &format!("ALTER TABLE memory_nodes ADD COLUMN {name} {decl}"),
                [],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"memory_nodes".to_string()));
        assert!(tables.contains(&"memory_fts".to_string()));
        assert!(column_exists(&conn, "memory_nodes", "strength"));
        assert!(column_exists(&conn, "memory_nodes", "dismissal_count"));
    }

    #[test]
    fn test_migration_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn test_fts_follows_inserts() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO memory_nodes (turn_id, text, timestamp) VALUES ('t1', 'the quick brown fox', 1)",
            [],
        )
        .unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_fts WHERE memory_fts MATCH '\"fox\"'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
