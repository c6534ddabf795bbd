//! SQLite schema creation and migration for the metadata store.
//!
//! Creates all tables on first boot; re-runs are idempotent.

use rusqlite::Connection;

/// Current schema version.
const SCHEMA_VERSION: u32 = 1;

/// Run all migrations to bring the database up to date.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Get the current schema version from the database.
fn get_schema_version(conn: &Connection) -> u32 {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "user_version", version)
}

/// Version 1: all core tables.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        -- Memories staged for approval
        CREATE TABLE IF NOT EXISTS pending_memories (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            layer TEXT NOT NULL,
            category TEXT,
            confidence REAL NOT NULL,
            change_type TEXT NOT NULL DEFAULT 'create',
            proposer TEXT NOT NULL,
            reason TEXT,
            target_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            approvals TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_memories(status);
        CREATE INDEX IF NOT EXISTS idx_pending_layer ON pending_memories(layer);

        -- Identity-schema change audit trail
        CREATE TABLE IF NOT EXISTS identity_changes (
            change_id TEXT PRIMARY KEY,
            target_id TEXT,
            change_type TEXT NOT NULL,
            proposed_content TEXT NOT NULL,
            reason TEXT NOT NULL,
            category TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            approvals_count INTEGER NOT NULL DEFAULT 0,
            approvals TEXT NOT NULL DEFAULT '[]',
            proposer TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            applied_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_identity_status ON identity_changes(status);

        -- Task list
        CREATE TABLE IF NOT EXISTS checklist_items (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            content TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            scope TEXT NOT NULL DEFAULT 'project',
            priority INTEGER NOT NULL DEFAULT 3,
            tags TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            expires_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_checklist_project ON checklist_items(project_id, status);

        -- Archived working sessions
        CREATE TABLE IF NOT EXISTS session_archive (
            session_id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            files_touched TEXT NOT NULL DEFAULT '[]',
            memory_ops INTEGER NOT NULL DEFAULT 0,
            file_mods INTEGER NOT NULL DEFAULT 0,
            summary TEXT
        );
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('pending_memories', 'identity_changes', 'checklist_items', 'session_archive')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }
}
