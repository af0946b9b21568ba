//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Device records, one non-deleted row per conn_id
        CREATE TABLE IF NOT EXISTS datakit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conn_id TEXT NOT NULL,
            runtime_id TEXT NOT NULL DEFAULT '',
            workspace_uuid TEXT NOT NULL,
            host_name TEXT NOT NULL DEFAULT '',
            ip TEXT NOT NULL DEFAULT '',
            os TEXT NOT NULL DEFAULT '',
            arch TEXT NOT NULL DEFAULT '',
            version TEXT NOT NULL DEFAULT '',
            run_mode TEXT NOT NULL DEFAULT '',
            usage_cores INTEGER NOT NULL DEFAULT 0,
            start_time INTEGER NOT NULL DEFAULT 0,
            run_in_container INTEGER NOT NULL DEFAULT 0,
            url TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL CHECK(status IN
                ('running', 'offline', 'stopped', 'upgrading', 'restarting')),
            global_host_tags TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_datakit_conn_runtime
            ON datakit(conn_id, runtime_id);
        CREATE INDEX IF NOT EXISTS idx_datakit_workspace
            ON datakit(workspace_uuid);

        -- Host tag rows, keyed by the owning conn_id
        CREATE TABLE IF NOT EXISTS global_host_tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conn_id TEXT NOT NULL,
            workspace_uuid TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_host_tags_conn ON global_host_tags(conn_id);

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}
