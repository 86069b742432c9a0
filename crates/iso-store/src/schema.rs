use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    // Checkpoint every ~400KB instead of the default ~4MB
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // In-memory DBs and fresh files legitimately fail this; not fatal.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::info!("startup WAL checkpoint complete");
    }

    // Edges are values too: one row in `vals` plus a satellite row in
    // `edges`. Facets reference `vals` uniformly.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS vals (
            id          TEXT PRIMARY KEY,
            kind        TEXT NOT NULL CHECK (kind IN ('node', 'edge')),
            created_at  INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            attributes  TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS edges (
            value_id  TEXT PRIMARY KEY REFERENCES vals(id) ON DELETE CASCADE,
            source_id TEXT NOT NULL REFERENCES vals(id),
            target_id TEXT NOT NULL REFERENCES vals(id),
            directed  INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS facets (
            value_id TEXT NOT NULL REFERENCES vals(id) ON DELETE CASCADE,
            axis     TEXT NOT NULL,
            name     TEXT NOT NULL,
            value    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS branches (
            name   TEXT PRIMARY KEY,
            parent TEXT,
            base   INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            idx         INTEGER PRIMARY KEY,
            branch      TEXT NOT NULL REFERENCES branches(name),
            position    INTEGER NOT NULL,
            captured_at INTEGER NOT NULL,
            label       TEXT,
            state       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_vals_kind ON vals(kind);
        CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);
        CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);
        CREATE INDEX IF NOT EXISTS idx_facets_value ON facets(value_id);
        CREATE INDEX IF NOT EXISTS idx_facets_key ON facets(axis, name);
        CREATE INDEX IF NOT EXISTS idx_snapshots_branch ON snapshots(branch, position);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}
