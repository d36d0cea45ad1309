//! SQLite schema and migrations for the graph store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL for better concurrent access
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

/// Whether the schema has been initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='decisions'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}

fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        r#"CREATE TABLE IF NOT EXISTS decisions (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            project_name TEXT,
            "trigger" TEXT NOT NULL,
            context TEXT NOT NULL DEFAULT '',
            decision TEXT NOT NULL,
            rationale TEXT NOT NULL DEFAULT '',
            options TEXT NOT NULL DEFAULT '[]',
            confidence REAL NOT NULL DEFAULT 0.5,
            raw_confidence REAL NOT NULL DEFAULT 0.5,
            scope TEXT NOT NULL DEFAULT 'unknown',
            source TEXT NOT NULL DEFAULT 'unknown',
            created_at TEXT NOT NULL,
            edited_at TEXT,
            edit_count INTEGER NOT NULL DEFAULT 0,
            expired_at TEXT,
            last_reviewed_at TEXT,
            verbatim TEXT,
            raw_rationale TEXT,
            rationale_author TEXT NOT NULL DEFAULT 'assistant',
            assumptions TEXT NOT NULL DEFAULT '[]',
            turn_index INTEGER,
            embedding BLOB,
            provenance TEXT
        )"#,
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_decisions_user ON decisions(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_decisions_project ON decisions(user_id, project_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            name TEXT NOT NULL,
            name_norm TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            aliases TEXT NOT NULL DEFAULT '[]',
            embedding BLOB,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entities_norm ON entities(user_id, name_norm)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS candidate_decisions (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            text TEXT NOT NULL,
            rejected_at TEXT NOT NULL,
            rejected_by_decision_id TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_candidates_decision
         ON candidate_decisions(rejected_by_decision_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS code_entities (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            file_path TEXT NOT NULL,
            file_stem TEXT NOT NULL,
            language TEXT NOT NULL DEFAULT 'unknown',
            line_count INTEGER,
            size_bytes INTEGER,
            created_at TEXT NOT NULL,
            UNIQUE(user_id, file_path)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS commits (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            commit_hash TEXT NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            UNIQUE(user_id, commit_hash)
        )",
        [],
    )?;

    // One row per (src, dst, type): MERGE semantics are an upsert here.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS edges (
            id TEXT PRIMARY KEY,
            src_id TEXT NOT NULL,
            src_kind TEXT NOT NULL,
            dst_id TEXT NOT NULL,
            dst_kind TEXT NOT NULL,
            rel_type TEXT NOT NULL,
            confidence REAL,
            weight REAL,
            reasoning TEXT,
            valid_at TEXT,
            invalid_at TEXT,
            properties TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            UNIQUE(src_id, dst_id, rel_type)
        )",
        [],
    )?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_edges_src ON edges(src_id)", [])?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_edges_dst ON edges(dst_id)", [])?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_edges_type ON edges(rel_type)",
        [],
    )?;

    // Full-text indices, maintained by the store on write.
    conn.execute_batch(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS decisions_fts USING fts5(
            id UNINDEXED,
            "trigger",
            context,
            decision,
            rationale
        );
        CREATE VIRTUAL TABLE IF NOT EXISTS entities_fts USING fts5(
            id UNINDEXED,
            name,
            aliases
        );
        "#,
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    Ok(())
}
