//! Conceptual schema from §4.4, applied idempotently at pool-open time.

use rusqlite::Connection;

/// Creates every table, index, and the FTS shadow index if they don't already
/// exist. Safe to call on every process start.
pub fn apply(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS diagrams (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            project TEXT NOT NULL DEFAULT '',
            spec TEXT NOT NULL,
            thumbnail_url TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            owner_id TEXT,
            is_public INTEGER NOT NULL DEFAULT 0,
            shares TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS diagram_versions (
            id TEXT PRIMARY KEY,
            diagram_id TEXT NOT NULL REFERENCES diagrams(id) ON DELETE CASCADE,
            version INTEGER NOT NULL,
            spec TEXT NOT NULL,
            message TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(diagram_id, version)
        );

        CREATE TABLE IF NOT EXISTS agent_runs (
            id TEXT PRIMARY KEY,
            diagram_id TEXT NOT NULL REFERENCES diagrams(id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_diagrams_project ON diagrams(project);
        CREATE INDEX IF NOT EXISTS idx_diagrams_updated_at ON diagrams(updated_at);
        CREATE INDEX IF NOT EXISTS idx_diagrams_created_at ON diagrams(created_at);
        CREATE INDEX IF NOT EXISTS idx_diagrams_name_nocase ON diagrams(name COLLATE NOCASE);
        CREATE INDEX IF NOT EXISTS idx_diagrams_project_updated ON diagrams(project, updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_diagrams_owner ON diagrams(owner_id);
        CREATE INDEX IF NOT EXISTS idx_diagrams_owner_updated ON diagrams(owner_id, updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_diagrams_type ON diagrams(json_extract(spec, '$.type'));
        CREATE INDEX IF NOT EXISTS idx_versions_diagram_version ON diagram_versions(diagram_id, version DESC);

        CREATE VIRTUAL TABLE IF NOT EXISTS diagrams_fts USING fts5(
            id UNINDEXED,
            name,
            project,
            tokenize = 'trigram'
        );

        CREATE TRIGGER IF NOT EXISTS diagrams_fts_ai AFTER INSERT ON diagrams BEGIN
            INSERT INTO diagrams_fts(id, name, project) VALUES (new.id, new.name, new.project);
        END;

        CREATE TRIGGER IF NOT EXISTS diagrams_fts_ad AFTER DELETE ON diagrams BEGIN
            DELETE FROM diagrams_fts WHERE id = old.id;
        END;

        CREATE TRIGGER IF NOT EXISTS diagrams_fts_au AFTER UPDATE ON diagrams BEGIN
            DELETE FROM diagrams_fts WHERE id = old.id;
            INSERT INTO diagrams_fts(id, name, project) VALUES (new.id, new.name, new.project);
        END;
        "#,
    )
}
