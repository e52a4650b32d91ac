//! SQLite schema and ordered migrations.
//!
//! Every statement is idempotent (`IF NOT EXISTS`). The applied version is
//! kept in `schema_metadata` under the `version` key; each migration step
//! runs in one transaction together with its version bump.

use sqlx::sqlite::SqlitePool;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};

/// Schema version this build reads and writes.
pub const CURRENT_SCHEMA_VERSION: i64 = 3;

const SCHEMA_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Version 1: entity tables, full-text index and its sync triggers.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS branches (
    id TEXT PRIMARY KEY,
    parent_branch_id TEXT,
    state TEXT NOT NULL,
    priority REAL NOT NULL DEFAULT 0.0,
    confidence REAL NOT NULL DEFAULT 0.0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL,
    FOREIGN KEY (parent_branch_id) REFERENCES branches(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS thoughts (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    mode TEXT NOT NULL,
    branch_id TEXT,
    parent_id TEXT,
    type TEXT NOT NULL DEFAULT '',
    confidence REAL NOT NULL,
    timestamp INTEGER NOT NULL,
    key_points TEXT,
    metadata TEXT,
    is_rebellion INTEGER NOT NULL DEFAULT 0,
    challenges_assumption INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (branch_id) REFERENCES branches(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS insights (
    id TEXT PRIMARY KEY,
    branch_id TEXT,
    type TEXT NOT NULL,
    content TEXT NOT NULL,
    context TEXT,
    parent_insights TEXT,
    applicability_score REAL NOT NULL,
    supporting_evidence TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (branch_id) REFERENCES branches(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS cross_refs (
    id TEXT PRIMARY KEY,
    branch_id TEXT NOT NULL,
    from_branch TEXT NOT NULL,
    to_branch TEXT NOT NULL,
    type TEXT NOT NULL,
    reason TEXT NOT NULL,
    strength REAL NOT NULL,
    touchpoints TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (branch_id) REFERENCES branches(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS validations (
    id TEXT PRIMARY KEY,
    insight_id TEXT,
    thought_id TEXT,
    is_valid INTEGER NOT NULL,
    validation_data TEXT,
    reason TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS relationships (
    id TEXT PRIMARY KEY,
    from_state_id TEXT NOT NULL,
    to_state_id TEXT NOT NULL,
    type TEXT NOT NULL,
    metadata TEXT,
    created_at INTEGER NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS thoughts_fts USING fts5(
    id UNINDEXED,
    content,
    content='thoughts',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS thoughts_fts_insert AFTER INSERT ON thoughts BEGIN
    INSERT INTO thoughts_fts(rowid, id, content) VALUES (new.rowid, new.id, new.content);
END;

CREATE TRIGGER IF NOT EXISTS thoughts_fts_update AFTER UPDATE ON thoughts BEGIN
    INSERT INTO thoughts_fts(thoughts_fts, rowid, id, content)
        VALUES ('delete', old.rowid, old.id, old.content);
    INSERT INTO thoughts_fts(rowid, id, content) VALUES (new.rowid, new.id, new.content);
END;

CREATE TRIGGER IF NOT EXISTS thoughts_fts_delete AFTER DELETE ON thoughts BEGIN
    INSERT INTO thoughts_fts(thoughts_fts, rowid, id, content)
        VALUES ('delete', old.rowid, old.id, old.content);
END;

CREATE INDEX IF NOT EXISTS idx_thoughts_mode ON thoughts(mode);
CREATE INDEX IF NOT EXISTS idx_thoughts_branch ON thoughts(branch_id) WHERE branch_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_thoughts_timestamp ON thoughts(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_insights_branch ON insights(branch_id) WHERE branch_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_branches_accessed ON branches(last_accessed_at DESC);
CREATE INDEX IF NOT EXISTS idx_branches_priority ON branches(priority DESC);
CREATE INDEX IF NOT EXISTS idx_crossrefs_branch ON cross_refs(branch_id);
CREATE INDEX IF NOT EXISTS idx_crossrefs_to ON cross_refs(to_branch);
"#;

/// Version 2: vector embeddings keyed by problem ID.
const SCHEMA_V2: &str = r#"
CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    problem_id TEXT NOT NULL UNIQUE,
    embedding BLOB NOT NULL,
    model TEXT NOT NULL,
    provider TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    source TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model);
"#;

/// Version 3: lookup indices for validations and relationships.
const SCHEMA_V3: &str = r#"
CREATE INDEX IF NOT EXISTS idx_validations_insight ON validations(insight_id) WHERE insight_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_validations_thought ON validations(thought_id) WHERE thought_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_relationships_from ON relationships(from_state_id);
CREATE INDEX IF NOT EXISTS idx_relationships_to ON relationships(to_state_id);
"#;

/// Ordered (version, DDL) steps. Steps only ever add.
pub(crate) const MIGRATIONS: &[(i64, &str)] = &[(1, SCHEMA_V1), (2, SCHEMA_V2), (3, SCHEMA_V3)];

/// Read the stored schema version, `None` for a fresh database.
pub(crate) async fn stored_version(pool: &SqlitePool) -> StorageResult<Option<i64>> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT value FROM schema_metadata WHERE key = 'version'")
            .fetch_optional(pool)
            .await?;

    raw.map(|value| {
        value.trim().parse::<i64>().map_err(|e| StorageError::Migration {
            message: format!("Unreadable schema version '{}': {}", value, e),
        })
    })
    .transpose()
}

/// Bring the database up to [`CURRENT_SCHEMA_VERSION`].
///
/// Returns the version found before migrating (0 for a fresh database).
pub(crate) async fn migrate(pool: &SqlitePool) -> StorageResult<i64> {
    sqlx::raw_sql(SCHEMA_METADATA)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Migration {
            message: format!("Failed to create schema metadata: {}", e),
        })?;

    let found = stored_version(pool).await?.unwrap_or(0);
    if found > CURRENT_SCHEMA_VERSION {
        return Err(StorageError::SchemaTooNew {
            found,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if found == CURRENT_SCHEMA_VERSION {
        debug!(version = found, "Schema is up to date");
        return Ok(found);
    }

    info!(
        from = found,
        to = CURRENT_SCHEMA_VERSION,
        "Running database migrations..."
    );

    for (version, ddl) in MIGRATIONS.iter().filter(|(v, _)| *v > found) {
        let mut tx = pool.begin().await?;

        sqlx::raw_sql(ddl)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Migration {
                message: format!("Failed to apply schema version {}: {}", version, e),
            })?;

        sqlx::query(
            r#"
            INSERT INTO schema_metadata (key, value) VALUES ('version', ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(version.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(version, "Applied schema migration");
    }

    info!(version = CURRENT_SCHEMA_VERSION, "Database migrations completed successfully");
    Ok(found)
}
