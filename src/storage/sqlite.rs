use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Executor, Sqlite};
use tracing::{debug, info, warn};

use super::embedding::{self, EmbeddingRecord};
use super::ids::IdGenerator;
use super::index::fts_terms;
use super::memory::{clamp_limit, MemoryStorage, MAX_RECENT_BRANCHES};
use super::schema;
use super::{
    Branch, CrossRef, Insight, Metrics, Relationship, Storage, ThinkingMode, Thought, TouchPoint,
    Validation,
};
use crate::config::StorageConfig;
use crate::error::{EntityKind, StorageError, StorageResult};

/// Thoughts loaded into the cache at startup.
const WARM_THOUGHT_LIMIT: i64 = 1000;
/// Connections kept open while idle.
const MIN_IDLE_CONNECTIONS: u32 = 2;
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const THOUGHT_COLUMNS: &str = "t.id, t.content, t.mode, t.branch_id, t.parent_id, t.type, \
    t.confidence, t.timestamp, t.key_points, t.metadata, t.is_rebellion, t.challenges_assumption";

const UPSERT_THOUGHT: &str = r#"
    INSERT INTO thoughts (
        id, content, mode, branch_id, parent_id, type, confidence,
        timestamp, key_points, metadata, is_rebellion, challenges_assumption
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        content = excluded.content,
        mode = excluded.mode,
        branch_id = excluded.branch_id,
        parent_id = excluded.parent_id,
        type = excluded.type,
        confidence = excluded.confidence,
        timestamp = excluded.timestamp,
        key_points = excluded.key_points,
        metadata = excluded.metadata,
        is_rebellion = excluded.is_rebellion,
        challenges_assumption = excluded.challenges_assumption
"#;

const UPSERT_BRANCH: &str = r#"
    INSERT INTO branches (
        id, parent_branch_id, state, priority, confidence,
        created_at, updated_at, last_accessed_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        parent_branch_id = excluded.parent_branch_id,
        state = excluded.state,
        priority = excluded.priority,
        confidence = excluded.confidence,
        created_at = excluded.created_at,
        updated_at = excluded.updated_at,
        last_accessed_at = excluded.last_accessed_at
"#;

const UPSERT_INSIGHT: &str = r#"
    INSERT INTO insights (
        id, branch_id, type, content, context, parent_insights,
        applicability_score, supporting_evidence, created_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        branch_id = COALESCE(excluded.branch_id, insights.branch_id),
        type = excluded.type,
        content = excluded.content,
        context = excluded.context,
        parent_insights = excluded.parent_insights,
        applicability_score = excluded.applicability_score,
        supporting_evidence = excluded.supporting_evidence,
        created_at = excluded.created_at
"#;

const UPSERT_CROSS_REF: &str = r#"
    INSERT INTO cross_refs (
        id, branch_id, from_branch, to_branch, type, reason, strength, touchpoints, created_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        branch_id = excluded.branch_id,
        from_branch = excluded.from_branch,
        to_branch = excluded.to_branch,
        type = excluded.type,
        reason = excluded.reason,
        strength = excluded.strength,
        touchpoints = excluded.touchpoints,
        created_at = excluded.created_at
"#;

const UPSERT_VALIDATION: &str = r#"
    INSERT INTO validations (
        id, insight_id, thought_id, is_valid, validation_data, reason, created_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        insight_id = excluded.insight_id,
        thought_id = excluded.thought_id,
        is_valid = excluded.is_valid,
        validation_data = excluded.validation_data,
        reason = excluded.reason,
        created_at = excluded.created_at
"#;

const UPSERT_RELATIONSHIP: &str = r#"
    INSERT INTO relationships (id, from_state_id, to_state_id, type, metadata, created_at)
    VALUES (?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        from_state_id = excluded.from_state_id,
        to_state_id = excluded.to_state_id,
        type = excluded.type,
        metadata = excluded.metadata,
        created_at = excluded.created_at
"#;

const UPSERT_EMBEDDING: &str = r#"
    INSERT INTO embeddings (
        problem_id, embedding, model, provider, dimension, source, created_at, updated_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(problem_id) DO UPDATE SET
        embedding = excluded.embedding,
        model = excluded.model,
        provider = excluded.provider,
        dimension = excluded.dimension,
        source = excluded.source,
        updated_at = excluded.updated_at
"#;

const SELECT_BRANCH: &str = r#"
    SELECT id, parent_branch_id, state, priority, confidence,
           created_at, updated_at, last_accessed_at
    FROM branches
    WHERE id = ?
"#;

const SELECT_BRANCH_INSIGHTS: &str = r#"
    SELECT id, type, content, context, parent_insights,
           applicability_score, supporting_evidence, created_at
    FROM insights
    WHERE branch_id = ?
    ORDER BY created_at, rowid
"#;

const SELECT_BRANCH_CROSS_REFS: &str = r#"
    SELECT id, from_branch, to_branch, type, reason, strength, touchpoints, created_at
    FROM cross_refs
    WHERE branch_id = ?
    ORDER BY created_at, rowid
"#;

const SELECT_INSIGHT: &str = r#"
    SELECT id, type, content, context, parent_insights,
           applicability_score, supporting_evidence, created_at
    FROM insights
    WHERE id = ?
"#;

const SELECT_VALIDATION: &str = r#"
    SELECT id, insight_id, thought_id, is_valid, validation_data, reason, created_at
    FROM validations
    WHERE id = ?
"#;

const SELECT_RELATIONSHIP: &str = r#"
    SELECT id, from_state_id, to_state_id, type, metadata, created_at
    FROM relationships
    WHERE id = ?
"#;

const SELECT_EMBEDDING: &str = r#"
    SELECT problem_id, embedding, model, provider, dimension, source
    FROM embeddings
    WHERE problem_id = ?
"#;

const COUNT_ROWS: &str = r#"
    SELECT
        (SELECT COUNT(*) FROM thoughts),
        (SELECT COUNT(*) FROM branches),
        (SELECT COUNT(*) FROM insights),
        (SELECT COUNT(*) FROM validations),
        (SELECT COUNT(*) FROM relationships),
        (SELECT COALESCE(AVG(confidence), 0.0) FROM thoughts)
"#;

/// SQLite-backed storage with an in-memory write-through cache.
///
/// Disk is the source of truth: every write lands in SQLite before the
/// cache is touched, and reads fall back to SQLite on a cache miss. The
/// active branch and the recent-branch stack live in the cache and are
/// rebuilt from `last_accessed_at` when the store is opened.
pub struct SqliteStorage {
    pool: SqlitePool,
    cache: MemoryStorage,
    ids: IdGenerator,
    closed: AtomicBool,
}

impl SqliteStorage {
    /// Open (or create) the database file named by `config`.
    ///
    /// The parent directory must already exist.
    pub async fn new(config: &StorageConfig) -> StorageResult<Self> {
        let path = &config.sqlite_path;
        if path.as_os_str().is_empty() {
            return Err(StorageError::Connection {
                message: "database path cannot be empty".to_string(),
            });
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(StorageError::Connection {
                    message: format!("database directory does not exist: {}", parent.display()),
                });
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .pragma("cache_size", "-64000")
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(MIN_IDLE_CONNECTIONS.min(config.max_connections))
            .idle_timeout(IDLE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open {}: {}", path.display(), e),
            })?;

        let storage = Self::from_pool(pool).await?;
        info!(path = %path.display(), "SQLite storage initialized");
        Ok(storage)
    }

    /// Open a private in-memory database on a single connection.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> StorageResult<Self> {
        let ready = async {
            sqlx::query("SELECT 1")
                .execute(&pool)
                .await
                .map_err(|e| StorageError::Connection {
                    message: format!("Database ping failed: {}", e),
                })?;
            schema::migrate(&pool).await?;
            let (thoughts, branches, insights, validations, relationships, _): (
                i64,
                i64,
                i64,
                i64,
                i64,
                f64,
            ) = sqlx::query_as(COUNT_ROWS).fetch_one(&pool).await?;
            Ok::<i64, StorageError>(thoughts + branches + insights + validations + relationships)
        }
        .await;

        let seed = match ready {
            Ok(seed) => seed,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };

        let storage = Self {
            pool,
            cache: MemoryStorage::new(),
            ids: IdGenerator::starting_at(seed.max(0) as u64),
            closed: AtomicBool::new(false),
        };

        if let Err(e) = storage.warm_cache().await {
            warn!(error = %e, "Failed to warm cache");
        }

        Ok(storage)
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Currently applied schema version.
    pub async fn schema_version(&self) -> StorageResult<i64> {
        self.ensure_open()?;
        Ok(schema::stored_version(&self.pool)
            .await?
            .unwrap_or_default())
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    async fn warm_cache(&self) -> StorageResult<()> {
        let rows: Vec<ThoughtRow> = sqlx::query_as(&format!(
            "SELECT {} FROM thoughts t ORDER BY t.timestamp DESC, t.rowid DESC LIMIT ?",
            THOUGHT_COLUMNS
        ))
        .bind(WARM_THOUGHT_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        // Oldest first, so the cache orders equal timestamps like the disk does.
        let mut warmed = 0usize;
        for row in rows.into_iter().rev() {
            match Thought::try_from(row) {
                Ok(thought) => {
                    self.cache.store_thought(thought).await?;
                    warmed += 1;
                }
                Err(e) => warn!(error = %e, "Skipping unreadable thought during warm-up"),
            }
        }

        let branch_ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM branches ORDER BY last_accessed_at DESC, rowid DESC LIMIT ?",
        )
        .bind(MAX_RECENT_BRANCHES as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut branches = Vec::with_capacity(branch_ids.len());
        for id in &branch_ids {
            if let Some(branch) = self.load_branch(id).await? {
                branches.push(branch);
            }
        }
        let restored = branches.len();
        self.cache.restore_branches(branches).await;

        debug!(thoughts = warmed, branches = restored, "Warmed cache");
        Ok(())
    }

    /// Load a full branch aggregate from disk.
    async fn load_branch(&self, id: &str) -> StorageResult<Option<Branch>> {
        let row: Option<BranchRow> = sqlx::query_as(SELECT_BRANCH)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut branch = Branch::try_from(row)?;

        let thoughts: Vec<ThoughtRow> = sqlx::query_as(&format!(
            "SELECT {} FROM thoughts t WHERE t.branch_id = ? ORDER BY t.timestamp, t.rowid",
            THOUGHT_COLUMNS
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        branch.thoughts = thoughts
            .into_iter()
            .map(Thought::try_from)
            .collect::<StorageResult<_>>()?;

        let insights: Vec<InsightRow> = sqlx::query_as(SELECT_BRANCH_INSIGHTS)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        branch.insights = insights
            .into_iter()
            .map(Insight::try_from)
            .collect::<StorageResult<_>>()?;

        let cross_refs: Vec<CrossRefRow> = sqlx::query_as(SELECT_BRANCH_CROSS_REFS)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        branch.cross_refs = cross_refs
            .into_iter()
            .map(CrossRef::try_from)
            .collect::<StorageResult<_>>()?;

        Ok(Some(branch))
    }

    /// Make sure a branch that exists on disk is present in the cache.
    async fn ensure_cached(&self, branch_id: &str) -> StorageResult<()> {
        if self.cache.contains_branch(branch_id).await {
            return Ok(());
        }
        if let Some(branch) = self.load_branch(branch_id).await? {
            self.cache.cache_branch(branch).await;
        }
        Ok(())
    }

    async fn branch_ids(&self) -> StorageResult<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT id FROM branches ORDER BY created_at DESC, rowid DESC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Set a branch column and bump `updated_at`, failing if the branch is
    /// missing.
    async fn update_branch_field(
        &self,
        branch_id: &str,
        column: BranchColumn,
        value: f64,
    ) -> StorageResult<()> {
        let sql = match column {
            BranchColumn::Priority => {
                "UPDATE branches SET priority = ?, updated_at = ? WHERE id = ?"
            }
            BranchColumn::Confidence => {
                "UPDATE branches SET confidence = ?, updated_at = ? WHERE id = ?"
            }
        };
        let result = sqlx::query(sql)
            .bind(value)
            .bind(Utc::now().timestamp())
            .bind(branch_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found(EntityKind::Branch, branch_id));
        }
        Ok(())
    }

    /// Cache a row read from disk; failures only cost a future cache miss.
    fn log_cache_failure(result: StorageResult<String>, kind: EntityKind) {
        if let Err(e) = result {
            warn!(%kind, error = %e, "Failed to cache entity read from disk");
        }
    }

    // ========================================================================
    // Embeddings
    // ========================================================================

    /// Store or replace the embedding for `record.problem_id`.
    pub async fn store_embedding(&self, record: &EmbeddingRecord) -> StorageResult<()> {
        self.ensure_open()?;
        let now = Utc::now().timestamp();

        sqlx::query(UPSERT_EMBEDDING)
            .bind(&record.problem_id)
            .bind(embedding::encode(&record.vector))
            .bind(&record.model)
            .bind(&record.provider)
            .bind(record.dimension as i64)
            .bind(&record.source)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Get the embedding stored for a problem.
    pub async fn get_embedding(&self, problem_id: &str) -> StorageResult<EmbeddingRecord> {
        self.ensure_open()?;
        let row: Option<EmbeddingRow> = sqlx::query_as(SELECT_EMBEDDING)
            .bind(problem_id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| StorageError::not_found(EntityKind::Embedding, problem_id))?
            .try_into()
    }

    /// All stored embeddings keyed by problem ID.
    pub async fn get_all_embeddings(&self) -> StorageResult<BTreeMap<String, Vec<f32>>> {
        self.ensure_open()?;
        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT problem_id, embedding FROM embeddings ORDER BY problem_id")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(problem_id, blob)| embedding::decode(&blob).map(|vector| (problem_id, vector)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum BranchColumn {
    Priority,
    Confidence,
}

// ============================================================================
// Writes shared by pool and transaction paths
// ============================================================================

async fn upsert_thought<'e, E>(executor: E, thought: &Thought) -> StorageResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPSERT_THOUGHT)
        .bind(&thought.id)
        .bind(&thought.content)
        .bind(thought.mode.to_string())
        .bind(thought.branch_id.as_deref())
        .bind(thought.parent_id.as_deref())
        .bind(&thought.thought_type)
        .bind(thought.confidence)
        .bind(thought.timestamp.timestamp())
        .bind(encode_json(&thought.key_points)?)
        .bind(encode_json(&thought.metadata)?)
        .bind(thought.is_rebellion)
        .bind(thought.challenges_assumption)
        .execute(executor)
        .await?;
    Ok(())
}

async fn upsert_branch_row<'e, E>(executor: E, branch: &Branch) -> StorageResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let last_accessed = branch.last_accessed_at.unwrap_or(branch.updated_at);
    sqlx::query(UPSERT_BRANCH)
        .bind(&branch.id)
        .bind(branch.parent_branch_id.as_deref())
        .bind(branch.state.to_string())
        .bind(branch.priority)
        .bind(branch.confidence)
        .bind(branch.created_at.timestamp())
        .bind(branch.updated_at.timestamp())
        .bind(last_accessed.timestamp())
        .execute(executor)
        .await?;
    Ok(())
}

async fn upsert_insight<'e, E>(
    executor: E,
    insight: &Insight,
    branch_id: Option<&str>,
) -> StorageResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPSERT_INSIGHT)
        .bind(&insight.id)
        .bind(branch_id)
        .bind(insight.insight_type.to_string())
        .bind(&insight.content)
        .bind(encode_json(&insight.context)?)
        .bind(encode_json(&insight.parent_insights)?)
        .bind(insight.applicability_score)
        .bind(encode_json(&insight.supporting_evidence)?)
        .bind(insight.created_at.timestamp())
        .execute(executor)
        .await?;
    Ok(())
}

async fn upsert_cross_ref<'e, E>(
    executor: E,
    cross_ref: &CrossRef,
    branch_id: &str,
) -> StorageResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPSERT_CROSS_REF)
        .bind(&cross_ref.id)
        .bind(branch_id)
        .bind(&cross_ref.from_branch)
        .bind(&cross_ref.to_branch)
        .bind(cross_ref.ref_type.to_string())
        .bind(&cross_ref.reason)
        .bind(cross_ref.strength)
        .bind(encode_json(&cross_ref.touch_points)?)
        .bind(cross_ref.created_at.timestamp())
        .execute(executor)
        .await?;
    Ok(())
}

/// Detach everything a branch owns so a re-store only keeps what it carries.
/// Thoughts and insights survive as standalone rows; cross-refs are dropped.
async fn release_branch_children(
    conn: &mut SqliteConnection,
    branch_id: &str,
) -> StorageResult<()> {
    for statement in [
        "UPDATE thoughts SET branch_id = NULL WHERE branch_id = ?",
        "UPDATE insights SET branch_id = NULL WHERE branch_id = ?",
        "DELETE FROM cross_refs WHERE branch_id = ?",
    ] {
        sqlx::query(statement)
            .bind(branch_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn touch_branch<'e, E>(executor: E, branch_id: &str) -> StorageResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE branches SET updated_at = ? WHERE id = ?")
        .bind(Utc::now().timestamp())
        .bind(branch_id)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::not_found(EntityKind::Branch, branch_id));
    }
    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn store_thought(&self, mut thought: Thought) -> StorageResult<String> {
        self.ensure_open()?;
        self.ids.assign(&mut thought.id, "thought");

        upsert_thought(&self.pool, &thought).await?;
        self.cache.store_thought(thought).await
    }

    async fn get_thought(&self, id: &str) -> StorageResult<Thought> {
        self.ensure_open()?;
        match self.cache.get_thought(id).await {
            Err(e) if e.is_not_found() => {}
            cached => return cached,
        }

        let row: Option<ThoughtRow> = sqlx::query_as(&format!(
            "SELECT {} FROM thoughts t WHERE t.id = ?",
            THOUGHT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let thought =
            Thought::try_from(row.ok_or_else(|| StorageError::not_found(EntityKind::Thought, id))?)?;
        Self::log_cache_failure(
            self.cache.store_thought(thought.clone()).await,
            EntityKind::Thought,
        );
        Ok(thought)
    }

    async fn search_thoughts(
        &self,
        query: &str,
        mode: Option<ThinkingMode>,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<Thought>> {
        self.ensure_open()?;
        let words = fts_terms(query);
        if words.is_empty() {
            return self.cache.search_thoughts("", mode, limit, offset).await;
        }

        let match_expr = words
            .iter()
            .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" OR ");
        let mode_text = mode.map(|m| m.to_string());

        let rows: Vec<ThoughtRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM thoughts_fts
            JOIN thoughts t ON t.rowid = thoughts_fts.rowid
            WHERE thoughts_fts MATCH ? AND (? IS NULL OR t.mode = ?)
            ORDER BY t.timestamp DESC, t.rowid DESC
            LIMIT ? OFFSET ?
            "#,
            THOUGHT_COLUMNS
        ))
        .bind(&match_expr)
        .bind(mode_text.as_deref())
        .bind(mode_text.as_deref())
        .bind(clamp_limit(limit) as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Thought::try_from).collect()
    }

    async fn store_branch(&self, mut branch: Branch) -> StorageResult<String> {
        self.ensure_open()?;
        self.ids.assign(&mut branch.id, "branch");
        if branch.last_accessed_at.is_none() {
            branch.last_accessed_at = Some(Utc::now());
        }
        for thought in &mut branch.thoughts {
            self.ids.assign(&mut thought.id, "thought");
            thought.branch_id = Some(branch.id.clone());
        }
        for insight in &mut branch.insights {
            self.ids.assign(&mut insight.id, "insight");
        }
        for cross_ref in &mut branch.cross_refs {
            self.ids.assign(&mut cross_ref.id, "xref");
        }

        let mut tx = self.pool.begin().await?;
        upsert_branch_row(&mut *tx, &branch).await?;
        release_branch_children(&mut tx, &branch.id).await?;
        for thought in &branch.thoughts {
            upsert_thought(&mut *tx, thought).await?;
        }
        for insight in &branch.insights {
            upsert_insight(&mut *tx, insight, Some(&branch.id)).await?;
        }
        for cross_ref in &branch.cross_refs {
            upsert_cross_ref(&mut *tx, cross_ref, &branch.id).await?;
        }
        tx.commit().await?;

        self.cache.store_branch(branch).await
    }

    async fn get_branch(&self, id: &str) -> StorageResult<Branch> {
        self.ensure_open()?;
        match self.cache.get_branch(id).await {
            Err(e) if e.is_not_found() => {}
            cached => return cached,
        }

        let branch = self
            .load_branch(id)
            .await?
            .ok_or_else(|| StorageError::not_found(EntityKind::Branch, id))?;
        self.cache.cache_branch(branch.clone()).await;
        Ok(branch)
    }

    async fn list_branches(&self) -> StorageResult<Vec<Branch>> {
        self.ensure_open()?;
        let ids = self.branch_ids().await?;
        let mut branches = Vec::with_capacity(ids.len());
        for id in &ids {
            branches.push(self.get_branch(id).await?);
        }
        Ok(branches)
    }

    async fn get_active_branch(&self) -> StorageResult<Branch> {
        self.ensure_open()?;
        self.cache.get_active_branch().await
    }

    async fn set_active_branch(&self, branch_id: &str) -> StorageResult<()> {
        self.ensure_open()?;
        self.ensure_cached(branch_id).await?;
        if !self.cache.contains_branch(branch_id).await {
            return Err(StorageError::BranchUnavailable {
                branch_id: branch_id.to_string(),
                available: self.branch_ids().await?,
            });
        }

        sqlx::query("UPDATE branches SET last_accessed_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(branch_id)
            .execute(&self.pool)
            .await?;
        self.cache.set_active_branch(branch_id).await
    }

    async fn update_branch_access(&self, branch_id: &str) -> StorageResult<()> {
        self.ensure_open()?;
        let result = sqlx::query("UPDATE branches SET last_accessed_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(branch_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found(EntityKind::Branch, branch_id));
        }

        self.ensure_cached(branch_id).await?;
        self.cache.update_branch_access(branch_id).await
    }

    async fn append_thought_to_branch(
        &self,
        branch_id: &str,
        thought: &Thought,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        let mut item = thought.clone();
        self.ids.assign(&mut item.id, "thought");
        item.branch_id = Some(branch_id.to_string());

        let mut tx = self.pool.begin().await?;
        touch_branch(&mut *tx, branch_id).await?;
        upsert_thought(&mut *tx, &item).await?;
        tx.commit().await?;

        if self.cache.contains_branch(branch_id).await {
            self.cache.append_thought_to_branch(branch_id, &item).await?;
        } else {
            self.cache.store_thought(item).await?;
        }
        Ok(())
    }

    async fn append_insight_to_branch(
        &self,
        branch_id: &str,
        insight: &Insight,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        let mut item = insight.clone();
        self.ids.assign(&mut item.id, "insight");

        let mut tx = self.pool.begin().await?;
        touch_branch(&mut *tx, branch_id).await?;
        upsert_insight(&mut *tx, &item, Some(branch_id)).await?;
        tx.commit().await?;

        if self.cache.contains_branch(branch_id).await {
            self.cache.append_insight_to_branch(branch_id, &item).await?;
        } else {
            self.cache.store_insight(item).await?;
        }
        Ok(())
    }

    async fn append_cross_ref_to_branch(
        &self,
        branch_id: &str,
        cross_ref: &CrossRef,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        let mut item = cross_ref.clone();
        self.ids.assign(&mut item.id, "xref");

        let mut tx = self.pool.begin().await?;
        touch_branch(&mut *tx, branch_id).await?;
        upsert_cross_ref(&mut *tx, &item, branch_id).await?;
        tx.commit().await?;

        if self.cache.contains_branch(branch_id).await {
            self.cache.append_cross_ref_to_branch(branch_id, &item).await?;
        }
        Ok(())
    }

    async fn update_branch_priority(&self, branch_id: &str, priority: f64) -> StorageResult<()> {
        self.ensure_open()?;
        self.update_branch_field(branch_id, BranchColumn::Priority, priority)
            .await?;
        if self.cache.contains_branch(branch_id).await {
            self.cache.update_branch_priority(branch_id, priority).await?;
        }
        Ok(())
    }

    async fn update_branch_confidence(
        &self,
        branch_id: &str,
        confidence: f64,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        self.update_branch_field(branch_id, BranchColumn::Confidence, confidence)
            .await?;
        if self.cache.contains_branch(branch_id).await {
            self.cache
                .update_branch_confidence(branch_id, confidence)
                .await?;
        }
        Ok(())
    }

    async fn get_recent_branches(&self) -> StorageResult<Vec<Branch>> {
        self.ensure_open()?;
        self.cache.get_recent_branches().await
    }

    async fn store_insight(&self, mut insight: Insight) -> StorageResult<String> {
        self.ensure_open()?;
        self.ids.assign(&mut insight.id, "insight");

        upsert_insight(&self.pool, &insight, None).await?;
        self.cache.store_insight(insight).await
    }

    async fn get_insight(&self, id: &str) -> StorageResult<Insight> {
        self.ensure_open()?;
        match self.cache.get_insight(id).await {
            Err(e) if e.is_not_found() => {}
            cached => return cached,
        }

        let row: Option<InsightRow> = sqlx::query_as(SELECT_INSIGHT)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let insight =
            Insight::try_from(row.ok_or_else(|| StorageError::not_found(EntityKind::Insight, id))?)?;
        Self::log_cache_failure(
            self.cache.store_insight(insight.clone()).await,
            EntityKind::Insight,
        );
        Ok(insight)
    }

    async fn store_validation(&self, mut validation: Validation) -> StorageResult<String> {
        self.ensure_open()?;
        self.ids.assign(&mut validation.id, "validation");

        sqlx::query(UPSERT_VALIDATION)
            .bind(&validation.id)
            .bind(validation.insight_id.as_deref())
            .bind(validation.thought_id.as_deref())
            .bind(validation.is_valid)
            .bind(encode_json(&validation.validation_data)?)
            .bind(&validation.reason)
            .bind(validation.created_at.timestamp())
            .execute(&self.pool)
            .await?;

        self.cache.store_validation(validation).await
    }

    async fn get_validation(&self, id: &str) -> StorageResult<Validation> {
        self.ensure_open()?;
        match self.cache.get_validation(id).await {
            Err(e) if e.is_not_found() => {}
            cached => return cached,
        }

        let row: Option<ValidationRow> = sqlx::query_as(SELECT_VALIDATION)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let validation = Validation::try_from(
            row.ok_or_else(|| StorageError::not_found(EntityKind::Validation, id))?,
        )?;
        Self::log_cache_failure(
            self.cache.store_validation(validation.clone()).await,
            EntityKind::Validation,
        );
        Ok(validation)
    }

    async fn store_relationship(&self, mut relationship: Relationship) -> StorageResult<String> {
        self.ensure_open()?;
        self.ids.assign(&mut relationship.id, "rel");

        sqlx::query(UPSERT_RELATIONSHIP)
            .bind(&relationship.id)
            .bind(&relationship.from_state_id)
            .bind(&relationship.to_state_id)
            .bind(&relationship.rel_type)
            .bind(encode_json(&relationship.metadata)?)
            .bind(relationship.created_at.timestamp())
            .execute(&self.pool)
            .await?;

        self.cache.store_relationship(relationship).await
    }

    async fn get_relationship(&self, id: &str) -> StorageResult<Relationship> {
        self.ensure_open()?;
        match self.cache.get_relationship(id).await {
            Err(e) if e.is_not_found() => {}
            cached => return cached,
        }

        let row: Option<RelationshipRow> = sqlx::query_as(SELECT_RELATIONSHIP)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let relationship = Relationship::try_from(
            row.ok_or_else(|| StorageError::not_found(EntityKind::Relationship, id))?,
        )?;
        Self::log_cache_failure(
            self.cache.store_relationship(relationship.clone()).await,
            EntityKind::Relationship,
        );
        Ok(relationship)
    }

    async fn get_metrics(&self) -> StorageResult<Metrics> {
        self.ensure_open()?;
        let (thoughts, branches, insights, validations, relationships, average_confidence): (
            i64,
            i64,
            i64,
            i64,
            i64,
            f64,
        ) = sqlx::query_as(COUNT_ROWS).fetch_one(&self.pool).await?;

        let by_mode: Vec<(String, i64)> =
            sqlx::query_as("SELECT mode, COUNT(*) FROM thoughts GROUP BY mode")
                .fetch_all(&self.pool)
                .await?;

        Ok(Metrics {
            total_thoughts: thoughts as usize,
            total_branches: branches as usize,
            total_insights: insights as usize,
            total_validations: validations as usize,
            total_relationships: relationships as usize,
            thoughts_by_mode: by_mode
                .into_iter()
                .map(|(mode, count)| (mode, count as usize))
                .collect(),
            average_confidence,
        })
    }

    async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pool.close().await;
        info!("SQLite storage closed");
        Ok(())
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ThoughtRow {
    id: String,
    content: String,
    mode: String,
    branch_id: Option<String>,
    parent_id: Option<String>,
    #[sqlx(rename = "type")]
    thought_type: String,
    confidence: f64,
    timestamp: i64,
    key_points: Option<String>,
    metadata: Option<String>,
    is_rebellion: bool,
    challenges_assumption: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct BranchRow {
    id: String,
    parent_branch_id: Option<String>,
    state: String,
    priority: f64,
    confidence: f64,
    created_at: i64,
    updated_at: i64,
    last_accessed_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct InsightRow {
    id: String,
    #[sqlx(rename = "type")]
    insight_type: String,
    content: String,
    context: Option<String>,
    parent_insights: Option<String>,
    applicability_score: f64,
    supporting_evidence: Option<String>,
    created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CrossRefRow {
    id: String,
    from_branch: String,
    to_branch: String,
    #[sqlx(rename = "type")]
    ref_type: String,
    reason: String,
    strength: f64,
    touchpoints: Option<String>,
    created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ValidationRow {
    id: String,
    insight_id: Option<String>,
    thought_id: Option<String>,
    is_valid: bool,
    validation_data: Option<String>,
    reason: Option<String>,
    created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct RelationshipRow {
    id: String,
    from_state_id: String,
    to_state_id: String,
    #[sqlx(rename = "type")]
    rel_type: String,
    metadata: Option<String>,
    created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct EmbeddingRow {
    problem_id: String,
    embedding: Vec<u8>,
    model: String,
    provider: String,
    dimension: i64,
    source: String,
}

fn encode_json<T: Serialize>(value: &T) -> StorageResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a serialized list/map column. Absent or malformed values read as
/// empty.
fn decode_json<T>(table: &'static str, column: &'static str, id: &str, raw: Option<String>) -> T
where
    T: DeserializeOwned + Default,
{
    match raw.as_deref().map(str::trim) {
        None | Some("") => T::default(),
        Some(text) => serde_json::from_str(text).unwrap_or_else(|e| {
            warn!(table, column, id, error = %e, "Malformed stored JSON, using empty value");
            T::default()
        }),
    }
}

fn from_epoch(table: &'static str, secs: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| StorageError::CorruptRow {
        table,
        message: format!("timestamp out of range: {}", secs),
    })
}

fn parse_column<T>(table: &'static str, raw: &str) -> StorageResult<T>
where
    T: FromStr<Err = String>,
{
    raw.parse()
        .map_err(|message| StorageError::CorruptRow { table, message })
}

impl TryFrom<ThoughtRow> for Thought {
    type Error = StorageError;

    fn try_from(row: ThoughtRow) -> Result<Self, Self::Error> {
        Ok(Thought {
            mode: parse_column("thoughts", &row.mode)?,
            timestamp: from_epoch("thoughts", row.timestamp)?,
            key_points: decode_json("thoughts", "key_points", &row.id, row.key_points),
            metadata: decode_json("thoughts", "metadata", &row.id, row.metadata),
            id: row.id,
            content: row.content,
            branch_id: row.branch_id,
            parent_id: row.parent_id,
            thought_type: row.thought_type,
            confidence: row.confidence,
            is_rebellion: row.is_rebellion,
            challenges_assumption: row.challenges_assumption,
        })
    }
}

impl TryFrom<BranchRow> for Branch {
    type Error = StorageError;

    fn try_from(row: BranchRow) -> Result<Self, Self::Error> {
        Ok(Branch {
            id: row.id,
            parent_branch_id: row.parent_branch_id,
            state: parse_column("branches", &row.state)?,
            priority: row.priority,
            confidence: row.confidence,
            thoughts: Vec::new(),
            insights: Vec::new(),
            cross_refs: Vec::new(),
            created_at: from_epoch("branches", row.created_at)?,
            updated_at: from_epoch("branches", row.updated_at)?,
            last_accessed_at: Some(from_epoch("branches", row.last_accessed_at)?),
        })
    }
}

impl TryFrom<InsightRow> for Insight {
    type Error = StorageError;

    fn try_from(row: InsightRow) -> Result<Self, Self::Error> {
        Ok(Insight {
            insight_type: parse_column("insights", &row.insight_type)?,
            created_at: from_epoch("insights", row.created_at)?,
            context: decode_json("insights", "context", &row.id, row.context),
            parent_insights: decode_json("insights", "parent_insights", &row.id, row.parent_insights),
            supporting_evidence: decode_json(
                "insights",
                "supporting_evidence",
                &row.id,
                row.supporting_evidence,
            ),
            id: row.id,
            content: row.content,
            applicability_score: row.applicability_score,
        })
    }
}

impl TryFrom<CrossRefRow> for CrossRef {
    type Error = StorageError;

    fn try_from(row: CrossRefRow) -> Result<Self, Self::Error> {
        let touch_points: Vec<TouchPoint> =
            decode_json("cross_refs", "touchpoints", &row.id, row.touchpoints);
        Ok(CrossRef {
            ref_type: parse_column("cross_refs", &row.ref_type)?,
            created_at: from_epoch("cross_refs", row.created_at)?,
            touch_points,
            id: row.id,
            from_branch: row.from_branch,
            to_branch: row.to_branch,
            reason: row.reason,
            strength: row.strength,
        })
    }
}

impl TryFrom<ValidationRow> for Validation {
    type Error = StorageError;

    fn try_from(row: ValidationRow) -> Result<Self, Self::Error> {
        Ok(Validation {
            created_at: from_epoch("validations", row.created_at)?,
            validation_data: decode_json("validations", "validation_data", &row.id, row.validation_data),
            id: row.id,
            insight_id: row.insight_id,
            thought_id: row.thought_id,
            is_valid: row.is_valid,
            reason: row.reason.unwrap_or_default(),
        })
    }
}

impl TryFrom<RelationshipRow> for Relationship {
    type Error = StorageError;

    fn try_from(row: RelationshipRow) -> Result<Self, Self::Error> {
        Ok(Relationship {
            created_at: from_epoch("relationships", row.created_at)?,
            metadata: decode_json("relationships", "metadata", &row.id, row.metadata),
            id: row.id,
            from_state_id: row.from_state_id,
            to_state_id: row.to_state_id,
            rel_type: row.rel_type,
        })
    }
}

impl TryFrom<EmbeddingRow> for EmbeddingRecord {
    type Error = StorageError;

    fn try_from(row: EmbeddingRow) -> Result<Self, Self::Error> {
        Ok(EmbeddingRecord {
            vector: embedding::decode(&row.embedding)?,
            problem_id: row.problem_id,
            model: row.model,
            provider: row.provider,
            dimension: row.dimension.max(0) as usize,
            source: row.source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BranchState, CrossRefType, InsightType};
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_open_and_version() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        assert_eq!(
            storage.schema_version().await.unwrap(),
            schema::CURRENT_SCHEMA_VERSION
        );
    }

    #[tokio::test]
    async fn test_malformed_json_reads_as_empty() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        sqlx::query(
            r#"
            INSERT INTO thoughts (id, content, mode, confidence, timestamp, key_points, metadata)
            VALUES ('t-bad', 'broken json', 'linear', 0.4, 100, '[not json', '{"ok": 1}')
            "#,
        )
        .execute(storage.pool())
        .await
        .unwrap();

        let thought = storage.get_thought("t-bad").await.unwrap();
        assert!(thought.key_points.is_empty());
        assert_eq!(thought.metadata["ok"], json!(1));
        assert_eq!(thought.timestamp.timestamp(), 100);
    }

    #[tokio::test]
    async fn test_unknown_enum_text_is_corrupt_row() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO thoughts (id, content, mode, confidence, timestamp) VALUES ('t-odd', 'x', 'sideways', 0.4, 0)",
        )
        .execute(storage.pool())
        .await
        .unwrap();

        let err = storage.get_thought("t-odd").await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::CorruptRow {
                table: "thoughts",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cache_miss_reads_from_disk_and_caches() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO insights (id, type, content, applicability_score, created_at, context) VALUES ('i1', 'connection', 'linked', 0.7, 10, '[\"a\"]')",
        )
        .execute(storage.pool())
        .await
        .unwrap();

        let insight = storage.get_insight("i1").await.unwrap();
        assert_eq!(insight.insight_type, InsightType::Connection);
        assert_eq!(insight.context, vec!["a"]);
        assert!(storage.cache.get_insight("i1").await.is_ok());
    }

    #[tokio::test]
    async fn test_branch_aggregate_written_in_one_step() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let mut branch = Branch::new().with_id("b1").with_state(BranchState::Suspended);
        branch
            .thoughts
            .push(Thought::new("embedded thought", ThinkingMode::Tree));
        branch
            .insights
            .push(Insight::new(InsightType::Observation, "embedded insight"));
        branch.cross_refs.push(
            CrossRef::new("b1", "elsewhere", CrossRefType::Alternative)
                .with_touch_point("t1", "t9", "same premise"),
        );
        storage.store_branch(branch).await.unwrap();

        let loaded = storage.load_branch("b1").await.unwrap().unwrap();
        assert_eq!(loaded.state, BranchState::Suspended);
        assert_eq!(loaded.thoughts.len(), 1);
        assert_eq!(loaded.thoughts[0].branch_id.as_deref(), Some("b1"));
        assert!(!loaded.thoughts[0].id.is_empty());
        assert_eq!(loaded.insights.len(), 1);
        assert_eq!(loaded.cross_refs.len(), 1);
        assert_eq!(loaded.cross_refs[0].touch_points[0].connection, "same premise");
        assert_eq!(loaded.cross_refs[0].to_branch, "elsewhere");
    }

    #[tokio::test]
    async fn test_append_to_uncached_branch_caches_thought_only() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        upsert_branch_row(storage.pool(), &Branch::new().with_id("cold"))
            .await
            .unwrap();
        assert!(!storage.cache.contains_branch("cold").await);

        storage
            .append_thought_to_branch(
                "cold",
                &Thought::new("late", ThinkingMode::Linear).with_id("t1"),
            )
            .await
            .unwrap();

        assert!(!storage.cache.contains_branch("cold").await);
        let cached = storage.cache.get_thought("t1").await.unwrap();
        assert_eq!(cached.branch_id.as_deref(), Some("cold"));
        let branch = storage.get_branch("cold").await.unwrap();
        assert_eq!(branch.thoughts.len(), 1);
        assert_eq!(branch.thoughts[0].content, "late");
    }

    #[tokio::test]
    async fn test_fts_query_escapes_quotes() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        storage
            .store_thought(Thought::new(r#"say a"b loudly"#, ThinkingMode::Linear))
            .await
            .unwrap();

        let results = storage
            .search_thoughts(r#"a"b"#, None, 10, 0)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_branch_restore_detaches_rows_it_no_longer_carries() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let mut branch = Branch::new().with_id("b1");
        branch
            .thoughts
            .push(Thought::new("first draft", ThinkingMode::Tree).with_id("t1"));
        branch
            .insights
            .push(Insight::new(InsightType::Observation, "aside").with_id("i1"));
        branch
            .cross_refs
            .push(CrossRef::new("b1", "b2", CrossRefType::Complementary).with_id("x1"));
        storage.store_branch(branch).await.unwrap();

        storage
            .store_branch(Branch::new().with_id("b1"))
            .await
            .unwrap();

        let (thought_owner,): (Option<String>,) =
            sqlx::query_as("SELECT branch_id FROM thoughts WHERE id = 't1'")
                .fetch_one(storage.pool())
                .await
                .unwrap();
        assert!(thought_owner.is_none());
        let (insight_owner,): (Option<String>,) =
            sqlx::query_as("SELECT branch_id FROM insights WHERE id = 'i1'")
                .fetch_one(storage.pool())
                .await
                .unwrap();
        assert!(insight_owner.is_none());
        let (cross_refs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cross_refs")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(cross_refs, 0);

        let loaded = storage.load_branch("b1").await.unwrap().unwrap();
        assert!(loaded.thoughts.is_empty());
        assert!(loaded.insights.is_empty());
    }
}
