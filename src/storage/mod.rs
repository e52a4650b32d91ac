//! Storage engine for reasoning artifacts.
//!
//! Two backends implement the [`Storage`] contract:
//! - [`MemoryStorage`]: concurrent in-memory tables with an inverted content
//!   index, mode index and newest-first projections for pagination.
//! - [`SqliteStorage`]: SQLite (WAL + FTS5) with a private `MemoryStorage`
//!   used as a write-through read cache.
//!
//! [`new_storage`] picks one from a [`StorageConfig`](crate::config::StorageConfig).
//! Every read hands out an owned copy; nothing returned by a backend aliases
//! its internal state.

mod copy;
pub mod embedding;
mod factory;
mod ids;
mod index;
mod memory;
mod schema;
mod sqlite;


pub use embedding::EmbeddingRecord;
pub use factory::{close_storage, new_storage, new_storage_from_env};
pub use index::{MAX_INDEX_SIZE, MAX_INDEX_WORD_LENGTH, MAX_UNIQUE_WORDS_PER_THOUGHT};
pub use memory::{MemoryStorage, MAX_RECENT_BRANCHES, MAX_SEARCH_RESULTS};
pub use schema::CURRENT_SCHEMA_VERSION;
pub use sqlite::SqliteStorage;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;

/// Open-ended key/value mapping carried by several entities.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Thinking mode that produced a thought.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingMode {
    /// Sequential step-by-step reasoning.
    #[default]
    Linear,
    /// Branching exploration.
    Tree,
    /// Creative, multi-perspective exploration.
    Divergent,
    /// Mode chosen automatically.
    Auto,
}

impl std::fmt::Display for ThinkingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThinkingMode::Linear => write!(f, "linear"),
            ThinkingMode::Tree => write!(f, "tree"),
            ThinkingMode::Divergent => write!(f, "divergent"),
            ThinkingMode::Auto => write!(f, "auto"),
        }
    }
}

impl std::str::FromStr for ThinkingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(ThinkingMode::Linear),
            "tree" => Ok(ThinkingMode::Tree),
            "divergent" => Ok(ThinkingMode::Divergent),
            "auto" => Ok(ThinkingMode::Auto),
            _ => Err(format!("Unknown thinking mode: {}", s)),
        }
    }
}

/// State of a reasoning branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    /// Branch is actively being explored.
    #[default]
    Active,
    /// Branch is paused.
    Suspended,
    /// Branch has been completed.
    Completed,
    /// Branch was abandoned.
    DeadEnd,
}

impl std::fmt::Display for BranchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchState::Active => write!(f, "active"),
            BranchState::Suspended => write!(f, "suspended"),
            BranchState::Completed => write!(f, "completed"),
            BranchState::DeadEnd => write!(f, "dead_end"),
        }
    }
}

impl std::str::FromStr for BranchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(BranchState::Active),
            "suspended" => Ok(BranchState::Suspended),
            "completed" => Ok(BranchState::Completed),
            "dead_end" => Ok(BranchState::DeadEnd),
            _ => Err(format!("Unknown branch state: {}", s)),
        }
    }
}

/// Category of a derived insight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    BehavioralPattern,
    FeatureIntegration,
    #[default]
    Observation,
    Connection,
}

impl std::fmt::Display for InsightType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InsightType::BehavioralPattern => write!(f, "behavioral_pattern"),
            InsightType::FeatureIntegration => write!(f, "feature_integration"),
            InsightType::Observation => write!(f, "observation"),
            InsightType::Connection => write!(f, "connection"),
        }
    }
}

impl std::str::FromStr for InsightType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "behavioral_pattern" => Ok(InsightType::BehavioralPattern),
            "feature_integration" => Ok(InsightType::FeatureIntegration),
            "observation" => Ok(InsightType::Observation),
            "connection" => Ok(InsightType::Connection),
            _ => Err(format!("Unknown insight type: {}", s)),
        }
    }
}

/// Type of cross-reference between branches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossRefType {
    /// The branches complement each other.
    #[default]
    Complementary,
    /// The branches reach conflicting conclusions.
    Contradictory,
    /// The source branch builds on the target.
    BuildsUpon,
    /// The source branch is an alternative to the target.
    Alternative,
}

impl std::fmt::Display for CrossRefType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrossRefType::Complementary => write!(f, "complementary"),
            CrossRefType::Contradictory => write!(f, "contradictory"),
            CrossRefType::BuildsUpon => write!(f, "builds_upon"),
            CrossRefType::Alternative => write!(f, "alternative"),
        }
    }
}

impl std::str::FromStr for CrossRefType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "complementary" => Ok(CrossRefType::Complementary),
            "contradictory" => Ok(CrossRefType::Contradictory),
            "builds_upon" => Ok(CrossRefType::BuildsUpon),
            "alternative" => Ok(CrossRefType::Alternative),
            _ => Err(format!("Unknown cross-ref type: {}", s)),
        }
    }
}

/// A single reasoning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    /// Unique thought identifier. Assigned by the store when empty.
    pub id: String,
    /// The thought content/text.
    pub content: String,
    /// Reasoning mode that generated this thought.
    pub mode: ThinkingMode,
    /// Owning branch, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Parent thought ID for chained reasoning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Free-form type tag.
    #[serde(rename = "type", default)]
    pub thought_type: String,
    /// Confidence score (0.0-1.0).
    pub confidence: f64,
    /// When the thought was created.
    pub timestamp: DateTime<Utc>,
    /// Ordered key points.
    #[serde(default)]
    pub key_points: Vec<String>,
    /// Arbitrary metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Whether the thought deliberately argues against the mainstream.
    #[serde(default)]
    pub is_rebellion: bool,
    /// Whether the thought challenges an assumption.
    #[serde(default)]
    pub challenges_assumption: bool,
}

/// A reasoning branch: an exploration path owning its thoughts, insights and
/// outgoing cross-references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Unique branch identifier. Assigned by the store when empty.
    pub id: String,
    /// Parent branch ID for nested branches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_branch_id: Option<String>,
    /// Current state of the branch.
    pub state: BranchState,
    /// Priority score for branch selection.
    pub priority: f64,
    /// Confidence score for this branch.
    pub confidence: f64,
    /// Thoughts appended to this branch, in order.
    #[serde(default)]
    pub thoughts: Vec<Thought>,
    /// Insights attached to this branch, in order.
    #[serde(default)]
    pub insights: Vec<Insight>,
    /// Cross-references originating from this branch.
    #[serde(default)]
    pub cross_refs: Vec<CrossRef>,
    /// When the branch was created.
    pub created_at: DateTime<Utc>,
    /// When the branch was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the branch was last accessed. Initialised by the store when unset.
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
}

/// A derived insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    /// Unique insight identifier.
    pub id: String,
    /// Insight category.
    #[serde(rename = "type")]
    pub insight_type: InsightType,
    /// Insight text.
    pub content: String,
    /// Context the insight applies to.
    #[serde(default)]
    pub context: Vec<String>,
    /// IDs of insights this one was derived from.
    #[serde(default)]
    pub parent_insights: Vec<String>,
    /// How broadly the insight applies (0.0-1.0).
    pub applicability_score: f64,
    /// Evidence backing the insight.
    #[serde(default)]
    pub supporting_evidence: Metadata,
    /// When the insight was created.
    pub created_at: DateTime<Utc>,
}

/// A connection point between thoughts of two branches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchPoint {
    pub from_thought: String,
    pub to_thought: String,
    pub connection: String,
}

/// Directional link between two branches, owned by the source branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossRef {
    /// Unique cross-reference identifier.
    pub id: String,
    /// Source branch ID.
    pub from_branch: String,
    /// Target branch ID.
    pub to_branch: String,
    /// Kind of relationship.
    #[serde(rename = "type")]
    pub ref_type: CrossRefType,
    /// Why the branches are linked.
    pub reason: String,
    /// Strength of the relationship (0.0-1.0).
    pub strength: f64,
    /// Specific thought-level connections.
    #[serde(default)]
    pub touch_points: Vec<TouchPoint>,
    /// When the cross-reference was created.
    pub created_at: DateTime<Utc>,
}

/// Outcome of validating an insight or thought.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_id: Option<String>,
    pub is_valid: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub validation_data: Metadata,
    pub created_at: DateTime<Utc>,
}

/// Directional link between two opaque state IDs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub from_state_id: String,
    pub to_state_id: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// Usage snapshot, recomputed on every request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_thoughts: usize,
    pub total_branches: usize,
    pub total_insights: usize,
    pub total_validations: usize,
    pub total_relationships: usize,
    pub thoughts_by_mode: BTreeMap<String, usize>,
    pub average_confidence: f64,
}

impl Thought {
    /// Create a new thought; the ID is assigned when stored.
    pub fn new(content: impl Into<String>, mode: ThinkingMode) -> Self {
        Self {
            id: String::new(),
            content: content.into(),
            mode,
            branch_id: None,
            parent_id: None,
            thought_type: String::new(),
            confidence: 0.8,
            timestamp: Utc::now(),
            key_points: Vec::new(),
            metadata: Metadata::new(),
            is_rebellion: false,
            challenges_assumption: false,
        }
    }

    /// Set an explicit ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the confidence level
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Set the parent thought
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Set the owning branch
    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }

    /// Set the type tag
    pub fn with_type(mut self, thought_type: impl Into<String>) -> Self {
        self.thought_type = thought_type.into();
        self
    }

    /// Set the creation timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the key points
    pub fn with_key_points<I, S>(mut self, key_points: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_points = key_points.into_iter().map(Into::into).collect();
        self
    }

    /// Insert a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set both flags
    pub fn with_flags(mut self, is_rebellion: bool, challenges_assumption: bool) -> Self {
        self.is_rebellion = is_rebellion;
        self.challenges_assumption = challenges_assumption;
        self
    }
}

impl Branch {
    /// Create a new, empty branch
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            parent_branch_id: None,
            state: BranchState::Active,
            priority: 1.0,
            confidence: 0.8,
            thoughts: Vec::new(),
            insights: Vec::new(),
            cross_refs: Vec::new(),
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
        }
    }

    /// Set an explicit ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the parent branch
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_branch_id = Some(parent_id.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the confidence
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Set the state
    pub fn with_state(mut self, state: BranchState) -> Self {
        self.state = state;
        self
    }

    /// Set the creation timestamp (also used as the update timestamp)
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }
}

impl Default for Branch {
    fn default() -> Self {
        Self::new()
    }
}

impl Insight {
    /// Create a new insight
    pub fn new(insight_type: InsightType, content: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            insight_type,
            content: content.into(),
            context: Vec::new(),
            parent_insights: Vec::new(),
            applicability_score: 0.5,
            supporting_evidence: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Set an explicit ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the context entries
    pub fn with_context<I, S>(mut self, context: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context = context.into_iter().map(Into::into).collect();
        self
    }

    /// Set the parent insight IDs
    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parent_insights = parents.into_iter().map(Into::into).collect();
        self
    }

    /// Set the applicability score
    pub fn with_applicability(mut self, score: f64) -> Self {
        self.applicability_score = score.clamp(0.0, 1.0);
        self
    }

    /// Insert a supporting evidence entry
    pub fn with_evidence(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.supporting_evidence.insert(key.into(), value);
        self
    }
}

impl CrossRef {
    /// Create a new cross-reference
    pub fn new(
        from_branch: impl Into<String>,
        to_branch: impl Into<String>,
        ref_type: CrossRefType,
    ) -> Self {
        Self {
            id: String::new(),
            from_branch: from_branch.into(),
            to_branch: to_branch.into(),
            ref_type,
            reason: String::new(),
            strength: 0.5,
            touch_points: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Set an explicit ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Set the strength
    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength.clamp(0.0, 1.0);
        self
    }

    /// Add a touch point
    pub fn with_touch_point(
        mut self,
        from_thought: impl Into<String>,
        to_thought: impl Into<String>,
        connection: impl Into<String>,
    ) -> Self {
        self.touch_points.push(TouchPoint {
            from_thought: from_thought.into(),
            to_thought: to_thought.into(),
            connection: connection.into(),
        });
        self
    }
}

impl Validation {
    /// Create a new validation result
    pub fn new(is_valid: bool, reason: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            insight_id: None,
            thought_id: None,
            is_valid,
            reason: reason.into(),
            validation_data: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Set an explicit ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach to a thought
    pub fn for_thought(mut self, thought_id: impl Into<String>) -> Self {
        self.thought_id = Some(thought_id.into());
        self
    }

    /// Attach to an insight
    pub fn for_insight(mut self, insight_id: impl Into<String>) -> Self {
        self.insight_id = Some(insight_id.into());
        self
    }

    /// Insert a validation data entry
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.validation_data.insert(key.into(), value);
        self
    }
}

impl Relationship {
    /// Create a new relationship
    pub fn new(
        from_state_id: impl Into<String>,
        to_state_id: impl Into<String>,
        rel_type: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            from_state_id: from_state_id.into(),
            to_state_id: to_state_id.into(),
            rel_type: rel_type.into(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Set an explicit ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Insert a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Repository contract shared by every backend.
///
/// Reads return owned copies. `store_*` operations assign an ID when the
/// entity carries none and return the ID used; re-storing an existing ID
/// replaces the stored entity.
#[async_trait]
pub trait Storage: Send + Sync {
    // Thought operations

    /// Store (or replace) a thought and index it for search.
    async fn store_thought(&self, thought: Thought) -> StorageResult<String>;
    /// Get a thought by ID.
    async fn get_thought(&self, id: &str) -> StorageResult<Thought>;
    /// Search thoughts, newest first.
    ///
    /// Query words are OR-ed; `mode` filters when set. A `limit` of zero or
    /// above [`MAX_SEARCH_RESULTS`] is clamped to the cap.
    async fn search_thoughts(
        &self,
        query: &str,
        mode: Option<ThinkingMode>,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<Thought>>;

    // Branch operations

    /// Store (or replace) a branch. The first branch stored becomes active.
    async fn store_branch(&self, branch: Branch) -> StorageResult<String>;
    /// Get a branch by ID, including its thoughts, insights and cross-refs.
    async fn get_branch(&self, id: &str) -> StorageResult<Branch>;
    /// List all branches, newest created first.
    async fn list_branches(&self) -> StorageResult<Vec<Branch>>;
    /// Get the active branch.
    async fn get_active_branch(&self) -> StorageResult<Branch>;
    /// Make an existing branch active.
    async fn set_active_branch(&self, branch_id: &str) -> StorageResult<()>;
    /// Record an access to a branch.
    async fn update_branch_access(&self, branch_id: &str) -> StorageResult<()>;
    /// Append a copy of `thought` to a branch.
    async fn append_thought_to_branch(&self, branch_id: &str, thought: &Thought)
        -> StorageResult<()>;
    /// Append a copy of `insight` to a branch.
    async fn append_insight_to_branch(&self, branch_id: &str, insight: &Insight)
        -> StorageResult<()>;
    /// Append a copy of `cross_ref` to a branch.
    async fn append_cross_ref_to_branch(
        &self,
        branch_id: &str,
        cross_ref: &CrossRef,
    ) -> StorageResult<()>;
    /// Set a branch's priority.
    async fn update_branch_priority(&self, branch_id: &str, priority: f64) -> StorageResult<()>;
    /// Set a branch's confidence.
    async fn update_branch_confidence(&self, branch_id: &str, confidence: f64)
        -> StorageResult<()>;
    /// Most recently accessed branches, most recent first (at most
    /// [`MAX_RECENT_BRANCHES`]).
    async fn get_recent_branches(&self) -> StorageResult<Vec<Branch>>;

    // Insight, validation and relationship operations

    /// Store (or replace) an insight.
    async fn store_insight(&self, insight: Insight) -> StorageResult<String>;
    /// Get an insight by ID.
    async fn get_insight(&self, id: &str) -> StorageResult<Insight>;
    /// Store (or replace) a validation result.
    async fn store_validation(&self, validation: Validation) -> StorageResult<String>;
    /// Get a validation by ID.
    async fn get_validation(&self, id: &str) -> StorageResult<Validation>;
    /// Store (or replace) a relationship.
    async fn store_relationship(&self, relationship: Relationship) -> StorageResult<String>;
    /// Get a relationship by ID.
    async fn get_relationship(&self, id: &str) -> StorageResult<Relationship>;

    // Metrics

    /// Compute a metrics snapshot from current contents.
    async fn get_metrics(&self) -> StorageResult<Metrics>;

    /// Release backend resources. Later calls may fail with
    /// [`StorageError::Closed`](crate::error::StorageError::Closed).
    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
