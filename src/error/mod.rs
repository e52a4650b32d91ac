use thiserror::Error;

use crate::config::BackendKind;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Kind of entity addressed by a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Thought,
    Branch,
    Insight,
    Validation,
    Relationship,
    Embedding,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Thought => write!(f, "thought"),
            EntityKind::Branch => write!(f, "branch"),
            EntityKind::Insight => write!(f, "insight"),
            EntityKind::Validation => write!(f, "validation"),
            EntityKind::Relationship => write!(f, "relationship"),
            EntityKind::Embedding => write!(f, "embedding"),
        }
    }
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("no active branch")]
    NoActiveBranch,

    #[error("branch not found: {branch_id} ({})", describe_available(.available))]
    BranchUnavailable {
        branch_id: String,
        available: Vec<String>,
    },

    #[error("Data inconsistency: {message}")]
    DataInconsistency { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },

    #[error("Invalid embedding blob: {len} bytes is not a multiple of 4")]
    InvalidEmbedding { len: usize },

    #[error("{backend} initialization failed: {source}")]
    BackendInit {
        backend: BackendKind,
        #[source]
        source: Box<StorageError>,
    },

    #[error("Storage is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl StorageError {
    /// Build a not-found error for the given entity.
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether this error reports a missing entity rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::NotFound { .. }
                | StorageError::NoActiveBranch
                | StorageError::BranchUnavailable { .. }
        )
    }
}

fn describe_available(available: &[String]) -> String {
    if available.is_empty() {
        "no branches exist yet".to_string()
    } else {
        format!("available branches: {}", available.join(", "))
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
