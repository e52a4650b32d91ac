//! Fixed-width vector embedding codec.
//!
//! Vectors are stored as consecutive little-endian IEEE-754 `f32`s, four
//! bytes per element, with no header.

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// A stored embedding and its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub problem_id: String,
    pub vector: Vec<f32>,
    pub model: String,
    pub provider: String,
    pub dimension: usize,
    #[serde(default)]
    pub source: String,
}

impl EmbeddingRecord {
    /// Create a record whose dimension is the vector length.
    pub fn new(
        problem_id: impl Into<String>,
        vector: Vec<f32>,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            problem_id: problem_id.into(),
            dimension: vector.len(),
            vector,
            model: model.into(),
            provider: provider.into(),
            source: String::new(),
        }
    }

    /// Set the source tag
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// Encode a vector as little-endian bytes.
pub fn encode(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode little-endian bytes into a vector.
pub fn decode(bytes: &[u8]) -> StorageResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(StorageError::InvalidEmbedding { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
