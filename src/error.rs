//! Error types for saga-context

use thiserror::Error;

use crate::tier::TierName;

/// Result type for context operations
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors that can occur during compression and context assembly
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chapter not found: {0}")]
    ChapterNotFound(u32),

    #[error("Setting not found: {0}")]
    SettingNotFound(String),

    #[error("Compression of chapter {chapter} at {tier} tier produced {compressed} tokens, ceiling is {ceiling}")]
    CompressionBudgetExceeded {
        chapter: u32,
        tier: TierName,
        compressed: usize,
        ceiling: usize,
    },

    #[error("Corrupt artifact for chapter {chapter} ({tier}): {reason}")]
    CacheCorruption {
        chapter: u32,
        tier: TierName,
        reason: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ContextError {
    /// Whether the error means the chapter's source text does not exist
    pub fn is_missing_source(&self) -> bool {
        matches!(self, ContextError::ChapterNotFound(_))
    }
}
