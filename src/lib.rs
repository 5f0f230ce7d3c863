//! # saga-context
//!
//! Hierarchical chapter compression and token-bounded context assembly for
//! long-form fiction.
//!
//! This crate provides:
//! - Three compression tiers (recent, medium, long-term) chosen by chapter
//!   distance, with persisted artifacts and an operation log
//! - Importance scoring and a water-filling token budget allocator
//! - A three-level cache with explicit invalidation
//! - Continuity checks when the writer jumps between chapters
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use saga_context::{Config, ContextAssembler, ContextRequest, InMemoryProject, MemoryArtifactStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let project = Arc::new(
//!     InMemoryProject::new()
//!         .with_chapter(1, "Arrival", "Arden rode into Stonehold at dusk.")
//!         .with_chapter(2, "The Council", "The council met at dawn."),
//! );
//! let assembler = ContextAssembler::new(Config::default(), project, Arc::new(MemoryArtifactStore::new()))?;
//!
//! let context = assembler.build_context(&ContextRequest::new(2).with_budget(4000));
//! assert!(context.token_count <= 4000);
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod budget;
pub mod cache;
pub mod component;
pub mod compression;
pub mod config;
pub mod continuity;
pub mod error;
pub mod scoring;
pub mod source;
pub mod storage;
pub mod text;
pub mod tier;
pub mod tokens;

pub use assembler::{AssembledContext, ContextAssembler, ContextIssue, ContextRequest, GenerationMode};
pub use budget::{Allocation, TokenBudgetAllocator};
pub use cache::{CacheKey, CacheStats, ContextCache, InvalidationReason};
pub use component::{ComponentKind, ContextComponent, SettingCategory};
pub use compression::{BatchReport, CompressTarget, CompressionArtifact, CompressionEngine};
pub use config::Config;
pub use continuity::{ConsistencyValidator, ContinuityReport};
pub use error::{ContextError, Result};
pub use scoring::ContentScorer;
pub use source::{ChapterSource, FileProject, InMemoryProject, MemorySource, SettingsSource};
pub use storage::{ArtifactStore, FileArtifactStore, MemoryArtifactStore};
pub use tier::{TierName, TierSet};
pub use tokens::estimate_tokens;
