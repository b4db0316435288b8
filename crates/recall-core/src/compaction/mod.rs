//! # Compaction
//!
//! Keeps a conversation's active context under a token budget by replacing old
//! raw messages with progressively shorter summaries. Nothing is deleted: every
//! summary records the raw-sequence span it covers, so it can always be expanded
//! back to the original messages.
//!
//! ## Levels
//!
//! - **L1**: chunks of raw messages outside the recent window → one summary each
//! - **L2**: chunks of active L1 summaries → one summary each, children superseded
//! - **L3**: all active summaries → one bounded digest, built without a model call
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use recall_core::compaction::{CompactionConfig, CompactionEngine};
//! use recall_core::storage::{SqliteBackend, StorageBackend};
//! use recall_core::tokenizer::WordEstimateTokenizer;
//!
//! let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::open_in_memory()?);
//! backend.register_agent("planner", "Planner", "llm")?;
//!
//! let engine = CompactionEngine::new(
//!     backend,
//!     Arc::new(WordEstimateTokenizer::default()),
//!     CompactionConfig::default(),
//! );
//! let report = engine.compact("planner", "session-1")?;
//! assert!(!report.did_work());
//! # Ok::<(), recall_core::MemoryError>(())
//! ```

pub mod engine;
pub mod policy;
pub mod summarizer;

pub use engine::{CompactionEngine, CompactionReport};
pub use policy::{CompactionConfig, CompactionLevel};
pub use summarizer::{ExtractiveSummarizer, Summarizer};
