//! Recall Core - Persistent, token-budget-aware conversation memory for agents
//!
//! Recall durably records per-agent, per-conversation message history, lets agents
//! publish findings for each other through namespaced shared memory, and keeps the
//! active context fed to a language model under a token budget through three-level
//! escalating compaction.
//!
//! # Architecture
//!
//! 1. **Storage** (`storage`): the [`StorageBackend`] contract with an embedded
//!    SQLite backend and a pooled, dialect-aware backend (PostgreSQL or SQLite)
//! 2. **Tokenizer** (`tokenizer`): word-count estimate or exact subword counts
//! 3. **Compaction** (`compaction`): chunked summaries, summaries of summaries, and a
//!    bounded deterministic digest that guarantees convergence
//! 4. **Adapter** (`adapter`): the façade agents use to store, retrieve, share,
//!    expand and compact
//! 5. **Config** (`config`): JSON configuration merged onto documented defaults
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use recall_core::{PersistentMemoryAdapter, RetrievalPolicy, SqliteBackend, StorageBackend};
//!
//! let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::open_in_memory()?);
//!
//! let memory = PersistentMemoryAdapter::builder(backend, "researcher")
//!     .conversation("session-1")
//!     .build()?;
//!
//! memory.store("Found the failing test in tests/api.rs.", None)?;
//! memory.share("The API test fails on empty payloads.", None, None)?;
//!
//! let context = memory.retrieve(Some(10), Some(RetrievalPolicy::LastK))?;
//! assert_eq!(context.len(), 1);
//! # Ok::<(), recall_core::MemoryError>(())
//! ```
//!
//! # Guarantees
//!
//! - **Nothing is deleted**: summaries are superseded, never removed, and every
//!   summary expands back to the raw messages of its span
//! - **Bounded context**: repeated compaction always terminates
//! - **Atomic levels**: a failed compaction level writes nothing

#![deny(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod adapter;
pub mod compaction;
pub mod config;
pub mod error;
pub mod storage;
pub mod tokenizer;
pub mod types;

// Re-export commonly used types for convenience
pub use adapter::{
    ContextItem, ContextKind, PersistentMemoryAdapter, RetrievalConfig, RetrievalPolicy,
    ShareOptions,
};
pub use compaction::{
    CompactionConfig, CompactionEngine, CompactionLevel, CompactionReport, ExtractiveSummarizer,
    Summarizer,
};
pub use config::{MemoryConfig, StorageConfig};
pub use error::{MemoryError, Result};
pub use storage::{PooledBackend, SqliteBackend, StorageBackend};
pub use tokenizer::{Tokenizer, TokenizerConfig, WordEstimateTokenizer};
pub use types::{
    Agent, CompactionLogEntry, Message, MetaValue, Metadata, SharedMemory, StorageStats, Summary,
    SummaryState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
