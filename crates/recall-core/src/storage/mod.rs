//! Persistent Storage Layer
//!
//! [`StorageBackend`] is the persistence contract used by the compaction engine and
//! the adapter. Two implementations share the schema in [`schema`]:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       StorageBackend                         │
//! ├───────────────────────────────┬──────────────────────────────┤
//! │ SqliteBackend                 │ PooledBackend                │
//! │ single file, WAL,             │ r2d2 pool, dialect-aware     │
//! │ one writer mutex              │ (postgres:// | sqlite://)    │
//! └───────────────────────────────┴──────────────────────────────┘
//!   agents │ messages │ summaries │ shared_memories │ compaction_log │ memory_config
//! ```
//!
//! # Example
//!
//! ```no_run
//! use recall_core::storage::{SqliteBackend, StorageBackend};
//!
//! # fn example() -> recall_core::Result<()> {
//! let backend = SqliteBackend::open(".recall/memory.db")?;
//! backend.register_agent("planner", "Planner", "llm")?;
//! # Ok(())
//! # }
//! ```

pub mod pooled;
pub mod schema;
pub mod sqlite;
pub(crate) mod sql;

pub use pooled::PooledBackend;
pub use schema::Dialect;
pub use sqlite::SqliteBackend;

use std::collections::HashMap;
use std::fmt;

use crate::error::Result;
use crate::types::{
    Agent, CompactionLogEntry, Message, NewCompactionLog, NewMessage, NewSharedMemory, NewSummary,
    SharedMemory, StorageStats, Summary, SummaryState,
};

/// Default namespace for shared memory
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default page size for shared-memory reads
pub const DEFAULT_SHARED_LIMIT: usize = 50;

/// Persistence contract
///
/// Every method is synchronous and safe to call from concurrent callers sharing
/// one instance.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs (`sqlite`, `pooled:postgres`, ...)
    fn name(&self) -> &str;

    /// Idempotent DDL, safe on every start
    fn initialize_schema(&self) -> Result<()>;

    /// Upsert an agent and refresh `last_seen_at`
    fn register_agent(&self, agent_id: &str, name: &str, agent_type: &str) -> Result<()>;

    /// `None` for an unregistered agent
    fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>>;

    /// Append a message; a duplicate sequence is an `IntegrityViolation`
    fn insert_message(&self, message: &NewMessage<'_>) -> Result<i64>;

    /// Messages in ascending sequence order; `since_sequence` is exclusive
    fn get_messages(
        &self,
        agent_id: &str,
        conversation_id: Option<&str>,
        since_sequence: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>>;

    /// Messages whose sequence lies in `[start, end]`
    fn get_messages_in_span(
        &self,
        agent_id: &str,
        conversation_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Message>>;

    /// Single message lookup
    fn get_message_by_id(&self, message_id: i64) -> Result<Option<Message>>;

    /// Raw token total over every message of the conversation
    fn get_token_count(&self, agent_id: &str, conversation_id: &str) -> Result<i64>;

    /// `max(sequence) + 1`, or 1 for an empty conversation
    fn get_next_sequence(&self, agent_id: &str, conversation_id: &str) -> Result<i64>;

    /// Insert one active summary
    fn insert_summary(&self, summary: &NewSummary) -> Result<i64>;

    /// Summaries in span order; `state = None` returns every state
    fn get_summaries(
        &self,
        agent_id: &str,
        conversation_id: &str,
        level: Option<u8>,
        state: Option<SummaryState>,
    ) -> Result<Vec<Summary>>;

    /// Single summary lookup, any state
    fn get_summary_by_id(&self, summary_id: i64) -> Result<Option<Summary>>;

    /// Fails with `NotFound` for an unknown id
    fn update_summary_state(&self, summary_id: i64, state: SummaryState) -> Result<()>;

    /// Insert `new_summaries` and supersede `supersede` in one transaction.
    ///
    /// Writes nothing and returns `IntegrityViolation` if a listed id is no longer
    /// active or a new summary overlaps an active one at the same level.
    fn apply_compaction(&self, new_summaries: &[NewSummary], supersede: &[i64])
        -> Result<Vec<i64>>;

    /// Publish to a namespace; `expires_at` is optional
    fn insert_shared_memory(&self, share: &NewSharedMemory<'_>) -> Result<i64>;

    /// Visible, unexpired shared memories, newest first
    fn get_shared_memories(
        &self,
        agent_id: &str,
        namespace: &str,
        include_broadcasts: bool,
        limit: usize,
    ) -> Result<Vec<SharedMemory>>;

    /// Record one compaction run
    fn insert_compaction_log(&self, entry: &NewCompactionLog) -> Result<i64>;

    /// Newest first
    fn get_compaction_log(
        &self,
        agent_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<CompactionLogEntry>>;

    /// Global rows overridden by the agent's rows
    fn get_config(&self, agent_id: Option<&str>) -> Result<HashMap<String, String>>;

    /// Upsert one key; `agent_id = None` writes the global default
    fn set_config(&self, key: &str, value: &str, agent_id: Option<&str>) -> Result<()>;

    /// Counts for one agent and conversation
    fn stats(&self, agent_id: &str, conversation_id: &str) -> Result<StorageStats>;

    /// Release connections; later calls fail with `BackendUnavailable`
    fn close(&self) -> Result<()>;

    /// Active summaries of one conversation, all levels
    fn get_active_summaries(&self, agent_id: &str, conversation_id: &str) -> Result<Vec<Summary>> {
        self.get_summaries(agent_id, conversation_id, None, Some(SummaryState::Active))
    }
}

/// Merge `(scope, key, value)` rows: global first, agent-specific rows win
pub(crate) fn merge_config_rows(rows: Vec<(String, String, String)>) -> HashMap<String, String> {
    let (global, scoped): (Vec<_>, Vec<_>) = rows
        .into_iter()
        .partition(|(scope, _, _)| scope == schema::GLOBAL_CONFIG_SCOPE);

    let mut merged = HashMap::new();
    for (_, key, value) in global.into_iter().chain(scoped) {
        merged.insert(key, value);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_rows_override_global() {
        let rows = vec![
            ("agent-a".to_string(), "k".to_string(), "agent".to_string()),
            (String::new(), "k".to_string(), "global".to_string()),
            (String::new(), "only_global".to_string(), "g".to_string()),
        ];
        let merged = merge_config_rows(rows);
        assert_eq!(merged["k"], "agent");
        assert_eq!(merged["only_global"], "g");
    }
}
