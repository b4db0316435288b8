//! PersistentMemoryAdapter - the façade agents talk to
//!
//! One adapter is bound to one `(agent_id, conversation_id)`. It stores messages,
//! triggers compaction when the active context crosses the hard threshold, serves
//! the retrieval policies and publishes shared memory to other agents.
//!
//! ```text
//! store() ──► Tokenizer ──► StorageBackend::insert_message
//!                 │
//!                 └──► active > hard? ──► CompactionEngine::compact ──► on_event("memory_compact")
//!
//! retrieve(policy) ──► last_k | windowed | full_expand | cross_agent ──► Vec<ContextItem>
//! share()          ──► shared_memories ──► on_event("memory_share")
//! ```

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::compaction::{CompactionConfig, CompactionEngine, CompactionReport, Summarizer};
use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::storage::{StorageBackend, DEFAULT_NAMESPACE, DEFAULT_SHARED_LIMIT};
use crate::tokenizer::{Tokenizer, WordEstimateTokenizer};
use crate::types::{
    CompactionLogEntry, Message, MetaValue, Metadata, NewMessage, NewSharedMemory, SharedMemory,
    StorageStats, Summary,
};

/// Conversation used when none is given
pub const DEFAULT_CONVERSATION: &str = "default";

/// Role assigned to stored items without a `role` metadata key
pub const DEFAULT_ROLE: &str = "user";

/// Role reported for shared-memory items in `cross_agent` retrieval
pub const SHARED_ROLE: &str = "shared";

/// Monitoring callback: `(event_type, payload)`
pub type EventHook = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

/// How `retrieve` assembles context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalPolicy {
    /// Last `k` raw messages
    LastK,
    /// Active summaries and uncovered messages before the recent window, in
    /// sequence order, then the window
    Windowed,
    /// Every raw message
    FullExpand,
    /// Shared memory from configured namespaces, then the last `k` own messages
    CrossAgent,
}

impl RetrievalPolicy {
    /// Configuration spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastK => "last_k",
            Self::Windowed => "windowed",
            Self::FullExpand => "full_expand",
            Self::CrossAgent => "cross_agent",
        }
    }
}

impl fmt::Display for RetrievalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalPolicy {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "last_k" => Ok(Self::LastK),
            "windowed" => Ok(Self::Windowed),
            "full_expand" => Ok(Self::FullExpand),
            "cross_agent" => Ok(Self::CrossAgent),
            other => Err(MemoryError::config(format!("unknown retrieval policy '{other}'"))),
        }
    }
}

/// Retrieval defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Policy used when `retrieve` gets none
    pub default_policy: RetrievalPolicy,
    /// `k` used when `retrieve` gets none
    pub default_k: usize,
    /// Namespaces read by the `cross_agent` policy
    pub namespaces: Vec<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_policy: RetrievalPolicy::LastK,
            default_k: 50,
            namespaces: vec![DEFAULT_NAMESPACE.to_string()],
        }
    }
}

/// Where a context item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// Raw message
    Message,
    /// Active summary
    Summary,
    /// Shared-memory item from another agent
    Shared,
}

/// One entry of retrieved context, in the order it should be fed to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    /// Where the item came from
    pub kind: ContextKind,
    /// `message_id`, `summary_id` or `share_id`
    pub id: i64,
    /// Speaker role (`user`, `assistant`, ...)
    pub role: String,
    /// Text
    pub content: String,
    /// Tokens in `content`
    pub token_count: i64,
    /// Raw sequence for messages
    pub sequence: Option<i64>,
    /// Covered span for summaries
    pub span: Option<(i64, i64)>,
    /// Summary level
    pub level: Option<u8>,
    /// Publishing agent for shared items
    pub source_agent_id: Option<String>,
    /// Caller-supplied metadata
    pub metadata: Metadata,
}

impl From<Message> for ContextItem {
    fn from(m: Message) -> Self {
        Self {
            kind: ContextKind::Message,
            id: m.message_id,
            role: m.role,
            content: m.content,
            token_count: m.token_count,
            sequence: Some(m.sequence),
            span: None,
            level: None,
            source_agent_id: None,
            metadata: m.metadata,
        }
    }
}

impl From<Summary> for ContextItem {
    fn from(s: Summary) -> Self {
        Self {
            kind: ContextKind::Summary,
            id: s.summary_id,
            role: "summary".to_string(),
            content: s.content,
            token_count: s.token_count,
            sequence: None,
            span: Some((s.span_start_seq, s.span_end_seq)),
            level: Some(s.level),
            source_agent_id: None,
            metadata: Metadata::new(),
        }
    }
}

impl From<SharedMemory> for ContextItem {
    fn from(s: SharedMemory) -> Self {
        Self {
            kind: ContextKind::Shared,
            id: s.share_id,
            role: SHARED_ROLE.to_string(),
            content: s.content,
            token_count: s.token_count,
            sequence: None,
            span: None,
            level: None,
            source_agent_id: Some(s.source_agent_id),
            metadata: s.metadata,
        }
    }
}

/// Options for [`PersistentMemoryAdapter::share_with`]
#[derive(Debug, Clone, Default)]
pub struct ShareOptions {
    /// `None` means the default namespace
    pub namespace: Option<String>,
    /// `None` broadcasts to every agent reading the namespace
    pub target_agent_id: Option<String>,
    /// Caller-supplied metadata
    pub metadata: Option<Metadata>,
    /// Hidden from readers once elapsed
    pub ttl: Option<Duration>,
}

impl ShareOptions {
    /// Publish into `namespace`
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Make the item visible to `agent_id` only
    pub fn target(mut self, agent_id: impl Into<String>) -> Self {
        self.target_agent_id = Some(agent_id.into());
        self
    }

    /// Attach metadata
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Expire the item after `ttl`
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Builder for [`PersistentMemoryAdapter`]
pub struct AdapterBuilder {
    backend: Arc<dyn StorageBackend>,
    agent_id: String,
    conversation_id: Option<String>,
    agent_name: Option<String>,
    agent_type: Option<String>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    compaction: CompactionConfig,
    retrieval: RetrievalConfig,
    on_event: Option<EventHook>,
}

impl fmt::Debug for AdapterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterBuilder")
            .field("backend", &self.backend.name())
            .field("agent_id", &self.agent_id)
            .field("conversation_id", &self.conversation_id)
            .finish_non_exhaustive()
    }
}

impl AdapterBuilder {
    /// Set the conversation; defaults to [`DEFAULT_CONVERSATION`]
    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Display name recorded on the agent row; defaults to the agent id
    pub fn agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    /// Agent type recorded on the agent row
    pub fn agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    /// Token counter; defaults to the word estimate
    pub fn tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Summarizer for levels 1 and 2; defaults to [`crate::ExtractiveSummarizer`]
    pub fn summarizer(mut self, summarizer: impl Summarizer + 'static) -> Self {
        self.summarizer = Some(Arc::new(summarizer));
        self
    }

    /// Summarizer shared with other adapters
    pub fn shared_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Compaction thresholds and windows
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    /// Retrieval defaults
    pub fn retrieval(mut self, config: RetrievalConfig) -> Self {
        self.retrieval = config;
        self
    }

    /// Monitoring hook fired on `memory_compact` and `memory_share`
    pub fn on_event(mut self, hook: impl Fn(&str, &serde_json::Value) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(hook));
        self
    }

    /// Validate the configuration and register the agent
    pub fn build(self) -> Result<PersistentMemoryAdapter> {
        if self.agent_id.is_empty() {
            return Err(MemoryError::config("agent_id must not be empty"));
        }
        self.compaction.validate()?;

        let conversation_id = self
            .conversation_id
            .unwrap_or_else(|| DEFAULT_CONVERSATION.to_string());
        let tokenizer = self
            .tokenizer
            .unwrap_or_else(|| Arc::new(WordEstimateTokenizer::default()));

        let mut engine =
            CompactionEngine::new(self.backend.clone(), tokenizer.clone(), self.compaction);
        if let Some(summarizer) = self.summarizer {
            engine = engine.with_shared_summarizer(summarizer);
        }

        self.backend.register_agent(
            &self.agent_id,
            self.agent_name.as_deref().unwrap_or(&self.agent_id),
            self.agent_type.as_deref().unwrap_or("agent"),
        )?;
        tracing::info!(
            agent_id = %self.agent_id,
            conversation_id = %conversation_id,
            backend = self.backend.name(),
            tokenizer = tokenizer.name(),
            "Memory adapter ready"
        );

        Ok(PersistentMemoryAdapter {
            backend: self.backend,
            agent_id: self.agent_id,
            conversation_id,
            tokenizer,
            engine,
            retrieval: self.retrieval,
            on_event: self.on_event,
        })
    }
}

/// Persistent, token-budget-aware memory for one agent conversation
pub struct PersistentMemoryAdapter {
    backend: Arc<dyn StorageBackend>,
    agent_id: String,
    conversation_id: String,
    tokenizer: Arc<dyn Tokenizer>,
    engine: CompactionEngine,
    retrieval: RetrievalConfig,
    on_event: Option<EventHook>,
}

impl fmt::Debug for PersistentMemoryAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentMemoryAdapter")
            .field("agent_id", &self.agent_id)
            .field("conversation_id", &self.conversation_id)
            .field("engine", &self.engine)
            .field("retrieval", &self.retrieval)
            .finish_non_exhaustive()
    }
}

impl PersistentMemoryAdapter {
    /// Start building an adapter for `agent_id` over `backend`
    pub fn builder(backend: Arc<dyn StorageBackend>, agent_id: impl Into<String>) -> AdapterBuilder {
        AdapterBuilder {
            backend,
            agent_id: agent_id.into(),
            conversation_id: None,
            agent_name: None,
            agent_type: None,
            tokenizer: None,
            summarizer: None,
            compaction: CompactionConfig::default(),
            retrieval: RetrievalConfig::default(),
            on_event: None,
        }
    }

    /// Build from a JSON configuration file
    pub fn from_config(
        path: impl AsRef<Path>,
        agent_id: &str,
        conversation_id: &str,
    ) -> Result<Self> {
        MemoryConfig::from_file(path)?.build_adapter(agent_id, conversation_id)
    }

    /// Build from the file named by `RECALL_MEMORY_CONFIG`
    pub fn from_env(agent_id: &str, conversation_id: &str) -> Result<Self> {
        MemoryConfig::from_env()?.build_adapter(agent_id, conversation_id)
    }

    /// Agent this adapter writes for
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Conversation this adapter is bound to
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Shared storage backend
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Retrieval defaults in use
    pub fn retrieval_config(&self) -> &RetrievalConfig {
        &self.retrieval
    }

    /// Compaction configuration in use
    pub fn compaction_config(&self) -> &CompactionConfig {
        self.engine.config()
    }

    fn emit(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(hook) = &self.on_event {
            hook(event_type, &payload);
        }
    }

    /// Store an item; the role comes from the `role` metadata key
    ///
    /// Compaction triggered by this call is best effort: a failure is logged and
    /// retried on the next store, the message stays durable either way.
    pub fn store(&self, item: &str, metadata: Option<&Metadata>) -> Result<i64> {
        let role = metadata
            .and_then(|m| m.get("role"))
            .and_then(MetaValue::as_str)
            .unwrap_or(DEFAULT_ROLE);
        self.store_with_role(role, item, metadata)
    }

    /// Store an item with an explicit role
    pub fn store_with_role(&self, role: &str, item: &str, metadata: Option<&Metadata>) -> Result<i64> {
        let token_count = self.tokenizer.count(item)? as i64;
        let message_id = self.backend.insert_message(&NewMessage {
            agent_id: &self.agent_id,
            conversation_id: &self.conversation_id,
            role,
            content: item,
            token_count,
            metadata,
            sequence: None,
        })?;

        match self.engine.needs_compaction(&self.agent_id, &self.conversation_id) {
            Ok(true) => {
                if let Err(e) = self.compact() {
                    tracing::warn!(
                        agent_id = %self.agent_id,
                        conversation_id = %self.conversation_id,
                        error = %e,
                        "Implicit compaction failed, will retry on next store"
                    );
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    agent_id = %self.agent_id,
                    error = %e,
                    "Could not measure active context after store"
                );
            }
        }
        Ok(message_id)
    }

    /// Retrieve context; `None` picks the configured defaults
    pub fn retrieve(
        &self,
        k: Option<usize>,
        policy: Option<RetrievalPolicy>,
    ) -> Result<Vec<ContextItem>> {
        let k = k.unwrap_or(self.retrieval.default_k);
        let policy = policy.unwrap_or(self.retrieval.default_policy);

        let items = match policy {
            RetrievalPolicy::LastK => self.last_k(k)?,
            RetrievalPolicy::FullExpand => self
                .all_messages()?
                .into_iter()
                .map(ContextItem::from)
                .collect(),
            RetrievalPolicy::Windowed => self.windowed(k)?,
            RetrievalPolicy::CrossAgent => {
                let mut items = Vec::new();
                for namespace in &self.retrieval.namespaces {
                    let mut shared =
                        self.backend
                            .get_shared_memories(&self.agent_id, namespace, true, k)?;
                    // Stored newest first; context reads oldest first
                    shared.reverse();
                    items.extend(shared.into_iter().map(ContextItem::from));
                }
                items.extend(self.last_k(k)?);
                items
            }
        };
        tracing::debug!(
            agent_id = %self.agent_id,
            policy = policy.as_str(),
            items = items.len(),
            "Retrieved context"
        );
        Ok(items)
    }

    fn all_messages(&self) -> Result<Vec<Message>> {
        self.backend
            .get_messages(&self.agent_id, Some(&self.conversation_id), None, None)
    }

    fn last_k(&self, k: usize) -> Result<Vec<ContextItem>> {
        let messages = self.all_messages()?;
        let skip = messages.len().saturating_sub(k);
        Ok(messages.into_iter().skip(skip).map(ContextItem::from).collect())
    }

    fn windowed(&self, k: usize) -> Result<Vec<ContextItem>> {
        let mut messages = self.all_messages()?;
        let window_start = messages
            .len()
            .saturating_sub(self.engine.config().recent_window_size);
        let window = messages.split_off(window_start);
        let before = messages;

        let summaries: Vec<Summary> = self
            .backend
            .get_active_summaries(&self.agent_id, &self.conversation_id)?
            .into_iter()
            .filter(|s| window.first().map_or(true, |w| s.span_end_seq < w.sequence))
            .collect();

        let mut items: Vec<ContextItem> = Vec::new();
        if summaries.is_empty() {
            let skip = before.len().saturating_sub(k);
            items.extend(before.into_iter().skip(skip).map(ContextItem::from));
        } else {
            // Messages no summary covers yet are part of the active context too
            let mut older: Vec<(i64, ContextItem)> = before
                .into_iter()
                .filter(|m| !summaries.iter().any(|s| s.covers(m.sequence)))
                .map(|m| (m.sequence, ContextItem::from(m)))
                .collect();
            older.extend(
                summaries
                    .into_iter()
                    .map(|s| (s.span_start_seq, ContextItem::from(s))),
            );
            older.sort_by_key(|(position, _)| *position);
            items.extend(older.into_iter().map(|(_, item)| item));
        }
        items.extend(window.into_iter().map(ContextItem::from));
        Ok(items)
    }

    /// Raw messages under a summary's span, at any level and in any state
    pub fn expand(&self, summary_id: i64) -> Result<Vec<Message>> {
        let summary = self
            .backend
            .get_summary_by_id(summary_id)?
            .ok_or(MemoryError::NotFound {
                kind: "summary",
                id: summary_id,
            })?;
        self.backend.get_messages_in_span(
            &summary.agent_id,
            &summary.conversation_id,
            summary.span_start_seq,
            summary.span_end_seq,
        )
    }

    /// Publish `content` to `namespace` (default namespace when `None`)
    pub fn share(
        &self,
        content: &str,
        namespace: Option<&str>,
        target_agent_id: Option<&str>,
    ) -> Result<i64> {
        self.share_with(
            content,
            ShareOptions {
                namespace: namespace.map(str::to_string),
                target_agent_id: target_agent_id.map(str::to_string),
                ..Default::default()
            },
        )
    }

    /// Publish with metadata and an optional time to live
    pub fn share_with(&self, content: &str, options: ShareOptions) -> Result<i64> {
        let namespace = options.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
        let token_count = self.tokenizer.count(content)? as i64;
        let share_id = self.backend.insert_shared_memory(&NewSharedMemory {
            source_agent_id: &self.agent_id,
            target_agent_id: options.target_agent_id.as_deref(),
            namespace,
            content,
            token_count,
            metadata: options.metadata.as_ref(),
            expires_at: options.ttl.map(|ttl| Utc::now() + ttl),
        })?;

        self.emit(
            "memory_share",
            json!({
                "agent_id": self.agent_id,
                "share_id": share_id,
                "namespace": namespace,
                "target_agent_id": options.target_agent_id,
                "token_count": token_count,
            }),
        );
        Ok(share_id)
    }

    /// Shared memories visible to this agent, newest first
    pub fn retrieve_shared(&self, namespace: &str, limit: Option<usize>) -> Result<Vec<SharedMemory>> {
        self.backend.get_shared_memories(
            &self.agent_id,
            namespace,
            true,
            limit.unwrap_or(DEFAULT_SHARED_LIMIT),
        )
    }

    /// Run compaction now; errors surface to the caller
    pub fn compact(&self) -> Result<CompactionReport> {
        let report = self.engine.compact(&self.agent_id, &self.conversation_id)?;
        if report.did_work() {
            self.emit(
                "memory_compact",
                json!({
                    "agent_id": self.agent_id,
                    "conversation_id": self.conversation_id,
                    "level": report.level_reached.map(|l| l.as_u8()),
                    "strategy": report.strategy,
                    "tokens_before": report.tokens_before,
                    "tokens_after": report.tokens_after,
                    "summaries_created": report.summaries_created,
                    "duration_ms": report.duration_ms,
                }),
            );
        }
        Ok(report)
    }

    /// Tokens in the active context of this conversation
    pub fn active_token_count(&self) -> Result<i64> {
        self.engine
            .active_token_count(&self.agent_id, &self.conversation_id)
    }

    /// Whether the active context exceeds the hard threshold
    pub fn needs_compaction(&self) -> Result<bool> {
        self.engine
            .needs_compaction(&self.agent_id, &self.conversation_id)
    }

    /// Storage counts for this conversation
    pub fn stats(&self) -> Result<StorageStats> {
        self.backend.stats(&self.agent_id, &self.conversation_id)
    }

    /// Most recent compaction runs, newest first
    pub fn compaction_history(&self, limit: usize) -> Result<Vec<CompactionLogEntry>> {
        self.backend
            .get_compaction_log(&self.agent_id, &self.conversation_id, limit)
    }

    /// Global config merged with this agent's overrides
    pub fn get_config(&self) -> Result<HashMap<String, String>> {
        self.backend.get_config(Some(&self.agent_id))
    }

    /// Set an agent-scoped config value
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.backend.set_config(key, value, Some(&self.agent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteBackend;
    use parking_lot::Mutex;

    fn backend() -> Arc<dyn StorageBackend> {
        Arc::new(SqliteBackend::open_in_memory().unwrap())
    }

    fn adapter(backend: Arc<dyn StorageBackend>, agent: &str) -> PersistentMemoryAdapter {
        PersistentMemoryAdapter::builder(backend, agent)
            .conversation("conv")
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_registers_agent() {
        let backend = backend();
        let _adapter = PersistentMemoryAdapter::builder(backend.clone(), "planner")
            .agent_name("Planner")
            .agent_type("llm")
            .build()
            .unwrap();
        let agent = backend.get_agent("planner").unwrap().unwrap();
        assert_eq!(agent.name, "Planner");
        assert_eq!(agent.agent_type, "llm");
    }

    #[test]
    fn test_empty_agent_id_rejected() {
        let err = PersistentMemoryAdapter::builder(backend(), "").build().unwrap_err();
        assert!(matches!(err, MemoryError::Configuration(_)));
    }

    #[test]
    fn test_store_role_from_metadata() {
        let adapter = adapter(backend(), "a");
        let mut meta = Metadata::new();
        meta.insert("role".into(), MetaValue::from("assistant"));
        adapter.store("hello there", Some(&meta)).unwrap();
        adapter.store("plain", None).unwrap();

        let items = adapter.retrieve(None, Some(RetrievalPolicy::FullExpand)).unwrap();
        assert_eq!(items[0].role, "assistant");
        assert_eq!(items[0].metadata.get("role"), Some(&MetaValue::from("assistant")));
        assert_eq!(items[1].role, DEFAULT_ROLE);
        assert_eq!(items[1].sequence, Some(2));
    }

    #[test]
    fn test_last_k_is_chronological_tail() {
        let adapter = adapter(backend(), "a");
        for i in 1..=5 {
            adapter.store(&format!("m{i}"), None).unwrap();
        }
        let items = adapter.retrieve(Some(2), Some(RetrievalPolicy::LastK)).unwrap();
        let contents: Vec<_> = items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m5"]);
    }

    #[test]
    fn test_windowed_without_summaries_falls_back_to_raw() {
        let backend = backend();
        let adapter = PersistentMemoryAdapter::builder(backend, "a")
            .compaction(CompactionConfig::default().with_recent_window(2))
            .build()
            .unwrap();
        for i in 1..=6 {
            adapter.store(&format!("m{i}"), None).unwrap();
        }
        let items = adapter.retrieve(Some(3), Some(RetrievalPolicy::Windowed)).unwrap();
        let contents: Vec<_> = items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4", "m5", "m6"]);
    }

    #[test]
    fn test_windowed_puts_summaries_before_window() {
        let backend = backend();
        let adapter = PersistentMemoryAdapter::builder(backend.clone(), "a")
            .conversation("conv")
            .compaction(CompactionConfig::default().with_recent_window(2))
            .build()
            .unwrap();
        for i in 1..=6 {
            adapter.store(&format!("m{i}."), None).unwrap();
        }
        backend
            .insert_summary(&crate::types::NewSummary {
                agent_id: "a".into(),
                conversation_id: "conv".into(),
                level: 1,
                content: "first four".into(),
                token_count: 3,
                span_start_seq: 1,
                span_end_seq: 4,
                child_ids: None,
            })
            .unwrap();

        let items = adapter.retrieve(None, Some(RetrievalPolicy::Windowed)).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].kind, ContextKind::Summary);
        assert_eq!(items[0].span, Some((1, 4)));
        assert_eq!(items[1].content, "m5.");
        assert_eq!(items[2].content, "m6.");
    }

    #[test]
    fn test_windowed_keeps_uncovered_messages_between_summaries_and_window() {
        let backend = backend();
        let adapter = PersistentMemoryAdapter::builder(backend.clone(), "a")
            .conversation("conv")
            .compaction(CompactionConfig::default().with_recent_window(2))
            .build()
            .unwrap();
        for i in 1..=8 {
            adapter.store(&format!("m{i}."), None).unwrap();
        }
        backend
            .insert_summary(&crate::types::NewSummary {
                agent_id: "a".into(),
                conversation_id: "conv".into(),
                level: 1,
                content: "m2 to m4".into(),
                token_count: 3,
                span_start_seq: 2,
                span_end_seq: 4,
                child_ids: None,
            })
            .unwrap();

        let items = adapter.retrieve(None, Some(RetrievalPolicy::Windowed)).unwrap();
        let contents: Vec<&str> = items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["m1.", "m2 to m4", "m5.", "m6.", "m7.", "m8."]);
        assert_eq!(items[1].kind, ContextKind::Summary);

        let listed: i64 = items.iter().map(|i| i.token_count).sum();
        assert_eq!(listed, adapter.active_token_count().unwrap());
    }

    #[test]
    fn test_cross_agent_puts_shared_first() {
        let backend = backend();
        let alice = adapter(backend.clone(), "alice");
        let bob = adapter(backend, "bob");

        alice.share("first finding", None, None).unwrap();
        alice.share("second finding", None, Some("bob")).unwrap();
        alice.share("for carol only", None, Some("carol")).unwrap();
        bob.store("bob's own note", None).unwrap();

        let items = bob.retrieve(Some(10), Some(RetrievalPolicy::CrossAgent)).unwrap();
        let view: Vec<_> = items.iter().map(|i| (i.role.as_str(), i.content.as_str())).collect();
        assert_eq!(
            view,
            vec![
                ("shared", "first finding"),
                ("shared", "second finding"),
                ("user", "bob's own note"),
            ]
        );
        assert_eq!(items[0].source_agent_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_expand_unknown_summary_is_not_found() {
        let adapter = adapter(backend(), "a");
        let err = adapter.expand(404).unwrap_err();
        assert!(matches!(err, MemoryError::NotFound { kind: "summary", id: 404 }));
    }

    #[test]
    fn test_share_emits_event_and_honours_ttl() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let backend = backend();
        let alice = PersistentMemoryAdapter::builder(backend.clone(), "alice")
            .on_event(move |kind, payload| sink.lock().push((kind.to_string(), payload.clone())))
            .build()
            .unwrap();
        let bob = adapter(backend, "bob");

        alice
            .share_with("stale", ShareOptions::default().namespace("ops").ttl(Duration::seconds(-5)))
            .unwrap();
        alice
            .share_with("fresh", ShareOptions::default().namespace("ops").ttl(Duration::hours(1)))
            .unwrap();

        let visible = bob.retrieve_shared("ops", None).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].content, "fresh");

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "memory_share");
        assert_eq!(events[0].1["namespace"], "ops");
    }

    #[test]
    fn test_store_triggers_compaction_and_event() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let adapter = PersistentMemoryAdapter::builder(backend(), "a")
            .compaction(
                CompactionConfig::default()
                    .with_context_window(100)
                    .with_thresholds(0.3, 0.5)
                    .with_recent_window(2)
                    .with_chunk_size(3),
            )
            .on_event(move |kind, payload| sink.lock().push((kind.to_string(), payload.clone())))
            .build()
            .unwrap();

        let filler = vec!["word"; 9].join(" ");
        for i in 0..6 {
            adapter.store(&format!("Item {i}. {filler}"), None).unwrap();
        }

        assert!(adapter.active_token_count().unwrap() <= 50);
        assert!(!adapter.compaction_history(10).unwrap().is_empty());
        let events = events.lock();
        assert!(events.iter().any(|(kind, payload)| kind == "memory_compact"
            && payload["summaries_created"].as_i64().unwrap_or(0) > 0));
        // Nothing lost
        assert_eq!(adapter.stats().unwrap().message_count, 6);
    }

    #[test]
    fn test_failed_implicit_compaction_keeps_message() {
        let adapter = PersistentMemoryAdapter::builder(backend(), "a")
            .compaction(
                CompactionConfig::default()
                    .with_context_window(20)
                    .with_thresholds(0.2, 0.5)
                    .with_recent_window(1)
                    .with_chunk_size(2),
            )
            .summarizer(|_: &[String]| -> anyhow::Result<String> { anyhow::bail!("offline") })
            .build()
            .unwrap();

        for i in 0..4 {
            adapter.store(&format!("message number {i} with words"), None).unwrap();
        }
        assert_eq!(adapter.stats().unwrap().message_count, 4);
        assert!(adapter.compaction_history(10).unwrap().is_empty());
        assert!(matches!(adapter.compact(), Err(MemoryError::Summarizer(_))));
    }

    #[test]
    fn test_agent_config_overrides_global() {
        let backend = backend();
        let adapter = adapter(backend.clone(), "a");
        backend.set_config("default_k", "50", None).unwrap();
        backend.set_config("theme", "dark", None).unwrap();
        adapter.set_config("default_k", "10").unwrap();

        let config = adapter.get_config().unwrap();
        assert_eq!(config["default_k"], "10");
        assert_eq!(config["theme"], "dark");
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("windowed".parse::<RetrievalPolicy>().unwrap(), RetrievalPolicy::Windowed);
        assert!("semantic".parse::<RetrievalPolicy>().is_err());
    }
}
