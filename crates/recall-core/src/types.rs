//! Entity model shared by the storage backends, the compaction engine and the adapter.
//!
//! Rows read back from storage are plain owned structs (`Message`, `Summary`, ...).
//! Inserts go through the borrowed `New*` payloads so callers never have to invent
//! ids or timestamps.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{MemoryError, Result};

/// Free-form metadata attached to messages and shared memories
pub type Metadata = BTreeMap<String, MetaValue>;

/// A single metadata value
///
/// Closed set of JSON-compatible variants, stored as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    /// JSON null
    Null,
    /// Boolean flag
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    Text(String),
    /// Ordered list
    List(Vec<MetaValue>),
    /// Nested map
    Map(BTreeMap<String, MetaValue>),
}

impl MetaValue {
    /// Borrow the string payload, if this is a `Text` value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Serialize metadata to the JSON text stored in the database
pub fn metadata_to_json(metadata: &Metadata) -> Result<String> {
    Ok(serde_json::to_string(metadata)?)
}

/// Parse stored metadata JSON; NULL and empty columns map to an empty map
pub fn metadata_from_json(raw: Option<&str>) -> Result<Metadata> {
    match raw {
        None => Ok(Metadata::new()),
        Some(s) if s.trim().is_empty() => Ok(Metadata::new()),
        Some(s) => Ok(serde_json::from_str(s)?),
    }
}

/// Format a timestamp the way both backends store it
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| MemoryError::Storage(format!("invalid timestamp '{raw}': {e}")))
}

/// A registered agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Owning agent
    pub agent_id: String,
    /// Display name
    pub name: String,
    /// Free-form agent kind
    pub agent_type: String,
    /// Creation time (UTC)
    pub created_at: DateTime<Utc>,
    /// Last registration time (UTC)
    pub last_seen_at: DateTime<Utc>,
}

/// An immutable raw message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Row id
    pub message_id: i64,
    /// Owning agent
    pub agent_id: String,
    /// Conversation the row belongs to
    pub conversation_id: String,
    /// Speaker role (`user`, `assistant`, ...)
    pub role: String,
    /// Text
    pub content: String,
    /// Tokens in `content`
    pub token_count: i64,
    /// Caller-supplied metadata
    pub metadata: Metadata,
    /// Creation time (UTC)
    pub created_at: DateTime<Utc>,
    /// Position in the conversation, starting at 1
    pub sequence: i64,
}

/// Insert payload for a message
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    /// Owning agent
    pub agent_id: &'a str,
    /// Conversation the row belongs to
    pub conversation_id: &'a str,
    /// Speaker role (`user`, `assistant`, ...)
    pub role: &'a str,
    /// Text
    pub content: &'a str,
    /// Tokens in `content`
    pub token_count: i64,
    /// Caller-supplied metadata
    pub metadata: Option<&'a Metadata>,
    /// Explicit sequence; `None` assigns the next free one
    pub sequence: Option<i64>,
}

/// Lifecycle state of a summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryState {
    /// Counts toward the active context
    Active,
    /// Replaced by a higher-level summary, kept for audit and expansion
    Superseded,
}

impl SummaryState {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
        }
    }
}

impl fmt::Display for SummaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SummaryState {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "superseded" => Ok(Self::Superseded),
            other => Err(MemoryError::Storage(format!("unknown summary state '{other}'"))),
        }
    }
}

/// A summary node in the compaction DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Row id
    pub summary_id: i64,
    /// Owning agent
    pub agent_id: String,
    /// Conversation the row belongs to
    pub conversation_id: String,
    /// 1, 2 or 3
    pub level: u8,
    /// Text
    pub content: String,
    /// Tokens in `content`
    pub token_count: i64,
    /// First covered sequence
    pub span_start_seq: i64,
    /// Last covered sequence
    pub span_end_seq: i64,
    /// Summaries this one replaced; `None` for level 1
    pub child_ids: Option<Vec<i64>>,
    /// Active or superseded
    pub state: SummaryState,
    /// Creation time (UTC)
    pub created_at: DateTime<Utc>,
}

impl Summary {
    /// Whether `sequence` falls inside this summary's span
    pub fn covers(&self, sequence: i64) -> bool {
        self.span_start_seq <= sequence && sequence <= self.span_end_seq
    }

    /// Whether two spans share at least one sequence number
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.span_start_seq <= end && start <= self.span_end_seq
    }
}

/// Insert payload for a summary
#[derive(Debug, Clone, PartialEq)]
pub struct NewSummary {
    /// Owning agent
    pub agent_id: String,
    /// Conversation the row belongs to
    pub conversation_id: String,
    /// Compaction level, 1 to 3
    pub level: u8,
    /// Text
    pub content: String,
    /// Tokens in `content`
    pub token_count: i64,
    /// First covered sequence
    pub span_start_seq: i64,
    /// Last covered sequence
    pub span_end_seq: i64,
    /// Summaries replaced by this one
    pub child_ids: Option<Vec<i64>>,
}

/// Serialize a child id list for storage
pub fn child_ids_to_json(child_ids: Option<&[i64]>) -> Result<Option<String>> {
    child_ids
        .map(|ids| serde_json::to_string(ids).map_err(MemoryError::from))
        .transpose()
}

/// Parse a stored child id list
pub fn child_ids_from_json(raw: Option<&str>) -> Result<Option<Vec<i64>>> {
    raw.map(|s| serde_json::from_str(s).map_err(MemoryError::from))
        .transpose()
}

/// A shared-memory item published by one agent for others
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedMemory {
    /// Row id
    pub share_id: i64,
    /// Publishing agent
    pub source_agent_id: String,
    /// `None` means broadcast to the whole namespace
    pub target_agent_id: Option<String>,
    /// Namespace readers subscribe to
    pub namespace: String,
    /// Text
    pub content: String,
    /// Tokens in `content`
    pub token_count: i64,
    /// Caller-supplied metadata
    pub metadata: Metadata,
    /// Creation time (UTC)
    pub created_at: DateTime<Utc>,
    /// Hidden from readers after this instant
    pub expires_at: Option<DateTime<Utc>>,
}

/// Insert payload for a shared-memory item
#[derive(Debug, Clone)]
pub struct NewSharedMemory<'a> {
    /// Publishing agent
    pub source_agent_id: &'a str,
    /// `None` broadcasts to the whole namespace
    pub target_agent_id: Option<&'a str>,
    /// Namespace readers subscribe to
    pub namespace: &'a str,
    /// Text
    pub content: &'a str,
    /// Tokens in `content`
    pub token_count: i64,
    /// Caller-supplied metadata
    pub metadata: Option<&'a Metadata>,
    /// Hidden from readers after this instant
    pub expires_at: Option<DateTime<Utc>>,
}

/// One row of the compaction audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionLogEntry {
    /// Row id
    pub log_id: i64,
    /// Owning agent
    pub agent_id: String,
    /// Conversation the row belongs to
    pub conversation_id: String,
    /// Compaction level, 1 to 3
    pub level: u8,
    /// Messages in the conversation when compaction started
    pub messages_before: i64,
    /// Active tokens before compaction
    pub tokens_before: i64,
    /// Active tokens after compaction
    pub tokens_after: i64,
    /// Summaries written
    pub summaries_created: i64,
    /// Strategy label of the highest level reached
    pub strategy: String,
    /// Wall time of the run
    pub duration_ms: i64,
    /// Creation time (UTC)
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a compaction log row
#[derive(Debug, Clone, PartialEq)]
pub struct NewCompactionLog {
    /// Owning agent
    pub agent_id: String,
    /// Conversation the row belongs to
    pub conversation_id: String,
    /// Compaction level, 1 to 3
    pub level: u8,
    /// Messages in the conversation when compaction started
    pub messages_before: i64,
    /// Active tokens before compaction
    pub tokens_before: i64,
    /// Active tokens after compaction
    pub tokens_after: i64,
    /// Summaries written
    pub summaries_created: i64,
    /// Strategy label of the highest level reached
    pub strategy: String,
    /// Wall time of the run
    pub duration_ms: i64,
}

/// Per-conversation storage diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Raw messages
    pub message_count: i64,
    /// Tokens over all raw messages
    pub raw_token_count: i64,
    /// Summaries counted in the active context
    pub active_summaries: i64,
    /// Summaries kept only for expansion
    pub superseded_summaries: i64,
    /// Compaction log rows
    pub compaction_runs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_json_keeps_variants() {
        let mut meta = Metadata::new();
        meta.insert("role".into(), "assistant".into());
        meta.insert("turn".into(), MetaValue::Int(3));
        meta.insert("score".into(), MetaValue::Float(0.5));
        meta.insert("ok".into(), MetaValue::Bool(true));
        meta.insert("none".into(), MetaValue::Null);
        meta.insert(
            "tags".into(),
            MetaValue::List(vec!["a".into(), MetaValue::Int(1)]),
        );

        let raw = metadata_to_json(&meta).unwrap();
        let parsed = metadata_from_json(Some(&raw)).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed["turn"], MetaValue::Int(3));
    }

    #[test]
    fn test_metadata_from_empty_column() {
        assert!(metadata_from_json(None).unwrap().is_empty());
        assert!(metadata_from_json(Some("")).unwrap().is_empty());
    }

    #[test]
    fn test_summary_span_helpers() {
        let summary = Summary {
            summary_id: 1,
            agent_id: "a".into(),
            conversation_id: "c".into(),
            level: 1,
            content: String::new(),
            token_count: 0,
            span_start_seq: 5,
            span_end_seq: 10,
            child_ids: None,
            state: SummaryState::Active,
            created_at: Utc::now(),
        };
        assert!(summary.covers(5) && summary.covers(10));
        assert!(!summary.covers(11));
        assert!(summary.overlaps(10, 12));
        assert!(!summary.overlaps(11, 12));
    }

    #[test]
    fn test_timestamp_format_is_sortable() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(3);
        assert!(format_timestamp(&early) < format_timestamp(&late));
        let parsed = parse_timestamp(&format_timestamp(&early)).unwrap();
        assert_eq!(parsed.timestamp_micros(), early.timestamp_micros());
    }
}
