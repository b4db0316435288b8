//! Relational schema and SQL text shared by both backends.
//!
//! Statements are written once with `?` placeholders; [`Dialect::prepare`]
//! rewrites them to `$n` for PostgreSQL. Integer columns are `BIGINT` on
//! PostgreSQL so every bound integer is an `i64`.

use std::borrow::Cow;

/// SQL dialect spoken by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// SQLite (embedded file or pooled)
    Sqlite,
    /// PostgreSQL (client/server)
    Postgres,
}

impl Dialect {
    /// Idempotent DDL for all tables and indexes
    pub fn ddl(&self) -> String {
        let (id, int) = match self {
            Self::Sqlite => ("INTEGER PRIMARY KEY AUTOINCREMENT", "INTEGER"),
            Self::Postgres => ("BIGSERIAL PRIMARY KEY", "BIGINT"),
        };

        format!(
            "
            CREATE TABLE IF NOT EXISTS agents (
                agent_id      TEXT PRIMARY KEY,
                name          TEXT NOT NULL,
                agent_type    TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                last_seen_at  TEXT NOT NULL
            );

            -- Immutable message ledger, one sequence space per conversation
            CREATE TABLE IF NOT EXISTS messages (
                message_id      {id},
                agent_id        TEXT NOT NULL REFERENCES agents(agent_id),
                conversation_id TEXT NOT NULL,
                role            TEXT NOT NULL,
                content         TEXT NOT NULL,
                token_count     {int} NOT NULL DEFAULT 0,
                metadata        TEXT,
                created_at      TEXT NOT NULL,
                sequence        {int} NOT NULL,
                UNIQUE (agent_id, conversation_id, sequence)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conv_seq
                ON messages(agent_id, conversation_id, sequence);

            -- Summary DAG, never deleted
            CREATE TABLE IF NOT EXISTS summaries (
                summary_id      {id},
                agent_id        TEXT NOT NULL REFERENCES agents(agent_id),
                conversation_id TEXT NOT NULL,
                level           {int} NOT NULL CHECK (level BETWEEN 1 AND 3),
                content         TEXT NOT NULL,
                token_count     {int} NOT NULL DEFAULT 0,
                span_start_seq  {int} NOT NULL,
                span_end_seq    {int} NOT NULL,
                child_ids       TEXT,
                state           TEXT NOT NULL DEFAULT 'active'
                                CHECK (state IN ('active', 'superseded')),
                created_at      TEXT NOT NULL,
                CHECK (span_start_seq <= span_end_seq)
            );

            CREATE INDEX IF NOT EXISTS idx_summaries_conv_level
                ON summaries(agent_id, conversation_id, level, state);

            CREATE TABLE IF NOT EXISTS shared_memories (
                share_id        {id},
                source_agent_id TEXT NOT NULL REFERENCES agents(agent_id),
                target_agent_id TEXT,
                namespace       TEXT NOT NULL DEFAULT 'default',
                content         TEXT NOT NULL,
                token_count     {int} NOT NULL DEFAULT 0,
                metadata        TEXT,
                created_at      TEXT NOT NULL,
                expires_at      TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_shared_ns_target
                ON shared_memories(namespace, target_agent_id, created_at);

            -- Append-only compaction audit trail
            CREATE TABLE IF NOT EXISTS compaction_log (
                log_id            {id},
                agent_id          TEXT NOT NULL REFERENCES agents(agent_id),
                conversation_id   TEXT NOT NULL,
                level             {int} NOT NULL,
                messages_before   {int} NOT NULL,
                tokens_before     {int} NOT NULL,
                tokens_after      {int} NOT NULL,
                summaries_created {int} NOT NULL,
                strategy          TEXT NOT NULL,
                duration_ms       {int} NOT NULL,
                created_at        TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_compaction_log_conv
                ON compaction_log(agent_id, conversation_id, log_id);

            -- Global rows use agent_id = '' so the unique constraint applies to them
            CREATE TABLE IF NOT EXISTS memory_config (
                config_id   {id},
                agent_id    TEXT NOT NULL DEFAULT '',
                key         TEXT NOT NULL,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                UNIQUE (agent_id, key)
            );
            "
        )
    }

    /// Rewrite `?` placeholders into the dialect's style
    pub fn prepare<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        match self {
            Self::Sqlite => Cow::Borrowed(sql),
            Self::Postgres => {
                let mut out = String::with_capacity(sql.len() + 16);
                let mut n = 0;
                let mut in_literal = false;
                for ch in sql.chars() {
                    match ch {
                        '\'' => {
                            in_literal = !in_literal;
                            out.push(ch);
                        }
                        '?' if !in_literal => {
                            n += 1;
                            out.push('$');
                            out.push_str(&n.to_string());
                        }
                        _ => out.push(ch),
                    }
                }
                Cow::Owned(out)
            }
        }
    }
}

/// Marker stored in `memory_config.agent_id` for global rows
pub const GLOBAL_CONFIG_SCOPE: &str = "";

pub(crate) const MESSAGE_COLUMNS: &str = "message_id, agent_id, conversation_id, role, content, \
     token_count, metadata, created_at, sequence";

pub(crate) const SUMMARY_COLUMNS: &str = "summary_id, agent_id, conversation_id, level, content, \
     token_count, span_start_seq, span_end_seq, child_ids, state, created_at";

pub(crate) const SHARED_COLUMNS: &str = "share_id, source_agent_id, target_agent_id, namespace, \
     content, token_count, metadata, created_at, expires_at";

pub(crate) const LOG_COLUMNS: &str = "log_id, agent_id, conversation_id, level, messages_before, \
     tokens_before, tokens_after, summaries_created, strategy, duration_ms, created_at";

pub(crate) const UPSERT_AGENT: &str = "INSERT INTO agents (agent_id, name, agent_type, created_at, last_seen_at)
     VALUES (?, ?, ?, ?, ?)
     ON CONFLICT (agent_id) DO UPDATE SET
         name = excluded.name,
         agent_type = excluded.agent_type,
         last_seen_at = excluded.last_seen_at";

pub(crate) const SELECT_AGENT: &str =
    "SELECT agent_id, name, agent_type, created_at, last_seen_at FROM agents WHERE agent_id = ?";

pub(crate) const NEXT_SEQUENCE: &str = "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages
     WHERE agent_id = ? AND conversation_id = ?";

pub(crate) const INSERT_MESSAGE: &str = "INSERT INTO messages
     (agent_id, conversation_id, role, content, token_count, metadata, created_at, sequence)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

pub(crate) const RAW_TOKEN_COUNT: &str =
    "SELECT CAST(COALESCE(SUM(token_count), 0) AS BIGINT) FROM messages
     WHERE agent_id = ? AND conversation_id = ?";

pub(crate) const MESSAGE_STATS: &str =
    "SELECT COUNT(*), CAST(COALESCE(SUM(token_count), 0) AS BIGINT) FROM messages
     WHERE agent_id = ? AND conversation_id = ?";

pub(crate) const SUMMARY_STATE_COUNTS: &str = "SELECT state, COUNT(*) FROM summaries
     WHERE agent_id = ? AND conversation_id = ? GROUP BY state";

pub(crate) const COMPACTION_RUNS: &str =
    "SELECT COUNT(*) FROM compaction_log WHERE agent_id = ? AND conversation_id = ?";

pub(crate) const INSERT_SUMMARY: &str = "INSERT INTO summaries
     (agent_id, conversation_id, level, content, token_count, span_start_seq, span_end_seq,
      child_ids, state, created_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)";

pub(crate) const UPDATE_SUMMARY_STATE: &str = "UPDATE summaries SET state = ? WHERE summary_id = ?";

pub(crate) const SUPERSEDE_ACTIVE: &str =
    "UPDATE summaries SET state = 'superseded' WHERE summary_id = ? AND state = 'active'";

/// Params: agent, conversation, level, span end, span start
pub(crate) const COUNT_ACTIVE_OVERLAPS: &str = "SELECT COUNT(*) FROM summaries
     WHERE agent_id = ? AND conversation_id = ? AND level = ? AND state = 'active'
       AND span_start_seq <= ? AND span_end_seq >= ?";

pub(crate) const INSERT_SHARED: &str = "INSERT INTO shared_memories
     (source_agent_id, target_agent_id, namespace, content, token_count, metadata,
      created_at, expires_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

pub(crate) const INSERT_LOG: &str = "INSERT INTO compaction_log
     (agent_id, conversation_id, level, messages_before, tokens_before, tokens_after,
      summaries_created, strategy, duration_ms, created_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

pub(crate) const SELECT_CONFIG: &str =
    "SELECT agent_id, key, value FROM memory_config WHERE agent_id = ? OR agent_id = ?";

pub(crate) const UPSERT_CONFIG: &str = "INSERT INTO memory_config (agent_id, key, value, updated_at)
     VALUES (?, ?, ?, ?)
     ON CONFLICT (agent_id, key) DO UPDATE SET
         value = excluded.value,
         updated_at = excluded.updated_at";

/// Message listing; bind order: agent, [conversation], [since], [limit]
pub(crate) fn select_messages(conversation: bool, since: bool, limit: bool) -> String {
    let mut sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE agent_id = ?");
    if conversation {
        sql.push_str(" AND conversation_id = ?");
    }
    if since {
        sql.push_str(" AND sequence > ?");
    }
    sql.push_str(" ORDER BY sequence ASC, message_id ASC");
    if limit {
        sql.push_str(" LIMIT ?");
    }
    sql
}

pub(crate) fn select_message_by_id() -> String {
    format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?")
}

/// Bind order: agent, conversation, start, end
pub(crate) fn select_messages_in_span() -> String {
    format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE agent_id = ? AND conversation_id = ? AND sequence BETWEEN ? AND ?
         ORDER BY sequence ASC"
    )
}

/// Summary listing; bind order: agent, conversation, [level], [state]
pub(crate) fn select_summaries(level: bool, state: bool) -> String {
    let mut sql =
        format!("SELECT {SUMMARY_COLUMNS} FROM summaries WHERE agent_id = ? AND conversation_id = ?");
    if level {
        sql.push_str(" AND level = ?");
    }
    if state {
        sql.push_str(" AND state = ?");
    }
    sql.push_str(" ORDER BY span_start_seq ASC, level ASC, summary_id ASC");
    sql
}

pub(crate) fn select_summary_by_id() -> String {
    format!("SELECT {SUMMARY_COLUMNS} FROM summaries WHERE summary_id = ?")
}

/// Bind order: namespace, agent, now, limit
pub(crate) fn select_shared(include_broadcasts: bool) -> String {
    let target = if include_broadcasts {
        "(target_agent_id = ? OR target_agent_id IS NULL)"
    } else {
        "target_agent_id = ?"
    };
    format!(
        "SELECT {SHARED_COLUMNS} FROM shared_memories
         WHERE namespace = ? AND {target} AND (expires_at IS NULL OR expires_at > ?)
         ORDER BY created_at DESC, share_id DESC
         LIMIT ?"
    )
}

/// Bind order: agent, conversation, limit
pub(crate) fn select_compaction_log() -> String {
    format!(
        "SELECT {LOG_COLUMNS} FROM compaction_log
         WHERE agent_id = ? AND conversation_id = ?
         ORDER BY log_id DESC
         LIMIT ?"
    )
}
