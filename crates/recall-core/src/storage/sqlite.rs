//! SqliteBackend - embedded single-file storage (SQLite WAL)
//!
//! - WAL mode: readers do not block on the writer
//! - `synchronous = NORMAL`, `foreign_keys = ON`, `busy_timeout = 5000`
//! - Every write goes through one writer connection behind a mutex, so sequence
//!   assignment (`MAX(sequence) + 1` then `INSERT`) is race-free
//! - File databases also open a `query_only` reader connection

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

use super::schema::{self, Dialect, GLOBAL_CONFIG_SCOPE};
use super::sql::{
    decode_agent, decode_log, decode_message, decode_shared, decode_summary, SqlRow, SqlValue,
};
use super::{merge_config_rows, StorageBackend};
use crate::error::{MemoryError, Result};
use crate::types::{
    child_ids_to_json, format_timestamp, metadata_to_json, Agent, CompactionLogEntry, Message,
    NewCompactionLog, NewMessage, NewSharedMemory, NewSummary, SharedMemory, StorageStats,
    Summary, SummaryState,
};

const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Embedded SQLite store
pub struct SqliteBackend {
    location: String,
    writer: Mutex<Option<Connection>>,
    reader: Option<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("location", &self.location)
            .field("split_reader", &self.reader.is_some())
            .finish()
    }
}

impl SqliteBackend {
    /// Open (or create) a database file and apply the schema.
    ///
    /// `":memory:"` opens a private in-memory database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path == Path::new(":memory:") {
            return Self::open_in_memory();
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(path).map_err(|e| {
            MemoryError::BackendUnavailable(format!("opening '{}': {e}", path.display()))
        })?;
        writer.execute_batch(PRAGMAS)?;

        let backend = Self {
            location: path.display().to_string(),
            writer: Mutex::new(Some(writer)),
            reader: None,
        };
        backend.initialize_schema()?;

        let reader = Connection::open(path).map_err(|e| {
            MemoryError::BackendUnavailable(format!("opening '{}': {e}", path.display()))
        })?;
        reader.execute_batch("PRAGMA busy_timeout = 5000; PRAGMA query_only = ON;")?;

        tracing::info!(path = %path.display(), "Opened SQLite memory store (WAL)");
        Ok(Self {
            reader: Some(Mutex::new(Some(reader))),
            ..backend
        })
    }

    /// Private in-memory database (tests, ephemeral agents)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let backend = Self {
            location: ":memory:".to_string(),
            writer: Mutex::new(Some(conn)),
            reader: None,
        };
        backend.initialize_schema()?;
        Ok(backend)
    }

    fn with_writer<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.writer.lock();
        let conn = guard.as_mut().ok_or_else(closed)?;
        f(conn)
    }

    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        match &self.reader {
            Some(reader) => {
                let guard = reader.lock();
                let conn = guard.as_ref().ok_or_else(closed)?;
                f(conn)
            }
            None => self.with_writer(|conn| f(conn)),
        }
    }
}

fn closed() -> MemoryError {
    MemoryError::BackendUnavailable("sqlite backend is closed".to_string())
}

fn query_rows<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    decode: fn(&SqlRow) -> Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params, SqlRow::from_sqlite)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.iter().map(decode).collect()
}

fn query_one<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    decode: fn(&SqlRow) -> Result<T>,
) -> Result<Option<T>> {
    let row = conn
        .query_row(sql, params, SqlRow::from_sqlite)
        .optional()?;
    row.as_ref().map(decode).transpose()
}

fn next_sequence(conn: &Connection, agent_id: &str, conversation_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        schema::NEXT_SEQUENCE,
        params![agent_id, conversation_id],
        |row| row.get(0),
    )?)
}

fn insert_summary_row(conn: &Connection, summary: &NewSummary, now: &str) -> Result<i64> {
    let child_ids = child_ids_to_json(summary.child_ids.as_deref())?;
    conn.execute(
        schema::INSERT_SUMMARY,
        params![
            summary.agent_id,
            summary.conversation_id,
            summary.level,
            summary.content,
            summary.token_count,
            summary.span_start_seq,
            summary.span_end_seq,
            child_ids,
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl StorageBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute_batch(&Dialect::Sqlite.ddl())?;
            Ok(())
        })
    }

    fn register_agent(&self, agent_id: &str, name: &str, agent_type: &str) -> Result<()> {
        let now = format_timestamp(&chrono::Utc::now());
        self.with_writer(|conn| {
            conn.execute(
                schema::UPSERT_AGENT,
                params![agent_id, name, agent_type, now, now],
            )?;
            Ok(())
        })
    }

    fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        self.with_reader(|conn| query_one(conn, schema::SELECT_AGENT, params![agent_id], decode_agent))
    }

    fn insert_message(&self, message: &NewMessage<'_>) -> Result<i64> {
        let metadata = message.metadata.map(metadata_to_json).transpose()?;
        let now = format_timestamp(&chrono::Utc::now());

        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            let sequence = match message.sequence {
                Some(sequence) => sequence,
                None => next_sequence(&tx, message.agent_id, message.conversation_id)?,
            };
            tx.execute(
                schema::INSERT_MESSAGE,
                params![
                    message.agent_id,
                    message.conversation_id,
                    message.role,
                    message.content,
                    message.token_count,
                    metadata,
                    now,
                    sequence
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(id)
        })
    }

    fn get_messages(
        &self,
        agent_id: &str,
        conversation_id: Option<&str>,
        since_sequence: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let sql = schema::select_messages(
            conversation_id.is_some(),
            since_sequence.is_some(),
            limit.is_some(),
        );
        let mut binds = vec![SqlValue::from(agent_id)];
        binds.extend(conversation_id.map(SqlValue::from));
        binds.extend(since_sequence.map(SqlValue::from));
        binds.extend(limit.map(|l| SqlValue::Int(l as i64)));

        self.with_reader(|conn| query_rows(conn, &sql, params_from_iter(binds), decode_message))
    }

    fn get_messages_in_span(
        &self,
        agent_id: &str,
        conversation_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Message>> {
        self.with_reader(|conn| {
            query_rows(
                conn,
                &schema::select_messages_in_span(),
                params![agent_id, conversation_id, start, end],
                decode_message,
            )
        })
    }

    fn get_message_by_id(&self, message_id: i64) -> Result<Option<Message>> {
        self.with_reader(|conn| {
            query_one(
                conn,
                &schema::select_message_by_id(),
                params![message_id],
                decode_message,
            )
        })
    }

    fn get_token_count(&self, agent_id: &str, conversation_id: &str) -> Result<i64> {
        self.with_reader(|conn| {
            Ok(conn.query_row(
                schema::RAW_TOKEN_COUNT,
                params![agent_id, conversation_id],
                |row| row.get(0),
            )?)
        })
    }

    fn get_next_sequence(&self, agent_id: &str, conversation_id: &str) -> Result<i64> {
        self.with_reader(|conn| next_sequence(conn, agent_id, conversation_id))
    }

    fn insert_summary(&self, summary: &NewSummary) -> Result<i64> {
        let now = format_timestamp(&chrono::Utc::now());
        self.with_writer(|conn| insert_summary_row(conn, summary, &now))
    }

    fn get_summaries(
        &self,
        agent_id: &str,
        conversation_id: &str,
        level: Option<u8>,
        state: Option<SummaryState>,
    ) -> Result<Vec<Summary>> {
        let sql = schema::select_summaries(level.is_some(), state.is_some());
        let mut binds = vec![SqlValue::from(agent_id), SqlValue::from(conversation_id)];
        binds.extend(level.map(SqlValue::from));
        binds.extend(state.map(|s| SqlValue::from(s.as_str())));

        self.with_reader(|conn| query_rows(conn, &sql, params_from_iter(binds), decode_summary))
    }

    fn get_summary_by_id(&self, summary_id: i64) -> Result<Option<Summary>> {
        self.with_reader(|conn| {
            query_one(
                conn,
                &schema::select_summary_by_id(),
                params![summary_id],
                decode_summary,
            )
        })
    }

    fn update_summary_state(&self, summary_id: i64, state: SummaryState) -> Result<()> {
        self.with_writer(|conn| {
            let updated = conn.execute(
                schema::UPDATE_SUMMARY_STATE,
                params![state.as_str(), summary_id],
            )?;
            if updated == 0 {
                return Err(MemoryError::NotFound {
                    kind: "summary",
                    id: summary_id,
                });
            }
            Ok(())
        })
    }

    fn apply_compaction(
        &self,
        new_summaries: &[NewSummary],
        supersede: &[i64],
    ) -> Result<Vec<i64>> {
        let now = format_timestamp(&chrono::Utc::now());

        self.with_writer(|conn| {
            // Dropping `tx` on any early return rolls the whole level back
            let tx = conn.transaction()?;

            for id in supersede {
                let updated = tx.execute(schema::SUPERSEDE_ACTIVE, params![id])?;
                if updated != 1 {
                    return Err(MemoryError::IntegrityViolation(format!(
                        "summary {id} is no longer active"
                    )));
                }
            }

            let mut ids = Vec::with_capacity(new_summaries.len());
            for summary in new_summaries {
                let overlaps: i64 = tx.query_row(
                    schema::COUNT_ACTIVE_OVERLAPS,
                    params![
                        summary.agent_id,
                        summary.conversation_id,
                        summary.level,
                        summary.span_end_seq,
                        summary.span_start_seq
                    ],
                    |row| row.get(0),
                )?;
                if overlaps > 0 {
                    return Err(MemoryError::IntegrityViolation(format!(
                        "level-{} span [{}, {}] overlaps an active summary",
                        summary.level, summary.span_start_seq, summary.span_end_seq
                    )));
                }
                ids.push(insert_summary_row(&tx, summary, &now)?);
            }

            tx.commit()?;
            tracing::debug!(
                created = ids.len(),
                superseded = supersede.len(),
                "Applied compaction"
            );
            Ok(ids)
        })
    }

    fn insert_shared_memory(&self, share: &NewSharedMemory<'_>) -> Result<i64> {
        let metadata = share.metadata.map(metadata_to_json).transpose()?;
        let now = format_timestamp(&chrono::Utc::now());
        let expires_at = share.expires_at.as_ref().map(format_timestamp);

        self.with_writer(|conn| {
            conn.execute(
                schema::INSERT_SHARED,
                params![
                    share.source_agent_id,
                    share.target_agent_id,
                    share.namespace,
                    share.content,
                    share.token_count,
                    metadata,
                    now,
                    expires_at
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn get_shared_memories(
        &self,
        agent_id: &str,
        namespace: &str,
        include_broadcasts: bool,
        limit: usize,
    ) -> Result<Vec<SharedMemory>> {
        let now = format_timestamp(&chrono::Utc::now());
        self.with_reader(|conn| {
            query_rows(
                conn,
                &schema::select_shared(include_broadcasts),
                params![namespace, agent_id, now, limit as i64],
                decode_shared,
            )
        })
    }

    fn insert_compaction_log(&self, entry: &NewCompactionLog) -> Result<i64> {
        let now = format_timestamp(&chrono::Utc::now());
        self.with_writer(|conn| {
            conn.execute(
                schema::INSERT_LOG,
                params![
                    entry.agent_id,
                    entry.conversation_id,
                    entry.level,
                    entry.messages_before,
                    entry.tokens_before,
                    entry.tokens_after,
                    entry.summaries_created,
                    entry.strategy,
                    entry.duration_ms,
                    now
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn get_compaction_log(
        &self,
        agent_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<CompactionLogEntry>> {
        self.with_reader(|conn| {
            query_rows(
                conn,
                &schema::select_compaction_log(),
                params![agent_id, conversation_id, limit as i64],
                decode_log,
            )
        })
    }

    fn get_config(&self, agent_id: Option<&str>) -> Result<HashMap<String, String>> {
        let scope = agent_id.unwrap_or(GLOBAL_CONFIG_SCOPE);
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(schema::SELECT_CONFIG)?;
            let rows = stmt
                .query_map(params![GLOBAL_CONFIG_SCOPE, scope], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(merge_config_rows(rows))
        })
    }

    fn set_config(&self, key: &str, value: &str, agent_id: Option<&str>) -> Result<()> {
        let now = format_timestamp(&chrono::Utc::now());
        let scope = agent_id.unwrap_or(GLOBAL_CONFIG_SCOPE);
        self.with_writer(|conn| {
            conn.execute(schema::UPSERT_CONFIG, params![scope, key, value, now])?;
            Ok(())
        })
    }

    fn stats(&self, agent_id: &str, conversation_id: &str) -> Result<StorageStats> {
        self.with_reader(|conn| {
            let (message_count, raw_token_count) = conn.query_row(
                schema::MESSAGE_STATS,
                params![agent_id, conversation_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )?;

            let mut stats = StorageStats {
                message_count,
                raw_token_count,
                ..Default::default()
            };

            let mut stmt = conn.prepare_cached(schema::SUMMARY_STATE_COUNTS)?;
            let states = stmt
                .query_map(params![agent_id, conversation_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (state, count) in states {
                match state.parse::<SummaryState>()? {
                    SummaryState::Active => stats.active_summaries = count,
                    SummaryState::Superseded => stats.superseded_summaries = count,
                }
            }

            stats.compaction_runs = conn.query_row(
                schema::COMPACTION_RUNS,
                params![agent_id, conversation_id],
                |row| row.get(0),
            )?;
            Ok(stats)
        })
    }

    fn close(&self) -> Result<()> {
        if let Some(reader) = &self.reader {
            if let Some(conn) = reader.lock().take() {
                conn.close().map_err(|(_, e)| e)?;
            }
        }
        if let Some(conn) = self.writer.lock().take() {
            conn.close().map_err(|(_, e)| e)?;
            tracing::info!(location = %self.location, "Closed SQLite memory store");
        }
        Ok(())
    }
}
