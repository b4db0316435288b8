//! PooledBackend - client/server storage over an r2d2 connection pool
//!
//! Dialect-aware: `postgres://` / `postgresql://` URLs use PostgreSQL through
//! `r2d2_postgres`; `sqlite://` URLs use `r2d2_sqlite`, which is handy for running
//! the same code path without a database server. Every public call checks out one
//! connection and runs inside its own transaction. Concurrent sequence assignment
//! is settled by the `(agent_id, conversation_id, sequence)` unique constraint:
//! the losing writer gets an `IntegrityViolation`.
//!
//! SQLite URLs follow the SQLAlchemy convention: `sqlite:///relative.db`,
//! `sqlite:////absolute/path.db`, `sqlite::memory:` for a pool-shared in-memory
//! database.

use parking_lot::RwLock;
use postgres::types::ToSql as PgToSql;
use postgres::NoTls;
use r2d2_postgres::PostgresConnectionManager;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OpenFlags, TransactionBehavior};
use std::collections::HashMap;
use std::time::Duration;

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

/// Default number of pooled connections
pub const DEFAULT_POOL_SIZE: u32 = 5;

/// Default wait for a pooled connection before reporting a timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
enum Pool {
    Sqlite(r2d2::Pool<SqliteConnectionManager>),
    Postgres(r2d2::Pool<PostgresConnectionManager<NoTls>>),
}

/// One transaction on one pooled connection
trait Session {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>>;
    /// Run an `INSERT` and return the generated key
    fn insert_returning_id(&mut self, sql: &str, id_column: &str, params: &[SqlValue])
        -> Result<i64>;
    fn batch(&mut self, sql: &str) -> Result<()>;

    fn query_opt(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    fn query_int(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64> {
        let row = self
            .query_opt(sql, params)?
            .ok_or_else(|| MemoryError::Storage("scalar query returned no rows".to_string()))?;
        row.int(0)
    }
}

struct SqliteSession<'a>(&'a rusqlite::Connection);

impl Session for SqliteSession<'_> {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let mut stmt = self.0.prepare_cached(sql)?;
        Ok(stmt.execute(rusqlite::params_from_iter(params.iter()))? as u64)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let mut stmt = self.0.prepare_cached(sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), SqlRow::from_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn insert_returning_id(
        &mut self,
        sql: &str,
        _id_column: &str,
        params: &[SqlValue],
    ) -> Result<i64> {
        self.execute(sql, params)?;
        Ok(self.0.last_insert_rowid())
    }

    fn batch(&mut self, sql: &str) -> Result<()> {
        Ok(self.0.execute_batch(sql)?)
    }
}

struct PgSession<'a, 'conn>(&'a mut postgres::Transaction<'conn>);

fn pg_params(params: &[SqlValue]) -> Vec<&(dyn PgToSql + Sync)> {
    params.iter().map(|p| p as &(dyn PgToSql + Sync)).collect()
}

impl Session for PgSession<'_, '_> {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let sql = Dialect::Postgres.prepare(sql);
        Ok(self.0.execute(sql.as_ref(), &pg_params(params))?)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let sql = Dialect::Postgres.prepare(sql);
        self.0
            .query(sql.as_ref(), &pg_params(params))?
            .iter()
            .map(SqlRow::from_postgres)
            .collect()
    }

    fn insert_returning_id(
        &mut self,
        sql: &str,
        id_column: &str,
        params: &[SqlValue],
    ) -> Result<i64> {
        let sql = format!("{} RETURNING {id_column}", Dialect::Postgres.prepare(sql));
        let row = self.0.query_one(sql.as_str(), &pg_params(params))?;
        Ok(row.try_get::<_, i64>(0)?)
    }

    fn batch(&mut self, sql: &str) -> Result<()> {
        Ok(self.0.batch_execute(sql)?)
    }
}

/// Connection-pooled, dialect-aware store
pub struct PooledBackend {
    dialect: Dialect,
    location: String,
    pool: RwLock<Option<Pool>>,
}

impl std::fmt::Debug for PooledBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBackend")
            .field("dialect", &self.dialect)
            .field("location", &self.location)
            .field("open", &self.pool.read().is_some())
            .finish()
    }
}

/// Where a `sqlite://` URL points
#[derive(Debug, Clone, PartialEq, Eq)]
enum SqliteTarget {
    Memory,
    File(String),
}

fn parse_sqlite_url(url: &str) -> Option<SqliteTarget> {
    let rest = url.strip_prefix("sqlite:")?;
    let rest = rest
        .strip_prefix("///")
        .or_else(|| rest.strip_prefix("//"))
        .unwrap_or(rest);
    if rest.is_empty() || rest == ":memory:" {
        Some(SqliteTarget::Memory)
    } else {
        Some(SqliteTarget::File(rest.to_string()))
    }
}

impl PooledBackend {
    /// Connect with the default pool size and timeout
    pub fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, DEFAULT_POOL_SIZE, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Connect, build the pool and apply the schema
    pub fn connect_with(url: &str, pool_size: u32, connect_timeout: Duration) -> Result<Self> {
        if pool_size == 0 {
            return Err(MemoryError::config("pool_size must be at least 1"));
        }

        let (dialect, location, pool) = if url.starts_with("postgres://")
            || url.starts_with("postgresql://")
        {
            let config: postgres::Config = url
                .parse()
                .map_err(|e| MemoryError::config(format!("invalid database URL: {e}")))?;
            let location = format!("postgres/{}", config.get_dbname().unwrap_or("postgres"));
            let manager = PostgresConnectionManager::new(config, NoTls);
            let pool = r2d2::Pool::builder()
                .max_size(pool_size)
                .connection_timeout(connect_timeout)
                .build(manager)
                .map_err(|e| MemoryError::BackendUnavailable(format!("{location}: {e}")))?;
            (Dialect::Postgres, location, Pool::Postgres(pool))
        } else if let Some(target) = parse_sqlite_url(url) {
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            let builder = r2d2::Pool::builder()
                .max_size(pool_size)
                .connection_timeout(connect_timeout);

            let (location, manager, builder) = match target {
                SqliteTarget::Memory => {
                    // Shared cache keeps one database alive across all pooled connections
                    let uri = format!("file:recall-{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
                    let manager = SqliteConnectionManager::file(&uri)
                        .with_flags(flags)
                        .with_init(|conn| {
                            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
                        });
                    // Shared-cache writers fail with SQLITE_LOCKED instead of waiting, so
                    // callers queue on the single connection. The database lives only as
                    // long as that connection does.
                    if pool_size > 1 {
                        tracing::debug!(pool_size, "In-memory SQLite pool limited to one connection");
                    }
                    let builder = builder
                        .max_size(1)
                        .min_idle(Some(1))
                        .idle_timeout(None)
                        .max_lifetime(None);
                    (uri, manager, builder)
                }
                SqliteTarget::File(path) => {
                    if let Some(parent) = std::path::Path::new(&path).parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let manager = SqliteConnectionManager::file(&path)
                        .with_flags(flags)
                        .with_init(|conn| {
                            conn.execute_batch(
                                "PRAGMA busy_timeout = 5000;
                                 PRAGMA journal_mode = WAL;
                                 PRAGMA synchronous = NORMAL;
                                 PRAGMA foreign_keys = ON;",
                            )
                        });
                    (path, manager, builder)
                }
            };
            let pool = builder
                .build(manager)
                .map_err(|e| MemoryError::BackendUnavailable(format!("{location}: {e}")))?;
            (Dialect::Sqlite, location, Pool::Sqlite(pool))
        } else {
            return Err(MemoryError::config(format!(
                "unsupported database URL scheme in '{}'",
                url.split(':').next().unwrap_or_default()
            )));
        };

        let backend = Self {
            dialect,
            location,
            pool: RwLock::new(Some(pool)),
        };
        backend.initialize_schema()?;
        tracing::info!(
            dialect = ?backend.dialect,
            location = %backend.location,
            pool_size,
            "Connected pooled memory store"
        );
        Ok(backend)
    }

    /// Dialect in use
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn pool(&self) -> Result<Pool> {
        self.pool.read().clone().ok_or_else(|| {
            MemoryError::BackendUnavailable("pooled backend is closed".to_string())
        })
    }

    /// Run `f` in one transaction on one pooled connection.
    ///
    /// `write` takes the SQLite write lock up front so concurrent writers wait on
    /// `busy_timeout` instead of failing on lock upgrade.
    fn run<T>(&self, write: bool, f: impl FnOnce(&mut dyn Session) -> Result<T>) -> Result<T> {
        match self.pool()? {
            Pool::Sqlite(pool) => {
                let mut conn = pool.get()?;
                let behavior = if write {
                    TransactionBehavior::Immediate
                } else {
                    TransactionBehavior::Deferred
                };
                let tx = conn.transaction_with_behavior(behavior)?;
                let out = f(&mut SqliteSession(&tx))?;
                tx.commit()?;
                Ok(out)
            }
            Pool::Postgres(pool) => {
                let mut client = pool.get()?;
                let mut tx = client.transaction()?;
                let out = f(&mut PgSession(&mut tx))?;
                tx.commit()?;
                Ok(out)
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&mut dyn Session) -> Result<T>) -> Result<T> {
        self.run(false, f)
    }

    fn write<T>(&self, f: impl FnOnce(&mut dyn Session) -> Result<T>) -> Result<T> {
        self.run(true, f)
    }
}

fn decode_all<T>(rows: Vec<SqlRow>, decode: fn(&SqlRow) -> Result<T>) -> Result<Vec<T>> {
    rows.iter().map(decode).collect()
}

fn insert_summary_row(session: &mut dyn Session, summary: &NewSummary, now: &str) -> Result<i64> {
    let child_ids = child_ids_to_json(summary.child_ids.as_deref())?;
    session.insert_returning_id(
        schema::INSERT_SUMMARY,
        "summary_id",
        &[
            summary.agent_id.as_str().into(),
            summary.conversation_id.as_str().into(),
            summary.level.into(),
            summary.content.as_str().into(),
            summary.token_count.into(),
            summary.span_start_seq.into(),
            summary.span_end_seq.into(),
            child_ids.into(),
            now.into(),
        ],
    )
}

impl StorageBackend for PooledBackend {
    fn name(&self) -> &str {
        match self.dialect {
            Dialect::Sqlite => "pooled:sqlite",
            Dialect::Postgres => "pooled:postgres",
        }
    }

    fn initialize_schema(&self) -> Result<()> {
        let ddl = self.dialect.ddl();
        self.write(|s| s.batch(&ddl))
    }

    fn register_agent(&self, agent_id: &str, name: &str, agent_type: &str) -> Result<()> {
        let now = format_timestamp(&chrono::Utc::now());
        self.write(|s| {
            s.execute(
                schema::UPSERT_AGENT,
                &[
                    agent_id.into(),
                    name.into(),
                    agent_type.into(),
                    now.as_str().into(),
                    now.as_str().into(),
                ],
            )?;
            Ok(())
        })
    }

    fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        self.read(|s| {
            s.query_opt(schema::SELECT_AGENT, &[agent_id.into()])?
                .as_ref()
                .map(decode_agent)
                .transpose()
        })
    }

    fn insert_message(&self, message: &NewMessage<'_>) -> Result<i64> {
        let metadata = message.metadata.map(metadata_to_json).transpose()?;
        let now = format_timestamp(&chrono::Utc::now());

        self.write(|s| {
            let sequence = match message.sequence {
                Some(sequence) => sequence,
                None => s.query_int(
                    schema::NEXT_SEQUENCE,
                    &[message.agent_id.into(), message.conversation_id.into()],
                )?,
            };
            s.insert_returning_id(
                schema::INSERT_MESSAGE,
                "message_id",
                &[
                    message.agent_id.into(),
                    message.conversation_id.into(),
                    message.role.into(),
                    message.content.into(),
                    message.token_count.into(),
                    metadata.into(),
                    now.into(),
                    sequence.into(),
                ],
            )
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

        self.read(|s| decode_all(s.query(&sql, &binds)?, decode_message))
    }

    fn get_messages_in_span(
        &self,
        agent_id: &str,
        conversation_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Message>> {
        self.read(|s| {
            let rows = s.query(
                &schema::select_messages_in_span(),
                &[
                    agent_id.into(),
                    conversation_id.into(),
                    start.into(),
                    end.into(),
                ],
            )?;
            decode_all(rows, decode_message)
        })
    }

    fn get_message_by_id(&self, message_id: i64) -> Result<Option<Message>> {
        self.read(|s| {
            s.query_opt(&schema::select_message_by_id(), &[message_id.into()])?
                .as_ref()
                .map(decode_message)
                .transpose()
        })
    }

    fn get_token_count(&self, agent_id: &str, conversation_id: &str) -> Result<i64> {
        self.read(|s| {
            s.query_int(
                schema::RAW_TOKEN_COUNT,
                &[agent_id.into(), conversation_id.into()],
            )
        })
    }

    fn get_next_sequence(&self, agent_id: &str, conversation_id: &str) -> Result<i64> {
        self.read(|s| {
            s.query_int(
                schema::NEXT_SEQUENCE,
                &[agent_id.into(), conversation_id.into()],
            )
        })
    }

    fn insert_summary(&self, summary: &NewSummary) -> Result<i64> {
        let now = format_timestamp(&chrono::Utc::now());
        self.write(|s| insert_summary_row(s, summary, &now))
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
        binds.extend(state.map(|st| SqlValue::from(st.as_str())));

        self.read(|s| decode_all(s.query(&sql, &binds)?, decode_summary))
    }

    fn get_summary_by_id(&self, summary_id: i64) -> Result<Option<Summary>> {
        self.read(|s| {
            s.query_opt(&schema::select_summary_by_id(), &[summary_id.into()])?
                .as_ref()
                .map(decode_summary)
                .transpose()
        })
    }

    fn update_summary_state(&self, summary_id: i64, state: SummaryState) -> Result<()> {
        self.write(|s| {
            let updated = s.execute(
                schema::UPDATE_SUMMARY_STATE,
                &[state.as_str().into(), summary_id.into()],
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

        self.write(|s| {
            for id in supersede {
                let updated = s.execute(schema::SUPERSEDE_ACTIVE, &[(*id).into()])?;
                if updated != 1 {
                    return Err(MemoryError::IntegrityViolation(format!(
                        "summary {id} is no longer active"
                    )));
                }
            }

            let mut ids = Vec::with_capacity(new_summaries.len());
            for summary in new_summaries {
                let overlaps = s.query_int(
                    schema::COUNT_ACTIVE_OVERLAPS,
                    &[
                        summary.agent_id.as_str().into(),
                        summary.conversation_id.as_str().into(),
                        summary.level.into(),
                        summary.span_end_seq.into(),
                        summary.span_start_seq.into(),
                    ],
                )?;
                if overlaps > 0 {
                    return Err(MemoryError::IntegrityViolation(format!(
                        "level-{} span [{}, {}] overlaps an active summary",
                        summary.level, summary.span_start_seq, summary.span_end_seq
                    )));
                }
                ids.push(insert_summary_row(s, summary, &now)?);
            }
            Ok(ids)
        })
    }

    fn insert_shared_memory(&self, share: &NewSharedMemory<'_>) -> Result<i64> {
        let metadata = share.metadata.map(metadata_to_json).transpose()?;
        let now = format_timestamp(&chrono::Utc::now());
        let expires_at = share.expires_at.as_ref().map(format_timestamp);

        self.write(|s| {
            s.insert_returning_id(
                schema::INSERT_SHARED,
                "share_id",
                &[
                    share.source_agent_id.into(),
                    share.target_agent_id.into(),
                    share.namespace.into(),
                    share.content.into(),
                    share.token_count.into(),
                    metadata.into(),
                    now.into(),
                    expires_at.into(),
                ],
            )
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
        self.read(|s| {
            let rows = s.query(
                &schema::select_shared(include_broadcasts),
                &[
                    namespace.into(),
                    agent_id.into(),
                    now.into(),
                    SqlValue::Int(limit as i64),
                ],
            )?;
            decode_all(rows, decode_shared)
        })
    }

    fn insert_compaction_log(&self, entry: &NewCompactionLog) -> Result<i64> {
        let now = format_timestamp(&chrono::Utc::now());
        self.write(|s| {
            s.insert_returning_id(
                schema::INSERT_LOG,
                "log_id",
                &[
                    entry.agent_id.as_str().into(),
                    entry.conversation_id.as_str().into(),
                    entry.level.into(),
                    entry.messages_before.into(),
                    entry.tokens_before.into(),
                    entry.tokens_after.into(),
                    entry.summaries_created.into(),
                    entry.strategy.as_str().into(),
                    entry.duration_ms.into(),
                    now.into(),
                ],
            )
        })
    }

    fn get_compaction_log(
        &self,
        agent_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<CompactionLogEntry>> {
        self.read(|s| {
            let rows = s.query(
                &schema::select_compaction_log(),
                &[
                    agent_id.into(),
                    conversation_id.into(),
                    SqlValue::Int(limit as i64),
                ],
            )?;
            decode_all(rows, decode_log)
        })
    }

    fn get_config(&self, agent_id: Option<&str>) -> Result<HashMap<String, String>> {
        let scope = agent_id.unwrap_or(GLOBAL_CONFIG_SCOPE);
        self.read(|s| {
            let rows = s.query(
                schema::SELECT_CONFIG,
                &[GLOBAL_CONFIG_SCOPE.into(), scope.into()],
            )?;
            let triples = rows
                .iter()
                .map(|row| {
                    Ok((
                        row.text(0)?.to_string(),
                        row.text(1)?.to_string(),
                        row.text(2)?.to_string(),
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(merge_config_rows(triples))
        })
    }

    fn set_config(&self, key: &str, value: &str, agent_id: Option<&str>) -> Result<()> {
        let now = format_timestamp(&chrono::Utc::now());
        let scope = agent_id.unwrap_or(GLOBAL_CONFIG_SCOPE);
        self.write(|s| {
            s.execute(
                schema::UPSERT_CONFIG,
                &[scope.into(), key.into(), value.into(), now.into()],
            )?;
            Ok(())
        })
    }

    fn stats(&self, agent_id: &str, conversation_id: &str) -> Result<StorageStats> {
        let scope = [SqlValue::from(agent_id), SqlValue::from(conversation_id)];
        self.read(|s| {
            let totals = s
                .query_opt(schema::MESSAGE_STATS, &scope)?
                .ok_or_else(|| MemoryError::Storage("message stats returned no rows".into()))?;
            let mut stats = StorageStats {
                message_count: totals.int(0)?,
                raw_token_count: totals.int(1)?,
                ..Default::default()
            };

            for row in s.query(schema::SUMMARY_STATE_COUNTS, &scope)? {
                let count = row.int(1)?;
                match row.text(0)?.parse::<SummaryState>()? {
                    SummaryState::Active => stats.active_summaries = count,
                    SummaryState::Superseded => stats.superseded_summaries = count,
                }
            }

            stats.compaction_runs = s.query_int(schema::COMPACTION_RUNS, &scope)?;
            Ok(stats)
        })
    }

    fn close(&self) -> Result<()> {
        if self.pool.write().take().is_some() {
            tracing::info!(location = %self.location, "Closed pooled memory store");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sqlite_urls() {
        assert_eq!(parse_sqlite_url("sqlite::memory:"), Some(SqliteTarget::Memory));
        assert_eq!(parse_sqlite_url("sqlite://"), Some(SqliteTarget::Memory));
        assert_eq!(
            parse_sqlite_url("sqlite:///data/memory.db"),
            Some(SqliteTarget::File("data/memory.db".into()))
        );
        assert_eq!(
            parse_sqlite_url("sqlite:////tmp/memory.db"),
            Some(SqliteTarget::File("/tmp/memory.db".into()))
        );
        assert_eq!(parse_sqlite_url("mysql://x"), None);
    }

    #[test]
    fn test_unknown_scheme_is_config_error() {
        let err = PooledBackend::connect("mysql://user@host/db").unwrap_err();
        assert!(matches!(err, MemoryError::Configuration(_)));
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let err =
            PooledBackend::connect_with("sqlite::memory:", 0, DEFAULT_CONNECT_TIMEOUT).unwrap_err();
        assert!(matches!(err, MemoryError::Configuration(_)));
    }

    #[test]
    fn test_memory_pool_shares_one_database() {
        let backend = PooledBackend::connect_with("sqlite::memory:", 3, DEFAULT_CONNECT_TIMEOUT)
            .expect("pooled in-memory SQLite should open");
        assert_eq!(backend.dialect(), Dialect::Sqlite);
        backend.register_agent("a", "A", "worker").unwrap();

        // Several checkouts must all see the same rows
        for _ in 0..5 {
            assert!(backend.get_agent("a").unwrap().is_some());
        }
    }

    #[test]
    fn test_memory_pool_serializes_concurrent_writers() {
        let backend = std::sync::Arc::new(PooledBackend::connect("sqlite::memory:").unwrap());
        backend.register_agent("writer", "Writer", "worker").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let backend = backend.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let content = format!("thread {t} message {i}");
                        backend
                            .insert_message(&NewMessage {
                                agent_id: "writer",
                                conversation_id: &format!("conv-{t}"),
                                role: "user",
                                content: &content,
                                token_count: 4,
                                metadata: None,
                                sequence: None,
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for t in 0..4 {
            let stats = backend.stats("writer", &format!("conv-{t}")).unwrap();
            assert_eq!(stats.message_count, 50);
        }
    }

    #[test]
    fn test_closed_pool_reports_unavailable() {
        let backend = PooledBackend::connect("sqlite::memory:").unwrap();
        backend.close().unwrap();
        let err = backend.get_agent("a").unwrap_err();
        assert!(matches!(err, MemoryError::BackendUnavailable(_)));
    }
}
