//! Driver-neutral values and rows.
//!
//! Both backends bind [`SqlValue`]s and read rows into [`SqlRow`], so the row
//! decoders (`decode_*`) are written once.

use bytes::BytesMut;
use postgres::types::{IsNull, ToSql as PgToSql, Type};
use rusqlite::types::{ToSqlOutput, Value, ValueRef};

use crate::error::{MemoryError, Result};
use crate::types::{
    child_ids_from_json, metadata_from_json, parse_timestamp, Agent, CompactionLogEntry, Message,
    SharedMemory, Summary,
};

/// A bound parameter or a decoded column
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u8> for SqlValue {
    fn from(v: u8) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Int(v) => ToSqlOutput::from(*v),
            Self::Real(v) => ToSqlOutput::from(*v),
            Self::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

impl PgToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Int(v) => {
                if *ty == Type::INT4 {
                    i32::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::INT2 {
                    i16::try_from(*v)?.to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Self::Real(v) => v.to_sql(ty, out),
            Self::Text(s) => s.as_str().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    postgres::types::to_sql_checked!();
}

/// One result row
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SqlRow(pub(crate) Vec<SqlValue>);

impl SqlRow {
    pub(crate) fn from_sqlite(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let width = row.as_ref().column_count();
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(match row.get_ref(idx)? {
                ValueRef::Null => SqlValue::Null,
                ValueRef::Integer(v) => SqlValue::Int(v),
                ValueRef::Real(v) => SqlValue::Real(v),
                ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                    SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
                }
            });
        }
        Ok(Self(values))
    }

    pub(crate) fn from_postgres(row: &postgres::Row) -> Result<Self> {
        let mut values = Vec::with_capacity(row.len());
        for (idx, column) in row.columns().iter().enumerate() {
            let ty = column.type_();
            let value = if *ty == Type::INT8 {
                row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int)
            } else if *ty == Type::INT4 {
                row.try_get::<_, Option<i32>>(idx)?
                    .map(|v| SqlValue::Int(i64::from(v)))
            } else if *ty == Type::INT2 {
                row.try_get::<_, Option<i16>>(idx)?
                    .map(|v| SqlValue::Int(i64::from(v)))
            } else if *ty == Type::FLOAT8 {
                row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::Real)
            } else if *ty == Type::BOOL {
                row.try_get::<_, Option<bool>>(idx)?
                    .map(|v| SqlValue::Int(i64::from(v)))
            } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR {
                row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
            } else {
                return Err(MemoryError::Storage(format!(
                    "unsupported column type '{}' for column '{}'",
                    ty,
                    column.name()
                )));
            };
            values.push(value.unwrap_or(SqlValue::Null));
        }
        Ok(Self(values))
    }

    fn get(&self, idx: usize) -> Result<&SqlValue> {
        self.0
            .get(idx)
            .ok_or_else(|| MemoryError::Storage(format!("column {idx} out of range")))
    }

    pub(crate) fn int(&self, idx: usize) -> Result<i64> {
        match self.get(idx)? {
            SqlValue::Int(v) => Ok(*v),
            SqlValue::Real(v) => Ok(*v as i64),
            other => Err(MemoryError::Storage(format!(
                "column {idx}: expected integer, got {other:?}"
            ))),
        }
    }

    pub(crate) fn opt_text(&self, idx: usize) -> Result<Option<&str>> {
        match self.get(idx)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s)),
            other => Err(MemoryError::Storage(format!(
                "column {idx}: expected text, got {other:?}"
            ))),
        }
    }

    pub(crate) fn text(&self, idx: usize) -> Result<&str> {
        self.opt_text(idx)?
            .ok_or_else(|| MemoryError::Storage(format!("column {idx}: unexpected NULL")))
    }

    fn level(&self, idx: usize) -> Result<u8> {
        let raw = self.int(idx)?;
        u8::try_from(raw).map_err(|_| MemoryError::Storage(format!("invalid level {raw}")))
    }
}

pub(crate) fn decode_agent(row: &SqlRow) -> Result<Agent> {
    Ok(Agent {
        agent_id: row.text(0)?.to_string(),
        name: row.text(1)?.to_string(),
        agent_type: row.text(2)?.to_string(),
        created_at: parse_timestamp(row.text(3)?)?,
        last_seen_at: parse_timestamp(row.text(4)?)?,
    })
}

/// Columns as in [`super::schema::MESSAGE_COLUMNS`]
pub(crate) fn decode_message(row: &SqlRow) -> Result<Message> {
    Ok(Message {
        message_id: row.int(0)?,
        agent_id: row.text(1)?.to_string(),
        conversation_id: row.text(2)?.to_string(),
        role: row.text(3)?.to_string(),
        content: row.text(4)?.to_string(),
        token_count: row.int(5)?,
        metadata: metadata_from_json(row.opt_text(6)?)?,
        created_at: parse_timestamp(row.text(7)?)?,
        sequence: row.int(8)?,
    })
}

/// Columns as in [`super::schema::SUMMARY_COLUMNS`]
pub(crate) fn decode_summary(row: &SqlRow) -> Result<Summary> {
    Ok(Summary {
        summary_id: row.int(0)?,
        agent_id: row.text(1)?.to_string(),
        conversation_id: row.text(2)?.to_string(),
        level: row.level(3)?,
        content: row.text(4)?.to_string(),
        token_count: row.int(5)?,
        span_start_seq: row.int(6)?,
        span_end_seq: row.int(7)?,
        child_ids: child_ids_from_json(row.opt_text(8)?)?,
        state: row.text(9)?.parse()?,
        created_at: parse_timestamp(row.text(10)?)?,
    })
}

/// Columns as in [`super::schema::SHARED_COLUMNS`]
pub(crate) fn decode_shared(row: &SqlRow) -> Result<SharedMemory> {
    Ok(SharedMemory {
        share_id: row.int(0)?,
        source_agent_id: row.text(1)?.to_string(),
        target_agent_id: row.opt_text(2)?.map(str::to_string),
        namespace: row.text(3)?.to_string(),
        content: row.text(4)?.to_string(),
        token_count: row.int(5)?,
        metadata: metadata_from_json(row.opt_text(6)?)?,
        created_at: parse_timestamp(row.text(7)?)?,
        expires_at: row.opt_text(8)?.map(parse_timestamp).transpose()?,
    })
}

/// Columns as in [`super::schema::LOG_COLUMNS`]
pub(crate) fn decode_log(row: &SqlRow) -> Result<CompactionLogEntry> {
    Ok(CompactionLogEntry {
        log_id: row.int(0)?,
        agent_id: row.text(1)?.to_string(),
        conversation_id: row.text(2)?.to_string(),
        level: row.level(3)?,
        messages_before: row.int(4)?,
        tokens_before: row.int(5)?,
        tokens_after: row.int(6)?,
        summaries_created: row.int(7)?,
        strategy: row.text(8)?.to_string(),
        duration_ms: row.int(9)?,
        created_at: parse_timestamp(row.text(10)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_into_sql_value() {
        assert_eq!(SqlValue::from(None::<&str>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("x")), SqlValue::Text("x".into()));
        assert_eq!(SqlValue::from(Some(7i64)), SqlValue::Int(7));
    }

    #[test]
    fn test_sqlite_row_roundtrip() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let row = conn
            .query_row(
                "SELECT ?, ?, ?",
                rusqlite::params_from_iter([
                    SqlValue::Int(3),
                    SqlValue::Null,
                    SqlValue::Text("hi".into()),
                ]),
                SqlRow::from_sqlite,
            )
            .unwrap();
        assert_eq!(row.int(0).unwrap(), 3);
        assert_eq!(row.opt_text(1).unwrap(), None);
        assert_eq!(row.text(2).unwrap(), "hi");
        assert!(row.text(1).is_err());
    }
}
