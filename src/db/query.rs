use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use postgres_types::{FromSql, Kind, ToSql, Type};
use serde_json::Value;
use std::error::Error as StdError;
use std::sync::Arc;
use tokio_postgres::{Client, Row};

use crate::db::connection::ConnectionManager;
use crate::error::{Error, Result};

/// One result row, keyed by column name in select-list order.
pub type Record = serde_json::Map<String, Value>;

pub type RecordStream = BoxStream<'static, Result<Record>>;

/// Runs already-validated SQL. Implementations add nothing to the statement.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Single integer from the first column of the first row.
    async fn fetch_count(&self, sql: &str) -> Result<i64>;

    async fn fetch_all(&self, sql: &str) -> Result<Vec<Record>>;

    /// Rows as they arrive from the server, without buffering the result set.
    async fn fetch_stream(&self, sql: &str) -> Result<RecordStream>;
}

pub struct PgRowSource {
    connections: Arc<ConnectionManager>,
}

impl PgRowSource {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    async fn session(&self) -> Result<Arc<Client>> {
        self.connections
            .shared()
            .await
            .map_err(|e| Error::Execution(e.to_string()))
    }
}

/// The server's own message when there is one, without the driver's prefix.
pub fn db_error_message(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    }
}

fn execution_error(err: tokio_postgres::Error) -> Error {
    Error::Execution(db_error_message(&err))
}

#[async_trait]
impl RowSource for PgRowSource {
    async fn fetch_count(&self, sql: &str) -> Result<i64> {
        let row = self
            .session()
            .await?
            .query_one(sql, &[])
            .await
            .map_err(execution_error)?;
        row.try_get::<_, i64>(0).map_err(execution_error)
    }

    async fn fetch_all(&self, sql: &str) -> Result<Vec<Record>> {
        let rows = self
            .session()
            .await?
            .query(sql, &[])
            .await
            .map_err(execution_error)?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    /// Runs on a session of its own, closed when the stream is dropped.
    async fn fetch_stream(&self, sql: &str) -> Result<RecordStream> {
        let client = self
            .connections
            .dedicated()
            .await
            .map_err(|e| Error::Execution(e.to_string()))?;
        let rows = client
            .query_raw(sql, std::iter::empty::<&(dyn ToSql + Sync)>())
            .await
            .map_err(execution_error)?;

        Ok(rows
            .map(move |row| {
                let _session = &client;
                row.map(|row| row_to_record(&row)).map_err(execution_error)
            })
            .boxed())
    }
}

pub fn row_to_record(row: &Row) -> Record {
    let mut record = Record::new();
    for (i, col) in row.columns().iter().enumerate() {
        record.insert(col.name().to_string(), pg_value_to_json(row, i, col.type_()));
    }
    record
}

/// Replace invalid UTF-8 sequences with U+FFFD.
pub fn sanitize_utf8(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

/// Text-like cell read from its raw bytes, so invalid UTF-8 degrades instead of failing.
struct LossyText(String);

impl<'a> FromSql<'a> for LossyText {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(LossyText(sanitize_utf8(raw)))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::TEXT
                | Type::VARCHAR
                | Type::BPCHAR
                | Type::NAME
                | Type::CHAR
                | Type::UNKNOWN
                | Type::XML
                | Type::BYTEA
        ) || matches!(ty.kind(), Kind::Enum(_))
            || ty.name() == "citext"
    }
}

/// NUMERIC in its exact decimal form.
struct NumericText(String);

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        decode_numeric(raw)
            .map(NumericText)
            .ok_or_else(|| "malformed numeric value".into())
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Decode the binary NUMERIC wire format: base-10000 digit groups with a group weight and
/// a display scale.
pub fn decode_numeric(raw: &[u8]) -> Option<String> {
    let read = |at: usize| -> Option<u16> {
        let bytes = raw.get(at..at + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    };

    let ndigits = read(0)? as usize;
    let weight = read(2)? as i16 as i64;
    let sign = read(4)?;
    let dscale = read(6)? as usize;

    match sign {
        NUMERIC_NAN => return Some("NaN".into()),
        NUMERIC_PINF => return Some("Infinity".into()),
        NUMERIC_NINF => return Some("-Infinity".into()),
        _ => {}
    }

    let digits = (0..ndigits)
        .map(|k| read(8 + 2 * k))
        .collect::<Option<Vec<u16>>>()?;
    let group = |g: i64| -> u16 {
        if g < 0 {
            0
        } else {
            digits.get(g as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(0).to_string());
        for g in 1..=weight {
            out.push_str(&format!("{:04}", group(g)));
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut g = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", group(g)));
            g += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Some(out)
}

fn pg_value_to_json(row: &Row, idx: usize, pg_type: &Type) -> Value {
    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Type::NUMERIC => row
            .try_get::<_, Option<NumericText>>(idx)
            .ok()
            .flatten()
            .map(|n| Value::String(n.0))
            .unwrap_or(Value::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<Value>>(idx)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<LossyText>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.0))
            .unwrap_or(Value::Null),
    }
}
