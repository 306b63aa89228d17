//! PostgreSQL gateway backed by an sqlx connection pool.

use crate::config::PgConfig;
use crate::error::{
    BackendError, INVALID_TEXT_REPRESENTATION, NUMERIC_VALUE_OUT_OF_RANGE, PROTOCOL_VIOLATION,
};
use crate::gateway::{Gateway, QueryResult, Row};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::encode::IsNull;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgConnectOptions, PgPoolOptions, PgRow, PgTypeInfo,
};
use sqlx::query::Query;
use sqlx::types::{Decimal, Uuid};
use sqlx::{Column, Decode, Either, Executor, PgPool, Postgres, Row as _, Type, TypeInfo};
use std::str::FromStr;
use std::sync::Arc;

/// Callback for connection-level failures.
pub type ErrorHandler = Arc<dyn Fn(&BackendError) + Send + Sync>;

/// A pooled PostgreSQL connection gateway.
#[derive(Clone)]
pub struct PgGateway {
    pool: PgPool,
    big_int_as_number: bool,
    target: String,
    on_error: Option<ErrorHandler>,
}

impl PgGateway {
    /// Build a pool from `config` and check that a connection can be acquired.
    pub async fn connect(config: &PgConfig) -> Result<Self, BackendError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.pw)
            .database(&config.db);

        let mut pool = PgPoolOptions::new()
            .max_connections(config.max_pool_size)
            .idle_timeout(config.idle_timeout());
        if let Some(timeout) = config.connection_timeout() {
            pool = pool.acquire_timeout(timeout);
        }

        let target = format!("{}:{}, {}@{}", config.host, config.port, config.user, config.db);
        let pool = pool.connect_with(options).await.map_err(|e| {
            let err = BackendError::from(e);
            tracing::error!("Postgres DB-connection failed for host {} with ERROR: {}", target, err);
            err
        })?;

        // Fail early if no connection can be acquired
        drop(pool.acquire().await?);

        tracing::info!("Connected to {}", target);
        Ok(Self {
            pool,
            big_int_as_number: config.big_int_as_number,
            target,
            on_error: None,
        })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, big_int_as_number: bool) -> Self {
        Self {
            pool,
            big_int_as_number,
            target: String::from("<pool>"),
            on_error: None,
        }
    }

    /// Register a callback invoked once for every connection-level failure.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&BackendError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn report(&self, err: &BackendError) {
        if !err.is_acquire_failure() {
            return;
        }
        tracing::error!(
            "Postgres DB-connection failed for host {} with ERROR: {}",
            self.target,
            err
        );
        if let Some(handler) = &self.on_error {
            handler(err);
        }
    }

    /// Describe `sql` first so every value is sent as the type the server
    /// infers for its placeholder, then run it on the same connection.
    async fn run(&self, sql: &str, params: &[Value]) -> Result<QueryResult, BackendError> {
        let mut conn = self.pool.acquire().await?;
        let described = (&mut *conn).describe(sql).await?;
        let types = match described.parameters() {
            Some(Either::Left(types)) => types.to_vec(),
            _ => Vec::new(),
        };
        if types.len() != params.len() {
            return Err(BackendError::new(
                Some(PROTOCOL_VIOLATION),
                format!(
                    "bind message supplies {} parameters, but prepared statement requires {}",
                    params.len(),
                    types.len()
                ),
            ));
        }

        let mut query = sqlx::query(sql);
        for (value, ty) in params.iter().zip(&types) {
            query = bind(query, convert(value, ty)?, ty);
        }

        if described.columns().is_empty() {
            let done = query.execute(&mut *conn).await?;
            return Ok(QueryResult { rows: Vec::new(), row_count: done.rows_affected() });
        }

        let big_int_as_number = self.big_int_as_number;
        let rows: Vec<Row> = query
            .fetch(&mut *conn)
            .map_ok(|row| row_to_map(&row, big_int_as_number))
            .try_collect()
            .await?;
        Ok(QueryResult { row_count: rows.len() as u64, rows })
    }
}

#[async_trait]
impl Gateway for PgGateway {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, BackendError> {
        self.run(sql, params).await.map_err(|err| {
            self.report(&err);
            err
        })
    }

    async fn end(&self) {
        self.pool.close().await;
    }
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Leading version byte of the `jsonb` binary format.
const JSONB_VERSION: u8 = 1;

/// A JSON value converted to the Rust type matching its placeholder.
#[derive(Debug, Clone, PartialEq)]
enum Param {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Decimal),
    Uuid(Uuid),
    TimestampTz(DateTime<Utc>),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    BoolList(Vec<bool>),
    Int2List(Vec<i16>),
    Int4List(Vec<i32>),
    Int8List(Vec<i64>),
    Float8List(Vec<f64>),
    TextList(Vec<String>),
    /// Bytes already in the server's binary format for the placeholder type.
    /// For text-like types, `json` and enums that is the UTF-8 text itself.
    Raw(Vec<u8>),
}

/// Sent under the described type instead of a type of its own.
struct Described {
    ty: PgTypeInfo,
    bytes: Option<Vec<u8>>,
}

impl Type<Postgres> for Described {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl sqlx::Encode<'_, Postgres> for Described {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> IsNull {
        match &self.bytes {
            Some(bytes) => {
                buf.extend_from_slice(bytes);
                IsNull::No
            }
            None => IsNull::Yes,
        }
    }

    fn produces(&self) -> Option<PgTypeInfo> {
        Some(self.ty.clone())
    }
}

fn bind<'q>(query: PgQuery<'q>, param: Param, ty: &PgTypeInfo) -> PgQuery<'q> {
    match param {
        Param::Null => query.bind(Described { ty: ty.clone(), bytes: None }),
        Param::Bool(v) => query.bind(v),
        Param::Int2(v) => query.bind(v),
        Param::Int4(v) => query.bind(v),
        Param::Int8(v) => query.bind(v),
        Param::Float4(v) => query.bind(v),
        Param::Float8(v) => query.bind(v),
        Param::Numeric(v) => query.bind(v),
        Param::Uuid(v) => query.bind(v),
        Param::TimestampTz(v) => query.bind(v),
        Param::Timestamp(v) => query.bind(v),
        Param::Date(v) => query.bind(v),
        Param::BoolList(v) => query.bind(v),
        Param::Int2List(v) => query.bind(v),
        Param::Int4List(v) => query.bind(v),
        Param::Int8List(v) => query.bind(v),
        Param::Float8List(v) => query.bind(v),
        Param::TextList(v) => query.bind(v),
        Param::Raw(bytes) => query.bind(Described { ty: ty.clone(), bytes: Some(bytes) }),
    }
}

/// Convert a JSON value for a placeholder of type `ty`.
///
/// Strings are parsed the way the server would parse a text literal, so ids
/// decoded as strings, timestamps and decimals round-trip. Types without a
/// dedicated conversion receive the value's text.
fn convert(value: &Value, ty: &PgTypeInfo) -> Result<Param, BackendError> {
    if value.is_null() {
        return Ok(Param::Null);
    }
    let invalid = || invalid_input(ty, value);
    let param = match ty.name() {
        "BOOL" => Param::Bool(as_bool(value).ok_or_else(invalid)?),
        "INT2" => Param::Int2(as_int(value, ty)?),
        "INT4" => Param::Int4(as_int(value, ty)?),
        "INT8" => Param::Int8(as_int(value, ty)?),
        "FLOAT4" => Param::Float4(as_float(value).ok_or_else(invalid)? as f32),
        "FLOAT8" => Param::Float8(as_float(value).ok_or_else(invalid)?),
        "NUMERIC" => Param::Numeric(as_decimal(value).ok_or_else(invalid)?),
        "UUID" => Param::Uuid(
            value
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(invalid)?,
        ),
        "TIMESTAMPTZ" => Param::TimestampTz(as_timestamptz(value).ok_or_else(invalid)?),
        "TIMESTAMP" => Param::Timestamp(value.as_str().and_then(parse_naive).ok_or_else(invalid)?),
        "DATE" => Param::Date(
            value
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .ok_or_else(invalid)?,
        ),
        "JSONB" => {
            let mut bytes = vec![JSONB_VERSION];
            bytes.extend_from_slice(as_text(value).as_bytes());
            Param::Raw(bytes)
        }
        "BOOL[]" => Param::BoolList(list(value, ty, as_bool)?),
        "INT2[]" => Param::Int2List(list(value, ty, |v| as_int(v, ty).ok())?),
        "INT4[]" => Param::Int4List(list(value, ty, |v| as_int(v, ty).ok())?),
        "INT8[]" => Param::Int8List(list(value, ty, |v| as_int(v, ty).ok())?),
        "FLOAT8[]" => Param::Float8List(list(value, ty, as_float)?),
        "TEXT[]" | "VARCHAR[]" => Param::TextList(list(value, ty, |v| Some(as_text(v)))?),
        _ => Param::Raw(as_text(value).into_bytes()),
    };
    Ok(param)
}

fn invalid_input(ty: &PgTypeInfo, value: &Value) -> BackendError {
    BackendError::new(
        Some(INVALID_TEXT_REPRESENTATION),
        format!("invalid input syntax for type {}: {}", ty.name().to_lowercase(), value),
    )
}

/// Strings pass through unquoted; everything else as JSON text.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "y" | "yes" | "on" | "1" => Some(true),
            "f" | "false" | "n" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_int<T: TryFrom<i64>>(value: &Value, ty: &PgTypeInfo) -> Result<T, BackendError> {
    let n: i64 = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid_input(ty, value))?;
    T::try_from(n).map_err(|_| {
        BackendError::new(
            Some(NUMERIC_VALUE_OUT_OF_RANGE),
            format!("value {} is out of range for type {}", n, ty.name().to_lowercase()),
        )
    })
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|t| t.naive_utc()))
}

fn as_timestamptz(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?;
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| parse_naive(s).map(|t| Utc.from_utc_datetime(&t)))
}

fn list<T>(
    value: &Value,
    ty: &PgTypeInfo,
    item: impl Fn(&Value) -> Option<T>,
) -> Result<Vec<T>, BackendError> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| item(v).ok_or_else(|| invalid_input(ty, value)))
            .collect(),
        _ => Err(invalid_input(ty, value)),
    }
}

fn get<'r, T>(row: &'r PgRow, i: usize) -> Option<T>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get::<Option<T>, _>(i).ok().flatten()
}

fn json_list<T: Into<Value>>(items: Option<Vec<T>>) -> Value {
    items
        .map(|v| Value::Array(v.into_iter().map(Into::into).collect()))
        .unwrap_or(Value::Null)
}

/// Convert a PgRow to a JSON map, keeping column order.
fn row_to_map(row: &PgRow, big_int_as_number: bool) -> Row {
    let mut map = Row::new();

    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let type_name = column.type_info().name();

        let value: Value = match type_name {
            "BOOL" => get::<bool>(row, i).map(Value::Bool).unwrap_or(Value::Null),
            "INT2" => get::<i16>(row, i).map(Value::from).unwrap_or(Value::Null),
            "INT4" => get::<i32>(row, i).map(Value::from).unwrap_or(Value::Null),
            "INT8" => match get::<i64>(row, i) {
                Some(v) if big_int_as_number => Value::from(v),
                Some(v) => Value::String(v.to_string()),
                None => Value::Null,
            },
            "FLOAT4" => get::<f32>(row, i)
                .and_then(|v| serde_json::Number::from_f64(v as f64))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            "FLOAT8" => get::<f64>(row, i)
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            "JSON" | "JSONB" => get::<Value>(row, i).unwrap_or(Value::Null),
            "NUMERIC" => get::<Decimal>(row, i)
                .map(|d| Value::String(d.to_string()))
                .unwrap_or(Value::Null),
            "UUID" => get::<Uuid>(row, i)
                .map(|u| Value::String(u.to_string()))
                .unwrap_or(Value::Null),
            "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, i)
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null),
            "TIMESTAMP" => get::<NaiveDateTime>(row, i)
                .map(|t| Value::String(t.to_string()))
                .unwrap_or(Value::Null),
            "DATE" => get::<NaiveDate>(row, i)
                .map(|d| Value::String(d.to_string()))
                .unwrap_or(Value::Null),
            "BOOL[]" => json_list(get::<Vec<bool>>(row, i)),
            "INT2[]" => json_list(get::<Vec<i16>>(row, i)),
            "INT4[]" => json_list(get::<Vec<i32>>(row, i)),
            "INT8[]" => match get::<Vec<i64>>(row, i) {
                Some(v) if big_int_as_number => json_list(Some(v)),
                Some(v) => json_list(Some(v.iter().map(|n| n.to_string()).collect::<Vec<_>>())),
                None => Value::Null,
            },
            "FLOAT8[]" => json_list(get::<Vec<f64>>(row, i)),
            "TEXT[]" | "VARCHAR[]" => json_list(get::<Vec<String>>(row, i)),
            _ => get::<String>(row, i).map(Value::String).unwrap_or(Value::Null),
        };

        map.insert(name, value);
    }

    map
}
