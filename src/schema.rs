//! Schema mapping: field types, table creation, and collection hand-out.

use crate::collection::Collection;
use crate::compiler::quote_identifier;
use crate::config::PgConfig;
use crate::diagnostics::{Diagnostics, Flags, TracingDiagnostics};
use crate::error::{DbsError, DbsResult};
use crate::gateway::{Gateway, QueryResult};
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;

/// Abstract field kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Id,
    Bool,
    Float,
    /// `string` and its aliases: `/`, `hex`, `base64`, `email`, `password`.
    Text,
    /// Epoch timestamp.
    Time,
    BigInt,
    Array(Box<FieldKind>),
}

impl FromStr for FieldKind {
    type Err = DbsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "int" => FieldKind::Int,
            "id" => FieldKind::Id,
            "bool" => FieldKind::Bool,
            "float" => FieldKind::Float,
            "/" | "string" | "hex" | "base64" | "email" | "password" => FieldKind::Text,
            "time" => FieldKind::Time,
            "bigint" => FieldKind::BigInt,
            other => match other.strip_prefix("array_") {
                Some(inner) => FieldKind::Array(Box::new(inner.parse()?)),
                None => return Err(DbsError::UnknownType(format!("{{\"type\":\"{}\"}}", other))),
            },
        };
        Ok(kind)
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::Int => write!(f, "int"),
            FieldKind::Id => write!(f, "id"),
            FieldKind::Bool => write!(f, "bool"),
            FieldKind::Float => write!(f, "float"),
            FieldKind::Text => write!(f, "string"),
            FieldKind::Time => write!(f, "time"),
            FieldKind::BigInt => write!(f, "bigint"),
            FieldKind::Array(inner) => write!(f, "array_{}", inner),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFieldType {
    #[serde(rename = "type")]
    kind: String,
    max_length: Option<u32>,
    #[serde(default)]
    auto: bool,
}

/// Field type descriptor: kind plus length and auto-increment flags.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawFieldType")]
pub struct FieldType {
    pub kind: FieldKind,
    pub max_length: Option<u32>,
    pub auto: bool,
}

impl FieldType {
    pub fn new(kind: FieldKind) -> Self {
        Self { kind, max_length: None, auto: false }
    }

    pub fn max_length(mut self, n: u32) -> Self {
        self.max_length = Some(n);
        self
    }

    pub fn auto(mut self) -> Self {
        self.auto = true;
        self
    }
}

impl TryFrom<RawFieldType> for FieldType {
    type Error = DbsError;

    fn try_from(raw: RawFieldType) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: raw.kind.parse()?,
            max_length: raw.max_length,
            auto: raw.auto,
        })
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{\"type\":\"{}\"", self.kind)?;
        if let Some(n) = self.max_length {
            write!(f, ",\"maxLength\":{}", n)?;
        }
        if self.auto {
            write!(f, ",\"auto\":true")?;
        }
        write!(f, "}}")
    }
}

/// Column definition for [`Dbs::create_collection`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    /// Column type as produced by [`Dbs::convert_type`].
    #[serde(rename = "type")]
    pub sql_type: String,
    #[serde(default)]
    pub not_null: bool,
    /// Raw SQL default expression.
    pub default: Option<String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            not_null: false,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn default(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }
}

/// What an [`Index`] constrains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKind {
    /// Primary key over the listed fields.
    PrimaryKey(Vec<String>),
    /// Unique constraint on the index's own field.
    Unique,
    /// Foreign key from the index's field to `table.field`.
    Foreign { table: String, field: String },
}

/// A named table constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub kind: IndexKind,
}

impl Index {
    pub fn primary_key<I, S>(name: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: IndexKind::PrimaryKey(keys.into_iter().map(Into::into).collect()),
        }
    }

    pub fn unique(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: IndexKind::Unique }
    }

    pub fn foreign(name: impl Into<String>, table: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IndexKind::Foreign { table: table.into(), field: field.into() },
        }
    }
}

/// Entry point: maps types, creates tables and hands out collections.
#[derive(Clone)]
pub struct Dbs {
    gateway: Arc<dyn Gateway>,
    diagnostics: Arc<dyn Diagnostics>,
    flags: Flags,
}

impl Dbs {
    pub fn new(gateway: Arc<dyn Gateway>, diagnostics: Arc<dyn Diagnostics>, flags: Flags) -> Self {
        Self { gateway, diagnostics, flags }
    }

    /// Use the flags and logging settings from `config`.
    pub fn from_config(gateway: Arc<dyn Gateway>, config: &PgConfig) -> Self {
        Self::new(
            gateway,
            Arc::new(TracingDiagnostics::from(config)),
            Flags::from(config),
        )
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    /// A fresh statement builder for `name`.
    pub fn collection(&self, name: impl Into<String>) -> Collection {
        Collection::new(
            self.gateway.clone(),
            self.diagnostics.clone(),
            self.flags,
            name,
        )
    }

    /// Map a field type to a PostgreSQL column type.
    pub fn convert_type(&self, ty: &FieldType) -> DbsResult<String> {
        let wide = self.flags.ids_as_big_int;
        let sql = match &ty.kind {
            FieldKind::Int => "integer".to_string(),
            FieldKind::Id => match (wide, ty.auto) {
                (true, true) => "bigserial".to_string(),
                (true, false) => "bigint".to_string(),
                (false, true) => "serial".to_string(),
                (false, false) => "integer".to_string(),
            },
            FieldKind::Bool => "boolean".to_string(),
            FieldKind::Float => "double precision".to_string(),
            FieldKind::Text => match ty.max_length {
                Some(n) if n > 0 => format!("varchar({})", n),
                _ => "text".to_string(),
            },
            FieldKind::Time | FieldKind::BigInt => "bigint".to_string(),
            FieldKind::Array(inner) => match inner.as_ref() {
                FieldKind::Time | FieldKind::BigInt => "bigint[]".to_string(),
                FieldKind::Int => "integer[]".to_string(),
                FieldKind::Id if wide => "bigint[]".to_string(),
                FieldKind::Id => "integer[]".to_string(),
                _ => return Err(DbsError::UnknownType(ty.to_string())),
            },
        };
        Ok(sql)
    }

    /// Build the `CREATE TABLE` statement issued by
    /// [`create_collection`](Self::create_collection).
    ///
    /// Constraints are named `{table}_{index}_{pkey|u|fkey}`, with `{prefix}_`
    /// in front when a prefix is given.
    pub fn create_table_sql(
        &self,
        name: &str,
        indexes: &[Index],
        fields: &[FieldDef],
        prefix: Option<&str>,
    ) -> String {
        let prefix = prefix
            .filter(|p| !p.is_empty())
            .map(|p| format!("{}_", p))
            .unwrap_or_default();
        let constraint = |index: &str, suffix: &str| {
            quote_identifier(&format!("{}{}_{}_{}", prefix, name, index, suffix))
        };

        let mut defs: Vec<String> = fields
            .iter()
            .map(|f| {
                let mut def = format!("{} {}", quote_identifier(&f.name), f.sql_type);
                if f.not_null {
                    def.push_str(" NOT NULL");
                }
                if let Some(default) = &f.default {
                    def.push_str(" DEFAULT ");
                    def.push_str(default);
                }
                def
            })
            .collect();

        for index in indexes {
            if let IndexKind::PrimaryKey(keys) = &index.kind {
                let cols: Vec<String> = keys.iter().map(|k| quote_identifier(k)).collect();
                defs.push(format!(
                    "CONSTRAINT {} PRIMARY KEY ({})",
                    constraint(&index.name, "pkey"),
                    cols.join(",")
                ));
            }
        }
        for index in indexes {
            if index.kind == IndexKind::Unique {
                defs.push(format!(
                    "CONSTRAINT {} UNIQUE ({})",
                    constraint(&index.name, "u"),
                    quote_identifier(&index.name)
                ));
            }
        }
        for index in indexes {
            if let IndexKind::Foreign { table, field } = &index.kind {
                defs.push(format!(
                    "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) MATCH SIMPLE",
                    constraint(&index.name, "fkey"),
                    quote_identifier(&index.name),
                    quote_identifier(table),
                    quote_identifier(field)
                ));
            }
        }

        format!(
            "CREATE TABLE {} ({}) WITH (OIDS = FALSE)",
            quote_identifier(name),
            defs.join(", ")
        )
    }

    /// Create a table with the given columns and constraints.
    pub async fn create_collection(
        &self,
        name: &str,
        indexes: &[Index],
        fields: &[FieldDef],
        prefix: Option<&str>,
    ) -> DbsResult<()> {
        let sql = self.create_table_sql(name, indexes, fields, prefix);
        self.execute_logged("Error in createCollection:", &sql, &[]).await?;
        tracing::debug!("Created table {}", name);
        Ok(())
    }

    /// Run arbitrary SQL. Failures are logged and returned unchanged.
    pub async fn raw(&self, sql: &str, params: &[Value]) -> DbsResult<QueryResult> {
        self.execute_logged("Error in dbs.raw", sql, params).await
    }

    /// Close every pooled connection.
    pub async fn shutdown(&self) {
        self.gateway.end().await;
    }

    async fn execute_logged(&self, message: &str, sql: &str, params: &[Value]) -> DbsResult<QueryResult> {
        self.gateway.execute(sql, params).await.map_err(|e| {
            self.diagnostics.statement_failed(message, sql, params, &e);
            DbsError::from(e)
        })
    }
}

impl std::fmt::Debug for Dbs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dbs").field("flags", &self.flags).finish_non_exhaustive()
    }
}
