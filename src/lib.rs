//! # pgdbs: collection-style data access for PostgreSQL
//!
//! pgdbs turns filter maps into parameterized SQL, runs them through a
//! pooled connection and translates constraint failures into typed errors.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use pgdbs::prelude::*;
//! use serde_json::json;
//!
//! let config = Config::load("config.toml")?;
//! let dbs = pgdbs::connect(&config).await?;
//!
//! let rows = dbs
//!     .collection("users")
//!     .find(&Filter::from_json(json!({ "age": { "op": "gt", "val": 30 } }))?)?
//!     .to_array()
//!     .await?;
//! // SELECT * FROM "users" WHERE "age" > $1
//! ```
//!
//! ## Operators
//!
//! | Tag    | SQL                         |
//! |--------|-----------------------------|
//! | `eq`   | `"k" = $1` (also the default for plain values) |
//! | `any`  | `$1 = ANY("k")`             |
//! | `in`   | `"k" IN ($1,$2)`, `FALSE` when empty |
//! | `lt` `lte` `gt` `gte` | comparisons  |
//! | `like` | `"k" LIKE $1`               |
//! | `of`   | `"k"->$1->>$2 = $3`         |
//! | `and`  | sub-operators joined by `AND` |

pub mod collection;
pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod filter;
pub mod gateway;
pub mod schema;

pub mod prelude {
    pub use crate::collection::{Collection, Cursor, FindOptions};
    pub use crate::config::{Config, LogMode, PgConfig};
    pub use crate::diagnostics::{Diagnostics, Flags, TracingDiagnostics};
    pub use crate::engine::PgGateway;
    pub use crate::error::*;
    pub use crate::filter::{Condition, Direction, Filter, Operator, Order};
    pub use crate::gateway::{Gateway, QueryResult, Row};
    pub use crate::schema::{Dbs, FieldDef, FieldKind, FieldType, Index, IndexKind};
}

use std::sync::Arc;

/// Connect to the engine selected by `config`.
///
/// To observe connection failures after start-up, build a
/// [`PgGateway`](engine::PgGateway) with an
/// [`on_error`](engine::PgGateway::on_error) handler and pass it to
/// [`Dbs::from_config`](schema::Dbs::from_config) instead.
pub async fn connect(config: &config::Config) -> Result<schema::Dbs, error::DbsError> {
    let pg = config.postgresql()?;
    let gateway = engine::PgGateway::connect(pg).await?;
    Ok(schema::Dbs::from_config(Arc::new(gateway), pg))
}
