//! Statement building and execution for one table.
//!
//! A [`Collection`] is created per call by [`Dbs::collection`] and consumed
//! by exactly one terminal operation, so its placeholder numbering can never
//! leak into a second statement.
//!
//! [`Dbs::collection`]: crate::schema::Dbs::collection

use crate::compiler::{ParamContext, compile_where, quote_identifier};
use crate::diagnostics::{Diagnostics, Flags};
use crate::error::{BackendError, DbsError, DbsResult, FOREIGN_KEY_VIOLATION, UNIQUE_VIOLATION};
use crate::filter::{Filter, Order};
use crate::gateway::{Gateway, QueryResult, Row};
use serde_json::Value;
use std::sync::Arc;

/// Maps a SQLSTATE to a domain error, or `None` to pass the error through.
type Classify = fn(&str) -> Option<DbsError>;

fn unclassified(_: &str) -> Option<DbsError> {
    None
}

fn classify_insert(code: &str) -> Option<DbsError> {
    match code {
        UNIQUE_VIOLATION => Some(DbsError::DuplicateKey { action: "insert" }),
        FOREIGN_KEY_VIOLATION => Some(DbsError::ConstraintViolation),
        _ => None,
    }
}

fn classify_update(code: &str) -> Option<DbsError> {
    match code {
        UNIQUE_VIOLATION => Some(DbsError::DuplicateKey { action: "update" }),
        _ => None,
    }
}

fn classify_remove(code: &str) -> Option<DbsError> {
    match code {
        FOREIGN_KEY_VIOLATION => Some(DbsError::ReferentialIntegrity),
        _ => None,
    }
}

/// Execute one statement, translating recognised backend failures.
async fn run_statement(
    gateway: &dyn Gateway,
    diagnostics: &dyn Diagnostics,
    message: &str,
    sql: &str,
    params: &[Value],
    classify: Classify,
) -> DbsResult<QueryResult> {
    let err: BackendError = match gateway.execute(sql, params).await {
        Ok(result) => return Ok(result),
        Err(e) => e,
    };
    if let Some(domain) = err.code().and_then(classify) {
        tracing::debug!(code = ?err.code(), error = %err, "{} {}", message, domain);
        return Err(domain);
    }
    diagnostics.statement_failed(message, sql, params, &err);
    Err(err.into())
}

/// Array cells become JSON text when `array_as_json` is set.
fn encode_cell(flags: Flags, value: &Value) -> Value {
    match value {
        Value::Array(_) if flags.array_as_json => Value::String(value.to_string()),
        other => other.clone(),
    }
}

/// Options for [`Collection::find_with`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// `0` is the same as no limit.
    pub limit: Option<u64>,
    /// Only applied together with a limit.
    pub offset: Option<u64>,
    pub order: Vec<Order>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order_by(mut self, order: Order) -> Self {
        self.order.push(order);
        self
    }
}

/// Statement builder bound to one table.
pub struct Collection {
    gateway: Arc<dyn Gateway>,
    diagnostics: Arc<dyn Diagnostics>,
    flags: Flags,
    table: String,
    ctx: ParamContext,
}

impl Collection {
    pub(crate) fn new(
        gateway: Arc<dyn Gateway>,
        diagnostics: Arc<dyn Diagnostics>,
        flags: Flags,
        table: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            diagnostics,
            flags,
            table: table.into(),
            ctx: ParamContext::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// `SELECT *` with a filter.
    pub fn find(self, filter: &Filter) -> DbsResult<Cursor> {
        self.find_with(filter, FindOptions::default())
    }

    /// `SELECT *` with a filter, ordering and paging.
    pub fn find_with(mut self, filter: &Filter, opts: FindOptions) -> DbsResult<Cursor> {
        let mut sql = format!("SELECT * FROM {}", quote_identifier(&self.table));
        sql.push_str(&compile_where(filter, &mut self.ctx)?);

        if !opts.order.is_empty() {
            let terms: Vec<String> = opts
                .order
                .iter()
                .map(|o| format!("{} {}", quote_identifier(&o.key), o.dir))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }

        if let Some(limit) = opts.limit.filter(|n| *n > 0) {
            sql.push_str(" LIMIT ");
            sql.push_str(&self.ctx.add_param(Value::from(limit)));
            if let Some(offset) = opts.offset.filter(|n| *n > 0) {
                sql.push_str(" OFFSET ");
                sql.push_str(&self.ctx.add_param(Value::from(offset)));
            }
        }

        Ok(Cursor {
            gateway: self.gateway,
            diagnostics: self.diagnostics,
            sql,
            params: self.ctx.into_params(),
        })
    }

    pub fn find_by_id(self, filter: &Filter, opts: FindOptions) -> DbsResult<Cursor> {
        self.find_with(filter, opts)
    }

    /// Like [`find_with`](Self::find_with), but array values match any element.
    pub fn find_by_ids(self, filter: Filter, opts: FindOptions) -> DbsResult<Cursor> {
        self.find_with(&filter.arrays_as_in(), opts)
    }

    /// Insert rows, returning their `id` column.
    pub async fn insert(self, rows: &[Row]) -> DbsResult<Vec<Row>> {
        self.insert_returning(rows, &["id"]).await
    }

    /// Insert rows, returning `returning` columns per row in insertion order.
    ///
    /// Columns come from the first row; every row must have the same keys.
    pub async fn insert_returning(mut self, rows: &[Row], returning: &[&str]) -> DbsResult<Vec<Row>> {
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        if first.is_empty() {
            return Err(DbsError::validation("insert requires at least one column"));
        }
        let keys: Vec<&String> = first.keys().collect();
        let flags = self.flags;

        let mut sql = format!("INSERT INTO {} (", quote_identifier(&self.table));
        let cols: Vec<String> = keys.iter().map(|k| quote_identifier(k)).collect();
        sql.push_str(&cols.join(","));
        sql.push_str(") VALUES ");

        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            let placeholders: Vec<String> = keys
                .iter()
                .map(|k| {
                    let cell = row.get(k.as_str()).unwrap_or(&Value::Null);
                    self.ctx.add_param(encode_cell(flags, cell))
                })
                .collect();
            tuples.push(format!("({})", placeholders.join(",")));
        }
        sql.push_str(&tuples.join(","));

        if !returning.is_empty() {
            let cols: Vec<String> = returning.iter().map(|c| quote_identifier(c)).collect();
            sql.push_str(" RETURNING ");
            sql.push_str(&cols.join(","));
        }

        let result = self.run("Error in insert:", &sql, classify_insert).await?;
        Ok(result.rows)
    }

    /// Update every row matching `filter`, returning the affected row count.
    ///
    /// An empty filter updates the whole table.
    pub async fn update(mut self, filter: &Filter, changes: &Row) -> DbsResult<u64> {
        if changes.is_empty() {
            return Err(DbsError::validation("update requires at least one column to set"));
        }

        let mut sql = format!("UPDATE {} SET ", quote_identifier(&self.table));
        let flags = self.flags;
        let cols: Vec<String> = changes.keys().map(|k| quote_identifier(k)).collect();
        let placeholders: Vec<String> = changes
            .values()
            .map(|v| self.ctx.add_param(encode_cell(flags, v)))
            .collect();
        // Single-column row constructors need ROW(), so one key uses the plain form.
        if cols.len() > 1 {
            sql.push_str(&format!("({}) = ({})", cols.join(","), placeholders.join(",")));
        } else {
            sql.push_str(&format!("{} = {}", cols[0], placeholders[0]));
        }
        sql.push_str(&compile_where(filter, &mut self.ctx)?);

        let result = self.run("Error in update:", &sql, classify_update).await?;
        Ok(result.row_count)
    }

    pub async fn update_one(self, filter: &Filter, changes: &Row) -> DbsResult<u64> {
        self.update(filter, changes).await
    }

    /// Delete every row matching `filter`, returning the affected row count.
    ///
    /// An empty filter deletes the whole table.
    pub async fn remove(mut self, filter: &Filter) -> DbsResult<u64> {
        let mut sql = format!("DELETE FROM {}", quote_identifier(&self.table));
        sql.push_str(&compile_where(filter, &mut self.ctx)?);

        let result = self.run("Error in remove:", &sql, classify_remove).await?;
        Ok(result.row_count)
    }

    /// `DROP TABLE`.
    pub async fn drop(self) -> DbsResult<()> {
        let sql = format!("DROP TABLE {}", quote_identifier(&self.table));
        self.run("Error in drop:", &sql, unclassified).await?;
        Ok(())
    }

    async fn run(&self, message: &str, sql: &str, classify: Classify) -> DbsResult<QueryResult> {
        run_statement(
            self.gateway.as_ref(),
            self.diagnostics.as_ref(),
            message,
            sql,
            &self.ctx.params,
            classify,
        )
        .await
    }
}

/// A compiled `SELECT`, executed by [`to_array`](Cursor::to_array).
pub struct Cursor {
    gateway: Arc<dyn Gateway>,
    diagnostics: Arc<dyn Diagnostics>,
    sql: String,
    params: Vec<Value>,
}

impl Cursor {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Execute and return every matching row.
    pub async fn to_array(self) -> DbsResult<Vec<Row>> {
        let result = run_statement(
            self.gateway.as_ref(),
            self.diagnostics.as_ref(),
            "Error in toArray:",
            &self.sql,
            &self.params,
            unclassified,
        )
        .await?;
        Ok(result.rows)
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("sql", &self.sql)
            .field("params", &self.params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::testing::RecordingDiagnostics;
    use crate::filter::Operator;
    use crate::gateway::testing::{MockGateway, row};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn collection(gateway: &Arc<MockGateway>, flags: Flags) -> (Collection, Arc<RecordingDiagnostics>) {
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let c = Collection::new(gateway.clone(), diagnostics.clone(), flags, "t");
        (c, diagnostics)
    }

    fn plain(gateway: &Arc<MockGateway>) -> Collection {
        collection(gateway, Flags::default()).0
    }

    #[test]
    fn test_find_empty_filter_has_no_where() {
        let gw = Arc::new(MockGateway::new());
        let cursor = plain(&gw).find(&Filter::new()).unwrap();
        assert_eq!(cursor.sql(), r#"SELECT * FROM "t""#);
        assert!(cursor.params().is_empty());
    }

    #[test]
    fn test_find_with_order_limit_offset() {
        let gw = Arc::new(MockGateway::new());
        let opts = FindOptions::new()
            .order_by(Order::desc("n"))
            .order_by(Order::asc("id"))
            .limit(10)
            .offset(20);
        let cursor = plain(&gw)
            .find_with(&Filter::new().op("n", Operator::Gt(json!(50))), opts)
            .unwrap();
        assert_eq!(
            cursor.sql(),
            r#"SELECT * FROM "t" WHERE "n" > $1 ORDER BY "n" DESC, "id" ASC LIMIT $2 OFFSET $3"#
        );
        assert_eq!(cursor.params(), &[json!(50), json!(10), json!(20)]);
    }

    #[test]
    fn test_offset_without_limit_is_ignored() {
        let gw = Arc::new(MockGateway::new());
        let cursor = plain(&gw)
            .find_with(&Filter::new(), FindOptions::new().offset(5))
            .unwrap();
        assert_eq!(cursor.sql(), r#"SELECT * FROM "t""#);

        let cursor = plain(&gw)
            .find_with(&Filter::new(), FindOptions::new().limit(0).offset(5))
            .unwrap();
        assert_eq!(cursor.sql(), r#"SELECT * FROM "t""#);
        assert!(cursor.params().is_empty());
    }

    #[test]
    fn test_find_by_ids_rewrites_arrays() {
        let gw = Arc::new(MockGateway::new());
        let filter = Filter::new().eq("id", json!([1, 2, 3])).eq("kind", "a");
        let cursor = plain(&gw).find_by_ids(filter, FindOptions::new()).unwrap();
        assert_eq!(
            cursor.sql(),
            r#"SELECT * FROM "t" WHERE "id" IN ($1,$2,$3) AND "kind" = $4"#
        );
    }

    #[tokio::test]
    async fn test_to_array_returns_rows() {
        let gw = Arc::new(MockGateway::new().respond_rows(vec![row(json!({ "id": 1, "n": 100 }))]));
        let rows = plain(&gw)
            .find(&Filter::new().op("n", Operator::Gt(json!(50))))
            .unwrap()
            .to_array()
            .await
            .unwrap();
        assert_eq!(rows, vec![row(json!({ "id": 1, "n": 100 }))]);
        assert_eq!(gw.statements()[0].1, vec![json!(50)]);
    }

    #[tokio::test]
    async fn test_to_array_failure_is_logged_and_passed_through() {
        let gw = Arc::new(MockGateway::new().fail("42P01", "relation \"t\" does not exist"));
        let (c, diagnostics) = collection(&gw, Flags::default());
        let err = c.find(&Filter::new()).unwrap().to_array().await.unwrap_err();
        assert_eq!(err.as_backend().and_then(|e| e.code()), Some("42P01"));
        assert_eq!(diagnostics.messages(), vec!["Error in toArray:".to_string()]);
    }

    #[tokio::test]
    async fn test_of_empty_path_never_reaches_backend() {
        let gw = Arc::new(MockGateway::new());
        let filter = Filter::new().op("data", Operator::Of { path: vec![], value: json!(1) });
        let err = plain(&gw).find(&filter).unwrap_err();
        assert!(matches!(err, DbsError::Validation(_)));

        let err = plain(&gw).remove(&filter).await.unwrap_err();
        assert!(matches!(err, DbsError::Validation(_)));
        assert!(gw.statements().is_empty());
    }

    #[tokio::test]
    async fn test_insert_empty_rows_skips_backend() {
        let gw = Arc::new(MockGateway::new());
        let rows = plain(&gw).insert(&[]).await.unwrap();
        assert!(rows.is_empty());
        assert!(gw.statements().is_empty());
    }

    #[tokio::test]
    async fn test_insert_row_major_placeholders() {
        let gw = Arc::new(
            MockGateway::new().respond_rows(vec![row(json!({ "id": 1 })), row(json!({ "id": 2 }))]),
        );
        let ids = plain(&gw)
            .insert(&[row(json!({ "n": 1, "s": "a" })), row(json!({ "n": 7, "s": "b" }))])
            .await
            .unwrap();
        assert_eq!(ids, vec![row(json!({ "id": 1 })), row(json!({ "id": 2 }))]);

        let (sql, params) = gw.statements().remove(0);
        assert_eq!(
            sql,
            r#"INSERT INTO "t" ("n","s") VALUES ($1,$2),($3,$4) RETURNING "id""#
        );
        assert_eq!(params, vec![json!(1), json!("a"), json!(7), json!("b")]);
    }

    #[tokio::test]
    async fn test_insert_returning_columns() {
        let gw = Arc::new(MockGateway::new());
        plain(&gw)
            .insert_returning(&[row(json!({ "n": 1 }))], &["id", "n"])
            .await
            .unwrap();
        assert_eq!(
            gw.last_sql().unwrap(),
            r#"INSERT INTO "t" ("n") VALUES ($1) RETURNING "id","n""#
        );

        plain(&gw).insert_returning(&[row(json!({ "n": 1 }))], &[]).await.unwrap();
        assert_eq!(gw.last_sql().unwrap(), r#"INSERT INTO "t" ("n") VALUES ($1)"#);
    }

    #[tokio::test]
    async fn test_array_cells_native_or_json() {
        let gw = Arc::new(MockGateway::new());
        plain(&gw).insert(&[row(json!({ "tags": [1, 2] }))]).await.unwrap();
        assert_eq!(gw.statements()[0].1, vec![json!([1, 2])]);

        let flags = Flags { array_as_json: true, ..Flags::default() };
        let (c, _) = collection(&gw, flags);
        c.insert(&[row(json!({ "tags": [1, 2] }))]).await.unwrap();
        assert_eq!(gw.statements()[1].1, vec![json!("[1,2]")]);

        let (c, _) = collection(&gw, flags);
        c.update(&Filter::new().eq("id", 1), &row(json!({ "tags": ["x"] })))
            .await
            .unwrap();
        assert_eq!(gw.statements()[2].1, vec![json!(r#"["x"]"#), json!(1)]);
    }

    #[tokio::test]
    async fn test_insert_error_classification() {
        let gw = Arc::new(
            MockGateway::new()
                .fail(UNIQUE_VIOLATION, "duplicate key")
                .fail(FOREIGN_KEY_VIOLATION, "fk")
                .fail("23502", "null value in column"),
        );
        let (c, diagnostics) = collection(&gw, Flags::default());
        let err = c.insert(&[row(json!({ "n": 1 }))]).await.unwrap_err();
        assert!(matches!(err, DbsError::DuplicateKey { action: "insert" }));

        let err = plain(&gw).insert(&[row(json!({ "n": 1 }))]).await.unwrap_err();
        assert!(matches!(err, DbsError::ConstraintViolation));

        let err = plain(&gw).insert(&[row(json!({ "n": 1 }))]).await.unwrap_err();
        assert_eq!(err.as_backend().and_then(|e| e.code()), Some("23502"));

        // classified failures are not reported as diagnostics
        assert!(diagnostics.messages().is_empty());
    }

    #[tokio::test]
    async fn test_update_single_and_multi_key() {
        let gw = Arc::new(MockGateway::new().respond_count(3).respond_count(1));
        let n = plain(&gw)
            .update(&Filter::new().op("n", Operator::Lt(json!(5))), &row(json!({ "flag": true })))
            .await
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(
            gw.statements()[0],
            (
                r#"UPDATE "t" SET "flag" = $1 WHERE "n" < $2"#.to_string(),
                vec![json!(true), json!(5)]
            )
        );

        let n = plain(&gw)
            .update_one(&Filter::new().eq("id", 9), &row(json!({ "a": 1, "b": "x" })))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            gw.statements()[1].0,
            r#"UPDATE "t" SET ("a","b") = ($1,$2) WHERE "id" = $3"#
        );
    }

    #[tokio::test]
    async fn test_update_matching_nothing_is_ok() {
        let gw = Arc::new(MockGateway::new().respond_count(0));
        let n = plain(&gw)
            .update(&Filter::new().eq("id", 404), &row(json!({ "n": 1 })))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_update_empty_filter_touches_every_row() {
        // No WHERE clause: the statement applies to the whole table.
        let gw = Arc::new(MockGateway::new());
        plain(&gw).update(&Filter::new(), &row(json!({ "n": 0 }))).await.unwrap();
        assert_eq!(gw.last_sql().unwrap(), r#"UPDATE "t" SET "n" = $1"#);
    }

    #[tokio::test]
    async fn test_update_requires_changes() {
        let gw = Arc::new(MockGateway::new());
        let err = plain(&gw).update(&Filter::new(), &Row::new()).await.unwrap_err();
        assert!(matches!(err, DbsError::Validation(_)));
        assert!(gw.statements().is_empty());
    }

    #[tokio::test]
    async fn test_update_error_classification() {
        let gw = Arc::new(
            MockGateway::new()
                .fail(UNIQUE_VIOLATION, "duplicate key")
                .fail(FOREIGN_KEY_VIOLATION, "fk"),
        );
        let err = plain(&gw)
            .update(&Filter::new(), &row(json!({ "n": 1 })))
            .await
            .unwrap_err();
        assert!(matches!(err, DbsError::DuplicateKey { action: "update" }));

        let (c, diagnostics) = collection(&gw, Flags::default());
        let err = c.update(&Filter::new(), &row(json!({ "n": 1 }))).await.unwrap_err();
        assert_eq!(err.as_backend().and_then(|e| e.code()), Some(FOREIGN_KEY_VIOLATION));
        assert_eq!(diagnostics.messages(), vec!["Error in update:".to_string()]);
    }

    #[tokio::test]
    async fn test_remove() {
        let gw = Arc::new(MockGateway::new().respond_count(1));
        let n = plain(&gw).remove(&Filter::new().eq("id", 1)).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(gw.last_sql().unwrap(), r#"DELETE FROM "t" WHERE "id" = $1"#);
    }

    #[tokio::test]
    async fn test_remove_empty_filter_deletes_everything() {
        // No WHERE clause: every row goes.
        let gw = Arc::new(MockGateway::new().respond_count(12));
        let n = plain(&gw).remove(&Filter::new()).await.unwrap();
        assert_eq!(n, 12);
        assert_eq!(gw.last_sql().unwrap(), r#"DELETE FROM "t""#);
    }

    #[tokio::test]
    async fn test_remove_with_empty_and_never_runs() {
        let gw = Arc::new(MockGateway::new());
        let filter = Filter::from_json(json!({ "n": { "op": "and", "val": [] } })).unwrap();
        let err = plain(&gw).remove(&filter).await.unwrap_err();
        assert!(matches!(err, DbsError::Validation(_)));
        assert!(gw.statements().is_empty());
    }

    #[tokio::test]
    async fn test_remove_referenced_row() {
        let gw = Arc::new(
            MockGateway::new()
                .fail(FOREIGN_KEY_VIOLATION, "still referenced")
                .fail(UNIQUE_VIOLATION, "odd"),
        );
        let err = plain(&gw).remove(&Filter::new().eq("id", 1)).await.unwrap_err();
        assert!(matches!(err, DbsError::ReferentialIntegrity));
        assert_eq!(err.code(), Some(2));

        let err = plain(&gw).remove(&Filter::new().eq("id", 1)).await.unwrap_err();
        assert!(err.as_backend().is_some());
    }

    #[tokio::test]
    async fn test_drop() {
        let gw = Arc::new(MockGateway::new().fail("42P01", "missing"));
        plain(&gw).drop().await.unwrap_err();
        plain(&gw).drop().await.unwrap();
        assert_eq!(gw.last_sql().unwrap(), r#"DROP TABLE "t""#);
    }

    #[tokio::test]
    async fn test_independent_collections_run_concurrently() {
        let gw = Arc::new(MockGateway::new());
        let first = Filter::new().eq("id", 1);
        let second = Filter::new().eq("id", 2);
        let changes = row(json!({ "n": 5 }));
        let a = plain(&gw).remove(&first);
        let b = plain(&gw).update(&second, &changes);
        let (a, b) = tokio::join!(a, b);
        a.unwrap();
        b.unwrap();

        // each statement numbers its own placeholders from 1
        for (sql, params) in gw.statements() {
            assert!(sql.contains("$1"));
            assert_eq!(sql.matches('$').count(), params.len());
        }
    }
}
