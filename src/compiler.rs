//! Filter compiler.
//!
//! Turns a [`Filter`] into a SQL predicate with positional `$n`
//! placeholders. Values are collected into a [`ParamContext`] shared by the
//! whole statement, so numbering never restarts mid-statement.

use crate::error::{DbsError, DbsResult};
use crate::filter::{Condition, Filter, Operator};
use serde_json::Value;

/// Context for parameterized statement building.
#[derive(Debug, Default)]
pub struct ParamContext {
    /// Last placeholder number handed out (1-based for `$1`, `$2`, ...)
    pub index: usize,
    /// Collected parameter values in placeholder order
    pub params: Vec<Value>,
}

impl ParamContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value and return the placeholder for it.
    pub fn add_param(&mut self, value: Value) -> String {
        self.index += 1;
        self.params.push(value);
        format!("${}", self.index)
    }

    pub fn into_params(self) -> Vec<Value> {
        self.params
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Compile a filter into a predicate. An empty filter yields `""`.
pub fn compile_filter(filter: &Filter, ctx: &mut ParamContext) -> DbsResult<String> {
    let mut parts = Vec::with_capacity(filter.len());
    for (field, cond) in filter.iter() {
        let part = match cond {
            Condition::Value(v) => compile_operator(field, &Operator::Eq(v.clone()), ctx)?,
            Condition::Op(op) => compile_operator(field, op, ctx)?,
        };
        parts.push(part);
    }
    Ok(parts.join(" AND "))
}

/// Compile a filter into a ` WHERE ...` clause, or `""` when empty.
pub fn compile_where(filter: &Filter, ctx: &mut ParamContext) -> DbsResult<String> {
    let predicate = compile_filter(filter, ctx)?;
    if predicate.is_empty() {
        Ok(String::new())
    } else {
        Ok(format!(" WHERE {}", predicate))
    }
}

/// Compile one operator against `field`.
pub fn compile_operator(field: &str, op: &Operator, ctx: &mut ParamContext) -> DbsResult<String> {
    let col = quote_identifier(field);
    let sql = match op {
        Operator::Eq(v) => format!("{} = {}", col, ctx.add_param(v.clone())),
        Operator::Any(v) => format!("{} = ANY({})", ctx.add_param(v.clone()), col),
        Operator::In(items) => {
            if items.is_empty() {
                return Ok("FALSE".to_string());
            }
            let placeholders: Vec<String> =
                items.iter().map(|v| ctx.add_param(v.clone())).collect();
            format!("{} IN ({})", col, placeholders.join(","))
        }
        Operator::Lte(v) => format!("{} <= {}", col, ctx.add_param(v.clone())),
        Operator::Lt(v) => format!("{} < {}", col, ctx.add_param(v.clone())),
        Operator::Gte(v) => format!("{} >= {}", col, ctx.add_param(v.clone())),
        Operator::Gt(v) => format!("{} > {}", col, ctx.add_param(v.clone())),
        Operator::Like(v) => format!("{} LIKE {}", col, ctx.add_param(v.clone())),
        Operator::Of { path, value } => {
            let Some((last, init)) = path.split_last() else {
                return Err(DbsError::validation(format!(
                    "operator 'of' on '{}' requires at least one path element, got []",
                    field
                )));
            };
            let mut sql = col;
            for step in init {
                sql.push_str("->");
                sql.push_str(&ctx.add_param(step.clone()));
            }
            sql.push_str("->>");
            sql.push_str(&ctx.add_param(last.clone()));
            sql.push_str(" = ");
            sql.push_str(&ctx.add_param(value.clone()));
            sql
        }
        Operator::And(ops) => {
            if ops.is_empty() {
                return Err(DbsError::validation(format!(
                    "operator 'and' on '{}' requires at least one operator, got []",
                    field
                )));
            }
            let parts = ops
                .iter()
                .map(|sub| compile_operator(field, sub, ctx))
                .collect::<DbsResult<Vec<_>>>()?;
            parts.join(" AND ")
        }
    };
    Ok(sql)
}
