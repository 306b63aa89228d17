//! Filter expressions.
//!
//! A [`Filter`] maps field names to either a plain value (implicit equality)
//! or an [`Operator`]. Field order is preserved and decides placeholder
//! numbering when the filter is compiled.
//!
//! Filters can be built in code or parsed from JSON of the form
//! `{ "field": value | { "op": "<tag>", "val": <operand> } }`.

use crate::error::{DbsError, DbsResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A comparison, membership, pattern, JSON-path or composite condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    /// `"k" = $n`
    Eq(Value),
    /// `$n = ANY("k")` on array columns
    Any(Value),
    /// `"k" IN (...)`, `FALSE` when empty
    In(Vec<Value>),
    Lte(Value),
    Lt(Value),
    Gte(Value),
    Gt(Value),
    /// `"k" LIKE $n`
    Like(Value),
    /// JSON path equality: `"k"->$a->>$b = $c`
    Of { path: Vec<Value>, value: Value },
    /// All sub-operators against the same field
    And(Vec<Operator>),
}

impl Operator {
    /// The wire tag of this operator.
    pub fn tag(&self) -> &'static str {
        match self {
            Operator::Eq(_) => "eq",
            Operator::Any(_) => "any",
            Operator::In(_) => "in",
            Operator::Lte(_) => "lte",
            Operator::Lt(_) => "lt",
            Operator::Gte(_) => "gte",
            Operator::Gt(_) => "gt",
            Operator::Like(_) => "like",
            Operator::Of { .. } => "of",
            Operator::And(_) => "and",
        }
    }

    /// Build an operator from its tag and operand.
    pub fn parse(tag: &str, val: Value) -> DbsResult<Self> {
        let op = match tag {
            "eq" => Operator::Eq(val),
            "any" => Operator::Any(val),
            "in" => match val {
                Value::Array(items) => Operator::In(items),
                other => {
                    return Err(DbsError::validation(format!(
                        "operator 'in' requires a list, got {}",
                        other
                    )));
                }
            },
            "lte" => Operator::Lte(val),
            "lt" => Operator::Lt(val),
            "gte" => Operator::Gte(val),
            "gt" => Operator::Gt(val),
            "like" => Operator::Like(val),
            "of" => {
                let Value::Object(mut obj) = val else {
                    return Err(DbsError::validation(
                        "operator 'of' requires { path, value }",
                    ));
                };
                let path = match obj.remove("path") {
                    Some(Value::Array(path)) => path,
                    _ => {
                        return Err(DbsError::validation(
                            "operator 'of' requires a 'path' list",
                        ));
                    }
                };
                let value = obj.remove("value").unwrap_or(Value::Null);
                Operator::Of { path, value }
            }
            "and" => {
                let Value::Array(items) = val else {
                    return Err(DbsError::validation(
                        "operator 'and' requires a list of operators",
                    ));
                };
                let ops = items
                    .into_iter()
                    .map(Operator::from_json)
                    .collect::<DbsResult<Vec<_>>>()?;
                Operator::And(ops)
            }
            other => return Err(DbsError::UnsupportedOperator(other.to_string())),
        };
        Ok(op)
    }

    /// Parse `{ "op": tag, "val": operand }`.
    pub fn from_json(value: Value) -> DbsResult<Self> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(DbsError::validation(format!(
                    "expected an operator object, got {}",
                    other
                )));
            }
        };
        let tag = match obj.remove("op") {
            Some(Value::String(tag)) => tag,
            Some(other) => return Err(DbsError::UnsupportedOperator(other.to_string())),
            None => {
                return Err(DbsError::validation("operator object is missing 'op'"));
            }
        };
        let val = obj.remove("val").unwrap_or(Value::Null);
        Self::parse(&tag, val)
    }
}

/// The right-hand side of one filter entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Implicit equality.
    Value(Value),
    Op(Operator),
}

impl From<Value> for Condition {
    fn from(v: Value) -> Self {
        Condition::Value(v)
    }
}

impl From<Operator> for Condition {
    fn from(op: Operator) -> Self {
        Condition::Op(op)
    }
}

/// Field to condition mapping, combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct Filter {
    entries: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Value(value.into()))
    }

    /// Add an operator condition.
    pub fn op(self, field: impl Into<String>, op: Operator) -> Self {
        self.with(field, Condition::Op(op))
    }

    /// Add a condition. A field that is already present is replaced in place.
    pub fn with(mut self, field: impl Into<String>, cond: impl Into<Condition>) -> Self {
        let field = field.into();
        let cond = cond.into();
        match self.entries.iter_mut().find(|(k, _)| *k == field) {
            Some(entry) => entry.1 = cond,
            None => self.entries.push((field, cond)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.entries.iter().map(|(k, c)| (k.as_str(), c))
    }

    /// Rewrite array values into `In` operators, leaving everything else.
    pub fn arrays_as_in(self) -> Self {
        let entries = self
            .entries
            .into_iter()
            .map(|(k, c)| match c {
                Condition::Value(Value::Array(items)) => (k, Condition::Op(Operator::In(items))),
                other => (k, other),
            })
            .collect();
        Self { entries }
    }

    /// Parse a JSON object filter.
    ///
    /// Objects carrying an `op` key are operators; any other value, arrays
    /// and null included, is matched by equality.
    pub fn from_json(value: Value) -> DbsResult<Self> {
        let obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(DbsError::validation(format!(
                    "filter must be an object, got {}",
                    other
                )));
            }
        };
        let mut filter = Filter::new();
        for (field, val) in obj {
            let cond = match val {
                Value::Object(o) if o.contains_key("op") => {
                    Condition::Op(Operator::from_json(Value::Object(o))?)
                }
                Value::Object(_) => {
                    return Err(DbsError::validation(format!(
                        "condition on '{}' is an object without 'op'",
                        field
                    )));
                }
                other => Condition::Value(other),
            };
            filter = filter.with(field, cond);
        }
        Ok(filter)
    }
}

impl TryFrom<Value> for Filter {
    type Error = DbsError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Filter::from_json(value)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Asc,
    Desc,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Asc => write!(f, "ASC"),
            Direction::Desc => write!(f, "DESC"),
        }
    }
}

/// One ORDER BY term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub key: String,
    pub dir: Direction,
}

impl Order {
    pub fn asc(key: impl Into<String>) -> Self {
        Self { key: key.into(), dir: Direction::Asc }
    }

    pub fn desc(key: impl Into<String>) -> Self {
        Self { key: key.into(), dir: Direction::Desc }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_scalar_and_operator() {
        let filter = Filter::from_json(json!({
            "name": "ada",
            "age": { "op": "gt", "val": 30 },
        }))
        .unwrap();

        let entries: Vec<_> = filter.iter().collect();
        assert_eq!(entries[0], ("name", &Condition::Value(json!("ada"))));
        assert_eq!(entries[1], ("age", &Condition::Op(Operator::Gt(json!(30)))));
    }

    #[test]
    fn test_parse_keeps_key_order() {
        let filter = Filter::from_json(json!({ "z": 1, "a": 2, "m": 3 })).unwrap();
        let keys: Vec<_> = filter.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_parse_nested_and() {
        let filter = Filter::from_json(json!({
            "n": { "op": "and", "val": [
                { "op": "gte", "val": 1 },
                { "op": "and", "val": [{ "op": "lt", "val": 9 }] },
            ]},
        }))
        .unwrap();

        let (_, cond) = filter.iter().next().unwrap();
        assert_eq!(
            cond,
            &Condition::Op(Operator::And(vec![
                Operator::Gte(json!(1)),
                Operator::And(vec![Operator::Lt(json!(9))]),
            ]))
        );
    }

    #[test]
    fn test_parse_of() {
        let op = Operator::from_json(json!({
            "op": "of",
            "val": { "path": ["a", "b"], "value": "x" },
        }))
        .unwrap();
        assert_eq!(
            op,
            Operator::Of { path: vec![json!("a"), json!("b")], value: json!("x") }
        );
    }

    #[test]
    fn test_unknown_tag_is_unsupported() {
        let err = Filter::from_json(json!({ "n": { "op": "between", "val": [1, 2] } }))
            .unwrap_err();
        assert!(matches!(err, DbsError::UnsupportedOperator(ref op) if op == "between"));

        let err = Operator::from_json(json!({ "op": "and", "val": [{ "op": "ne", "val": 1 }] }))
            .unwrap_err();
        assert!(matches!(err, DbsError::UnsupportedOperator(ref op) if op == "ne"));
    }

    #[test]
    fn test_malformed_operands() {
        assert!(matches!(
            Operator::parse("in", json!(5)),
            Err(DbsError::Validation(_))
        ));
        assert!(matches!(
            Operator::parse("of", json!(["a"])),
            Err(DbsError::Validation(_))
        ));
        assert!(matches!(
            Filter::from_json(json!({ "n": { "val": 1 } })),
            Err(DbsError::Validation(_))
        ));
        assert!(matches!(Filter::from_json(json!([1])), Err(DbsError::Validation(_))));
    }

    #[test]
    fn test_arrays_as_in() {
        let filter = Filter::new().eq("id", json!([1, 2])).eq("kind", "a").arrays_as_in();
        let conds: Vec<_> = filter.iter().map(|(_, c)| c.clone()).collect();
        assert_eq!(
            conds,
            vec![
                Condition::Op(Operator::In(vec![json!(1), json!(2)])),
                Condition::Value(json!("a")),
            ]
        );
    }

    #[test]
    fn test_with_replaces_existing_field() {
        let filter = Filter::new().eq("n", 1).eq("m", 2).eq("n", 3);
        let entries: Vec<_> = filter.iter().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("n", &Condition::Value(json!(3))));
    }

    #[test]
    fn test_deserialize_filter_and_order() {
        let filter: Filter = serde_json::from_str(r#"{"id": {"op": "in", "val": [1]}}"#).unwrap();
        assert_eq!(filter.len(), 1);

        let order: Vec<Order> =
            serde_json::from_str(r#"[{"key": "n", "dir": "DESC"}, {"key": "id", "dir": "ASC"}]"#)
                .unwrap();
        assert_eq!(order, vec![Order::desc("n"), Order::asc("id")]);
    }
}
