//! Declarative record filters proposed by the model.
//!
//! The model answers a filter prompt with a JSON list of
//! `{field, op, value}` conditions. Conditions are combined with AND and
//! evaluated here against the snapshot; nothing the model writes is executed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

use crate::datasource::{Record, TableSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Error, Debug)]
#[error("Unusable filter reply: {0}")]
pub struct FilterParseError(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum FilterReply {
    List(Vec<FilterCondition>),
    Wrapped { filters: Vec<FilterCondition> },
}

/// Parse the model's filter reply, tolerating a surrounding code fence.
pub fn parse_filter_reply(reply: &str) -> Result<Vec<FilterCondition>, FilterParseError> {
    let body = strip_code_fence(reply);
    if body.is_empty() {
        return Err(FilterParseError("empty reply".to_string()));
    }
    match serde_json::from_str::<FilterReply>(body) {
        Ok(FilterReply::List(conditions)) | Ok(FilterReply::Wrapped { filters: conditions }) => Ok(conditions),
        Err(e) => Err(FilterParseError(e.to_string())),
    }
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") up to the first newline
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end().trim_end_matches("```").trim()
}

impl FilterCondition {
    pub fn matches(&self, record: &Record) -> bool {
        let Some(actual) = record.get(&self.field) else {
            return self.op == FilterOp::Ne;
        };

        match self.op {
            FilterOp::Eq => values_equal(actual, &self.value),
            FilterOp::Ne => !values_equal(actual, &self.value),
            FilterOp::Contains => match (field_text(actual), field_text(&self.value)) {
                (Some(haystack), Some(needle)) => haystack.to_lowercase().contains(&needle.to_lowercase()),
                _ => false,
            },
            FilterOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(compare(actual, &self.value), Some(Ordering::Greater | Ordering::Equal)),
            FilterOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(compare(actual, &self.value), Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

/// Keep the records matching every condition.
pub fn apply(snapshot: &TableSnapshot, conditions: &[FilterCondition]) -> TableSnapshot {
    snapshot.retain(|record| conditions.iter().all(|c| c.matches(record)))
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    if let (Some(a), Some(b)) = (field_number(actual), field_number(expected)) {
        return a == b;
    }
    match (field_text(actual), field_text(expected)) {
        (Some(a), Some(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
        _ => false,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (field_number(actual), field_number(expected)) {
        return a.partial_cmp(&b);
    }
    // ISO dates and similar sortable strings
    Some(field_text(actual)?.cmp(&field_text(expected)?))
}

/// Flatten a Lark field value to text.
///
/// Text cells arrive either as plain strings or as rich-text segments
/// (`[{"type": "text", "text": "..."}]`); person and option cells carry a
/// `name`, link cells a `text` or `link`.
pub fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(field_text).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(if items.iter().all(|i| i.get("type").is_some()) { "" } else { ", " }))
            }
        }
        Value::Object(map) => ["text", "name", "link", "value"]
            .iter()
            .find_map(|k| map.get(*k).and_then(field_text)),
    }
}

fn field_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Array(items) if items.len() == 1 => field_number(&items[0]),
        Value::Object(map) => map.get("value").and_then(field_number),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> TableSnapshot {
        let rows = vec![
            json!({"Name": "Alice", "Region": [{"type": "text", "text": "North"}], "Sales": 120}),
            json!({"Name": "Bob", "Region": [{"type": "text", "text": "South"}], "Sales": "80"}),
            json!({"Name": "Carol", "Owner": [{"name": "Dan", "id": "ou_1"}], "Sales": 200}),
        ];
        TableSnapshot::from_records(rows.into_iter().filter_map(|v| v.as_object().cloned()))
    }

    fn names(snapshot: &TableSnapshot) -> Vec<String> {
        snapshot
            .records()
            .iter()
            .filter_map(|r| r.get("Name").and_then(field_text))
            .collect()
    }

    #[test]
    fn test_parse_fenced_and_wrapped_replies() {
        let fenced = "```json\n[{\"field\": \"Sales\", \"op\": \"gt\", \"value\": 100}]\n```";
        let parsed = parse_filter_reply(fenced).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].op, FilterOp::Gt);

        let wrapped = r#"{"filters": [{"field": "Name", "op": "eq", "value": "bob"}]}"#;
        assert_eq!(parse_filter_reply(wrapped).unwrap()[0].field, "Name");

        assert!(parse_filter_reply("[]").unwrap().is_empty());
        assert!(parse_filter_reply("records.filter(r => r.Sales > 100)").is_err());
        assert!(parse_filter_reply(r#"[{"field": "x", "op": "like", "value": 1}]"#).is_err());
    }

    #[test]
    fn test_numeric_comparisons_accept_string_numbers() {
        let cond = FilterCondition {
            field: "Sales".to_string(),
            op: FilterOp::Gte,
            value: json!("100"),
        };
        assert_eq!(names(&apply(&snapshot(), &[cond])), vec!["Alice", "Carol"]);

        let cond = FilterCondition {
            field: "Sales".to_string(),
            op: FilterOp::Lt,
            value: json!(100),
        };
        assert_eq!(names(&apply(&snapshot(), &[cond])), vec!["Bob"]);
    }

    #[test]
    fn test_text_ops_flatten_rich_values() {
        let eq = FilterCondition {
            field: "Region".to_string(),
            op: FilterOp::Eq,
            value: json!("north"),
        };
        assert_eq!(names(&apply(&snapshot(), &[eq])), vec!["Alice"]);

        let contains = FilterCondition {
            field: "Owner".to_string(),
            op: FilterOp::Contains,
            value: json!("da"),
        };
        assert_eq!(names(&apply(&snapshot(), &[contains])), vec!["Carol"]);
    }

    #[test]
    fn test_missing_field_only_matches_ne() {
        let ne = FilterCondition {
            field: "Region".to_string(),
            op: FilterOp::Ne,
            value: json!("North"),
        };
        assert_eq!(names(&apply(&snapshot(), &[ne])), vec!["Bob", "Carol"]);
    }

    #[test]
    fn test_conditions_are_conjunctive() {
        let conditions = vec![
            FilterCondition {
                field: "Sales".to_string(),
                op: FilterOp::Gt,
                value: json!(50),
            },
            FilterCondition {
                field: "Name".to_string(),
                op: FilterOp::Ne,
                value: json!("alice"),
            },
        ];
        assert_eq!(names(&apply(&snapshot(), &conditions)), vec!["Bob", "Carol"]);
        assert_eq!(apply(&snapshot(), &[]).len(), 3);
    }
}
