//! Remote store contract.
//!
//! The sync layer never talks to a database directly; it goes through
//! [`RemoteStore`], which models a hosted relational backend: row CRUD
//! filtered by key, a change feed, and (separately, in [`blob`]) file blobs
//! with signed URLs. [`sqlite::SqliteStore`] is the reference implementation
//! used by the `serve` command and the tests.

pub mod blob;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::errors::StoreError;

/// One row, as the store sees it: a flat JSON object.
pub type Row = Map<String, Value>;

/// Row read filter. Only equality on a single column is needed by the hooks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Filter {
    All,
    Eq { column: String, value: String },
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether `row` satisfies this filter. Non-string values are compared
    /// by their JSON text so numeric ids still match.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { column, value } => match row.get(column) {
                Some(Value::String(s)) => s == value,
                Some(Value::Null) | None => false,
                Some(other) => other.to_string() == *value,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change notification pushed by the store after any committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    /// The row after the write, or the removed row for deletes. Stores may
    /// send a partial row (id plus changed columns only).
    pub row: Row,
}

impl ChangeEvent {
    pub fn row_id(&self) -> Option<&str> {
        self.row.get("id").and_then(Value::as_str)
    }
}

/// Row-level access to the hosted database.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Rows of `table` matching `filter`. An empty result is "not found".
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError>;

    /// Insert a row; returns it with server defaults applied.
    async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError>;

    /// Shallow-merge `patch` into row `id`; returns the resulting row.
    async fn update(&self, table: &str, id: &str, patch: Row) -> Result<Row, StoreError>;

    /// Delete row `id`; returns the removed row when it existed.
    async fn delete(&self, table: &str, id: &str) -> Result<Option<Row>, StoreError>;

    /// Subscribe to the change feed of every table.
    fn changes(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// Read a string column from a row.
pub fn row_str<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}

#[cfg(test)]
pub(crate) mod mock;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_eq_matches_string_column() {
        let filter = Filter::eq("card_id", "c1");
        assert!(filter.matches(&row(json!({"id": "a", "card_id": "c1"}))));
        assert!(!filter.matches(&row(json!({"id": "a", "card_id": "c2"}))));
        assert!(!filter.matches(&row(json!({"id": "a"}))));
    }

    #[test]
    fn test_filter_eq_matches_numeric_column_by_text() {
        let filter = Filter::eq("position", "3");
        assert!(filter.matches(&row(json!({"position": 3}))));
    }

    #[test]
    fn test_filter_eq_never_matches_null() {
        let filter = Filter::eq("read_at", "null");
        assert!(!filter.matches(&row(json!({"read_at": null}))));
    }

    #[test]
    fn test_filter_all_matches_everything() {
        assert!(Filter::All.matches(&Row::new()));
    }

    #[test]
    fn test_change_event_serialization() {
        let event = ChangeEvent {
            table: "tasks".into(),
            kind: ChangeKind::Update,
            row: row(json!({"id": "t1", "done": true})),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"update\""));
        assert!(json.contains("\"table\":\"tasks\""));
        assert_eq!(event.row_id(), Some("t1"));
    }
}
