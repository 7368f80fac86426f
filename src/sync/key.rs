use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::{ChangeEvent, Filter};

/// Identifies one cached record or record set: a table plus the filter that
/// scopes it (one applicant id, every task of one card, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub table: String,
    pub filter: Filter,
}

impl EntityKey {
    /// Key for a single row addressed by primary key.
    pub fn by_id(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Filter::eq("id", id),
        }
    }

    /// Key for the rows of `table` whose `column` equals `value`.
    pub fn by_column(
        table: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            filter: Filter::eq(column, value),
        }
    }

    pub fn whole_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Filter::All,
        }
    }

    /// Whether a change event concerns the rows this key scopes.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.table == self.table && self.filter.matches(&event.row)
    }

    /// Whether a change event might concern this key. Partial payloads that
    /// lack the filter column cannot be ruled out and count as a match.
    pub fn may_match(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        match &self.filter {
            Filter::All => true,
            Filter::Eq { column, .. } => {
                !event.row.contains_key(column) || self.filter.matches(&event.row)
            }
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Filter::All => write!(f, "{}", self.table),
            Filter::Eq { column, value } => write!(f, "{}[{}={}]", self.table, column, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeKind;
    use serde_json::json;

    fn event(table: &str, row: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            table: table.into(),
            kind: ChangeKind::Update,
            row: row.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_key_matches_same_table_and_value() {
        let key = EntityKey::by_column("tasks", "card_id", "c1");
        assert!(key.matches(&event("tasks", json!({"id": "t", "card_id": "c1"}))));
        assert!(!key.matches(&event("tasks", json!({"id": "t", "card_id": "c2"}))));
        assert!(!key.matches(&event("comments", json!({"id": "t", "card_id": "c1"}))));
    }

    #[test]
    fn test_may_match_accepts_partial_payloads() {
        let key = EntityKey::by_column("tasks", "card_id", "c1");
        assert!(key.may_match(&event("tasks", json!({"id": "t"}))));
        assert!(!key.may_match(&event("tasks", json!({"id": "t", "card_id": "c9"}))));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            EntityKey::by_id("applicants", "a1").to_string(),
            "applicants[id=a1]"
        );
        assert_eq!(EntityKey::whole_table("cards").to_string(), "cards");
    }
}
