//! Shallow, key-by-key patch merging.
//!
//! A patch is a JSON object holding a subset of an entity's fields. Fields
//! are replaced whole; nested objects are not merged. A patch naming a field
//! the entity does not have is rejected before anything is applied, so a
//! patch is never half-applied.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::SyncError;
use crate::store::Row;

pub type Patch = Row;

/// Build a patch from `(field, value)` pairs.
pub fn patch<I, K>(fields: I) -> Patch
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    fields.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Fields of `patch` missing from `shape`, sorted.
pub fn unknown_fields(shape: &Row, patch: &Patch) -> Vec<String> {
    let mut unknown: Vec<String> = patch
        .keys()
        .filter(|k| !shape.contains_key(*k))
        .cloned()
        .collect();
    unknown.sort();
    unknown
}

/// `base` with every field of `patch` replacing its counterpart.
pub fn merge(base: &Row, patch: &Patch) -> Row {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

pub fn to_row<T: Serialize>(value: &T) -> Result<Row, SyncError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(row)) => Ok(row),
        Ok(other) => Err(SyncError::Shape(format!(
            "expected a JSON object, got {}",
            other
        ))),
        Err(e) => Err(SyncError::Shape(e.to_string())),
    }
}

pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T, SyncError> {
    serde_json::from_value(Value::Object(row)).map_err(|e| SyncError::Shape(e.to_string()))
}

/// Decode a change payload only if it carries the whole row. A payload is
/// complete when it deserializes and, given a `reference` value, holds every
/// field the reference serializes to.
pub fn decode_complete<T>(reference: Option<&T>, payload: &Row) -> Option<T>
where
    T: Serialize + DeserializeOwned,
{
    if let Some(reference) = reference {
        let shape = to_row(reference).ok()?;
        if shape.keys().any(|k| !payload.contains_key(k)) {
            return None;
        }
    }
    from_row(payload.clone()).ok()
}

/// Apply `patch` to `current`, rejecting unknown fields.
pub fn apply<T>(current: &T, patch: &Patch) -> Result<T, SyncError>
where
    T: Serialize + DeserializeOwned,
{
    let shape = to_row(current)?;
    let unknown = unknown_fields(&shape, patch);
    if !unknown.is_empty() {
        return Err(SyncError::InvalidPatch { fields: unknown });
    }
    from_row(merge(&shape, patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Contact {
        name: String,
        phone: Option<String>,
        tags: Vec<String>,
    }

    fn contact() -> Contact {
        Contact {
            name: "Ana".into(),
            phone: None,
            tags: vec!["vip".into()],
        }
    }

    #[test]
    fn test_apply_replaces_named_fields_only() {
        let patched = apply(&contact(), &patch([("phone", json!("555"))])).unwrap();
        assert_eq!(patched.phone.as_deref(), Some("555"));
        assert_eq!(patched.name, "Ana");
        assert_eq!(patched.tags, vec!["vip".to_string()]);
    }

    #[test]
    fn test_apply_replaces_collections_whole() {
        let patched = apply(&contact(), &patch([("tags", json!(["new"]))])).unwrap();
        assert_eq!(patched.tags, vec!["new".to_string()]);
    }

    #[test]
    fn test_apply_rejects_unknown_fields_without_applying() {
        let err = apply(
            &contact(),
            &patch([("name", json!("Bia")), ("nickname", json!("B"))]),
        )
        .unwrap_err();
        match err {
            SyncError::InvalidPatch { fields } => assert_eq!(fields, vec!["nickname"]),
            other => panic!("Expected InvalidPatch, got {:?}", other),
        }
    }

    #[test]
    fn test_apply_rejects_wrong_types() {
        let err = apply(&contact(), &patch([("name", json!(42))])).unwrap_err();
        assert!(matches!(err, SyncError::Shape(_)));
    }

    #[test]
    fn test_merge_is_shallow() {
        let base = json!({"meta": {"a": 1, "b": 2}}).as_object().cloned().unwrap();
        let merged = merge(&base, &patch([("meta", json!({"a": 9}))]));
        assert_eq!(merged["meta"], json!({"a": 9}));
    }

    #[test]
    fn test_decode_complete_rejects_partial_payloads() {
        let full = json!({"name": "Bia", "phone": "1", "tags": []});
        let partial = json!({"name": "Bia", "tags": []});
        let reference = contact();
        let decoded: Option<Contact> =
            decode_complete(Some(&reference), full.as_object().unwrap());
        assert_eq!(decoded.map(|c| c.name), Some("Bia".to_string()));
        // `phone` would default to None, but the reference says it is a field.
        let decoded: Option<Contact> =
            decode_complete(Some(&reference), partial.as_object().unwrap());
        assert!(decoded.is_none());
    }

    #[test]
    fn test_to_row_rejects_non_objects() {
        assert!(matches!(to_row(&3), Err(SyncError::Shape(_))));
    }
}
