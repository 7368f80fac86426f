use serde::Serialize;

use super::key::EntityKey;

/// Whether the backing table exists. An unprovisioned optional table turns
/// the feature off instead of surfacing an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    #[default]
    Available,
    Unavailable,
}

/// Client-side snapshot of one entity (or entity set) scoped to a key.
///
/// `data` survives failed reloads: a read error sets `error` and leaves the
/// previous value in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedEntity<S> {
    pub key: Option<EntityKey>,
    pub data: Option<S>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub availability: Availability,
}

impl<S> CachedEntity<S> {
    pub fn new(key: Option<EntityKey>) -> Self {
        Self {
            key,
            data: None,
            is_loading: false,
            error: None,
            availability: Availability::Available,
        }
    }

    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }
}

impl<S> Default for CachedEntity<S> {
    fn default() -> Self {
        Self::new(None)
    }
}
