use serde::{Deserialize, Serialize};

/// The signed-in user a write is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    pub display_name: String,
}

/// Identity handed to every hook at construction. Hooks never reach for a
/// global "current user"; tests pass whatever actor they need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncContext {
    actor: Option<Actor>,
}

impl SyncContext {
    pub fn new(actor: Actor) -> Self {
        Self { actor: Some(actor) }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn actor(&self) -> Option<&Actor> {
        self.actor.as_ref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.actor.as_ref().map(|a| a.user_id.as_str())
    }
}
