//! Optimistic mutation + realtime reconciliation.
//!
//! ## Overview
//!
//! Every entity the UI edits (an applicant record, the attachments of a
//! card, a card's task list, the inbox) is served from a client-side cache
//! scoped to an [`EntityKey`]. Writes land in the cache first and are then
//! sent to the [`RemoteStore`](crate::store::RemoteStore); a change feed
//! subscription keeps the cache honest against writes from anyone else.
//!
//! ```text
//!  UI action ──> EntityHook / CollectionHook ──(1) optimistic apply──> watch channel ──> UI
//!                       │
//!                       │ (2) remote write (RetryPolicy)
//!                       v
//!                 RemoteStore ──ok──> (3a) adopt server row
//!                       │    └─err─> (3b) restore + reload, error recorded
//!                       │
//!                 change feed ──> RealtimeSubscriber ──> patch from payload | reload
//! ```
//!
//! ## Module Map
//!
//! | Module       | Responsibility                                             |
//! |--------------|------------------------------------------------------------|
//! | `key`        | `EntityKey`: table + filter                                |
//! | `state`      | `CachedEntity` snapshot served to consumers                |
//! | `patch`      | shallow merge with field-subset check                      |
//! | `retry`      | `RetryPolicy` shared by loads, mutations and autosave      |
//! | `context`    | `SyncContext`: who is making the change                    |
//! | `cell`       | shared load/subscribe/rollback machinery                   |
//! | `entity`     | `EntityHook<T>`: one row                                   |
//! | `collection` | `CollectionHook<T>`: a row set                             |
//! | `subscriber` | `RealtimeSubscriber`: per-key change subscription          |
//! | `registry`   | `Registry<H>`: one shared hook per key, ref-counted        |
//! | `autosave`   | `DraftAutosave`: debounced draft persistence               |
//! | `uploads`    | `AttachmentUploader`: validated blob upload + row          |

pub mod autosave;
mod cell;
pub mod collection;
pub mod context;
pub mod entity;
pub mod key;
pub mod patch;
pub mod registry;
pub mod retry;
pub mod state;
pub mod subscriber;
pub mod uploads;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::FieldError;

pub use collection::CollectionHook;
pub use context::{Actor, SyncContext};
pub use entity::EntityHook;
pub use key::EntityKey;
pub use patch::Patch;
pub use registry::{Lease, Registry, Unmount};
pub use retry::RetryPolicy;
pub use state::{Availability, CachedEntity};

/// A row type the sync layer can cache.
///
/// Serialization must emit every field (no `skip_serializing_if`): the
/// serialized object doubles as the entity's shape when checking patches.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Backing table.
    const TABLE: &'static str;

    /// Field stamped with the acting user's id on every write, if any.
    const ATTRIBUTION_FIELD: Option<&'static str> = None;

    fn id(&self) -> &str;

    /// Field-level checks run before any write leaves the client.
    fn validate(&self) -> Vec<FieldError> {
        Vec::new()
    }
}

/// How a hook reacts to a change notification for its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Reload from the store on every notification.
    Reload,
    /// Apply self-sufficient payloads directly; reload when the payload is
    /// partial or notifications were missed.
    #[default]
    PatchFromPayload,
}

/// Per-hook behavior knobs.
#[derive(Debug, Clone)]
pub struct HookOptions {
    pub reconcile: ReconcileMode,
    pub load_retry: RetryPolicy,
    pub mutation_retry: RetryPolicy,
    /// Open a realtime subscription while a key is set.
    pub realtime: bool,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            reconcile: ReconcileMode::default(),
            load_retry: RetryPolicy::none(),
            mutation_retry: RetryPolicy::none(),
            realtime: true,
        }
    }
}
