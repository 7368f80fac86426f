//! Single-row entity hook with optimistic writes.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use super::cell::{HookCell, PayloadOutcome, ShapeOps};
use super::key::EntityKey;
use super::patch::{self, Patch};
use super::registry::Unmount;
use super::state::CachedEntity;
use super::{Entity, HookOptions, SyncContext};
use crate::errors::{StoreError, SyncError};
use crate::store::{ChangeEvent, ChangeKind, RemoteStore, Row};

/// Client-side cache of one row, scoped to an [`EntityKey`].
///
/// Writes are optimistic: the cache changes synchronously, the store is
/// called afterwards, and the result either replaces the cache with the
/// server row or rolls it back by reloading. Every failure is returned and
/// mirrored into `state().error`.
pub struct EntityHook<T: Entity> {
    cell: Arc<HookCell<T>>,
}

impl<T: Entity> EntityHook<T> {
    /// Build a hook without touching the store.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        key: Option<EntityKey>,
        ctx: SyncContext,
        options: HookOptions,
    ) -> Self {
        let ops = ShapeOps {
            from_rows: first_row::<T>,
            apply_change: apply_change::<T>,
        };
        Self {
            cell: HookCell::new(store, key, ctx, options, ops),
        }
    }

    /// Build a hook and, when `key` is set, subscribe and load.
    pub async fn mount(
        store: Arc<dyn RemoteStore>,
        key: Option<EntityKey>,
        ctx: SyncContext,
        options: HookOptions,
    ) -> Arc<Self> {
        let hook = Arc::new(Self::new(store, key, ctx, options));
        if hook.key().is_some()
            && let Err(err) = hook.cell.activate().await
        {
            tracing::debug!(error = %err, "initial load failed");
        }
        hook
    }

    /// Mount on the row of `T::TABLE` with primary key `id`.
    pub async fn mount_by_id(
        store: Arc<dyn RemoteStore>,
        id: Option<&str>,
        ctx: SyncContext,
        options: HookOptions,
    ) -> Arc<Self> {
        let key = id.map(|id| EntityKey::by_id(T::TABLE, id));
        Self::mount(store, key, ctx, options).await
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.cell.key()
    }

    pub fn state(&self) -> CachedEntity<T> {
        self.cell.snapshot()
    }

    pub fn data(&self) -> Option<T> {
        self.cell.data()
    }

    /// Observe every state transition, optimistic ones included.
    pub fn watch(&self) -> watch::Receiver<CachedEntity<T>> {
        self.cell.watch()
    }

    pub fn is_subscribed(&self) -> bool {
        self.cell.is_subscribed()
    }

    pub fn is_mounted(&self) -> bool {
        self.cell.is_mounted()
    }

    pub async fn load(&self) -> Result<Option<T>, SyncError> {
        self.cell.load().await
    }

    /// Switch to another key (or none). The previous subscription is closed
    /// before the new one opens.
    pub async fn set_key(&self, key: Option<EntityKey>) -> Result<Option<T>, SyncError> {
        self.cell.set_key(key).await
    }

    /// Merge `patch` into the cached row and write it to the store.
    pub async fn update(&self, patch: Patch) -> Result<T, SyncError> {
        let key = self.cell.require_key()?;
        let current = self.cell.data().ok_or(SyncError::NotReady)?;
        let mut patch = patch;
        stamp_attribution::<T>(self.cell.ctx(), &mut patch);
        let next = self.checked(patch::apply(&current, &patch))?;
        self.check_valid(&next)?;

        self.cell.apply_optimistic(|data| *data = Some(next));
        tracing::debug!(key = %key, fields = patch.len(), "optimistic update applied");

        let id = current.id().to_string();
        let result = self
            .cell
            .options()
            .mutation_retry
            .run("update", || {
                self.cell.store().update(&key.table, &id, patch.clone())
            })
            .await;
        self.settle(Some(key), Some(current), result).await
    }

    /// Insert `value`. On a hook without a key, the server-assigned id
    /// becomes the key once the insert succeeds.
    pub async fn create(&self, value: T) -> Result<T, SyncError> {
        if !self.cell.is_mounted() {
            return Err(SyncError::Unmounted);
        }
        self.check_valid(&value)?;
        let mut row = self.checked(patch::to_row(&value))?;
        stamp_attribution::<T>(self.cell.ctx(), &mut row);
        let optimistic = self.checked(patch::from_row::<T>(row.clone()))?;
        if value.id().is_empty() {
            row.remove("id");
        }

        let key = self.cell.key();
        let previous = self.cell.data();
        self.cell.apply_optimistic(|data| *data = Some(optimistic));

        let result = self
            .cell
            .options()
            .mutation_retry
            .run("create", || self.cell.store().insert(T::TABLE, row.clone()))
            .await;
        self.settle(key, previous, result).await
    }

    /// Delete the cached row.
    pub async fn delete(&self) -> Result<(), SyncError> {
        let key = self.cell.require_key()?;
        let current = self.cell.data().ok_or(SyncError::NotReady)?;
        self.cell.apply_optimistic(|data| *data = None);

        let result = self
            .cell
            .options()
            .mutation_retry
            .run("delete", || self.cell.store().delete(&key.table, current.id()))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                self.cell.roll_back(&key, Some(current), &err).await;
                Err(SyncError::Remote(err))
            }
        }
    }

    /// Stop listening and ignore in-flight responses from now on.
    pub fn unmount(&self) {
        self.cell.unmount();
    }

    async fn settle(
        &self,
        key: Option<EntityKey>,
        previous: Option<T>,
        result: Result<Row, StoreError>,
    ) -> Result<T, SyncError> {
        let row = match (result, &key) {
            (Ok(row), _) => row,
            (Err(err), Some(key)) => {
                self.cell.roll_back(key, previous, &err).await;
                return Err(SyncError::Remote(err));
            }
            (Err(err), None) => {
                self.cell.restore_unkeyed(previous, &err);
                return Err(SyncError::Remote(err));
            }
        };
        let server = match patch::from_row::<T>(row) {
            Ok(server) => server,
            Err(err) => {
                let _ = self.cell.load().await;
                self.cell.record_error(&err);
                return Err(err);
            }
        };
        match key {
            Some(key) => {
                let adopted = server.clone();
                self.cell.reconcile(&key, |data| *data = Some(adopted));
                tracing::info!(key = %key, "reconciled with server row");
            }
            None => {
                let key = EntityKey::by_id(T::TABLE, server.id());
                tracing::info!(key = %key, "created row, key assigned");
                self.cell.adopt_key(key, Some(server.clone()));
            }
        }
        Ok(server)
    }

    fn checked<V>(&self, result: Result<V, SyncError>) -> Result<V, SyncError> {
        result.inspect_err(|err| self.cell.record_error(err))
    }

    fn check_valid(&self, value: &T) -> Result<(), SyncError> {
        let errors = value.validate();
        if errors.is_empty() {
            return Ok(());
        }
        let err = SyncError::Validation(errors);
        self.cell.record_error(&err);
        Err(err)
    }
}

impl<T: Entity> Unmount for EntityHook<T> {
    fn unmount(&self) {
        self.cell.unmount();
    }
}

impl<T: Entity> Drop for EntityHook<T> {
    fn drop(&mut self) {
        self.cell.unmount();
    }
}

/// Write the acting user's id into `T::ATTRIBUTION_FIELD`, if both exist.
pub(crate) fn stamp_attribution<T: Entity>(ctx: &SyncContext, row: &mut Row) {
    if let (Some(field), Some(user_id)) = (T::ATTRIBUTION_FIELD, ctx.user_id()) {
        row.insert(field.to_string(), Value::String(user_id.to_string()));
    }
}

fn first_row<T: Entity>(rows: Vec<Row>) -> Result<Option<T>, SyncError> {
    rows.into_iter().next().map(patch::from_row).transpose()
}

fn apply_change<T: Entity>(
    data: &mut Option<T>,
    key: &EntityKey,
    event: &ChangeEvent,
) -> PayloadOutcome {
    if event.kind == ChangeKind::Delete {
        return match (data.as_ref(), event.row_id()) {
            (Some(current), Some(id)) if current.id() == id => {
                *data = None;
                PayloadOutcome::Applied
            }
            (_, Some(_)) => PayloadOutcome::Ignored,
            (_, None) => PayloadOutcome::NeedsReload,
        };
    }
    let Some(value) = patch::decode_complete(data.as_ref(), &event.row) else {
        return PayloadOutcome::NeedsReload;
    };
    if key.matches(event) {
        *data = Some(value);
        PayloadOutcome::Applied
    } else if data.as_ref().is_some_and(|current| current.id() == value.id()) {
        // The row moved out of this key.
        *data = None;
        PayloadOutcome::Applied
    } else {
        PayloadOutcome::Ignored
    }
}
