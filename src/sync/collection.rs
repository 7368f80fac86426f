//! Row-set hook: every row of a table matching one key (the attachments of a
//! card, the tasks of a card, a user's inbox).

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use super::cell::{HookCell, PayloadOutcome, ShapeOps};
use super::entity::stamp_attribution;
use super::key::EntityKey;
use super::patch::{self, Patch};
use super::registry::Unmount;
use super::state::CachedEntity;
use super::{Entity, HookOptions, SyncContext};
use crate::errors::SyncError;
use crate::store::{ChangeEvent, ChangeKind, Filter, RemoteStore, Row};

/// Cached list of rows with the same optimistic contract as
/// [`EntityHook`](super::EntityHook), addressed by row id.
pub struct CollectionHook<T: Entity> {
    cell: Arc<HookCell<Vec<T>>>,
}

impl<T: Entity> CollectionHook<T> {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        key: Option<EntityKey>,
        ctx: SyncContext,
        options: HookOptions,
    ) -> Self {
        let ops = ShapeOps {
            from_rows: all_rows::<T>,
            apply_change: apply_change::<T>,
        };
        Self {
            cell: HookCell::new(store, key, ctx, options, ops),
        }
    }

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

    /// Mount on the rows of `T::TABLE` whose `column` equals `value`.
    pub async fn mount_for(
        store: Arc<dyn RemoteStore>,
        column: &str,
        value: Option<&str>,
        ctx: SyncContext,
        options: HookOptions,
    ) -> Arc<Self> {
        let key = value.map(|v| EntityKey::by_column(T::TABLE, column, v));
        Self::mount(store, key, ctx, options).await
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.cell.key()
    }

    pub fn state(&self) -> CachedEntity<Vec<T>> {
        self.cell.snapshot()
    }

    pub fn data(&self) -> Option<Vec<T>> {
        self.cell.data()
    }

    /// The cached rows, or an empty list before the first load.
    pub fn items(&self) -> Vec<T> {
        self.cell.data().unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.items().into_iter().find(|item| item.id() == id)
    }

    pub fn watch(&self) -> watch::Receiver<CachedEntity<Vec<T>>> {
        self.cell.watch()
    }

    pub fn is_subscribed(&self) -> bool {
        self.cell.is_subscribed()
    }

    pub fn is_mounted(&self) -> bool {
        self.cell.is_mounted()
    }

    pub async fn load(&self) -> Result<Option<Vec<T>>, SyncError> {
        self.cell.load().await
    }

    pub async fn set_key(&self, key: Option<EntityKey>) -> Result<Option<Vec<T>>, SyncError> {
        self.cell.set_key(key).await
    }

    /// Append `value` locally, then insert it. A missing id is replaced by a
    /// client-generated UUID so the optimistic row and the stored row share
    /// an identity. A null or empty key column is filled from the key.
    pub async fn create(&self, value: T) -> Result<T, SyncError> {
        let key = self.cell.require_key()?;
        let mut row = self.checked(patch::to_row(&value))?;
        if value.id().is_empty() {
            row.insert(
                "id".into(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
        if let Filter::Eq {
            column,
            value: scope,
        } = &key.filter
            && row
                .get(column)
                .is_some_and(|v| v.is_null() || v.as_str() == Some(""))
        {
            row.insert(column.clone(), Value::String(scope.clone()));
        }
        stamp_attribution::<T>(self.cell.ctx(), &mut row);
        let optimistic: T = self.checked(patch::from_row(row.clone()))?;
        self.check_valid(&optimistic)?;

        let previous = self.cell.data();
        let id = optimistic.id().to_string();
        self.cell.apply_optimistic(|data| {
            data.get_or_insert_with(Vec::new).push(optimistic);
        });
        tracing::debug!(key = %key, id = %id, "optimistic insert applied");

        let result = self
            .cell
            .options()
            .mutation_retry
            .run("create", || self.cell.store().insert(&key.table, row.clone()))
            .await;
        match result {
            Ok(row) => self.adopt(&key, &id, row).await,
            Err(err) => {
                self.cell.roll_back(&key, previous, &err).await;
                Err(SyncError::Remote(err))
            }
        }
    }

    /// Merge `patch` into row `id`, locally first.
    pub async fn update(&self, id: &str, patch: Patch) -> Result<T, SyncError> {
        let key = self.cell.require_key()?;
        let previous = self.cell.data().ok_or(SyncError::NotReady)?;
        let current = previous
            .iter()
            .find(|item| item.id() == id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownRow { id: id.to_string() })?;
        let mut patch = patch;
        stamp_attribution::<T>(self.cell.ctx(), &mut patch);
        let next = self.checked(patch::apply(&current, &patch))?;
        self.check_valid(&next)?;

        self.cell.apply_optimistic(|data| {
            if let Some(slot) = data
                .as_mut()
                .and_then(|items| items.iter_mut().find(|item| item.id() == id))
            {
                *slot = next;
            }
        });

        let result = self
            .cell
            .options()
            .mutation_retry
            .run("update", || {
                self.cell.store().update(&key.table, id, patch.clone())
            })
            .await;
        match result {
            Ok(row) => self.adopt(&key, id, row).await,
            Err(err) => {
                self.cell.roll_back(&key, Some(previous), &err).await;
                Err(SyncError::Remote(err))
            }
        }
    }

    /// Remove row `id` locally, then delete it.
    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        let key = self.cell.require_key()?;
        let previous = self.cell.data().ok_or(SyncError::NotReady)?;
        if !previous.iter().any(|item| item.id() == id) {
            return Err(SyncError::UnknownRow { id: id.to_string() });
        }
        self.cell.apply_optimistic(|data| {
            if let Some(items) = data.as_mut() {
                items.retain(|item| item.id() != id);
            }
        });

        let result = self
            .cell
            .options()
            .mutation_retry
            .run("delete", || self.cell.store().delete(&key.table, id))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                self.cell.roll_back(&key, Some(previous), &err).await;
                Err(SyncError::Remote(err))
            }
        }
    }

    pub fn unmount(&self) {
        self.cell.unmount();
    }

    /// Replace the optimistic row `id` with the server's version.
    async fn adopt(&self, key: &EntityKey, id: &str, row: Row) -> Result<T, SyncError> {
        let server: T = match patch::from_row(row) {
            Ok(server) => server,
            Err(err) => {
                let _ = self.cell.load().await;
                self.cell.record_error(&err);
                return Err(err);
            }
        };
        let adopted = server.clone();
        self.cell.reconcile(key, |data| {
            let items = data.get_or_insert_with(Vec::new);
            match items.iter_mut().find(|item| item.id() == id) {
                Some(slot) => *slot = adopted,
                None => items.push(adopted),
            }
        });
        tracing::info!(key = %key, id, "reconciled with server row");
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

impl<T: Entity> Unmount for CollectionHook<T> {
    fn unmount(&self) {
        self.cell.unmount();
    }
}

impl<T: Entity> Drop for CollectionHook<T> {
    fn drop(&mut self) {
        self.cell.unmount();
    }
}

fn all_rows<T: Entity>(rows: Vec<Row>) -> Result<Option<Vec<T>>, SyncError> {
    rows.into_iter()
        .map(patch::from_row)
        .collect::<Result<Vec<T>, _>>()
        .map(Some)
}

fn apply_change<T: Entity>(
    data: &mut Option<Vec<T>>,
    key: &EntityKey,
    event: &ChangeEvent,
) -> PayloadOutcome {
    let Some(id) = event.row_id() else {
        return PayloadOutcome::NeedsReload;
    };
    let Some(items) = data.as_mut() else {
        return PayloadOutcome::NeedsReload;
    };
    let position = items.iter().position(|item| item.id() == id);

    if event.kind == ChangeKind::Delete {
        return match position {
            Some(p) => {
                items.remove(p);
                PayloadOutcome::Applied
            }
            None => PayloadOutcome::Ignored,
        };
    }

    let reference = position.map(|p| &items[p]).or(items.first());
    let Some(value) = patch::decode_complete(reference, &event.row) else {
        return PayloadOutcome::NeedsReload;
    };
    match (key.matches(event), position) {
        (true, Some(p)) => items[p] = value,
        (true, None) => items.push(value),
        (false, Some(p)) => {
            items.remove(p);
        }
        (false, None) => return PayloadOutcome::Ignored,
    }
    PayloadOutcome::Applied
}
