//! Machinery shared by the single-row and row-set hooks: key bookkeeping,
//! load with stale-but-present semantics, the mounted guard, optimistic
//! apply/rollback and the realtime subscription.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;

use super::key::EntityKey;
use super::state::{Availability, CachedEntity};
use super::subscriber::{Notification, RealtimeSubscriber};
use super::{HookOptions, ReconcileMode, SyncContext};
use crate::errors::{StoreError, SyncError};
use crate::store::{ChangeEvent, RemoteStore, Row};

/// Outcome of applying a change payload to the cache.
pub(crate) enum PayloadOutcome {
    /// The payload was self-sufficient and has been applied.
    Applied,
    /// The event does not concern the cached rows.
    Ignored,
    /// The payload is partial; reload.
    NeedsReload,
}

/// How a concrete shape (one row, a row set) converts rows and folds change
/// payloads into its cached value.
pub(crate) struct ShapeOps<S> {
    pub from_rows: fn(Vec<Row>) -> Result<Option<S>, SyncError>,
    pub apply_change: fn(&mut Option<S>, &EntityKey, &ChangeEvent) -> PayloadOutcome,
}

pub(crate) struct HookCell<S> {
    store: Arc<dyn RemoteStore>,
    ctx: SyncContext,
    options: HookOptions,
    ops: ShapeOps<S>,
    state: watch::Sender<CachedEntity<S>>,
    mounted: AtomicBool,
    subscription: Mutex<Option<RealtimeSubscriber>>,
    me: Weak<HookCell<S>>,
}

impl<S> HookCell<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<dyn RemoteStore>,
        key: Option<EntityKey>,
        ctx: SyncContext,
        options: HookOptions,
        ops: ShapeOps<S>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(CachedEntity::new(key));
        Arc::new_cyclic(|me| Self {
            store,
            ctx,
            options,
            ops,
            state,
            mounted: AtomicBool::new(true),
            subscription: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn ctx(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn options(&self) -> &HookOptions {
        &self.options
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.state.borrow().key.clone()
    }

    pub fn snapshot(&self) -> CachedEntity<S> {
        self.state.borrow().clone()
    }

    pub fn data(&self) -> Option<S> {
        self.state.borrow().data.clone()
    }

    pub fn watch(&self) -> watch::Receiver<CachedEntity<S>> {
        self.state.subscribe()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// The key to operate on, or `NotReady`/`Unmounted`.
    pub fn require_key(&self) -> Result<EntityKey, SyncError> {
        if !self.is_mounted() {
            return Err(SyncError::Unmounted);
        }
        self.key().ok_or(SyncError::NotReady)
    }

    /// Whether a response for `key` may still be written to state.
    fn accepts(&self, key: &EntityKey) -> Result<(), SyncError> {
        if !self.is_mounted() {
            tracing::debug!(key = %key, "dropping response for unmounted hook");
            return Err(SyncError::Unmounted);
        }
        if self.key().as_ref() != Some(key) {
            tracing::debug!(key = %key, "dropping response for superseded key");
            return Err(SyncError::Stale);
        }
        Ok(())
    }

    /// Activate the cell for its current key: subscribe, then load.
    pub async fn activate(&self) -> Result<Option<S>, SyncError> {
        let key = self.require_key()?;
        self.subscribe(&key);
        self.load().await
    }

    /// Read the rows for the current key and replace `data` wholesale.
    /// On failure `data` is left untouched and the error is recorded.
    pub async fn load(&self) -> Result<Option<S>, SyncError> {
        let key = self.require_key()?;
        self.state.send_modify(|s| s.is_loading = true);
        tracing::debug!(key = %key, "loading");

        let result = self
            .options
            .load_retry
            .run("load", || self.store.select(&key.table, &key.filter))
            .await;

        self.accepts(&key)?;
        match result.map_err(SyncError::from).and_then(self.ops.from_rows) {
            Ok(data) => {
                self.state.send_modify(|s| {
                    s.data = data.clone();
                    s.is_loading = false;
                    s.error = None;
                    s.availability = Availability::Available;
                });
                Ok(data)
            }
            Err(SyncError::Remote(err)) if err.is_missing_relation() => {
                tracing::info!(key = %key, "backing table is not provisioned, hiding feature");
                self.state.send_modify(|s| {
                    s.is_loading = false;
                    s.error = None;
                    s.availability = Availability::Unavailable;
                });
                Err(SyncError::Remote(err))
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "load failed, keeping previous data");
                self.state.send_modify(|s| {
                    s.is_loading = false;
                    s.error = Some(err.to_string());
                });
                Err(err)
            }
        }
    }

    /// Replace the key: tear down the old subscription, reset the cache,
    /// and (for a new non-null key) subscribe and load.
    pub async fn set_key(&self, key: Option<EntityKey>) -> Result<Option<S>, SyncError> {
        if self.key() == key {
            return Ok(self.data());
        }
        self.close_subscription();
        self.state.send_replace(CachedEntity::new(key.clone()));
        match key {
            Some(_) => self.activate().await,
            None => Ok(None),
        }
    }

    /// Set `data` synchronously before any remote call is issued.
    pub fn apply_optimistic(&self, f: impl FnOnce(&mut Option<S>)) {
        self.state.send_modify(|s| {
            f(&mut s.data);
            s.error = None;
        });
    }

    /// Adopt the value the store returned for a successful write.
    pub fn reconcile(&self, key: &EntityKey, f: impl FnOnce(&mut Option<S>)) {
        if self.accepts(key).is_err() {
            return;
        }
        self.state.send_modify(|s| f(&mut s.data));
    }

    /// Undo an optimistic write: restore the pre-write value, re-read from
    /// the store, then surface the write error.
    pub async fn roll_back(&self, key: &EntityKey, previous: Option<S>, err: &StoreError) {
        if self.accepts(key).is_err() {
            return;
        }
        tracing::warn!(key = %key, error = %err, "write failed, rolling back");
        self.state.send_modify(|s| s.data = previous);
        let _ = self.load().await;
        if self.accepts(key).is_ok() {
            self.state
                .send_modify(|s| s.error = Some(SyncError::Remote(err.clone()).to_string()));
        }
    }

    /// Take on a key handed back by the store (a create on an unkeyed hook)
    /// together with the row it identifies, then start listening.
    pub fn adopt_key(&self, key: EntityKey, data: Option<S>) {
        if !self.is_mounted() || self.key().is_some() {
            return;
        }
        self.state.send_modify(|s| {
            s.key = Some(key.clone());
            s.data = data;
            s.is_loading = false;
            s.error = None;
        });
        self.subscribe(&key);
    }

    /// Rollback for a hook with no key: there is nothing to reload from.
    pub fn restore_unkeyed(&self, previous: Option<S>, err: &StoreError) {
        if !self.is_mounted() || self.key().is_some() {
            return;
        }
        tracing::warn!(error = %err, "create failed, rolling back");
        self.state.send_modify(|s| {
            s.data = previous;
            s.error = Some(SyncError::Remote(err.clone()).to_string());
        });
    }

    /// Record an error without touching `data`.
    pub fn record_error(&self, err: &SyncError) {
        self.state.send_modify(|s| s.error = Some(err.to_string()));
    }

    fn subscribe(&self, key: &EntityKey) {
        if !self.options.realtime {
            return;
        }
        let weak = self.me.clone();
        let subscriber = RealtimeSubscriber::open(self.store.as_ref(), key.clone(), move |n| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(cell) => cell.on_notification(n).await,
                    None => false,
                }
            }
        });
        let previous = self
            .subscription
            .lock()
            .map(|mut slot| slot.replace(subscriber));
        // Drops (and closes) any previous subscription outside the lock.
        drop(previous);
    }

    fn close_subscription(&self) {
        let previous = self.subscription.lock().map(|mut slot| slot.take());
        if let Ok(Some(mut sub)) = previous {
            sub.close();
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    async fn on_notification(&self, notification: Notification) -> bool {
        if !self.is_mounted() {
            return false;
        }
        let Some(key) = self.key() else {
            return true;
        };
        let reload = match (self.options.reconcile, notification) {
            (_, Notification::Missed(_)) => true,
            (ReconcileMode::Reload, Notification::Change(event)) => key.may_match(&event),
            (ReconcileMode::PatchFromPayload, Notification::Change(event)) => {
                let mut outcome = PayloadOutcome::Ignored;
                self.state.send_if_modified(|s| {
                    outcome = (self.ops.apply_change)(&mut s.data, &key, &event);
                    matches!(outcome, PayloadOutcome::Applied)
                });
                match outcome {
                    PayloadOutcome::Applied => {
                        tracing::debug!(key = %key, kind = ?event.kind, "patched cache from change payload");
                        false
                    }
                    PayloadOutcome::Ignored => false,
                    PayloadOutcome::NeedsReload => true,
                }
            }
        };
        if reload {
            let _ = self.load().await;
        }
        true
    }

    /// Stop serving: close the subscription and ignore late responses.
    pub fn unmount(&self) {
        if self.mounted.swap(false, Ordering::SeqCst) {
            self.close_subscription();
            if let Some(key) = self.key() {
                tracing::debug!(key = %key, "hook unmounted");
            }
        }
    }
}
