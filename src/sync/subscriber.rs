use std::future::Future;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::key::EntityKey;
use crate::store::{ChangeEvent, RemoteStore};

/// Lifecycle of one realtime subscription.
///
/// `Unsubscribed → Subscribing → Subscribed → Unsubscribed`. Change
/// notifications keep it in `Subscribed`; reconnection is the transport's
/// business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

/// What the subscriber hands to its owner.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A change for a row that may belong to the key.
    Change(ChangeEvent),
    /// Some notifications were dropped; the owner must reload.
    Missed(u64),
}

/// One change-feed subscription scoped to a key.
///
/// The listening task runs until [`close`](Self::close) is called, the
/// handle is dropped, the feed closes, or the handler returns `false`.
/// Notifications are handled one at a time, in arrival order.
pub struct RealtimeSubscriber {
    key: EntityKey,
    state: watch::Sender<SubscriptionState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RealtimeSubscriber {
    /// Subscribe to `key` on `store`, calling `handler` for every matching
    /// notification.
    pub fn open<F, Fut>(store: &dyn RemoteStore, key: EntityKey, handler: F) -> Self
    where
        F: Fn(Notification) -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (state, _) = watch::channel(SubscriptionState::Subscribing);
        let rx = store.changes();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen(
            rx,
            key.clone(),
            state.clone(),
            cancel.clone(),
            handler,
        ));
        tracing::debug!(key = %key, "realtime subscription opened");
        Self {
            key,
            state,
            cancel,
            task: Some(task),
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Stop listening. Idempotent.
    pub fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(key = %self.key, "realtime subscription closed");
        }
        self.state.send_replace(SubscriptionState::Unsubscribed);
    }
}

impl Drop for RealtimeSubscriber {
    fn drop(&mut self) {
        self.close();
    }
}

async fn listen<F, Fut>(
    mut rx: broadcast::Receiver<ChangeEvent>,
    key: EntityKey,
    state: watch::Sender<SubscriptionState>,
    cancel: CancellationToken,
    handler: F,
) where
    F: Fn(Notification) -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    state.send_replace(SubscriptionState::Subscribed);
    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) if key.may_match(&event) => Notification::Change(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(key = %key, missed, "change feed lagged");
                    Notification::Missed(missed)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        if !handler(notification).await {
            break;
        }
    }
    state.send_replace(SubscriptionState::Unsubscribed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeKind;
    use crate::store::mock::MockStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_subscriber_delivers_matching_events_only() {
        let store = MockStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sub = RealtimeSubscriber::open(
            store.as_ref(),
            EntityKey::by_column("tasks", "card_id", "c1"),
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }
            },
        );
        settle().await;
        assert_eq!(sub.state(), SubscriptionState::Subscribed);

        store.emit("tasks", ChangeKind::Insert, json!({"id": "t1", "card_id": "c1"}));
        store.emit("tasks", ChangeKind::Insert, json!({"id": "t2", "card_id": "c2"}));
        store.emit("comments", ChangeKind::Insert, json!({"id": "x", "card_id": "c1"}));
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let store = MockStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let mut sub = RealtimeSubscriber::open(
            store.as_ref(),
            EntityKey::whole_table("tasks"),
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }
            },
        );
        settle().await;
        sub.close();
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);

        store.emit("tasks", ChangeKind::Update, json!({"id": "t1"}));
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_returning_false_ends_subscription() {
        let store = MockStore::new();
        let sub = RealtimeSubscriber::open(
            store.as_ref(),
            EntityKey::whole_table("tasks"),
            |_| async { false },
        );
        let mut state = sub.watch_state();
        settle().await;
        store.emit("tasks", ChangeKind::Delete, json!({"id": "t1"}));
        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == SubscriptionState::Unsubscribed),
        )
        .await
        .expect("subscription should end")
        .unwrap();
    }
}
