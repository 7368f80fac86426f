use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

use super::models::Notification;
use crate::errors::SyncError;
use crate::store::RemoteStore;
use crate::sync::patch::patch;
use crate::sync::{CollectionHook, HookOptions, SyncContext};

/// A user's notification feed: the `notifications` rows addressed to them,
/// kept live through the collection hook.
pub struct Inbox {
    hook: Arc<CollectionHook<Notification>>,
}

impl Inbox {
    pub async fn mount(
        store: Arc<dyn RemoteStore>,
        recipient_id: Option<&str>,
        ctx: SyncContext,
        options: HookOptions,
    ) -> Self {
        let hook =
            CollectionHook::mount_for(store, "recipient_id", recipient_id, ctx, options).await;
        Self { hook }
    }

    pub fn from_hook(hook: Arc<CollectionHook<Notification>>) -> Self {
        Self { hook }
    }

    pub fn hook(&self) -> &Arc<CollectionHook<Notification>> {
        &self.hook
    }

    /// Newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        let mut items = self.hook.items();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items
    }

    pub fn unread(&self) -> Vec<Notification> {
        self.notifications()
            .into_iter()
            .filter(Notification::is_unread)
            .collect()
    }

    pub fn unread_count(&self) -> usize {
        self.hook.items().iter().filter(|n| n.is_unread()).count()
    }

    /// Mark one notification read. Already-read notifications are returned
    /// as they are, without a write.
    pub async fn mark_read(&self, id: &str, now: DateTime<Utc>) -> Result<Notification, SyncError> {
        let current = self
            .hook
            .get(id)
            .ok_or_else(|| SyncError::UnknownRow { id: id.to_string() })?;
        if !current.is_unread() {
            return Ok(current);
        }
        self.hook
            .update(id, patch([("read_at", json!(timestamp(now)))]))
            .await
    }

    /// Mark every unread notification read, one write each. Stops at the
    /// first failure; the ones already written stay read.
    pub async fn mark_all_read(&self, now: DateTime<Utc>) -> Result<usize, SyncError> {
        let unread = self.unread();
        for notification in &unread {
            self.hook
                .update(
                    &notification.id,
                    patch([("read_at", json!(timestamp(now)))]),
                )
                .await?;
        }
        if !unread.is_empty() {
            tracing::info!(count = unread.len(), "inbox marked read");
        }
        Ok(unread.len())
    }

    pub async fn dismiss(&self, id: &str) -> Result<(), SyncError> {
        self.hook.delete(id).await
    }
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}
