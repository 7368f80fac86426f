use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use super::models::{Card, CardColumn};
use crate::errors::SyncError;
use crate::store::RemoteStore;
use crate::sync::patch::patch;
use crate::sync::{CollectionHook, EntityKey, HookOptions, SyncContext};

/// Distance between neighboring cards when a column is laid out fresh.
pub const POSITION_GAP: i64 = 1024;

/// The kanban board: every card, grouped by column and ordered by position.
pub struct Board {
    hook: Arc<CollectionHook<Card>>,
}

impl Board {
    pub async fn mount(store: Arc<dyn RemoteStore>, ctx: SyncContext, options: HookOptions) -> Self {
        let key = Some(EntityKey::whole_table(<Card as crate::sync::Entity>::TABLE));
        let hook = CollectionHook::mount(store, key, ctx, options).await;
        Self { hook }
    }

    pub fn hook(&self) -> &Arc<CollectionHook<Card>> {
        &self.hook
    }

    /// Cards of `column`, in display order.
    pub fn column(&self, column: CardColumn) -> Vec<Card> {
        let mut cards: Vec<Card> = self
            .hook
            .items()
            .into_iter()
            .filter(|c| c.column == column)
            .collect();
        cards.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        cards
    }

    /// Add a card at the bottom of `column`.
    pub async fn add_card(&self, title: &str, column: CardColumn) -> Result<Card, SyncError> {
        let position = self
            .column(column)
            .last()
            .map_or(POSITION_GAP, |c| c.position + POSITION_GAP);
        self.hook.create(Card::new(title, column, position)).await
    }

    /// Move card `id` to `index` within `to` (clamped to the column length).
    /// Usually one write: the card gets a position between its new
    /// neighbors. Adjacent neighbors leave no room, and the column is
    /// renumbered instead.
    pub async fn move_card(&self, id: &str, to: CardColumn, index: usize) -> Result<Card, SyncError> {
        let card = self
            .hook
            .get(id)
            .ok_or_else(|| SyncError::UnknownRow { id: id.to_string() })?;
        let others: Vec<Card> = self.column(to).into_iter().filter(|c| c.id != id).collect();
        let index = index.min(others.len());
        let before = index.checked_sub(1).and_then(|i| others.get(i)).map(|c| c.position);
        let after = others.get(index).map(|c| c.position);
        let Some(position) = position_between(before, after) else {
            return self.renumber(card, to, others, index).await;
        };

        if card.column == to && card.position == position {
            return Ok(card);
        }
        tracing::debug!(id, from = card.column.as_str(), to = to.as_str(), position, "moving card");
        self.hook
            .update(
                id,
                patch([("column", json!(to.as_str())), ("position", json!(position))]),
            )
            .await
    }

    /// Lay `to` out at `POSITION_GAP` spacing with `card` at `index`. Cards
    /// already at their new position are not written.
    async fn renumber(
        &self,
        card: Card,
        to: CardColumn,
        mut cards: Vec<Card>,
        index: usize,
    ) -> Result<Card, SyncError> {
        let id = card.id.clone();
        cards.insert(index, card);
        tracing::debug!(column = to.as_str(), cards = cards.len(), "renumbering column");

        let mut moved = None;
        for (slot, current) in cards.into_iter().enumerate() {
            let position = (slot as i64 + 1) * POSITION_GAP;
            let placed = if current.column == to && current.position == position {
                current
            } else {
                self.hook
                    .update(
                        &current.id,
                        patch([("column", json!(to.as_str())), ("position", json!(position))]),
                    )
                    .await?
            };
            if placed.id == id {
                moved = Some(placed);
            }
        }
        moved.ok_or(SyncError::UnknownRow { id })
    }

    /// Set or clear the appointment on card `id`.
    pub async fn schedule(&self, id: &str, at: Option<DateTime<Utc>>) -> Result<Card, SyncError> {
        let value = at
            .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::Secs, true)))
            .unwrap_or(Value::Null);
        self.hook.update(id, patch([("scheduled_at", value)])).await
    }

    pub async fn assign(&self, id: &str, assignee_id: Option<&str>) -> Result<Card, SyncError> {
        self.hook
            .update(id, patch([("assignee_id", json!(assignee_id))]))
            .await
    }
}

/// A position strictly between `before` and `after`, or `None` when the
/// two are adjacent and nothing fits between them.
pub fn position_between(before: Option<i64>, after: Option<i64>) -> Option<i64> {
    match (before, after) {
        (None, None) => Some(POSITION_GAP),
        (Some(b), None) => Some(b + POSITION_GAP),
        (None, Some(a)) => Some(a - POSITION_GAP),
        (Some(b), Some(a)) if a - b >= 2 => Some(b + (a - b) / 2),
        (Some(_), Some(_)) => None,
    }
}
