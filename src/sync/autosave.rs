//! Debounced draft persistence.
//!
//! A form pushes its full snapshot on every change. A background worker
//! waits for a quiet period after the last push and writes only the latest
//! snapshot to the `drafts` table, one row per `draft_key`. Dropping the
//! [`DraftAutosave`] cancels a pending write, including one waiting out a
//! retry backoff.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{RetryPolicy, SyncContext};
use crate::errors::{ROW_NOT_FOUND_CODE, StoreError, SyncError};
use crate::store::{Filter, RemoteStore, Row, row_str};

pub const DRAFTS_TABLE: &str = "drafts";

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(800);

#[derive(Debug, Clone)]
pub struct AutosaveOptions {
    /// Quiet period after the last push before writing.
    pub debounce: Duration,
    pub retry: RetryPolicy,
}

impl Default for AutosaveOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            retry: RetryPolicy::exponential(3, Duration::from_millis(250), Duration::from_secs(4)),
        }
    }
}

/// What the form shows next to its save indicator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AutosaveStatus {
    pub is_saving: bool,
    /// A snapshot is waiting for the debounce window to close.
    pub pending: bool,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

type Reply = oneshot::Sender<Result<(), SyncError>>;

enum Command {
    Push(Value),
    Flush(Reply),
    Discard(Reply),
}

pub struct DraftAutosave {
    draft_key: String,
    store: Arc<dyn RemoteStore>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<AutosaveStatus>,
    cancel: CancellationToken,
}

impl DraftAutosave {
    /// Start the background writer for `draft_key`.
    pub fn start(
        store: Arc<dyn RemoteStore>,
        draft_key: impl Into<String>,
        ctx: &SyncContext,
        options: AutosaveOptions,
    ) -> Self {
        let draft_key = draft_key.into();
        let (commands, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(AutosaveStatus::default());
        let cancel = CancellationToken::new();
        let writer = DraftWriter {
            store: store.clone(),
            draft_key: draft_key.clone(),
            owner_id: ctx.user_id().map(str::to_string),
            retry: options.retry,
            row_id: Mutex::new(None),
            status: status_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(run(rx, writer, options.debounce, cancel.clone()));
        Self {
            draft_key,
            store,
            commands,
            status,
            cancel,
        }
    }

    pub fn draft_key(&self) -> &str {
        &self.draft_key
    }

    /// Queue a snapshot. Never blocks; the write happens after the quiet
    /// period.
    pub fn push<T: Serialize>(&self, snapshot: &T) -> Result<(), SyncError> {
        let value = serde_json::to_value(snapshot).map_err(|e| SyncError::Shape(e.to_string()))?;
        self.commands
            .send(Command::Push(value))
            .map_err(|_| SyncError::Unmounted)
    }

    /// Write the pending snapshot now, if any, and wait for the result.
    pub async fn flush(&self) -> Result<(), SyncError> {
        self.request(Command::Flush).await
    }

    /// Drop the pending snapshot and delete the stored draft.
    pub async fn discard(&self) -> Result<(), SyncError> {
        self.request(Command::Discard).await
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| SyncError::Unmounted)?;
        rx.await.map_err(|_| SyncError::Unmounted)?
    }

    /// Read back the stored draft, e.g. to offer "restore unsaved changes".
    pub async fn recover<T: DeserializeOwned>(&self) -> Result<Option<T>, SyncError> {
        let rows = self
            .store
            .select(DRAFTS_TABLE, &Filter::eq("draft_key", &self.draft_key))
            .await?;
        rows.into_iter()
            .next()
            .and_then(|mut row| row.remove("payload"))
            .map(|payload| serde_json::from_value(payload).map_err(|e| SyncError::Shape(e.to_string())))
            .transpose()
    }

    pub fn status(&self) -> AutosaveStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<AutosaveStatus> {
        self.status.clone()
    }
}

impl Drop for DraftAutosave {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    mut commands: mpsc::UnboundedReceiver<Command>,
    writer: DraftWriter,
    debounce: Duration,
    cancel: CancellationToken,
) {
    let mut pending: Option<Value> = None;
    let mut deadline = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                None => break,
                Some(Command::Push(snapshot)) => {
                    pending = Some(snapshot);
                    deadline = Instant::now() + debounce;
                    writer.status.send_modify(|s| s.pending = true);
                }
                Some(Command::Flush(reply)) => {
                    let result = match pending.take() {
                        Some(snapshot) => writer.save(snapshot).await,
                        None => Ok(()),
                    };
                    let _ = reply.send(result);
                }
                Some(Command::Discard(reply)) => {
                    pending = None;
                    let _ = reply.send(writer.discard().await);
                }
            },
            _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                if let Some(snapshot) = pending.take() {
                    let _ = writer.save(snapshot).await;
                }
            }
        }
    }
    if pending.is_some() {
        tracing::debug!(draft_key = %writer.draft_key, "autosave stopped, pending snapshot dropped");
    }
}

struct DraftWriter {
    store: Arc<dyn RemoteStore>,
    draft_key: String,
    owner_id: Option<String>,
    retry: RetryPolicy,
    /// Id of the stored draft row once known.
    row_id: Mutex<Option<String>>,
    status: watch::Sender<AutosaveStatus>,
    cancel: CancellationToken,
}

impl DraftWriter {
    async fn save(&self, snapshot: Value) -> Result<(), SyncError> {
        self.status.send_modify(|s| {
            s.is_saving = true;
            s.pending = false;
        });
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!(draft_key = %self.draft_key, "autosave stopped mid-save");
                self.status.send_modify(|s| s.is_saving = false);
                return Err(SyncError::Unmounted);
            }
            result = self.retry.run("autosave", || self.write(&snapshot)) => result,
        };
        match result {
            Ok(()) => {
                tracing::debug!(draft_key = %self.draft_key, "draft saved");
                self.status.send_modify(|s| {
                    s.is_saving = false;
                    s.last_saved_at = Some(Utc::now());
                    s.last_error = None;
                });
                Ok(())
            }
            Err(err) => {
                tracing::warn!(draft_key = %self.draft_key, error = %err, "draft save failed");
                let err = SyncError::Remote(err);
                self.status.send_modify(|s| {
                    s.is_saving = false;
                    s.last_error = Some(err.to_string());
                });
                Err(err)
            }
        }
    }

    async fn write(&self, snapshot: &Value) -> Result<(), StoreError> {
        let mut fields = Row::new();
        fields.insert("payload".into(), snapshot.clone());

        if let Some(id) = self.known_id().await? {
            match self.store.update(DRAFTS_TABLE, &id, fields.clone()).await {
                Ok(_) => return Ok(()),
                // Deleted under us; start a new draft row.
                Err(err) if err.code == ROW_NOT_FOUND_CODE => self.remember(None),
                Err(err) => return Err(err),
            }
        }

        fields.insert("draft_key".into(), Value::String(self.draft_key.clone()));
        fields.insert(
            "owner_id".into(),
            self.owner_id.clone().map(Value::String).unwrap_or(Value::Null),
        );
        let row = self.store.insert(DRAFTS_TABLE, fields).await?;
        self.remember(row_str(&row, "id").map(str::to_string));
        Ok(())
    }

    async fn discard(&self) -> Result<(), SyncError> {
        if let Some(id) = self.known_id().await? {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SyncError::Unmounted),
                result = self.retry.run("discard draft", || {
                    self.store.delete(DRAFTS_TABLE, &id)
                }) => result?,
            };
        }
        self.remember(None);
        self.status.send_modify(|s| {
            s.pending = false;
            s.last_error = None;
        });
        Ok(())
    }

    /// Cached row id, or the id of an existing draft row for this key.
    async fn known_id(&self) -> Result<Option<String>, StoreError> {
        let cached = self.row_id.lock().ok().and_then(|id| id.clone());
        if cached.is_some() {
            return Ok(cached);
        }
        let rows = self
            .store
            .select(DRAFTS_TABLE, &Filter::eq("draft_key", &self.draft_key))
            .await?;
        let found = rows
            .first()
            .and_then(|row| row_str(row, "id"))
            .map(str::to_string);
        self.remember(found.clone());
        Ok(found)
    }

    fn remember(&self, id: Option<String>) {
        if let Ok(mut slot) = self.row_id.lock() {
            *slot = id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MockStore;
    use crate::sync::context::Actor;
    use serde_json::json;

    fn options() -> AutosaveOptions {
        AutosaveOptions {
            debounce: Duration::from_millis(800),
            retry: RetryPolicy::exponential(3, Duration::from_millis(100), Duration::from_secs(1)),
        }
    }

    fn start(store: &Arc<MockStore>) -> DraftAutosave {
        DraftAutosave::start(store.clone(), "applicant-form:u1", &SyncContext::anonymous(), options())
    }

    async fn wait(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_pushes_coalesce_into_one_write() {
        let store = MockStore::new();
        let autosave = start(&store);

        for n in 1..=5 {
            autosave.push(&json!({"name": "A", "step": n})).unwrap();
            wait(100).await;
        }
        wait(1_000).await;

        assert_eq!(store.write_count(), 1);
        let rows = store.rows(DRAFTS_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["payload"], json!({"name": "A", "step": 5}));
        assert_eq!(rows[0]["draft_key"], json!("applicant-form:u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_pushes_each_write() {
        let store = MockStore::new();
        let autosave = start(&store);

        for n in 1..=3 {
            autosave.push(&json!({"step": n})).unwrap();
            wait(1_000).await;
        }

        assert_eq!(store.write_count(), 3);
        // One draft row, updated in place.
        assert_eq!(store.rows(DRAFTS_TABLE).len(), 1);
        assert_eq!(store.rows(DRAFTS_TABLE)[0]["payload"], json!({"step": 3}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_last_save() {
        let store = MockStore::new();
        let autosave = start(&store);

        autosave.push(&json!({"step": 1})).unwrap();
        wait(10).await;
        assert!(autosave.status().pending);

        wait(1_000).await;
        let status = autosave.status();
        assert!(!status.pending);
        assert!(!status.is_saving);
        assert!(status.last_saved_at.is_some());
        assert!(status.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_retries_with_backoff() {
        let store = MockStore::new();
        store.fail_next_write(StoreError::unavailable("reset"));
        store.fail_next_write(StoreError::unavailable("reset"));
        let autosave = start(&store);

        autosave.push(&json!({"step": 1})).unwrap();
        wait(5_000).await;

        assert_eq!(store.write_count(), 3);
        assert_eq!(store.rows(DRAFTS_TABLE).len(), 1);
        assert!(autosave.status().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_error() {
        let store = MockStore::new();
        for _ in 0..4 {
            store.fail_next_write(StoreError::unavailable("down"));
        }
        let autosave = start(&store);

        autosave.push(&json!({"step": 1})).unwrap();
        let err = autosave.flush().await.unwrap_err();

        assert!(matches!(err, SyncError::Remote(_)));
        assert_eq!(store.write_count(), 4);
        let status = autosave.status();
        assert!(!status.is_saving);
        assert!(status.last_error.unwrap().contains("down"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_without_waiting() {
        let store = MockStore::new();
        let autosave = start(&store);

        autosave.push(&json!({"step": 1})).unwrap();
        autosave.flush().await.unwrap();

        assert_eq!(store.write_count(), 1);
        wait(1_000).await;
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_write() {
        let store = MockStore::new();
        let autosave = start(&store);

        autosave.push(&json!({"step": 1})).unwrap();
        wait(100).await;
        drop(autosave);
        wait(2_000).await;

        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_during_retry_backoff_stops_further_writes() {
        let store = MockStore::new();
        store.fail_next_write(StoreError::unavailable("reset"));
        let autosave = DraftAutosave::start(
            store.clone(),
            "applicant-form:u1",
            &SyncContext::anonymous(),
            AutosaveOptions {
                debounce: Duration::from_millis(800),
                retry: RetryPolicy::fixed(3, Duration::from_secs(1)),
            },
        );

        autosave.push(&json!({"step": 1})).unwrap();
        // The first attempt fails at 800ms; the retry is due at 1800ms.
        wait(1_200).await;
        assert_eq!(store.write_count(), 1);
        drop(autosave);
        wait(5_000).await;

        assert_eq!(store.write_count(), 1);
        assert!(store.rows(DRAFTS_TABLE).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_and_discard() {
        let store = MockStore::new();
        let ctx = SyncContext::new(Actor {
            user_id: "u1".into(),
            display_name: "Dora".into(),
        });
        let autosave = DraftAutosave::start(store.clone(), "card:c1", &ctx, options());

        autosave.push(&json!({"title": "Loan"})).unwrap();
        autosave.flush().await.unwrap();
        assert_eq!(store.rows(DRAFTS_TABLE)[0]["owner_id"], json!("u1"));

        let recovered: Option<serde_json::Value> = autosave.recover().await.unwrap();
        assert_eq!(recovered, Some(json!({"title": "Loan"})));

        autosave.discard().await.unwrap();
        assert!(store.rows(DRAFTS_TABLE).is_empty());
        let recovered: Option<serde_json::Value> = autosave.recover().await.unwrap();
        assert!(recovered.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_draft_is_updated_not_duplicated() {
        let store = MockStore::new();
        store.seed(
            DRAFTS_TABLE,
            json!({"id": "d1", "draft_key": "applicant-form:u1", "payload": {"step": 0}}),
        );
        let autosave = start(&store);

        autosave.push(&json!({"step": 1})).unwrap();
        autosave.flush().await.unwrap();

        let rows = store.rows(DRAFTS_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("d1"));
        assert_eq!(rows[0]["payload"], json!({"step": 1}));
    }
}
