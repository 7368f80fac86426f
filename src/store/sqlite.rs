use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tokio::sync::broadcast;

use super::{ChangeEvent, ChangeKind, Filter, RemoteStore, Row};
use crate::errors::StoreError;

/// Capacity of the change feed. Slow subscribers see `Lagged` and reload.
const CHANGE_FEED_CAPACITY: usize = 256;

/// Columns the store owns. Clients may not overwrite them through a patch.
const SERVER_COLUMNS: [&str; 3] = ["id", "created_at", "updated_at"];

/// Async-safe handle to the row database.
///
/// Wraps `RowDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RowDb>>,
}

impl DbHandle {
    pub fn new(db: RowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RowDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, RowDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// SQLite-backed table storage. Each provisioned table keeps one JSON body
/// per row plus the server-owned `id`, `created_at` and `updated_at` columns.
pub struct RowDb {
    conn: Connection,
}

impl RowDb {
    /// Open (or create) a SQLite database at the given path.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        Ok(())
    }

    /// Create `table` if it does not exist yet. Safe to re-run.
    pub fn provision(&self, table: &str) -> Result<()> {
        check_identifier(table)?;
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (
                    id TEXT PRIMARY KEY,
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS \"idx_{table}_created\" ON \"{table}\"(created_at);"
            ))
            .with_context(|| format!("Failed to provision table {}", table))?;
        Ok(())
    }

    pub fn has_table(&self, table: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .context("Failed to inspect sqlite_master")?;
        Ok(count > 0)
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .context("Failed to prepare list_tables")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query tables")?;
        let mut tables = Vec::new();
        for row in rows {
            tables.push(row.context("Failed to read table name")?);
        }
        Ok(tables)
    }

    fn ensure_table(&self, table: &str) -> Result<()> {
        check_identifier(table)?;
        if !self.has_table(table)? {
            return Err(StoreError::missing_relation(table).into());
        }
        Ok(())
    }

    // ── Row CRUD ──────────────────────────────────────────────────────

    pub fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>> {
        self.ensure_table(table)?;
        let mut rows = match filter {
            Filter::All => {
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "SELECT body FROM \"{table}\" ORDER BY created_at, rowid"
                    ))
                    .context("Failed to prepare select")?;
                let bodies = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .context("Failed to query rows")?;
                collect_bodies(bodies)?
            }
            Filter::Eq { column, value } => {
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "SELECT body FROM \"{table}\"
                         WHERE CAST(json_extract(body, ?1) AS TEXT) = ?2
                         ORDER BY created_at, rowid"
                    ))
                    .context("Failed to prepare filtered select")?;
                let path = format!("$.\"{}\"", column.replace('"', ""));
                let bodies = stmt
                    .query_map(params![path, value], |row| row.get::<_, String>(0))
                    .context("Failed to query rows")?;
                collect_bodies(bodies)?
            }
        };
        rows.retain(|row| filter.matches(row));
        Ok(rows)
    }

    pub fn get(&self, table: &str, id: &str) -> Result<Option<Row>> {
        self.ensure_table(table)?;
        let body: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT body FROM \"{table}\" WHERE id = ?1"),
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query row")?;
        body.map(|b| parse_body(&b)).transpose()
    }

    pub fn insert(&self, table: &str, mut row: Row) -> Result<Row> {
        self.ensure_table(table)?;
        let now = now_timestamp();
        let id = match row.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        row.insert("id".into(), Value::String(id.clone()));
        row.insert("created_at".into(), Value::String(now.clone()));
        row.insert("updated_at".into(), Value::String(now.clone()));
        let body = serde_json::to_string(&row).context("Failed to serialize row")?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO \"{table}\" (id, body, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)"
                ),
                params![id, body, now, now],
            )
            .map_err(|e| match e.sqlite_error_code() {
                Some(rusqlite::ErrorCode::ConstraintViolation) => anyhow::Error::new(
                    StoreError::new("23505", format!("duplicate key {} in {}", id, table)),
                ),
                _ => anyhow::Error::new(e).context("Failed to insert row"),
            })?;
        Ok(row)
    }

    /// Shallow-merge `patch` into the stored row. Returns `None` when the
    /// row does not exist.
    pub fn update(&self, table: &str, id: &str, patch: Row) -> Result<Option<Row>> {
        let Some(mut row) = self.get(table, id)? else {
            return Ok(None);
        };
        for (key, value) in patch {
            if SERVER_COLUMNS.contains(&key.as_str()) {
                continue;
            }
            row.insert(key, value);
        }
        let now = now_timestamp();
        row.insert("updated_at".into(), Value::String(now.clone()));
        let body = serde_json::to_string(&row).context("Failed to serialize row")?;
        self.conn
            .execute(
                &format!("UPDATE \"{table}\" SET body = ?1, updated_at = ?2 WHERE id = ?3"),
                params![body, now, id],
            )
            .context("Failed to update row")?;
        Ok(Some(row))
    }

    pub fn delete(&self, table: &str, id: &str) -> Result<Option<Row>> {
        let existing = self.get(table, id)?;
        if existing.is_some() {
            self.conn
                .execute(&format!("DELETE FROM \"{table}\" WHERE id = ?1"), params![id])
                .context("Failed to delete row")?;
        }
        Ok(existing)
    }
}

fn collect_bodies(
    bodies: impl Iterator<Item = rusqlite::Result<String>>,
) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for body in bodies {
        let body = body.context("Failed to read row body")?;
        rows.push(parse_body(&body)?);
    }
    Ok(rows)
}

fn parse_body(body: &str) -> Result<Row> {
    serde_json::from_str(body).context("Stored row body is not a JSON object")
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Table names are interpolated into SQL, so only `[a-z_][a-z0-9_]*` is accepted.
fn check_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(StoreError::new("42602", format!("invalid table name '{}'", name)).into());
    }
    Ok(())
}

/// Convert an internal error back into the store's structured error,
/// preserving a `StoreError` raised deeper in the stack.
fn into_store_error(err: anyhow::Error) -> StoreError {
    match err.downcast::<StoreError>() {
        Ok(store_err) => store_err,
        Err(other) => StoreError::from(other),
    }
}

/// Reference [`RemoteStore`] over SQLite with an in-process change feed.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
    tx: broadcast::Sender<ChangeEvent>,
}

impl SqliteStore {
    pub fn new(db: RowDb) -> Self {
        let (tx, _rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            db: DbHandle::new(db),
            tx,
        }
    }

    /// Open the database at `path` and provision `tables`.
    pub fn open(path: &Path, tables: &[String]) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let db = RowDb::new(path).context("Failed to initialize row database")?;
        for table in tables {
            db.provision(table)?;
        }
        Ok(Self::new(db))
    }

    /// In-memory store with `tables` provisioned.
    pub fn in_memory(tables: &[&str]) -> Result<Self> {
        let db = RowDb::new_in_memory()?;
        for table in tables {
            db.provision(table)?;
        }
        Ok(Self::new(db))
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    /// Sender side of the change feed (used by the websocket surface).
    pub fn change_sender(&self) -> broadcast::Sender<ChangeEvent> {
        self.tx.clone()
    }

    fn publish(&self, table: &str, kind: ChangeKind, row: Row) {
        let event = ChangeEvent {
            table: table.to_string(),
            kind,
            row,
        };
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
        let table = table.to_string();
        let filter = filter.clone();
        self.db
            .call(move |db| db.select(&table, &filter))
            .await
            .map_err(into_store_error)
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError> {
        let owned = table.to_string();
        let inserted = self
            .db
            .call(move |db| db.insert(&owned, row))
            .await
            .map_err(into_store_error)?;
        tracing::debug!(table, id = ?inserted.get("id"), "row inserted");
        self.publish(table, ChangeKind::Insert, inserted.clone());
        Ok(inserted)
    }

    async fn update(&self, table: &str, id: &str, patch: Row) -> Result<Row, StoreError> {
        let owned = table.to_string();
        let owned_id = id.to_string();
        let updated = self
            .db
            .call(move |db| db.update(&owned, &owned_id, patch))
            .await
            .map_err(into_store_error)?
            .ok_or_else(|| StoreError::row_not_found(table, id))?;
        tracing::debug!(table, id, "row updated");
        self.publish(table, ChangeKind::Update, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<Option<Row>, StoreError> {
        let owned = table.to_string();
        let owned_id = id.to_string();
        let removed = self
            .db
            .call(move |db| db.delete(&owned, &owned_id))
            .await
            .map_err(into_store_error)?;
        if let Some(row) = &removed {
            tracing::debug!(table, id, "row deleted");
            self.publish(table, ChangeKind::Delete, row.clone());
        }
        Ok(removed)
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_provision_creates_table() -> Result<()> {
        let db = RowDb::new_in_memory()?;
        assert!(!db.has_table("tasks")?);
        db.provision("tasks")?;
        db.provision("tasks")?;
        assert!(db.has_table("tasks")?);
        assert_eq!(db.list_tables()?, vec!["tasks".to_string()]);
        Ok(())
    }

    #[test]
    fn test_provision_rejects_bad_identifier() {
        let db = RowDb::new_in_memory().unwrap();
        assert!(db.provision("tasks; DROP TABLE x").is_err());
        assert!(db.provision("Tasks").is_err());
        assert!(db.provision("").is_err());
    }

    #[test]
    fn test_insert_applies_server_defaults() -> Result<()> {
        let db = RowDb::new_in_memory()?;
        db.provision("applicants")?;
        let inserted = db.insert("applicants", row(json!({"name": "Ana"})))?;
        assert!(inserted.get("id").and_then(Value::as_str).is_some());
        assert!(inserted.get("created_at").is_some());
        assert_eq!(inserted.get("created_at"), inserted.get("updated_at"));
        assert_eq!(inserted["name"], "Ana");
        Ok(())
    }

    #[test]
    fn test_insert_keeps_client_id() -> Result<()> {
        let db = RowDb::new_in_memory()?;
        db.provision("tasks")?;
        let inserted = db.insert("tasks", row(json!({"id": "t-1", "title": "Call"})))?;
        assert_eq!(inserted["id"], "t-1");
        let duplicate = db.insert("tasks", row(json!({"id": "t-1", "title": "Again"})));
        let err = duplicate.unwrap_err().downcast::<StoreError>().unwrap();
        assert_eq!(err.code, "23505");
        Ok(())
    }

    #[test]
    fn test_select_filters_by_column() -> Result<()> {
        let db = RowDb::new_in_memory()?;
        db.provision("tasks")?;
        db.insert("tasks", row(json!({"card_id": "c1", "title": "a"})))?;
        db.insert("tasks", row(json!({"card_id": "c2", "title": "b"})))?;
        db.insert("tasks", row(json!({"card_id": "c1", "title": "c"})))?;

        let rows = db.select("tasks", &Filter::eq("card_id", "c1"))?;
        let titles: Vec<_> = rows.iter().map(|r| r["title"].clone()).collect();
        assert_eq!(titles, vec![json!("a"), json!("c")]);
        assert_eq!(db.select("tasks", &Filter::All)?.len(), 3);
        assert!(db.select("tasks", &Filter::eq("card_id", "zz"))?.is_empty());
        Ok(())
    }

    #[test]
    fn test_update_merges_shallow_and_protects_server_columns() -> Result<()> {
        let db = RowDb::new_in_memory()?;
        db.provision("applicants")?;
        let inserted = db.insert("applicants", row(json!({"name": "Ana", "phone": "1"})))?;
        let id = inserted["id"].as_str().unwrap().to_string();
        std::thread::sleep(std::time::Duration::from_millis(2));

        let updated = db
            .update(
                "applicants",
                &id,
                row(json!({"name": "Bia", "id": "hijack", "created_at": "x"})),
            )?
            .expect("row should exist");
        assert_eq!(updated["name"], "Bia");
        assert_eq!(updated["phone"], "1");
        assert_eq!(updated["id"], json!(id));
        assert_eq!(updated["created_at"], inserted["created_at"]);
        assert_ne!(updated["updated_at"], inserted["updated_at"]);
        Ok(())
    }

    #[test]
    fn test_update_missing_row_returns_none() -> Result<()> {
        let db = RowDb::new_in_memory()?;
        db.provision("applicants")?;
        assert!(db.update("applicants", "nope", Row::new())?.is_none());
        Ok(())
    }

    #[test]
    fn test_delete_returns_removed_row() -> Result<()> {
        let db = RowDb::new_in_memory()?;
        db.provision("comments")?;
        let inserted = db.insert("comments", row(json!({"body": "hi"})))?;
        let id = inserted["id"].as_str().unwrap().to_string();
        let removed = db.delete("comments", &id)?.expect("row existed");
        assert_eq!(removed["body"], "hi");
        assert!(db.delete("comments", &id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_unprovisioned_table_is_missing_relation() {
        let db = RowDb::new_in_memory().unwrap();
        let err = db.select("tasks", &Filter::All).unwrap_err();
        let store_err = into_store_error(err);
        assert!(store_err.is_missing_relation());
    }

    #[tokio::test]
    async fn test_store_publishes_changes() {
        let store = SqliteStore::in_memory(&["tasks"]).unwrap();
        let mut rx = store.changes();

        let inserted = store
            .insert("tasks", row(json!({"card_id": "c1", "title": "a"})))
            .await
            .unwrap();
        let id = inserted["id"].as_str().unwrap().to_string();
        store
            .update("tasks", &id, row(json!({"done": true})))
            .await
            .unwrap();
        store.delete("tasks", &id).await.unwrap();

        let kinds: Vec<ChangeKind> = vec![
            rx.recv().await.unwrap().kind,
            rx.recv().await.unwrap().kind,
            rx.recv().await.unwrap().kind,
        ];
        assert_eq!(
            kinds,
            vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
        );
    }

    #[tokio::test]
    async fn test_store_update_unknown_row_is_not_found() {
        let store = SqliteStore::in_memory(&["tasks"]).unwrap();
        let err = store.update("tasks", "missing", Row::new()).await.unwrap_err();
        assert_eq!(err.code, crate::errors::ROW_NOT_FOUND_CODE);
    }

    #[tokio::test]
    async fn test_store_missing_table_maps_to_missing_relation() {
        let store = SqliteStore::in_memory(&[]).unwrap();
        let err = store.select("tasks", &Filter::All).await.unwrap_err();
        assert!(err.is_missing_relation());
    }
}
