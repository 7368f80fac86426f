//! Scripted in-memory store for sync-layer tests.
//!
//! Records every call in order, can delay or fail individual operations,
//! and lets tests push change events by hand.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{ChangeEvent, ChangeKind, Filter, RemoteStore, Row};
use crate::errors::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Select { table: String },
    Insert { table: String },
    Update { table: String, id: String },
    Delete { table: String, id: String },
}

type WriteObserver = Box<dyn Fn(&Call) + Send + Sync>;

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Vec<Row>>,
    calls: Vec<Call>,
    select_failures: VecDeque<StoreError>,
    write_failures: VecDeque<StoreError>,
    missing_tables: Vec<String>,
    clock: u64,
}

pub struct MockStore {
    inner: Mutex<Inner>,
    delay: Mutex<Duration>,
    observer: Mutex<Option<WriteObserver>>,
    emit_on_write: bool,
    tx: broadcast::Sender<ChangeEvent>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// A mock that publishes a change event after every successful write,
    /// like a real store does.
    pub fn with_feed() -> Arc<Self> {
        Self::build(true)
    }

    fn build(emit_on_write: bool) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(64);
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            delay: Mutex::new(Duration::ZERO),
            observer: Mutex::new(None),
            emit_on_write,
            tx,
        })
    }

    pub fn seed(&self, table: &str, row: Value) {
        let row = row.as_object().cloned().expect("seed rows are objects");
        self.inner
            .lock()
            .unwrap()
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn select_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Select { .. }))
            .count()
    }

    pub fn write_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| !matches!(c, Call::Select { .. }))
            .count()
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fail_next_select(&self, err: StoreError) {
        self.inner.lock().unwrap().select_failures.push_back(err);
    }

    pub fn fail_next_write(&self, err: StoreError) {
        self.inner.lock().unwrap().write_failures.push_back(err);
    }

    pub fn drop_table(&self, table: &str) {
        self.inner
            .lock()
            .unwrap()
            .missing_tables
            .push(table.to_string());
    }

    /// Called synchronously when a write is dispatched, before any delay.
    pub fn on_write(&self, observer: impl Fn(&Call) + Send + Sync + 'static) {
        *self.observer.lock().unwrap() = Some(Box::new(observer));
    }

    pub fn emit(&self, table: &str, kind: ChangeKind, row: Value) {
        let _ = self.tx.send(ChangeEvent {
            table: table.to_string(),
            kind,
            row: row.as_object().cloned().unwrap_or_default(),
        });
    }

    fn record(&self, call: Call) {
        if !matches!(call, Call::Select { .. })
            && let Some(observer) = self.observer.lock().unwrap().as_ref()
        {
            observer(&call);
        }
        self.inner.lock().unwrap().calls.push(call);
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_table(&self, inner: &Inner, table: &str) -> Result<(), StoreError> {
        if inner.missing_tables.iter().any(|t| t == table) {
            return Err(StoreError::missing_relation(table));
        }
        Ok(())
    }

    fn stamp(inner: &mut Inner, row: &mut Row) {
        inner.clock += 1;
        row.insert("updated_at".into(), Value::String(format!("T{}", inner.clock)));
    }

    fn publish(&self, table: &str, kind: ChangeKind, row: &Row) {
        if self.emit_on_write {
            let _ = self.tx.send(ChangeEvent {
                table: table.to_string(),
                kind,
                row: row.clone(),
            });
        }
    }
}

#[async_trait]
impl RemoteStore for MockStore {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
        self.record(Call::Select {
            table: table.to_string(),
        });
        self.pause().await;
        let mut inner = self.inner.lock().unwrap();
        self.check_table(&inner, table)?;
        if let Some(err) = inner.select_failures.pop_front() {
            return Err(err);
        }
        Ok(inner
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, StoreError> {
        self.record(Call::Insert {
            table: table.to_string(),
        });
        self.pause().await;
        let inserted = {
            let mut inner = self.inner.lock().unwrap();
            self.check_table(&inner, table)?;
            if let Some(err) = inner.write_failures.pop_front() {
                return Err(err);
            }
            if !row.contains_key("id") {
                let id = format!("row-{}", inner.clock + 1);
                row.insert("id".into(), Value::String(id));
            }
            Self::stamp(&mut inner, &mut row);
            inner
                .tables
                .entry(table.to_string())
                .or_default()
                .push(row.clone());
            row
        };
        self.publish(table, ChangeKind::Insert, &inserted);
        Ok(inserted)
    }

    async fn update(&self, table: &str, id: &str, patch: Row) -> Result<Row, StoreError> {
        self.record(Call::Update {
            table: table.to_string(),
            id: id.to_string(),
        });
        self.pause().await;
        let updated = {
            let mut inner = self.inner.lock().unwrap();
            self.check_table(&inner, table)?;
            if let Some(err) = inner.write_failures.pop_front() {
                return Err(err);
            }
            let clock = inner.clock + 1;
            let row = inner
                .tables
                .get_mut(table)
                .and_then(|rows| {
                    rows.iter_mut()
                        .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
                })
                .ok_or_else(|| StoreError::row_not_found(table, id))?;
            for (key, value) in patch {
                row.insert(key, value);
            }
            row.insert("updated_at".into(), Value::String(format!("T{}", clock)));
            let updated = row.clone();
            inner.clock = clock;
            updated
        };
        self.publish(table, ChangeKind::Update, &updated);
        Ok(updated)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<Option<Row>, StoreError> {
        self.record(Call::Delete {
            table: table.to_string(),
            id: id.to_string(),
        });
        self.pause().await;
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            self.check_table(&inner, table)?;
            if let Some(err) = inner.write_failures.pop_front() {
                return Err(err);
            }
            let rows = inner.tables.entry(table.to_string()).or_default();
            let position = rows
                .iter()
                .position(|r| r.get("id").and_then(Value::as_str) == Some(id));
            position.map(|p| rows.remove(p))
        };
        if let Some(row) = &removed {
            self.publish(table, ChangeKind::Delete, row);
        }
        Ok(removed)
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}
