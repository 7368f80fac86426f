//! One shared hook per key.
//!
//! Consumers of the same key get the same hook, and with it one cache entry
//! and one realtime subscription. The hook is unmounted when the last
//! consumer lets go of its [`Lease`].

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use super::key::EntityKey;

/// Teardown hook the registry calls when the last consumer leaves.
pub trait Unmount {
    fn unmount(&self);
}

type Entries<H> = Arc<Mutex<HashMap<EntityKey, (Arc<H>, usize)>>>;

/// One build gate per key with a first acquisition in flight.
type BuildGates = Arc<Mutex<HashMap<EntityKey, Arc<tokio::sync::Mutex<()>>>>>;

pub struct Registry<H: Unmount> {
    entries: Entries<H>,
    building: BuildGates,
}

impl<H: Unmount> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            building: self.building.clone(),
        }
    }
}

impl<H: Unmount> Default for Registry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Unmount> Registry<H> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            building: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Share the hook for `key`, building it with `make` if no consumer
    /// holds one. Concurrent first acquisitions of a key build it once;
    /// builds for different keys run independently.
    pub async fn acquire<F, Fut>(&self, key: EntityKey, make: F) -> Lease<H>
    where
        F: FnOnce(EntityKey) -> Fut,
        Fut: Future<Output = Arc<H>>,
    {
        if let Some(lease) = self.share(&key) {
            return lease;
        }
        let gate = self.gate(&key);
        let building = gate.lock().await;
        if let Some(lease) = self.share(&key) {
            drop(building);
            self.release_gate(&key, gate);
            return lease;
        }
        let hook = make(key.clone()).await;
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.clone(), (hook.clone(), 1));
        }
        drop(building);
        self.release_gate(&key, gate);
        tracing::debug!(key = %key, "registry entry created");
        Lease {
            key,
            hook,
            entries: self.entries.clone(),
        }
    }

    fn gate(&self, key: &EntityKey) -> Arc<tokio::sync::Mutex<()>> {
        match self.building.lock() {
            Ok(mut gates) => gates.entry(key.clone()).or_default().clone(),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Forget the gate once no other acquisition is waiting on it.
    fn release_gate(&self, key: &EntityKey, gate: Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut gates) = self.building.lock()
            && gates
                .get(key)
                .is_some_and(|g| Arc::ptr_eq(g, &gate) && Arc::strong_count(g) <= 2)
        {
            gates.remove(key);
        }
    }

    fn share(&self, key: &EntityKey) -> Option<Lease<H>> {
        let mut entries = self.entries.lock().ok()?;
        let (hook, consumers) = entries.get_mut(key)?;
        *consumers += 1;
        Some(Lease {
            key: key.clone(),
            hook: hook.clone(),
            entries: self.entries.clone(),
        })
    }

    /// Number of live leases on `key`.
    pub fn consumers(&self, key: &EntityKey) -> usize {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).map(|(_, n)| *n))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A consumer's handle on a shared hook. Derefs to the hook.
pub struct Lease<H: Unmount> {
    key: EntityKey,
    hook: Arc<H>,
    entries: Entries<H>,
}

impl<H: Unmount> Lease<H> {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn hook(&self) -> &Arc<H> {
        &self.hook
    }
}

impl<H: Unmount> Deref for Lease<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.hook
    }
}

impl<H: Unmount> Clone for Lease<H> {
    fn clone(&self) -> Self {
        if let Ok(mut entries) = self.entries.lock()
            && let Some((_, consumers)) = entries.get_mut(&self.key)
        {
            *consumers += 1;
        }
        Self {
            key: self.key.clone(),
            hook: self.hook.clone(),
            entries: self.entries.clone(),
        }
    }
}

impl<H: Unmount> Drop for Lease<H> {
    fn drop(&mut self) {
        let released = self.entries.lock().ok().and_then(|mut entries| {
            let remaining = entries.get_mut(&self.key).map(|(_, consumers)| {
                *consumers = consumers.saturating_sub(1);
                *consumers
            });
            match remaining {
                Some(0) => entries.remove(&self.key),
                _ => None,
            }
        });
        if let Some((hook, _)) = released {
            tracing::debug!(key = %self.key, "last consumer left, unmounting");
            hook.unmount();
        }
    }
}
