//! Shared test infrastructure.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use esi::{Store, StoreResult};

/// In-memory [`Store`] honoring native TTLs, standing in for Redis.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (Bytes, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Raw view for assertions on what landed in the store.
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|(data, _)| data.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let mut entries = self.entries.lock().unwrap();
        let expired = matches!(
            entries.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(data, _)| data.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StoreResult<()> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), (value, deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn set_many(&self, pairs: &[(&str, Bytes)]) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap();
        for (key, value) in pairs {
            entries.insert((*key).to_owned(), (value.clone(), None));
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
