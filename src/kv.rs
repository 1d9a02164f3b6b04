//! Key-value capability: TTL-aware get/put plus an atomic dedup primitive.
//!
//! Everything the adapters remember between webhook deliveries (dedup markers,
//! post states, thread-root maps, conversation memory, badge rotation) goes
//! through the [`KeyValueStore`] trait. The production implementation is an
//! embedded redb database; tests use [`MemoryKv`].

use crate::error::KvError;
use async_trait::async_trait;
use redb::{Database, ReadableTable as _, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Keys map to `(expires_at_ms, value)`. `expires_at_ms == 0` means no expiry.
const KV_TABLE: TableDefinition<&str, (i64, &str)> = TableDefinition::new("kv");

/// Async key-value store with optional per-entry TTL.
///
/// Expiry is lazy: an expired entry reads as absent and is overwritten by the
/// next put. TTLs are advisory retention windows, not precise timers.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a text value, or `None` when missing or expired.
    async fn get_text(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Write a text value with an optional TTL.
    async fn put_text(&self, key: &str, value: &str, ttl: Option<Duration>)
    -> Result<(), KvError>;

    /// Atomically check-and-mark a key. Returns `true` when the key was
    /// already present (duplicate); otherwise writes a marker with the given
    /// TTL and returns `false`.
    async fn mark_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;
}

/// Read a JSON value, or `None` when missing, expired, or undecodable.
///
/// Undecodable values are treated as absent rather than fatal: a schema change
/// must never wedge the pipeline on old entries.
pub async fn get_json<T: DeserializeOwned>(
    kv: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, KvError> {
    let Some(raw) = kv.get_text(key).await? else {
        return Ok(None);
    };
    Ok(serde_json::from_str(&raw).ok())
}

/// Write a JSON value with an optional TTL.
pub async fn put_json<T: Serialize>(
    kv: &dyn KeyValueStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), KvError> {
    let raw = serde_json::to_string(value)?;
    kv.put_text(key, &raw, ttl).await
}

fn expires_at_ms(ttl: Option<Duration>) -> i64 {
    match ttl {
        Some(ttl) => crate::now_ms() + ttl.as_millis() as i64,
        None => 0,
    }
}

fn is_live(expires_at: i64) -> bool {
    expires_at == 0 || crate::now_ms() < expires_at
}

/// File-backed store on redb.
pub struct RedbKv {
    db: Database,
}

impl RedbKv {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self, KvError> {
        let db = Database::create(path).map_err(|error| KvError::Open(error.to_string()))?;

        // Make sure the table exists so read transactions never fail on a
        // fresh database.
        let txn = db
            .begin_write()
            .map_err(|error| KvError::Open(error.to_string()))?;
        txn.open_table(KV_TABLE)
            .map_err(|error| KvError::Open(error.to_string()))?;
        txn.commit()
            .map_err(|error| KvError::Open(error.to_string()))?;

        Ok(Self { db })
    }

    fn read_entry(&self, key: &str) -> Result<Option<(i64, String)>, KvError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|error| KvError::Read(error.to_string()))?;
        let table = txn
            .open_table(KV_TABLE)
            .map_err(|error| KvError::Read(error.to_string()))?;
        let entry = table
            .get(key)
            .map_err(|error| KvError::Read(error.to_string()))?;
        Ok(entry.map(|guard| {
            let (expires_at, value) = guard.value();
            (expires_at, value.to_string())
        }))
    }

    fn write_entry(&self, key: &str, expires_at: i64, value: &str) -> Result<(), KvError> {
        let txn = self
            .db
            .begin_write()
            .map_err(|error| KvError::Write(error.to_string()))?;
        {
            let mut table = txn
                .open_table(KV_TABLE)
                .map_err(|error| KvError::Write(error.to_string()))?;
            table
                .insert(key, (expires_at, value))
                .map_err(|error| KvError::Write(error.to_string()))?;
        }
        txn.commit()
            .map_err(|error| KvError::Write(error.to_string()))
    }
}

#[async_trait]
impl KeyValueStore for RedbKv {
    async fn get_text(&self, key: &str) -> Result<Option<String>, KvError> {
        match self.read_entry(key)? {
            Some((expires_at, value)) if is_live(expires_at) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    async fn put_text(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        self.write_entry(key, expires_at_ms(ttl), value)
    }

    async fn mark_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        // A single write transaction makes check-and-mark atomic within this
        // process. Concurrent processes can still race; accepted.
        let txn = self
            .db
            .begin_write()
            .map_err(|error| KvError::Write(error.to_string()))?;
        let already_present;
        {
            let mut table = txn
                .open_table(KV_TABLE)
                .map_err(|error| KvError::Write(error.to_string()))?;
            let existing = table
                .get(key)
                .map_err(|error| KvError::Read(error.to_string()))?
                .map(|guard| guard.value().0);
            already_present = matches!(existing, Some(expires_at) if is_live(expires_at));
            if !already_present {
                table
                    .insert(key, (expires_at_ms(Some(ttl)), "1"))
                    .map_err(|error| KvError::Write(error.to_string()))?;
            }
        }
        txn.commit()
            .map_err(|error| KvError::Write(error.to_string()))?;
        Ok(already_present)
    }
}

/// In-memory store for tests and ephemeral runs. TTL semantics match
/// [`RedbKv`].
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (i64, String)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get_text(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.entries.lock().expect("kv mutex poisoned");
        Ok(entries
            .get(key)
            .filter(|(expires_at, _)| is_live(*expires_at))
            .map(|(_, value)| value.clone()))
    }

    async fn put_text(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        entries.insert(key.to_string(), (expires_at_ms(ttl), value.to_string()));
        Ok(())
    }

    async fn mark_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        let already_present = entries
            .get(key)
            .is_some_and(|(expires_at, _)| is_live(*expires_at));
        if !already_present {
            entries.insert(key.to_string(), (expires_at_ms(Some(ttl)), "1".into()));
        }
        Ok(already_present)
    }
}
