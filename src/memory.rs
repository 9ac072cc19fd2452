//! In-process document backend.
//!
//! Same contract as the Postgres store: owner-scoped collections, merge writes,
//! array union, and full-snapshot subscriptions woken by a shared revision tick.
//! Used for offline sessions and as the test backend.

use crate::{
    Error, OwnerId, Result, metrics,
    subscriptions::{SnapshotSource, WatchSignal, spawn_feed},
    transport::{
        Collection, DocumentBackend, DocumentStore, DocumentWrite, FieldFilter, Fields,
        RawDocument, Subscription, SubscriptionOptions, WriteMode, dedup_values,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

#[derive(Default)]
struct Bucket {
    revision: u64,
    docs: BTreeMap<String, Fields>,
}

struct Inner {
    buckets: Mutex<HashMap<(OwnerId, Collection), Bucket>>,
    tick: watch::Sender<u64>,
    writes: AtomicU64,
}

impl Inner {
    fn buckets(&self) -> MutexGuard<'_, HashMap<(OwnerId, Collection), Bucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self, bucket: &mut Bucket) {
        bucket.revision += 1;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.tick.send_modify(|t| *t = t.wrapping_add(1));
    }
}

/// Shared in-memory backend. Clones see the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tick, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                buckets: Mutex::new(HashMap::new()),
                tick,
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Handle scoped to `owner`.
    pub fn docs(&self, owner: &OwnerId) -> MemoryDocuments {
        MemoryDocuments {
            inner: self.inner.clone(),
            owner: owner.clone(),
        }
    }

    /// Number of successful mutations across all owners.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    /// Store `fields` verbatim, bypassing encoding. Lets tests plant malformed records.
    pub fn insert_raw(&self, owner: &OwnerId, collection: Collection, id: &str, fields: Fields) {
        let mut buckets = self.inner.buckets();
        let bucket = buckets.entry((owner.clone(), collection)).or_default();
        bucket.docs.insert(id.to_string(), fields);
        self.inner.bump(bucket);
    }

    /// Raw fields of one document, if present.
    pub fn get(&self, owner: &OwnerId, collection: Collection, id: &str) -> Option<Fields> {
        self.inner
            .buckets()
            .get(&(owner.clone(), collection))
            .and_then(|b| b.docs.get(id).cloned())
    }

    pub fn len(&self, owner: &OwnerId, collection: Collection) -> usize {
        self.inner
            .buckets()
            .get(&(owner.clone(), collection))
            .map_or(0, |b| b.docs.len())
    }
}

impl DocumentBackend for MemoryStore {
    fn for_owner(&self, owner: &OwnerId) -> Arc<dyn DocumentStore> {
        Arc::new(self.docs(owner))
    }
}

#[derive(Clone)]
pub struct MemoryDocuments {
    inner: Arc<Inner>,
    owner: OwnerId,
}

impl MemoryDocuments {
    fn key(&self, collection: Collection) -> (OwnerId, Collection) {
        (self.owner.clone(), collection)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocuments {
    fn owner(&self) -> &OwnerId {
        &self.owner
    }

    async fn write(&self, collection: Collection, id: &str, write: DocumentWrite) -> Result<()> {
        let mut fields = write.fields;
        if !write.server_timestamps.is_empty() {
            let now = Value::String(Utc::now().to_rfc3339());
            for field in write.server_timestamps {
                fields.insert(field, now.clone());
            }
        }

        let mut buckets = self.inner.buckets();
        let bucket = buckets.entry(self.key(collection)).or_default();
        let existing = match write.mode {
            WriteMode::Set => None,
            WriteMode::Merge | WriteMode::Update => bucket.docs.get_mut(id),
        };
        if let Some(existing) = existing {
            existing.extend(fields);
        } else if write.mode == WriteMode::Update {
            return Err(Error::not_found(collection, id));
        } else {
            bucket.docs.insert(id.to_string(), fields);
        }
        self.inner.bump(bucket);
        drop(buckets);

        metrics::record_doc_write(collection);
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let mut buckets = self.inner.buckets();
        let Some(bucket) = buckets.get_mut(&self.key(collection)) else {
            return Ok(false);
        };
        if bucket.docs.remove(id).is_none() {
            return Ok(false);
        }
        self.inner.bump(bucket);
        drop(buckets);

        metrics::record_doc_delete(collection);
        Ok(true)
    }

    async fn array_union(
        &self,
        collection: Collection,
        id: &str,
        field: &str,
        values: Vec<Value>,
    ) -> Result<()> {
        let mut buckets = self.inner.buckets();
        let doc = buckets
            .get_mut(&self.key(collection))
            .and_then(|b| b.docs.get_mut(id))
            .ok_or_else(|| Error::not_found(collection, id))?;

        let mut current = match doc.remove(field) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        for value in dedup_values(values) {
            if !current.contains(&value) {
                current.push(value);
            }
        }
        doc.insert(field.to_string(), Value::Array(current));

        if let Some(bucket) = buckets.get_mut(&self.key(collection)) {
            self.inner.bump(bucket);
        }
        drop(buckets);

        metrics::record_doc_write(collection);
        Ok(())
    }

    async fn fetch(
        &self,
        collection: Collection,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<RawDocument>> {
        let documents: Vec<RawDocument> = self
            .inner
            .buckets()
            .get(&self.key(collection))
            .map(|b| {
                b.docs
                    .iter()
                    .filter(|(_, fields)| filter.is_none_or(|f| f.matches(fields)))
                    .map(|(id, fields)| RawDocument {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        metrics::record_doc_read(collection, documents.len());
        Ok(documents)
    }

    async fn subscribe(
        &self,
        collection: Collection,
        filter: Option<FieldFilter>,
        opts: SubscriptionOptions,
    ) -> Result<Subscription> {
        let signal = WatchSignal(self.inner.tick.subscribe());
        Ok(spawn_feed(self.clone(), collection, filter, &opts, signal))
    }
}

#[async_trait]
impl SnapshotSource for MemoryDocuments {
    async fn revision(&self, collection: Collection) -> Result<u64> {
        Ok(self
            .inner
            .buckets()
            .get(&self.key(collection))
            .map_or(0, |b| b.revision))
    }

    async fn documents(
        &self,
        collection: Collection,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<RawDocument>> {
        self.fetch(collection, filter).await
    }
}
