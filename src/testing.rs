//! Helpers for tests: schema bootstrap and a fault-injecting store wrapper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Pool, Postgres};

use crate::{
    Error, OwnerId, Result,
    schema::{SchemaConfig, SchemaManager},
    transport::{
        Collection, DocumentStore, DocumentWrite, FieldFilter, RawDocument, Subscription,
        SubscriptionOptions,
    },
};

/// Create the document tables in `public`.
pub async fn migrate_core_schema(pool: &Pool<Postgres>) -> Result<()> {
    SchemaManager::new(pool.clone())
        .sync(&SchemaConfig::default())
        .await?;
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Write,
    Delete,
    ArrayUnion,
    Fetch,
    Subscribe,
}

#[derive(Clone, Copy, Debug, Default)]
struct Fault {
    /// Calls to let through before failing.
    skip: usize,
    /// Calls to fail once `skip` is exhausted.
    fail: usize,
}

/// Wraps a store and fails selected calls with a transport error.
///
/// Faults are armed per operation and collection; once a fault's budget is
/// spent, calls pass through again.
pub struct FaultyStore {
    inner: Arc<dyn DocumentStore>,
    faults: Mutex<HashMap<(FaultOp, Collection), Fault>>,
    mutations: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn DocumentStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            faults: Mutex::new(HashMap::new()),
            mutations: AtomicUsize::new(0),
        })
    }

    /// Fail the next `times` calls of `op` on `collection`.
    pub fn fail_next(&self, op: FaultOp, collection: Collection, times: usize) {
        self.fail_after(op, collection, 0, times);
    }

    /// Let `skip` calls through, then fail the following `times`.
    pub fn fail_after(&self, op: FaultOp, collection: Collection, skip: usize, times: usize) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((op, collection), Fault { skip, fail: times });
    }

    pub fn clear(&self) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Mutating calls (write, delete, union) that reached this wrapper, failed or not.
    pub fn mutation_attempts(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn check(&self, op: FaultOp, collection: Collection) -> Result<()> {
        if matches!(op, FaultOp::Write | FaultOp::Delete | FaultOp::ArrayUnion) {
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(fault) = faults.get_mut(&(op, collection)) else {
            return Ok(());
        };
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        if fault.fail > 0 {
            fault.fail -= 1;
            return Err(Error::Transport(format!(
                "injected {op:?} failure on {collection}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    fn owner(&self) -> &OwnerId {
        self.inner.owner()
    }

    async fn write(&self, collection: Collection, id: &str, write: DocumentWrite) -> Result<()> {
        self.check(FaultOp::Write, collection)?;
        self.inner.write(collection, id, write).await
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        self.check(FaultOp::Delete, collection)?;
        self.inner.delete(collection, id).await
    }

    async fn array_union(
        &self,
        collection: Collection,
        id: &str,
        field: &str,
        values: Vec<Value>,
    ) -> Result<()> {
        self.check(FaultOp::ArrayUnion, collection)?;
        self.inner.array_union(collection, id, field, values).await
    }

    async fn fetch(
        &self,
        collection: Collection,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<RawDocument>> {
        self.check(FaultOp::Fetch, collection)?;
        self.inner.fetch(collection, filter).await
    }

    async fn subscribe(
        &self,
        collection: Collection,
        filter: Option<FieldFilter>,
        opts: SubscriptionOptions,
    ) -> Result<Subscription> {
        self.check(FaultOp::Subscribe, collection)?;
        self.inner.subscribe(collection, filter, opts).await
    }
}
