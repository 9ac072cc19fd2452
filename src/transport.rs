//! Owner-scoped document store contract.
//!
//! A store holds three collections nested under one owner record. Every
//! [`DocumentStore`] handle is bound to a single owner; [`DocumentBackend`]
//! hands out such handles.

use crate::{OwnerId, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Flat keyed-field representation of a stored document.
pub type Fields = JsonMap<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Clients,
    Appointments,
    Designs,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Clients,
        Collection::Appointments,
        Collection::Designs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Clients => "clients",
            Collection::Appointments => "appointments",
            Collection::Designs => "designs",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the whole document.
    Set,
    /// Shallow-merge into the document, creating it when absent.
    Merge,
    /// Shallow-merge into an existing document; `NotFound` when absent.
    Update,
}

/// One document write: payload, mode and the fields the store stamps with its clock.
#[derive(Clone, Debug)]
pub struct DocumentWrite {
    pub fields: Fields,
    pub mode: WriteMode,
    pub server_timestamps: Vec<String>,
}

impl DocumentWrite {
    pub fn new(fields: Fields, mode: WriteMode) -> Self {
        Self {
            fields,
            mode,
            server_timestamps: Vec::new(),
        }
    }

    pub fn set(fields: Fields) -> Self {
        Self::new(fields, WriteMode::Set)
    }

    pub fn merge(fields: Fields) -> Self {
        Self::new(fields, WriteMode::Merge)
    }

    pub fn update(fields: Fields) -> Self {
        Self::new(fields, WriteMode::Update)
    }

    /// Have the store assign its current time to `field`, overriding any payload value.
    pub fn server_timestamp(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.fields.remove(&field);
        self.server_timestamps.push(field);
        self
    }
}

/// Equality filter on one top-level field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub equals: Value,
}

impl FieldFilter {
    pub fn eq(field: impl Into<String>, equals: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            equals: equals.into(),
        }
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        fields.get(&self.field) == Some(&self.equals)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawDocument {
    pub id: String,
    pub fields: Fields,
}

/// Complete contents of a (possibly filtered) collection at one revision.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub collection: Collection,
    pub revision: u64,
    pub documents: Vec<RawDocument>,
}

#[derive(Clone, Debug)]
pub struct SubscriptionOptions {
    pub poll_interval: Duration,
    pub channel_capacity: usize,
    pub notify_channel: Option<String>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            channel_capacity: 16,
            notify_channel: None,
        }
    }
}

/// Live feed of full-collection snapshots. Dropping it stops the feed.
pub struct Subscription {
    pub snapshots: mpsc::Receiver<Snapshot>,
    pub handle: SubscriptionHandle,
}

pub struct SubscriptionHandle {
    collection: Collection,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(collection: Collection, task: JoinHandle<()>) -> Self {
        Self {
            collection,
            task: Some(task),
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the feed and wait for its task to exit. Safe to call repeatedly.
    pub async fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn owner(&self) -> &OwnerId;

    async fn write(&self, collection: Collection, id: &str, write: DocumentWrite) -> Result<()>;

    /// Returns `false` when there was nothing to delete.
    async fn delete(&self, collection: Collection, id: &str) -> Result<bool>;

    async fn array_union(
        &self,
        collection: Collection,
        id: &str,
        field: &str,
        values: Vec<Value>,
    ) -> Result<()>;

    async fn fetch(
        &self,
        collection: Collection,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<RawDocument>>;

    async fn subscribe(
        &self,
        collection: Collection,
        filter: Option<FieldFilter>,
        opts: SubscriptionOptions,
    ) -> Result<Subscription>;
}

/// Source of owner-scoped store handles.
pub trait DocumentBackend: Send + Sync {
    fn for_owner(&self, owner: &OwnerId) -> Arc<dyn DocumentStore>;
}

/// Drop duplicates while keeping first-seen order.
pub(crate) fn dedup_values(values: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(values.len());
    for v in values {
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}
