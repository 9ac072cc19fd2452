//! Live, sorted mirrors of one collection.
//!
//! A [`LiveCollection`] owns a single pump task fed by a store subscription.
//! Each snapshot is decoded, malformed records are dropped, the rest are sorted
//! into canonical order and published as one immutable `Arc<[T]>`. Readers see
//! either the previous or the next materialization, never a mix.

use crate::{
    Result, metrics,
    codec::Entity,
    transport::{DocumentStore, FieldFilter, Snapshot, Subscription, SubscriptionOptions},
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One published state of a mirror.
#[derive(Debug)]
pub struct Materialized<T> {
    /// Bumped on every publication; 0 until the first snapshot lands.
    pub generation: u64,
    /// Store revision the items were read at.
    pub revision: u64,
    pub items: Arc<[T]>,
}

impl<T> Clone for Materialized<T> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            revision: self.revision,
            items: self.items.clone(),
        }
    }
}

impl<T> Default for Materialized<T> {
    fn default() -> Self {
        Self {
            generation: 0,
            revision: 0,
            items: Arc::from(Vec::new()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorStatus {
    Unsubscribed,
    Subscribed,
}

type Observer<T> = Arc<dyn Fn(&[T]) + Send + Sync>;

struct Shared<T> {
    state: watch::Sender<Materialized<T>>,
    observers: Mutex<Vec<(ObserverId, Observer<T>)>>,
    next_observer: AtomicU64,
}

impl<T: Entity> Shared<T> {
    fn apply(&self, snapshot: Snapshot) {
        let total = snapshot.documents.len();
        let mut items = Vec::with_capacity(total);
        for doc in snapshot.documents {
            match T::decode(&doc.fields) {
                Ok(item) => items.push(item),
                Err(err) => tracing::debug!(
                    target: "lacquer::live",
                    collection = %T::COLLECTION,
                    id = %doc.id,
                    error = %err,
                    "dropping undecodable record"
                ),
            }
        }
        metrics::record_records_dropped(total - items.len());
        items.sort_by(T::canonical_cmp);

        let items: Arc<[T]> = items.into();
        self.state.send_modify(|m| {
            m.generation += 1;
            m.revision = snapshot.revision;
            m.items = items.clone();
        });

        let observers: Vec<Observer<T>> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for observer in observers {
            observer(&items);
        }
    }
}

/// Live mirror of one collection, optionally narrowed by a field filter.
pub struct LiveCollection<T: Entity> {
    shared: Arc<Shared<T>>,
    filter: Option<FieldFilter>,
    pump: Mutex<Option<JoinHandle<()>>>,
    baseline: AtomicU64,
}

impl<T: Entity> Default for LiveCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> LiveCollection<T> {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Materialized::default());
        Self {
            shared: Arc::new(Shared {
                state,
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(0),
            }),
            filter: None,
            pump: Mutex::new(None),
            baseline: AtomicU64::new(0),
        }
    }

    /// Mirror only documents matching `filter`.
    pub fn filtered(filter: FieldFilter) -> Self {
        let mut mirror = Self::new();
        mirror.filter = Some(filter);
        mirror
    }

    pub fn filter(&self) -> Option<&FieldFilter> {
        self.filter.as_ref()
    }

    /// Subscribe to `store`, replacing any subscription this mirror already holds.
    pub async fn start(&self, store: &dyn DocumentStore, opts: SubscriptionOptions) -> Result<()> {
        self.stop().await;

        let Subscription {
            mut snapshots,
            handle,
        } = store
            .subscribe(T::COLLECTION, self.filter.clone(), opts)
            .await?;
        let generation = self.shared.state.borrow().generation;
        self.baseline.store(generation, Ordering::SeqCst);

        let shared = self.shared.clone();
        let pump = tokio::spawn(async move {
            // Dropping the handle with the pump cancels the feed.
            let _handle = handle;
            while let Some(snapshot) = snapshots.recv().await {
                shared.apply(snapshot);
            }
        });
        if let Some(previous) = self.pump_slot().replace(pump) {
            // Lost a race with a concurrent `start`.
            previous.abort();
        }
        tracing::debug!(
            target: "lacquer::live",
            collection = %T::COLLECTION,
            owner = %store.owner(),
            "mirror started"
        );
        Ok(())
    }

    /// Cancel the subscription. Once this returns no observer callback will run
    /// until the next `start`. Calling it again is a no-op.
    pub async fn stop(&self) {
        let pump = self.pump_slot().take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
            tracing::debug!(target: "lacquer::live", collection = %T::COLLECTION, "mirror stopped");
        }
    }

    pub fn status(&self) -> MirrorStatus {
        match self.pump_slot().as_ref() {
            Some(pump) if !pump.is_finished() => MirrorStatus::Subscribed,
            _ => MirrorStatus::Unsubscribed,
        }
    }

    fn pump_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest materialized items, in canonical order.
    pub fn current(&self) -> Arc<[T]> {
        self.shared.state.borrow().items.clone()
    }

    pub fn snapshot(&self) -> Materialized<T> {
        self.shared.state.borrow().clone()
    }

    /// Receiver that sees every publication.
    pub fn subscribe(&self) -> watch::Receiver<Materialized<T>> {
        self.shared.state.subscribe()
    }

    /// Register a callback run with the full item list on every publication.
    pub fn observe<F>(&self, f: F) -> ObserverId
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        let id = ObserverId(self.shared.next_observer.fetch_add(1, Ordering::Relaxed));
        self.shared
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(f)));
        id
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self
            .shared
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Wait for the first snapshot of the current subscription.
    pub async fn ready(&self) -> Arc<[T]> {
        let baseline = self.baseline.load(Ordering::SeqCst);
        self.wait_for_state(|m| m.generation > baseline).await
    }

    /// Wait until the published items satisfy `pred`.
    pub async fn wait_for<F>(&self, mut pred: F) -> Arc<[T]>
    where
        F: FnMut(&[T]) -> bool,
    {
        self.wait_for_state(|m| pred(&m.items[..])).await
    }

    async fn wait_for_state<F>(&self, mut pred: F) -> Arc<[T]>
    where
        F: FnMut(&Materialized<T>) -> bool,
    {
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(|m| pred(m)).await {
            Ok(m) => m.items.clone(),
            // The sender lives in `shared`, which `self` keeps alive.
            Err(_) => self.current(),
        }
    }
}

impl<T: Entity> Drop for LiveCollection<T> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump_slot().take() {
            pump.abort();
        }
    }
}
