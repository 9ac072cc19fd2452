//! Full-snapshot feeds.
//!
//! A feed task watches one collection's revision counter. Whenever the revision
//! moves (and once at start) it re-reads every matching document and pushes the
//! complete set down a bounded channel. Read failures are logged and retried on
//! the next wake-up; they never end the feed. The task exits when the receiver
//! is dropped or the handle is cancelled.

use crate::{
    Result, metrics,
    transport::{
        Collection, FieldFilter, RawDocument, Snapshot, Subscription, SubscriptionHandle,
        SubscriptionOptions,
    },
};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, sleep};

#[async_trait]
pub(crate) trait SnapshotSource: Send + Sync + 'static {
    async fn revision(&self, collection: Collection) -> Result<u64>;

    async fn documents(
        &self,
        collection: Collection,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<RawDocument>>;
}

#[async_trait]
pub(crate) trait ChangeSignal: Send + 'static {
    /// Resolves when the collection may have changed.
    async fn changed(&mut self);
}

/// Wakes on `LISTEN` notifications when available, otherwise every `interval`.
pub(crate) struct PollSignal {
    interval: Duration,
    listener: Option<PgListener>,
}

impl PollSignal {
    pub(crate) async fn connect(pool: &PgPool, interval: Duration, channel: Option<&str>) -> Self {
        let listener = match channel {
            Some(channel) => match PgListener::connect_with(pool).await {
                Ok(mut listener) => match listener.listen(channel).await {
                    Ok(()) => Some(listener),
                    Err(err) => {
                        tracing::warn!(target: "lacquer::subscriptions", %channel, error = %err, "listen failed; polling only");
                        None
                    }
                },
                Err(err) => {
                    tracing::warn!(target: "lacquer::subscriptions", error = %err, "notify listener unavailable; polling only");
                    None
                }
            },
            None => None,
        };
        Self { interval, listener }
    }
}

#[async_trait]
impl ChangeSignal for PollSignal {
    async fn changed(&mut self) {
        let Some(listener) = self.listener.as_mut() else {
            sleep(self.interval).await;
            return;
        };
        tokio::select! {
            res = listener.recv() => {
                if let Err(err) = res {
                    tracing::warn!(target: "lacquer::subscriptions", error = %err, "notify listener lost; polling only");
                    self.listener = None;
                }
            }
            _ = sleep(self.interval) => {}
        }
    }
}

/// Wakes whenever an in-process revision counter is bumped.
pub(crate) struct WatchSignal(pub(crate) watch::Receiver<u64>);

#[async_trait]
impl ChangeSignal for WatchSignal {
    async fn changed(&mut self) {
        if self.0.changed().await.is_err() {
            // Sender gone: nothing will ever change again.
            std::future::pending::<()>().await;
        }
    }
}

pub(crate) fn spawn_feed<S, W>(
    source: S,
    collection: Collection,
    filter: Option<FieldFilter>,
    opts: &SubscriptionOptions,
    mut signal: W,
) -> Subscription
where
    S: SnapshotSource,
    W: ChangeSignal,
{
    let (tx, rx) = mpsc::channel::<Snapshot>(opts.channel_capacity.max(1));
    let retry_after = opts.poll_interval;
    let task = tokio::spawn(async move {
        let mut last_seen: Option<u64> = None;
        loop {
            let mut failed = false;
            match source.revision(collection).await {
                Ok(revision) if last_seen != Some(revision) => {
                    match source.documents(collection, filter.as_ref()).await {
                        Ok(documents) => {
                            let snapshot = Snapshot {
                                collection,
                                revision,
                                documents,
                            };
                            if tx.send(snapshot).await.is_err() {
                                return; // receiver dropped
                            }
                            metrics::record_snapshot_delivered();
                            last_seen = Some(revision);
                        }
                        Err(err) => {
                            failed = true;
                            metrics::record_subscription_error();
                            tracing::warn!(target: "lacquer::subscriptions", %collection, error = %err, "snapshot read failed; will retry");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    failed = true;
                    metrics::record_subscription_error();
                    tracing::warn!(target: "lacquer::subscriptions", %collection, error = %err, "revision check failed; will retry");
                }
            }

            tokio::select! {
                _ = tx.closed() => return,
                _ = signal.changed() => {}
                _ = sleep(retry_after), if failed => {}
            }
        }
    });

    Subscription {
        snapshots: rx,
        handle: SubscriptionHandle::new(collection, task),
    }
}
