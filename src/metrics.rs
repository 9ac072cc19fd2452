use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::transport::Collection;

pub struct Metrics {
    // Documents
    pub doc_reads_total: AtomicU64,
    pub doc_writes_total: AtomicU64,
    pub doc_deletes_total: AtomicU64,

    // Subscriptions
    pub snapshots_delivered_total: AtomicU64,
    pub subscription_errors_total: AtomicU64,

    // Mirrors
    pub records_dropped_total: AtomicU64,

    // Cascades
    pub cascades_completed_total: AtomicU64,
    pub cascades_partial_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            doc_reads_total: AtomicU64::new(0),
            doc_writes_total: AtomicU64::new(0),
            doc_deletes_total: AtomicU64::new(0),
            snapshots_delivered_total: AtomicU64::new(0),
            subscription_errors_total: AtomicU64::new(0),
            records_dropped_total: AtomicU64::new(0),
            cascades_completed_total: AtomicU64::new(0),
            cascades_partial_total: AtomicU64::new(0),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub(crate) fn record_doc_read(collection: Collection, documents: usize) {
    metrics()
        .doc_reads_total
        .fetch_add(documents as u64, Ordering::Relaxed);
    tracing::trace!(target: "lacquer::metrics", %collection, documents, "documents read");
}

pub(crate) fn record_doc_write(collection: Collection) {
    metrics().doc_writes_total.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(target: "lacquer::metrics", %collection, "document written");
}

pub(crate) fn record_doc_delete(collection: Collection) {
    metrics().doc_deletes_total.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(target: "lacquer::metrics", %collection, "document deleted");
}

pub(crate) fn record_snapshot_delivered() {
    metrics()
        .snapshots_delivered_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_subscription_error() {
    metrics()
        .subscription_errors_total
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_records_dropped(count: usize) {
    if count > 0 {
        metrics()
            .records_dropped_total
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

pub(crate) fn record_cascade(completed: bool) {
    let m = metrics();
    if completed {
        m.cascades_completed_total.fetch_add(1, Ordering::Relaxed);
    } else {
        m.cascades_partial_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    // docs
    let _ = writeln!(
        s,
        "# TYPE doc_reads_total counter\ndoc_reads_total {}",
        m.doc_reads_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE doc_writes_total counter\ndoc_writes_total {}",
        m.doc_writes_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE doc_deletes_total counter\ndoc_deletes_total {}",
        m.doc_deletes_total.load(Ordering::Relaxed)
    );
    // subscriptions
    let _ = writeln!(
        s,
        "# TYPE snapshots_delivered_total counter\nsnapshots_delivered_total {}",
        m.snapshots_delivered_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE subscription_errors_total counter\nsubscription_errors_total {}",
        m.subscription_errors_total.load(Ordering::Relaxed)
    );
    // mirrors
    let _ = writeln!(
        s,
        "# TYPE records_dropped_total counter\nrecords_dropped_total {}",
        m.records_dropped_total.load(Ordering::Relaxed)
    );
    // cascades
    let _ = writeln!(
        s,
        "# TYPE cascades_completed_total counter\ncascades_completed_total {}",
        m.cascades_completed_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE cascades_partial_total counter\ncascades_partial_total {}",
        m.cascades_partial_total.load(Ordering::Relaxed)
    );
    s
}
