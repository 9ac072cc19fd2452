//! Client delete cascade.
//!
//! Removes a client's appointments, then its designs, then the client record.
//! Every step re-enumerates from the store, so re-running after an interruption
//! picks up exactly what is left and converges on an empty result.

use crate::{
    Error, Result,
    codec::fields,
    transport::{Collection, DocumentStore, FieldFilter},
};
use std::fmt;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CascadeStep {
    Appointments,
    Designs,
    Client,
}

impl CascadeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CascadeStep::Appointments => "deleting appointments",
            CascadeStep::Designs => "deleting designs",
            CascadeStep::Client => "deleting client",
        }
    }
}

impl fmt::Display for CascadeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one cascade run removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CascadeReport {
    pub appointments_deleted: usize,
    pub designs_deleted: usize,
    pub client_deleted: bool,
}

impl CascadeReport {
    /// True when the run removed nothing.
    pub fn is_empty(&self) -> bool {
        self.appointments_deleted == 0 && self.designs_deleted == 0 && !self.client_deleted
    }
}

impl fmt::Display for CascadeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} appointments, {} designs deleted, client {}",
            self.appointments_deleted,
            self.designs_deleted,
            if self.client_deleted { "deleted" } else { "kept" }
        )
    }
}

/// One pass over the cascade, counting into `report`. A failure once `report`
/// shows any deletion (from this pass or an earlier one) becomes `PartialCascade`.
pub(crate) async fn run_cascade(
    store: &dyn DocumentStore,
    client_id: Uuid,
    report: &mut CascadeReport,
) -> Result<()> {
    let filter = FieldFilter::eq(fields::CLIENT_ID, client_id.to_string());

    delete_dependents(
        store,
        Collection::Appointments,
        &filter,
        &mut report.appointments_deleted,
    )
    .await
    .map_err(|e| partial(client_id, CascadeStep::Appointments, report, e))?;

    delete_dependents(
        store,
        Collection::Designs,
        &filter,
        &mut report.designs_deleted,
    )
    .await
    .map_err(|e| partial(client_id, CascadeStep::Designs, report, e))?;

    let removed = store
        .delete(Collection::Clients, &client_id.to_string())
        .await
        .map_err(|e| partial(client_id, CascadeStep::Client, report, e))?;
    report.client_deleted |= removed;

    tracing::debug!(
        target: "lacquer::cascade",
        %client_id,
        appointments = report.appointments_deleted,
        designs = report.designs_deleted,
        client = report.client_deleted,
        "cascade pass finished"
    );
    Ok(())
}

/// Deletes every document of `collection` matching `filter`, counting into `deleted`.
async fn delete_dependents(
    store: &dyn DocumentStore,
    collection: Collection,
    filter: &FieldFilter,
    deleted: &mut usize,
) -> Result<()> {
    for doc in store.fetch(collection, Some(filter)).await? {
        if store.delete(collection, &doc.id).await? {
            *deleted += 1;
        }
    }
    Ok(())
}

fn partial(client_id: Uuid, step: CascadeStep, progress: &CascadeReport, err: Error) -> Error {
    if progress.is_empty() {
        return err;
    }
    Error::PartialCascade {
        client_id,
        step,
        progress: *progress,
        source: Box::new(err),
    }
}
