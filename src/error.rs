use thiserror::Error;
use uuid::Uuid;

use crate::cascade::{CascadeReport, CascadeStep};
use crate::transport::Collection;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{collection} document {id} not found")]
    NotFound { collection: Collection, id: String },
    #[error("cascade delete of client {client_id} stopped while {step} ({progress}): {source}")]
    PartialCascade {
        client_id: Uuid,
        step: CascadeStep,
        progress: CascadeReport,
        #[source]
        source: Box<Error>,
    },
    #[error("design {design_id} was saved but not linked to client {client_id}: {source}")]
    PartialAttach {
        design_id: Uuid,
        client_id: Uuid,
        #[source]
        source: Box<Error>,
    },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn not_found(collection: Collection, id: impl Into<String>) -> Self {
        Error::NotFound {
            collection,
            id: id.into(),
        }
    }

    /// True for failures of the store itself (network, database, malformed responses),
    /// looking through `Context` wrappers.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Db(_) | Error::Serde(_) | Error::Io(_) | Error::Transport(_) => true,
            Error::Context { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    pub fn is_validation(&self) -> bool {
        match self {
            Error::Validation(_) => true,
            Error::Context { source, .. } => source.is_validation(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
