//! Lacquer — owner-scoped client, appointment and design sync, powered by Postgres.

pub mod cascade;
pub mod codec;
pub mod config;
pub mod documents;
mod error;
pub mod generator;
pub mod live;
pub mod memory;
pub mod metrics;
pub mod models;
mod owner;
pub mod schema;
pub mod store;
mod subscriptions;
pub mod sync;
pub mod testing;
pub mod transport;

pub use cascade::{CascadeReport, CascadeStep};
pub use config::{CascadeRetry, SyncConfig};
pub use error::{Error, Result, WithContext};
pub use memory::MemoryStore;
pub use models::{Appointment, Client, Design, NewAppointment, NewDesign};
pub use owner::{FALLBACK_OWNER, OwnerId};
pub use store::Store;
pub use sync::{SessionSupervisor, SyncManager};

pub mod prelude {
    pub use crate::codec::Entity;
    pub use crate::generator::ImageGenerator;
    pub use crate::live::LiveCollection;
    pub use crate::transport::{Collection, DocumentBackend, DocumentStore};
    pub use crate::{
        Appointment, CascadeReport, Client, Design, MemoryStore, NewAppointment, NewDesign,
        OwnerId, Result, SessionSupervisor, Store, SyncConfig, SyncManager,
    };
}
