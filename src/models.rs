use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub notes: Option<String>,
    /// Design image payloads linked to this client. Grows only through union-append.
    pub design_image_names: Vec<String>,
}

impl Client {
    pub fn new(name: impl Into<String>, phone: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            phone,
            notes: None,
            design_image_names: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    /// Weak reference; the client may be gone.
    pub client_id: Option<Uuid>,
    /// Client name captured when the appointment was booked.
    pub client_name: String,
    pub service: String,
    pub date: DateTime<Utc>,
    pub notes: Option<String>,
    /// Assigned by the store on creation.
    pub created_at: Option<DateTime<Utc>>,
}

impl Appointment {
    pub fn belongs_to(&self, client_id: Uuid) -> bool {
        self.client_id == Some(client_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Design {
    pub id: Uuid,
    pub owner_uid: String,
    pub client_id: Option<Uuid>,
    pub prompt: String,
    /// Inline base64 image payload.
    pub image_url: String,
    /// Assigned by the store; `None` until the stamp is visible.
    pub created_at: Option<DateTime<Utc>>,
}

impl Design {
    pub fn belongs_to(&self, client_id: Uuid) -> bool {
        self.client_id == Some(client_id)
    }
}

/// Input for booking an appointment.
#[derive(Clone, Debug, Default)]
pub struct NewAppointment {
    pub client_id: Option<Uuid>,
    /// Left blank to take the name of the selected client.
    pub client_name: String,
    pub service: String,
    pub date: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Input for saving a generated design.
#[derive(Clone, Debug, Default)]
pub struct NewDesign {
    pub prompt: String,
    pub image_base64: String,
}
