//! Conversion between entities and the store's flat field maps.
//!
//! Encoding is total. Decoding fails closed: a record missing a required field,
//! or carrying one of the wrong shape, is reported as a [`DecodeError`] so the
//! caller can drop it without losing the rest of the batch.

use crate::models::{Appointment, Client, Design};
use crate::transport::{Collection, Fields};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

pub mod fields {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const PHONE: &str = "phone";
    pub const NOTES: &str = "notes";
    pub const DESIGN_IMAGE_NAMES: &str = "designImageNames";
    pub const CLIENT_ID: &str = "clientId";
    pub const CLIENT_NAME: &str = "clientName";
    pub const SERVICE: &str = "service";
    pub const DATE: &str = "date";
    pub const CREATED_AT: &str = "createdAt";
    pub const OWNER_UID: &str = "ownerUid";
    pub const PROMPT: &str = "prompt";
    pub const IMAGE_URL: &str = "imageURL";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeErrorKind {
    Missing,
    WrongType,
    Empty,
    InvalidId,
    InvalidTimestamp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeError {
    pub collection: Collection,
    pub field: &'static str,
    pub kind: DecodeErrorKind,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            DecodeErrorKind::Missing => "missing",
            DecodeErrorKind::WrongType => "wrong type",
            DecodeErrorKind::Empty => "empty",
            DecodeErrorKind::InvalidId => "not a valid id",
            DecodeErrorKind::InvalidTimestamp => "not a valid timestamp",
        };
        write!(f, "{} field `{}` is {what}", self.collection, self.field)
    }
}

impl std::error::Error for DecodeError {}

pub trait Entity: Clone + Send + Sync + Sized + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> Uuid;

    fn encode(&self) -> Fields;

    fn decode(fields: &Fields) -> Result<Self, DecodeError>;

    /// Canonical order consumers see the collection in.
    fn canonical_cmp(&self, other: &Self) -> Ordering;
}

/// Render an instant the way the store keeps it.
pub fn encode_timestamp(at: &DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339())
}

/// Accept RFC 3339 strings and `{"seconds", "nanos"}` timestamp objects.
pub fn decode_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Object(map) => {
            let seconds = map.get("seconds").and_then(Value::as_i64)?;
            let nanos = map.get("nanos").and_then(Value::as_u64).unwrap_or(0);
            let nanos = u32::try_from(nanos).ok()?;
            Utc.timestamp_opt(seconds, nanos).single()
        }
        _ => None,
    }
}

struct Reader<'a> {
    collection: Collection,
    fields: &'a Fields,
}

impl<'a> Reader<'a> {
    fn new(collection: Collection, fields: &'a Fields) -> Self {
        Self { collection, fields }
    }

    fn err(&self, field: &'static str, kind: DecodeErrorKind) -> DecodeError {
        DecodeError {
            collection: self.collection,
            field,
            kind,
        }
    }

    fn present(&self, field: &'static str) -> Option<&'a Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }

    fn string(&self, field: &'static str) -> Result<&'a str, DecodeError> {
        match self.present(field) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(self.err(field, DecodeErrorKind::WrongType)),
            None => Err(self.err(field, DecodeErrorKind::Missing)),
        }
    }

    fn non_empty(&self, field: &'static str) -> Result<&'a str, DecodeError> {
        let s = self.string(field)?;
        if s.trim().is_empty() {
            return Err(self.err(field, DecodeErrorKind::Empty));
        }
        Ok(s)
    }

    fn id(&self) -> Result<Uuid, DecodeError> {
        Uuid::parse_str(self.string(fields::ID)?)
            .map_err(|_| self.err(fields::ID, DecodeErrorKind::InvalidId))
    }

    fn timestamp(&self, field: &'static str) -> Result<DateTime<Utc>, DecodeError> {
        let value = self
            .present(field)
            .ok_or_else(|| self.err(field, DecodeErrorKind::Missing))?;
        decode_timestamp(value).ok_or_else(|| self.err(field, DecodeErrorKind::InvalidTimestamp))
    }

    /// Optional strings of the wrong type read as absent.
    fn opt_string(&self, field: &'static str) -> Option<String> {
        self.present(field)
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    /// A reference that does not parse is treated as no reference.
    fn opt_id(&self, field: &'static str) -> Option<Uuid> {
        self.present(field)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    fn opt_timestamp(&self, field: &'static str) -> Option<DateTime<Utc>> {
        self.present(field).and_then(decode_timestamp)
    }

    fn string_list(&self, field: &'static str) -> Vec<String> {
        match self.present(field) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn opt_string_value(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}

fn opt_id_value(value: &Option<Uuid>) -> Value {
    value
        .map(|id| Value::String(id.to_string()))
        .unwrap_or(Value::Null)
}

fn opt_timestamp_value(value: &Option<DateTime<Utc>>) -> Value {
    value.as_ref().map(encode_timestamp).unwrap_or(Value::Null)
}

impl Entity for Client {
    const COLLECTION: Collection = Collection::Clients;

    fn id(&self) -> Uuid {
        self.id
    }

    fn encode(&self) -> Fields {
        let mut f = Fields::new();
        f.insert(fields::ID.into(), Value::String(self.id.to_string()));
        f.insert(fields::NAME.into(), Value::String(self.name.clone()));
        f.insert(fields::PHONE.into(), opt_string_value(&self.phone));
        f.insert(fields::NOTES.into(), opt_string_value(&self.notes));
        f.insert(
            fields::DESIGN_IMAGE_NAMES.into(),
            Value::Array(
                self.design_image_names
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
        );
        f
    }

    fn decode(f: &Fields) -> Result<Self, DecodeError> {
        let r = Reader::new(Self::COLLECTION, f);
        Ok(Client {
            id: r.id()?,
            name: r.non_empty(fields::NAME)?.to_owned(),
            phone: r.opt_string(fields::PHONE),
            notes: r.opt_string(fields::NOTES),
            design_image_names: r.string_list(fields::DESIGN_IMAGE_NAMES),
        })
    }

    fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.name
            .to_lowercase()
            .cmp(&other.name.to_lowercase())
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl Entity for Appointment {
    const COLLECTION: Collection = Collection::Appointments;

    fn id(&self) -> Uuid {
        self.id
    }

    fn encode(&self) -> Fields {
        let mut f = Fields::new();
        f.insert(fields::ID.into(), Value::String(self.id.to_string()));
        f.insert(fields::CLIENT_ID.into(), opt_id_value(&self.client_id));
        f.insert(
            fields::CLIENT_NAME.into(),
            Value::String(self.client_name.clone()),
        );
        f.insert(fields::SERVICE.into(), Value::String(self.service.clone()));
        f.insert(fields::DATE.into(), encode_timestamp(&self.date));
        f.insert(fields::NOTES.into(), opt_string_value(&self.notes));
        f.insert(
            fields::CREATED_AT.into(),
            opt_timestamp_value(&self.created_at),
        );
        f
    }

    fn decode(f: &Fields) -> Result<Self, DecodeError> {
        let r = Reader::new(Self::COLLECTION, f);
        Ok(Appointment {
            id: r.id()?,
            client_id: r.opt_id(fields::CLIENT_ID),
            client_name: r.string(fields::CLIENT_NAME)?.to_owned(),
            service: r.non_empty(fields::SERVICE)?.to_owned(),
            date: r.timestamp(fields::DATE)?,
            notes: r.opt_string(fields::NOTES),
            created_at: r.opt_timestamp(fields::CREATED_AT),
        })
    }

    fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.date
            .cmp(&other.date)
            .then_with(|| self.client_name.cmp(&other.client_name))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl Entity for Design {
    const COLLECTION: Collection = Collection::Designs;

    fn id(&self) -> Uuid {
        self.id
    }

    fn encode(&self) -> Fields {
        let mut f = Fields::new();
        f.insert(fields::ID.into(), Value::String(self.id.to_string()));
        f.insert(fields::OWNER_UID.into(), Value::String(self.owner_uid.clone()));
        f.insert(fields::CLIENT_ID.into(), opt_id_value(&self.client_id));
        f.insert(fields::PROMPT.into(), Value::String(self.prompt.clone()));
        f.insert(fields::IMAGE_URL.into(), Value::String(self.image_url.clone()));
        f.insert(
            fields::CREATED_AT.into(),
            opt_timestamp_value(&self.created_at),
        );
        f
    }

    fn decode(f: &Fields) -> Result<Self, DecodeError> {
        let r = Reader::new(Self::COLLECTION, f);
        Ok(Design {
            id: r.id()?,
            owner_uid: r.string(fields::OWNER_UID)?.to_owned(),
            client_id: r.opt_id(fields::CLIENT_ID),
            prompt: r.string(fields::PROMPT)?.to_owned(),
            image_url: r.string(fields::IMAGE_URL)?.to_owned(),
            created_at: r.opt_timestamp(fields::CREATED_AT),
        })
    }

    // Pending stamps sort last.
    fn canonical_cmp(&self, other: &Self) -> Ordering {
        match (&self.created_at, &other.created_at) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| self.id.cmp(&other.id))
    }
}
