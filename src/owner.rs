use serde::{Deserialize, Serialize};
use std::fmt;

/// Owner used when no account is signed in.
pub const FALLBACK_OWNER: &str = "dev-user";

/// Identity of the account every document is scoped under.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn fallback() -> Self {
        Self(FALLBACK_OWNER.to_string())
    }

    /// Resolve the signed-in account, falling back to the placeholder owner.
    pub fn resolve(signed_in: Option<&OwnerId>, fallback: &OwnerId) -> OwnerId {
        match signed_in {
            Some(owner) if !owner.0.trim().is_empty() => owner.clone(),
            _ => fallback.clone(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for OwnerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::fallback()
    }
}
