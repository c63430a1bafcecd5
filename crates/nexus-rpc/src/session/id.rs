//! Session identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionIdError {
    #[error("session id must start with \"sess_\"")]
    MissingPrefix,
    #[error("invalid session id: {0}")]
    InvalidUuid(String),
}

/// A unique, time-ordered session identifier based on UUID v7.
///
/// Displayed as `sess_<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse the `sess_<uuid>` form.
    pub fn parse(s: &str) -> Result<Self, SessionIdError> {
        let uuid = s
            .strip_prefix("sess_")
            .ok_or(SessionIdError::MissingPrefix)?;
        Uuid::parse_str(uuid)
            .map(Self)
            .map_err(|e| SessionIdError::InvalidUuid(e.to_string()))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess_{}", self.0)
    }
}
