//! Request logging with tracing
//!
//! [`logging_middleware`] is an ordinary middleware: put it first in a
//! procedure's chain to log every call with a request id, timing and
//! redacted input.
//!
//! # Usage
//!
//! ```rust,ignore
//! use nexus_rpc::logging::{LogConfig, LogLevel, logging_middleware};
//!
//! let config = LogConfig::new()
//!     .with_level(LogLevel::Info)
//!     .with_input_logging(true)
//!     .with_procedure_level("admin.*", LogLevel::Debug)
//!     .exclude_path("health")
//!     .redact_field("session");
//!
//! let base = Procedure::builder().use_boxed(logging_middleware(config));
//! let by_id = base.clone().query(get_post);
//! ```
//!
//! Redaction matches configured field names case-insensitively as
//! substrings of object keys, at any depth.

mod config;
mod middleware;
mod redaction;

pub use config::{
    DEFAULT_REDACTION_REPLACEMENT, DEFAULT_SENSITIVE_FIELDS, DEFAULT_SLOW_THRESHOLD_MS, LogConfig,
    LogLevel,
};
pub use middleware::{logging_middleware, should_log_slow_request};
pub use redaction::{RedactionEngine, redact_value};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of [`RequestId::short`].
pub const SHORT_ID_LENGTH: usize = 8;

/// Correlation id of one logged call.
///
/// UUID v7, so ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// First characters of the id, for compact output.
    pub fn short(&self) -> String {
        self.0.to_string().chars().take(SHORT_ID_LENGTH).collect()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

impl From<RequestId> for uuid::Uuid {
    fn from(id: RequestId) -> Self {
        id.0
    }
}
