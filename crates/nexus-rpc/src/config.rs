//! Configuration types for the RPC core
//!
//! All fields have defaults that let the core work out of the box. Use
//! [`RpcConfig::validate`] before handing a hand-built configuration to a
//! router or session.

use crate::error::ErrorConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Error returned when configuration validation fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    /// max_input_size must be greater than 0
    #[error("max_input_size must be greater than 0")]
    InvalidMaxInputSize,
    /// max_batch_size must be greater than 0
    #[error("max_batch_size must be greater than 0")]
    InvalidMaxBatchSize,
    /// stream.max_depth must be greater than 0 when set
    #[error("stream.max_depth must be greater than 0 when set")]
    InvalidMaxDepth,
    /// keep-alive intervals must be non-zero
    #[error("keep_alive.{0} must be greater than 0")]
    InvalidKeepAlive(&'static str),
    /// sse.ping_interval must be non-zero
    #[error("sse.ping_interval must be greater than 0")]
    InvalidSsePing,
    /// optional durations must be non-zero when set
    #[error("{0} must be greater than 0 when set")]
    InvalidDuration(&'static str),
}

// =============================================================================
// Stream Configuration
// =============================================================================

/// Settings for the streaming value encoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Deepest path at which a deferred value or lazy sequence may be
    /// registered. `None` leaves nesting unbounded.
    pub max_depth: Option<usize>,
}

/// Ping/pong keep-alive for persistent sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    /// Whether the session emits pings at all (default: false)
    pub enabled: bool,
    /// Idle time before a ping is sent (default: 30s)
    pub ping_interval: Duration,
    /// Time to wait for any inbound message after a ping (default: 5s)
    pub pong_wait: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ping_interval: Duration::from_millis(30_000),
            pong_wait: Duration::from_millis(5_000),
        }
    }
}

impl KeepAliveConfig {
    /// Enabled keep-alive with the given timings.
    pub fn enabled(ping_interval: Duration, pong_wait: Duration) -> Self {
        Self {
            enabled: true,
            ping_interval,
            pong_wait,
        }
    }
}

/// Server-sent-events producer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseConfig {
    /// Idle time before a `ping` event is written (default: 1s)
    pub ping_interval: Duration,
    /// Whether the stream opens with a connected frame (default: true)
    pub emit_connected_comment: bool,
    /// Cut the stream off with a `return` event after this long
    #[serde(default)]
    pub max_duration: Option<Duration>,
    /// End the stream, without `return`, as soon as the elements already
    /// available have been written. Clients reconnect with the last event id.
    #[serde(default)]
    pub emit_and_end_immediately: bool,
    /// Hint sent in the connected frame: clients should reconnect after this
    /// much silence
    #[serde(default)]
    pub reconnect_after_inactivity: Option<Duration>,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(1_000),
            emit_connected_comment: true,
            max_duration: None,
            emit_and_end_immediately: false,
            reconnect_after_inactivity: None,
        }
    }
}

/// Line-delimited body settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonlConfig {
    /// Write a blank keep-alive line after this much idle time. `None`
    /// disables pings.
    pub ping_interval: Option<Duration>,
}

// =============================================================================
// RPC Configuration
// =============================================================================

/// Core configuration shared by routers, encoders and sessions.
///
/// # Example
/// ```rust,ignore
/// use nexus_rpc::{RpcConfig, KeepAliveConfig};
/// use std::time::Duration;
///
/// let config = RpcConfig::new()
///     .with_max_input_size(512 * 1024)
///     .with_max_depth(8)
///     .with_keep_alive(KeepAliveConfig::enabled(
///         Duration::from_secs(30),
///         Duration::from_secs(5),
///     ));
/// config.validate()?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Maximum serialized input size in bytes (default: 1MB)
    pub max_input_size: usize,
    /// Maximum number of calls in one batch (default: 100)
    pub max_batch_size: usize,
    /// Streaming encoder settings
    pub stream: StreamConfig,
    /// Session keep-alive settings
    pub keep_alive: KeepAliveConfig,
    /// Server-sent-events settings
    pub sse: SseConfig,
    /// Line-delimited body settings
    #[serde(default)]
    pub jsonl: JsonlConfig,
    /// Error formatting settings
    pub errors: ErrorConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_input_size: 1024 * 1024, // 1MB
            max_batch_size: 100,
            stream: StreamConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            sse: SseConfig::default(),
            jsonl: JsonlConfig::default(),
            errors: ErrorConfig::default(),
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration and return an error if invalid.
    ///
    /// # Errors
    ///
    /// Returns an error if any size is 0, if `stream.max_depth` is `Some(0)`,
    /// or if an enabled keep-alive or the SSE ping uses a zero interval.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.max_input_size == 0 {
            return Err(ConfigValidationError::InvalidMaxInputSize);
        }
        if self.max_batch_size == 0 {
            return Err(ConfigValidationError::InvalidMaxBatchSize);
        }
        if self.stream.max_depth == Some(0) {
            return Err(ConfigValidationError::InvalidMaxDepth);
        }
        if self.keep_alive.enabled {
            if self.keep_alive.ping_interval.is_zero() {
                return Err(ConfigValidationError::InvalidKeepAlive("ping_interval"));
            }
            if self.keep_alive.pong_wait.is_zero() {
                return Err(ConfigValidationError::InvalidKeepAlive("pong_wait"));
            }
        }
        if self.sse.ping_interval.is_zero() {
            return Err(ConfigValidationError::InvalidSsePing);
        }
        let optional = [
            ("sse.max_duration", self.sse.max_duration),
            ("sse.reconnect_after_inactivity", self.sse.reconnect_after_inactivity),
            ("jsonl.ping_interval", self.jsonl.ping_interval),
        ];
        if let Some((name, _)) = optional
            .into_iter()
            .find(|(_, value)| value.is_some_and(|d| d.is_zero()))
        {
            return Err(ConfigValidationError::InvalidDuration(name));
        }
        trace!(
            max_input_size = self.max_input_size,
            max_batch_size = self.max_batch_size,
            max_depth = ?self.stream.max_depth,
            keep_alive = self.keep_alive.enabled,
            "RpcConfig validated"
        );
        Ok(())
    }

    /// Set the maximum input size in bytes.
    #[must_use = "This method returns a new RpcConfig and does not modify self"]
    pub fn with_max_input_size(mut self, size: usize) -> Self {
        self.max_input_size = size;
        self
    }

    /// Set the maximum batch size.
    #[must_use = "This method returns a new RpcConfig and does not modify self"]
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Bound deferred/sequence nesting in encoded results.
    #[must_use = "This method returns a new RpcConfig and does not modify self"]
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.stream.max_depth = Some(depth);
        self
    }

    /// Set the session keep-alive settings.
    #[must_use = "This method returns a new RpcConfig and does not modify self"]
    pub fn with_keep_alive(mut self, keep_alive: KeepAliveConfig) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the server-sent-events settings.
    #[must_use = "This method returns a new RpcConfig and does not modify self"]
    pub fn with_sse(mut self, sse: SseConfig) -> Self {
        self.sse = sse;
        self
    }

    /// Set the line-delimited body settings.
    #[must_use = "This method returns a new RpcConfig and does not modify self"]
    pub fn with_jsonl(mut self, jsonl: JsonlConfig) -> Self {
        self.jsonl = jsonl;
        self
    }

    /// Set the error formatting settings.
    #[must_use = "This method returns a new RpcConfig and does not modify self"]
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RpcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_optional_durations_are_rejected() {
        let config = RpcConfig::new().with_sse(SseConfig {
            max_duration: Some(Duration::ZERO),
            ..SseConfig::default()
        });
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::InvalidDuration("sse.max_duration"))
        );

        let config = RpcConfig::new().with_jsonl(JsonlConfig {
            ping_interval: Some(Duration::ZERO),
        });
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::InvalidDuration("jsonl.ping_interval"))
        );
    }
}
