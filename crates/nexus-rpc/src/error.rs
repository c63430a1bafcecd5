//! Error types for RPC operations
//!
//! Every failure that crosses a pipeline, encoder or session boundary is an
//! [`RpcError`]. Codes are carried by [`RpcErrorCode`] and map to one fixed
//! HTTP status and one JSON-RPC error number each.
//!
//! On the wire an error travels as an [`ErrorShape`]:
//!
//! ```json
//! { "code": -32004, "message": "...", "data": { "code": "NOT_FOUND", "httpStatus": 404, "path": "post.byId" } }
//! ```
//!
//! # Example
//! ```rust,ignore
//! use nexus_rpc::{RpcError, RpcErrorCode};
//!
//! let error = RpcError::new(RpcErrorCode::NotFound, "Post not found");
//! let error = RpcError::not_found("Post not found"); // Convenience method
//! assert_eq!(error.code.http_status(), 404);
//! ```

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Error codes for RPC operations.
///
/// When serialized to JSON, codes are converted to SCREAMING_SNAKE_CASE
/// (e.g., `NotFound` becomes `"NOT_FOUND"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum RpcErrorCode {
    /// Invalid JSON was received
    ParseError,
    /// The request was malformed or its input failed validation
    BadRequest,
    /// An unexpected internal error occurred
    InternalServerError,
    /// The requested functionality is not implemented
    NotImplemented,
    /// An upstream service returned an invalid response
    BadGateway,
    /// The service is temporarily unavailable
    ServiceUnavailable,
    /// An upstream service timed out
    GatewayTimeout,
    /// Authentication is required
    Unauthorized,
    /// Payment is required
    PaymentRequired,
    /// The authenticated caller lacks permission
    Forbidden,
    /// Unknown path, or wrong call kind for a path
    NotFound,
    /// The call kind is not supported by this transport
    MethodNotSupported,
    /// The call took too long
    Timeout,
    /// The request conflicts with current state
    Conflict,
    /// A precondition of the call was not met
    PreconditionFailed,
    /// The request payload exceeds size limits
    PayloadTooLarge,
    /// The result cannot be delivered over this transport
    UnsupportedMediaType,
    /// The input was well-formed but semantically invalid
    UnprocessableContent,
    /// Rate limit exceeded
    TooManyRequests,
    /// The caller went away before the call completed
    ClientClosedRequest,
}

impl RpcErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::BadRequest => "BAD_REQUEST",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::BadGateway => "BAD_GATEWAY",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::GatewayTimeout => "GATEWAY_TIMEOUT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::PaymentRequired => "PAYMENT_REQUIRED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::MethodNotSupported => "METHOD_NOT_SUPPORTED",
            Self::Timeout => "TIMEOUT",
            Self::Conflict => "CONFLICT",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
            Self::UnprocessableContent => "UNPROCESSABLE_CONTENT",
            Self::TooManyRequests => "TOO_MANY_REQUESTS",
            Self::ClientClosedRequest => "CLIENT_CLOSED_REQUEST",
        }
    }

    /// The HTTP status this code is reported with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ParseError | Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::PaymentRequired => 402,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotSupported => 405,
            Self::Timeout => 408,
            Self::Conflict => 409,
            Self::PreconditionFailed => 412,
            Self::PayloadTooLarge => 413,
            Self::UnsupportedMediaType => 415,
            Self::UnprocessableContent => 422,
            Self::TooManyRequests => 429,
            Self::ClientClosedRequest => 499,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::BadGateway => 502,
            Self::ServiceUnavailable => 503,
            Self::GatewayTimeout => 504,
        }
    }

    /// The JSON-RPC 2.0 error number carried in the outer `code` of an [`ErrorShape`].
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::BadRequest => -32600,
            Self::InternalServerError
            | Self::NotImplemented
            | Self::BadGateway
            | Self::ServiceUnavailable
            | Self::GatewayTimeout => -32603,
            Self::Unauthorized => -32001,
            Self::PaymentRequired => -32002,
            Self::Forbidden => -32003,
            Self::NotFound => -32004,
            Self::MethodNotSupported => -32005,
            Self::Timeout => -32008,
            Self::Conflict => -32009,
            Self::PreconditionFailed => -32012,
            Self::PayloadTooLarge => -32013,
            Self::UnsupportedMediaType => -32015,
            Self::UnprocessableContent => -32022,
            Self::TooManyRequests => -32029,
            Self::ClientClosedRequest => -32099,
        }
    }

    /// Returns true if this is a client error (4xx equivalent).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }

    /// Returns true if this is a server error (5xx equivalent).
    pub fn is_server_error(&self) -> bool {
        self.http_status() >= 500
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// RPC error with type-safe code and message.
///
/// # Example
/// ```rust,ignore
/// use nexus_rpc::{RpcError, RpcErrorCode};
///
/// let error = RpcError::new(RpcErrorCode::BadRequest, "Input validation failed")
///     .with_details(serde_json::json!({"field": "id"}))
///     .with_cause("missing field `id`");
/// ```
#[derive(Debug, Clone, Deserialize, Error)]
#[error("[{code}] {message}")]
pub struct RpcError {
    /// Type-safe error code
    pub code: RpcErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details (JSON value)
    pub details: Option<serde_json::Value>,
    /// Optional cause for debugging (not exposed to clients in production)
    pub cause: Option<String>,
    /// Procedure path the error originated from
    pub path: Option<String>,
    /// Optional stack trace (only included in development mode)
    pub stack_trace: Option<String>,
}

impl RpcError {
    /// Create a new error with code and message.
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            cause: None,
            path: None,
            stack_trace: None,
        }
    }

    /// Add details to the error.
    pub fn with_details(mut self, details: impl Serialize) -> Self {
        self.details = serde_json::to_value(details).ok();
        self
    }

    /// Add a cause string for debugging.
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Attach the procedure path, keeping an existing one.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }

    /// Add a stack trace for debugging (only shown in development mode).
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Capture the current stack trace (only in debug builds).
    #[cfg(debug_assertions)]
    pub fn capture_stack_trace(mut self) -> Self {
        self.stack_trace = Some(format!("{:?}", std::backtrace::Backtrace::capture()));
        self
    }

    /// Capture the current stack trace (no-op in release builds).
    #[cfg(not(debug_assertions))]
    pub fn capture_stack_trace(self) -> Self {
        self
    }

    /// Normalize a foreign error into an `INTERNAL_SERVER_ERROR`.
    ///
    /// The foreign error's message is kept as the cause.
    pub fn from_unknown(err: impl fmt::Display) -> Self {
        let cause = err.to_string();
        Self::internal(cause.clone()).with_cause(cause)
    }

    /// Normalize a caught panic payload into an `INTERNAL_SERVER_ERROR`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        debug!(panic = %message, "Normalizing panic into internal error");
        Self::internal(message.clone()).with_cause(format!("panicked: {message}"))
    }

    /// Apply error configuration to prepare error for client response.
    pub fn apply_config(mut self, config: &ErrorConfig) -> Self {
        trace!(
            code = %self.code,
            development_mode = config.development_mode,
            has_transformer = config.transformer.is_some(),
            "Applying error configuration"
        );

        if let Some(transformer) = &config.transformer {
            self = transformer.transform(self);
        }

        if !config.development_mode {
            self.stack_trace = None;
            self.cause = None;

            if self.code.is_server_error() {
                debug!(
                    original_code = %self.code,
                    original_message = %self.message,
                    "Sanitizing server error for production"
                );
                self.message = "An internal error occurred".to_string();
                self.details = None;
            }
        }

        self
    }

    // Convenience constructors

    /// Create a PARSE_ERROR error.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::ParseError, message)
    }

    /// Create a BAD_REQUEST error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::BadRequest, message)
    }

    /// Create a NOT_FOUND error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::NotFound, message)
    }

    /// Create an UNAUTHORIZED error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Unauthorized, message)
    }

    /// Create a FORBIDDEN error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Forbidden, message)
    }

    /// Create a TIMEOUT error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Timeout, message)
    }

    /// Create a CONFLICT error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Conflict, message)
    }

    /// Create a PAYLOAD_TOO_LARGE error.
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::PayloadTooLarge, message)
    }

    /// Create an UNSUPPORTED_MEDIA_TYPE error.
    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::UnsupportedMediaType, message)
    }

    /// Create an INTERNAL_SERVER_ERROR error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InternalServerError, message)
    }

    /// Create a CLIENT_CLOSED_REQUEST error.
    pub fn client_closed(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::ClientClosedRequest, message)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse_error(format!("JSON error: {}", err))
    }
}

impl Serialize for RpcError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("RpcError", 6)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;

        if let Some(ref details) = self.details {
            state.serialize_field("details", details)?;
        }

        if let Some(ref cause) = self.cause {
            state.serialize_field("cause", cause)?;
        }

        if let Some(ref path) = self.path {
            state.serialize_field("path", path)?;
        }

        if let Some(ref stack_trace) = self.stack_trace {
            state.serialize_field("stack_trace", stack_trace)?;
        }

        state.end()
    }
}

/// Result type alias for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

// =============================================================================
// Wire Shape
// =============================================================================

/// The serialized form of an error as seen by peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    /// JSON-RPC error number
    pub code: i32,
    pub message: String,
    pub data: ErrorShapeData,
}

/// Structured part of an [`ErrorShape`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShapeData {
    pub code: RpcErrorCode,
    pub http_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorShape {
    /// Format an error for a peer, applying the error configuration first.
    pub fn from_error(error: &RpcError, config: &ErrorConfig) -> Self {
        let error = error.clone().apply_config(config);
        let stack = if config.include_stack_traces {
            error.stack_trace
        } else {
            None
        };
        Self {
            code: error.code.json_rpc_code(),
            message: error.message,
            data: ErrorShapeData {
                code: error.code,
                http_status: error.code.http_status(),
                path: error.path,
                stack,
                details: error.details,
                cause: error.cause,
            },
        }
    }

    /// Format an error as a JSON value.
    pub fn to_value(error: &RpcError, config: &ErrorConfig) -> serde_json::Value {
        serde_json::to_value(Self::from_error(error, config)).unwrap_or_else(|e| {
            serde_json::json!({ "code": -32603, "message": e.to_string(), "data": {} })
        })
    }

    /// Rebuild an [`RpcError`] from a received shape.
    pub fn into_error(self) -> RpcError {
        RpcError {
            code: self.data.code,
            message: self.message,
            details: self.data.details,
            cause: self.data.cause,
            path: self.data.path,
            stack_trace: self.data.stack,
        }
    }

    /// Rebuild an [`RpcError`] from a raw JSON payload.
    ///
    /// Payloads that are not a valid shape become `INTERNAL_SERVER_ERROR`.
    pub fn error_from_value(value: serde_json::Value) -> RpcError {
        match serde_json::from_value::<ErrorShape>(value.clone()) {
            Ok(shape) => shape.into_error(),
            Err(_) => RpcError::internal("Received an unrecognised error payload")
                .with_details(value),
        }
    }
}

// =============================================================================
// Error Configuration
// =============================================================================

/// Configuration for error handling behavior.
///
/// # Example
/// ```rust,ignore
/// use nexus_rpc::error::ErrorConfig;
///
/// let dev_config = ErrorConfig::development();
/// let prod_config = ErrorConfig::production();
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct ErrorConfig {
    /// Whether to include development-only information (stack traces, causes)
    pub development_mode: bool,
    /// Whether stack traces are copied into `data.stack`
    pub include_stack_traces: bool,
    /// Custom error transformer
    #[serde(skip)]
    pub transformer: Option<Arc<dyn ErrorTransformer>>,
}

impl ErrorConfig {
    /// Create a new error configuration with default settings.
    pub fn new() -> Self {
        Self {
            development_mode: cfg!(debug_assertions),
            include_stack_traces: cfg!(debug_assertions),
            transformer: None,
        }
    }

    /// Create a development mode configuration.
    pub fn development() -> Self {
        Self {
            development_mode: true,
            include_stack_traces: true,
            transformer: None,
        }
    }

    /// Create a production mode configuration.
    pub fn production() -> Self {
        Self {
            development_mode: false,
            include_stack_traces: false,
            transformer: None,
        }
    }

    /// Set development mode.
    #[must_use = "This method returns a new ErrorConfig and does not modify self"]
    pub fn with_development_mode(mut self, enabled: bool) -> Self {
        self.development_mode = enabled;
        self
    }

    /// Set a custom error transformer.
    #[must_use = "This method returns a new ErrorConfig and does not modify self"]
    pub fn with_transformer<T: ErrorTransformer + 'static>(mut self, transformer: T) -> Self {
        self.transformer = Some(Arc::new(transformer));
        self
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorConfig")
            .field("development_mode", &self.development_mode)
            .field("include_stack_traces", &self.include_stack_traces)
            .field("transformer", &self.transformer.is_some())
            .finish()
    }
}

/// Hook applied to every error before it is formatted for a peer.
pub trait ErrorTransformer: Send + Sync {
    /// Transform an error before it's sent to the peer.
    fn transform(&self, error: RpcError) -> RpcError;
}

/// An error transformer that logs errors before passing them through.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTransformer;

impl ErrorTransformer for LoggingTransformer {
    fn transform(&self, error: RpcError) -> RpcError {
        tracing::error!(
            code = %error.code,
            message = %error.message,
            path = ?error.path,
            "RPC error occurred"
        );
        error
    }
}
