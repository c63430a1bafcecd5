//! Input and output validation
//!
//! A [`Validator`] turns raw JSON into parsed JSON or fails. Attaching one to
//! a procedure adds an ordinary middleware to its chain:
//!
//! - input validators parse the raw input and fail with `BAD_REQUEST`;
//!   several chained input validators whose outputs are all objects are
//!   deep-merged
//! - output validators parse the resolver's result and fail with
//!   `INTERNAL_SERVER_ERROR` ("Output validation failed")
//!
//! [`SerdeValidator`] adapts any serde type; [`Validated`] additionally runs
//! the type's [`Validate`] rules.
//!
//! # Example
//!
//! ```rust,ignore
//! #[derive(Serialize, Deserialize)]
//! struct AddPost {
//!     title: String,
//!     text: String,
//! }
//!
//! impl Validate for AddPost {
//!     fn validate(&self) -> ValidationResult {
//!         ValidationRules::new()
//!             .required("title", &self.title)
//!             .max_length("title", &self.title, 200)
//!             .build()
//!     }
//! }
//!
//! let add = Procedure::builder()
//!     .input(Validated::<AddPost>::new())
//!     .mutation(add_post);
//! ```

use crate::error::{RpcError, RpcResult};
use crate::middleware::{MiddlewareFn, MiddlewareOptions, Next, NextOptions, from_fn};
use crate::value::StreamValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

// =============================================================================
// Field Errors
// =============================================================================

/// Validation error for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// The name of the field that failed validation
    pub field: String,
    /// Human-readable error message
    pub message: String,
    /// Error code identifying the type of validation failure
    pub code: String,
}

impl FieldError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code: code.into(),
        }
    }

    pub fn required(field: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("{field} is required");
        Self::new(field, message, "required")
    }

    pub fn min_length(field: impl Into<String>, min: usize) -> Self {
        let field = field.into();
        let message = format!("{field} must be at least {min} characters");
        Self::new(field, message, "min_length")
    }

    pub fn max_length(field: impl Into<String>, max: usize) -> Self {
        let field = field.into();
        let message = format!("{field} must be at most {max} characters");
        Self::new(field, message, "max_length")
    }

    pub fn range(field: impl Into<String>, min: i64, max: i64) -> Self {
        let field = field.into();
        let message = format!("{field} must be between {min} and {max}");
        Self::new(field, message, "range")
    }

    pub fn pattern(field: impl Into<String>, pattern: &str) -> Self {
        let field = field.into();
        let message = format!("{field} must match pattern: {pattern}");
        Self::new(field, message, "pattern")
    }

    pub fn custom(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(field, message, "custom")
    }
}

/// Result of running [`Validate`] rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<FieldError>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn fail(errors: Vec<FieldError>) -> Self {
        if !errors.is_empty() {
            let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
            debug!(error_count = errors.len(), fields = ?fields, "Validation failed");
        }
        Self { errors }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert to a map of field -> errors for easier lookup
    pub fn errors_by_field(&self) -> HashMap<String, Vec<&FieldError>> {
        let mut map: HashMap<String, Vec<&FieldError>> = HashMap::new();
        for error in &self.errors {
            map.entry(error.field.clone()).or_default().push(error);
        }
        map
    }

    #[must_use = "This method returns a new ValidationResult and does not modify self"]
    pub fn merge(mut self, other: ValidationResult) -> Self {
        self.errors.extend(other.errors);
        self
    }
}

/// Trait for validatable input types.
pub trait Validate {
    fn validate(&self) -> ValidationResult;
}

impl Validate for () {
    fn validate(&self) -> ValidationResult {
        ValidationResult::ok()
    }
}

impl Validate for Value {
    fn validate(&self) -> ValidationResult {
        ValidationResult::ok()
    }
}

impl<T: Validate> Validate for Option<T> {
    fn validate(&self) -> ValidationResult {
        match self {
            Some(value) => value.validate(),
            None => ValidationResult::ok(),
        }
    }
}

/// Builder for validation rules.
#[derive(Debug, Default)]
pub struct ValidationRules {
    errors: Vec<FieldError>,
}

impl ValidationRules {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use = "This method returns a new ValidationRules and does not modify self"]
    pub fn add_error(mut self, error: FieldError) -> Self {
        self.errors.push(error);
        self
    }

    /// Fails when the trimmed value is empty.
    #[must_use = "This method returns a new ValidationRules and does not modify self"]
    pub fn required(mut self, field: &str, value: &str) -> Self {
        if value.trim().is_empty() {
            self.errors.push(FieldError::required(field));
        }
        self
    }

    #[must_use = "This method returns a new ValidationRules and does not modify self"]
    pub fn min_length(mut self, field: &str, value: &str, min: usize) -> Self {
        if value.chars().count() < min {
            self.errors.push(FieldError::min_length(field, min));
        }
        self
    }

    #[must_use = "This method returns a new ValidationRules and does not modify self"]
    pub fn max_length(mut self, field: &str, value: &str, max: usize) -> Self {
        if value.chars().count() > max {
            self.errors.push(FieldError::max_length(field, max));
        }
        self
    }

    /// Inclusive range check.
    #[must_use = "This method returns a new ValidationRules and does not modify self"]
    pub fn range(mut self, field: &str, value: i64, min: i64, max: i64) -> Self {
        if value < min || value > max {
            self.errors.push(FieldError::range(field, min, max));
        }
        self
    }

    #[must_use = "This method returns a new ValidationRules and does not modify self"]
    pub fn pattern(mut self, field: &str, value: &str, pattern: &str) -> Self {
        match regex::Regex::new(pattern) {
            Ok(re) if re.is_match(value) => {}
            Ok(_) => self.errors.push(FieldError::pattern(field, pattern)),
            Err(e) => {
                warn!(field = %field, pattern = %pattern, error = %e, "Invalid validation regex pattern");
                self.errors.push(FieldError::new(
                    field,
                    format!("Invalid validation pattern: {pattern}"),
                    "invalid_pattern",
                ));
            }
        }
        self
    }

    #[must_use = "This method returns a new ValidationRules and does not modify self"]
    pub fn custom<F>(mut self, field: &str, predicate: F, message: &str) -> Self
    where
        F: FnOnce() -> bool,
    {
        if !predicate() {
            self.errors.push(FieldError::custom(field, message));
        }
        self
    }

    pub fn build(self) -> ValidationResult {
        ValidationResult::fail(self.errors)
    }
}

// =============================================================================
// Validators
// =============================================================================

/// Why a validator rejected a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    pub errors: Vec<FieldError>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            errors: Vec::new(),
        }
    }

    pub fn from_result(result: ValidationResult) -> Self {
        let message = result
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            message,
            errors: result.errors,
        }
    }
}

/// Parses raw JSON into validated JSON.
pub trait Validator: Send + Sync {
    fn parse(&self, raw: &Value) -> Result<Value, ValidationError>;
}

impl<F> Validator for F
where
    F: Fn(&Value) -> Result<Value, ValidationError> + Send + Sync,
{
    fn parse(&self, raw: &Value) -> Result<Value, ValidationError> {
        self(raw)
    }
}

/// Validates by round-tripping through a serde type.
///
/// Unknown fields are dropped unless `T` keeps them.
pub struct SerdeValidator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeValidator<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeValidator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SerdeValidator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerdeValidator<{}>", std::any::type_name::<T>())
    }
}

impl<T> Validator for SerdeValidator<T>
where
    T: DeserializeOwned + Serialize,
{
    fn parse(&self, raw: &Value) -> Result<Value, ValidationError> {
        let parsed: T = serde_json::from_value(raw.clone())
            .map_err(|e| ValidationError::new(e.to_string()))?;
        serde_json::to_value(parsed).map_err(|e| ValidationError::new(e.to_string()))
    }
}

/// Like [`SerdeValidator`], then runs the type's [`Validate`] rules.
pub struct Validated<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Validated<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Validated<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Validator for Validated<T>
where
    T: DeserializeOwned + Serialize + Validate,
{
    fn parse(&self, raw: &Value) -> Result<Value, ValidationError> {
        let parsed: T = serde_json::from_value(raw.clone())
            .map_err(|e| ValidationError::new(e.to_string()))?;
        let result = parsed.validate();
        if !result.is_valid() {
            return Err(ValidationError::from_result(result));
        }
        serde_json::to_value(parsed).map_err(|e| ValidationError::new(e.to_string()))
    }
}

// =============================================================================
// Validation Middleware
// =============================================================================

/// Merge `patch` into `base`. Objects merge key by key, anything else is
/// replaced by `patch`.
pub fn deep_merge(base: Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base), Value::Object(patch)) => {
            for (key, value) in patch {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, patch) => patch,
    }
}

/// Middleware parsing the raw input.
///
/// The first input stage of a chain replaces the input with its parse
/// result; later stages deep-merge into what earlier stages produced.
pub(crate) fn input_middleware(validator: Arc<dyn Validator>, first: bool) -> MiddlewareFn {
    from_fn(move |opts: MiddlewareOptions, next: Next| {
        let validator = Arc::clone(&validator);
        async move {
            let raw = opts.raw_input().await?;
            let parsed = validator.parse(&raw).map_err(|e| {
                debug!(path = %opts.path, error = %e, "Input validation failed");
                RpcError::bad_request("Input validation failed")
                    .with_cause(e.message.clone())
                    .with_details(serde_json::json!({ "errors": e.errors }))
            })?;
            let input = if first {
                parsed
            } else {
                deep_merge(opts.input, parsed)
            };
            trace!(path = %opts.path, "Input parsed");
            Ok(next.run_with(NextOptions::new().with_input(input)).await)
        }
    })
}

/// Middleware parsing the resolver's result.
///
/// Results holding deferred values or lazy sequences pass through unchecked.
pub(crate) fn output_middleware(validator: Arc<dyn Validator>) -> MiddlewareFn {
    from_fn(move |opts: MiddlewareOptions, next: Next| {
        let validator = Arc::clone(&validator);
        async move {
            let result = next.run().await;
            Ok(result.map_data(|data| {
                if data.contains_async() {
                    trace!(path = %opts.path, "Skipping output validation of streamed result");
                    return Ok(data);
                }
                let plain = data.to_plain_json().unwrap_or(Value::Null);
                validator
                    .parse(&plain)
                    .map(StreamValue::Json)
                    .map_err(|e| {
                        warn!(path = %opts.path, error = %e, "Output validation failed");
                        RpcError::internal("Output validation failed").with_cause(e.message)
                    })
            }))
        }
    })
}

/// Reject inputs whose serialized size exceeds `max` bytes.
pub fn validate_input_size(input: &Value, max: usize) -> RpcResult<()> {
    let estimated = match input {
        Value::Null => 4,
        Value::Bool(_) => 5,
        Value::Number(_) => 20,
        Value::String(s) => s.len() + 2,
        _ => serde_json::to_vec(input).map(|v| v.len()).unwrap_or(0),
    };
    if estimated > max {
        return Err(RpcError::payload_too_large(format!(
            "Input size {estimated} bytes exceeds maximum {max} bytes"
        )));
    }
    Ok(())
}
