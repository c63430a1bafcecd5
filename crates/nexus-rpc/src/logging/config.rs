//! Logging configuration

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Calls slower than this are flagged.
pub const DEFAULT_SLOW_THRESHOLD_MS: u64 = 1000;

pub const DEFAULT_REDACTION_REPLACEMENT: &str = "[REDACTED]";

/// Field names redacted unless the set is cleared.
pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apiKey",
    "authorization",
    "credential",
    "private_key",
    "privateKey",
    "ssn",
    "credit_card",
    "creditCard",
    "card_number",
    "cardNumber",
    "cvv",
    "bearer",
];

/// Verbosity, from most verbose to disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    /// True if an event at `target` passes this threshold.
    pub fn should_log(&self, target: LogLevel) -> bool {
        *self != LogLevel::Off && target != LogLevel::Off && target >= *self
    }
}

/// Configuration for [`logging_middleware`](super::logging_middleware).
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub log_timing: bool,
    /// Log the (redacted) parsed input
    pub log_input: bool,
    /// Log the (redacted) plain-JSON output
    pub log_output: bool,
    pub log_sizes: bool,
    pub log_success: bool,
    pub log_errors: bool,
    /// Wrap the downstream chain in an `rpc_request` span
    pub create_spans: bool,
    /// Case-insensitive substrings of keys to redact
    pub redacted_fields: HashSet<String>,
    pub redaction_replacement: String,
    pub excluded_paths: HashSet<String>,
    /// Exact paths or `prefix.*` patterns
    pub procedure_levels: HashMap<String, LogLevel>,
    pub slow_request_threshold_ms: Option<u64>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_timing: true,
            log_input: false,
            log_output: false,
            log_sizes: true,
            log_success: true,
            log_errors: true,
            create_spans: true,
            redacted_fields: DEFAULT_SENSITIVE_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            redaction_replacement: DEFAULT_REDACTION_REPLACEMENT.to_string(),
            excluded_paths: HashSet::new(),
            procedure_levels: HashMap::new(),
            slow_request_threshold_ms: Some(DEFAULT_SLOW_THRESHOLD_MS),
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_timing(mut self, enabled: bool) -> Self {
        self.log_timing = enabled;
        self
    }

    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_input_logging(mut self, enabled: bool) -> Self {
        self.log_input = enabled;
        self
    }

    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_output_logging(mut self, enabled: bool) -> Self {
        self.log_output = enabled;
        self
    }

    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_sizes(mut self, enabled: bool) -> Self {
        self.log_sizes = enabled;
        self
    }

    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_success_logging(mut self, enabled: bool) -> Self {
        self.log_success = enabled;
        self
    }

    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_error_logging(mut self, enabled: bool) -> Self {
        self.log_errors = enabled;
        self
    }

    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_spans(mut self, enabled: bool) -> Self {
        self.create_spans = enabled;
        self
    }

    /// Add a field name to redact.
    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn redact_field(mut self, field: impl Into<String>) -> Self {
        self.redacted_fields.insert(field.into());
        self
    }

    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn redact_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.redacted_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Drop every redacted field, including the defaults.
    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn clear_redacted_fields(mut self) -> Self {
        self.redacted_fields.clear();
        self
    }

    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_redaction_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.redaction_replacement = replacement.into();
        self
    }

    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn exclude_path(mut self, path: impl Into<String>) -> Self {
        self.excluded_paths.insert(path.into());
        self
    }

    /// Override the level for one path or a `prefix.*` pattern.
    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_procedure_level(mut self, pattern: impl Into<String>, level: LogLevel) -> Self {
        self.procedure_levels.insert(pattern.into(), level);
        self
    }

    /// `None` disables slow-call detection.
    #[must_use = "This method returns a new LogConfig and does not modify self"]
    pub fn with_slow_request_threshold(mut self, threshold_ms: Option<u64>) -> Self {
        self.slow_request_threshold_ms = threshold_ms;
        self
    }

    pub fn should_log_path(&self, path: &str) -> bool {
        !self.excluded_paths.contains(path)
    }

    /// Effective level for a path: exact override, then the longest
    /// matching `prefix.*` pattern, then the global level.
    pub fn level_for_path(&self, path: &str) -> LogLevel {
        if let Some(level) = self.procedure_levels.get(path) {
            return *level;
        }
        self.procedure_levels
            .iter()
            .filter_map(|(pattern, level)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = path.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), *level))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, level)| level)
            .unwrap_or(self.level)
    }
}
