//! Sensitive-field redaction for logged values

use super::config::LogConfig;
use serde_json::{Map, Value};

/// Replaces the values of sensitive keys.
///
/// Field names are lowercased once; a key is sensitive if its lowercased
/// form contains any of them. Untouched subtrees are not rebuilt.
#[derive(Debug, Clone)]
pub struct RedactionEngine {
    fields_lower: Vec<String>,
    replacement: String,
}

impl RedactionEngine {
    pub fn new(config: &LogConfig) -> Self {
        Self {
            fields_lower: config
                .redacted_fields
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            replacement: config.redaction_replacement.clone(),
        }
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.fields_lower.iter().any(|field| key.contains(field.as_str()))
    }

    pub fn redact(&self, value: &Value) -> Value {
        self.redact_changed(value).unwrap_or_else(|| value.clone())
    }

    /// `None` when nothing under `value` needed redaction.
    fn redact_changed(&self, value: &Value) -> Option<Value> {
        match value {
            Value::Object(map) => {
                let mut changed = false;
                let mut out = Map::with_capacity(map.len());
                for (key, val) in map {
                    let next = if self.is_sensitive(key) {
                        changed = true;
                        Value::String(self.replacement.clone())
                    } else {
                        match self.redact_changed(val) {
                            Some(redacted) => {
                                changed = true;
                                redacted
                            }
                            None => val.clone(),
                        }
                    };
                    out.insert(key.clone(), next);
                }
                changed.then_some(Value::Object(out))
            }
            Value::Array(items) => {
                let mut changed = false;
                let out: Vec<Value> = items
                    .iter()
                    .map(|item| match self.redact_changed(item) {
                        Some(redacted) => {
                            changed = true;
                            redacted
                        }
                        None => item.clone(),
                    })
                    .collect();
                changed.then_some(Value::Array(out))
            }
            _ => None,
        }
    }
}

/// One-off redaction with a fresh engine.
pub fn redact_value(value: &Value, config: &LogConfig) -> Value {
    RedactionEngine::new(config).redact(value)
}
