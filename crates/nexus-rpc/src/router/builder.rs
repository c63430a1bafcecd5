//! Router assembly
//!
//! Procedures are registered under dotted paths; nested builders are merged
//! under a prefix. [`RouterBuilder::build`] flattens everything into one map
//! and rejects bad paths.

use super::core::Router;
use crate::config::RpcConfig;
use crate::procedure::{BuildError, Procedure};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Segments that collide with protocol-level method names.
pub const RESERVED_WORDS: &[&str] = &["then"];

const SEGMENT_PATTERN: &str = r"^[A-Za-z0-9_-]+$";

/// Builder for a [`Router`].
///
/// # Example
/// ```rust,ignore
/// let router = Router::builder()
///     .procedure("health", health)
///     .merge("post", Router::builder()
///         .procedure("byId", by_id)
///         .procedure("add", add))
///     .build()?;
/// // Creates: health, post.byId, post.add
/// ```
#[derive(Debug, Default)]
pub struct RouterBuilder {
    entries: Vec<(String, Arc<Procedure>)>,
    config: RpcConfig,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use = "This method returns a new RouterBuilder and does not modify self"]
    pub fn procedure(mut self, path: impl Into<String>, procedure: Procedure) -> Self {
        self.entries.push((path.into(), Arc::new(procedure)));
        self
    }

    /// Nest another builder's procedures under `prefix`.
    ///
    /// The nested builder's config is ignored.
    #[must_use = "This method returns a new RouterBuilder and does not modify self"]
    pub fn merge(mut self, prefix: impl Into<String>, other: RouterBuilder) -> Self {
        let prefix = prefix.into();
        for (path, procedure) in other.entries {
            let full_path = if prefix.is_empty() {
                path
            } else {
                format!("{prefix}.{path}")
            };
            self.entries.push((full_path, procedure));
        }
        self
    }

    #[must_use = "This method returns a new RouterBuilder and does not modify self"]
    pub fn config(mut self, config: RpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Flatten into a [`Router`].
    ///
    /// # Errors
    ///
    /// - [`BuildError::InvalidPath`] for empty segments or characters outside
    ///   `[A-Za-z0-9_-]`
    /// - [`BuildError::ReservedWord`] for a segment in [`RESERVED_WORDS`]
    /// - [`BuildError::DuplicatePath`] when two procedures share a path
    pub fn build(self) -> Result<Router, BuildError> {
        let segment_re = Regex::new(SEGMENT_PATTERN).map_err(|e| BuildError::InvalidPath {
            path: SEGMENT_PATTERN.to_string(),
            reason: e.to_string(),
        })?;

        let mut procedures: HashMap<String, Arc<Procedure>> = HashMap::new();
        for (path, procedure) in self.entries {
            validate_path(&path, &segment_re)?;
            if procedures.contains_key(&path) {
                return Err(BuildError::DuplicatePath(path));
            }
            procedures.insert(path, procedure);
        }

        debug!(procedures = procedures.len(), "Router built");
        Ok(Router::new(procedures, self.config))
    }
}

fn validate_path(path: &str, segment_re: &Regex) -> Result<(), BuildError> {
    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(BuildError::InvalidPath {
                path: path.to_string(),
                reason: "empty path segment".to_string(),
            });
        }
        if RESERVED_WORDS.contains(&segment) {
            return Err(BuildError::ReservedWord {
                path: path.to_string(),
                segment: segment.to_string(),
            });
        }
        if !segment_re.is_match(segment) {
            return Err(BuildError::InvalidPath {
                path: path.to_string(),
                reason: format!("segment \"{segment}\" contains invalid characters"),
            });
        }
    }
    Ok(())
}
