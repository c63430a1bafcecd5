//! Flattened router and call dispatch

use super::builder::RouterBuilder;
use crate::config::RpcConfig;
use crate::error::{RpcError, RpcResult};
use crate::middleware::{ProcedureType, raw_input};
use crate::procedure::{CallOptions, Procedure};
use crate::validation::validate_input_size;
use crate::value::StreamValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Immutable map from full dotted path to procedure.
#[derive(Debug, Clone)]
pub struct Router {
    procedures: Arc<HashMap<String, Arc<Procedure>>>,
    config: Arc<RpcConfig>,
}

impl Router {
    pub(crate) fn new(procedures: HashMap<String, Arc<Procedure>>, config: RpcConfig) -> Self {
        Self {
            procedures: Arc::new(procedures),
            config: Arc::new(config),
        }
    }

    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// List all registered procedure paths
    pub fn procedures(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.procedures.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn get(&self, path: &str) -> Option<&Arc<Procedure>> {
        self.procedures.get(path)
    }

    /// Check if a path is a subscription
    pub fn is_subscription(&self, path: &str) -> bool {
        self.get(path)
            .is_some_and(|p| p.kind() == ProcedureType::Subscription)
    }

    /// Find the procedure for a path and call kind.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` when the path is unknown or registered with another kind.
    pub fn lookup(&self, path: &str, kind: ProcedureType) -> RpcResult<Arc<Procedure>> {
        match self.procedures.get(path) {
            Some(procedure) if procedure.kind() == kind => Ok(Arc::clone(procedure)),
            found => {
                debug!(path = %path, kind = %kind, registered = found.is_some(), "Procedure not found");
                Err(
                    RpcError::not_found(format!("No \"{kind}\"-procedure on path \"{path}\""))
                        .with_path(path),
                )
            }
        }
    }

    /// Call a procedure.
    ///
    /// The raw input is read once and checked against `max_input_size`
    /// before the pipeline runs.
    pub async fn call(&self, call: CallOptions) -> RpcResult<StreamValue> {
        let procedure = self.lookup(&call.path, call.kind)?;
        let input = (call.raw_input)()
            .await
            .map_err(|e| e.with_path(call.path.clone()))?;
        validate_input_size(&input, self.config.max_input_size)
            .map_err(|e| e.with_path(call.path.clone()))?;

        trace!(path = %call.path, kind = %call.kind, "Dispatching call");
        procedure
            .invoke(call.with_raw_input(raw_input(input)))
            .await
    }
}
