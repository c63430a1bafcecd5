use super::RequestId;
use super::config::{LogConfig, LogLevel};
use super::redaction::RedactionEngine;
use crate::middleware::{MiddlewareFn, MiddlewareOptions, MiddlewareResult, Next, from_fn};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, info, info_span, trace, warn};

/// True if `duration` exceeds the configured slow-call threshold.
pub fn should_log_slow_request(config: &LogConfig, duration: &Duration) -> bool {
    config
        .slow_request_threshold_ms
        .is_some_and(|threshold| duration.as_millis() as u64 > threshold)
}

fn serialized_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

/// Text for an optional logged payload.
fn field_text(value: Option<Value>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn log_success(
    level: LogLevel,
    request_id: &RequestId,
    opts: &MiddlewareOptions,
    duration_ms: Option<u64>,
    input: &str,
    output: &str,
) {
    let path = opts.path.as_str();
    let kind = opts.kind;
    match level {
        LogLevel::Trace => trace!(request_id = %request_id, path, kind = %kind, duration_ms, input, output, "RPC request completed"),
        LogLevel::Debug => debug!(request_id = %request_id, path, kind = %kind, duration_ms, input, output, "RPC request completed"),
        LogLevel::Info => info!(request_id = %request_id, path, kind = %kind, duration_ms, input, output, "RPC request completed"),
        LogLevel::Warn | LogLevel::Error | LogLevel::Off => {}
    }
}

/// Logging middleware.
///
/// Assigns a [`RequestId`], times the downstream chain, logs success at the
/// path's level and failure at `warn`, and flags calls slower than the
/// threshold. Inputs and outputs are redacted before they are logged.
/// The result is passed through unchanged.
pub fn logging_middleware(config: LogConfig) -> MiddlewareFn {
    let redactor = Arc::new(RedactionEngine::new(&config));
    let config = Arc::new(config);

    from_fn(move |opts: MiddlewareOptions, next: Next| {
        let config = Arc::clone(&config);
        let redactor = Arc::clone(&redactor);

        async move {
            if config.level == LogLevel::Off || !config.should_log_path(&opts.path) {
                return Ok(next.run().await);
            }

            let request_id = RequestId::new();
            let level = config.level_for_path(&opts.path);
            let input_size = config.log_sizes.then(|| serialized_size(&opts.input));
            let input = field_text(config.log_input.then(|| redactor.redact(&opts.input)));

            if level.should_log(LogLevel::Debug) {
                debug!(
                    request_id = %request_id,
                    path = %opts.path,
                    kind = %opts.kind,
                    input_size,
                    "RPC request started"
                );
            }

            let start = Instant::now();
            let result: MiddlewareResult = if config.create_spans {
                let span = info_span!(
                    "rpc_request",
                    request_id = %request_id,
                    path = %opts.path,
                    kind = %opts.kind,
                );
                next.run().instrument(span).await
            } else {
                next.run().await
            };
            let duration = start.elapsed();
            let duration_ms = config.log_timing.then(|| duration.as_millis() as u64);

            match result.error() {
                None if config.log_success && level != LogLevel::Off => {
                    let output = if config.log_output {
                        match result.data().and_then(|data| data.to_plain_json()) {
                            Some(plain) => redactor.redact(&plain).to_string(),
                            None => "<streaming>".to_string(),
                        }
                    } else {
                        String::new()
                    };
                    log_success(level, &request_id, &opts, duration_ms, &input, &output);
                }
                Some(error) if config.log_errors && level != LogLevel::Off => {
                    warn!(
                        request_id = %request_id,
                        path = %opts.path,
                        kind = %opts.kind,
                        duration_ms,
                        code = %error.code,
                        error = %error.message,
                        input = %input,
                        "RPC request failed"
                    );
                }
                _ => {}
            }

            if should_log_slow_request(&config, &duration) {
                warn!(
                    request_id = %request_id,
                    path = %opts.path,
                    duration_ms = duration.as_millis() as u64,
                    threshold_ms = config.slow_request_threshold_ms,
                    "Slow RPC request"
                );
            }

            Ok(result)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RpcErrorCode;
    use crate::error::RpcError;
    use crate::middleware::ProcedureType;
    use crate::procedure::{CallOptions, Procedure, ResolverOptions};
    use serde_json::json;

    #[test]
    fn test_slow_request_threshold() {
        let config = LogConfig::new().with_slow_request_threshold(Some(100));
        assert!(should_log_slow_request(&config, &Duration::from_millis(150)));
        assert!(!should_log_slow_request(&config, &Duration::from_millis(100)));

        let disabled = LogConfig::new().with_slow_request_threshold(None);
        assert!(!should_log_slow_request(&disabled, &Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_passes_results_through() {
        let config = LogConfig::new()
            .with_level(LogLevel::Trace)
            .with_input_logging(true)
            .with_output_logging(true);
        let echo = Procedure::builder()
            .use_boxed(logging_middleware(config))
            .query(|opts: ResolverOptions| async move { Ok::<_, RpcError>(opts.input) });

        let out = echo
            .invoke(CallOptions::new(
                "echo",
                ProcedureType::Query,
                json!({"password": "p", "n": 1}),
            ))
            .await
            .unwrap();
        assert_eq!(out.to_plain_json(), Some(json!({"password": "p", "n": 1})));
    }

    #[tokio::test]
    async fn test_passes_errors_through() {
        let failing = Procedure::builder()
            .use_boxed(logging_middleware(LogConfig::new().exclude_path("other")))
            .mutation(|_opts: ResolverOptions| async move {
                Err::<Value, _>(RpcError::forbidden("nope"))
            });

        let err = failing
            .invoke(CallOptions::new("admin.wipe", ProcedureType::Mutation, json!(null)))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::Forbidden);
        assert_eq!(err.message, "nope");
    }

    #[tokio::test]
    async fn test_excluded_path_still_runs() {
        let health = Procedure::builder()
            .use_boxed(logging_middleware(LogConfig::new().exclude_path("health")))
            .query(|_opts: ResolverOptions| async move { Ok::<_, RpcError>(json!("ok")) });

        let out = health
            .invoke(CallOptions::new("health", ProcedureType::Query, json!(null)))
            .await
            .unwrap();
        assert_eq!(out.to_plain_json(), Some(json!("ok")));
    }
}
