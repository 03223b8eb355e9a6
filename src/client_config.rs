//! Client specifications as produced by application generators.
//!
//! A [`ClientSpec`] names one upstream target and carries its rate limit,
//! retry behavior, request defaults, authentication, and optional
//! sub-clients. Sub-clients are flattened at load time: each child becomes a
//! standalone client named `parent:child` that inherits the parent's
//! configuration with its own values winning, and shares the parent's rate
//! limit unless it declares one of its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Authentication;
use crate::error::{DispatcherError, DispatcherResult};
use crate::request::{HttpResponse, RequestConfig};
use crate::retry::RetryHandler;

/// Mutates the outgoing request config after admission, before auth.
pub type RequestInterceptor = Arc<dyn Fn(RequestConfig) -> RequestConfig + Send + Sync>;

/// Mutates the upstream response before it is returned to the caller.
pub type ResponseInterceptor = Arc<dyn Fn(HttpResponse) -> HttpResponse + Send + Sync>;

/// Inspects a successful response and optionally replaces the client's rate
/// limit fleet-wide.
pub type RateLimitChangeHook =
    Arc<dyn Fn(&RateLimitSpec, &HttpResponse) -> Option<RateLimitSpec> + Send + Sync>;

/// Application-supplied factory returning the client specs for one
/// generator name.
pub type ClientGenerator = Arc<dyn Fn() -> Vec<ClientSpec> + Send + Sync>;

/// Declarative rate limit carried on the wire and in client specs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RateLimitSpec {
    NoLimit,
    #[serde(rename_all = "camelCase")]
    RequestLimit {
        /// Refill interval in milliseconds.
        interval: u64,
        tokens_to_add: f64,
        max_tokens: f64,
    },
    #[serde(rename_all = "camelCase")]
    ConcurrencyLimit { max_concurrency: u64 },
    #[serde(rename_all = "camelCase")]
    SharedLimit { client_name: String },
}

impl Default for RateLimitSpec {
    fn default() -> Self {
        RateLimitSpec::NoLimit
    }
}

/// Backoff growth curve for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffMethod {
    Exponential,
    Linear,
}

/// Retry behavior; unset fields fall back to the parent spec, then to the
/// built-in defaults (see [`crate::retry::ResolvedRetry`]).
#[derive(Clone, Default)]
pub struct RetryOptions {
    pub max_retries: Option<u32>,
    /// Backoff base in milliseconds for clients without a token bucket.
    pub retry_backoff_base_time: Option<u64>,
    pub retry_backoff_method: Option<BackoffMethod>,
    pub retry_429s: Option<bool>,
    pub retry_5xxs: Option<bool>,
    pub retry_status_codes: Option<Vec<u16>>,
    pub retry_handler: Option<RetryHandler>,
    pub thaw_request_count: Option<u32>,
}

impl RetryOptions {
    pub(crate) fn merged_over(child: &RetryOptions, parent: &RetryOptions) -> RetryOptions {
        RetryOptions {
            max_retries: child.max_retries.or(parent.max_retries),
            retry_backoff_base_time: child
                .retry_backoff_base_time
                .or(parent.retry_backoff_base_time),
            retry_backoff_method: child.retry_backoff_method.or(parent.retry_backoff_method),
            retry_429s: child.retry_429s.or(parent.retry_429s),
            retry_5xxs: child.retry_5xxs.or(parent.retry_5xxs),
            retry_status_codes: child
                .retry_status_codes
                .clone()
                .or_else(|| parent.retry_status_codes.clone()),
            retry_handler: child
                .retry_handler
                .clone()
                .or_else(|| parent.retry_handler.clone()),
            thaw_request_count: child.thaw_request_count.or(parent.thaw_request_count),
        }
    }
}

/// Defaults merged under every request config for a client. The caller's
/// explicit values always win.
#[derive(Debug, Clone, Default)]
pub struct RequestDefaults {
    pub headers: HashMap<String, String>,
    pub base_url: Option<String>,
    pub params: HashMap<String, String>,
}

impl RequestDefaults {
    fn merged_over(child: &RequestDefaults, parent: &RequestDefaults) -> RequestDefaults {
        let mut headers = parent.headers.clone();
        headers.extend(child.headers.clone());
        let mut params = parent.params.clone();
        params.extend(child.params.clone());
        RequestDefaults {
            headers,
            base_url: child.base_url.clone().or_else(|| parent.base_url.clone()),
            params,
        }
    }
}

/// Per-client request pipeline options.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Upper bound on how long an originator waits for admission before the
    /// record is considered abandoned. Defaults to 60 seconds.
    pub cleanup_timeout: Option<Duration>,
    pub metadata: Option<serde_json::Value>,
    pub defaults: RequestDefaults,
    pub request_interceptor: Option<RequestInterceptor>,
    pub response_interceptor: Option<ResponseInterceptor>,
}

impl RequestOptions {
    pub(crate) fn merged_over(child: &RequestOptions, parent: &RequestOptions) -> RequestOptions {
        RequestOptions {
            cleanup_timeout: child.cleanup_timeout.or(parent.cleanup_timeout),
            metadata: merge_json(&parent.metadata, &child.metadata),
            defaults: RequestDefaults::merged_over(&child.defaults, &parent.defaults),
            request_interceptor: child
                .request_interceptor
                .clone()
                .or_else(|| parent.request_interceptor.clone()),
            response_interceptor: child
                .response_interceptor
                .clone()
                .or_else(|| parent.response_interceptor.clone()),
        }
    }
}

/// Options handed to the underlying HTTP client.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpOptions {
    pub timeout: Option<Duration>,
}

impl HttpOptions {
    pub(crate) fn merged_over(child: &HttpOptions, parent: &HttpOptions) -> HttpOptions {
        HttpOptions {
            timeout: child.timeout.or(parent.timeout),
        }
    }
}

/// Full specification of one named client.
#[derive(Clone, Default)]
pub struct ClientSpec {
    pub name: String,
    /// `None` means no limit for a top-level client, and "share the
    /// parent's limit" for a sub-client.
    pub rate_limit: Option<RateLimitSpec>,
    pub rate_limit_change: Option<RateLimitChangeHook>,
    pub request_options: RequestOptions,
    pub retry_options: RetryOptions,
    /// Status codes whose failures are logged at debug instead of error.
    pub http_status_codes_to_mute: Option<Vec<u16>>,
    /// Cadence of the per-client health tick. Defaults to 10 seconds.
    pub health_check_interval: Option<Duration>,
    pub metadata: Option<serde_json::Value>,
    pub http_options: HttpOptions,
    pub authentication: Option<Authentication>,
    pub sub_clients: Vec<ClientSpec>,
}

impl ClientSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitSpec) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    fn validate(&self) -> DispatcherResult<()> {
        if self.name.is_empty() {
            return Err(DispatcherError::InvalidSpec(
                "client name must not be empty".to_string(),
            ));
        }
        if self.name.contains(':') {
            return Err(DispatcherError::InvalidSpec(format!(
                "client name {} must not contain ':' (reserved for sub-clients)",
                self.name
            )));
        }
        match &self.rate_limit {
            Some(RateLimitSpec::RequestLimit {
                interval,
                tokens_to_add,
                max_tokens,
            }) => {
                if *interval == 0 || *tokens_to_add <= 0.0 || *max_tokens <= 0.0 {
                    return Err(DispatcherError::InvalidSpec(format!(
                        "client {} has a degenerate request limit",
                        self.name
                    )));
                }
            }
            Some(RateLimitSpec::ConcurrencyLimit { max_concurrency }) => {
                if *max_concurrency == 0 {
                    return Err(DispatcherError::InvalidSpec(format!(
                        "client {} has maxConcurrency 0",
                        self.name
                    )));
                }
            }
            Some(RateLimitSpec::SharedLimit { client_name }) => {
                if client_name.is_empty() || client_name == &self.name {
                    return Err(DispatcherError::InvalidSpec(format!(
                        "client {} shares an invalid target",
                        self.name
                    )));
                }
            }
            Some(RateLimitSpec::NoLimit) | None => {}
        }
        Ok(())
    }
}

/// Flattens a spec tree into standalone clients, validating each node.
///
/// The parent's effective spec loses its `sub_clients`; each child inherits
/// the parent's configuration with child values winning and is renamed
/// `parent:child`. Nesting flattens recursively (`a:b:c`).
pub fn flatten_spec(spec: ClientSpec) -> DispatcherResult<Vec<ClientSpec>> {
    spec.validate()?;
    flatten_nested(spec)
}

fn flatten_nested(spec: ClientSpec) -> DispatcherResult<Vec<ClientSpec>> {
    let mut flattened = Vec::new();
    let mut parent = spec;
    let children = std::mem::take(&mut parent.sub_clients);

    for child in children {
        child.validate()?;
        let inherited = inherit(&parent, child);
        flattened.extend(flatten_nested(inherited)?);
    }
    flattened.insert(0, parent);
    Ok(flattened)
}

fn inherit(parent: &ClientSpec, child: ClientSpec) -> ClientSpec {
    let shared_fallback = RateLimitSpec::SharedLimit {
        client_name: parent.name.clone(),
    };
    ClientSpec {
        name: format!("{}:{}", parent.name, child.name),
        rate_limit: Some(child.rate_limit.unwrap_or(shared_fallback)),
        rate_limit_change: child
            .rate_limit_change
            .or_else(|| parent.rate_limit_change.clone()),
        request_options: RequestOptions::merged_over(
            &child.request_options,
            &parent.request_options,
        ),
        retry_options: RetryOptions::merged_over(&child.retry_options, &parent.retry_options),
        http_status_codes_to_mute: child
            .http_status_codes_to_mute
            .or_else(|| parent.http_status_codes_to_mute.clone()),
        health_check_interval: child
            .health_check_interval
            .or(parent.health_check_interval),
        metadata: merge_json(&parent.metadata, &child.metadata),
        http_options: HttpOptions::merged_over(&child.http_options, &parent.http_options),
        authentication: child
            .authentication
            .or_else(|| parent.authentication.clone()),
        sub_clients: child.sub_clients,
    }
}

/// Shallow merge of two optional JSON values. Objects merge key-wise with
/// the child winning; any other shape is replaced outright by the child.
fn merge_json(
    parent: &Option<serde_json::Value>,
    child: &Option<serde_json::Value>,
) -> Option<serde_json::Value> {
    match (parent, child) {
        (Some(serde_json::Value::Object(p)), Some(serde_json::Value::Object(c))) => {
            let mut merged = p.clone();
            for (key, value) in c {
                merged.insert(key.clone(), value.clone());
            }
            Some(serde_json::Value::Object(merged))
        }
        (_, Some(c)) => Some(c.clone()),
        (Some(p), None) => Some(p.clone()),
        (None, None) => None,
    }
}
