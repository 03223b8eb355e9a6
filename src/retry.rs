//! Retry eligibility and backoff.

use std::sync::Arc;

use crate::client_config::{BackoffMethod, RetryOptions};
use crate::error::DispatcherError;
use crate::request::HttpResponse;

/// Application-supplied fallback predicate consulted when none of the
/// built-in rules match a failure.
pub type RetryHandler = Arc<dyn Fn(&RequestFailure) -> bool + Send + Sync>;

/// Why one execution attempt failed.
#[derive(Debug, Clone)]
pub enum RequestFailure {
    /// The upstream answered with a non-success status.
    Status(HttpResponse),
    /// The attempt failed below HTTP.
    Network {
        kind: NetworkErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionReset,
    TimedOut,
    ConnectionAborted,
    Other,
}

impl RequestFailure {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RequestFailure::Status(response) => Some(response.status),
            RequestFailure::Network { .. } => None,
        }
    }

    pub fn into_error(self) -> DispatcherError {
        match self {
            RequestFailure::Status(response) => DispatcherError::HttpStatus {
                status: response.status,
                body: response.body,
            },
            RequestFailure::Network { message, .. } => DispatcherError::Network(message),
        }
    }
}

/// Maps a reqwest failure onto the transport error classes the retry table
/// understands.
pub fn classify_reqwest_error(error: &reqwest::Error) -> RequestFailure {
    let kind = if error.is_timeout() {
        NetworkErrorKind::TimedOut
    } else if error.is_connect() {
        NetworkErrorKind::ConnectionReset
    } else if error.is_body() || error.is_request() {
        NetworkErrorKind::ConnectionAborted
    } else {
        NetworkErrorKind::Other
    };
    RequestFailure::Network {
        kind,
        message: error.to_string(),
    }
}

/// Retry options with every field resolved to a concrete value.
#[derive(Clone)]
pub struct ResolvedRetry {
    pub max_retries: u32,
    /// Backoff base in milliseconds for clients without a token bucket.
    pub backoff_base_ms: u64,
    pub backoff_method: BackoffMethod,
    pub retry_429s: bool,
    pub retry_5xxs: bool,
    pub retry_status_codes: Vec<u16>,
    pub retry_handler: Option<RetryHandler>,
    pub thaw_request_count: u32,
}

impl Default for ResolvedRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_method: BackoffMethod::Exponential,
            retry_429s: true,
            retry_5xxs: true,
            retry_status_codes: Vec::new(),
            retry_handler: None,
            thaw_request_count: 3,
        }
    }
}

impl ResolvedRetry {
    pub fn from_options(options: &RetryOptions) -> Self {
        let defaults = ResolvedRetry::default();
        Self {
            max_retries: options.max_retries.unwrap_or(defaults.max_retries),
            backoff_base_ms: options
                .retry_backoff_base_time
                .unwrap_or(defaults.backoff_base_ms),
            backoff_method: options
                .retry_backoff_method
                .unwrap_or(defaults.backoff_method),
            retry_429s: options.retry_429s.unwrap_or(defaults.retry_429s),
            retry_5xxs: options.retry_5xxs.unwrap_or(defaults.retry_5xxs),
            retry_status_codes: options.retry_status_codes.clone().unwrap_or_default(),
            retry_handler: options.retry_handler.clone(),
            thaw_request_count: options
                .thaw_request_count
                .unwrap_or(defaults.thaw_request_count),
        }
    }
}

/// Outcome of the retry decision for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub is_rate_limited: bool,
}

impl RetryDecision {
    const NO: RetryDecision = RetryDecision {
        retry: false,
        is_rate_limited: false,
    };
}

/// Applies the eligibility rules in order; the first match wins.
pub fn evaluate(options: &ResolvedRetry, failure: &RequestFailure, retries: u32) -> RetryDecision {
    if retries >= options.max_retries {
        return RetryDecision::NO;
    }

    match failure {
        RequestFailure::Status(response) => {
            if response.status == 429 && options.retry_429s {
                return RetryDecision {
                    retry: true,
                    is_rate_limited: true,
                };
            }
            if response.status >= 500 && options.retry_5xxs {
                return RetryDecision {
                    retry: true,
                    is_rate_limited: false,
                };
            }
            if options.retry_status_codes.contains(&response.status) {
                return RetryDecision {
                    retry: true,
                    is_rate_limited: false,
                };
            }
        }
        RequestFailure::Network { kind, .. } => {
            if matches!(
                kind,
                NetworkErrorKind::ConnectionReset
                    | NetworkErrorKind::TimedOut
                    | NetworkErrorKind::ConnectionAborted
            ) {
                return RetryDecision {
                    retry: true,
                    is_rate_limited: false,
                };
            }
        }
    }

    if let Some(handler) = &options.retry_handler {
        if handler(failure) {
            return RetryDecision {
                retry: true,
                is_rate_limited: false,
            };
        }
    }

    RetryDecision::NO
}

/// Backoff wait in milliseconds for the attempt numbered `retries`
/// (1-based). Token-bucket clients pass their refill interval so the
/// minimum backoff always spans at least one refill cycle.
pub fn backoff_wait_ms(
    options: &ResolvedRetry,
    retries: u32,
    bucket_interval_ms: Option<u64>,
) -> u64 {
    let base = bucket_interval_ms.unwrap_or(options.backoff_base_ms);
    let n = u64::from(retries.max(1));
    match options.backoff_method {
        BackoffMethod::Exponential => n.saturating_mul(n).saturating_mul(base),
        BackoffMethod::Linear => n.saturating_mul(base),
    }
}
