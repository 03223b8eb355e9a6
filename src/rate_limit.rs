//! Runtime rate-limit policies.
//!
//! The controller for a client is the only authority over these counters.
//! Workers carry the same structures but only mirror advisory snapshots for
//! stats. Waiting for admission happens in the client's admission loop; the
//! policy itself only answers "can this cost pass right now" and keeps its
//! books when requests finish.

use std::time::Duration;

use crate::client_config::RateLimitSpec;

/// Token bucket refilled by a background ticker.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    pub interval: Duration,
    pub tokens_to_add: f64,
    pub max_tokens: f64,
    pub tokens: f64,
}

impl TokenBucket {
    pub fn new(interval_ms: u64, tokens_to_add: f64, max_tokens: f64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            tokens_to_add,
            max_tokens,
            // Buckets start full so a fresh client serves an initial burst.
            tokens: max_tokens,
        }
    }

    /// One ticker step. Never called while the client is frozen.
    pub fn refill_tick(&mut self) {
        self.tokens = (self.tokens + self.tokens_to_add).min(self.max_tokens);
    }

    pub fn try_consume(&mut self, cost: u64) -> bool {
        let cost = cost as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// External rate-limit signal: the upstream told us we overran.
    pub fn drain(&mut self) {
        self.tokens = 0.0;
    }
}

/// Bounds the summed cost of requests currently in progress.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    pub max_concurrency: u64,
    pub in_flight_cost: u64,
}

impl ConcurrencyGate {
    pub fn new(max_concurrency: u64) -> Self {
        Self {
            max_concurrency,
            in_flight_cost: 0,
        }
    }

    pub fn try_admit(&mut self, cost: u64) -> bool {
        if self.in_flight_cost + cost <= self.max_concurrency {
            self.in_flight_cost += cost;
            true
        } else {
            false
        }
    }

    pub fn release(&mut self, cost: u64) {
        self.in_flight_cost = self.in_flight_cost.saturating_sub(cost);
    }
}

/// The policy variant a client runs under.
#[derive(Debug, Clone)]
pub enum RateLimitPolicy {
    TokenBucket(TokenBucket),
    Concurrency(ConcurrencyGate),
    NoLimit,
    /// All admission is delegated to the named client; a shared policy
    /// never admits anything itself.
    Shared { target_client_name: String },
}

impl RateLimitPolicy {
    pub fn from_spec(spec: &RateLimitSpec) -> Self {
        match spec {
            RateLimitSpec::NoLimit => RateLimitPolicy::NoLimit,
            RateLimitSpec::RequestLimit {
                interval,
                tokens_to_add,
                max_tokens,
            } => RateLimitPolicy::TokenBucket(TokenBucket::new(
                *interval,
                *tokens_to_add,
                *max_tokens,
            )),
            RateLimitSpec::ConcurrencyLimit { max_concurrency } => {
                RateLimitPolicy::Concurrency(ConcurrencyGate::new(*max_concurrency))
            }
            RateLimitSpec::SharedLimit { client_name } => RateLimitPolicy::Shared {
                target_client_name: client_name.clone(),
            },
        }
    }

    /// Attempts to admit `cost` units right now, consuming capacity on
    /// success. NoLimit always admits; Shared never does (its target's
    /// controller decides).
    pub fn try_admit(&mut self, cost: u64) -> bool {
        match self {
            RateLimitPolicy::TokenBucket(bucket) => bucket.try_consume(cost),
            RateLimitPolicy::Concurrency(gate) => gate.try_admit(cost),
            RateLimitPolicy::NoLimit => true,
            RateLimitPolicy::Shared { .. } => false,
        }
    }

    /// Returns capacity held by a finished request.
    pub fn on_request_done(&mut self, cost: u64) {
        if let RateLimitPolicy::Concurrency(gate) = self {
            gate.release(cost);
        }
    }

    /// A rate-limit breach was observed; token buckets empty out.
    pub fn on_freeze(&mut self) {
        if let RateLimitPolicy::TokenBucket(bucket) = self {
            bucket.drain();
        }
    }

    pub fn is_no_limit(&self) -> bool {
        matches!(self, RateLimitPolicy::NoLimit)
    }

    pub fn shared_target(&self) -> Option<&str> {
        match self {
            RateLimitPolicy::Shared { target_client_name } => Some(target_client_name),
            _ => None,
        }
    }

    pub fn bucket_interval_ms(&self) -> Option<u64> {
        match self {
            RateLimitPolicy::TokenBucket(bucket) => Some(bucket.interval.as_millis() as u64),
            _ => None,
        }
    }

    /// Declarative form of the current policy, used when replacing a policy
    /// fleet-wide and as the base of stats snapshots.
    pub fn spec(&self) -> RateLimitSpec {
        match self {
            RateLimitPolicy::TokenBucket(bucket) => RateLimitSpec::RequestLimit {
                interval: bucket.interval.as_millis() as u64,
                tokens_to_add: bucket.tokens_to_add,
                max_tokens: bucket.max_tokens,
            },
            RateLimitPolicy::Concurrency(gate) => RateLimitSpec::ConcurrencyLimit {
                max_concurrency: gate.max_concurrency,
            },
            RateLimitPolicy::NoLimit => RateLimitSpec::NoLimit,
            RateLimitPolicy::Shared { target_client_name } => RateLimitSpec::SharedLimit {
                client_name: target_client_name.clone(),
            },
        }
    }
}
