//! Per-client coordinator.
//!
//! A [`Client`] exists on every instance that registers its name. Exactly
//! one of them holds the controller role at a time and runs the admission
//! loop; all others are workers that mirror the request map from broadcasts
//! so a promoted worker can resume where the old controller left off. The
//! originating instance of a request drives the execution pipeline
//! regardless of role: it enqueues, waits for its `requestReady`, performs
//! the HTTP call, and reports the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{Authentication, Authenticator};
use crate::client_config::{
    ClientSpec, RateLimitChangeHook, RateLimitSpec, RequestDefaults, RequestInterceptor,
    ResponseInterceptor,
};
use crate::error::{DispatcherError, DispatcherResult};
use crate::events::CompletionBus;
use crate::protocol::{Channel, Namespace, RateLimitUpdate, RequestEnvelope, RequestOutcome, TokensUpdate};
use crate::rate_limit::RateLimitPolicy;
use crate::request::{
    admission_order, HttpResponse, RequestConfig, RequestRecord, RequestStatus,
};
use crate::retry::{self, classify_reqwest_error, NetworkErrorKind, RequestFailure, ResolvedRetry};
use crate::stats::{ClientStats, RateLimitSnapshot, RequestBucketStats};
use crate::transport::Transport;

const REQUEST_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const REQUEST_HEARTBEAT_EXPIRY: Duration = Duration::from_secs(3);
const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Role of this instance for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Controller,
    Worker,
}

/// Behavior resolved from the client spec at construction time.
pub(crate) struct ClientOptions {
    pub retry: ResolvedRetry,
    pub defaults: RequestDefaults,
    pub cleanup_timeout: Duration,
    pub health_check_interval: Duration,
    pub http_status_codes_to_mute: Vec<u16>,
    pub request_interceptor: Option<RequestInterceptor>,
    pub response_interceptor: Option<ResponseInterceptor>,
    pub rate_limit_change: Option<RateLimitChangeHook>,
    pub authentication: Option<Authentication>,
    pub metadata: Option<serde_json::Value>,
}

struct TrackedRequest {
    record: RequestRecord,
    last_heartbeat: Instant,
}

struct ClientState {
    role: ClientRole,
    policy: RateLimitPolicy,
    requests: HashMap<String, TrackedRequest>,
    /// Sorted request ids, rebuilt lazily when `dirty` is set.
    order: Vec<String>,
    dirty: bool,
    frozen: bool,
    thaw_remaining: u32,
    thaw_request_id: Option<String>,
    /// Single-owner guard for the admission loop.
    loop_guard: Option<Uuid>,
    freeze_generation: u64,
    ticker_generation: u64,
    ticker_running: bool,
}

pub struct Client {
    pub name: String,
    namespace: Namespace,
    transport: Arc<dyn Transport>,
    completions: Arc<CompletionBus>,
    authenticator: Arc<Authenticator>,
    http: reqwest::Client,
    options: ClientOptions,
    state: Mutex<ClientState>,
    admission_notify: Notify,
}

impl Client {
    pub(crate) fn from_spec(
        spec: ClientSpec,
        namespace: Namespace,
        transport: Arc<dyn Transport>,
        completions: Arc<CompletionBus>,
        authenticator: Arc<Authenticator>,
    ) -> DispatcherResult<Arc<Self>> {
        let policy =
            RateLimitPolicy::from_spec(&spec.rate_limit.unwrap_or(RateLimitSpec::NoLimit));

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = spec.http_options.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build()?;

        let options = ClientOptions {
            retry: ResolvedRetry::from_options(&spec.retry_options),
            defaults: spec.request_options.defaults,
            cleanup_timeout: spec
                .request_options
                .cleanup_timeout
                .unwrap_or(DEFAULT_CLEANUP_TIMEOUT),
            health_check_interval: spec
                .health_check_interval
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL),
            http_status_codes_to_mute: spec.http_status_codes_to_mute.unwrap_or_default(),
            request_interceptor: spec.request_options.request_interceptor,
            response_interceptor: spec.request_options.response_interceptor,
            rate_limit_change: spec.rate_limit_change,
            authentication: spec.authentication,
            metadata: spec.metadata,
        };

        Ok(Arc::new(Self {
            name: spec.name,
            namespace,
            transport,
            completions,
            authenticator,
            http,
            options,
            state: Mutex::new(ClientState {
                role: ClientRole::Worker,
                policy,
                requests: HashMap::new(),
                order: Vec::new(),
                dirty: false,
                frozen: false,
                thaw_remaining: 0,
                thaw_request_id: None,
                loop_guard: None,
                freeze_generation: 0,
                ticker_generation: 0,
                ticker_running: false,
            }),
            admission_notify: Notify::new(),
        }))
    }

    pub async fn role(&self) -> ClientRole {
        self.state.lock().await.role
    }

    pub(crate) async fn is_no_limit(&self) -> bool {
        self.state.lock().await.policy.is_no_limit()
    }

    pub(crate) async fn shared_target(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .policy
            .shared_target()
            .map(str::to_string)
    }

    pub(crate) async fn bucket_interval_ms(&self) -> Option<u64> {
        self.state.lock().await.policy.bucket_interval_ms()
    }

    pub(crate) fn health_check_interval(&self) -> Duration {
        self.options.health_check_interval
    }

    /// Application metadata carried by the client spec.
    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.options.metadata.as_ref()
    }

    /// Applies a role computed by the ownership algorithm. Idempotent;
    /// returns whether the role actually changed.
    pub(crate) async fn set_role(self: &Arc<Self>, role: ClientRole) -> bool {
        let mut state = self.state.lock().await;
        if state.role == role {
            return false;
        }
        state.role = role;
        info!(client = %self.name, role = ?role, "client role changed");

        match role {
            ClientRole::Controller => {
                // The mirror is now authoritative; rebuild derived counters.
                let in_flight: u64 = state
                    .requests
                    .values()
                    .filter(|t| t.record.status == RequestStatus::InProgress)
                    .map(|t| t.record.cost)
                    .sum();
                if let RateLimitPolicy::Concurrency(gate) = &mut state.policy {
                    gate.in_flight_cost = in_flight;
                }
                state.dirty = true;
                drop(state);
                self.ensure_ticker();
                self.kick_admission();
            }
            ClientRole::Worker => {
                state.loop_guard = None;
                state.ticker_generation += 1;
                state.ticker_running = false;
                drop(state);
                self.admission_notify.notify_one();
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Admission loop (controller side)
    // ------------------------------------------------------------------

    /// Starts the admission loop if no loop is running and there is work.
    pub(crate) fn kick_admission(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.run_admission_loop().await;
        });
    }

    async fn run_admission_loop(self: Arc<Self>) {
        let guard = Uuid::new_v4();
        {
            let mut state = self.state.lock().await;
            if state.role != ClientRole::Controller || state.loop_guard.is_some() {
                return;
            }
            if state.policy.is_no_limit() || state.policy.shared_target().is_some() {
                return;
            }
            let has_queued = state
                .requests
                .values()
                .any(|t| t.record.status == RequestStatus::InQueue);
            if !has_queued {
                return;
            }
            state.loop_guard = Some(guard);
        }
        debug!(client = %self.name, "admission loop started");

        loop {
            enum Step {
                Admit(RequestRecord, Option<f64>),
                Park,
                Drained,
            }

            let step = {
                let mut state = self.state.lock().await;
                if state.role != ClientRole::Controller || state.loop_guard != Some(guard) {
                    if state.loop_guard == Some(guard) {
                        state.loop_guard = None;
                    }
                    return;
                }

                if state.frozen || state.thaw_request_id.is_some() {
                    Step::Park
                } else {
                    match next_queued(&mut state) {
                        None => {
                            state.loop_guard = None;
                            Step::Drained
                        }
                        Some(request_id) => {
                            let cost = state.requests[&request_id].record.cost;
                            if state.policy.try_admit(cost) {
                                let thawing = state.thaw_remaining > 0;
                                let tracked =
                                    state.requests.get_mut(&request_id).expect("id from order");
                                tracked.record.status = RequestStatus::InProgress;
                                tracked.last_heartbeat = Instant::now();
                                let record = tracked.record.clone();
                                if thawing {
                                    // One probe at a time while thawing.
                                    state.thaw_request_id = Some(request_id);
                                }
                                let tokens = match &state.policy {
                                    RateLimitPolicy::TokenBucket(bucket) => Some(bucket.tokens),
                                    _ => None,
                                };
                                Step::Admit(record, tokens)
                            } else {
                                Step::Park
                            }
                        }
                    }
                }
            };

            match step {
                Step::Drained => {
                    debug!(client = %self.name, "admission loop drained");
                    return;
                }
                Step::Park => {
                    self.admission_notify.notified().await;
                }
                Step::Admit(record, tokens) => {
                    debug!(
                        client = %self.name,
                        request = %record.request_id,
                        cost = record.cost,
                        "request admitted"
                    );
                    self.publish_envelope(Channel::RequestReady, &record).await;
                    if let Some(tokens) = tokens {
                        self.publish_tokens(tokens).await;
                    }
                }
            }
        }
    }

    /// Starts the token refill ticker when this instance controls a
    /// token-bucket client and none is running.
    pub(crate) fn ensure_ticker(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let (generation, period) = {
                let mut state = client.state.lock().await;
                if state.role != ClientRole::Controller || state.ticker_running {
                    return;
                }
                let Some(interval_ms) = state.policy.bucket_interval_ms() else {
                    return;
                };
                state.ticker_generation += 1;
                state.ticker_running = true;
                (state.ticker_generation, Duration::from_millis(interval_ms))
            };
            debug!(client = %client.name, period_ms = period.as_millis() as u64, "token ticker started");

            loop {
                sleep(period).await;
                let tokens = {
                    let mut state = client.state.lock().await;
                    if state.ticker_generation != generation
                        || state.role != ClientRole::Controller
                    {
                        return;
                    }
                    if state.frozen {
                        // No refills while frozen.
                        None
                    } else if let RateLimitPolicy::TokenBucket(bucket) = &mut state.policy {
                        bucket.refill_tick();
                        Some(bucket.tokens)
                    } else {
                        state.ticker_running = false;
                        return;
                    }
                };
                if let Some(tokens) = tokens {
                    client.publish_tokens(tokens).await;
                    client.admission_notify.notify_one();
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Broadcast handlers (all roles keep their mirror current)
    // ------------------------------------------------------------------

    pub(crate) async fn on_request_added(self: &Arc<Self>, record: RequestRecord) {
        let mut state = self.state.lock().await;
        state.requests.insert(
            record.request_id.clone(),
            TrackedRequest {
                record,
                last_heartbeat: Instant::now(),
            },
        );
        state.dirty = true;
        let is_controller = state.role == ClientRole::Controller;
        drop(state);

        self.admission_notify.notify_one();
        if is_controller {
            self.kick_admission();
        }
    }

    pub(crate) async fn on_request_heartbeat(self: &Arc<Self>, record: RequestRecord) {
        let mut state = self.state.lock().await;
        if let Some(tracked) = state.requests.get_mut(&record.request_id) {
            tracked.last_heartbeat = Instant::now();
            return;
        }
        // The requestAdded broadcast was lost; the heartbeat carries enough
        // to adopt the record.
        state.requests.insert(
            record.request_id.clone(),
            TrackedRequest {
                record,
                last_heartbeat: Instant::now(),
            },
        );
        state.dirty = true;
        let is_controller = state.role == ClientRole::Controller;
        drop(state);
        if is_controller {
            self.kick_admission();
        }
    }

    pub(crate) async fn on_request_ready(&self, record: RequestRecord) {
        let mut state = self.state.lock().await;
        if let Some(tracked) = state.requests.get_mut(&record.request_id) {
            tracked.record.status = RequestStatus::InProgress;
            tracked.last_heartbeat = Instant::now();
        }
    }

    pub(crate) async fn on_request_done(self: &Arc<Self>, outcome: RequestOutcome) {
        let mut state = self.state.lock().await;
        if let Some(tracked) = state.requests.remove(&outcome.record.request_id) {
            if tracked.record.status == RequestStatus::InProgress {
                state.policy.on_request_done(tracked.record.cost);
            }
            state.dirty = true;
        }
        if state.thaw_request_id.as_deref() == Some(outcome.record.request_id.as_str()) {
            state.thaw_request_id = None;
        }
        if outcome.succeeded && state.thaw_remaining > 0 {
            state.thaw_remaining -= 1;
            if state.thaw_remaining == 0 {
                info!(client = %self.name, "thaw complete, normal admission resumed");
            }
        }
        let is_controller = state.role == ClientRole::Controller;
        drop(state);

        if outcome.wait_time_ms > 0 {
            self.freeze_for(
                Duration::from_millis(outcome.wait_time_ms),
                outcome.is_rate_limited,
            )
            .await;
        }
        self.admission_notify.notify_one();
        if is_controller {
            self.kick_admission();
        }
    }

    /// Advisory token snapshot from the controller; workers mirror it for
    /// stats and never admit on it.
    pub(crate) async fn on_tokens_updated(&self, tokens: f64) {
        let mut state = self.state.lock().await;
        if state.role == ClientRole::Controller {
            return;
        }
        if let RateLimitPolicy::TokenBucket(bucket) = &mut state.policy {
            bucket.tokens = tokens.min(bucket.max_tokens);
        }
    }

    /// Replaces the policy fleet-wide after a rate-limit-change hook fired.
    pub(crate) async fn apply_rate_limit(self: &Arc<Self>, spec: RateLimitSpec) {
        let mut state = self.state.lock().await;
        let mut policy = RateLimitPolicy::from_spec(&spec);
        if let RateLimitPolicy::Concurrency(gate) = &mut policy {
            gate.in_flight_cost = state
                .requests
                .values()
                .filter(|t| t.record.status == RequestStatus::InProgress)
                .map(|t| t.record.cost)
                .sum();
        }
        state.policy = policy;
        state.ticker_generation += 1;
        state.ticker_running = false;
        let is_controller = state.role == ClientRole::Controller;
        drop(state);

        info!(client = %self.name, "rate limit replaced");
        if is_controller {
            self.ensure_ticker();
            self.kick_admission();
        }
        self.admission_notify.notify_one();
    }

    /// Drops records whose originator stopped heart-beating, freeing their
    /// capacity. Returns the number of dropped records.
    pub(crate) async fn sweep_stale_requests(self: &Arc<Self>) -> usize {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let stale: Vec<String> = state
            .requests
            .iter()
            .filter(|(_, t)| now.duration_since(t.last_heartbeat) > REQUEST_HEARTBEAT_EXPIRY)
            .map(|(id, _)| id.clone())
            .collect();
        if stale.is_empty() {
            return 0;
        }
        for request_id in &stale {
            if let Some(tracked) = state.requests.remove(request_id) {
                warn!(
                    client = %self.name,
                    request = %request_id,
                    "dropping request with lapsed heartbeat"
                );
                if tracked.record.status == RequestStatus::InProgress {
                    state.policy.on_request_done(tracked.record.cost);
                }
                if state.thaw_request_id.as_deref() == Some(request_id.as_str()) {
                    state.thaw_request_id = None;
                }
            }
        }
        state.dirty = true;
        let is_controller = state.role == ClientRole::Controller;
        drop(state);

        self.admission_notify.notify_one();
        if is_controller {
            self.kick_admission();
        }
        stale.len()
    }

    /// Periodic self-repair: sweeps stale records and restarts a dropped
    /// token ticker.
    pub(crate) async fn health_tick(self: &Arc<Self>) {
        self.sweep_stale_requests().await;
        self.ensure_ticker();
        if self.role().await == ClientRole::Controller {
            self.kick_admission();
        }
    }

    pub(crate) async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.role = ClientRole::Worker;
        state.loop_guard = None;
        state.ticker_generation += 1;
        state.ticker_running = false;
        state.freeze_generation += 1;
        state.requests.clear();
        state.order.clear();
        drop(state);
        self.admission_notify.notify_one();
    }

    async fn freeze_for(self: &Arc<Self>, wait: Duration, rate_limited: bool) {
        let generation = {
            let mut state = self.state.lock().await;
            state.frozen = true;
            state.freeze_generation += 1;
            state.policy.on_freeze();
            if rate_limited {
                state.thaw_remaining = self.options.retry.thaw_request_count;
            }
            warn!(
                client = %self.name,
                wait_ms = wait.as_millis() as u64,
                rate_limited,
                "client frozen"
            );
            state.freeze_generation
        };

        let client = Arc::clone(self);
        tokio::spawn(async move {
            sleep(wait).await;
            let mut state = client.state.lock().await;
            if state.freeze_generation != generation {
                return;
            }
            state.frozen = false;
            let is_controller = state.role == ClientRole::Controller;
            drop(state);
            debug!(client = %client.name, "client unfrozen");
            client.admission_notify.notify_one();
            if is_controller {
                client.kick_admission();
            }
        });
    }

    // ------------------------------------------------------------------
    // Request pipeline (originator side)
    // ------------------------------------------------------------------

    /// Runs one call through admission, execution and retries. `admission`
    /// is the client whose controller grants the slot; it is this client
    /// unless the policy delegates to a shared target.
    pub(crate) async fn submit(
        self: &Arc<Self>,
        admission: Arc<Client>,
        config: RequestConfig,
    ) -> DispatcherResult<HttpResponse> {
        let no_limit = admission.is_no_limit().await;
        let mut record = RequestRecord::new(
            admission.name.clone(),
            config.priority.unwrap_or(1),
            config.cost.unwrap_or(1).max(1),
        );

        loop {
            if no_limit {
                record.status = RequestStatus::InProgress;
            } else {
                let ready = self.completions.register(&record.request_id);
                record.status = RequestStatus::InQueue;
                let heartbeat = self.start_heartbeat(record.clone());
                self.publish_envelope(Channel::RequestAdded, &record).await;

                let waited = timeout(self.options.cleanup_timeout, ready).await;
                heartbeat.abort();
                match waited {
                    Ok(Ok(ready_record)) => record = ready_record,
                    Ok(Err(_)) | Err(_) => {
                        self.completions.discard(&record.request_id);
                        // Free the slot fleet-wide before giving up.
                        self.publish_outcome(RequestOutcome {
                            record: record.clone(),
                            succeeded: false,
                            wait_time_ms: 0,
                            is_rate_limited: false,
                        })
                        .await;
                        warn!(
                            client = %self.name,
                            request = %record.request_id,
                            "request abandoned waiting for admission"
                        );
                        return Err(DispatcherError::RequestAbandoned(record.request_id));
                    }
                }
            }

            let heartbeat = (!no_limit).then(|| self.start_heartbeat(record.clone()));
            let result = self.execute_once(&config).await;
            if let Some(heartbeat) = heartbeat {
                heartbeat.abort();
            }

            match result {
                Ok(response) => {
                    if let Some(hook) = &self.options.rate_limit_change {
                        let current = admission.policy_spec().await;
                        if let Some(new_spec) = hook(&current, &response) {
                            self.publish_rate_limit_update(&admission.name, new_spec)
                                .await;
                        }
                    }
                    if !no_limit {
                        self.publish_outcome(RequestOutcome {
                            record: record.clone(),
                            succeeded: true,
                            wait_time_ms: 0,
                            is_rate_limited: false,
                        })
                        .await;
                    }
                    return Ok(response);
                }
                Err(failure) => {
                    let decision = retry::evaluate(&self.options.retry, &failure, record.retries);
                    self.log_failure(&failure, &record, decision.retry);

                    if decision.retry {
                        record.retries += 1;
                        record.status = RequestStatus::InQueue;
                        let wait_time_ms = retry::backoff_wait_ms(
                            &self.options.retry,
                            record.retries,
                            admission.bucket_interval_ms().await,
                        );
                        if no_limit {
                            sleep(Duration::from_millis(wait_time_ms)).await;
                        } else {
                            self.publish_outcome(RequestOutcome {
                                record: record.clone(),
                                succeeded: false,
                                wait_time_ms,
                                is_rate_limited: decision.is_rate_limited,
                            })
                            .await;
                        }
                        continue;
                    }

                    if !no_limit {
                        self.publish_outcome(RequestOutcome {
                            record: record.clone(),
                            succeeded: false,
                            wait_time_ms: 0,
                            is_rate_limited: false,
                        })
                        .await;
                    }
                    return Err(failure.into_error());
                }
            }
        }
    }

    async fn execute_once(&self, config: &RequestConfig) -> Result<HttpResponse, RequestFailure> {
        let mut effective = self.effective_config(config);
        if let Some(interceptor) = &self.options.request_interceptor {
            effective = interceptor(effective);
        }
        if let Some(auth) = &self.options.authentication {
            let (header, value) = self
                .authenticator
                .header_for(&self.name, auth)
                .await
                .map_err(|e| RequestFailure::Network {
                    kind: NetworkErrorKind::Other,
                    message: e.to_string(),
                })?;
            effective.headers.insert(header, value);
        }

        let url = resolve_url(&effective)?;
        let method = parse_method(effective.method.as_deref())?;

        let mut request = self.http.request(method, &url);
        for (name, value) in &effective.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !effective.params.is_empty() {
            request = request.query(&effective.params);
        }
        if let Some(body) = &effective.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let mut http_response = HttpResponse {
            status,
            headers,
            body,
        };
        if http_response.is_success() {
            if let Some(interceptor) = &self.options.response_interceptor {
                http_response = interceptor(http_response);
            }
            Ok(http_response)
        } else {
            Err(RequestFailure::Status(http_response))
        }
    }

    /// Client defaults merged under the caller's config; explicit caller
    /// values win.
    fn effective_config(&self, config: &RequestConfig) -> RequestConfig {
        let defaults = &self.options.defaults;
        let mut headers = defaults.headers.clone();
        headers.extend(config.headers.clone());
        let mut params = defaults.params.clone();
        params.extend(config.params.clone());
        RequestConfig {
            base_url: config
                .base_url
                .clone()
                .or_else(|| defaults.base_url.clone()),
            headers,
            params,
            ..config.clone()
        }
    }

    fn log_failure(&self, failure: &RequestFailure, record: &RequestRecord, retrying: bool) {
        let muted = failure
            .status_code()
            .is_some_and(|status| self.options.http_status_codes_to_mute.contains(&status));
        if muted {
            debug!(
                client = %self.name,
                request = %record.request_id,
                retries = record.retries,
                retrying,
                "request failed (muted): {:?}",
                failure.status_code()
            );
        } else {
            match failure {
                RequestFailure::Status(response) => error!(
                    client = %self.name,
                    request = %record.request_id,
                    status = response.status,
                    retries = record.retries,
                    retrying,
                    "request failed"
                ),
                RequestFailure::Network { kind, message } => error!(
                    client = %self.name,
                    request = %record.request_id,
                    kind = ?kind,
                    retries = record.retries,
                    retrying,
                    "request failed: {}",
                    message
                ),
            }
        }
    }

    fn start_heartbeat(&self, record: RequestRecord) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let channel = self.namespace.channel(Channel::RequestHeartbeat);
        tokio::spawn(async move {
            let mut ticker = interval(REQUEST_HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Ok(payload) = serde_json::to_string(&RequestEnvelope {
                    record: record.clone(),
                }) {
                    let _ = transport.publish(&channel, &payload).await;
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Publishing and snapshots
    // ------------------------------------------------------------------

    async fn publish_envelope(&self, channel: Channel, record: &RequestRecord) {
        let envelope = RequestEnvelope {
            record: record.clone(),
        };
        match serde_json::to_string(&envelope) {
            Ok(payload) => {
                if let Err(e) = self
                    .transport
                    .publish(&self.namespace.channel(channel), &payload)
                    .await
                {
                    warn!(client = %self.name, "failed to publish {}: {}", channel.name(), e);
                }
            }
            Err(e) => warn!(client = %self.name, "failed to encode {}: {}", channel.name(), e),
        }
    }

    async fn publish_outcome(&self, outcome: RequestOutcome) {
        match serde_json::to_string(&outcome) {
            Ok(payload) => {
                if let Err(e) = self
                    .transport
                    .publish(&self.namespace.channel(Channel::RequestDone), &payload)
                    .await
                {
                    warn!(client = %self.name, "failed to publish requestDone: {}", e);
                }
            }
            Err(e) => warn!(client = %self.name, "failed to encode requestDone: {}", e),
        }
    }

    async fn publish_tokens(&self, tokens: f64) {
        let update = TokensUpdate {
            client_name: self.name.clone(),
            tokens,
        };
        if let Ok(payload) = serde_json::to_string(&update) {
            let _ = self
                .transport
                .publish(&self.namespace.channel(Channel::ClientTokensUpdated), &payload)
                .await;
        }
    }

    async fn publish_rate_limit_update(&self, client_name: &str, rate_limit: RateLimitSpec) {
        let update = RateLimitUpdate {
            client_name: client_name.to_string(),
            rate_limit,
        };
        match serde_json::to_string(&update) {
            Ok(payload) => {
                if let Err(e) = self
                    .transport
                    .publish(&self.namespace.channel(Channel::RateLimitUpdated), &payload)
                    .await
                {
                    warn!(client = %self.name, "failed to publish rateLimitUpdated: {}", e);
                }
            }
            Err(e) => warn!(client = %self.name, "failed to encode rateLimitUpdated: {}", e),
        }
    }

    pub(crate) async fn policy_spec(&self) -> RateLimitSpec {
        self.state.lock().await.policy.spec()
    }

    pub(crate) async fn stats(&self) -> ClientStats {
        let state = self.state.lock().await;
        let mut in_queue = Vec::new();
        let mut in_progress = Vec::new();
        for tracked in state.requests.values() {
            match tracked.record.status {
                RequestStatus::InQueue => in_queue.push(tracked.record.clone()),
                RequestStatus::InProgress => in_progress.push(tracked.record.clone()),
            }
        }
        in_queue.sort_by(admission_order);
        in_progress.sort_by(admission_order);

        let rate_limit = match &state.policy {
            RateLimitPolicy::NoLimit => RateLimitSnapshot::NoLimit,
            RateLimitPolicy::TokenBucket(bucket) => RateLimitSnapshot::RequestLimit {
                interval: bucket.interval.as_millis() as u64,
                tokens_to_add: bucket.tokens_to_add,
                max_tokens: bucket.max_tokens,
                tokens: bucket.tokens,
            },
            RateLimitPolicy::Concurrency(gate) => RateLimitSnapshot::ConcurrencyLimit {
                max_concurrency: gate.max_concurrency,
                in_flight_cost: gate.in_flight_cost,
            },
            RateLimitPolicy::Shared { target_client_name } => RateLimitSnapshot::SharedLimit {
                client_name: target_client_name.clone(),
            },
        };

        ClientStats {
            client_name: self.name.clone(),
            is_frozen: state.frozen,
            is_thawing: state.thaw_remaining > 0,
            thaw_request_count: state.thaw_remaining,
            rate_limit,
            requests_in_queue: RequestBucketStats::from_records(in_queue),
            requests_in_progress: RequestBucketStats::from_records(in_progress),
        }
    }
}

/// Next queued request id in admission order, re-sorting lazily when the
/// map changed since the last sort.
fn next_queued(state: &mut ClientState) -> Option<String> {
    if state.dirty {
        let mut records: Vec<&RequestRecord> =
            state.requests.values().map(|t| &t.record).collect();
        records.sort_by(|a, b| admission_order(a, b));
        state.order = records.iter().map(|r| r.request_id.clone()).collect();
        state.dirty = false;
    }
    state
        .order
        .iter()
        .find(|id| {
            state
                .requests
                .get(*id)
                .is_some_and(|t| t.record.status == RequestStatus::InQueue)
        })
        .cloned()
}

fn resolve_url(config: &RequestConfig) -> Result<String, RequestFailure> {
    if config.url.starts_with("http://") || config.url.starts_with("https://") {
        return Ok(config.url.clone());
    }
    match &config.base_url {
        Some(base) => Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            config.url.trim_start_matches('/')
        )),
        None => Err(RequestFailure::Network {
            kind: NetworkErrorKind::Other,
            message: format!("relative url {:?} without a base url", config.url),
        }),
    }
}

fn parse_method(method: Option<&str>) -> Result<reqwest::Method, RequestFailure> {
    match method {
        None => Ok(reqwest::Method::GET),
        Some(name) => reqwest::Method::from_bytes(name.to_uppercase().as_bytes()).map_err(|_| {
            RequestFailure::Network {
                kind: NetworkErrorKind::Other,
                message: format!("invalid http method {:?}", name),
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TokenCipher;
    use crate::testing::MemoryHub;

    fn build_client(spec: ClientSpec) -> Arc<Client> {
        let hub = MemoryHub::new();
        let namespace = Namespace::new(None);
        let transport = hub.transport();
        let authenticator = Arc::new(Authenticator::new(
            hub.transport(),
            TokenCipher::new("test-key").unwrap(),
            namespace.clone(),
        ));
        Client::from_spec(
            spec,
            namespace,
            transport,
            Arc::new(CompletionBus::new()),
            authenticator,
        )
        .unwrap()
    }

    fn queued_record(client: &str, id: &str, priority: i64, cost: u64) -> RequestRecord {
        let mut record = RequestRecord::new(client.to_string(), priority, cost);
        record.request_id = id.to_string();
        record
    }

    #[tokio::test]
    async fn set_role_is_idempotent() {
        let client = build_client(ClientSpec::new("api"));
        assert_eq!(client.role().await, ClientRole::Worker);
        assert!(client.set_role(ClientRole::Controller).await);
        assert!(!client.set_role(ClientRole::Controller).await);
        assert!(client.set_role(ClientRole::Worker).await);
    }

    #[tokio::test]
    async fn promotion_rebuilds_concurrency_accounting_from_mirror() {
        let spec = ClientSpec::new("api").with_rate_limit(RateLimitSpec::ConcurrencyLimit {
            max_concurrency: 3,
        });
        let client = build_client(spec);

        let mut running = queued_record("api", "r-1", 1, 2);
        running.status = RequestStatus::InProgress;
        client.on_request_added(running).await;
        client.set_role(ClientRole::Controller).await;

        let stats = client.stats().await;
        match stats.rate_limit {
            RateLimitSnapshot::ConcurrencyLimit { in_flight_cost, .. } => {
                assert_eq!(in_flight_cost, 2)
            }
            other => panic!("unexpected snapshot: {:?}", other),
        }
    }

    #[tokio::test]
    async fn done_outcome_releases_capacity_and_record() {
        let spec = ClientSpec::new("api").with_rate_limit(RateLimitSpec::ConcurrencyLimit {
            max_concurrency: 2,
        });
        let client = build_client(spec);
        client.set_role(ClientRole::Controller).await;

        let mut record = queued_record("api", "r-1", 1, 2);
        record.status = RequestStatus::InProgress;
        client.on_request_added(record.clone()).await;

        client
            .on_request_done(RequestOutcome {
                record,
                succeeded: true,
                wait_time_ms: 0,
                is_rate_limited: false,
            })
            .await;

        let stats = client.stats().await;
        assert_eq!(stats.requests_in_progress.count, 0);
        match stats.rate_limit {
            RateLimitSnapshot::ConcurrencyLimit { in_flight_cost, .. } => {
                assert_eq!(in_flight_cost, 0)
            }
            other => panic!("unexpected snapshot: {:?}", other),
        }
    }

    #[tokio::test]
    async fn rate_limited_outcome_freezes_and_arms_thaw() {
        let spec = ClientSpec::new("api").with_rate_limit(RateLimitSpec::RequestLimit {
            interval: 1000,
            tokens_to_add: 1.0,
            max_tokens: 5.0,
        });
        let client = build_client(spec);
        client.set_role(ClientRole::Controller).await;

        let record = queued_record("api", "r-1", 1, 1);
        client.on_request_added(record.clone()).await;
        client
            .on_request_done(RequestOutcome {
                record,
                succeeded: false,
                wait_time_ms: 500,
                is_rate_limited: true,
            })
            .await;

        let stats = client.stats().await;
        assert!(stats.is_frozen);
        assert!(stats.is_thawing);
        assert_eq!(stats.thaw_request_count, 3);
        match stats.rate_limit {
            RateLimitSnapshot::RequestLimit { tokens, .. } => assert_eq!(tokens, 0.0),
            other => panic!("unexpected snapshot: {:?}", other),
        }

        // The freeze timer lapses and admission may resume.
        sleep(Duration::from_millis(600)).await;
        let stats = client.stats().await;
        assert!(!stats.is_frozen);
        assert!(stats.is_thawing);
    }

    #[tokio::test]
    async fn successes_drain_the_thaw_counter() {
        let spec = ClientSpec::new("api").with_rate_limit(RateLimitSpec::ConcurrencyLimit {
            max_concurrency: 5,
        });
        let client = build_client(spec);
        client.set_role(ClientRole::Controller).await;

        {
            let mut state = client.state.lock().await;
            state.thaw_remaining = 2;
        }
        for id in ["r-1", "r-2"] {
            let record = queued_record("api", id, 1, 1);
            client.on_request_added(record.clone()).await;
            client
                .on_request_done(RequestOutcome {
                    record,
                    succeeded: true,
                    wait_time_ms: 0,
                    is_rate_limited: false,
                })
                .await;
        }
        let stats = client.stats().await;
        assert!(!stats.is_thawing);
        assert_eq!(stats.thaw_request_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_requests_are_swept_after_heartbeat_expiry() {
        let client = build_client(ClientSpec::new("api").with_rate_limit(
            RateLimitSpec::ConcurrencyLimit { max_concurrency: 1 },
        ));
        client.set_role(ClientRole::Controller).await;

        let record = queued_record("api", "r-1", 1, 1);
        client.on_request_added(record).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(client.sweep_stale_requests().await, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(client.sweep_stale_requests().await, 1);
        assert_eq!(client.stats().await.requests_in_queue.count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_records_alive() {
        let client = build_client(ClientSpec::new("api").with_rate_limit(
            RateLimitSpec::ConcurrencyLimit { max_concurrency: 1 },
        ));
        let record = queued_record("api", "r-1", 1, 1);
        client.on_request_added(record.clone()).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        client.on_request_heartbeat(record).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(client.sweep_stale_requests().await, 0);
    }

    #[tokio::test]
    async fn worker_mirrors_advisory_tokens_but_controller_ignores_them() {
        let spec = ClientSpec::new("api").with_rate_limit(RateLimitSpec::RequestLimit {
            interval: 1000,
            tokens_to_add: 1.0,
            max_tokens: 10.0,
        });
        let client = build_client(spec);

        client.on_tokens_updated(4.0).await;
        match client.stats().await.rate_limit {
            RateLimitSnapshot::RequestLimit { tokens, .. } => assert_eq!(tokens, 4.0),
            other => panic!("unexpected snapshot: {:?}", other),
        }

        client.set_role(ClientRole::Controller).await;
        client.on_tokens_updated(1.0).await;
        match client.stats().await.rate_limit {
            RateLimitSnapshot::RequestLimit { tokens, .. } => assert_ne!(tokens, 1.0),
            other => panic!("unexpected snapshot: {:?}", other),
        }
    }

    #[tokio::test]
    async fn apply_rate_limit_preserves_in_flight_cost() {
        let client = build_client(ClientSpec::new("api").with_rate_limit(
            RateLimitSpec::ConcurrencyLimit { max_concurrency: 2 },
        ));
        let mut record = queued_record("api", "r-1", 1, 2);
        record.status = RequestStatus::InProgress;
        client.on_request_added(record).await;

        client
            .apply_rate_limit(RateLimitSpec::ConcurrencyLimit { max_concurrency: 9 })
            .await;
        match client.stats().await.rate_limit {
            RateLimitSnapshot::ConcurrencyLimit {
                max_concurrency,
                in_flight_cost,
            } => {
                assert_eq!(max_concurrency, 9);
                assert_eq!(in_flight_cost, 2);
            }
            other => panic!("unexpected snapshot: {:?}", other),
        }
    }

    #[test]
    fn url_resolution_prefers_absolute_urls() {
        let mut config = RequestConfig::get("api", "https://example.com/v1");
        config.base_url = Some("https://other.example".to_string());
        assert_eq!(resolve_url(&config).unwrap(), "https://example.com/v1");

        let mut config = RequestConfig::get("api", "/v1/items");
        config.base_url = Some("https://api.example/".to_string());
        assert_eq!(resolve_url(&config).unwrap(), "https://api.example/v1/items");

        let config = RequestConfig::get("api", "v1/items");
        assert!(resolve_url(&config).is_err());
    }

    #[test]
    fn methods_parse_case_insensitively() {
        assert_eq!(parse_method(None).unwrap(), reqwest::Method::GET);
        assert_eq!(parse_method(Some("post")).unwrap(), reqwest::Method::POST);
        assert!(parse_method(Some("not a method")).is_err());
    }
}
