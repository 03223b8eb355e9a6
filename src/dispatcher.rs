//! Process-level façade for the request coordination fleet.
//!
//! A [`Dispatcher`] is one instance among many sharing a Redis deployment.
//! It loads its clients from the configured generators, takes part in the
//! ownership election for every client name it registers, routes pub/sub
//! traffic to the right client, and exposes the request entry point.
//!
//! ## Lifecycle
//!
//! `start` subscribes to the coordination channels, registers the instance
//! under a 3 second TTL, announces itself, and spawns three background
//! tasks: the message router, the 1 second heartbeat, and the 1 second
//! reconciliation tick that prunes dead peers and re-syncs membership from
//! storage. `stop` tears all of that down and announces the departure.
//! Both are idempotent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::client::{Client, ClientRole};
use crate::client_config::{
    flatten_spec, ClientSpec, HttpOptions, RequestOptions, RetryOptions,
};
use crate::config::{ClientDefaults, DispatcherOptions};
use crate::crypto::TokenCipher;
use crate::error::{DispatcherError, DispatcherResult};
use crate::events::CompletionBus;
use crate::protocol::{
    Channel, DestroyDirective, InstanceAnnouncement, InstanceSignal, Namespace, RateLimitUpdate,
    RegenerateDirective, RequestEnvelope, RequestOutcome, TokensUpdate,
};
use crate::request::{HttpResponse, RequestConfig};
use crate::stats::ClientStats;
use crate::transport::{PubSubMessage, Transport};

const INSTANCE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const INSTANCE_TTL: Duration = Duration::from_secs(3);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// Built-in client available to every caller without configuration.
pub const DEFAULT_CLIENT: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Stopped,
    Starting,
    Started,
}

struct InstanceState {
    status: LifecycleStatus,
    clients: HashMap<String, Arc<Client>>,
    /// Which client names each generator produced, for regeneration.
    generator_outputs: HashMap<String, Vec<String>>,
    peers: crate::ownership::PeerTable,
    tasks: Vec<JoinHandle<()>>,
    last_announcement: Option<InstanceAnnouncement>,
}

struct Inner {
    id: String,
    priority: i64,
    namespace: Namespace,
    transport: Arc<dyn Transport>,
    completions: Arc<CompletionBus>,
    authenticator: Arc<Authenticator>,
    generators: HashMap<String, crate::client_config::ClientGenerator>,
    defaults: ClientDefaults,
    status_tx: watch::Sender<LifecycleStatus>,
    state: Mutex<InstanceState>,
}

/// One coordinating instance.
///
/// Cloning is cheap and shares the underlying instance.
///
/// # Example
///
/// ```rust,no_run
/// use dispatcher::{Dispatcher, DispatcherOptions, RedisTransport};
/// use dispatcher::{ClientSpec, RateLimitSpec, RequestConfig};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(RedisTransport::connect("redis://127.0.0.1:6379").await?);
/// let options = DispatcherOptions::new("secret-key-material", transport)
///     .with_generator("github", || {
///         vec![ClientSpec::new("github").with_rate_limit(RateLimitSpec::RequestLimit {
///             interval: 1000,
///             tokens_to_add: 10.0,
///             max_tokens: 10.0,
///         })]
///     });
///
/// let dispatcher = Dispatcher::new(options)?;
/// dispatcher.start().await?;
///
/// let response = dispatcher
///     .handle_request(RequestConfig::get("github", "https://api.github.com/rate_limit"))
///     .await?;
/// println!("status: {}", response.status);
///
/// dispatcher.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(options: DispatcherOptions) -> DispatcherResult<Self> {
        options.validate()?;

        let namespace = Namespace::new(options.key_prefix.as_deref());
        let cipher = TokenCipher::new(&options.encryption_key)?;
        let transport = Arc::clone(&options.transport);
        let authenticator = Arc::new(Authenticator::new(
            Arc::clone(&transport),
            cipher,
            namespace.clone(),
        ));
        let (status_tx, _) = watch::channel(LifecycleStatus::Stopped);

        Ok(Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4().to_string(),
                priority: options.priority,
                namespace,
                transport,
                completions: Arc::new(CompletionBus::new()),
                authenticator,
                generators: options.client_generators,
                defaults: options.default_client_options,
                status_tx,
                state: Mutex::new(InstanceState {
                    status: LifecycleStatus::Stopped,
                    clients: HashMap::new(),
                    generator_outputs: HashMap::new(),
                    peers: crate::ownership::PeerTable::new(),
                    tasks: Vec::new(),
                    last_announcement: None,
                }),
            }),
        })
    }

    /// Unique id of this instance within the fleet.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub async fn status(&self) -> LifecycleStatus {
        self.inner.state.lock().await.status
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn start(&self) -> DispatcherResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            if state.status != LifecycleStatus::Stopped {
                return Ok(());
            }
            state.status = LifecycleStatus::Starting;
        }
        self.inner.status_tx.send_replace(LifecycleStatus::Starting);

        // Build the client set before announcing anything.
        let (clients, outputs) = match self.build_initial_clients() {
            Ok(built) => built,
            Err(e) => {
                let mut state = self.inner.state.lock().await;
                state.status = LifecycleStatus::Stopped;
                self.inner.status_tx.send_replace(LifecycleStatus::Stopped);
                return Err(e);
            }
        };

        // Subscribe before registering so no peer announcement is missed.
        let receiver = self
            .inner
            .transport
            .subscribe(self.inner.namespace.all_channels())
            .await?;

        {
            let mut state = self.inner.state.lock().await;
            state.clients = clients;
            state.generator_outputs = outputs;
            state.peers = crate::ownership::PeerTable::new();
        }

        self.load_peers_from_storage().await;

        let announcement = self.current_announcement().await;
        {
            let mut state = self.inner.state.lock().await;
            state.last_announcement = Some(announcement.clone());
        }
        self.persist_and_announce(&announcement, Channel::InstanceStarted)
            .await?;
        self.recompute_ownership().await;

        {
            let mut state = self.inner.state.lock().await;
            let router = {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.router_loop(receiver).await })
            };
            let heartbeat = {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.heartbeat_loop().await })
            };
            let reconcile = {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.reconcile_loop().await })
            };
            state.tasks = vec![router, heartbeat, reconcile];
            state.status = LifecycleStatus::Started;
        }
        self.inner.status_tx.send_replace(LifecycleStatus::Started);

        info!(
            instance = %self.inner.id,
            priority = self.inner.priority,
            "dispatcher started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> DispatcherResult<()> {
        let (tasks, clients) = {
            let mut state = self.inner.state.lock().await;
            if state.status == LifecycleStatus::Stopped {
                return Ok(());
            }
            state.status = LifecycleStatus::Stopped;
            state.peers = crate::ownership::PeerTable::new();
            state.last_announcement = None;
            (
                std::mem::take(&mut state.tasks),
                state.clients.values().cloned().collect::<Vec<_>>(),
            )
        };
        self.inner.status_tx.send_replace(LifecycleStatus::Stopped);

        for task in tasks {
            task.abort();
        }
        for client in clients {
            client.shutdown().await;
        }

        // Best-effort deregistration; a lost message is covered by the TTL.
        let _ = self
            .inner
            .transport
            .delete(&self.inner.namespace.instance_key(&self.inner.id))
            .await;
        let _ = self
            .inner
            .transport
            .set_remove(&self.inner.namespace.instances_key(), &self.inner.id)
            .await;
        self.publish_signal(Channel::InstanceStopped).await;

        info!(instance = %self.inner.id, "dispatcher stopped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Routes one outbound call through its client's admission and retry
    /// pipeline. Waits for `start` to complete if called early.
    pub async fn handle_request(&self, config: RequestConfig) -> DispatcherResult<HttpResponse> {
        self.await_started().await;

        let (client, admission) = {
            let state = self.inner.state.lock().await;
            let client = state
                .clients
                .get(&config.client_name)
                .cloned()
                .ok_or_else(|| DispatcherError::UnknownClient(config.client_name.clone()))?;

            // Follow shared-limit delegation to the admitting client.
            let mut admission = Arc::clone(&client);
            let mut seen = std::collections::HashSet::new();
            while let Some(target) = admission.shared_target().await {
                if !seen.insert(target.clone()) {
                    return Err(DispatcherError::InvalidSpec(format!(
                        "shared rate limit cycle through {}",
                        target
                    )));
                }
                admission = state
                    .clients
                    .get(&target)
                    .cloned()
                    .ok_or(DispatcherError::UnknownClient(target))?;
            }
            (client, admission)
        };

        client.submit(admission, config).await
    }

    /// Reloads the named generators (all when `None`) on every instance in
    /// the fleet.
    pub async fn regenerate_clients(&self, names: Option<Vec<String>>) -> DispatcherResult<()> {
        let directive = RegenerateDirective {
            client_names: names,
        };
        let payload = serde_json::to_string(&directive)?;
        self.inner
            .transport
            .publish(
                &self.inner.namespace.channel(Channel::RegenerateClients),
                &payload,
            )
            .await
    }

    /// Removes the named client on every instance in the fleet.
    pub async fn destroy_client(&self, name: &str) -> DispatcherResult<()> {
        let directive = DestroyDirective {
            client_name: name.to_string(),
        };
        let payload = serde_json::to_string(&directive)?;
        self.inner
            .transport
            .publish(
                &self.inner.namespace.channel(Channel::DestroyClient),
                &payload,
            )
            .await
    }

    /// Registers an additional client on this instance only.
    pub async fn create_client(&self, spec: ClientSpec) -> DispatcherResult<()> {
        let specs = flatten_spec(spec)?;
        {
            let mut state = self.inner.state.lock().await;
            for spec in &specs {
                if state.clients.contains_key(&spec.name) {
                    return Err(DispatcherError::DuplicateClient(spec.name.clone()));
                }
            }
            for spec in specs {
                let spec = apply_defaults(spec, &self.inner.defaults);
                let client = self.build_client(spec)?;
                state.clients.insert(client.name.clone(), client);
            }
        }
        self.recompute_ownership().await;
        Ok(())
    }

    pub async fn client_names(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut names: Vec<String> = state.clients.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of one client as seen from this instance.
    pub async fn client_stats(&self, name: &str) -> DispatcherResult<ClientStats> {
        let client = {
            let state = self.inner.state.lock().await;
            if state.status != LifecycleStatus::Started {
                return Err(DispatcherError::NotStarted);
            }
            state
                .clients
                .get(name)
                .cloned()
                .ok_or_else(|| DispatcherError::UnknownClient(name.to_string()))?
        };
        Ok(client.stats().await)
    }

    /// Clients this instance currently controls.
    pub async fn owned_clients(&self) -> Vec<String> {
        let clients: Vec<Arc<Client>> = {
            let state = self.inner.state.lock().await;
            state.clients.values().cloned().collect()
        };
        let mut owned = Vec::new();
        for client in clients {
            if client.role().await == ClientRole::Controller {
                owned.push(client.name.clone());
            }
        }
        owned.sort();
        owned
    }

    // ------------------------------------------------------------------
    // Client construction
    // ------------------------------------------------------------------

    fn build_client(&self, spec: ClientSpec) -> DispatcherResult<Arc<Client>> {
        Client::from_spec(
            spec,
            self.inner.namespace.clone(),
            Arc::clone(&self.inner.transport),
            Arc::clone(&self.inner.completions),
            Arc::clone(&self.inner.authenticator),
        )
    }

    fn run_generator(&self, generator_name: &str) -> DispatcherResult<Vec<ClientSpec>> {
        let generator = self
            .inner
            .generators
            .get(generator_name)
            .ok_or_else(|| DispatcherError::UnknownClient(generator_name.to_string()))?;
        let mut flattened = Vec::new();
        for spec in generator() {
            for spec in flatten_spec(spec)? {
                flattened.push(apply_defaults(spec, &self.inner.defaults));
            }
        }
        Ok(flattened)
    }

    #[allow(clippy::type_complexity)]
    fn build_initial_clients(
        &self,
    ) -> DispatcherResult<(HashMap<String, Arc<Client>>, HashMap<String, Vec<String>>)> {
        let mut clients = HashMap::new();
        let mut outputs = HashMap::new();

        let default_client = self.build_client(ClientSpec::new(DEFAULT_CLIENT))?;
        clients.insert(DEFAULT_CLIENT.to_string(), default_client);

        let mut generator_names: Vec<String> = self.inner.generators.keys().cloned().collect();
        generator_names.sort();
        for generator_name in generator_names {
            let mut produced = Vec::new();
            for spec in self.run_generator(&generator_name)? {
                if clients.contains_key(&spec.name) {
                    return Err(DispatcherError::DuplicateClient(spec.name));
                }
                let client = self.build_client(spec)?;
                produced.push(client.name.clone());
                clients.insert(client.name.clone(), client);
            }
            outputs.insert(generator_name, produced);
        }
        Ok((clients, outputs))
    }

    // ------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------

    async fn current_announcement(&self) -> InstanceAnnouncement {
        let state = self.inner.state.lock().await;
        let mut names: Vec<String> = state.clients.keys().cloned().collect();
        names.sort();
        InstanceAnnouncement {
            id: self.inner.id.clone(),
            priority: self.inner.priority,
            registered_clients: names,
        }
    }

    /// Re-derives this instance's role for every registered client and, if
    /// the registration or any role changed, persists and announces the
    /// update.
    async fn recompute_ownership(&self) {
        let announcement = self.current_announcement().await;
        let assignments: Vec<(Arc<Client>, ClientRole)> = {
            let mut state = self.inner.state.lock().await;
            state.peers.upsert(announcement.clone());
            state
                .clients
                .iter()
                .map(|(name, client)| {
                    let role = if state.peers.is_controller(&self.inner.id, name) {
                        ClientRole::Controller
                    } else {
                        ClientRole::Worker
                    };
                    (Arc::clone(client), role)
                })
                .collect()
        };

        let mut any_role_changed = false;
        for (client, role) in assignments {
            if client.set_role(role).await {
                any_role_changed = true;
            }
        }

        let should_announce = {
            let mut state = self.inner.state.lock().await;
            if state.status == LifecycleStatus::Stopped {
                false
            } else {
                let registration_changed =
                    state.last_announcement.as_ref() != Some(&announcement);
                if registration_changed || any_role_changed {
                    state.last_announcement = Some(announcement.clone());
                    true
                } else {
                    false
                }
            }
        };
        if should_announce {
            if let Err(e) = self
                .persist_and_announce(&announcement, Channel::InstanceUpdated)
                .await
            {
                warn!(instance = %self.inner.id, "failed to announce update: {}", e);
            }
        }
    }

    async fn persist_and_announce(
        &self,
        announcement: &InstanceAnnouncement,
        channel: Channel,
    ) -> DispatcherResult<()> {
        let payload = serde_json::to_string(announcement)?;
        self.inner
            .transport
            .set_with_expiry(
                &self.inner.namespace.instance_key(&self.inner.id),
                &payload,
                INSTANCE_TTL,
            )
            .await?;
        self.inner
            .transport
            .set_add(&self.inner.namespace.instances_key(), &self.inner.id)
            .await?;
        self.inner
            .transport
            .publish(&self.inner.namespace.channel(channel), &payload)
            .await
    }

    /// Seeds the peer table from the registrations already in storage, and
    /// removes ids whose registration key is gone.
    async fn load_peers_from_storage(&self) {
        let instances_key = self.inner.namespace.instances_key();
        let ids = match self.inner.transport.set_members(&instances_key).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("failed to list instances: {}", e);
                return;
            }
        };
        for id in ids {
            if id == self.inner.id {
                continue;
            }
            match self
                .inner
                .transport
                .get(&self.inner.namespace.instance_key(&id))
                .await
            {
                Ok(Some(json)) => match serde_json::from_str::<InstanceAnnouncement>(&json) {
                    Ok(announcement) => {
                        let mut state = self.inner.state.lock().await;
                        state.peers.upsert(announcement);
                    }
                    Err(e) => warn!(peer = %id, "invalid registration payload: {}", e),
                },
                Ok(None) => {
                    debug!(peer = %id, "removing stale instance from set");
                    let _ = self.inner.transport.set_remove(&instances_key, &id).await;
                }
                Err(e) => warn!(peer = %id, "failed to load registration: {}", e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    async fn router_loop(self, mut receiver: tokio::sync::mpsc::UnboundedReceiver<PubSubMessage>) {
        while let Some(message) = receiver.recv().await {
            if let Err(e) = self.route(message).await {
                warn!(instance = %self.inner.id, "failed to handle message: {}", e);
            }
        }
        debug!(instance = %self.inner.id, "router loop ended");
    }

    async fn route(&self, message: PubSubMessage) -> DispatcherResult<()> {
        let Some(channel) = self.inner.namespace.parse_channel(&message.channel) else {
            return Ok(());
        };

        match channel {
            Channel::InstanceStarted | Channel::InstanceUpdated => {
                let announcement: InstanceAnnouncement = serde_json::from_str(&message.payload)?;
                if announcement.id != self.inner.id {
                    let mut state = self.inner.state.lock().await;
                    state.peers.upsert(announcement);
                    drop(state);
                    self.recompute_ownership().await;
                }
            }
            Channel::InstanceHeartbeat => {
                let signal: InstanceSignal = serde_json::from_str(&message.payload)?;
                if signal.id == self.inner.id {
                    return Ok(());
                }
                let known = {
                    let mut state = self.inner.state.lock().await;
                    state.peers.heartbeat(&signal.id)
                };
                if !known {
                    // First sign of life from a peer whose announcement was
                    // lost; catch up from its registration.
                    self.adopt_peer_from_storage(&signal.id).await;
                }
            }
            Channel::InstanceStopped => {
                let signal: InstanceSignal = serde_json::from_str(&message.payload)?;
                let removed = {
                    let mut state = self.inner.state.lock().await;
                    state.peers.remove(&signal.id)
                };
                if removed {
                    info!(peer = %signal.id, "peer stopped");
                    self.recompute_ownership().await;
                }
            }
            Channel::RegenerateClients => {
                let directive: RegenerateDirective = serde_json::from_str(&message.payload)?;
                self.apply_regenerate(directive.client_names).await;
            }
            Channel::DestroyClient => {
                let directive: DestroyDirective = serde_json::from_str(&message.payload)?;
                self.apply_destroy(&directive.client_name).await;
            }
            Channel::ClientTokensUpdated => {
                let update: TokensUpdate = serde_json::from_str(&message.payload)?;
                if let Some(client) = self.client_by_name(&update.client_name).await {
                    client.on_tokens_updated(update.tokens).await;
                }
            }
            Channel::RequestAdded => {
                let envelope: RequestEnvelope = serde_json::from_str(&message.payload)?;
                if let Some(client) = self.client_by_name(&envelope.record.client_name).await {
                    client.on_request_added(envelope.record).await;
                }
            }
            Channel::RequestHeartbeat => {
                let envelope: RequestEnvelope = serde_json::from_str(&message.payload)?;
                if let Some(client) = self.client_by_name(&envelope.record.client_name).await {
                    client.on_request_heartbeat(envelope.record).await;
                }
            }
            Channel::RequestReady => {
                let envelope: RequestEnvelope = serde_json::from_str(&message.payload)?;
                if let Some(client) = self.client_by_name(&envelope.record.client_name).await {
                    client.on_request_ready(envelope.record.clone()).await;
                }
                self.inner
                    .completions
                    .complete(&envelope.record.request_id.clone(), envelope.record);
            }
            Channel::RequestDone => {
                let outcome: RequestOutcome = serde_json::from_str(&message.payload)?;
                if let Some(client) = self.client_by_name(&outcome.record.client_name).await {
                    client.on_request_done(outcome).await;
                }
            }
            Channel::RateLimitUpdated => {
                let update: RateLimitUpdate = serde_json::from_str(&message.payload)?;
                if let Some(client) = self.client_by_name(&update.client_name).await {
                    client.apply_rate_limit(update.rate_limit).await;
                }
            }
        }
        Ok(())
    }

    async fn client_by_name(&self, name: &str) -> Option<Arc<Client>> {
        self.inner.state.lock().await.clients.get(name).cloned()
    }

    async fn adopt_peer_from_storage(&self, peer_id: &str) {
        match self
            .inner
            .transport
            .get(&self.inner.namespace.instance_key(peer_id))
            .await
        {
            Ok(Some(json)) => {
                if let Ok(announcement) = serde_json::from_str::<InstanceAnnouncement>(&json) {
                    let mut state = self.inner.state.lock().await;
                    state.peers.upsert(announcement);
                    drop(state);
                    self.recompute_ownership().await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(peer = %peer_id, "failed to fetch registration: {}", e),
        }
    }

    async fn heartbeat_loop(self) {
        let mut ticker = interval(INSTANCE_HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let announcement = {
                let state = self.inner.state.lock().await;
                state.last_announcement.clone()
            };
            if let Some(announcement) = announcement {
                if let Ok(payload) = serde_json::to_string(&announcement) {
                    let _ = self
                        .inner
                        .transport
                        .set_with_expiry(
                            &self.inner.namespace.instance_key(&self.inner.id),
                            &payload,
                            INSTANCE_TTL,
                        )
                        .await;
                }
            }
            self.publish_signal(Channel::InstanceHeartbeat).await;
        }
    }

    async fn reconcile_loop(self) {
        let mut ticker = interval(RECONCILE_INTERVAL);
        ticker.tick().await;
        let mut last_health: HashMap<String, Instant> = HashMap::new();
        loop {
            ticker.tick().await;

            // Peers that stopped heart-beating are dead.
            let removed = {
                let mut state = self.inner.state.lock().await;
                state.peers.prune_stale(INSTANCE_TTL, &self.inner.id)
            };
            let mut membership_changed = !removed.is_empty();
            for peer_id in &removed {
                warn!(peer = %peer_id, "peer heartbeat expired");
                let _ = self
                    .inner
                    .transport
                    .set_remove(&self.inner.namespace.instances_key(), peer_id)
                    .await;
                let _ = self
                    .inner
                    .transport
                    .delete(&self.inner.namespace.instance_key(peer_id))
                    .await;
            }

            // Full sync against storage, the safety net for lost pub/sub.
            if let Ok(ids) = self
                .inner
                .transport
                .set_members(&self.inner.namespace.instances_key())
                .await
            {
                for id in ids {
                    if id == self.inner.id {
                        continue;
                    }
                    let known = {
                        let state = self.inner.state.lock().await;
                        state.peers.contains(&id)
                    };
                    if known {
                        continue;
                    }
                    match self
                        .inner
                        .transport
                        .get(&self.inner.namespace.instance_key(&id))
                        .await
                    {
                        Ok(Some(json)) => {
                            if let Ok(announcement) =
                                serde_json::from_str::<InstanceAnnouncement>(&json)
                            {
                                let mut state = self.inner.state.lock().await;
                                state.peers.upsert(announcement);
                                membership_changed = true;
                            }
                        }
                        Ok(None) => {
                            let _ = self
                                .inner
                                .transport
                                .set_remove(&self.inner.namespace.instances_key(), &id)
                                .await;
                        }
                        Err(_) => {}
                    }
                }
            }

            if membership_changed {
                self.recompute_ownership().await;
            }

            // Request liveness and per-client health.
            let clients: Vec<Arc<Client>> = {
                let state = self.inner.state.lock().await;
                state.clients.values().cloned().collect()
            };
            last_health.retain(|name, _| clients.iter().any(|c| c.name == *name));
            for client in clients {
                client.sweep_stale_requests().await;
                let due = match last_health.get(&client.name) {
                    Some(last) => last.elapsed() >= client.health_check_interval(),
                    None => false,
                };
                if due || !last_health.contains_key(&client.name) {
                    if due {
                        client.health_tick().await;
                    }
                    last_health.insert(client.name.clone(), Instant::now());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Fleet directives (applied locally on every instance)
    // ------------------------------------------------------------------

    async fn apply_regenerate(&self, names: Option<Vec<String>>) {
        let targets = match names {
            Some(names) => names,
            None => {
                let mut all: Vec<String> = self.inner.generators.keys().cloned().collect();
                all.sort();
                all
            }
        };

        for generator_name in targets {
            if !self.inner.generators.contains_key(&generator_name) {
                debug!(generator = %generator_name, "no such generator on this instance");
                continue;
            }
            let specs = match self.run_generator(&generator_name) {
                Ok(specs) => specs,
                Err(e) => {
                    error!(generator = %generator_name, "generator failed: {}", e);
                    continue;
                }
            };

            // Tear down what this generator produced last time.
            let old_clients = {
                let mut state = self.inner.state.lock().await;
                let old_names = state
                    .generator_outputs
                    .remove(&generator_name)
                    .unwrap_or_default();
                old_names
                    .into_iter()
                    .filter_map(|name| state.clients.remove(&name))
                    .collect::<Vec<_>>()
            };
            for client in old_clients {
                client.shutdown().await;
            }

            let mut produced = Vec::new();
            {
                let mut state = self.inner.state.lock().await;
                for spec in specs {
                    if state.clients.contains_key(&spec.name) {
                        error!(
                            client = %spec.name,
                            generator = %generator_name,
                            "duplicate client, halting generator pass"
                        );
                        break;
                    }
                    match self.build_client(spec) {
                        Ok(client) => {
                            produced.push(client.name.clone());
                            state.clients.insert(client.name.clone(), client);
                        }
                        Err(e) => {
                            error!(generator = %generator_name, "failed to build client: {}", e);
                            break;
                        }
                    }
                }
                state.generator_outputs.insert(generator_name, produced);
            }
        }

        self.recompute_ownership().await;
    }

    async fn apply_destroy(&self, name: &str) {
        let removed = {
            let mut state = self.inner.state.lock().await;
            for outputs in state.generator_outputs.values_mut() {
                outputs.retain(|n| n != name);
            }
            state.clients.remove(name)
        };
        let Some(client) = removed else {
            return;
        };
        client.shutdown().await;
        // Every key written for a client is derivable, so destroy deletes
        // exactly what it owns instead of scanning the keyspace.
        let _ = self
            .inner
            .transport
            .delete(&self.inner.namespace.oauth_key(name))
            .await;
        info!(client = %name, "client destroyed");
        self.recompute_ownership().await;
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn await_started(&self) {
        let mut receiver = self.inner.status_tx.subscribe();
        loop {
            if *receiver.borrow() == LifecycleStatus::Started {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    async fn publish_signal(&self, channel: Channel) {
        let signal = InstanceSignal {
            id: self.inner.id.clone(),
        };
        if let Ok(payload) = serde_json::to_string(&signal) {
            let _ = self
                .inner
                .transport
                .publish(&self.inner.namespace.channel(channel), &payload)
                .await;
        }
    }
}

/// Instance-wide defaults merged under a generated spec; spec values win.
fn apply_defaults(spec: ClientSpec, defaults: &ClientDefaults) -> ClientSpec {
    ClientSpec {
        request_options: RequestOptions::merged_over(
            &spec.request_options,
            &defaults.request_options,
        ),
        retry_options: RetryOptions::merged_over(&spec.retry_options, &defaults.retry_options),
        http_options: HttpOptions::merged_over(&spec.http_options, &defaults.http_options),
        ..spec
    }
}
