//! One live provider per network: WebSocket first, quorum-1 HTTP aggregate
//! as fallback, a simulated stand-in outside production.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::{counter, gauge};
use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use chainops_domain::{
    config::{ChainTunables, DeploymentMode},
    model::{Endpoint, Network, Transport},
    services::{EndpointHealthCache, EndpointRegistry},
};

use crate::rpc::{
    with_timeout, AggregateClient, ChainClient, EndpointConnector, RpcError, SimulatedClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    ConnectingWs,
    ConnectedWs,
    ConnectingHttp,
    ConnectedHttp,
    Simulated,
}

impl ConnectionState {
    pub fn mode(self) -> ConnectionMode {
        match self {
            ConnectionState::ConnectedWs => ConnectionMode::Ws,
            ConnectionState::ConnectedHttp => ConnectionMode::Http,
            ConnectionState::Simulated => ConnectionMode::Simulated,
            _ => ConnectionMode::None,
        }
    }

    pub fn is_connected(self) -> bool {
        self.mode() != ConnectionMode::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionMode {
    Ws,
    Http,
    Simulated,
    None,
}

impl ConnectionMode {
    fn gauge_value(self) -> f64 {
        match self {
            ConnectionMode::None => 0.0,
            ConnectionMode::Ws => 1.0,
            ConnectionMode::Http => 2.0,
            ConnectionMode::Simulated => 3.0,
        }
    }
}

/// The current provider for one generation. A reconnect bumps the
/// generation; holders must re-fetch instead of caching a handle.
#[derive(Clone)]
pub struct ProviderHandle {
    pub generation: u64,
    pub mode: ConnectionMode,
    pub client: Arc<dyn ChainClient>,
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("generation", &self.generation)
            .field("mode", &self.mode)
            .field("endpoint", &self.client.describe())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub generation: u64,
    pub endpoint: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
    pub provider: Option<ProviderHandle>,
}

impl ConnectionSnapshot {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            endpoint: None,
            last_checked: None,
            provider: None,
        }
    }
}

/// Read side of the connection manager handed to consumers.
pub trait ProviderSource: Send + Sync {
    fn provider(&self) -> Option<ProviderHandle>;
    /// Reports that the provider of `generation` stopped working. Reports for
    /// any generation but the current one are ignored.
    fn report_disconnect(&self, generation: u64, reason: &str);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("no rpc endpoints configured for {0}")]
    NoEndpoints(Network),
    #[error("every rpc endpoint for {network} failed ({attempted} tried)")]
    AllEndpointsFailed { network: Network, attempted: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub rpc_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub ws_heartbeat_interval: Duration,
    pub aggregate_recheck_interval: Duration,
    /// A WebSocket connection alive this long resets the reconnect counter.
    pub stable_after: Duration,
    pub fast_path_candidates: usize,
    pub aggregate_size: usize,
}

impl From<ChainTunables> for ConnectionSettings {
    fn from(tunables: ChainTunables) -> Self {
        Self {
            rpc_timeout: tunables.rpc_timeout,
            reconnect_delay: tunables.reconnect_delay,
            max_reconnect_attempts: tunables.max_reconnect_attempts,
            ws_heartbeat_interval: Duration::from_secs(30),
            aggregate_recheck_interval: tunables.aggregate_recheck_interval,
            stable_after: Duration::from_secs(5 * 60),
            fast_path_candidates: 2,
            aggregate_size: 3,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ChainTunables::default().into()
    }
}

#[derive(Default)]
struct Control {
    reconnect_attempts: u32,
    http_only: bool,
    connected_at: Option<Instant>,
    reconnect_timer: Option<JoinHandle<()>>,
    timer_seq: u64,
    stopped: bool,
    heartbeat: Option<JoinHandle<()>>,
}

struct Inner {
    network: Network,
    mode: DeploymentMode,
    registry: EndpointRegistry,
    health: EndpointHealthCache,
    connector: Arc<dyn EndpointConnector>,
    settings: ConnectionSettings,
    attempt_lock: AsyncMutex<()>,
    next_generation: AtomicU64,
    state: watch::Sender<ConnectionSnapshot>,
    control: Mutex<Control>,
}

/// Owns the connection state machine of one network. Cloning shares it.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        network: Network,
        mode: DeploymentMode,
        registry: EndpointRegistry,
        health: EndpointHealthCache,
        connector: Arc<dyn EndpointConnector>,
        settings: ConnectionSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionSnapshot::initial());
        Self {
            inner: Arc::new(Inner {
                network,
                mode,
                registry,
                health,
                connector,
                settings,
                attempt_lock: AsyncMutex::new(()),
                next_generation: AtomicU64::new(0),
                state,
                control: Mutex::new(Control::default()),
            }),
        }
    }

    pub fn network(&self) -> Network {
        self.inner.network
    }

    pub fn health(&self) -> &EndpointHealthCache {
        &self.inner.health
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.control().reconnect_attempts
    }

    /// True once the reconnect cap was exceeded; cleared only by `restart`.
    pub fn is_http_only(&self) -> bool {
        self.control().http_only
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn current_generation(&self) -> u64 {
        self.inner.state.borrow().generation
    }

    /// Runs one full connection attempt. Attempts are serialized; a caller
    /// that waited gets a fresh attempt of its own.
    pub async fn connect(&self) -> Result<ProviderHandle, ConnectionError> {
        let _attempt = self.inner.attempt_lock.lock().await;
        self.establish().await
    }

    /// Drops the sticky HTTP fallback, the reconnect counter and the health
    /// records of this network, then reconnects from scratch. A simulated
    /// provider stays in place.
    pub async fn restart(&self) -> Result<ProviderHandle, ConnectionError> {
        {
            let mut control = self.control();
            if let Some(timer) = control.reconnect_timer.take() {
                timer.abort();
            }
            control.reconnect_attempts = 0;
            control.http_only = false;
            control.stopped = false;
        }
        for transport in [Transport::Ws, Transport::Http] {
            for endpoint in self.inner.registry.list_endpoints(self.inner.network, transport) {
                self.inner.health.forget(&endpoint.url);
            }
        }
        let _attempt = self.inner.attempt_lock.lock().await;
        info!(network = %self.inner.network, "restarting connection manager");
        self.establish().await
    }

    /// Cancels the background timers and stops automatic reconnects until
    /// the next `restart`.
    pub fn shutdown(&self) {
        let mut control = self.control();
        control.stopped = true;
        if let Some(timer) = control.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(heartbeat) = control.heartbeat.take() {
            heartbeat.abort();
        }
    }

    async fn establish(&self) -> Result<ProviderHandle, ConnectionError> {
        let inner = &self.inner;
        {
            let snapshot = inner.state.borrow();
            if snapshot.state == ConnectionState::Simulated {
                if let Some(handle) = snapshot.provider.clone() {
                    return Ok(handle);
                }
            }
        }

        let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let http_only = self.control().http_only;
        self.stop_heartbeat();

        let ws = inner.registry.list_endpoints(inner.network, Transport::Ws);
        let http = inner.registry.list_endpoints(inner.network, Transport::Http);
        if ws.is_empty() && http.is_empty() {
            return self.exhausted(generation, ConnectionError::NoEndpoints(inner.network));
        }

        let mut attempted = 0;
        if !http_only && !ws.is_empty() {
            self.set_state(ConnectionState::ConnectingWs, generation);
            for endpoint in self.ws_candidates(&ws, !http.is_empty()) {
                attempted += 1;
                if let Some((client, _)) = self.probe(&endpoint).await {
                    return Ok(self.publish(generation, ConnectionState::ConnectedWs, client));
                }
            }
        }

        if !http.is_empty() {
            self.set_state(ConnectionState::ConnectingHttp, generation);
            attempted += http.len();
            if let Some(client) = self.build_aggregate(&http).await {
                return Ok(self.publish(generation, ConnectionState::ConnectedHttp, client));
            }
        }

        self.exhausted(
            generation,
            ConnectionError::AllEndpointsFailed {
                network: inner.network,
                attempted,
            },
        )
    }

    /// Cached-healthy endpoints first, then the rest in priority order.
    /// Endpoints known to be down are skipped while an HTTP fallback exists
    /// and tried last otherwise.
    fn ws_candidates(&self, ws: &[Endpoint], has_fallback: bool) -> Vec<Endpoint> {
        let health = &self.inner.health;
        let mut ordered: Vec<Endpoint> = health
            .rank_healthy(ws)
            .into_iter()
            .take(self.inner.settings.fast_path_candidates)
            .collect();
        let (bad, rest): (Vec<&Endpoint>, Vec<&Endpoint>) = ws
            .iter()
            .filter(|endpoint| !ordered.contains(endpoint))
            .partition(|endpoint| health.is_known_bad(&endpoint.url));
        ordered.extend(rest.into_iter().cloned());
        if !has_fallback {
            ordered.extend(bad.into_iter().cloned());
        }
        ordered
    }

    async fn probe(&self, endpoint: &Endpoint) -> Option<(Arc<dyn ChainClient>, u64)> {
        let inner = &self.inner;
        let started = Instant::now();
        let result = with_timeout(inner.settings.rpc_timeout, async {
            let client = inner.connector.connect(endpoint).await?;
            client.block_number().await?;
            let chain_id = client.chain_id().await?;
            if chain_id != inner.network.chain_id() {
                return Err(RpcError::Transport(format!(
                    "endpoint serves chain {chain_id}, expected {}",
                    inner.network.chain_id()
                )));
            }
            Ok::<_, RpcError>(client)
        })
        .await;

        match result {
            Ok(client) => {
                let latency = started.elapsed().as_millis() as u64;
                inner.health.record_health(&endpoint.url, latency, true);
                counter!(
                    "rpc_connect_attempts_total",
                    "transport" => endpoint.transport.as_ref().to_string(),
                    "result" => "ok"
                )
                .increment(1);
                debug!(endpoint = %endpoint.url, latency_ms = latency, "endpoint answered");
                Some((client, latency))
            }
            Err(err) => {
                inner.health.record_health(&endpoint.url, 0, false);
                counter!(
                    "rpc_connect_attempts_total",
                    "transport" => endpoint.transport.as_ref().to_string(),
                    "result" => "error"
                )
                .increment(1);
                warn!(
                    network = %inner.network,
                    endpoint = %endpoint.url,
                    error = %err,
                    "endpoint probe failed"
                );
                None
            }
        }
    }

    async fn build_aggregate(&self, http: &[Endpoint]) -> Option<Arc<dyn ChainClient>> {
        let probes = http
            .iter()
            .map(|endpoint| async move { (endpoint.priority, self.probe(endpoint).await) });
        let mut live: Vec<(u64, u16, Arc<dyn ChainClient>)> = join_all(probes)
            .await
            .into_iter()
            .filter_map(|(priority, probed)| {
                probed.map(|(client, latency)| (latency, priority, client))
            })
            .collect();
        if live.is_empty() {
            return None;
        }

        live.sort_by_key(|(latency, priority, _)| (*latency, *priority));
        live.truncate(self.inner.settings.aggregate_size.max(1));
        let members = live.into_iter().map(|(_, _, client)| client).collect();
        Some(Arc::new(AggregateClient::new(
            members,
            self.inner.health.clone(),
            self.inner.settings.rpc_timeout,
        )))
    }

    fn exhausted(
        &self,
        generation: u64,
        err: ConnectionError,
    ) -> Result<ProviderHandle, ConnectionError> {
        if self.inner.mode.is_production() {
            error!(network = %self.inner.network, error = %err, "no rpc endpoint reachable");
            self.set_state(ConnectionState::Disconnected, generation);
            gauge!("rpc_connection_mode").set(ConnectionMode::None.gauge_value());
            if matches!(err, ConnectionError::AllEndpointsFailed { .. }) {
                self.schedule_reconnect(&mut self.control());
            }
            return Err(err);
        }

        warn!(
            network = %self.inner.network,
            error = %err,
            "no rpc endpoint reachable; using simulated provider"
        );
        let client: Arc<dyn ChainClient> = Arc::new(SimulatedClient::new(self.inner.network));
        Ok(self.publish(generation, ConnectionState::Simulated, client))
    }

    fn set_state(&self, state: ConnectionState, generation: u64) {
        self.inner.state.send_modify(|snapshot| {
            snapshot.state = state;
            snapshot.generation = generation;
            snapshot.endpoint = None;
            snapshot.provider = None;
        });
    }

    fn publish(
        &self,
        generation: u64,
        state: ConnectionState,
        client: Arc<dyn ChainClient>,
    ) -> ProviderHandle {
        let handle = ProviderHandle {
            generation,
            mode: state.mode(),
            client,
        };
        self.control().connected_at = Some(Instant::now());
        self.inner.state.send_modify(|snapshot| {
            snapshot.state = state;
            snapshot.generation = generation;
            snapshot.endpoint = Some(handle.client.describe());
            snapshot.last_checked = Some(Utc::now());
            snapshot.provider = Some(handle.clone());
        });
        gauge!("rpc_connection_mode").set(handle.mode.gauge_value());
        info!(
            network = %self.inner.network,
            generation,
            mode = %handle.mode,
            endpoint = %handle.client.describe(),
            "provider connected"
        );

        if handle.mode != ConnectionMode::Simulated {
            self.start_heartbeat(handle.clone());
        }
        handle
    }

    fn stop_heartbeat(&self) {
        if let Some(heartbeat) = self.control().heartbeat.take() {
            heartbeat.abort();
        }
    }

    fn start_heartbeat(&self, handle: ProviderHandle) {
        let interval = match handle.mode {
            ConnectionMode::Ws => self.inner.settings.ws_heartbeat_interval,
            _ => self.inner.settings.aggregate_recheck_interval,
        };
        let manager = self.clone();
        let task = tokio::spawn(async move { manager.heartbeat(handle, interval).await });
        if let Some(previous) = self.control().heartbeat.replace(task) {
            previous.abort();
        }
    }

    async fn heartbeat(&self, handle: ProviderHandle, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            if self.current_generation() != handle.generation {
                return;
            }

            let started = Instant::now();
            match with_timeout(self.inner.settings.rpc_timeout, handle.client.block_number()).await
            {
                Ok(block) => {
                    if handle.mode == ConnectionMode::Ws {
                        self.inner.health.record_health(
                            &handle.client.describe(),
                            started.elapsed().as_millis() as u64,
                            true,
                        );
                    }
                    self.inner
                        .state
                        .send_modify(|snapshot| snapshot.last_checked = Some(Utc::now()));
                    debug!(generation = handle.generation, block, "heartbeat ok");
                    self.reset_counter_if_stable(handle.mode);
                }
                Err(err) => {
                    warn!(
                        network = %self.inner.network,
                        generation = handle.generation,
                        error = %err,
                        "heartbeat failed"
                    );
                    self.report_disconnect(handle.generation, &format!("heartbeat failed: {err}"));
                    return;
                }
            }
        }
    }

    fn reset_counter_if_stable(&self, mode: ConnectionMode) {
        if mode != ConnectionMode::Ws {
            return;
        }
        let stable_after = self.inner.settings.stable_after;
        let mut control = self.control();
        let stable = control
            .connected_at
            .is_some_and(|at| at.elapsed() >= stable_after);
        if stable && control.reconnect_attempts > 0 {
            info!(
                network = %self.inner.network,
                previous = control.reconnect_attempts,
                "connection stable; reconnect counter reset"
            );
            control.reconnect_attempts = 0;
        }
    }

    /// Replaces any pending reconnect timer; at most one is ever armed.
    fn schedule_reconnect(&self, control: &mut Control) {
        if let Some(timer) = control.reconnect_timer.take() {
            timer.abort();
        }
        if control.stopped {
            return;
        }
        control.timer_seq += 1;
        let seq = control.timer_seq;
        let manager = self.clone();
        let delay = self.inner.settings.reconnect_delay;
        control.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.reconnect_now(seq).await;
        }));
    }

    async fn reconnect_now(&self, seq: u64) {
        {
            // Detach our own handle so a reschedule from this task does not
            // abort it.
            let mut control = self.control();
            if control.timer_seq != seq {
                return;
            }
            control.reconnect_timer.take();
        }
        // A failed attempt re-arms the timer in `exhausted`.
        if let Err(err) = self.connect().await {
            warn!(network = %self.inner.network, error = %err, "reconnect failed; retrying");
        }
    }
}

impl ProviderSource for ConnectionManager {
    fn provider(&self) -> Option<ProviderHandle> {
        self.inner.state.borrow().provider.clone()
    }

    fn report_disconnect(&self, generation: u64, reason: &str) {
        let (current, state) = {
            let snapshot = self.inner.state.borrow();
            (snapshot.generation, snapshot.state)
        };
        if generation != current
            || !state.is_connected()
            || state == ConnectionState::Simulated
        {
            debug!(generation, current, reason, "ignoring stale disconnect report");
            return;
        }

        let mut control = self.control();
        control.reconnect_attempts += 1;
        counter!("rpc_reconnects_total").increment(1);
        let cap = self.inner.settings.max_reconnect_attempts;
        if !control.http_only && control.reconnect_attempts > cap {
            control.http_only = true;
            warn!(
                network = %self.inner.network,
                attempts = control.reconnect_attempts,
                cap,
                "reconnect cap exceeded; staying on the http aggregate"
            );
        }
        warn!(
            network = %self.inner.network,
            generation,
            attempts = control.reconnect_attempts,
            reason,
            "provider disconnected"
        );

        self.inner.state.send_modify(|snapshot| {
            snapshot.state = ConnectionState::Disconnected;
            snapshot.endpoint = None;
            snapshot.provider = None;
        });
        gauge!("rpc_connection_mode").set(ConnectionMode::None.gauge_value());
        self.schedule_reconnect(&mut control);
    }
}
