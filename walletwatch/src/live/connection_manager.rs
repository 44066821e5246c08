//! Per-chain WebSocket lifecycle: connect, heartbeat, reconnect, fall back.
//!
//! The manager owns at most one WebSocket-capable client per chain plus an
//! HTTP-capable fallback factory. [`ConnectionManager::client_for`] makes
//! the transport decision: a bounded WebSocket connect attempt, and on
//! failure the HTTP client with [`Transport::Polling`] - callers never see
//! a connection error from this path, only a downgraded transport.
//!
//! A heartbeat task probes each connected chain; a missed pong within
//! `pong_timeout` is treated as a disconnect and feeds the reconnect loop,
//! which backs off exponentially with the same jitter policy as the retry
//! stack and gives up after `max_reconnect_attempts`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use rpc_guard::{Result, RpcError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::LiveClient;
use crate::events::{EventBus, EventKind, EventPayload, Transport};

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Jitter applied to reconnect delays, mirroring the retry policy default.
const RECONNECT_JITTER: f64 = 0.3;

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// First reconnect delay.
    pub reconnect_base_delay: Duration,
    /// Ceiling for reconnect delays.
    pub reconnect_max_delay: Duration,
    /// Reconnect attempts before giving up on a chain.
    pub max_reconnect_attempts: u32,
    /// Cadence of the liveness probe.
    pub heartbeat_interval: Duration,
    /// How long to wait for a pong before declaring the socket dead.
    pub pong_timeout: Duration,
    /// Deadline for one connect attempt.
    pub connection_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(10),
        }
    }
}

/// Jittered exponential reconnect delay for an attempt (0-indexed).
#[must_use]
pub fn reconnect_delay(config: &ManagerConfig, attempt: u32, rng: &mut impl Rng) -> Duration {
    let exp = 2f64.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
    let capped = (config.reconnect_base_delay.as_secs_f64() * exp)
        .min(config.reconnect_max_delay.as_secs_f64());
    let jittered = capped * (1.0 + rng.random_range(-RECONNECT_JITTER..=RECONNECT_JITTER));
    Duration::from_secs_f64(jittered.max(0.0))
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONNECTION STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Observable transport state of one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// WebSocket up and heartbeating.
    Connected,
    /// First connect attempt in flight.
    Connecting,
    /// No WebSocket; polling (or nothing) serves the chain.
    Disconnected,
    /// Reconnect loop in progress.
    Reconnecting,
}

/// Snapshot of one chain's connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Current status.
    pub status: ConnectionStatus,
    /// Live subscriptions using this chain.
    pub subscription_count: u64,
    /// Time since the last successful heartbeat.
    pub last_heartbeat_age: Option<Duration>,
    /// Reconnect attempts made in the current outage (0 when healthy).
    pub reconnect_attempts: u32,
}

struct ChainBits {
    status: ConnectionStatus,
    subscription_count: u64,
    last_heartbeat_at: Option<Instant>,
    reconnect_attempts: u32,
}

struct ChainState {
    ws_client: Arc<dyn LiveClient>,
    bits: std::sync::Mutex<ChainBits>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ChainState {
    #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
    fn bits(&self) -> std::sync::MutexGuard<'_, ChainBits> {
        self.bits.lock().unwrap()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLIENT FACTORIES
// ═══════════════════════════════════════════════════════════════════════════════

/// Produces a transport client for a chain id.
pub type ClientFactory = Arc<dyn Fn(u64) -> Arc<dyn LiveClient> + Send + Sync>;

/// Callback invoked when a chain's WebSocket comes back after an outage.
pub type ReconnectHook = Arc<dyn Fn(u64) + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════════
// CONNECTION MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

/// Sole owner of the per-chain live clients and their lifecycles.
pub struct ConnectionManager {
    config: ManagerConfig,
    ws_factory: ClientFactory,
    http_factory: ClientFactory,
    bus: Arc<EventBus>,
    chains: DashMap<u64, Arc<ChainState>>,
    on_reconnected: std::sync::Mutex<Option<ReconnectHook>>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("chains", &self.chains.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager over WebSocket and HTTP client factories.
    #[must_use]
    pub fn new(
        config: ManagerConfig,
        ws_factory: ClientFactory,
        http_factory: ClientFactory,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            ws_factory,
            http_factory,
            bus,
            chains: DashMap::new(),
            on_reconnected: std::sync::Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Register the hook invoked after a successful reconnect.
    pub fn set_on_reconnected(&self, hook: ReconnectHook) {
        #[allow(clippy::unwrap_used)]
        {
            *self.on_reconnected.lock().unwrap() = Some(hook);
        }
    }

    fn chain_state(&self, chain_id: u64) -> Arc<ChainState> {
        self.chains
            .entry(chain_id)
            .or_insert_with(|| {
                Arc::new(ChainState {
                    ws_client: (self.ws_factory)(chain_id),
                    bits: std::sync::Mutex::new(ChainBits {
                        status: ConnectionStatus::Disconnected,
                        subscription_count: 0,
                        last_heartbeat_at: None,
                        reconnect_attempts: 0,
                    }),
                    supervisor: std::sync::Mutex::new(None),
                    cancel: CancellationToken::new(),
                })
            })
            .clone()
    }

    /// Decide the transport for a chain and hand out the matching client.
    ///
    /// A bounded WebSocket connect is attempted first; on success the
    /// heartbeat is armed and `(ws_client, Websocket)` is returned. On
    /// failure the HTTP fallback is returned with `Polling` - this path
    /// never errors.
    #[instrument(skip(self))]
    pub async fn client_for(&self, chain_id: u64) -> (Arc<dyn LiveClient>, Transport) {
        if self.destroyed.load(Ordering::SeqCst) {
            return ((self.http_factory)(chain_id), Transport::Polling);
        }

        let state = self.chain_state(chain_id);
        state.bits().status = ConnectionStatus::Connecting;

        match self.try_ws_connect(chain_id, &state).await {
            Ok(()) => (Arc::clone(&state.ws_client), Transport::Websocket),
            Err(err) => {
                warn!(chain_id, error = %err, "WebSocket unavailable, falling back to polling");
                state.bits().status = ConnectionStatus::Disconnected;
                ((self.http_factory)(chain_id), Transport::Polling)
            }
        }
    }

    /// Attempt a WebSocket connect for recovery probing.
    ///
    /// # Errors
    ///
    /// Propagates the connect failure (including the bounded-timeout error)
    /// so the caller can keep polling.
    pub async fn connect(&self, chain_id: u64) -> Result<Arc<dyn LiveClient>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RpcError::cancelled("destroyed"));
        }
        let state = self.chain_state(chain_id);
        if state.bits().status == ConnectionStatus::Connected {
            return Ok(Arc::clone(&state.ws_client));
        }
        self.try_ws_connect(chain_id, &state).await?;
        Ok(Arc::clone(&state.ws_client))
    }

    async fn try_ws_connect(&self, chain_id: u64, state: &Arc<ChainState>) -> Result<()> {
        let connect = state.ws_client.connect();
        tokio::time::timeout(self.config.connection_timeout, connect)
            .await
            .map_err(|_| {
                RpcError::timeout(format!(
                    "websocket connect timed out after {:?}",
                    self.config.connection_timeout
                ))
                .with_chain(chain_id)
            })
            .and_then(|r| r)?;

        {
            let mut bits = state.bits();
            bits.status = ConnectionStatus::Connected;
            bits.last_heartbeat_at = Some(Instant::now());
            bits.reconnect_attempts = 0;
        }
        info!(chain_id, "WebSocket connected");
        self.bus.emit(
            EventKind::WebsocketConnected,
            chain_id,
            EventPayload::Connection {
                transport: Transport::Websocket,
                details: "connected".into(),
            },
        );
        self.spawn_supervisor(chain_id, state);
        Ok(())
    }

    /// Arm (or re-arm) the heartbeat/reconnect supervisor for a chain.
    fn spawn_supervisor(&self, chain_id: u64, state: &Arc<ChainState>) {
        let config = self.config.clone();
        let bus = Arc::clone(&self.bus);
        let state_for_task = Arc::clone(state);
        #[allow(clippy::unwrap_used)]
        let hook = self.on_reconnected.lock().unwrap().clone();
        let cancel = state.cancel.clone();

        let handle = tokio::spawn(async move {
            supervise(chain_id, config, bus, state_for_task, hook, cancel).await;
        });

        #[allow(clippy::unwrap_used)]
        let mut slot = state.supervisor.lock().unwrap();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Snapshot of one chain's connection, if the manager has seen it.
    #[must_use]
    pub fn connection_info(&self, chain_id: u64) -> Option<ConnectionInfo> {
        self.chains.get(&chain_id).map(|state| {
            let bits = state.bits();
            ConnectionInfo {
                status: bits.status,
                subscription_count: bits.subscription_count,
                last_heartbeat_age: bits.last_heartbeat_at.map(|at| at.elapsed()),
                reconnect_attempts: bits.reconnect_attempts,
            }
        })
    }

    /// Bump a chain's live-subscription count.
    pub fn increment_subscription_count(&self, chain_id: u64) {
        self.chain_state(chain_id).bits().subscription_count += 1;
    }

    /// Drop a chain's live-subscription count.
    pub fn decrement_subscription_count(&self, chain_id: u64) {
        let state = self.chain_state(chain_id);
        let mut bits = state.bits();
        bits.subscription_count = bits.subscription_count.saturating_sub(1);
    }

    /// Cancel every supervisor and forget all chains. Idempotent.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        for entry in &self.chains {
            entry.value().cancel.cancel();
            #[allow(clippy::unwrap_used)]
            if let Some(handle) = entry.value().supervisor.lock().unwrap().take() {
                handle.abort();
            }
        }
        self.chains.clear();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SUPERVISOR TASK
// ═══════════════════════════════════════════════════════════════════════════════

/// Heartbeat the chain; on a missed pong, run the reconnect loop.
async fn supervise(
    chain_id: u64,
    config: ManagerConfig,
    bus: Arc<EventBus>,
    state: Arc<ChainState>,
    hook: Option<ReconnectHook>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(chain_id, "Connection supervisor stopping");
                return;
            }
            () = tokio::time::sleep(config.heartbeat_interval) => {}
        }

        let pong = tokio::time::timeout(config.pong_timeout, state.ws_client.ping()).await;
        match pong {
            Ok(Ok(())) => {
                state.bits().last_heartbeat_at = Some(Instant::now());
                debug!(chain_id, "Heartbeat ok");
                continue;
            }
            Ok(Err(err)) => warn!(chain_id, error = %err, "Heartbeat failed"),
            Err(_) => warn!(chain_id, "Pong missing, treating as disconnect"),
        }

        state.bits().status = ConnectionStatus::Reconnecting;
        bus.emit(
            EventKind::WebsocketDisconnected,
            chain_id,
            EventPayload::Connection {
                transport: Transport::Websocket,
                details: "heartbeat lost".into(),
            },
        );

        if !reconnect_loop(chain_id, &config, &bus, &state, &cancel).await {
            state.bits().status = ConnectionStatus::Disconnected;
            warn!(chain_id, "Reconnect attempts exhausted");
            return;
        }

        if let Some(hook) = &hook {
            hook(chain_id);
        }
    }
}

/// Jittered exponential reconnect. Returns whether the socket came back.
async fn reconnect_loop(
    chain_id: u64,
    config: &ManagerConfig,
    bus: &EventBus,
    state: &Arc<ChainState>,
    cancel: &CancellationToken,
) -> bool {
    for attempt in 0..config.max_reconnect_attempts {
        let delay = {
            let mut rng = rand::rng();
            reconnect_delay(config, attempt, &mut rng)
        };
        debug!(chain_id, attempt, ?delay, "Waiting before reconnect attempt");
        tokio::select! {
            () = cancel.cancelled() => return false,
            () = tokio::time::sleep(delay) => {}
        }

        state.bits().reconnect_attempts = attempt + 1;
        let connected =
            tokio::time::timeout(config.connection_timeout, state.ws_client.connect()).await;
        match connected {
            Ok(Ok(())) => {
                {
                    let mut bits = state.bits();
                    bits.status = ConnectionStatus::Connected;
                    bits.last_heartbeat_at = Some(Instant::now());
                    bits.reconnect_attempts = 0;
                }
                info!(chain_id, attempt, "WebSocket reconnected");
                bus.emit(
                    EventKind::WebsocketConnected,
                    chain_id,
                    EventPayload::Connection {
                        transport: Transport::Websocket,
                        details: format!("reconnected after {} attempts", attempt + 1),
                    },
                );
                return true;
            }
            Ok(Err(err)) => warn!(chain_id, attempt, error = %err, "Reconnect attempt failed"),
            Err(_) => warn!(chain_id, attempt, "Reconnect attempt timed out"),
        }
    }
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::super::client::MockLiveClient;
    use super::*;

    struct Fixture {
        manager: ConnectionManager,
        ws: Arc<MockLiveClient>,
        bus: Arc<EventBus>,
    }

    fn fixture(config: ManagerConfig) -> Fixture {
        let ws = Arc::new(MockLiveClient::new());
        let http = Arc::new(MockLiveClient::new());
        let bus = Arc::new(EventBus::new());

        let ws_for_factory = Arc::clone(&ws);
        let ws_factory: ClientFactory =
            Arc::new(move |_chain| Arc::clone(&ws_for_factory) as Arc<dyn LiveClient>);
        let http_factory: ClientFactory =
            Arc::new(move |_chain| Arc::clone(&http) as Arc<dyn LiveClient>);

        Fixture {
            manager: ConnectionManager::new(config, ws_factory, http_factory, Arc::clone(&bus)),
            ws,
            bus,
        }
    }

    fn fast_config() -> ManagerConfig {
        ManagerConfig {
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(1),
            max_reconnect_attempts: 3,
            heartbeat_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connect_returns_websocket_transport() {
        let fx = fixture(fast_config());
        let connected = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&connected);
        let _guard = fx.bus.on(
            EventKind::WebsocketConnected,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let (_client, transport) = fx.manager.client_for(1).await;
        assert_eq!(transport, Transport::Websocket);
        assert_eq!(connected.load(Ordering::SeqCst), 1);

        let info = fx.manager.connection_info(1).unwrap();
        assert_eq!(info.status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_falls_back_to_polling() {
        let fx = fixture(fast_config());
        fx.ws.set_connect_fails(true);

        let (_client, transport) = fx.manager.client_for(1).await;
        assert_eq!(transport, Transport::Polling);
        assert_eq!(
            fx.manager.connection_info(1).unwrap().status,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missed_pong_triggers_reconnect_and_hook() {
        let fx = fixture(fast_config());
        let recovered: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&recovered);
        fx.manager
            .set_on_reconnected(Arc::new(move |chain| sink.lock().unwrap().push(chain)));

        let disconnects = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&disconnects);
        let _guard = fx.bus.on(
            EventKind::WebsocketDisconnected,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let (_client, transport) = fx.manager.client_for(1).await;
        assert_eq!(transport, Transport::Websocket);

        // Break the heartbeat; the supervisor declares a disconnect and
        // reconnects (connect still succeeds).
        fx.ws.set_ping_fails(true);
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        // Allow the jittered first reconnect delay to elapse.
        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;

        assert_eq!(*recovered.lock().unwrap(), vec![1]);
        assert_eq!(
            fx.manager.connection_info(1).unwrap().status,
            ConnectionStatus::Connected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_max_attempts() {
        let fx = fixture(fast_config());

        let (_client, transport) = fx.manager.client_for(1).await;
        assert_eq!(transport, Transport::Websocket);

        fx.ws.set_ping_fails(true);
        fx.ws.set_connect_fails(true);

        // Heartbeat fails, then three jittered reconnect attempts fail.
        tokio::time::advance(Duration::from_secs(6)).await;
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(2)).await;
            tokio::task::yield_now().await;
        }

        let info = fx.manager.connection_info(1).unwrap();
        assert_eq!(info.status, ConnectionStatus::Disconnected);
        // Initial connect + 3 failed reconnect attempts.
        assert_eq!(fx.ws.connect_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_probe_connect_succeeds_after_outage() {
        let fx = fixture(fast_config());
        fx.ws.set_connect_fails(true);

        let (_client, transport) = fx.manager.client_for(1).await;
        assert_eq!(transport, Transport::Polling);

        // Probe fails while the socket is down.
        assert!(fx.manager.connect(1).await.is_err());

        // Socket comes back; the probe succeeds and arms the heartbeat.
        fx.ws.set_connect_fails(false);
        assert!(fx.manager.connect(1).await.is_ok());
        assert_eq!(
            fx.manager.connection_info(1).unwrap().status,
            ConnectionStatus::Connected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_counts_track_usage() {
        let fx = fixture(fast_config());
        fx.manager.increment_subscription_count(1);
        fx.manager.increment_subscription_count(1);
        fx.manager.decrement_subscription_count(1);

        assert_eq!(fx.manager.connection_info(1).unwrap().subscription_count, 1);

        // Decrementing past zero saturates.
        fx.manager.decrement_subscription_count(1);
        fx.manager.decrement_subscription_count(1);
        assert_eq!(fx.manager.connection_info(1).unwrap().subscription_count, 0);
    }

    #[test]
    fn reconnect_delay_is_exponential_and_jittered() {
        let config = ManagerConfig::default();
        let mut rng = StdRng::seed_from_u64(42);

        for attempt in 0..6 {
            let raw = (config.reconnect_base_delay.as_secs_f64() * 2f64.powi(attempt))
                .min(config.reconnect_max_delay.as_secs_f64());
            let delay = reconnect_delay(&config, u32::try_from(attempt).unwrap(), &mut rng)
                .as_secs_f64();
            assert!(delay >= raw * 0.7 - f64::EPSILON);
            assert!(delay <= raw * 1.3 + f64::EPSILON);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_refuses_ws_and_hands_out_polling() {
        let fx = fixture(fast_config());
        let (_client, _) = fx.manager.client_for(1).await;

        fx.manager.destroy();
        assert!(fx.manager.connect(1).await.is_err());
        let (_client, transport) = fx.manager.client_for(1).await;
        assert_eq!(transport, Transport::Polling);
    }
}
