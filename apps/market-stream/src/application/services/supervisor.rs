//! Connection Supervisor
//!
//! Owns the lifecycle of every subscription in a symbol session: connecting,
//! handshaking, routing inbound frames, reconnecting with backoff and gating
//! attempts through the circuit breaker.
//!
//! # Concurrency
//!
//! The supervisor is an actor. One task owns all state and consumes a single
//! inbox of events: commands from [`SupervisorHandle`],
//! transport events from [`EventSink`]s and timer fires from the
//! [`BackoffScheduler`]. Transport and timer tasks only ever send.
//!
//! Every transport event carries the connection generation that produced it.
//! Generations come from one counter that never repeats, so once a
//! subscription is torn down or reconnected nothing from its old transport
//! can reach the consumer.
//!
//! # Subscription state machine
//!
//! ```text
//! Disconnected ─subscribe─► Connecting ─open─► Connected
//!                               │                  │
//!                               │ abnormal close   │ abnormal close
//!                               ▼                  ▼
//!          Failed ◄─exhausted─ Reconnecting ◄──────┘
//!                               │
//!                               └─backoff elapsed─► Connecting
//!
//! Connected ─close 1000─► Disconnected
//! Failed ─resubscribe─► Connecting
//! ```

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::scheduler::{BackoffScheduler, TimerFired};
use crate::application::ports::{
    ConnectRequest, EventSink, FeedConnector, MarketDataListener, TransportError, TransportEvent,
    TransportEventKind, TransportHandle,
};
use crate::domain::coalescing::{CoalescingChannel, ThrottleDecision, UpdateCoalescer};
use crate::domain::connection::{
    ABNORMAL_CLOSURE, ConnectionState, ConnectionStats, FeedError, NORMAL_CLOSURE,
};
use crate::domain::feed::{self, InboundFrame};
use crate::domain::market::{
    Provider, StreamType, SubscriptionId, SubscriptionSpec, Trade, TradingPair,
};
use crate::domain::order_book::{DEFAULT_DEPTH, DepthReplica, OrderBook, OrderBookNormalizer};
use crate::domain::resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot, RetryPolicies,
};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Supervisor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Retry policies per stream class.
    pub policies: RetryPolicies,
    /// Circuit breaker thresholds.
    pub breaker: CircuitBreakerConfig,
    /// Umbrella breaker service every subscription reports to.
    pub breaker_service: String,
    /// Coalescing windows and buffer sizes.
    pub coalescer: UpdateCoalescer,
    /// Order book levels kept per side.
    pub depth_levels: usize,
    /// Providers subscribed on a symbol switch.
    pub providers: Vec<Provider>,
    /// Stream types subscribed on a symbol switch.
    pub streams: Vec<StreamType>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            policies: RetryPolicies::default(),
            breaker: CircuitBreakerConfig::default(),
            breaker_service: "market-stream".to_string(),
            coalescer: UpdateCoalescer::default(),
            depth_levels: DEFAULT_DEPTH,
            providers: vec![Provider::Binance],
            streams: StreamType::all().to_vec(),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by [`SupervisorHandle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// The supervisor task has stopped.
    #[error("supervisor is not running")]
    Stopped,

    /// No subscription with this identity exists.
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),
}

// =============================================================================
// Snapshots
// =============================================================================

/// Read-only view of one subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionSnapshot {
    /// Subscription identity.
    pub id: SubscriptionId,
    /// Current state.
    pub state: ConnectionState,
    /// Connection statistics.
    pub stats: ConnectionStats,
    /// Reconnect attempts since the last successful open.
    pub reconnect_attempt: u32,
}

/// Read-only view of the whole supervisor, published after every lifecycle change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupervisorSnapshot {
    /// Whether the supervisor task is running.
    pub running: bool,
    /// Current symbol session.
    pub session_id: Option<Uuid>,
    /// Active trading pair, once a symbol has been selected.
    pub symbol: Option<TradingPair>,
    /// Every subscription, ordered by identity.
    pub subscriptions: Vec<SubscriptionSnapshot>,
    /// Every circuit breaker, ordered by service.
    pub breakers: Vec<CircuitBreakerSnapshot>,
}

impl SupervisorSnapshot {
    /// Number of subscriptions in a state.
    #[must_use]
    pub fn count(&self, state: ConnectionState) -> usize {
        self.subscriptions
            .iter()
            .filter(|s| s.state == state)
            .count()
    }

    /// Running with at least one subscription and none failed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.running
            && !self.subscriptions.is_empty()
            && self.count(ConnectionState::Failed) == 0
    }

    /// Look up one subscription.
    #[must_use]
    pub fn subscription(&self, id: &SubscriptionId) -> Option<&SubscriptionSnapshot> {
        self.subscriptions.iter().find(|s| &s.id == id)
    }
}

// =============================================================================
// Inbox
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    Reconnect(SubscriptionId),
    DepthWindow(SubscriptionId),
    TradeWindow(SubscriptionId),
}

impl TimerKey {
    fn all_for(id: &SubscriptionId) -> [Self; 3] {
        [
            Self::Reconnect(id.clone()),
            Self::DepthWindow(id.clone()),
            Self::TradeWindow(id.clone()),
        ]
    }
}

enum Command {
    Subscribe {
        specs: Vec<SubscriptionSpec>,
        reply: oneshot::Sender<()>,
    },
    SwitchSymbol {
        pair: TradingPair,
        reply: oneshot::Sender<()>,
    },
    Resubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    TeardownAll {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SupervisorSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Everything the supervisor reacts to, delivered through one inbox.
enum SupervisorEvent {
    Command(Command),
    Transport(TransportEvent),
    Timer(TimerFired<TimerKey>),
}

type Inbox = mpsc::UnboundedSender<SupervisorEvent>;

fn emit_depth(listener: &dyn MarketDataListener, provider: Provider, book: OrderBook) {
    metrics::record_depth_emitted(provider);
    listener.on_depth_update(provider, book);
}

fn arm(scheduler: &mut BackoffScheduler<TimerKey>, inbox: &Inbox, key: TimerKey, delay: Duration) {
    let inbox = inbox.clone();
    scheduler.schedule(key, delay, move |fired| {
        let _ = inbox.send(SupervisorEvent::Timer(fired));
    });
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle for driving a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    inbox: Inbox,
    snapshots: watch::Receiver<SupervisorSnapshot>,
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SupervisorHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(SupervisorEvent::Command(build(reply)))
            .map_err(|_| SupervisorError::Stopped)?;
        response.await.map_err(|_| SupervisorError::Stopped)
    }

    /// Replace the active subscription set.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Stopped`] if the supervisor is gone.
    pub async fn subscribe(&self, specs: Vec<SubscriptionSpec>) -> Result<(), SupervisorError> {
        self.call(|reply| Command::Subscribe { specs, reply }).await
    }

    /// Tear down the current symbol and subscribe every configured stream for `pair`.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Stopped`] if the supervisor is gone.
    pub async fn switch_symbol(&self, pair: TradingPair) -> Result<(), SupervisorError> {
        self.call(|reply| Command::SwitchSymbol { pair, reply })
            .await
    }

    /// Restart a subscription, typically one parked in `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownSubscription`] if `id` is not
    /// subscribed, or [`SupervisorError::Stopped`] if the supervisor is gone.
    pub async fn resubscribe(&self, id: SubscriptionId) -> Result<(), SupervisorError> {
        self.call(|reply| Command::Resubscribe { id, reply })
            .await?
    }

    /// Close every transport and cancel every timer.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Stopped`] if the supervisor is gone.
    pub async fn teardown_all(&self) -> Result<(), SupervisorError> {
        self.call(|reply| Command::TeardownAll { reply }).await
    }

    /// Fresh snapshot taken inside the supervisor after all queued events.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Stopped`] if the supervisor is gone.
    pub async fn snapshot(&self) -> Result<SupervisorSnapshot, SupervisorError> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    /// Tear everything down and stop the supervisor.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Stopped`] if the supervisor already stopped.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    /// Latest published snapshot without a round trip.
    #[must_use]
    pub fn latest(&self) -> SupervisorSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified whenever a new snapshot is published.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SupervisorSnapshot> {
        self.snapshots.clone()
    }

    /// Whether the supervisor task is still accepting events.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inbox.is_closed()
    }
}

// =============================================================================
// Subscription
// =============================================================================

struct Subscription {
    spec: SubscriptionSpec,
    state: ConnectionState,
    stats: ConnectionStats,
    reconnect_attempt: u32,
    generation: u64,
    handle: Option<Box<dyn TransportHandle>>,
    channel: CoalescingChannel,
    replica: DepthReplica,
}

impl Subscription {
    fn new(spec: SubscriptionSpec, channel: CoalescingChannel) -> Self {
        Self {
            spec,
            state: ConnectionState::Disconnected,
            stats: ConnectionStats::default(),
            reconnect_attempt: 0,
            generation: 0,
            handle: None,
            channel,
            replica: DepthReplica::default(),
        }
    }

    /// Whether an event from `generation` belongs to the live transport.
    fn accepts(&self, generation: u64) -> bool {
        self.generation == generation
            && matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
    }

    fn close_transport(&mut self, reason: &str) {
        if let Some(handle) = self.handle.take() {
            handle.close(NORMAL_CLOSURE, reason);
        }
    }

    fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: self.spec.id.clone(),
            state: self.state,
            stats: self.stats.clone(),
            reconnect_attempt: self.reconnect_attempt,
        }
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Single-owner actor supervising every subscription of a symbol session.
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    connector: Arc<dyn FeedConnector>,
    listener: Arc<dyn MarketDataListener>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    breakers: CircuitBreakerRegistry,
    scheduler: BackoffScheduler<TimerKey>,
    normalizer: OrderBookNormalizer,
    inbox_tx: Inbox,
    inbox_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    snapshot_tx: watch::Sender<SupervisorSnapshot>,
    session_id: Uuid,
    symbol: Option<TradingPair>,
    next_generation: u64,
    dirty: bool,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    /// Create a supervisor and the handle that drives it.
    #[must_use]
    pub fn new(
        config: SupervisorConfig,
        connector: Arc<dyn FeedConnector>,
        listener: Arc<dyn MarketDataListener>,
    ) -> (Self, SupervisorHandle) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(SupervisorSnapshot::default());
        let handle = SupervisorHandle {
            inbox: inbox_tx.clone(),
            snapshots,
        };

        let supervisor = Self {
            breakers: CircuitBreakerRegistry::new(config.breaker.clone()),
            normalizer: OrderBookNormalizer::new(config.depth_levels),
            config,
            connector,
            listener,
            subscriptions: BTreeMap::new(),
            scheduler: BackoffScheduler::new(),
            inbox_tx,
            inbox_rx,
            snapshot_tx,
            session_id: Uuid::new_v4(),
            symbol: None,
            next_generation: 0,
            dirty: true,
            cancel: CancellationToken::new(),
        };
        (supervisor, handle)
    }

    /// Stop when `cancel` fires, tearing everything down first.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Create a supervisor and run it on a new task.
    #[must_use]
    pub fn spawn(
        config: SupervisorConfig,
        connector: Arc<dyn FeedConnector>,
        listener: Arc<dyn MarketDataListener>,
        cancel: CancellationToken,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (supervisor, handle) = Self::new(config, connector, listener);
        let task = tokio::spawn(supervisor.with_cancellation(cancel).run());
        (handle, task)
    }

    /// Process the inbox until shutdown or cancellation.
    pub async fn run(mut self) {
        tracing::info!(session = %self.session_id, "Connection supervisor started");
        self.publish_snapshot();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("Connection supervisor cancelled");
                    self.teardown_all();
                    break;
                }
                event = self.inbox_rx.recv() => {
                    let Some(event) = event else { break };
                    let keep_running = self.handle_event(event);
                    self.publish_snapshot();
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        self.snapshot_tx.send_replace(SupervisorSnapshot {
            running: false,
            ..self.build_snapshot()
        });
        tracing::info!(session = %self.session_id, "Connection supervisor stopped");
    }

    fn handle_event(&mut self, event: SupervisorEvent) -> bool {
        match event {
            SupervisorEvent::Command(command) => return self.handle_command(command),
            SupervisorEvent::Transport(event) => self.handle_transport(event),
            SupervisorEvent::Timer(fired) => self.handle_timer(&fired),
        }
        true
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Subscribe { specs, reply } => {
                self.subscribe(specs);
                let _ = reply.send(());
            }
            Command::SwitchSymbol { pair, reply } => {
                self.switch_symbol(pair);
                let _ = reply.send(());
            }
            Command::Resubscribe { id, reply } => {
                let _ = reply.send(self.resubscribe(&id));
            }
            Command::TeardownAll { reply } => {
                self.teardown_all();
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.build_snapshot());
            }
            Command::Shutdown { reply } => {
                self.teardown_all();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        let TransportEvent {
            id,
            generation,
            kind,
        } = event;

        let current = self
            .subscriptions
            .get(&id)
            .is_some_and(|sub| sub.accepts(generation));
        if !current {
            tracing::trace!(subscription = %id, generation, "Dropping event from stale transport");
            return;
        }

        match kind {
            TransportEventKind::Open => self.on_open(&id),
            TransportEventKind::Message(text) => self.on_message(&id, &text),
            TransportEventKind::Error(error) => self.on_error(&id, error),
            TransportEventKind::Close { code, reason } => self.on_close(&id, code, reason),
        }
    }

    fn handle_timer(&mut self, fired: &TimerFired<TimerKey>) {
        if !self.scheduler.acknowledge(fired) {
            return;
        }

        match &fired.key {
            TimerKey::Reconnect(id) => {
                let waiting = self
                    .subscriptions
                    .get(id)
                    .is_some_and(|sub| sub.state == ConnectionState::Reconnecting);
                if waiting {
                    self.start_attempt(id);
                }
            }
            TimerKey::DepthWindow(id) => self.flush_depth(id),
            TimerKey::TradeWindow(id) => self.flush_trades(id),
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Replace the active set. Existing live subscriptions are left alone.
    fn subscribe(&mut self, specs: Vec<SubscriptionSpec>) {
        let wanted: BTreeMap<SubscriptionId, SubscriptionSpec> = specs
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();

        let stale: Vec<SubscriptionId> = self
            .subscriptions
            .keys()
            .filter(|id| !wanted.contains_key(*id))
            .cloned()
            .collect();
        for id in &stale {
            self.remove(id);
        }

        let now = Instant::now();
        for (id, spec) in wanted {
            match self.subscriptions.entry(id.clone()) {
                Entry::Occupied(mut entry) => {
                    let sub = entry.get_mut();
                    sub.spec.class = spec.class;
                    if sub.state != ConnectionState::Disconnected {
                        tracing::debug!(subscription = %id, state = %sub.state, "Already subscribed");
                        continue;
                    }
                    sub.reconnect_attempt = 0;
                }
                Entry::Vacant(entry) => {
                    let channel = self.config.coalescer.channel(id.stream, now);
                    entry.insert(Subscription::new(spec, channel));
                }
            }
            self.start_attempt(&id);
        }
        self.dirty = true;
    }

    fn switch_symbol(&mut self, pair: TradingPair) {
        let previous = self.symbol.replace(pair.clone());
        self.teardown_all();
        self.session_id = Uuid::new_v4();

        tracing::info!(
            session = %self.session_id,
            symbol = %pair,
            previous = ?previous,
            "Switching symbol"
        );

        let specs = SubscriptionSpec::for_pair(&pair, &self.config.providers, &self.config.streams);
        self.subscribe(specs);
    }

    fn resubscribe(&mut self, id: &SubscriptionId) -> Result<(), SupervisorError> {
        let Some(sub) = self.subscriptions.get_mut(id) else {
            return Err(SupervisorError::UnknownSubscription(id.clone()));
        };

        tracing::info!(subscription = %id, state = %sub.state, "Resubscribing");
        sub.close_transport("resubscribe");
        sub.channel.clear();
        sub.replica.clear();
        sub.reconnect_attempt = 0;
        for key in TimerKey::all_for(id) {
            self.scheduler.cancel(&key);
        }

        self.start_attempt(id);
        Ok(())
    }

    /// Close every transport with a normal closure and cancel every timer.
    fn teardown_all(&mut self) {
        self.scheduler.cancel_all();

        let subscriptions = std::mem::take(&mut self.subscriptions);
        if !subscriptions.is_empty() {
            tracing::info!(count = subscriptions.len(), "Tearing down subscriptions");
        }
        for (id, mut sub) in subscriptions {
            sub.close_transport("teardown");
            sub.channel.clear();
            sub.state = ConnectionState::Disconnected;
            metrics::set_connection_state(&id, sub.state);
            self.listener
                .on_connection_change(&id, sub.state, &sub.stats);
        }
        self.dirty = true;
    }

    fn remove(&mut self, id: &SubscriptionId) {
        for key in TimerKey::all_for(id) {
            self.scheduler.cancel(&key);
        }
        if let Some(mut sub) = self.subscriptions.remove(id) {
            tracing::debug!(subscription = %id, "Unsubscribing");
            sub.close_transport("unsubscribe");
            sub.channel.clear();
            sub.state = ConnectionState::Disconnected;
            metrics::set_connection_state(id, sub.state);
            self.listener
                .on_connection_change(id, sub.state, &sub.stats);
        }
        self.dirty = true;
    }

    // -------------------------------------------------------------------------
    // Connection attempts
    // -------------------------------------------------------------------------

    fn start_attempt(&mut self, id: &SubscriptionId) {
        let service = self.config.breaker_service.clone();
        let Some(sub) = self.subscriptions.get_mut(id) else {
            return;
        };

        if let Some(wait) = self.breakers.retry_after(&service, Instant::now()) {
            tracing::warn!(
                subscription = %id,
                service = %service,
                retry_after_ms = wait.as_millis(),
                "Circuit open, deferring connection attempt"
            );
            sub.stats.last_error = Some(FeedError::CircuitOpen { service });
            sub.state = ConnectionState::Reconnecting;
            arm(
                &mut self.scheduler,
                &self.inbox_tx,
                TimerKey::Reconnect(id.clone()),
                wait,
            );
            self.changed(id);
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        sub.generation = generation;
        sub.stats.attempts += 1;
        sub.state = ConnectionState::Connecting;
        sub.replica.clear();

        let url = feed::profile(id.provider).target(id.stream, &id.pair);
        tracing::info!(
            subscription = %id,
            url = %url,
            attempt = sub.stats.attempts,
            generation,
            "Connecting"
        );

        let inbox = self.inbox_tx.clone();
        let sink = EventSink::new(id.clone(), generation, move |event| {
            let _ = inbox.send(SupervisorEvent::Transport(event));
        });
        let request = ConnectRequest {
            id: id.clone(),
            url,
            generation,
        };

        match self.connector.connect(request, sink) {
            Ok(handle) => {
                sub.handle = Some(handle);
                self.changed(id);
            }
            Err(error) => {
                tracing::warn!(subscription = %id, error = %error, "Transport failed to start");
                self.fail(
                    id,
                    FeedError::Transient {
                        code: ABNORMAL_CLOSURE,
                        reason: error.to_string(),
                    },
                );
            }
        }
    }

    /// Record a failed attempt and either schedule a reconnect or park in `Failed`.
    fn fail(&mut self, id: &SubscriptionId, error: FeedError) {
        let service = &self.config.breaker_service;
        self.breakers.record_failure(service, Instant::now());
        metrics::set_circuit_open(
            service,
            self.breakers.state(service).is_some_and(|s| s.is_open),
        );

        let Some(sub) = self.subscriptions.get_mut(id) else {
            return;
        };
        sub.handle = None;

        let policy = self.config.policies.for_class(sub.spec.class);
        if !policy.allows(sub.reconnect_attempt) {
            tracing::error!(
                subscription = %id,
                attempts = sub.reconnect_attempt,
                error = %error,
                "Reconnect attempts exhausted"
            );
            sub.stats.last_error = Some(FeedError::ExhaustedRetries {
                attempts: sub.reconnect_attempt,
            });
            sub.state = ConnectionState::Failed;
            self.changed(id);
            return;
        }

        let delay = policy.jittered_delay_for(sub.reconnect_attempt);
        sub.reconnect_attempt += 1;
        tracing::info!(
            subscription = %id,
            attempt = sub.reconnect_attempt,
            delay_ms = delay.as_millis(),
            error = %error,
            "Scheduling reconnect"
        );
        sub.stats.last_error = Some(error);
        sub.state = ConnectionState::Reconnecting;

        arm(
            &mut self.scheduler,
            &self.inbox_tx,
            TimerKey::Reconnect(id.clone()),
            delay,
        );
        metrics::record_reconnect(id.provider, id.stream);
        self.changed(id);
    }

    // -------------------------------------------------------------------------
    // Transport events
    // -------------------------------------------------------------------------

    fn on_open(&mut self, id: &SubscriptionId) {
        let Some(sub) = self.subscriptions.get_mut(id) else {
            return;
        };

        if let Some(frame) = feed::profile(id.provider).handshake_message(id.stream, &id.pair) {
            let sent = sub
                .handle
                .as_ref()
                .map_or(Err(TransportError::Closed), |handle| handle.send(frame));
            if let Err(error) = sent {
                tracing::warn!(subscription = %id, error = %error, "Subscribe handshake failed");
                sub.close_transport("handshake failed");
                // Retire the generation so the closing transport's events are ignored.
                self.next_generation += 1;
                sub.generation = self.next_generation;
                self.fail(id, FeedError::Handshake(error.to_string()));
                return;
            }
        }

        sub.state = ConnectionState::Connected;
        sub.reconnect_attempt = 0;
        sub.stats.last_connected_at = Some(Utc::now());
        tracing::info!(subscription = %id, attempts = sub.stats.attempts, "Connected");

        let service = &self.config.breaker_service;
        self.breakers.record_success(service);
        metrics::set_circuit_open(service, false);
        self.changed(id);
    }

    fn on_message(&mut self, id: &SubscriptionId, text: &str) {
        let Self {
            config,
            subscriptions,
            scheduler,
            normalizer,
            listener,
            inbox_tx,
            ..
        } = self;
        let Some(sub) = subscriptions.get_mut(id) else {
            return;
        };
        if sub.state != ConnectionState::Connected {
            return;
        }

        let provider = id.provider;
        metrics::record_frame_received(provider, id.stream);

        let frame = match feed::profile(provider).decode(id.stream, text) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(error) => {
                if matches!(error, feed::ProtocolError::Provider(_)) {
                    tracing::warn!(subscription = %id, error = %error, "Provider reported an error");
                } else {
                    tracing::debug!(subscription = %id, error = %error, "Dropping malformed frame");
                }
                metrics::record_frame_dropped(provider, id.stream, error.reason());
                sub.stats.last_error = Some(FeedError::Protocol(error));
                return;
            }
        };

        match (frame, &mut sub.channel) {
            (InboundFrame::Ticker(ticker), CoalescingChannel::Passthrough) => {
                listener.on_ticker(provider, ticker);
            }
            (InboundFrame::Depth(raw), CoalescingChannel::Depth(throttle)) => {
                sub.replica.replace(raw);
                let book = normalizer.normalize(&sub.replica.to_raw());
                match throttle.offer(book, Instant::now()) {
                    ThrottleDecision::EmitNow(book) => emit_depth(listener.as_ref(), provider, book),
                    ThrottleDecision::Arm(remaining) => {
                        arm(scheduler, inbox_tx, TimerKey::DepthWindow(id.clone()), remaining);
                    }
                    ThrottleDecision::Buffered => {}
                }
            }
            (InboundFrame::DepthDelta(raw), CoalescingChannel::Depth(throttle)) => {
                sub.replica.apply(raw);
                let book = normalizer.normalize(&sub.replica.to_raw());
                match throttle.offer(book, Instant::now()) {
                    ThrottleDecision::EmitNow(book) => emit_depth(listener.as_ref(), provider, book),
                    ThrottleDecision::Arm(remaining) => {
                        arm(scheduler, inbox_tx, TimerKey::DepthWindow(id.clone()), remaining);
                    }
                    ThrottleDecision::Buffered => {}
                }
            }
            (InboundFrame::Trades(trades), CoalescingChannel::Trades(batcher)) => {
                for trade in trades {
                    if !trade.is_valid() {
                        metrics::record_frame_dropped(provider, id.stream, "invalid_trade");
                        continue;
                    }
                    let outcome = batcher.push(trade);
                    if outcome.evicted {
                        metrics::record_trade_evicted(provider);
                    }
                    if outcome.arm {
                        arm(
                            scheduler,
                            inbox_tx,
                            TimerKey::TradeWindow(id.clone()),
                            config.coalescer.trade_window,
                        );
                    }
                }
            }
            _ => {
                metrics::record_frame_dropped(provider, id.stream, "unexpected_payload");
            }
        }
    }

    fn on_error(&mut self, id: &SubscriptionId, error: String) {
        tracing::warn!(subscription = %id, error = %error, "Transport error");

        let service = &self.config.breaker_service;
        self.breakers.record_failure(service, Instant::now());
        metrics::set_circuit_open(
            service,
            self.breakers.state(service).is_some_and(|s| s.is_open),
        );

        if let Some(sub) = self.subscriptions.get_mut(id) {
            sub.stats.last_error = Some(FeedError::Transient {
                code: ABNORMAL_CLOSURE,
                reason: error,
            });
        }
        self.dirty = true;
    }

    fn on_close(&mut self, id: &SubscriptionId, code: u16, reason: String) {
        // Deliver trades that already arrived; a stale book is not worth sending.
        self.flush_trades(id);
        self.scheduler.cancel(&TimerKey::DepthWindow(id.clone()));

        let Some(sub) = self.subscriptions.get_mut(id) else {
            return;
        };
        sub.handle = None;
        sub.channel.clear();

        if code == NORMAL_CLOSURE {
            tracing::info!(subscription = %id, reason = %reason, "Closed normally");
            sub.state = ConnectionState::Disconnected;
            self.changed(id);
            return;
        }

        tracing::warn!(subscription = %id, code, reason = %reason, "Connection dropped");
        self.fail(id, FeedError::Transient { code, reason });
    }

    // -------------------------------------------------------------------------
    // Coalescing windows
    // -------------------------------------------------------------------------

    fn flush_depth(&mut self, id: &SubscriptionId) {
        let Some(sub) = self.subscriptions.get_mut(id) else {
            return;
        };
        if let CoalescingChannel::Depth(throttle) = &mut sub.channel
            && let Some(book) = throttle.fire(Instant::now())
        {
            emit_depth(self.listener.as_ref(), id.provider, book);
        }
    }

    fn flush_trades(&mut self, id: &SubscriptionId) {
        self.scheduler.cancel(&TimerKey::TradeWindow(id.clone()));
        let Some(sub) = self.subscriptions.get_mut(id) else {
            return;
        };
        let CoalescingChannel::Trades(batcher) = &mut sub.channel else {
            return;
        };
        let batch: Vec<Trade> = batcher.flush();
        if !batch.is_empty() {
            metrics::record_trade_batch_emitted(id.provider);
            self.listener.on_trade_batch(id.provider, batch);
        }
    }

    // -------------------------------------------------------------------------
    // Notifications
    // -------------------------------------------------------------------------

    fn changed(&mut self, id: &SubscriptionId) {
        if let Some(sub) = self.subscriptions.get(id) {
            metrics::set_connection_state(id, sub.state);
            self.listener
                .on_connection_change(id, sub.state, &sub.stats);
        }
        self.dirty = true;
    }

    fn build_snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            running: true,
            session_id: Some(self.session_id),
            symbol: self.symbol.clone(),
            subscriptions: self
                .subscriptions
                .values()
                .map(Subscription::snapshot)
                .collect(),
            breakers: self.breakers.snapshot(Instant::now()),
        }
    }

    fn publish_snapshot(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        self.snapshot_tx.send_replace(self.build_snapshot());
    }
}
