//! Shared test doubles: an in-memory connector whose transports are driven
//! by hand, and a listener that records every delivery.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use market_stream::{
    ConnectRequest, ConnectionState, ConnectionStats, ConnectionSupervisor, EventSink,
    FeedConnector, MarketDataListener, OrderBook, Provider, SubscriptionId, SupervisorConfig,
    SupervisorHandle, Ticker, Trade, TransportError, TransportHandle,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Scripted connector
// =============================================================================

/// One transport handed out by [`ScriptedConnector`].
#[derive(Clone)]
pub struct Connection {
    pub request: ConnectRequest,
    pub sink: EventSink,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<Mutex<Option<(u16, String)>>>,
}

impl Connection {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn closed(&self) -> Option<(u16, String)> {
        self.closed.lock().clone()
    }
}

struct ScriptedHandle {
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
    fail_sends: bool,
}

impl TransportHandle for ScriptedHandle {
    fn send(&self, text: String) -> Result<(), TransportError> {
        if self.fail_sends || self.closed.lock().is_some() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        self.closed
            .lock()
            .get_or_insert_with(|| (code, reason.to_string()));
    }
}

/// Connector that never touches the network. Tests play the remote side
/// through each connection's sink.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    connections: Arc<Mutex<Vec<Connection>>>,
    fail_sends: Arc<Mutex<bool>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every transport created from now on reject sends.
    pub fn fail_sends(&self, fail: bool) {
        *self.fail_sends.lock() = fail;
    }

    pub fn connect_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.connections.lock().clone()
    }

    /// Most recent transport for a subscription.
    pub fn latest(&self, id: &SubscriptionId) -> Connection {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|c| &c.request.id == id)
            .cloned()
            .expect("no connection for subscription")
    }

    pub fn count_for(&self, id: &SubscriptionId) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|c| &c.request.id == id)
            .count()
    }
}

impl FeedConnector for ScriptedConnector {
    fn connect(
        &self,
        request: ConnectRequest,
        sink: EventSink,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(None));
        self.connections.lock().push(Connection {
            request,
            sink,
            sent: sent.clone(),
            closed: closed.clone(),
        });
        Ok(Box::new(ScriptedHandle {
            sent,
            closed,
            fail_sends: *self.fail_sends.lock(),
        }))
    }
}

// =============================================================================
// Recording listener
// =============================================================================

#[derive(Debug, Clone)]
pub enum Delivery {
    Ticker(Provider, Ticker),
    Depth(Provider, OrderBook),
    Trades(Provider, Vec<Trade>),
    Connection(SubscriptionId, ConnectionState, ConnectionStats),
}

#[derive(Default)]
pub struct RecordingListener {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingListener {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn tickers(&self) -> Vec<Ticker> {
        self.deliveries
            .lock()
            .iter()
            .filter_map(|d| match d {
                Delivery::Ticker(_, t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn depth_updates(&self) -> Vec<OrderBook> {
        self.deliveries
            .lock()
            .iter()
            .filter_map(|d| match d {
                Delivery::Depth(_, b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn trade_batches(&self) -> Vec<Vec<Trade>> {
        self.deliveries
            .lock()
            .iter()
            .filter_map(|d| match d {
                Delivery::Trades(_, t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn states_for(&self, id: &SubscriptionId) -> Vec<ConnectionState> {
        self.deliveries
            .lock()
            .iter()
            .filter_map(|d| match d {
                Delivery::Connection(i, s, _) if i == id => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().len()
    }
}

impl MarketDataListener for RecordingListener {
    fn on_ticker(&self, provider: Provider, ticker: Ticker) {
        self.deliveries.lock().push(Delivery::Ticker(provider, ticker));
    }

    fn on_depth_update(&self, provider: Provider, book: OrderBook) {
        self.deliveries.lock().push(Delivery::Depth(provider, book));
    }

    fn on_trade_batch(&self, provider: Provider, trades: Vec<Trade>) {
        self.deliveries.lock().push(Delivery::Trades(provider, trades));
    }

    fn on_connection_change(
        &self,
        id: &SubscriptionId,
        state: ConnectionState,
        stats: &ConnectionStats,
    ) {
        self.deliveries
            .lock()
            .push(Delivery::Connection(id.clone(), state, stats.clone()));
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub handle: SupervisorHandle,
    pub connector: ScriptedConnector,
    pub listener: Arc<RecordingListener>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn start(config: SupervisorConfig) -> Self {
        let connector = ScriptedConnector::new();
        let listener = Arc::new(RecordingListener::default());
        let cancel = CancellationToken::new();
        let (handle, _task) = ConnectionSupervisor::spawn(
            config,
            Arc::new(connector.clone()),
            listener.clone(),
            cancel.clone(),
        );
        Self {
            handle,
            connector,
            listener,
            cancel,
        }
    }

    /// Round-trip through the inbox so everything queued so far is processed.
    pub async fn settle(&self) {
        self.handle.snapshot().await.unwrap();
    }

    /// Let paused time run forward, then settle.
    pub async fn wait(&self, millis: u64) {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        self.settle().await;
    }

    pub async fn state(&self, id: &SubscriptionId) -> ConnectionState {
        self.handle
            .snapshot()
            .await
            .unwrap()
            .subscription(id)
            .expect("unknown subscription")
            .state
    }
}
