//! WebSocket Transport
//!
//! [`FeedConnector`] over `tokio-tungstenite`. Each connection runs on its own
//! task which owns the socket, answers pings, runs the heartbeat monitor and
//! reports everything it sees through the [`EventSink`].
//!
//! A transport always reports exactly one `Close` unless it was cancelled
//! before the socket opened. Drops without a close frame are reported with
//! code 1006.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
use crate::application::ports::{
    ConnectRequest, EventSink, FeedConnector, TransportError, TransportHandle,
};
use crate::domain::connection::{ABNORMAL_CLOSURE, NORMAL_CLOSURE};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Handle to one socket task.
#[derive(Debug)]
pub struct WebSocketHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
}

impl TransportHandle for WebSocketHandle {
    fn send(&self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self, code: u16, reason: &str) {
        // Queued first so an open socket still sends this code; the cancel
        // abandons a connect that has not finished yet.
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.cancel.cancel();
    }
}

/// Opens WebSocket transports on the current tokio runtime.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    heartbeat: HeartbeatConfig,
    cancel: CancellationToken,
}

impl WebSocketConnector {
    /// Create a connector. Cancelling `cancel` closes every socket it opened.
    #[must_use]
    pub const fn new(heartbeat: HeartbeatConfig, cancel: CancellationToken) -> Self {
        Self { heartbeat, cancel }
    }
}

impl FeedConnector for WebSocketConnector {
    fn connect(
        &self,
        request: ConnectRequest,
        sink: EventSink,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        let socket = Socket {
            request,
            sink,
            outbound_rx,
            heartbeat: self.heartbeat,
            cancel: cancel.clone(),
        };
        runtime.spawn(socket.run());

        Ok(Box::new(WebSocketHandle { outbound, cancel }))
    }
}

struct Socket {
    request: ConnectRequest,
    sink: EventSink,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    heartbeat: HeartbeatConfig,
    cancel: CancellationToken,
}

impl Socket {
    async fn run(mut self) {
        let id = self.request.id.clone();
        let connect = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(self.request.url.as_str()),
        );

        let connected = tokio::select! {
            () = self.cancel.cancelled() => return,
            result = connect => result,
        };
        let stream = match connected {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                let reason = e.to_string();
                tracing::debug!(subscription = %id, error = %reason, "WebSocket connect failed");
                self.sink.error(reason.clone());
                self.sink.close(ABNORMAL_CLOSURE, reason);
                return;
            }
            Err(_) => {
                self.sink.error("connect timed out");
                self.sink.close(ABNORMAL_CLOSURE, "connect timed out");
                return;
            }
        };

        tracing::debug!(subscription = %id, url = %self.request.url, "WebSocket open");
        self.sink.open();

        let (mut write, mut read) = stream.split();

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(4);
        let heartbeat_cancel = self.cancel.child_token();
        tokio::spawn(
            HeartbeatMonitor::new(
                self.heartbeat,
                heartbeat_state.clone(),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );

        let (code, reason) = loop {
            tokio::select! {
                biased;

                outbound = self.outbound_rx.recv() => match outbound {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            self.sink.error(e.to_string());
                            break (ABNORMAL_CLOSURE, e.to_string());
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = write.send(close_frame(code, &reason)).await;
                        break (code, reason);
                    }
                    None => {
                        let _ = write.send(close_frame(NORMAL_CLOSURE, "handle dropped")).await;
                        break (NORMAL_CLOSURE, "handle dropped".to_string());
                    }
                },
                () = self.cancel.cancelled() => {
                    let _ = write.send(close_frame(NORMAL_CLOSURE, "shutdown")).await;
                    break (NORMAL_CLOSURE, "shutdown".to_string());
                }
                event = heartbeat_rx.recv() => match event {
                    Some(HeartbeatEvent::SendPing) => {
                        heartbeat_state.mark_ping_sent();
                        if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                            self.sink.error(e.to_string());
                            break (ABNORMAL_CLOSURE, e.to_string());
                        }
                    }
                    Some(HeartbeatEvent::Timeout) | None => {
                        self.sink.error("heartbeat timeout");
                        break (ABNORMAL_CLOSURE, "heartbeat timeout".to_string());
                    }
                },
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            heartbeat_state.record_activity();
                            self.sink.message(text.as_str());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat_state.record_activity();
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {
                            heartbeat_state.record_activity();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map_or_else(
                                || (ABNORMAL_CLOSURE, "closed without status".to_string()),
                                |f| (u16::from(f.code), f.reason.to_string()),
                            );
                        }
                        Some(Err(e)) => {
                            self.sink.error(e.to_string());
                            break (ABNORMAL_CLOSURE, e.to_string());
                        }
                        None => break (ABNORMAL_CLOSURE, "stream ended".to_string()),
                    }
                }
            }
        };

        heartbeat_cancel.cancel();
        tracing::debug!(subscription = %id, code, reason = %reason, "WebSocket closed");
        self.sink.close(code, reason);
    }
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{TransportEvent, TransportEventKind};
    use crate::domain::market::{Provider, StreamType, SubscriptionId, TradingPair};
    use tokio::net::TcpListener;

    fn request(url: String) -> ConnectRequest {
        ConnectRequest {
            id: SubscriptionId::new(
                Provider::Binance,
                TradingPair::new("BTC", "USDT"),
                StreamType::Trade,
            ),
            url,
            generation: 1,
        }
    }

    fn recording_sink(
        request: &ConnectRequest,
    ) -> (EventSink, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(request.id.clone(), request.generation, move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    #[tokio::test]
    async fn round_trip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text("hello".into())).await.unwrap();
            let Some(Ok(Message::Text(reply))) = ws.next().await else {
                panic!("expected a text frame");
            };
            assert_eq!(reply.as_str(), "subscribe");
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            }))
            .await
            .unwrap();
        });

        let connector = WebSocketConnector::new(HeartbeatConfig::default(), CancellationToken::new());
        let request = request(format!("ws://{addr}"));
        let (sink, mut events) = recording_sink(&request);
        let handle = connector.connect(request, sink).unwrap();

        assert_eq!(events.recv().await.unwrap().kind, TransportEventKind::Open);
        assert_eq!(
            events.recv().await.unwrap().kind,
            TransportEventKind::Message("hello".to_string())
        );
        handle.send("subscribe".to_string()).unwrap();
        assert_eq!(
            events.recv().await.unwrap().kind,
            TransportEventKind::Close {
                code: NORMAL_CLOSURE,
                reason: "done".to_string()
            }
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_before_open_abandons_the_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = WebSocketConnector::new(HeartbeatConfig::default(), CancellationToken::new());
        let request = request(format!("ws://{addr}"));
        let (sink, mut events) = recording_sink(&request);
        let handle = connector.connect(request, sink).unwrap();
        handle.close(NORMAL_CLOSURE, "teardown");
        drop(handle);

        assert_eq!(events.recv().await, None);

        let upgraded = tokio::time::timeout(Duration::from_millis(200), async {
            let (tcp, _) = listener.accept().await.ok()?;
            tokio_tungstenite::accept_async(tcp).await.ok()
        })
        .await;
        assert!(!matches!(upgraded, Ok(Some(_))));
    }

    #[tokio::test]
    async fn close_on_open_socket_sends_requested_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let Some(Ok(Message::Close(Some(frame)))) = ws.next().await else {
                panic!("expected a close frame");
            };
            (u16::from(frame.code), frame.reason.to_string())
        });

        let connector = WebSocketConnector::new(HeartbeatConfig::default(), CancellationToken::new());
        let request = request(format!("ws://{addr}"));
        let (sink, mut events) = recording_sink(&request);
        let handle = connector.connect(request, sink).unwrap();

        assert_eq!(events.recv().await.unwrap().kind, TransportEventKind::Open);
        handle.close(NORMAL_CLOSURE, "teardown");

        assert_eq!(
            events.recv().await.unwrap().kind,
            TransportEventKind::Close {
                code: NORMAL_CLOSURE,
                reason: "teardown".to_string()
            }
        );
        assert_eq!(
            server.await.unwrap(),
            (NORMAL_CLOSURE, "teardown".to_string())
        );
    }

    #[tokio::test]
    async fn refused_connection_reports_abnormal_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WebSocketConnector::new(HeartbeatConfig::default(), CancellationToken::new());
        let request = request(format!("ws://{addr}"));
        let (sink, mut events) = recording_sink(&request);
        let _handle = connector.connect(request, sink).unwrap();

        assert!(matches!(
            events.recv().await.unwrap().kind,
            TransportEventKind::Error(_)
        ));
        assert!(matches!(
            events.recv().await.unwrap().kind,
            TransportEventKind::Close {
                code: ABNORMAL_CLOSURE,
                ..
            }
        ));
    }

    #[test]
    fn connect_outside_runtime_fails() {
        let connector = WebSocketConnector::new(HeartbeatConfig::default(), CancellationToken::new());
        let request = request("ws://127.0.0.1:1".to_string());
        let (sink, _events) = recording_sink(&request);
        assert!(matches!(
            connector.connect(request, sink),
            Err(TransportError::Connect(_))
        ));
    }
}
