//! Tunnel connection lifecycle
//!
//! `disconnected → connecting → connected → disconnected`, looping until
//! shutdown is requested. Each lost connection is retried after a growing
//! backoff delay that resets once a connection opens.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use porthole_shared::protocol::CLOSE_MISSING_TUNNEL_ID;
use porthole_shared::{Error, Message, ResponseFrame};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::api::RelayAddr;
use crate::forward::Forwarder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A connection attempt starts
    Dial,
    /// The relay accepted the connection
    Opened,
    /// The attempt failed, or an open connection closed
    Lost,
}

impl ConnectionState {
    /// Next state for `event`, or `None` if the event is not valid here
    pub fn on(self, event: Transition) -> Option<ConnectionState> {
        use ConnectionState::*;
        match (self, event) {
            (Disconnected, Transition::Dial) => Some(Connecting),
            (Connecting, Transition::Opened) => Some(Connected),
            (Connecting, Transition::Lost) | (Connected, Transition::Lost) => Some(Disconnected),
            _ => None,
        }
    }
}

/// Multiplicative reconnect delay between a floor and a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    factor: f64,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, factor: f64, cap: Duration) -> Self {
        let floor = floor.min(cap);
        Self {
            floor,
            factor: factor.max(1.0),
            cap,
            current: floor,
        }
    }

    /// Delay before the next attempt; grows the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.factor).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 1.5, Duration::from_secs(15))
    }
}

/// Lifecycle notifications for whoever drives the client (CLI banner, tests)
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// The relay confirmed the tunnel
    Connected { tunnel_id: String },
    ReconnectScheduled(Duration),
}

enum SessionEnd {
    Shutdown,
    Lost,
}

pub struct TunnelClient {
    endpoint: String,
    tunnel_id: String,
    forwarder: Arc<Forwarder>,
    backoff: Backoff,
    state: ConnectionState,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl TunnelClient {
    pub fn new(relay: &RelayAddr, tunnel_id: impl Into<String>, forwarder: Forwarder, backoff: Backoff) -> Self {
        let tunnel_id = tunnel_id.into();
        Self {
            endpoint: relay.tunnel_endpoint(&tunnel_id),
            tunnel_id,
            forwarder: Arc::new(forwarder),
            backoff,
            state: ConnectionState::Disconnected,
            events: None,
        }
    }

    /// Receive lifecycle events from this client
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Keep the tunnel up until `shutdown` turns true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.transition(Transition::Dial);
            info!("Connecting to relay: {}", self.endpoint);

            let end = self.session(&mut shutdown).await;
            self.transition(Transition::Lost);
            match end {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Lost) => warn!("Connection to relay closed"),
                Err(e) => warn!("Tunnel connection failed: {}", e),
            }

            let delay = self.backoff.next_delay();
            self.emit(ClientEvent::ReconnectScheduled(delay));
            info!("Reconnecting in {:.1}s", delay.as_secs_f64());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut shutdown) => break,
            }
        }
        info!("Tunnel {} stopped", self.tunnel_id);
    }

    /// One connection, from dial to close
    async fn session(&mut self, shutdown: &mut watch::Receiver<bool>) -> porthole_shared::Result<SessionEnd> {
        let ws = tokio::select! {
            res = connect_async(self.endpoint.as_str()) => {
                res.map_err(|e| Error::Connection(e.to_string()))?.0
            }
            _ = stopped(shutdown) => return Ok(SessionEnd::Shutdown),
        };

        self.backoff.reset();
        self.transition(Transition::Opened);

        let (mut write, mut read) = ws.split();
        let (resp_tx, mut resp_rx) = mpsc::channel::<ResponseFrame>(100);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => self.handle_message(Message::decode(&text), &resp_tx),
                        Some(Ok(WsMessage::Binary(data))) => self.handle_message(Message::decode_bytes(&data), &resp_tx),
                        // tungstenite queues the pong and flushes it on the next read.
                        Some(Ok(WsMessage::Ping(_))) => debug!("Ping from relay"),
                        Some(Ok(WsMessage::Close(frame))) => {
                            return match frame {
                                Some(f) if u16::from(f.code) == CLOSE_MISSING_TUNNEL_ID => {
                                    Err(Error::Protocol(format!("relay rejected tunnel: {}", f.reason)))
                                }
                                _ => Ok(SessionEnd::Lost),
                            };
                        }
                        None => return Ok(SessionEnd::Lost),
                        Some(Err(e)) => return Err(Error::Connection(e.to_string())),
                        _ => {}
                    }
                }
                Some(frame) = resp_rx.recv() => {
                    let req_id = frame.req_id.clone();
                    match Message::Response(frame).encode() {
                        Ok(text) => {
                            write
                                .send(WsMessage::Text(text))
                                .await
                                .map_err(|e| Error::Connection(e.to_string()))?;
                        }
                        Err(e) => warn!("Failed to encode response {}: {}", req_id, e),
                    }
                }
                _ = stopped(shutdown) => {
                    info!("Shutting down...");
                    if let Err(e) = write.send(WsMessage::Close(None)).await {
                        debug!("Close failed: {}", e);
                    }
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    fn handle_message(&self, msg: porthole_shared::Result<Message>, responses: &mpsc::Sender<ResponseFrame>) {
        match msg {
            Ok(Message::Connected { tunnel_id }) => {
                info!("Tunnel active: {}", tunnel_id);
                self.emit(ClientEvent::Connected { tunnel_id });
            }
            Ok(Message::Request(frame)) => {
                let forwarder = self.forwarder.clone();
                let responses = responses.clone();
                tokio::spawn(async move {
                    let resp = forwarder.forward(frame).await;
                    if responses.send(resp).await.is_err() {
                        debug!("Connection closed before the response could be sent");
                    }
                });
            }
            Ok(other) => warn!("Unexpected {} message from relay", other.kind()),
            Err(e) => warn!("Dropping malformed message: {}", e),
        }
    }

    fn transition(&mut self, event: Transition) {
        match self.state.on(event) {
            Some(next) => {
                debug!("{:?} -> {:?}", self.state, next);
                self.state = next;
                self.emit(ClientEvent::StateChanged(next));
            }
            None => warn!("Ignoring {:?} while {:?}", event, self.state),
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Resolves once shutdown is requested; never resolves if the sender is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert_eq!(Disconnected.on(Transition::Dial), Some(Connecting));
        assert_eq!(Connecting.on(Transition::Opened), Some(Connected));
        assert_eq!(Connecting.on(Transition::Lost), Some(Disconnected));
        assert_eq!(Connected.on(Transition::Lost), Some(Disconnected));

        assert_eq!(Disconnected.on(Transition::Opened), None);
        assert_eq!(Connected.on(Transition::Dial), None);
        assert_eq!(Disconnected.on(Transition::Lost), None);
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::default();
        let delays: Vec<f64> = (0..8).map(|_| backoff.next_delay().as_secs_f64()).collect();
        assert_eq!(delays, vec![2.0, 3.0, 4.5, 6.75, 10.125, 15.0, 15.0, 15.0]);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_retries_until_shutdown() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let relay = RelayAddr::parse(&format!("ws://{}", addr)).unwrap();
        let forwarder = Forwarder::new("http://localhost:3000").unwrap();
        let backoff = Backoff::new(Duration::from_millis(10), 2.0, Duration::from_millis(40));
        let mut client = TunnelClient::new(&relay, "retry", forwarder, backoff);
        let mut events = client.subscribe();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(client.run(stop_rx));

        let mut delays = Vec::new();
        while delays.len() < 4 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
                Some(ClientEvent::ReconnectScheduled(d)) => delays.push(d.as_millis()),
                Some(ClientEvent::Connected { .. }) => panic!("nothing should accept the connection"),
                Some(_) => {}
                None => panic!("client stopped early"),
            }
        }
        assert_eq!(delays, vec![10, 20, 40, 40]);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_answers_relay_pings() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let connected = Message::Connected { tunnel_id: "pong".into() };
            ws.send(WsMessage::Text(connected.encode().unwrap())).await.unwrap();
            ws.send(WsMessage::Ping(b"keepalive".to_vec())).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Pong(data))) => return data,
                    Some(Ok(_)) => continue,
                    other => panic!("client went away: {:?}", other),
                }
            }
        });

        let relay_addr = RelayAddr::parse(&format!("ws://{}", addr)).unwrap();
        let forwarder = Forwarder::new("http://localhost:3000").unwrap();
        let client = TunnelClient::new(&relay_addr, "pong", forwarder, Backoff::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(client.run(stop_rx));

        let pong = tokio::time::timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
        assert_eq!(pong, b"keepalive");

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
