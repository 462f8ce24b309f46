//! Connection-owning transport layer.
//!
//! The transport is a background worker that exclusively owns the websocket
//! and is driven over a command channel; lifecycle signals and inbound text
//! frames flow back over an event channel. The worker handles reconnects with
//! capped exponential backoff and keeps the connection alive with periodic
//! pings. It performs no frame parsing.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{
    InvalidHeaderName, InvalidHeaderValue, AUTHORIZATION,
};
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::backoff::{Backoff, ReconnectPolicy};

/// Default interval between liveness probes while the connection is open.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type ClientRequest = tokio_tungstenite::tungstenite::handshake::client::Request;

/// Observable lifecycle of the underlying connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// Lock-free cell holding the current [`ConnectionState`].
///
/// Written only by the transport worker; read from any handle.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionState::Closed,
            1 => ConnectionState::Connecting,
            _ => ConnectionState::Open,
        }
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Connection settings for the websocket transport.
#[derive(Clone)]
pub struct TransportConfig {
    /// Websocket endpoint URL.
    pub endpoint: String,
    /// Credential attached to the handshake as `authorization: Bearer <token>`.
    pub bearer_token: Option<SecretString>,
    /// Extra handshake headers.
    pub headers: Vec<(String, String)>,
    /// Interval between liveness probes.
    pub heartbeat_interval: Duration,
    /// Reconnect pacing after a connection loss.
    pub reconnect: ReconnectPolicy,
}

impl TransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bearer_token: None,
            headers: Vec::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect: ReconnectPolicy::standard(),
        }
    }

    /// Checks that the endpoint and headers form a valid handshake request.
    pub(crate) fn validate(&self) -> Result<(), TransportError> {
        build_request(self).map(|_| ())
    }
}

/// Errors produced by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("invalid header name: {0}")]
    InvalidHeaderName(#[from] InvalidHeaderName),

    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] InvalidHeaderValue),

    /// No active connection to write to.
    #[error("no active connection")]
    NotConnected,

    /// The transport worker is no longer running.
    #[error("transport worker stopped")]
    WorkerGone,
}

/// Lifecycle signals and inbound frames delivered to the transport's owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection was established; backoff has been reset.
    Opened,
    /// A text frame arrived.
    Message(String),
    /// A connection-level failure; the reconnect machine handles recovery.
    Error(TransportError),
    /// The connection is gone (lost, or closed on request).
    Closed,
}

pub(crate) enum TransportCommand {
    Connect,
    Disconnect,
    Send(String, oneshot::Sender<Result<(), TransportError>>),
}

/// Handle driving a transport worker.
pub struct Transport {
    cmd_tx: mpsc::UnboundedSender<TransportCommand>,
    state: Arc<StateCell>,
}

impl Transport {
    /// Spawns a websocket transport worker and returns the handle paired with
    /// its event receiver.
    pub fn websocket(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(StateCell::new(ConnectionState::Closed));

        tokio::spawn(transport_worker(
            config,
            cmd_rx,
            event_tx,
            Arc::clone(&state),
        ));

        (Self { cmd_tx, state }, event_rx)
    }

    /// Builds a handle over caller-owned channels. Tests use this to script
    /// transport behavior without a network.
    #[cfg(test)]
    pub(crate) fn from_channel(
        cmd_tx: mpsc::UnboundedSender<TransportCommand>,
        state: Arc<StateCell>,
    ) -> Self {
        Self { cmd_tx, state }
    }

    /// Requests a connection. Ignored by the worker while already connecting
    /// or open.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(TransportCommand::Connect);
    }

    /// Closes the active connection, if any, and suppresses auto-reconnect.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(TransportCommand::Disconnect);
    }

    /// Writes a text frame and awaits the write acknowledgement.
    ///
    /// The transport does not buffer: a failure is the caller's to retry.
    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(TransportCommand::Send(text, ack_tx))
            .map_err(|_| TransportError::WorkerGone)?;
        ack_rx.await.map_err(|_| TransportError::WorkerGone)?
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn shared_state(&self) -> Arc<StateCell> {
        Arc::clone(&self.state)
    }
}

enum SessionOutcome {
    ConnectionLost,
    Disconnected,
    ChannelClosed,
}

enum WaitOutcome {
    Elapsed,
    Disconnected,
    ChannelClosed,
}

async fn transport_worker(
    config: TransportConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<TransportCommand>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<StateCell>,
) {
    'idle: loop {
        state.set(ConnectionState::Closed);

        // Wait for a connect request; sends while closed fail immediately.
        loop {
            match cmd_rx.recv().await {
                None => return,
                Some(TransportCommand::Connect) => break,
                Some(TransportCommand::Disconnect) => {}
                Some(TransportCommand::Send(_, ack)) => {
                    let _ = ack.send(Err(TransportError::NotConnected));
                }
            }
        }

        let mut backoff = Backoff::new(config.reconnect.clone());
        loop {
            state.set(ConnectionState::Connecting);
            debug!(endpoint = %config.endpoint, "connecting");

            let request = match build_request(&config) {
                Ok(request) => request,
                Err(err) => {
                    let _ = event_tx.send(TransportEvent::Error(err));
                    let _ = event_tx.send(TransportEvent::Closed);
                    continue 'idle;
                }
            };

            match connect_async(request).await {
                Ok((socket, _)) => {
                    backoff.reset();
                    state.set(ConnectionState::Open);
                    let _ = event_tx.send(TransportEvent::Opened);

                    let outcome =
                        run_open_connection(socket, &config, &mut cmd_rx, &event_tx).await;

                    state.set(ConnectionState::Closed);
                    let _ = event_tx.send(TransportEvent::Closed);

                    match outcome {
                        SessionOutcome::ConnectionLost => {}
                        SessionOutcome::Disconnected => continue 'idle,
                        SessionOutcome::ChannelClosed => return,
                    }
                }
                Err(err) => {
                    state.set(ConnectionState::Closed);
                    let _ = event_tx.send(TransportEvent::Error(err.into()));
                    let _ = event_tx.send(TransportEvent::Closed);
                }
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            match wait_for_reconnect(delay, &mut cmd_rx).await {
                WaitOutcome::Elapsed => {}
                WaitOutcome::Disconnected => continue 'idle,
                WaitOutcome::ChannelClosed => return,
            }
        }
    }
}

async fn run_open_connection(
    mut socket: WsStream,
    config: &TransportConfig,
    cmd_rx: &mut mpsc::UnboundedReceiver<TransportCommand>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> SessionOutcome {
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                None => {
                    let _ = socket.close(None).await;
                    return SessionOutcome::ChannelClosed;
                }
                Some(TransportCommand::Disconnect) => {
                    let _ = socket.close(None).await;
                    return SessionOutcome::Disconnected;
                }
                Some(TransportCommand::Connect) => {}
                Some(TransportCommand::Send(text, ack)) => {
                    match socket.send(Message::Text(text)).await {
                        Ok(()) => {
                            let _ = ack.send(Ok(()));
                        }
                        Err(err) => {
                            let _ = ack.send(Err(err.into()));
                            return SessionOutcome::ConnectionLost;
                        }
                    }
                }
            },
            _ = heartbeat.tick() => {
                debug!("sending heartbeat ping");
                if let Err(err) = socket.send(Message::Ping(Vec::new())).await {
                    // The close observed by the read side drives reconnection.
                    let _ = event_tx.send(TransportEvent::Error(err.into()));
                }
            }
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = event_tx.send(TransportEvent::Message(text));
                }
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        return SessionOutcome::ConnectionLost;
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => return SessionOutcome::ConnectionLost,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = event_tx.send(TransportEvent::Error(err.into()));
                    return SessionOutcome::ConnectionLost;
                }
                None => return SessionOutcome::ConnectionLost,
            },
        }
    }
}

async fn wait_for_reconnect(
    delay: Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<TransportCommand>,
) -> WaitOutcome {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return WaitOutcome::Elapsed,
            command = cmd_rx.recv() => match command {
                None => return WaitOutcome::ChannelClosed,
                Some(TransportCommand::Disconnect) => return WaitOutcome::Disconnected,
                Some(TransportCommand::Connect) => {}
                Some(TransportCommand::Send(_, ack)) => {
                    let _ = ack.send(Err(TransportError::NotConnected));
                }
            }
        }
    }
}

fn build_request(config: &TransportConfig) -> Result<ClientRequest, TransportError> {
    let mut request = config.endpoint.as_str().into_client_request()?;

    if let Some(token) = &config.bearer_token {
        let value: HeaderValue = format!("Bearer {}", token.expose_secret()).parse()?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    for (name, value) in &config.headers {
        let name: HeaderName = name.parse()?;
        let value: HeaderValue = value.parse()?;
        request.headers_mut().insert(name, value);
    }

    Ok(request)
}
