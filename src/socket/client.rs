//! Channel-multiplexed socket client.
//!
//! A [`Socket`] is a cloneable handle over a background worker that owns the
//! subscription table, the pending-reply table, the send buffer, and one
//! transport. Every mutation funnels through the worker's channels (public
//! commands, transport events, timeout expiries), so a reply and its timeout
//! can never race: the worker applies them one at a time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::ReconnectPolicy;
use crate::socket::codec::{self, CodecError, Frame, ReplyResult};
use crate::socket::transport::{
    ConnectionState, StateCell, Transport, TransportConfig, TransportError, TransportEvent,
};

/// Default window a push waits for its reply.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Ways a single push can fail. Each push resolves exactly once, with its
/// reply payload or with one of these.
#[derive(Debug, Error)]
pub enum PushError {
    /// No reply arrived within the requested window. Locally generated, not a
    /// wire status.
    #[error("push timed out")]
    Timeout,

    /// The server explicitly rejected the request.
    #[error("server replied with error: code={code} reason={reason}")]
    Remote { code: u64, reason: String },

    /// The request payload could not be serialized.
    #[error("failed to encode request payload: {0}")]
    Encode(serde_json::Error),

    /// The reply payload could not be deserialized into the requested type.
    #[error("failed to decode reply payload: {0}")]
    Decode(serde_json::Error),

    /// The socket was disconnected or shut down before a reply arrived.
    #[error("socket disconnected before a reply arrived")]
    Disconnected,
}

/// Errors surfaced by handle methods and through the event channel.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A subscribed event arrived with a payload its handler could not decode.
    #[error("failed to decode \"{event}\" payload: {source}")]
    Subscription {
        event: String,
        source: serde_json::Error,
    },

    /// The socket worker is no longer running.
    #[error("socket worker is no longer running")]
    Closed,
}

/// Lifecycle transitions and non-fatal protocol errors, delivered in order.
#[derive(Debug)]
pub enum SocketEvent {
    Connected,
    Disconnected,
    Error(SocketError),
}

type SubscriptionHandler = Box<dyn FnMut(&RawValue) -> Result<(), serde_json::Error> + Send>;
type ReplyCompleter = Box<dyn FnOnce(Result<&RawValue, PushError>) + Send>;

enum Command {
    Connect,
    Disconnect,
    Subscribe {
        event: String,
        handler: SubscriptionHandler,
    },
    Unsubscribe {
        event: String,
    },
    Push {
        event: String,
        payload: Box<RawValue>,
        timeout: Option<Duration>,
        complete: ReplyCompleter,
    },
}

/// Builder for a [`Socket`].
pub struct SocketBuilder {
    config: TransportConfig,
}

impl SocketBuilder {
    /// Attaches a credential to the handshake as
    /// `authorization: Bearer <token>`.
    pub fn with_bearer_token(mut self, token: SecretString) -> Self {
        self.config.bearer_token = Some(token);
        self
    }

    /// Attaches an extra handshake header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.push((name.into(), value.into()));
        self
    }

    /// Overrides the liveness probe interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Overrides the reconnect pacing.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Validates the configuration, spawns the transport and socket workers,
    /// and returns the handle paired with its event receiver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<(Socket, mpsc::UnboundedReceiver<SocketEvent>), SocketError> {
        self.config.validate()?;
        let (transport, transport_events) = Transport::websocket(self.config);
        Ok(Socket::start(transport, transport_events))
    }
}

/// Cloneable handle to a multiplexed socket worker.
#[derive(Clone)]
pub struct Socket {
    command_tx: mpsc::UnboundedSender<Command>,
    state: Arc<StateCell>,
}

impl Socket {
    /// Starts configuring a socket for the given endpoint.
    pub fn builder(endpoint: impl Into<String>) -> SocketBuilder {
        SocketBuilder {
            config: TransportConfig::new(endpoint),
        }
    }

    fn start(
        transport: Transport,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = transport.shared_state();

        let (worker, expirations) = Multiplexer::new(transport, event_tx);
        tokio::spawn(worker.run(command_rx, transport_events, expirations));

        (Self { command_tx, state }, event_rx)
    }

    /// Opens the connection. No-op if already open or connecting.
    pub fn connect(&self) -> Result<(), SocketError> {
        self.send_command(Command::Connect)
    }

    /// Closes the connection and suppresses auto-reconnect. Outstanding
    /// pushes fail with [`PushError::Disconnected`]; subscriptions survive
    /// for a later [`Socket::connect`].
    pub fn disconnect(&self) -> Result<(), SocketError> {
        self.send_command(Command::Disconnect)
    }

    /// Subscribes to a server-pushed event, replacing any existing handler
    /// for the same name.
    pub fn on<T, F>(&self, event: &str, mut callback: F) -> Result<(), SocketError>
    where
        T: DeserializeOwned + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let handler: SubscriptionHandler = Box::new(move |raw| {
            let payload: T = serde_json::from_str(raw.get())?;
            callback(payload);
            Ok(())
        });
        self.send_command(Command::Subscribe {
            event: event.to_string(),
            handler,
        })
    }

    /// Drops the subscription for an event. No-op if absent.
    pub fn off(&self, event: &str) -> Result<(), SocketError> {
        self.send_command(Command::Unsubscribe {
            event: event.to_string(),
        })
    }

    /// Sends a request and awaits its correlated reply, with the default
    /// timeout of [`DEFAULT_PUSH_TIMEOUT`].
    pub async fn push<P, T>(&self, event: &str, payload: &P) -> Result<T, PushError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned + Send + 'static,
    {
        self.push_with_timeout(event, payload, Some(DEFAULT_PUSH_TIMEOUT))
            .await
    }

    /// Sends a request and awaits its correlated reply.
    ///
    /// With `timeout: None` the push waits indefinitely (until a reply,
    /// a disconnect, or worker shutdown). A request that cannot be written
    /// right away is buffered and replayed when the connection (re)opens.
    pub async fn push_with_timeout<P, T>(
        &self,
        event: &str,
        payload: &P,
        timeout: Option<Duration>,
    ) -> Result<T, PushError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned + Send + 'static,
    {
        let payload = serde_json::value::to_raw_value(payload).map_err(PushError::Encode)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let complete: ReplyCompleter = Box::new(move |outcome| {
            let result = outcome
                .and_then(|raw| serde_json::from_str::<T>(raw.get()).map_err(PushError::Decode));
            let _ = reply_tx.send(result);
        });

        self.command_tx
            .send(Command::Push {
                event: event.to_string(),
                payload,
                timeout,
                complete,
            })
            .map_err(|_| PushError::Disconnected)?;

        reply_rx.await.map_err(|_| PushError::Disconnected)?
    }

    /// Reads the current connection state.
    pub fn connection(&self) -> ConnectionState {
        self.state.get()
    }

    fn send_command(&self, command: Command) -> Result<(), SocketError> {
        self.command_tx
            .send(command)
            .map_err(|_| SocketError::Closed)
    }
}

struct PendingReply {
    complete: ReplyCompleter,
    expiry: Option<JoinHandle<()>>,
}

/// Worker state: the tables, the ref counter, and the transport handle.
struct Multiplexer {
    transport: Transport,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
    expiry_tx: mpsc::UnboundedSender<u64>,
    reference: u64,
    subscriptions: HashMap<String, SubscriptionHandler>,
    pending: HashMap<u64, PendingReply>,
    // BTreeMap so replay iterates in ref order.
    send_buffer: BTreeMap<u64, String>,
}

impl Multiplexer {
    fn new(
        transport: Transport,
        event_tx: mpsc::UnboundedSender<SocketEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        (
            Self {
                transport,
                event_tx,
                expiry_tx,
                reference: 0,
                subscriptions: HashMap::new(),
                pending: HashMap::new(),
                send_buffer: BTreeMap::new(),
            },
            expiry_rx,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut expirations: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None => break,
                    Some(command) => self.apply_command(command).await,
                },
                event = transport_events.recv() => match event {
                    None => break,
                    Some(event) => self.apply_transport_event(event).await,
                },
                Some(reference) = expirations.recv() => self.expire(reference),
            }
        }
        self.shutdown();
    }

    async fn apply_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.transport.connect(),
            Command::Disconnect => {
                self.transport.disconnect();
                self.fail_all_pending();
                self.send_buffer.clear();
            }
            Command::Subscribe { event, handler } => {
                self.subscriptions.insert(event, handler);
            }
            Command::Unsubscribe { event } => {
                self.subscriptions.remove(&event);
            }
            Command::Push {
                event,
                payload,
                timeout,
                complete,
            } => self.push(event, payload, timeout, complete).await,
        }
    }

    async fn push(
        &mut self,
        event: String,
        payload: Box<RawValue>,
        timeout: Option<Duration>,
        complete: ReplyCompleter,
    ) {
        self.reference = self.reference.wrapping_add(1);
        let reference = self.reference;

        let text = match codec::encode_request(reference, &event, &*payload) {
            Ok(text) => text,
            Err(err) => {
                complete(Err(PushError::Encode(err)));
                return;
            }
        };

        let expiry = timeout.map(|timeout| {
            let expiry_tx = self.expiry_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = expiry_tx.send(reference);
            })
        });

        self.pending.insert(reference, PendingReply { complete, expiry });

        if let Err(err) = self.transport.send(text.clone()).await {
            debug!(reference, error = %err, "send failed, buffering for replay");
            self.send_buffer.insert(reference, text);
        }
    }

    /// Fires a push's timeout. A no-op when the reply already resolved it.
    fn expire(&mut self, reference: u64) {
        let Some(entry) = self.pending.remove(&reference) else {
            return;
        };
        self.send_buffer.remove(&reference);
        (entry.complete)(Err(PushError::Timeout));
    }

    async fn apply_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                self.flush().await;
                let _ = self.event_tx.send(SocketEvent::Connected);
            }
            TransportEvent::Closed => {
                // Pending replies and the send buffer survive a transient
                // disconnect so the next open can replay and continue.
                let _ = self.event_tx.send(SocketEvent::Disconnected);
            }
            TransportEvent::Error(err) => {
                let _ = self.event_tx.send(SocketEvent::Error(err.into()));
            }
            TransportEvent::Message(text) => self.handle_frame(&text),
        }
    }

    /// Re-attempts every buffered send in ref order. Entries that fail stay
    /// buffered for the next open.
    async fn flush(&mut self) {
        if self.send_buffer.is_empty() {
            return;
        }
        debug!(frames = self.send_buffer.len(), "replaying buffered sends");

        let references: Vec<u64> = self.send_buffer.keys().copied().collect();
        for reference in references {
            let Some(text) = self.send_buffer.get(&reference) else {
                continue;
            };
            match self.transport.send(text.clone()).await {
                Ok(()) => {
                    self.send_buffer.remove(&reference);
                }
                Err(_) => break,
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        match codec::decode(text) {
            Ok(Frame::Push { event, payload }) => {
                // Unknown events are expected while the server catches up on
                // an unsubscribe; they are dropped without error.
                if let Some(handler) = self.subscriptions.get_mut(&event) {
                    if let Err(source) = handler(payload) {
                        warn!(event = %event, error = %source, "push payload decode failed");
                        let _ = self
                            .event_tx
                            .send(SocketEvent::Error(SocketError::Subscription {
                                event,
                                source,
                            }));
                    }
                }
            }
            Ok(Frame::Reply { reference, result }) => {
                let Some(entry) = self.pending.remove(&reference) else {
                    // Timed out already, or a ref this socket never issued.
                    return;
                };
                if let Some(expiry) = entry.expiry {
                    expiry.abort();
                }
                let outcome = match result {
                    ReplyResult::Ok(payload) => Ok(payload),
                    ReplyResult::Error { code, reason } => Err(PushError::Remote { code, reason }),
                };
                (entry.complete)(outcome);
            }
            Err(err) => {
                warn!(error = %err, "dropping malformed frame");
                let _ = self.event_tx.send(SocketEvent::Error(err.into()));
            }
        }
    }

    fn fail_all_pending(&mut self) {
        for (_, entry) in self.pending.drain() {
            if let Some(expiry) = entry.expiry {
                expiry.abort();
            }
            (entry.complete)(Err(PushError::Disconnected));
        }
    }

    fn shutdown(&mut self) {
        self.transport.disconnect();
        self.fail_all_pending();
        self.send_buffer.clear();
    }
}
