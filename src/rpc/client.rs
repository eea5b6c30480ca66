//! Connection Manager
//!
//! Single responsibility: Keep one authenticated connection alive and let
//! many callers share it.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                RpcClient (cloneable)                    │
//! │  - connect / disconnect / send / send_with_response     │
//! │  - approve_challenge / reject_challenge                 │
//! │  - registers requests in the shared Correlator          │
//! └────────────────────────────────────────────────────────┘
//!                            │ commands (mpsc)
//!                            ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                    Connection actor                     │
//! │  - owns the socket, status, auth machine, timers        │
//! │  - routes frames to AuthMachine or Correlator           │
//! │  - heartbeat, challenge keepalive, reconnect backoff    │
//! └────────────────────────────────────────────────────────┘
//!          ▲        │          ▲                    ▲
//!     reader task   ▼    connect task          signer task
//!            writer task (per attempt)        (per approval)
//!        (per generation)
//! ```
//!
//! Everything that mutates connection state runs on the actor, and the actor
//! never waits on the network. Work that may take a while (opening a socket,
//! writing to it, waiting for a wallet) runs in a spawned task and reports
//! back tagged with the link generation current when it started; reports
//! from an older generation are dropped.
//!
//! Outgoing frames go through a bounded queue to the writer task. A peer
//! that stops reading fills the queue, and the next send treats the link as
//! lost instead of buffering without limit.
//!
//! # Reconnection Policy
//!
//! An unexpected close, a socket error, a failed open, or a handshake that
//! stops answering schedules reconnect attempt `k` after
//! `min(base * 2^(k-1), max_delay)`. After `max_retries` attempts the
//! status becomes `Failed`. A failure that retrying cannot fix (see
//! [`RpcError::is_retryable`]) goes to `Failed` at once. The attempt counter resets only once a
//! reconnect has fully authenticated.
//!
//! A user declining the challenge is never retried: the identity is marked
//! declined and `connect` refuses it until `reset_rejection`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::auth::{AuthAction, AuthContext, AuthMachine, AuthPhase, PendingChallenge};
use super::correlator::Correlator;
use super::protocol::{
    classify, decode_response, encode_request, Envelope, FrameKind, RpcRequest, RpcResponse,
    Sequence, METHOD_PING, METHOD_PONG,
};
use super::transport::{
    Connector, FrameSink, FrameStream, Transport, TransportEvent, WsConnector,
};
use crate::config::ClientConfig;
use crate::credentials::{Credential, CredentialStore, FileCredentialStore};
use crate::error::RpcError;

/// Frames queued for the writer before the peer counts as not reading
const OUTBOUND_QUEUE: usize = 256;

/// How long a closing link may take to flush and say goodbye
const CLOSE_GRACE: Duration = Duration::from_secs(1);
use crate::signer::{SessionKey, Signer};

/// Whether application traffic may flow, and if not, why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    /// Socket opening or handshake talking to the node
    Connecting,
    /// A challenge is waiting for approval
    PendingAuth,
    Connected,
    /// Socket open but the handshake was rejected
    Unauthenticated,
    Reconnecting,
    /// Reconnect attempts exhausted
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::PendingAuth => "pending_auth",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Unauthenticated => "unauthenticated",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Failed => "failed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something subscribers may want to know about.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StatusChanged(ConnectionStatus),
    /// Every application frame, whether or not a request was waiting on it
    Message(RpcResponse),
    ChallengeReceived(PendingChallenge),
    AuthenticationFailed(String),
}

#[derive(Clone, Default)]
struct Subscribers(Arc<Mutex<Vec<mpsc::UnboundedSender<ClientEvent>>>>);

impl Subscribers {
    fn add(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        rx
    }

    fn publish(&self, event: ClientEvent) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Connect {
        session_key: SessionKey,
        signer: Arc<dyn Signer>,
        reply: Reply<Result<(), RpcError>>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Transmit {
        envelope: Envelope,
        /// Application traffic needs `Connected`; pings only an open socket
        require_auth: bool,
        reply: Reply<Result<(), RpcError>>,
    },
    Approve {
        reply: Reply<Result<(), RpcError>>,
    },
    Reject {
        reply: Reply<Result<(), RpcError>>,
    },
    ResetRejection {
        address: String,
        reply: Reply<bool>,
    },
    PendingChallenge {
        reply: Reply<Option<PendingChallenge>>,
    },
}

/// Reports from tasks the actor spawned.
enum Internal {
    Opened {
        generation: u64,
        result: Result<Transport, RpcError>,
    },
    Link {
        generation: u64,
        event: TransportEvent,
    },
    Signed {
        generation: u64,
        result: Result<String, RpcError>,
    },
}

/// Handle to a connection. Cheap to clone; all clones share one socket.
///
/// # Guarantees
///
/// - A response is only ever delivered to the request with the same id
/// - Every pending request settles: response, timeout, or `ConnectionLost`
/// - At most one authentication attempt runs at a time
///
/// # Non-Guarantees
///
/// - Requests are not replayed after a reconnect
/// - `send` does not wait for any answer
#[derive(Clone)]
pub struct RpcClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    correlator: Correlator,
    sequence: Sequence,
    events: Subscribers,
    request_timeout: Duration,
}

impl RpcClient {
    /// Spawn the connection actor. Nothing connects until [`connect`](Self::connect).
    ///
    /// Fails with `Config` if `config` does not validate. Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self, RpcError> {
        config.validate()?;

        let (commands, command_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::Disconnected);

        let correlator = Correlator::new();
        let sequence = Sequence::new();
        let events = Subscribers::default();
        let request_timeout = config.request_timeout();

        let actor = Actor {
            auth: AuthMachine::new(sequence.clone()),
            config,
            connector,
            store,
            correlator: correlator.clone(),
            sequence: sequence.clone(),
            status: status_tx,
            events: events.clone(),
            internal: internal_tx,
            identity: None,
            link: None,
            generation: 0,
            waiters: Vec::new(),
            approval: None,
            declined: HashSet::new(),
            reconnect_attempt: 0,
            deadlines: Deadlines::default(),
        };
        tokio::spawn(actor.run(command_rx, internal_rx));

        Ok(Self {
            commands,
            status,
            correlator,
            sequence,
            events,
            request_timeout,
        })
    }

    /// Client over WebSocket, persisting credentials under `config.store_dir`.
    pub fn with_defaults(config: ClientConfig) -> Result<Self, RpcError> {
        let store = Arc::new(FileCredentialStore::new(config.store_dir.clone()));
        Self::new(config, Arc::new(WsConnector), store)
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, RpcError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| RpcError::Shutdown)?;
        response.await.map_err(|_| RpcError::Shutdown)
    }

    /// Connect and authenticate as `signer`, with `session_key` signing traffic.
    ///
    /// Resolves once authenticated. Callers arriving while an attempt is in
    /// flight join it. Fails immediately with `UserRejected`, without
    /// touching the network, if this identity declined a challenge.
    ///
    /// A challenge must be approved with [`approve_challenge`](Self::approve_challenge)
    /// from another task while this call waits.
    pub async fn connect(&self, session_key: SessionKey, signer: Arc<dyn Signer>) -> Result<(), RpcError> {
        self.call(|reply| Command::Connect {
            session_key,
            signer,
            reply,
        })
        .await?
    }

    /// Close the socket and fail everything pending. No reconnect follows.
    pub async fn disconnect(&self) -> Result<(), RpcError> {
        self.call(|reply| Command::Disconnect { reply }).await
    }

    /// Fire-and-forget.
    pub async fn send(&self, request: RpcRequest) -> Result<u64, RpcError> {
        let envelope = self.envelope_for(request);
        let id = envelope.id;
        self.call(|reply| Command::Transmit {
            envelope,
            require_auth: true,
            reply,
        })
        .await??;
        Ok(id)
    }

    /// Send and wait for the response with the same id.
    ///
    /// `timeout` defaults to the configured request timeout. A response
    /// with method `error` becomes [`RpcError::Server`].
    pub async fn send_with_response(
        &self,
        request: RpcRequest,
        timeout: Option<Duration>,
    ) -> Result<RpcResponse, RpcError> {
        let envelope = self.envelope_for(request);
        let method = envelope.method.clone();
        // Registered before transmitting so a fast response cannot miss
        let pending = self.correlator.register(envelope.id)?;

        self.call(|reply| Command::Transmit {
            envelope,
            require_auth: true,
            reply,
        })
        .await??;

        debug!(id = pending.id(), method = %method, "Awaiting response");
        pending
            .wait(timeout.unwrap_or(self.request_timeout))
            .await?
            .into_result()
    }

    /// Signed liveness ping. Works whenever a socket is open, authenticated
    /// or not. Returns the round trip time.
    pub async fn ping(&self) -> Result<Duration, RpcError> {
        let envelope = Envelope::new(self.sequence.next(), METHOD_PING, Vec::new());
        let pending = self.correlator.register(envelope.id)?;
        let started = Instant::now();

        self.call(|reply| Command::Transmit {
            envelope,
            require_auth: false,
            reply,
        })
        .await??;

        let response = pending.wait(self.request_timeout).await?.into_result()?;
        if response.method != METHOD_PONG {
            return Err(RpcError::Protocol(format!(
                "Expected {} in answer to ping, got {}",
                METHOD_PONG, response.method
            )));
        }
        Ok(started.elapsed())
    }

    /// Sign the pending challenge with the wallet and finish the handshake.
    ///
    /// Resolves once the node accepted (or rejected) the signature.
    pub async fn approve_challenge(&self) -> Result<(), RpcError> {
        self.call(|reply| Command::Approve { reply }).await?
    }

    /// Decline the pending challenge. The socket closes and this identity
    /// is refused by `connect` until [`reset_rejection`](Self::reset_rejection).
    pub async fn reject_challenge(&self) -> Result<(), RpcError> {
        self.call(|reply| Command::Reject { reply }).await?
    }

    /// Allow a declined identity to connect again. Returns whether it was declined.
    pub async fn reset_rejection(&self, address: &str) -> Result<bool, RpcError> {
        let address = address.to_string();
        self.call(|reply| Command::ResetRejection { address, reply }).await
    }

    pub async fn pending_challenge(&self) -> Result<Option<PendingChallenge>, RpcError> {
        self.call(|reply| Command::PendingChallenge { reply }).await
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Status as a watch channel, for waiting on transitions.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Stream of client events from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.events.add()
    }

    /// Requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    fn envelope_for(&self, request: RpcRequest) -> Envelope {
        let id = match request.id {
            Some(id) => {
                self.sequence.observe(id);
                id
            }
            None => self.sequence.next(),
        };
        Envelope::new(id, request.method, request.params)
    }
}

/// Who the connection authenticates as.
struct Identity {
    session_key: SessionKey,
    signer: Arc<dyn Signer>,
}

impl Identity {
    fn same_as(&self, session_key: &SessionKey, signer: &Arc<dyn Signer>) -> bool {
        self.session_key.address() == session_key.address() && self.signer.address() == signer.address()
    }
}

/// An open socket: the reader feeding the actor and the writer draining
/// the outbound queue.
struct Link {
    outbound: mpsc::Sender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn open(transport: Transport, generation: u64, internal: &mpsc::UnboundedSender<Internal>) -> Self {
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        Self {
            outbound,
            reader: spawn_reader(transport.stream, generation, internal.clone()),
            writer: spawn_writer(transport.sink, queue, generation, internal.clone()),
        }
    }

    /// Queue a frame for the writer. Never waits.
    fn send(&self, text: String) -> Result<(), RpcError> {
        self.outbound.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => {
                RpcError::Transport(format!("{} frames queued, peer is not reading", OUTBOUND_QUEUE))
            }
            TrySendError::Closed(_) => RpcError::Transport("Socket writer stopped".into()),
        })
    }

    /// Stop reading at once; let the writer flush and close, but only for
    /// `CLOSE_GRACE`.
    fn shutdown(self) {
        let Link {
            outbound,
            reader,
            writer,
        } = self;
        reader.abort();
        drop(outbound);

        let abort = writer.abort_handle();
        tokio::spawn(async move {
            if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
                debug!("Socket writer did not close in time, aborting it");
                abort.abort();
            }
        });
    }
}

/// Close a transport nobody is going to use.
fn discard(transport: Transport) {
    let Transport { mut sink, stream } = transport;
    drop(stream);
    tokio::spawn(async move {
        let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
    });
}

/// Every timer the actor runs. Clearing a slot cancels that timer.
#[derive(Debug, Default)]
struct Deadlines {
    reconnect: Option<Instant>,
    auth: Option<Instant>,
    challenge: Option<Instant>,
    heartbeat: Option<Instant>,
    keepalive: Option<Instant>,
}

impl Deadlines {
    fn next(&self) -> Option<Instant> {
        [
            self.reconnect,
            self.auth,
            self.challenge,
            self.heartbeat,
            self.keepalive,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

/// Clear `slot` and return true if it has come due.
fn take_due(slot: &mut Option<Instant>, now: Instant) -> bool {
    if slot.is_some_and(|deadline| deadline <= now) {
        *slot = None;
        true
    } else {
        false
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Actor {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    store: Arc<dyn CredentialStore>,
    correlator: Correlator,
    sequence: Sequence,
    status: watch::Sender<ConnectionStatus>,
    events: Subscribers,
    internal: mpsc::UnboundedSender<Internal>,

    identity: Option<Identity>,
    link: Option<Link>,
    /// Bumped whenever the current link (or attempt to open one) is abandoned
    generation: u64,
    auth: AuthMachine,
    /// `connect` callers waiting for the handshake
    waiters: Vec<Reply<Result<(), RpcError>>>,
    /// `approve_challenge` caller waiting for the verify result
    approval: Option<Reply<Result<(), RpcError>>>,
    /// Identities whose user declined; refused until reset
    declined: HashSet<String>,
    reconnect_attempt: u32,
    deadlines: Deadlines,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            let deadline = self.deadlines.next();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(report) = internal.recv() => self.on_internal(report),
                _ = sleep_until(deadline) => self.on_deadlines(),
            }
        }

        debug!("All client handles dropped, shutting down connection");
        self.identity = None;
        self.teardown("Client shut down");
        self.settle_all(&RpcError::Shutdown);
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            info!(from = %previous, to = %status, "Connection status changed");
            self.events.publish(ClientEvent::StatusChanged(status));
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                session_key,
                signer,
                reply,
            } => self.on_connect(session_key, signer, reply),
            Command::Disconnect { reply } => {
                info!("Disconnecting");
                self.identity = None;
                self.teardown("Disconnected by caller");
                self.settle_all(&RpcError::ConnectionLost("Disconnected by caller".into()));
                self.set_status(ConnectionStatus::Disconnected);
                let _ = reply.send(());
            }
            Command::Transmit {
                envelope,
                require_auth,
                reply,
            } => {
                let status = self.current_status();
                let allowed = if require_auth {
                    status.is_connected()
                } else {
                    self.link.is_some()
                };
                if !allowed {
                    let _ = reply.send(Err(RpcError::NotConnected(status.to_string())));
                    return;
                }
                match self.transmit(&envelope) {
                    Err(e @ RpcError::Transport(_)) => {
                        warn!(error = %e, id = envelope.id, "Failed to queue request");
                        let _ = reply.send(Err(e.duplicate()));
                        self.connection_lost(e);
                    }
                    result => {
                        let _ = reply.send(result);
                    }
                }
            }
            Command::Approve { reply } => self.on_approve(reply),
            Command::Reject { reply } => {
                let result = match self.auth.reject() {
                    Ok(challenge) => {
                        info!(received_at = %challenge.received_at, "Challenge rejected by user");
                        self.decline("Challenge rejected by user");
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::ResetRejection { address, reply } => {
                let was_declined = self.declined.remove(&address);
                if was_declined {
                    info!(address = %address, "Rejection cleared");
                }
                let _ = reply.send(was_declined);
            }
            Command::PendingChallenge { reply } => {
                let _ = reply.send(self.auth.pending_challenge().cloned());
            }
        }
    }

    fn on_connect(
        &mut self,
        session_key: SessionKey,
        signer: Arc<dyn Signer>,
        reply: Reply<Result<(), RpcError>>,
    ) {
        let address = signer.address();
        if self.declined.contains(&address) {
            let _ = reply.send(Err(RpcError::UserRejected(format!(
                "Identity {} declined authentication",
                address
            ))));
            return;
        }

        let same_identity = self
            .identity
            .as_ref()
            .is_some_and(|identity| identity.same_as(&session_key, &signer));

        if !same_identity {
            if self.identity.is_some() || self.link.is_some() {
                info!(address = %address, "Switching identity");
                self.teardown("Identity changed");
                self.settle_all(&RpcError::ConnectionLost("Identity changed".into()));
            }
            self.identity = Some(Identity { session_key, signer });
            self.reconnect_attempt = 0;
            self.waiters.push(reply);
            self.open();
            return;
        }

        match self.current_status() {
            ConnectionStatus::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionStatus::Connecting | ConnectionStatus::PendingAuth | ConnectionStatus::Reconnecting => {
                debug!("Joining in-flight connection attempt");
                self.waiters.push(reply);
            }
            ConnectionStatus::Unauthenticated => {
                self.waiters.push(reply);
                self.set_status(ConnectionStatus::Connecting);
                self.start_auth();
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Failed => {
                self.reconnect_attempt = 0;
                self.waiters.push(reply);
                self.open();
            }
        }
    }

    fn on_approve(&mut self, reply: Reply<Result<(), RpcError>>) {
        let payload = match self.auth.approve() {
            Ok(payload) => payload,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let Some(identity) = self.identity.as_ref() else {
            let _ = reply.send(Err(RpcError::NotConnected(self.current_status().to_string())));
            return;
        };

        let signer = Arc::clone(&identity.signer);
        let generation = self.generation;
        let internal = self.internal.clone();
        self.approval = Some(reply);
        // The wallet may take as long as its user needs
        self.deadlines.challenge = None;

        debug!(wallet = %payload.wallet, "Requesting challenge signature");
        tokio::spawn(async move {
            let result = match payload.signing_bytes() {
                Ok(bytes) => signer.sign(&bytes).await,
                Err(e) => Err(e),
            };
            let _ = internal.send(Internal::Signed { generation, result });
        });
    }

    // =========================================================================
    // Reports from spawned tasks
    // =========================================================================

    fn on_internal(&mut self, report: Internal) {
        match report {
            Internal::Opened { generation, result } => {
                if generation != self.generation || self.link.is_some() {
                    debug!(generation = generation, "Discarding stale connection attempt");
                    if let Ok(transport) = result {
                        discard(transport);
                    }
                    return;
                }
                match result {
                    Ok(transport) => {
                        info!(url = %self.config.url, generation = generation, "Socket open");
                        self.link = Some(Link::open(transport, generation, &self.internal));
                        self.set_status(ConnectionStatus::Connecting);
                        self.start_auth();
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to open socket");
                        self.connection_lost(e);
                    }
                }
            }
            Internal::Link { generation, event } => {
                if generation != self.generation {
                    return;
                }
                match event {
                    TransportEvent::Frame(text) => self.on_frame(text),
                    TransportEvent::Closed(reason) => {
                        let reason = reason.unwrap_or_else(|| "closed by peer".to_string());
                        warn!(reason = %reason, "Socket closed");
                        self.connection_lost(RpcError::ConnectionLost(format!("Socket closed: {}", reason)));
                    }
                    TransportEvent::Error(e) => {
                        warn!(error = %e, "Socket error");
                        self.connection_lost(RpcError::Transport(e));
                    }
                }
            }
            Internal::Signed { generation, result } => {
                if generation != self.generation {
                    debug!("Discarding signature for an abandoned connection");
                    return;
                }
                let actions = self.auth.on_signature(result);
                self.apply(actions);
            }
        }
    }

    fn on_frame(&mut self, text: String) {
        let response = match decode_response(&text) {
            Ok(response) => response,
            Err(e) => {
                match classify(&text).id() {
                    Some(id) => warn!(id = id, error = %e, "Dropping malformed response"),
                    None => warn!(error = %e, "Dropping undecodable frame"),
                }
                return;
            }
        };

        let kind = FrameKind::of(&response);
        if let Some(actions) = self.auth.on_frame(&kind, &response) {
            self.apply(actions);
            return;
        }

        let credential_problem = response
            .error_message()
            .map(RpcError::Server)
            .is_some_and(|e| e.is_credential_problem());

        self.events.publish(ClientEvent::Message(response.clone()));
        self.correlator.resolve(response.id, response);

        if credential_problem && self.auth.is_authenticated() {
            self.reauthenticate();
        }
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    fn start_auth(&mut self) {
        let Some(identity) = self.identity.as_ref() else {
            return;
        };
        let context = AuthContext {
            wallet: identity.signer.address(),
            session_key: identity.session_key.address().to_string(),
            params: self.config.auth.clone(),
        };
        let cached = self.cached_credential(&context);
        let actions = self.auth.start(context, cached);
        self.apply(actions);
    }

    /// The cached token, unless it is missing, about to expire, or was
    /// issued to a different identity.
    fn cached_credential(&self, context: &AuthContext) -> Option<Credential> {
        match self.store.load_token() {
            Ok(Some(credential)) if !credential.belongs_to(&context.wallet, &context.session_key) => {
                info!(
                    owner = ?credential.wallet(),
                    wallet = %context.wallet,
                    "Cached token was issued to another identity, discarding"
                );
                self.discard_token();
                None
            }
            Ok(Some(credential)) if credential.is_expired(self.config.token_expiry_skew()) => {
                debug!(expires_at = ?credential.expires_at(), "Cached token expired, discarding");
                self.discard_token();
                None
            }
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "Failed to read cached token");
                None
            }
        }
    }

    fn discard_token(&self) {
        if let Err(e) = self.store.clear_token() {
            warn!(error = %e, "Failed to clear cached token");
        }
    }

    /// The node rejected our token mid-session: authenticate again on the
    /// same socket.
    fn reauthenticate(&mut self) {
        if self.auth.in_flight() {
            return;
        }
        warn!("Session credential rejected, re-authenticating");
        self.discard_token();
        self.deadlines.heartbeat = None;
        self.set_status(ConnectionStatus::Connecting);
        self.start_auth();
    }

    fn apply(&mut self, actions: Vec<AuthAction>) {
        if actions.is_empty() {
            return;
        }

        for action in actions {
            match action {
                AuthAction::Send(envelope) => {
                    if let Err(e) = self.transmit(&envelope) {
                        warn!(error = %e, method = %envelope.method, "Failed to send handshake frame");
                        self.connection_lost(e);
                        return;
                    }
                }
                AuthAction::SendSigned {
                    envelope,
                    signature,
                } => {
                    self.deadlines.keepalive = None;
                    if let Err(e) = self.send_frame(encode_request(&envelope, &[signature])) {
                        warn!(error = %e, "Failed to send signed challenge");
                        self.connection_lost(e);
                        return;
                    }
                }
                AuthAction::DiscardToken => self.discard_token(),
                AuthAction::SurfaceChallenge(challenge) => {
                    let now = Instant::now();
                    self.deadlines.keepalive = Some(now + self.config.challenge_keepalive());
                    self.deadlines.challenge = self.config.challenge_timeout().map(|t| now + t);
                    self.set_status(ConnectionStatus::PendingAuth);
                    self.events.publish(ClientEvent::ChallengeReceived(challenge));
                }
                AuthAction::Authenticated { token } => self.on_authenticated(token),
                AuthAction::Failed(e) => self.on_auth_failed(e),
                AuthAction::ApprovalFailed(e) => {
                    self.deadlines.challenge =
                        self.config.challenge_timeout().map(|t| Instant::now() + t);
                    if let Some(approval) = self.approval.take() {
                        let _ = approval.send(Err(e));
                    }
                }
                AuthAction::Declined => {
                    self.decline("Signer declined the challenge");
                }
            }
        }

        self.deadlines.auth = self
            .auth
            .awaiting_node()
            .then(|| Instant::now() + self.config.auth_timeout());
    }

    fn on_authenticated(&mut self, token: Option<String>) {
        if let (Some(token), Some(identity)) = (token, self.identity.as_ref()) {
            let credential =
                Credential::new(token).issued_to(identity.signer.address(), identity.session_key.address());
            if let Err(e) = self.store.save_token(&credential) {
                warn!(error = %e, "Failed to cache token");
            }
        }

        self.deadlines.keepalive = None;
        self.deadlines.challenge = None;
        self.deadlines.heartbeat = Some(Instant::now() + self.config.heartbeat_interval());
        if self.reconnect_attempt > 0 {
            info!(attempts = self.reconnect_attempt, "Reconnected");
        }
        self.reconnect_attempt = 0;
        self.set_status(ConnectionStatus::Connected);

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        if let Some(approval) = self.approval.take() {
            let _ = approval.send(Ok(()));
        }
    }

    /// The handshake ended without success; the socket stays open.
    fn on_auth_failed(&mut self, e: RpcError) {
        error!(error = %e, "Authentication failed");
        self.deadlines.keepalive = None;
        self.deadlines.challenge = None;
        self.deadlines.heartbeat = None;
        self.set_status(ConnectionStatus::Unauthenticated);
        self.events.publish(ClientEvent::AuthenticationFailed(e.to_string()));
        self.settle_all(&e);
    }

    /// The user said no. Close, remember, and do not come back.
    fn decline(&mut self, reason: &str) {
        if let Some(identity) = self.identity.take() {
            self.declined.insert(identity.signer.address());
        }
        self.teardown(reason);
        self.settle_all(&RpcError::UserRejected(reason.to_string()));
        self.set_status(ConnectionStatus::Disconnected);
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    fn open(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let internal = self.internal.clone();
        let url = self.config.url.clone();

        if self.reconnect_attempt == 0 {
            self.set_status(ConnectionStatus::Connecting);
        }
        debug!(url = %url, generation = generation, attempt = self.reconnect_attempt, "Opening socket");

        tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = internal.send(Internal::Opened { generation, result });
        });
    }

    /// Drop the current link and everything tied to it.
    fn teardown(&mut self, reason: &str) {
        self.generation += 1;
        if let Some(link) = self.link.take() {
            link.shutdown();
        }
        self.correlator.fail_all(reason);
        self.deadlines = Deadlines::default();
        self.auth.reset();
    }

    /// Unplanned loss of the link: reconnect with backoff, or give up.
    fn connection_lost(&mut self, cause: RpcError) {
        let reason = cause.to_string();
        self.teardown(&reason);

        if self.identity.is_none() {
            self.set_status(ConnectionStatus::Disconnected);
            return;
        }
        if let Some(approval) = self.approval.take() {
            let _ = approval.send(Err(RpcError::ConnectionLost(reason.clone())));
        }

        if !cause.is_retryable() {
            error!(error = %cause, "Connection failed and retrying will not help");
            self.set_status(ConnectionStatus::Failed);
            self.settle_all(&cause);
            return;
        }

        if self.reconnect_attempt >= self.config.max_retries {
            error!(
                attempts = self.reconnect_attempt,
                reason = %reason,
                "Giving up on reconnecting"
            );
            self.set_status(ConnectionStatus::Failed);
            self.settle_all(&RpcError::Transport(format!(
                "Gave up after {} reconnect attempts: {}",
                self.reconnect_attempt, reason
            )));
            return;
        }

        self.reconnect_attempt += 1;
        let delay = self.config.reconnect_delay(self.reconnect_attempt);
        warn!(
            attempt = self.reconnect_attempt,
            max = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Connection lost, scheduling reconnect"
        );
        self.deadlines.reconnect = Some(Instant::now() + delay);
        self.set_status(ConnectionStatus::Reconnecting);
    }

    /// Fail every `connect` and `approve_challenge` caller.
    fn settle_all(&mut self, e: &RpcError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(e.duplicate()));
        }
        if let Some(approval) = self.approval.take() {
            let _ = approval.send(Err(e.duplicate()));
        }
    }

    fn on_deadlines(&mut self) {
        let now = Instant::now();

        if take_due(&mut self.deadlines.reconnect, now) {
            self.open();
        }

        if take_due(&mut self.deadlines.auth, now) {
            warn!(phase = ?self.auth.phase(), "Node stopped answering the handshake");
            self.auth.abort();
            self.connection_lost(RpcError::Timeout("Authentication timed out".into()));
        }

        if take_due(&mut self.deadlines.challenge, now) && self.auth.expire_challenge() {
            warn!("Challenge was not approved in time");
            self.on_auth_failed(RpcError::Authentication("Challenge approval timed out".into()));
        }

        if take_due(&mut self.deadlines.heartbeat, now) && self.current_status().is_connected() {
            self.deadlines.heartbeat = Some(now + self.config.heartbeat_interval());
            self.send_liveness_ping("heartbeat");
        }

        if take_due(&mut self.deadlines.keepalive, now)
            && matches!(self.auth.phase(), AuthPhase::PendingApproval | AuthPhase::Signing)
        {
            self.deadlines.keepalive = Some(now + self.config.challenge_keepalive());
            self.send_liveness_ping("challenge keepalive");
        }
    }

    /// Send a ping whose outcome is only logged.
    fn send_liveness_ping(&mut self, purpose: &'static str) {
        let envelope = Envelope::new(self.sequence.next(), METHOD_PING, Vec::new());
        let pending = match self.correlator.register(envelope.id) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, purpose = purpose, "Failed to register ping");
                return;
            }
        };

        if let Err(e) = self.transmit(&envelope) {
            warn!(error = %e, purpose = purpose, "Failed to send ping");
            drop(pending);
            if matches!(e, RpcError::Transport(_)) {
                self.connection_lost(e);
            }
            return;
        }

        let timeout = self.config.request_timeout();
        tokio::spawn(async move {
            match pending.wait(timeout).await {
                Ok(_) => debug!(purpose = purpose, "Ping answered"),
                Err(e) => warn!(error = %e, purpose = purpose, "Ping failed"),
            }
        });
    }

    /// Sign `envelope` with the session key and queue it.
    fn transmit(&self, envelope: &Envelope) -> Result<(), RpcError> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| RpcError::NotConnected(self.current_status().to_string()))?;
        let signature = identity.session_key.sign_bytes(&envelope.signing_bytes());
        debug!(id = envelope.id, method = %envelope.method, "Sending request");
        self.send_frame(encode_request(envelope, &[signature]))
    }

    fn send_frame(&self, text: String) -> Result<(), RpcError> {
        match self.link.as_ref() {
            Some(link) => link.send(text),
            None => Err(RpcError::NotConnected(self.current_status().to_string())),
        }
    }
}

fn spawn_reader(
    mut stream: Box<dyn FrameStream>,
    generation: u64,
    internal: mpsc::UnboundedSender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = stream.next_event().await;
            let finished = !matches!(event, TransportEvent::Frame(_));
            if internal.send(Internal::Link { generation, event }).is_err() || finished {
                break;
            }
        }
    })
}

/// Drain the outbound queue into the sink. Closes the sink once the queue's
/// sender is dropped; a failed write is reported like a socket error.
fn spawn_writer(
    mut sink: Box<dyn FrameSink>,
    mut queue: mpsc::Receiver<String>,
    generation: u64,
    internal: mpsc::UnboundedSender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = queue.recv().await {
            if let Err(e) = sink.send(text).await {
                let _ = internal.send(Internal::Link {
                    generation,
                    event: TransportEvent::Error(e.to_string()),
                });
                return;
            }
        }
        sink.close().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::PendingAuth.to_string(), "pending_auth");
        assert_eq!(
            RpcError::NotConnected(ConnectionStatus::Reconnecting.to_string()).to_string(),
            "Not connected (status: reconnecting)"
        );
        assert!(ConnectionStatus::Connected.is_connected());
        assert!(!ConnectionStatus::Unauthenticated.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlines_pick_earliest_and_clear() {
        let now = Instant::now();
        let mut deadlines = Deadlines {
            heartbeat: Some(now + Duration::from_secs(30)),
            auth: Some(now + Duration::from_secs(5)),
            ..Default::default()
        };
        assert_eq!(deadlines.next(), Some(now + Duration::from_secs(5)));

        assert!(!take_due(&mut deadlines.auth, now));
        assert!(take_due(&mut deadlines.auth, now + Duration::from_secs(5)));
        assert!(deadlines.auth.is_none());
        assert_eq!(deadlines.next(), Some(now + Duration::from_secs(30)));

        assert!(Deadlines::default().next().is_none());
    }

    #[tokio::test]
    async fn test_new_rejects_config_that_would_spin() {
        use crate::credentials::MemoryCredentialStore;
        use crate::rpc::transport::MemoryConnector;

        let (connector, _accepted) = MemoryConnector::new();
        let config = ClientConfig {
            heartbeat_interval_ms: 0,
            ..ClientConfig::for_url("ws://node.test/ws")
        };
        let result = RpcClient::new(config, Arc::new(connector), Arc::new(MemoryCredentialStore::new()));
        assert!(matches!(result, Err(RpcError::Config(_))));
    }

    #[tokio::test]
    async fn test_link_send_fails_fast_when_queue_is_full() {
        struct StalledSink;

        #[async_trait::async_trait]
        impl FrameSink for StalledSink {
            async fn send(&mut self, _text: String) -> Result<(), RpcError> {
                std::future::pending().await
            }
            async fn close(&mut self) {}
        }

        struct SilentStream;

        #[async_trait::async_trait]
        impl FrameStream for SilentStream {
            async fn next_event(&mut self) -> TransportEvent {
                std::future::pending().await
            }
        }

        let (internal, _reports) = mpsc::unbounded_channel();
        let transport = Transport {
            sink: Box::new(StalledSink),
            stream: Box::new(SilentStream),
        };
        let link = Link::open(transport, 1, &internal);

        // One frame is stuck in the writer, the rest fill the queue
        let mut accepted = 0;
        let error = loop {
            match link.send(format!("frame {}", accepted)) {
                Ok(()) => accepted += 1,
                Err(e) => break e,
            }
            tokio::task::yield_now().await;
            assert!(accepted <= OUTBOUND_QUEUE + 1, "queue never filled up");
        };
        assert!(matches!(error, RpcError::Transport(_)));
        assert!(accepted >= OUTBOUND_QUEUE);

        link.shutdown();
    }

    #[tokio::test]
    async fn test_subscribers_drop_closed_receivers() {
        let subscribers = Subscribers::default();
        let mut kept = subscribers.add();
        drop(subscribers.add());

        subscribers.publish(ClientEvent::StatusChanged(ConnectionStatus::Connecting));
        assert_eq!(subscribers.0.lock().unwrap().len(), 1);
        assert!(matches!(
            kept.recv().await,
            Some(ClientEvent::StatusChanged(ConnectionStatus::Connecting))
        ));
    }
}
