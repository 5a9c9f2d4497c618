//! One link to one peer.
//!
//! A [`Connection`] owns the per-link state the protocol needs:
//!
//! - the status state machine `Offline → Connecting → Online → Closing → Offline`
//! - the outgoing packet sequence and stream id counters
//! - the awaiter table correlating replies to requests by stream id
//! - a bounded outbound queue drained by the transport's writer task
//! - a cap on inbound requests served at once
//!
//! Outgoing requests other than `HANDSHAKE` and `PING` wait until the link
//! is `Online`. The handshake itself is served on the read loop, so no
//! frame that follows it is read before the status has moved on.
//!
//! It never touches bytes. The transport feeds decoded frames into
//! [`Connection::on_frame`] and pulls outbound frames from the receiver
//! returned by [`Connection::new`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use protocol::{Action, Frame, PeerId, ProtocolError, RemoteError, RemoteErrorKind, Result, Status, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::BoxFuture;

/// Default time a request waits for its reply.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(180);

/// Default number of consecutive malformed frames tolerated.
pub const DEFAULT_MAX_MALFORMED_FRAMES: u32 = 3;

/// Default outbound queue depth.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Default number of inbound requests served at once.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 256;

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No transport, or the link has been torn down.
    Offline,
    /// Transport attached, handshake not finished.
    Connecting,
    /// Handshake done; all actions accepted.
    Online,
    /// Close in progress.
    Closing,
}

impl ConnectionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Online,
            3 => ConnectionStatus::Closing,
            _ => ConnectionStatus::Offline,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionStatus::Offline => 0,
            ConnectionStatus::Connecting => 1,
            ConnectionStatus::Online => 2,
            ConnectionStatus::Closing => 3,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Offline => "OFFLINE",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Online => "ONLINE",
            ConnectionStatus::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

/// Which side opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dialed out and sends the handshake.
    Initiator,
    /// Accepted the transport and answers the handshake.
    Acceptor,
}

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long [`Connection::send_request`] waits for a reply.
    pub response_timeout: Duration,
    /// Consecutive malformed frames after which the link is closed.
    pub max_malformed_frames: u32,
    /// Depth of the outbound frame queue.
    pub outbound_queue_capacity: usize,
    /// Inbound requests served at once; more are refused with `Busy`.
    pub max_concurrent_requests: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_malformed_frames: DEFAULT_MAX_MALFORMED_FRAMES,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
        }
    }
}

/// Serves inbound requests.
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the reply payload for one request.
    ///
    /// An error becomes a reply with `ERROR` status carrying
    /// [`ProtocolError::to_remote`].
    fn handle_request<'a>(
        &'a self,
        connection: &'a Arc<Connection>,
        action: Action,
        payload: Value,
    ) -> BoxFuture<'a, Result<Value>>;
}

/// Runs on the read loop when a reply arrives, before the requester wakes.
pub type ReplyHook = Box<dyn FnOnce(&Arc<Connection>, Result<Value>) -> Result<Value> + Send>;

struct Awaiter {
    tx: oneshot::Sender<Result<Value>>,
    on_reply: Option<ReplyHook>,
}

/// One link to one peer.
pub struct Connection {
    role: Role,
    config: ConnectionConfig,
    status: AtomicU8,
    online: watch::Sender<bool>,
    closed: AtomicBool,
    close_reason: OnceLock<String>,
    shutdown: CancellationToken,
    peer_id: OnceLock<PeerId>,
    next_packet_id: AtomicU64,
    next_stream_id: AtomicU32,
    awaiters: Mutex<HashMap<u32, Awaiter>>,
    outbound: mpsc::Sender<Frame>,
    inflight: Arc<Semaphore>,
    malformed_streak: AtomicU32,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("status", &self.status())
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create an `Offline` connection and the receiving end of its
    /// outbound queue.
    pub fn new(role: Role, config: ConnectionConfig) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(config.outbound_queue_capacity.max(1));
        let (online, _) = watch::channel(false);
        let inflight = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        let conn = Arc::new(Self {
            role,
            config,
            status: AtomicU8::new(ConnectionStatus::Offline.as_u8()),
            online,
            closed: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            shutdown: CancellationToken::new(),
            peer_id: OnceLock::new(),
            next_packet_id: AtomicU64::new(1),
            next_stream_id: AtomicU32::new(1),
            awaiters: Mutex::new(HashMap::new()),
            outbound,
            inflight,
            malformed_streak: AtomicU32::new(0),
        });
        (conn, rx)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_online(&self) -> bool {
        self.status() == ConnectionStatus::Online
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reason passed to the first [`Connection::close`] call.
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.get().map(String::as_str)
    }

    /// Remote peer id, known once the handshake completes.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id.get().copied()
    }

    /// Record the remote peer id. It can only be set once.
    pub fn set_peer_id(&self, peer: PeerId) -> Result<()> {
        self.peer_id.set(peer).map_err(|_| {
            ProtocolError::IllegalState(format!(
                "peer id already set to {:?}",
                self.peer_id.get()
            ))
        })
    }

    fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) -> Result<()> {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                ProtocolError::IllegalState(format!(
                    "cannot move from {} to {}, connection is {}",
                    from,
                    to,
                    ConnectionStatus::from_u8(actual)
                ))
            })
    }

    /// `Offline → Connecting`, once a transport is attached.
    pub fn mark_connecting(&self) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.transition(ConnectionStatus::Offline, ConnectionStatus::Connecting)
    }

    /// `Connecting → Online`, once the handshake completes.
    pub fn mark_online(&self) -> Result<()> {
        self.transition(ConnectionStatus::Connecting, ConnectionStatus::Online)?;
        self.online.send_replace(true);
        Ok(())
    }

    /// Resolves once the connection is `Online`.
    ///
    /// Fails with [`ProtocolError::ConnectionClosed`] if it closes first.
    pub async fn ready(&self) -> Result<()> {
        let mut online = self.online.subscribe();
        tokio::select! {
            up = online.wait_for(|up| *up) => up.map(|_| ()).map_err(|_| self.closed_error()),
            _ = self.shutdown.cancelled() => Err(self.closed_error()),
        }
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Token cancelled on close; transport tasks select on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn closed_error(&self) -> ProtocolError {
        ProtocolError::ConnectionClosed(self.close_reason().unwrap_or("closed").to_string())
    }

    fn allocate_stream_id(&self) -> u32 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of requests waiting for a reply.
    pub async fn pending_requests(&self) -> usize {
        self.awaiters.lock().await.len()
    }

    /// Queue one frame for transmission.
    ///
    /// Waits for space when the outbound queue is full.
    pub async fn send(
        &self,
        action: u8,
        status: u8,
        impulse: bool,
        stream_id: u32,
        payload: Value,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::encode(
            id,
            stream_id,
            u32::from(impulse),
            u32::from(action),
            u32::from(status),
            payload,
        );
        self.outbound
            .send(frame)
            .await
            .map_err(|_| self.closed_error())
    }

    /// Send a request with `ONLINE` status and wait for its reply.
    pub async fn send_request(&self, action: Action, payload: Value) -> Result<Value> {
        self.send_request_with_status(action, Status::Online, payload)
            .await
    }

    /// Send a request and wait for its reply.
    ///
    /// A reply with `ERROR` status surfaces as [`ProtocolError::Remote`].
    /// Fails with [`ProtocolError::Timeout`] after the configured response
    /// timeout and with [`ProtocolError::ConnectionClosed`] if the link goes
    /// down first.
    pub async fn send_request_with_status(
        &self,
        action: Action,
        status: Status,
        payload: Value,
    ) -> Result<Value> {
        self.request(action, status, payload, None).await
    }

    /// Send a request whose reply first goes through `on_reply`.
    ///
    /// `on_reply` runs on the read loop before any later frame is handled;
    /// the requester receives whatever it returns. It does not run if the
    /// request times out or the link closes.
    pub async fn send_request_with_hook<F>(
        &self,
        action: Action,
        status: Status,
        payload: Value,
        on_reply: F,
    ) -> Result<Value>
    where
        F: FnOnce(&Arc<Connection>, Result<Value>) -> Result<Value> + Send + 'static,
    {
        self.request(action, status, payload, Some(Box::new(on_reply)))
            .await
    }

    async fn request(
        &self,
        action: Action,
        status: Status,
        payload: Value,
        on_reply: Option<ReplyHook>,
    ) -> Result<Value> {
        if !matches!(action, Action::Handshake | Action::Ping) {
            tokio::time::timeout(self.config.response_timeout, self.ready())
                .await
                .map_err(|_| {
                    ProtocolError::Timeout(format!(
                        "{} waited {:?} for the connection to come online",
                        action, self.config.response_timeout
                    ))
                })??;
        }

        let (tx, rx) = oneshot::channel();
        let stream_id = {
            let mut awaiters = self.awaiters.lock().await;
            if self.is_closed() {
                return Err(self.closed_error());
            }
            let mut awaiter = Some(Awaiter { tx, on_reply });
            loop {
                let candidate = self.allocate_stream_id();
                if let Entry::Vacant(slot) = awaiters.entry(candidate) {
                    if let Some(awaiter) = awaiter.take() {
                        slot.insert(awaiter);
                    }
                    break candidate;
                }
            }
        };

        if let Err(e) = self
            .send(action.code(), status.code(), true, stream_id, payload)
            .await
        {
            self.awaiters.lock().await.remove(&stream_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.awaiters.lock().await.remove(&stream_id);
                Err(ProtocolError::Timeout(format!(
                    "{} on stream {} got no reply within {:?}",
                    action, stream_id, self.config.response_timeout
                )))
            }
        }
    }

    fn accepts(&self, action: Action) -> bool {
        match self.status() {
            ConnectionStatus::Online => action != Action::Handshake,
            ConnectionStatus::Connecting => {
                matches!(action, Action::Handshake | Action::Ping)
            }
            ConnectionStatus::Offline | ConnectionStatus::Closing => false,
        }
    }

    /// Route one decoded inbound frame.
    ///
    /// Requests are served on a separate task so a slow handler never
    /// stalls the read loop; only `HANDSHAKE` is served in place. Replies
    /// resolve their awaiter; a reply nobody waits for is dropped.
    pub async fn on_frame(self: &Arc<Self>, frame: Frame, handler: Arc<dyn RequestHandler>) {
        self.malformed_streak.store(0, Ordering::Relaxed);

        if self.is_closed() {
            debug!(stream_id = frame.stream_id, "dropping frame on closed connection");
            return;
        }

        if frame.impulse() {
            self.on_request(frame, handler).await;
        } else {
            self.on_reply(frame).await;
        }
    }

    async fn reply(&self, action: u8, stream_id: u32, result: Result<Value>) {
        let (status, payload) = match result {
            Ok(value) => (Status::Online, value),
            Err(e) => {
                debug!(action, stream_id, error = %e, "request failed");
                (Status::Error, Value::Error(e.to_remote()))
            }
        };
        if let Err(e) = self
            .send(action, status.code(), false, stream_id, payload)
            .await
        {
            debug!(action, stream_id, error = %e, "could not send reply");
        }
    }

    async fn on_request(self: &Arc<Self>, frame: Frame, handler: Arc<dyn RequestHandler>) {
        let stream_id = frame.stream_id;
        let action = match Action::try_from(frame.action()) {
            Ok(action) => action,
            Err(code) => {
                warn!(code, stream_id, "request with unknown action");
                let err = ProtocolError::NotImplemented(format!("unknown action {}", code));
                self.reply(code, stream_id, Err(err)).await;
                return;
            }
        };

        if !self.accepts(action) {
            warn!(
                %action,
                stream_id,
                status = %self.status(),
                peer = ?self.peer_id(),
                "protocol violation, discarding request"
            );
            return;
        }

        if action == Action::Handshake {
            let result = handler.handle_request(self, action, frame.payload).await;
            let accepted = result.is_ok();
            self.reply(action.code(), stream_id, result).await;
            // Online only once the reply is queued ahead of anything else.
            if accepted && self.role == Role::Acceptor {
                if let Err(e) = self.mark_online() {
                    debug!(error = %e, "handshake answered on a closing connection");
                }
            }
            return;
        }

        let permit = match Arc::clone(&self.inflight).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    %action,
                    stream_id,
                    limit = self.config.max_concurrent_requests,
                    peer = ?self.peer_id(),
                    "request limit reached, refusing"
                );
                let err = ProtocolError::Busy(format!(
                    "{} requests already in flight",
                    self.config.max_concurrent_requests
                ));
                self.reply(action.code(), stream_id, Err(err)).await;
                return;
            }
        };

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            let shutdown = conn.shutdown_token();
            let result = tokio::select! {
                result = handler.handle_request(&conn, action, frame.payload) => result,
                _ = shutdown.cancelled() => return,
            };
            conn.reply(action.code(), stream_id, result).await;
        });
    }

    async fn on_reply(self: &Arc<Self>, frame: Frame) {
        let awaiter = self.awaiters.lock().await.remove(&frame.stream_id);
        let Some(Awaiter { tx, on_reply }) = awaiter else {
            debug!(
                stream_id = frame.stream_id,
                action = frame.action(),
                "no awaiter for reply, dropping"
            );
            return;
        };

        let result = if frame.status() == Status::Error.code() {
            Err(match frame.payload {
                Value::Error(err) => ProtocolError::Remote(err),
                other => ProtocolError::Remote(RemoteError::new(
                    RemoteErrorKind::Internal,
                    format!("error reply without descriptor: {}", other.kind()),
                )),
            })
        } else {
            Ok(frame.payload)
        };
        let result = match on_reply {
            Some(hook) => hook(self, result),
            None => result,
        };

        // The requester may have given up already.
        let _ = tx.send(result);
    }

    /// Account for an inbound frame that could not be decoded.
    ///
    /// The frame is dropped. After `max_malformed_frames` in a row the
    /// connection is closed.
    pub async fn on_malformed(&self, error: ProtocolError) {
        let streak = self.malformed_streak.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            error = %error,
            streak,
            peer = ?self.peer_id(),
            "dropping malformed frame"
        );
        if streak >= self.config.max_malformed_frames {
            self.close("too many malformed frames").await;
        }
    }

    /// Close the link and reject every pending request.
    ///
    /// Only the first call has an effect; it returns `true`.
    pub async fn close(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.close_reason.set(reason.to_string());
        self.status
            .store(ConnectionStatus::Closing.as_u8(), Ordering::Release);
        debug!(peer = ?self.peer_id(), reason, "closing connection");

        let drained: Vec<oneshot::Sender<Result<Value>>> = {
            let mut awaiters = self.awaiters.lock().await;
            awaiters.drain().map(|(_, awaiter)| awaiter.tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(ProtocolError::ConnectionClosed(reason.to_string())));
        }

        self.shutdown.cancel();
        self.status
            .store(ConnectionStatus::Offline.as_u8(), Ordering::Release);
        true
    }
}
