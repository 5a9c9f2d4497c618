//! Protocol router.
//!
//! The [`Router`] is the top-level object of a node. It owns every
//! connection and every locally exposed context, and it serves the requests
//! peers send:
//!
//! | Action           | Payload                       | Reply                    |
//! |------------------|-------------------------------|--------------------------|
//! | `HANDSHAKE`      | `{uid, contexts}`             | `{uid, contexts}`        |
//! | `PING`           | null                          | null                     |
//! | `CONTEXT_ATTACH` | definition                    | adopted definition       |
//! | `CONTEXT_DETACH` | context name                  | null                     |
//! | `GET`            | `[def_id, member, args]`      | result                   |
//! | `SET`            | `[def_id, member, value]`     | null                     |
//! | `EVENT_ON`       | event name                    | null                     |
//! | `EVENT_OFF`      | event name                    | null                     |
//! | `EVENT_EMIT`     | `[name, args...]`             | null                     |
//!
//! Failures are answered with `ERROR` status and a [`RemoteError`].
//!
//! A definition is only served to peers that can see it: top-level
//! contexts to everyone, per-peer exposures and child definitions to the
//! peer they were issued to.
//!
//! [`RemoteError`]: protocol::RemoteError

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use protocol::{
    Action, DefId, Definition, DefinitionRegistry, MsgPackSerializer, PacketCodec, PeerId,
    ProtocolError, Reference, Result, Serializer, Status, Value, NO_PARENT,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::connection::{
    Connection, ConnectionConfig, RequestHandler, Role, DEFAULT_MAX_CONCURRENT_REQUESTS,
    DEFAULT_MAX_MALFORMED_FRAMES, DEFAULT_OUTBOUND_QUEUE_CAPACITY, DEFAULT_RESPONSE_TIMEOUT,
};
use crate::context::{same_object, BoxFuture, Context, Output};
use crate::dispatcher::Dispatcher;
use crate::interface::RemoteContext;
use crate::transport::{self, TransportHandle, TransportOptions};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default time a handshake may take.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Published to subscribed peers when a handshake completes; args `[uid]`.
pub const EVENT_PEER_ONLINE: &str = "peer online";
/// Published when a connection closes; args `[uid, reason]`.
pub const EVENT_PEER_OFFLINE: &str = "peer offline";
/// Published when a top-level context is attached; args `[definition]`.
pub const EVENT_CONTEXT_ATTACH: &str = "context attach";
/// Published when a top-level context is detached; args `[name, def_id]`.
pub const EVENT_CONTEXT_DETACH: &str = "context detach";

const HANDSHAKE_UID: &str = "uid";
const HANDSHAKE_CONTEXTS: &str = "contexts";

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long a request waits for its reply.
    pub response_timeout: Duration,
    /// Consecutive malformed frames after which a connection is closed.
    pub max_malformed_frames: u32,
    /// Outbound queue depth per connection.
    pub outbound_queue_capacity: usize,
    /// Inbound requests served at once per connection.
    pub max_concurrent_requests: usize,
    /// How long a handshake may take, on either side.
    pub handshake_timeout: Duration,
    /// LZ4-compress large packets.
    pub compression: bool,
    /// Accept `CONTEXT_ATTACH` from peers.
    pub accept_remote_contexts: bool,
    /// Payload serializer; both peers must agree.
    pub serializer: Arc<dyn Serializer>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_malformed_frames: DEFAULT_MAX_MALFORMED_FRAMES,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            compression: true,
            accept_remote_contexts: true,
            serializer: Arc::new(MsgPackSerializer),
        }
    }
}

impl RouterConfig {
    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            response_timeout: self.response_timeout,
            max_malformed_frames: self.max_malformed_frames,
            outbound_queue_capacity: self.outbound_queue_capacity,
            max_concurrent_requests: self.max_concurrent_requests,
        }
    }

    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            serializer: Arc::clone(&self.serializer),
            codec: if self.compression {
                PacketCodec::new()
            } else {
                PacketCodec::without_compression()
            },
        }
    }
}

/// Something that happened on a router.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    /// Handshake with a peer completed.
    PeerOnline { peer: PeerId },
    /// A peer's connection closed.
    PeerOffline { peer: PeerId, reason: String },
    /// A local context was attached.
    ContextAttached { name: String, definition: Definition },
    /// A local context was detached.
    ContextDetached { name: String, def_id: DefId },
    /// A peer announced one of its contexts.
    RemoteContextAttached { peer: PeerId, definition: Definition },
    /// A peer withdrew one of its contexts.
    RemoteContextDetached { peer: PeerId, name: String },
    /// A peer published an event we subscribed to.
    RemoteEvent {
        peer: PeerId,
        name: String,
        args: Vec<Value>,
    },
}

impl RouterEvent {
    /// Name and arguments this event is published under to peers.
    fn published(&self) -> Option<(&'static str, Vec<Value>)> {
        match self {
            RouterEvent::PeerOnline { peer } => {
                Some((EVENT_PEER_ONLINE, vec![Value::from(peer.to_string())]))
            }
            RouterEvent::PeerOffline { peer, reason } => Some((
                EVENT_PEER_OFFLINE,
                vec![Value::from(peer.to_string()), Value::from(reason.as_str())],
            )),
            RouterEvent::ContextAttached { definition, .. } => {
                Some((EVENT_CONTEXT_ATTACH, vec![Value::Definition(definition.clone())]))
            }
            RouterEvent::ContextDetached { name, def_id } => Some((
                EVENT_CONTEXT_DETACH,
                vec![Value::from(name.as_str()), Value::UInt(*def_id)],
            )),
            _ => None,
        }
    }
}

/// State kept per connected peer.
struct Peer {
    connection: Arc<Connection>,
    /// Contexts the peer exposes to us, by name.
    contexts: DashMap<String, Definition>,
    /// Our contexts exposed to this peer only, by name.
    exposed: DashMap<String, DefId>,
    /// Events of this peer we subscribed to, with local subscription counts.
    subscriptions: DashMap<String, usize>,
    /// Our events this peer subscribed to.
    listeners: DashSet<String>,
}

impl Peer {
    fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            contexts: DashMap::new(),
            exposed: DashMap::new(),
            subscriptions: DashMap::new(),
            listeners: DashSet::new(),
        }
    }

    /// Drop one local subscription to `name`. `Some(true)` when it was the
    /// last one, `None` when there was none.
    fn unsubscribe(&self, name: &str) -> Option<bool> {
        let last = {
            let mut count = self.subscriptions.get_mut(name)?;
            *count = count.saturating_sub(1);
            *count == 0
        };
        if last {
            self.subscriptions.remove_if(name, |_, count| *count == 0);
        }
        Some(last)
    }
}

struct RouterInner {
    uid: PeerId,
    config: RouterConfig,
    registry: DefinitionRegistry,
    /// Top-level contexts exposed to every peer.
    contexts: DashMap<String, Arc<Dispatcher>>,
    /// Every local definition, including children and per-peer exposures.
    stubs: DashMap<DefId, Arc<Dispatcher>>,
    /// Child definitions issued to each peer.
    peer_stubs: DashMap<PeerId, Vec<DefId>>,
    peers: DashMap<PeerId, Arc<Peer>>,
    /// Every transport started, handshaken or not.
    transports: DashMap<u64, (Arc<Connection>, TransportHandle)>,
    next_transport: AtomicU64,
    events: broadcast::Sender<RouterEvent>,
}

/// Owns connections and local exposures. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("uid", &self.inner.uid)
            .field("contexts", &self.inner.contexts.len())
            .field("peers", &self.inner.peers.len())
            .finish()
    }
}

impl Router {
    /// Router with a random peer id.
    pub fn new(config: RouterConfig) -> Self {
        Self::with_peer_id(PeerId::new(), config)
    }

    pub fn with_peer_id(uid: PeerId, config: RouterConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RouterInner {
                uid,
                config,
                registry: DefinitionRegistry::new(),
                contexts: DashMap::new(),
                stubs: DashMap::new(),
                peer_stubs: DashMap::new(),
                peers: DashMap::new(),
                transports: DashMap::new(),
                next_transport: AtomicU64::new(1),
                events,
            }),
        }
    }

    pub fn uid(&self) -> PeerId {
        self.inner.uid
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Subscribe to router events.
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: RouterEvent) {
        if let Some((name, args)) = event.published() {
            if self.inner.peers.iter().any(|p| p.listeners.contains(name)) {
                let router = self.clone();
                tokio::spawn(async move {
                    router.publish(name, args).await;
                });
            }
        }
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn handler(&self) -> Arc<dyn RequestHandler> {
        Arc::new(self.clone())
    }

    // ========================================================================
    // Local exposure
    // ========================================================================

    fn bind(&self, parent_id: DefId, name: &str, owner: PeerId, ctx: Arc<dyn Context>) -> Arc<Dispatcher> {
        let mut def = self.inner.registry.create_child(
            parent_id,
            name,
            ctx.description(),
            &ctx.capabilities(),
        );
        def.peer_id = Some(owner);
        let dispatcher = Arc::new(Dispatcher::new(def, ctx));
        self.inner
            .stubs
            .insert(dispatcher.definition().id, Arc::clone(&dispatcher));
        dispatcher
    }

    /// Expose `ctx` under `name` to every peer, current and future.
    pub async fn attach_context(&self, name: impl Into<String>, ctx: Arc<dyn Context>) -> Result<Definition> {
        let name = name.into();
        let def = match self.inner.contexts.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(ProtocolError::Exists(format!("context '{}'", name)));
            }
            Entry::Vacant(slot) => {
                let dispatcher = self.bind(NO_PARENT, &name, self.uid(), ctx);
                let def = dispatcher.definition().clone();
                slot.insert(dispatcher);
                def
            }
        };

        info!(context = %name, def_id = def.id, "context attached");
        self.emit(RouterEvent::ContextAttached {
            name: name.clone(),
            definition: def.clone(),
        });
        self.broadcast(Action::ContextAttach, Value::Definition(def.clone()))
            .await;
        Ok(def)
    }

    /// Withdraw a context attached with [`Router::attach_context`].
    ///
    /// Child definitions issued from it are released too.
    pub async fn detach_context(&self, name: &str) -> Result<()> {
        let (_, dispatcher) = self
            .inner
            .contexts
            .remove(name)
            .ok_or_else(|| ProtocolError::NotExists(format!("context '{}'", name)))?;
        let def_id = dispatcher.definition().id;
        let released = self.release_definition(def_id);

        info!(context = %name, def_id, released, "context detached");
        self.emit(RouterEvent::ContextDetached {
            name: name.to_string(),
            def_id,
        });
        self.broadcast(Action::ContextDetach, Value::from(name)).await;
        Ok(())
    }

    /// Expose `ctx` under `name` to one peer only.
    ///
    /// Resolves once the peer has accepted the definition. A refusal rolls
    /// the local exposure back.
    pub async fn attach_context_remote(
        &self,
        peer: PeerId,
        name: impl Into<String>,
        ctx: Arc<dyn Context>,
    ) -> Result<Definition> {
        let name = name.into();
        let entry = self.peer(peer)?;
        let def = match entry.exposed.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(ProtocolError::Exists(format!(
                    "context '{}' already exposed to {}",
                    name, peer
                )));
            }
            Entry::Vacant(slot) => {
                let dispatcher = self.bind(NO_PARENT, &name, self.uid(), ctx);
                slot.insert(dispatcher.definition().id);
                dispatcher.definition().clone()
            }
        };

        match entry
            .connection
            .send_request(Action::ContextAttach, Value::Definition(def.clone()))
            .await
        {
            Ok(_) => {
                info!(context = %name, %peer, def_id = def.id, "context attached to peer");
                Ok(def)
            }
            Err(e) => {
                entry.exposed.remove(&name);
                self.release_definition(def.id);
                Err(e)
            }
        }
    }

    /// Withdraw a context attached with [`Router::attach_context_remote`].
    pub async fn detach_context_remote(&self, peer: PeerId, name: &str) -> Result<()> {
        let entry = self.peer(peer)?;
        let (_, def_id) = entry.exposed.remove(name).ok_or_else(|| {
            ProtocolError::NotExists(format!("context '{}' is not exposed to {}", name, peer))
        })?;
        self.release_definition(def_id);
        entry
            .connection
            .send_request(Action::ContextDetach, Value::from(name))
            .await
            .map(|_| ())
    }

    /// Drop every exposure of `ctx`: top-level, per-peer and child
    /// definitions. Returns how many definitions were released.
    pub async fn release_context(&self, ctx: &Arc<dyn Context>) -> usize {
        let mut released = 0;

        let names: Vec<String> = self
            .inner
            .contexts
            .iter()
            .filter(|e| same_object(e.value().context(), ctx))
            .map(|e| e.key().clone())
            .collect();
        for name in names {
            if self.detach_context(&name).await.is_ok() {
                released += 1;
            }
        }

        let per_peer: Vec<(PeerId, String)> = self
            .inner
            .peers
            .iter()
            .flat_map(|p| {
                let peer = *p.key();
                p.value()
                    .exposed
                    .iter()
                    .filter(|e| {
                        self.inner
                            .stubs
                            .get(e.value())
                            .map(|d| same_object(d.context(), ctx))
                            .unwrap_or(false)
                    })
                    .map(|e| (peer, e.key().clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (peer, name) in per_peer {
            match self.detach_context_remote(peer, &name).await {
                Ok(()) => released += 1,
                Err(e) => debug!(%peer, context = %name, error = %e, "remote detach failed"),
            }
        }

        let bound: Vec<DefId> = self
            .inner
            .stubs
            .iter()
            .filter(|e| same_object(e.value().context(), ctx))
            .map(|e| *e.key())
            .collect();
        for id in bound {
            released += self.release_definition(id);
        }
        released
    }

    /// Remove a definition and every definition descending from it.
    fn release_definition(&self, root: DefId) -> usize {
        let mut released = 0;
        let mut pending = vec![root];
        while let Some(id) = pending.pop() {
            if self.inner.stubs.remove(&id).is_some() {
                released += 1;
            }
            pending.extend(
                self.inner
                    .stubs
                    .iter()
                    .filter(|e| e.value().definition().parent_id == id)
                    .map(|e| *e.key()),
            );
        }
        for mut ids in self.inner.peer_stubs.iter_mut() {
            ids.value_mut()
                .retain(|id| self.inner.stubs.contains_key(id));
        }
        released
    }

    /// Definition for an object returned to `peer` from `parent`.
    ///
    /// The same object handed to the same peer twice yields the same
    /// definition. Objects already exposed at top level keep their
    /// definition.
    fn ref_context(&self, parent: DefId, ctx: Arc<dyn Context>, peer: PeerId) -> Definition {
        if let Some(top) = self
            .inner
            .contexts
            .iter()
            .find(|e| same_object(e.value().context(), &ctx))
        {
            return top.value().definition().clone();
        }

        let mut issued = self.inner.peer_stubs.entry(peer).or_default();
        for id in issued.iter() {
            if let Some(existing) = self.inner.stubs.get(id) {
                if same_object(existing.context(), &ctx) {
                    return existing.definition().clone();
                }
            }
        }

        let name = ctx.name();
        let dispatcher = self.bind(parent, &name, peer, ctx);
        let def = dispatcher.definition().clone();
        issued.push(def.id);
        debug!(def_id = def.id, parent, %peer, "issued child definition");
        def
    }

    /// Look up the local object behind a reference a peer sent back.
    pub fn resolve_reference(&self, reference: &Reference) -> Result<Arc<dyn Context>> {
        if reference.peer_id != self.uid() {
            return Err(ProtocolError::NotExists(format!(
                "definition {} belongs to {}",
                reference.def_id, reference.peer_id
            )));
        }
        self.inner
            .stubs
            .get(&reference.def_id)
            .map(|d| Arc::clone(d.context()))
            .ok_or_else(|| ProtocolError::NotExists(format!("definition {}", reference.def_id)))
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn has_context(&self, name: &str) -> bool {
        self.inner.contexts.contains_key(name)
    }

    /// Names of top-level contexts, sorted.
    pub fn context_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.contexts.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn definition_by_name(&self, name: &str) -> Option<Definition> {
        self.inner
            .contexts
            .get(name)
            .map(|d| d.definition().clone())
    }

    /// Any local definition by id, including children.
    pub fn definition(&self, def_id: DefId) -> Option<Definition> {
        self.inner
            .stubs
            .get(&def_id)
            .map(|d| d.definition().clone())
    }

    /// Number of live local definitions.
    pub fn definition_count(&self) -> usize {
        self.inner.stubs.len()
    }

    /// Contexts a peer exposes to us, sorted by name.
    pub fn remote_definitions(&self, peer: PeerId) -> Result<Vec<Definition>> {
        let entry = self.peer(peer)?;
        let sorted: BTreeMap<String, Definition> = entry
            .contexts
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        Ok(sorted.into_values().collect())
    }

    pub fn remote_definition(&self, peer: PeerId, name: &str) -> Result<Definition> {
        self.peer(peer)?
            .contexts
            .get(name)
            .map(|d| d.value().clone())
            .ok_or_else(|| ProtocolError::NotExists(format!("context '{}' on {}", name, peer)))
    }

    /// Connected peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.iter().map(|e| *e.key()).collect()
    }

    pub fn connection(&self, peer: PeerId) -> Option<Arc<Connection>> {
        self.inner
            .peers
            .get(&peer)
            .map(|p| Arc::clone(&p.connection))
    }

    fn peer(&self, peer: PeerId) -> Result<Arc<Peer>> {
        self.inner
            .peers
            .get(&peer)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| ProtocolError::UnknownPeer(peer.to_string()))
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Drive an outgoing transport and complete the handshake.
    ///
    /// The peer is registered and the link online before any frame that
    /// follows the handshake reply is read.
    pub async fn connect_stream<S>(&self, stream: S) -> Result<PeerId>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = &self.inner.config;
        let (conn, outbound) = Connection::new(Role::Initiator, config.connection_config());
        conn.mark_connecting()?;
        let handle = transport::spawn(
            Arc::clone(&conn),
            outbound,
            stream,
            self.handler(),
            config.transport_options(),
        );
        self.track(Arc::clone(&conn), handle);

        let offered = self.exposed_contexts();
        let router = self.clone();
        let handshake = conn.send_request_with_hook(
            Action::Handshake,
            Status::Handshaking,
            self.handshake_payload(&offered),
            move |conn, reply| {
                let (peer, contexts) = parse_handshake(reply?)?;
                router.register_peer(conn, peer, contexts)?;
                conn.mark_online()?;
                Ok(Value::Null)
            },
        );

        let result = match tokio::time::timeout(config.handshake_timeout, handshake).await {
            Ok(Ok(_)) => conn.peer_id().ok_or_else(|| {
                ProtocolError::IllegalState("handshake completed without a peer id".to_string())
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProtocolError::Timeout(format!(
                "handshake took longer than {:?}",
                config.handshake_timeout
            ))),
        };

        match result {
            Ok(peer) => {
                self.announce_missed(&conn, &offered).await;
                Ok(peer)
            }
            Err(e) => {
                warn!(error = %e, "handshake failed");
                conn.close(&format!("handshake failed: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Drive an incoming transport; the peer's handshake completes it.
    ///
    /// The transport is closed if no handshake completes within
    /// [`RouterConfig::handshake_timeout`].
    pub fn accept_stream<S>(&self, stream: S) -> Result<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = &self.inner.config;
        let (conn, outbound) = Connection::new(Role::Acceptor, config.connection_config());
        conn.mark_connecting()?;
        let handle = transport::spawn(
            Arc::clone(&conn),
            outbound,
            stream,
            self.handler(),
            config.transport_options(),
        );
        self.track(Arc::clone(&conn), handle);

        let deadline = config.handshake_timeout;
        let pending = Arc::clone(&conn);
        tokio::spawn(async move {
            if tokio::time::timeout(deadline, pending.ready()).await.is_err() {
                warn!(timeout = ?deadline, "no handshake on accepted transport");
                pending.close("handshake timed out").await;
            }
        });
        Ok(conn)
    }

    fn track(&self, conn: Arc<Connection>, handle: TransportHandle) {
        self.inner
            .transports
            .retain(|_, (_, handle)| !handle.is_finished());
        let key = self.inner.next_transport.fetch_add(1, Ordering::Relaxed);
        self.inner.transports.insert(key, (conn, handle));
    }

    /// Top-level context definitions, by id.
    fn exposed_contexts(&self) -> Vec<Definition> {
        let mut contexts: Vec<Definition> = self
            .inner
            .contexts
            .iter()
            .map(|e| e.value().definition().clone())
            .collect();
        contexts.sort_by_key(|d| d.id);
        contexts
    }

    fn handshake_payload(&self, contexts: &[Definition]) -> Value {
        let mut map = BTreeMap::new();
        map.insert(HANDSHAKE_UID.to_string(), Value::from(self.uid().to_string()));
        map.insert(HANDSHAKE_CONTEXTS.to_string(), Value::Definitions(contexts.to_vec()));
        Value::Map(map)
    }

    /// Announce contexts attached or detached between the handshake
    /// snapshot and the peer becoming visible to broadcasts.
    async fn announce_missed(&self, conn: &Connection, offered: &[Definition]) {
        let current = self.exposed_contexts();
        let mut missed = Vec::new();
        for def in current.iter().filter(|d| !offered.iter().any(|o| o.id == d.id)) {
            missed.push((Action::ContextAttach, Value::Definition(def.clone())));
        }
        for def in offered.iter().filter(|o| !current.iter().any(|d| d.id == o.id)) {
            missed.push((Action::ContextDetach, Value::from(def.name.as_str())));
        }
        for (action, payload) in missed {
            if let Err(e) = conn.send_request(action, payload).await {
                debug!(%action, error = %e, "catch-up announcement failed");
            }
        }
    }

    /// Record a handshaken peer. The caller moves the link online.
    fn register_peer(&self, conn: &Arc<Connection>, peer: PeerId, contexts: Vec<Definition>) -> Result<()> {
        if peer == self.uid() {
            return Err(ProtocolError::Exists(format!("peer id {} is our own", peer)));
        }

        let entry = Arc::new(Peer::new(Arc::clone(conn)));
        let adopted: Vec<Definition> = contexts
            .iter()
            .map(|def| self.inner.registry.adopt_remote(def, peer))
            .collect();
        for def in &adopted {
            entry.contexts.insert(def.name.clone(), def.clone());
        }

        match self.inner.peers.entry(peer) {
            Entry::Occupied(_) => {
                return Err(ProtocolError::Exists(format!("peer {} already connected", peer)));
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }

        if let Err(e) = conn.set_peer_id(peer) {
            self.inner
                .peers
                .remove_if(&peer, |_, p| Arc::ptr_eq(&p.connection, conn));
            return Err(e);
        }

        self.watch(Arc::clone(conn), peer);
        info!(%peer, role = ?conn.role(), contexts = adopted.len(), "peer online");
        self.emit(RouterEvent::PeerOnline { peer });
        for definition in adopted {
            self.emit(RouterEvent::RemoteContextAttached { peer, definition });
        }
        Ok(())
    }

    fn watch(&self, conn: Arc<Connection>, peer: PeerId) {
        let router = self.clone();
        tokio::spawn(async move {
            conn.closed().await;
            router.on_peer_closed(peer, &conn);
        });
    }

    fn on_peer_closed(&self, peer: PeerId, conn: &Arc<Connection>) {
        let Some((_, entry)) = self
            .inner
            .peers
            .remove_if(&peer, |_, p| Arc::ptr_eq(&p.connection, conn))
        else {
            return;
        };

        let mut released = 0;
        if let Some((_, ids)) = self.inner.peer_stubs.remove(&peer) {
            for id in ids {
                released += self.release_definition(id);
            }
        }
        let exposed: Vec<DefId> = entry.exposed.iter().map(|e| *e.value()).collect();
        for id in exposed {
            released += self.release_definition(id);
        }

        let reason = conn.close_reason().unwrap_or("closed").to_string();
        info!(%peer, %reason, released, "peer offline");
        self.emit(RouterEvent::PeerOffline { peer, reason });
    }

    /// Close the connection to `peer`.
    pub async fn disconnect(&self, peer: PeerId) -> Result<()> {
        let entry = self.peer(peer)?;
        entry.connection.close("disconnected locally").await;
        Ok(())
    }

    /// Close every connection, handshaken or not, and wait for their
    /// transports to stop.
    pub async fn shutdown(&self) {
        let keys: Vec<u64> = self.inner.transports.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, (conn, handle))) = self.inner.transports.remove(&key) {
                conn.close("router shutting down").await;
                handle.join().await;
            }
        }
    }

    async fn broadcast(&self, action: Action, payload: Value) {
        let mut requests = JoinSet::new();
        for peer in self.inner.peers.iter() {
            let conn = Arc::clone(&peer.connection);
            let peer = *peer.key();
            let payload = payload.clone();
            requests.spawn(async move { (peer, conn.send_request(action, payload).await) });
        }
        while let Some(joined) = requests.join_next().await {
            if let Ok((peer, Err(e))) = joined {
                warn!(%peer, %action, error = %e, "peer did not accept announcement");
            }
        }
    }

    // ========================================================================
    // Remote calls
    // ========================================================================

    /// Invoke a method or read a property on a peer's definition.
    pub async fn get(&self, peer: PeerId, def_id: DefId, member: &str, args: Vec<Value>) -> Result<Value> {
        let conn = Arc::clone(&self.peer(peer)?.connection);
        let payload = Value::Array(vec![Value::UInt(def_id), Value::from(member), Value::Array(args)]);
        let mut reply = conn.send_request(Action::Get, payload).await?;
        self.adopt_reply(&mut reply, peer);
        Ok(reply)
    }

    /// Write a property, or invoke a method discarding its result.
    pub async fn set(&self, peer: PeerId, def_id: DefId, member: &str, value: Value) -> Result<()> {
        let conn = Arc::clone(&self.peer(peer)?.connection);
        let payload = Value::Array(vec![Value::UInt(def_id), Value::from(member), value]);
        conn.send_request(Action::Set, payload).await.map(|_| ())
    }

    /// Invoke `method` on the peer's context called `context`.
    pub async fn call(&self, peer: PeerId, context: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        let def = self.remote_definition(peer, context)?;
        self.get(peer, def.id, method, args).await
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self, peer: PeerId) -> Result<Duration> {
        let conn = Arc::clone(&self.peer(peer)?.connection);
        let started = Instant::now();
        conn.send_request(Action::Ping, Value::Null).await?;
        Ok(started.elapsed())
    }

    /// Receive `name` events from `peer` as [`RouterEvent::RemoteEvent`].
    ///
    /// Only the first local subscription to a name reaches the peer.
    pub async fn subscribe_remote(&self, peer: PeerId, name: &str) -> Result<()> {
        let entry = self.peer(peer)?;
        let first = {
            let mut count = entry.subscriptions.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if !first {
            return Ok(());
        }

        if let Err(e) = entry
            .connection
            .send_request(Action::EventOn, Value::from(name))
            .await
        {
            entry.unsubscribe(name);
            return Err(e);
        }
        debug!(%peer, event = name, "subscribed to remote event");
        Ok(())
    }

    /// Undo one [`Router::subscribe_remote`]. The peer is told once the
    /// last local subscription to `name` is gone.
    pub async fn unsubscribe_remote(&self, peer: PeerId, name: &str) -> Result<()> {
        let entry = self.peer(peer)?;
        match entry.unsubscribe(name) {
            None => Err(ProtocolError::NotExists(format!(
                "no subscription to '{}' on {}",
                name, peer
            ))),
            Some(false) => Ok(()),
            Some(true) => entry
                .connection
                .send_request(Action::EventOff, Value::from(name))
                .await
                .map(|_| ()),
        }
    }

    /// Deliver a named event to every peer subscribed to it.
    ///
    /// Returns how many peers acknowledged it.
    pub async fn publish(&self, name: &str, args: Vec<Value>) -> usize {
        let mut items = Vec::with_capacity(args.len() + 1);
        items.push(Value::from(name));
        items.extend(args);
        let payload = Value::Array(items);

        let mut deliveries = JoinSet::new();
        for peer in self.inner.peers.iter().filter(|p| p.listeners.contains(name)) {
            let conn = Arc::clone(&peer.connection);
            let peer = *peer.key();
            let payload = payload.clone();
            deliveries.spawn(async move { (peer, conn.send_request(Action::EventEmit, payload).await) });
        }

        let mut delivered = 0;
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(_))) => delivered += 1,
                Ok((peer, Err(e))) => debug!(%peer, event = name, error = %e, "event not delivered"),
                Err(e) => warn!(event = name, error = %e, "event delivery task failed"),
            }
        }
        delivered
    }

    /// Handle for a context the peer announced.
    pub fn interface(&self, peer: PeerId, name: &str) -> Result<RemoteContext> {
        let def = self.remote_definition(peer, name)?;
        Ok(RemoteContext::new(self.clone(), peer, def))
    }

    /// Handle for a definition received in a reply.
    pub fn interface_from_value(&self, value: &Value) -> Result<RemoteContext> {
        let def = value.as_definition().ok_or_else(|| {
            ProtocolError::InvalidAccess(format!("expected a definition, got {}", value.kind()))
        })?;
        let owner = def
            .peer_id
            .ok_or_else(|| ProtocolError::UnknownPeer(format!("definition {} has no owner", def.id)))?;
        self.peer(owner)?;
        Ok(RemoteContext::new(self.clone(), owner, def.clone()))
    }

    /// Record `from` as the owner of definitions it issued in a reply.
    ///
    /// Definitions already owned by a third peer are left alone.
    fn adopt_reply(&self, value: &mut Value, from: PeerId) {
        let uid = self.uid();
        let adopt = |def: &mut Definition| {
            if def.peer_id.is_none() || def.peer_id == Some(uid) {
                *def = self.inner.registry.adopt_remote(def, from);
            }
        };
        match value {
            Value::Definition(def) => adopt(def),
            Value::Definitions(defs) => defs.iter_mut().for_each(adopt),
            Value::Array(items) => items.iter_mut().for_each(|v| self.adopt_reply(v, from)),
            _ => {}
        }
    }

    // ========================================================================
    // Inbound requests
    // ========================================================================

    fn origin(conn: &Connection) -> Result<PeerId> {
        conn.peer_id()
            .ok_or_else(|| ProtocolError::IllegalState("request before handshake".to_string()))
    }

    async fn on_handshake(&self, conn: &Arc<Connection>, payload: Value) -> Result<Value> {
        if conn.role() != Role::Acceptor {
            return Err(ProtocolError::IllegalState(
                "handshake sent to the initiating side".to_string(),
            ));
        }
        let (peer, contexts) = parse_handshake(payload)?;
        self.register_peer(conn, peer, contexts)?;
        // Taken after registration so a concurrent attach is never missed.
        Ok(self.handshake_payload(&self.exposed_contexts()))
    }

    fn on_remote_attach(&self, conn: &Connection, payload: Value) -> Result<Value> {
        if !self.inner.config.accept_remote_contexts {
            return Err(ProtocolError::NotImplemented(
                "this peer does not accept remote contexts".to_string(),
            ));
        }
        let peer = Self::origin(conn)?;
        let Value::Definition(def) = payload else {
            return Err(ProtocolError::MalformedFrame(format!(
                "CONTEXT_ATTACH expects a definition, got {}",
                payload.kind()
            )));
        };

        let entry = self.peer(peer)?;
        let adopted = self.inner.registry.adopt_remote(&def, peer);
        match entry.contexts.entry(adopted.name.clone()) {
            // Announced twice around a handshake.
            Entry::Occupied(existing) if existing.get().id == adopted.id => {
                return Ok(Value::Definition(existing.get().clone()));
            }
            Entry::Occupied(_) => {
                return Err(ProtocolError::Exists(format!("context '{}'", adopted.name)));
            }
            Entry::Vacant(slot) => {
                slot.insert(adopted.clone());
            }
        }

        debug!(%peer, context = %adopted.name, def_id = adopted.id, "remote context attached");
        self.emit(RouterEvent::RemoteContextAttached {
            peer,
            definition: adopted.clone(),
        });
        Ok(Value::Definition(adopted))
    }

    fn on_remote_detach(&self, conn: &Connection, payload: Value) -> Result<Value> {
        let peer = Self::origin(conn)?;
        let name = payload.as_str().ok_or_else(|| {
            ProtocolError::MalformedFrame(format!(
                "CONTEXT_DETACH expects a context name, got {}",
                payload.kind()
            ))
        })?;

        self.peer(peer)?
            .contexts
            .remove(name)
            .ok_or_else(|| ProtocolError::NotExists(format!("context '{}'", name)))?;

        debug!(%peer, context = %name, "remote context detached");
        self.emit(RouterEvent::RemoteContextDetached {
            peer,
            name: name.to_string(),
        });
        Ok(Value::Null)
    }

    /// Whether `peer` may invoke `def`.
    fn visible_to(&self, def: &Definition, peer: PeerId) -> bool {
        let top_level = self
            .inner
            .contexts
            .get(&def.name)
            .map(|d| d.definition().id == def.id)
            .unwrap_or(false);
        if top_level {
            return true;
        }
        if let Ok(entry) = self.peer(peer) {
            if entry.exposed.iter().any(|e| *e.value() == def.id) {
                return true;
            }
        }
        self.inner
            .peer_stubs
            .get(&peer)
            .map(|ids| ids.contains(&def.id))
            .unwrap_or(false)
    }

    /// Dispatcher for `def_id`, if `origin` can see it. Hidden definitions
    /// look exactly like unknown ones.
    fn dispatcher(&self, def_id: DefId, origin: PeerId) -> Result<Arc<Dispatcher>> {
        let dispatcher = self.inner.stubs.get(&def_id).map(|d| Arc::clone(d.value()));
        match dispatcher {
            Some(dispatcher) if self.visible_to(dispatcher.definition(), origin) => Ok(dispatcher),
            _ => Err(ProtocolError::NotExists(format!("definition {}", def_id))),
        }
    }

    async fn on_get(&self, conn: &Connection, payload: Value) -> Result<Value> {
        let origin = Self::origin(conn)?;
        let (def_id, member, args) = parse_invocation(payload)?;
        let args = match args {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };

        let dispatcher = self.dispatcher(def_id, origin)?;
        match dispatcher.get(&member, args, origin).await? {
            Output::Value(value) => Ok(value),
            Output::Context(ctx) => Ok(Value::Definition(self.ref_context(def_id, ctx, origin))),
        }
    }

    async fn on_set(&self, conn: &Connection, payload: Value) -> Result<Value> {
        let origin = Self::origin(conn)?;
        let (def_id, member, value) = parse_invocation(payload)?;
        self.dispatcher(def_id, origin)?
            .set(&member, value, origin)
            .await?;
        Ok(Value::Null)
    }

    fn on_event_on(&self, conn: &Connection, payload: Value) -> Result<Value> {
        let peer = Self::origin(conn)?;
        let name = event_name(&payload, Action::EventOn)?;
        self.peer(peer)?.listeners.insert(name.to_string());
        debug!(%peer, event = name, "peer subscribed");
        Ok(Value::Null)
    }

    fn on_event_off(&self, conn: &Connection, payload: Value) -> Result<Value> {
        let peer = Self::origin(conn)?;
        let name = event_name(&payload, Action::EventOff)?;
        self.peer(peer)?.listeners.remove(name);
        debug!(%peer, event = name, "peer unsubscribed");
        Ok(Value::Null)
    }

    fn on_event_emit(&self, conn: &Connection, payload: Value) -> Result<Value> {
        let peer = Self::origin(conn)?;
        let Value::Array(items) = payload else {
            return Err(ProtocolError::MalformedFrame(format!(
                "EVENT_EMIT expects [name, args...], got {}",
                payload.kind()
            )));
        };
        let mut items = items.into_iter();
        let Some(Value::String(name)) = items.next() else {
            return Err(ProtocolError::MalformedFrame(
                "EVENT_EMIT must start with the event name".to_string(),
            ));
        };

        if !self.peer(peer)?.subscriptions.contains_key(&name) {
            debug!(%peer, event = %name, "dropping event nobody subscribed to");
            return Ok(Value::Null);
        }
        self.emit(RouterEvent::RemoteEvent {
            peer,
            name,
            args: items.collect(),
        });
        Ok(Value::Null)
    }
}

impl RequestHandler for Router {
    fn handle_request<'a>(
        &'a self,
        connection: &'a Arc<Connection>,
        action: Action,
        payload: Value,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            match action {
                Action::Handshake => self.on_handshake(connection, payload).await,
                Action::Ping => Ok(Value::Null),
                Action::ContextAttach => self.on_remote_attach(connection, payload),
                Action::ContextDetach => self.on_remote_detach(connection, payload),
                Action::Get => self.on_get(connection, payload).await,
                Action::Set => self.on_set(connection, payload).await,
                Action::EventOn => self.on_event_on(connection, payload),
                Action::EventOff => self.on_event_off(connection, payload),
                Action::EventEmit => self.on_event_emit(connection, payload),
            }
        })
    }
}

fn parse_handshake(payload: Value) -> Result<(PeerId, Vec<Definition>)> {
    let Value::Map(mut map) = payload else {
        return Err(ProtocolError::MalformedFrame(format!(
            "handshake expects a map, got {}",
            payload.kind()
        )));
    };

    let peer = map
        .get(HANDSHAKE_UID)
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MalformedFrame("handshake without uid".to_string()))?
        .parse::<PeerId>()
        .map_err(|e| ProtocolError::MalformedFrame(format!("handshake uid: {}", e)))?;

    let contexts = match map.remove(HANDSHAKE_CONTEXTS) {
        Some(Value::Definitions(defs)) => defs,
        None | Some(Value::Null) => Vec::new(),
        Some(other) => {
            return Err(ProtocolError::MalformedFrame(format!(
                "handshake contexts must be definitions, got {}",
                other.kind()
            )))
        }
    };

    Ok((peer, contexts))
}

fn event_name(payload: &Value, action: Action) -> Result<&str> {
    payload.as_str().ok_or_else(|| {
        ProtocolError::MalformedFrame(format!(
            "{} expects an event name, got {}",
            action,
            payload.kind()
        ))
    })
}

fn parse_invocation(payload: Value) -> Result<(DefId, String, Value)> {
    let Value::Array(items) = payload else {
        return Err(ProtocolError::MalformedFrame(format!(
            "invocation expects [def_id, member, args], got {}",
            payload.kind()
        )));
    };
    let [def_id, member, rest]: [Value; 3] = items.try_into().map_err(|items: Vec<Value>| {
        ProtocolError::MalformedFrame(format!(
            "invocation expects 3 elements, got {}",
            items.len()
        ))
    })?;

    let def_id = def_id
        .as_u64()
        .ok_or_else(|| ProtocolError::MalformedFrame("definition id must be an integer".to_string()))?;
    let Value::String(member) = member else {
        return Err(ProtocolError::MalformedFrame("member name must be a string".to_string()));
    };
    Ok((def_id, member, rest))
}
