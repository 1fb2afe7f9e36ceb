use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use linkrpc_frame::{Frame, FrameEngine};
use linkrpc_transport::Link;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Framing, NodeConfig};
use crate::connection::{PeerId, PointToPointConnection};
use crate::error::{NodeError, Result};
use crate::function::{FunctionId, FunctionInfo, FunctionRegistry};
use crate::packet::{Command, Packet};
use crate::remote::{CallOutcome, Carrier, RemotePeerHandle};
use crate::request::{RemoteRequest, RemoteRequestStatus};

/// Snapshot of node counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub peers: usize,
    pub functions: usize,
    pub requests_served: u64,
    pub dispatch_failures: u64,
    pub requests_dropped: u64,
    pub responses_matched: u64,
    pub responses_unmatched: u64,
    pub packets_malformed: u64,
    pub packets_from_unknown_peers: u64,
}

#[derive(Default)]
struct Counters {
    requests_served: AtomicU64,
    dispatch_failures: AtomicU64,
    requests_dropped: AtomicU64,
    responses_matched: AtomicU64,
    responses_unmatched: AtomicU64,
    packets_malformed: AtomicU64,
    packets_from_unknown_peers: AtomicU64,
}

/// A named RPC endpoint.
///
/// Holds the functions this node serves and one [`RemotePeerHandle`] per
/// attached connection. Requests from peers enter a bounded incoming queue
/// and are dispatched right away on the thread that delivered their bytes;
/// a request leaves the queue once its handler returns. Responses are routed
/// to the handle of the peer that sent them.
///
/// ```no_run
/// use std::sync::Arc;
/// use linkrpc_node::{LocalNode, PointToPointConnection};
/// use linkrpc_transport::duplex;
///
/// let (a_end, b_end) = duplex();
/// let (a_end, b_end) = (Arc::new(a_end), Arc::new(b_end));
///
/// let a = LocalNode::new("A");
/// let b = LocalNode::new("B");
/// b.register_function("echo", 1, |input| Some(input.to_vec())).unwrap();
///
/// let a_conn = PointToPointConnection::from_arc(a_end.clone());
/// let b_conn = PointToPointConnection::from_arc(b_end.clone());
/// a_end.set_receiver(a.receiver_for(&a_conn));
/// b_end.set_receiver(b.receiver_for(&b_conn));
///
/// b.attach_peer(&b_conn).unwrap();
/// let peer = a.register_peer(&a_conn).unwrap();
/// let echo = a.peer(peer).unwrap().resolve("echo");
/// ```
pub struct LocalNode {
    name: String,
    config: NodeConfig,
    me: Weak<LocalNode>,
    registry: FunctionRegistry,
    peers: RwLock<HashMap<PeerId, Arc<RemotePeerHandle>>>,
    peer_names: RwLock<HashMap<String, PeerId>>,
    next_peer_id: AtomicU32,
    incoming: Mutex<VecDeque<RemoteRequest>>,
    counters: Counters,
}

impl LocalNode {
    /// Create a node with default configuration.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_config(name, NodeConfig::default())
    }

    /// Create a node with explicit configuration.
    pub fn with_config(name: impl Into<String>, config: NodeConfig) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|me| Self {
            registry: FunctionRegistry::new(name.clone()),
            name,
            config,
            me: me.clone(),
            peers: RwLock::new(HashMap::new()),
            peer_names: RwLock::new(HashMap::new()),
            next_peer_id: AtomicU32::new(1),
            incoming: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric identity from [`NodeConfig::node_id`].
    pub fn id(&self) -> u32 {
        self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Local function registry.
    pub fn functions(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Register a function peers can call.
    pub fn register_function<F>(&self, name: &str, id: FunctionId, handler: F) -> Result<FunctionInfo>
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.registry.register(name, id, handler)
    }

    /// Callback that feeds bytes arriving on `connection` into this node.
    ///
    /// Bytes delivered before the connection is attached are dropped.
    pub fn receiver_for(&self, connection: &PointToPointConnection) -> impl Fn(&[u8]) + Send + Sync + 'static {
        let node = self.me.clone();
        let slot = connection.slot();
        move |bytes: &[u8]| {
            let (Some(node), Some(peer_id)) = (node.upgrade(), slot.get()) else {
                debug!(len = bytes.len(), "bytes for unattached connection dropped");
                return;
            };
            node.on_packet_in(bytes, peer_id);
        }
    }

    /// Attach a connection without a handshake and return its peer id.
    ///
    /// This is the passive side of a link: the peer is reachable by id and
    /// its requests are served, but its name is not known.
    pub fn attach_peer(&self, connection: &PointToPointConnection) -> Result<PeerId> {
        if let Some(existing) = connection.peer_id() {
            return Err(NodeError::AlreadyAttached(existing));
        }
        let peer_id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        if !connection.slot().bind(peer_id) {
            let existing = connection.peer_id().unwrap_or(peer_id);
            return Err(NodeError::AlreadyAttached(existing));
        }

        let carrier = match self.config.framing {
            Framing::Raw => Carrier::Raw,
            Framing::Framed => Carrier::Framed(self.frame_engine(connection, peer_id)),
        };
        let handle = RemotePeerHandle::with_carrier(peer_id, connection.clone(), self.config.clone(), carrier);
        write(&self.peers).insert(peer_id, Arc::new(handle));
        info!(node = %self.name, peer = peer_id, framing = ?self.config.framing, "peer attached");
        Ok(peer_id)
    }

    /// Attach a connection and learn the peer's name with a synchronous
    /// node-name call. On failure the peer is detached again.
    pub fn register_peer(&self, connection: &PointToPointConnection) -> Result<PeerId> {
        let peer_id = self.attach_peer(connection)?;
        let handle = self.peer(peer_id).ok_or(NodeError::UnknownPeer(peer_id))?;

        match handle.query_node_name() {
            Ok(name) => {
                write(&self.peer_names).insert(name.clone(), peer_id);
                info!(node = %self.name, peer = peer_id, peer_name = %name, "handshake complete");
                Ok(peer_id)
            }
            Err(err) => {
                warn!(node = %self.name, peer = peer_id, error = %err, "handshake failed");
                self.detach_peer(peer_id);
                Err(NodeError::HandshakeFailed(err.to_string()))
            }
        }
    }

    /// Forget a peer. Returns `false` when it was not attached.
    pub fn detach_peer(&self, peer_id: PeerId) -> bool {
        let removed = write(&self.peers).remove(&peer_id);
        write(&self.peer_names).retain(|_, id| *id != peer_id);
        if removed.is_some() {
            debug!(node = %self.name, peer = peer_id, "peer detached");
        }
        removed.is_some()
    }

    pub fn peer(&self, peer_id: PeerId) -> Option<Arc<RemotePeerHandle>> {
        read(&self.peers).get(&peer_id).cloned()
    }

    pub fn peer_by_name(&self, name: &str) -> Option<Arc<RemotePeerHandle>> {
        let peer_id = *read(&self.peer_names).get(name)?;
        self.peer(peer_id)
    }

    /// Attached peer ids, ascending.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = read(&self.peers).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Call a function on a peer.
    pub fn call(&self, peer_id: PeerId, function: &FunctionInfo, parameter: &[u8], wait: bool) -> Result<CallOutcome> {
        let handle = self.peer(peer_id).ok_or(NodeError::UnknownPeer(peer_id))?;
        handle.call(function, parameter, wait)
    }

    /// Call a function on a peer by name, fetching the peer's catalog once if
    /// the name is not cached yet.
    pub fn call_by_name(&self, peer_id: PeerId, name: &str, parameter: &[u8], wait: bool) -> Result<CallOutcome> {
        let handle = self.peer(peer_id).ok_or(NodeError::UnknownPeer(peer_id))?;
        let mut function = handle.resolve(name);
        if !function.valid {
            handle.refresh_functions()?;
            function = handle.resolve(name);
        }
        if !function.valid {
            return Err(NodeError::InvalidFunction(name.to_string()));
        }
        handle.call(&function, parameter, wait)
    }

    /// Consume bytes received from a peer.
    ///
    /// Bytes from unknown peers are ignored. Requests are dispatched before
    /// this returns; responses complete the caller's pending request.
    pub fn on_packet_in(&self, bytes: &[u8], from: PeerId) {
        let Some(peer) = self.peer(from) else {
            self.counters.packets_from_unknown_peers.fetch_add(1, Ordering::Relaxed);
            debug!(node = %self.name, peer = from, len = bytes.len(), "bytes from unknown peer ignored");
            return;
        };

        match peer.framing() {
            Framing::Framed => peer.on_frame_bytes(bytes),
            Framing::Raw => self.on_packet(&peer, bytes),
        }
    }

    fn on_packet(&self, peer: &RemotePeerHandle, bytes: &[u8]) {
        let packet = Packet::deserialize(bytes);
        if !packet.is_valid() {
            self.counters.packets_malformed.fetch_add(1, Ordering::Relaxed);
            warn!(node = %self.name, peer = peer.peer_id(), len = bytes.len(), "malformed packet dropped");
            return;
        }

        match packet.command {
            Command::Request => {
                let Some(response) = self.serve(peer.peer_id(), &packet) else {
                    return;
                };
                if let Err(err) = peer.send_packet(&response) {
                    warn!(node = %self.name, peer = peer.peer_id(), error = %err, "failed sending response");
                }
            }
            Command::Response => {
                if peer.handle_response_packet(&packet) {
                    self.counters.responses_matched.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.responses_unmatched.fetch_add(1, Ordering::Relaxed);
                }
            }
            Command::Retry | Command::Busy | Command::Free => {
                debug!(node = %self.name, command = packet.command.name(), "reserved control packet ignored");
            }
        }
    }

    /// Handle a request packet and build its response, if one is due.
    fn serve(&self, peer_id: PeerId, packet: &Packet) -> Option<Packet> {
        let request = RemoteRequest::new(
            peer_id,
            packet.sequence,
            packet.request_sn,
            packet.function_id,
            packet.function_parameter.clone(),
        );
        if !self.enqueue(&request) {
            self.counters.requests_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                node = %self.name,
                peer = peer_id,
                request_sn = packet.request_sn,
                limit = self.config.max_queued_requests,
                "incoming queue full, request dropped"
            );
            return None;
        }

        let request = self.dispatch(request);
        self.dequeue(&request);

        (request.status == RemoteRequestStatus::CallFinished).then(|| {
            Packet::response(request.sequence, request.function_id, request.request_sn, request.result)
        })
    }

    fn enqueue(&self, request: &RemoteRequest) -> bool {
        let mut incoming = lock(&self.incoming);
        if incoming.len() >= self.config.max_queued_requests {
            return false;
        }
        incoming.push_back(request.clone());
        true
    }

    fn dequeue(&self, request: &RemoteRequest) {
        let mut incoming = lock(&self.incoming);
        let same = |queued: &RemoteRequest| {
            queued.peer_id == request.peer_id && queued.request_sn == request.request_sn
        };
        if let Some(at) = incoming.iter().position(same) {
            incoming.remove(at);
        }
    }

    /// Requests from peers currently queued or being dispatched, oldest first.
    pub fn queued_requests(&self) -> Vec<RemoteRequest> {
        lock(&self.incoming).iter().cloned().collect()
    }

    /// Run a queued remote request against the local registry.
    ///
    /// Only registered, valid functions run. Anything else, or a handler
    /// that reports failure, ends in `CallFailed`; no response is owed then.
    pub fn dispatch(&self, mut request: RemoteRequest) -> RemoteRequest {
        let function = self.registry.info(request.function_id);
        if !function.valid {
            request.status = RemoteRequestStatus::CallFailed;
            self.counters.dispatch_failures.fetch_add(1, Ordering::Relaxed);
            debug!(
                node = %self.name,
                peer = request.peer_id,
                function_id = request.function_id,
                request_sn = request.request_sn,
                "request for unavailable function"
            );
            return request;
        }

        match self.registry.invoke(function.id, &request.parameter) {
            Some(output) => {
                request.result = output;
                request.status = RemoteRequestStatus::CallFinished;
                self.counters.requests_served.fetch_add(1, Ordering::Relaxed);
                debug!(
                    node = %self.name,
                    peer = request.peer_id,
                    function = %function.name,
                    request_sn = request.request_sn,
                    output = request.result.len(),
                    "request served"
                );
            }
            None => {
                request.status = RemoteRequestStatus::CallFailed;
                self.counters.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                debug!(
                    node = %self.name,
                    peer = request.peer_id,
                    function = %function.name,
                    request_sn = request.request_sn,
                    "function reported failure"
                );
            }
        }
        request
    }

    fn frame_engine(
        &self,
        connection: &PointToPointConnection,
        peer_id: PeerId,
    ) -> FrameEngine<Arc<dyn Link>> {
        let on_request = self.me.clone();
        let on_response = self.me.clone();

        FrameEngine::new(Arc::clone(connection.link()))
            .with_handler(move |payload: &[u8]| {
                let node = on_request.upgrade()?;
                node.serve_framed(peer_id, payload)
            })
            .with_response_observer(move |frame: &Frame| {
                let Some(node) = on_response.upgrade() else {
                    return;
                };
                if let Some(peer) = node.peer(peer_id) {
                    node.on_packet(&peer, &frame.payload);
                }
            })
    }

    fn serve_framed(&self, peer_id: PeerId, payload: &[u8]) -> Option<Vec<u8>> {
        let packet = Packet::deserialize(payload);
        if !packet.is_valid() || packet.command != Command::Request {
            self.counters.packets_malformed.fetch_add(1, Ordering::Relaxed);
            warn!(node = %self.name, peer = peer_id, len = payload.len(), "request frame without a request packet");
            return None;
        }
        let response = self.serve(peer_id, &packet)?;
        match response.serialize() {
            Ok(wire) => Some(wire.to_vec()),
            Err(err) => {
                warn!(node = %self.name, peer = peer_id, error = %err, "response does not fit a packet");
                None
            }
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            peers: read(&self.peers).len(),
            functions: self.registry.list().len(),
            requests_served: self.counters.requests_served.load(Ordering::Relaxed),
            dispatch_failures: self.counters.dispatch_failures.load(Ordering::Relaxed),
            requests_dropped: self.counters.requests_dropped.load(Ordering::Relaxed),
            responses_matched: self.counters.responses_matched.load(Ordering::Relaxed),
            responses_unmatched: self.counters.responses_unmatched.load(Ordering::Relaxed),
            packets_malformed: self.counters.packets_malformed.load(Ordering::Relaxed),
            packets_from_unknown_peers: self.counters.packets_from_unknown_peers.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNode")
            .field("name", &self.name)
            .field("peers", &self.peer_ids())
            .field("framing", &self.config.framing)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
