use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use linkrpc_frame::{Frame, FrameEngine};
use linkrpc_transport::Link;
use tracing::{debug, info, warn};

use crate::config::{Framing, NodeConfig};
use crate::connection::{PeerId, PointToPointConnection};
use crate::error::{NodeError, Result};
use crate::function::{decode_catalog, FunctionInfo, FunctionStatus};
use crate::packet::{Command, Packet};
use crate::request::{PacketSequence, Request, RequestSn, RequestStatus, SequenceGenerator};

/// Result of [`RemotePeerHandle::call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Asynchronous call in flight; poll with the token.
    Pending(RequestSn),
    /// Synchronous call completed with the remote function's output.
    Completed(Bytes),
}

pub(crate) enum Carrier {
    Raw,
    Framed(FrameEngine<Arc<dyn Link>>),
}

/// This node's view of one remote peer.
///
/// Owns the connection, the table of outgoing requests awaiting responses,
/// and the catalog of functions the peer advertised. The pending table has
/// one mutex; it is never held while the link is written to, so responses
/// delivered inline by the link complete normally.
pub struct RemotePeerHandle {
    peer_id: PeerId,
    connection: PointToPointConnection,
    carrier: Carrier,
    config: NodeConfig,
    name: RwLock<Option<String>>,
    pending: Mutex<HashMap<RequestSn, Request>>,
    responded: Condvar,
    request_sns: SequenceGenerator,
    sequence: PacketSequence,
    catalog: RwLock<HashMap<String, FunctionInfo>>,
}

impl RemotePeerHandle {
    /// Create a handle that writes packets to the link unframed.
    pub fn new(peer_id: PeerId, connection: PointToPointConnection, config: NodeConfig) -> Self {
        Self::with_carrier(peer_id, connection, config, Carrier::Raw)
    }

    pub(crate) fn with_carrier(
        peer_id: PeerId,
        connection: PointToPointConnection,
        config: NodeConfig,
        carrier: Carrier,
    ) -> Self {
        let catalog = [
            FunctionInfo::node_name(),
            FunctionInfo::function_status(),
            FunctionInfo::available_functions(),
        ]
        .into_iter()
        .map(|info| (info.name.clone(), info))
        .collect();

        Self {
            peer_id,
            connection,
            carrier,
            config,
            name: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            responded: Condvar::new(),
            request_sns: SequenceGenerator::new(),
            sequence: PacketSequence::default(),
            catalog: RwLock::new(catalog),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Name learned during the handshake.
    pub fn name(&self) -> Option<String> {
        read(&self.name).clone()
    }

    pub fn connection(&self) -> &PointToPointConnection {
        &self.connection
    }

    pub fn framing(&self) -> Framing {
        match self.carrier {
            Carrier::Raw => Framing::Raw,
            Carrier::Framed(_) => Framing::Framed,
        }
    }

    pub fn is_active(&self) -> bool {
        self.connection.is_active()
    }

    /// Issue a call to the peer.
    ///
    /// Asynchronous calls return a token once the request is handed to the
    /// link, even if that fails; [`poll`](Self::poll) then reports
    /// `CallFailed`. Synchronous calls block up to the configured call
    /// timeout. A timed-out request stays in the table until reaped.
    pub fn call(&self, function: &FunctionInfo, parameter: &[u8], synchronous: bool) -> Result<CallOutcome> {
        if synchronous {
            self.call_sync(function, parameter).map(CallOutcome::Completed)
        } else {
            self.call_async(function, parameter).map(CallOutcome::Pending)
        }
    }

    /// Synchronous call returning the remote output.
    pub fn call_sync(&self, function: &FunctionInfo, parameter: &[u8]) -> Result<Bytes> {
        match self.issue(function, parameter) {
            Ok(request_sn) => self.wait(request_sn, self.config.call_timeout),
            Err(NodeError::SendFailed { request_sn, source }) => {
                lock(&self.pending).remove(&request_sn);
                Err(NodeError::SendFailed { request_sn, source })
            }
            Err(err) => Err(err),
        }
    }

    /// Asynchronous call returning the request token.
    pub fn call_async(&self, function: &FunctionInfo, parameter: &[u8]) -> Result<RequestSn> {
        match self.issue(function, parameter) {
            Ok(request_sn) | Err(NodeError::SendFailed { request_sn, .. }) => Ok(request_sn),
            Err(err) => Err(err),
        }
    }

    fn issue(&self, function: &FunctionInfo, parameter: &[u8]) -> Result<RequestSn> {
        if !function.valid {
            return Err(NodeError::InvalidFunction(function.name.clone()));
        }
        self.reap();

        let request_sn = self.request_sns.next();
        let parameter = Bytes::copy_from_slice(parameter);
        let packet = Packet::request(self.sequence.next(), function.id, request_sn, parameter.clone());
        let wire = packet.serialize()?;

        lock(&self.pending).insert(request_sn, Request::new(request_sn, function.clone(), parameter));
        debug!(
            peer = self.peer_id,
            function = %function.name,
            function_id = function.id,
            request_sn,
            "calling remote function"
        );

        if let Err(err) = self.transmit(&packet, &wire) {
            warn!(peer = self.peer_id, request_sn, error = %err, "request send failed");
            self.set_status(request_sn, RequestStatus::CallFailed);
            return Err(NodeError::SendFailed {
                request_sn,
                source: Box::new(err),
            });
        }

        // The response may already have arrived while the link was written.
        if let Some(request) = lock(&self.pending).get_mut(&request_sn) {
            if request.status == RequestStatus::Created {
                request.status = RequestStatus::Sent;
            }
        }
        Ok(request_sn)
    }

    /// Status of an outgoing request, `None` once reclaimed.
    pub fn poll(&self, request_sn: RequestSn) -> Option<RequestStatus> {
        lock(&self.pending).get(&request_sn).map(|request| request.status)
    }

    /// Take the output of a responded request; the request is evicted.
    pub fn take_result(&self, request_sn: RequestSn) -> Option<Bytes> {
        let mut pending = lock(&self.pending);
        match pending.get(&request_sn)?.status {
            RequestStatus::Responded => {
                let mut request = pending.remove(&request_sn)?;
                request.status = RequestStatus::Finished;
                Some(request.incoming)
            }
            _ => None,
        }
    }

    /// Block until the request is answered, fails, or `timeout` elapses.
    ///
    /// Wakes on every matched response and at least every poll interval.
    pub fn wait(&self, request_sn: RequestSn, timeout: Duration) -> Result<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut pending = lock(&self.pending);
        if let Some(request) = pending.get_mut(&request_sn) {
            request.waiters += 1;
        }
        loop {
            match pending.get(&request_sn).map(|request| request.status) {
                None | Some(RequestStatus::Finished) => {
                    return Err(NodeError::UnknownRequest(request_sn));
                }
                Some(RequestStatus::Responded) => {
                    let request = pending
                        .remove(&request_sn)
                        .ok_or(NodeError::UnknownRequest(request_sn))?;
                    return Ok(request.incoming);
                }
                Some(RequestStatus::CallFailed) => {
                    pending.remove(&request_sn);
                    return Err(NodeError::CallFailed(request_sn));
                }
                Some(RequestStatus::Created | RequestStatus::Sent) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                if let Some(request) = pending.get_mut(&request_sn) {
                    request.waiters = request.waiters.saturating_sub(1);
                }
                warn!(peer = self.peer_id, request_sn, ?timeout, "call timed out");
                return Err(NodeError::Timeout(timeout));
            }
            let slice = (deadline - now).min(self.config.poll_interval);
            pending = self
                .responded
                .wait_timeout(pending, slice)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Complete the outgoing request a response packet answers.
    ///
    /// Returns `false` when nothing matched: unknown or already completed
    /// request numbers, and responses naming a different function.
    pub fn handle_response_packet(&self, packet: &Packet) -> bool {
        if packet.command != Command::Response {
            return false;
        }

        {
            let mut pending = lock(&self.pending);
            let Some(request) = pending.get_mut(&packet.request_sn) else {
                debug!(peer = self.peer_id, request_sn = packet.request_sn, "response for unknown request dropped");
                return false;
            };
            if !request.status.is_outstanding() {
                debug!(
                    peer = self.peer_id,
                    request_sn = packet.request_sn,
                    status = request.status.name(),
                    "duplicate response dropped"
                );
                return false;
            }
            if request.function.id != packet.function_id {
                warn!(
                    peer = self.peer_id,
                    request_sn = packet.request_sn,
                    expected = request.function.id,
                    actual = packet.function_id,
                    "response names a different function, dropped"
                );
                return false;
            }
            request.incoming = packet.function_result.clone();
            request.status = RequestStatus::Responded;
        }

        self.responded.notify_all();
        true
    }

    /// Ask the peer for its name. The answer is remembered.
    pub fn query_node_name(&self) -> Result<String> {
        let output = self.call_sync(&FunctionInfo::node_name(), &[])?;
        let name = String::from_utf8(output.to_vec())
            .map_err(|err| NodeError::MalformedReply(format!("node name is not UTF-8: {err}")))?;
        *write(&self.name) = Some(name.clone());
        Ok(name)
    }

    /// Ask the peer whether it can run the named function.
    pub fn query_function_status(&self, name: &str) -> Result<FunctionStatus> {
        let output = self.call_sync(&FunctionInfo::function_status(), name.as_bytes())?;
        FunctionStatus::from_bytes(&output).ok_or_else(|| {
            NodeError::MalformedReply(format!("function status reply of {} bytes", output.len()))
        })
    }

    /// Fetch the peer's function catalog and cache it for [`resolve`](Self::resolve).
    pub fn refresh_functions(&self) -> Result<Vec<FunctionInfo>> {
        let output = self.call_sync(&FunctionInfo::available_functions(), &[])?;
        let functions = decode_catalog(&output)?;
        {
            let mut catalog = write(&self.catalog);
            catalog.clear();
            for function in &functions {
                catalog.insert(function.name.clone(), function.clone());
            }
        }
        info!(peer = self.peer_id, functions = functions.len(), "remote catalog refreshed");
        Ok(functions)
    }

    /// Identity of a remote function by name; the invalid sentinel when unknown.
    pub fn resolve(&self, name: &str) -> FunctionInfo {
        read(&self.catalog)
            .get(name)
            .cloned()
            .unwrap_or_else(FunctionInfo::invalid)
    }

    /// Drop requests older than the retention period. Returns how many.
    ///
    /// A request some caller is still blocked on in [`wait`](Self::wait) is
    /// kept regardless of age.
    pub fn reap(&self) -> usize {
        let retention = self.config.request_retention;
        let mut pending = lock(&self.pending);
        let before = pending.len();
        pending.retain(|_, request| request.waiters > 0 || request.created_at.elapsed() < retention);
        let reaped = before - pending.len();
        if reaped > 0 {
            debug!(peer = self.peer_id, reaped, "stale requests reclaimed");
        }
        reaped
    }

    /// Requests still held in the table.
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Write a packet that is not answered through the frame engine.
    pub(crate) fn send_packet(&self, packet: &Packet) -> Result<()> {
        let wire = packet.serialize()?;
        self.transmit(packet, &wire)
    }

    /// Feed bytes into the frame engine. No-op for raw carriers.
    pub(crate) fn on_frame_bytes(&self, bytes: &[u8]) {
        if let Carrier::Framed(engine) = &self.carrier {
            engine.on_bytes_received(bytes);
        }
    }

    fn transmit(&self, packet: &Packet, wire: &[u8]) -> Result<()> {
        match &self.carrier {
            Carrier::Raw => self.connection.send(wire)?,
            Carrier::Framed(engine) if packet.command == Command::Request => {
                engine.send_request(wire)?;
            }
            Carrier::Framed(engine) => {
                let frame = Frame::new(packet.command, 0, Bytes::copy_from_slice(wire));
                engine.send_frame(&frame)?;
            }
        }
        Ok(())
    }

    fn set_status(&self, request_sn: RequestSn, status: RequestStatus) {
        if let Some(request) = lock(&self.pending).get_mut(&request_sn) {
            request.status = status;
        }
        self.responded.notify_all();
    }
}

impl fmt::Debug for RemotePeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePeerHandle")
            .field("peer_id", &self.peer_id)
            .field("name", &self.name())
            .field("framing", &self.framing())
            .field("pending", &self.pending_len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
