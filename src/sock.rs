//! Sockets: per-port state and the user-visible operations.
//!
//! A socket owns every RPC issued from or addressed to its ports. All of
//! its mutable state sits behind one mutex; blocked receivers wait on a
//! condvar and re-check the ready queues after every wakeup. Freed RPCs
//! go to the dead list and release their buffers on a later reap pass, in
//! bounded batches, so no single caller absorbs a large free.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use ahash::RandomState;
use bitflags::bitflags;

use crate::error::{HomaError, Result};
use crate::metrics::Metrics;
use crate::msgout::MsgOut;
use crate::rpc::{HomaRpc, RpcState};
use crate::transport::Homa;
use crate::type_alias::*;
use crate::wire::MAX_MESSAGE_SIZE;

/// First port in the ephemeral (client) range; `bind` only accepts
/// server ports below this.
pub(crate) const MIN_EPHEMERAL_PORT: Port = 0x8000;

/// Maximum buffers released per reap pass.
const REAP_BATCH_FRAMES: usize = 64;

bitflags! {
    /// Flags for [`HomaSock::recv`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecvFlags: u32 {
        /// Accept incoming requests (server side).
        const REQUEST = 1 << 0;
        /// Accept incoming responses (client side).
        const RESPONSE = 1 << 1;
        /// Return [`HomaError::WouldBlock`] instead of waiting.
        const NONBLOCKING = 1 << 2;
    }
}

/// A message delivered by [`HomaSock::recv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvMsg {
    /// Identifier of the exchange; pass to `reply` for requests.
    pub id: RpcId,

    /// The remote endpoint: reply destination for requests, the server
    /// for responses.
    pub source: SocketAddrV4,

    /// The complete message.
    pub data: Vec<u8>,
}

/// Readiness reported by [`HomaSock::poll`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollEvents {
    /// A request is ready to receive.
    pub request: bool,

    /// A response is ready to receive.
    pub response: bool,
}

pub(crate) struct SockInner {
    /// Client RPCs by id.
    pub client_rpcs: HashMap<RpcId, Arc<HomaRpc>, RandomState>,

    /// Server RPCs by (client address, client port, id).
    pub server_rpcs: HashMap<(Ipv4Addr, Port, RpcId), Arc<HomaRpc>, RandomState>,

    /// Every live RPC on the socket, oldest first; walked by the timer.
    pub active: Vec<Arc<HomaRpc>>,

    /// Freed RPCs whose buffers have not been released yet.
    pub dead: VecDeque<Arc<HomaRpc>>,

    /// Completed server RPCs not yet claimed, oldest first.
    pub ready_requests: VecDeque<Arc<HomaRpc>>,

    /// Completed client RPCs not yet claimed, oldest first.
    pub ready_responses: VecDeque<Arc<HomaRpc>>,
}

/// An open Homa socket.
pub struct HomaSock {
    homa: Weak<Homa>,

    /// Port for outgoing RPC requests; assigned at creation.
    client_port: Port,

    /// Port for incoming requests; 0 until `bind`.
    server_port: AtomicU16,

    /// Id for the next outgoing RPC.
    next_outgoing_id: AtomicU64,

    shutdown: AtomicBool,

    pub(crate) inner: Mutex<SockInner>,

    /// Wakes blocked receivers; notified on every readiness or abort
    /// event, and on shutdown. Waiters re-check the queues.
    ready: Condvar,
}

impl HomaSock {
    pub(crate) fn new(homa: &Arc<Homa>, client_port: Port) -> Arc<Self> {
        Arc::new(Self {
            homa: Arc::downgrade(homa),
            client_port,
            server_port: AtomicU16::new(0),
            next_outgoing_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            inner: Mutex::new(SockInner {
                client_rpcs: HashMap::with_hasher(RandomState::new()),
                server_rpcs: HashMap::with_hasher(RandomState::new()),
                active: Vec::new(),
                dead: VecDeque::new(),
                ready_requests: VecDeque::new(),
                ready_responses: VecDeque::new(),
            }),
            ready: Condvar::new(),
        })
    }

    #[inline]
    pub fn client_port(&self) -> Port {
        self.client_port
    }

    /// The bound server port, or 0 if unbound.
    #[inline]
    pub fn server_port(&self) -> Port {
        self.server_port.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn homa(&self) -> Result<Arc<Homa>> {
        self.homa.upgrade().ok_or(HomaError::Shutdown)
    }

    /// Assign a server port so this socket receives incoming requests.
    pub fn bind(self: &Arc<Self>, port: Port) -> Result<()> {
        let homa = self.homa()?;
        if self.is_shutdown() {
            return Err(HomaError::Shutdown);
        }
        if port == 0 || port >= MIN_EPHEMERAL_PORT {
            return Err(HomaError::InvalidPort(port));
        }
        homa.socktab().claim(port, self)?;
        self.server_port.store(port, Ordering::Release);
        Ok(())
    }

    /// Start a client RPC; returns its id immediately, with the message
    /// queued for (paced) transmission.
    pub fn send(self: &Arc<Self>, dest: SocketAddrV4, message: &[u8]) -> Result<RpcId> {
        let homa = self.homa()?;
        if self.is_shutdown() {
            return Err(HomaError::Shutdown);
        }
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(HomaError::MessageTooLong(message.len()));
        }
        self.reap(&homa);

        let peer = homa
            .find_peer(*dest.ip())
            .ok_or(HomaError::Unreachable)?;
        let id = self.next_outgoing_id.fetch_add(1, Ordering::Relaxed);
        let msgout = MsgOut::new(
            homa.config(),
            self.client_port,
            dest.port(),
            id,
            peer.cutoff_version.load(Ordering::Acquire),
            message,
        );
        let rpc = HomaRpc::new_client(self, peer, dest.port(), id, msgout);

        {
            let mut inner = self.inner.lock().unwrap();
            if self.is_shutdown() {
                return Err(HomaError::Shutdown);
            }
            inner.client_rpcs.insert(id, rpc.clone());
            inner.active.push(rpc.clone());
        }

        homa.xmit_data(&rpc, false);
        homa.check_pacer();
        Ok(id)
    }

    /// Complete a server RPC previously delivered by `recv`.
    pub fn reply(self: &Arc<Self>, src: SocketAddrV4, id: RpcId, message: &[u8]) -> Result<()> {
        let homa = self.homa()?;
        if self.is_shutdown() {
            return Err(HomaError::Shutdown);
        }
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(HomaError::MessageTooLong(message.len()));
        }
        self.reap(&homa);

        let key = (*src.ip(), src.port(), id);
        let rpc = {
            let inner = self.inner.lock().unwrap();
            inner
                .server_rpcs
                .get(&key)
                .cloned()
                .ok_or(HomaError::UnknownRpc)?
        };

        {
            let mut r = rpc.inner.lock().unwrap();
            if r.state != RpcState::InService {
                return Err(HomaError::UnknownRpc);
            }
            let msgout = MsgOut::new(
                homa.config(),
                rpc.sport,
                rpc.dport,
                id,
                rpc.peer.cutoff_version.load(Ordering::Acquire),
                message,
            );
            rpc.num_frames
                .fetch_add(msgout.frames.len(), Ordering::Relaxed);
            r.msgout = Some(msgout);
            r.state = RpcState::Outgoing;
        }

        homa.xmit_data(&rpc, false);
        homa.check_pacer();
        Ok(())
    }

    /// Dequeue the next ready message. `id != 0` waits for one specific
    /// client RPC instead.
    pub fn recv(self: &Arc<Self>, flags: RecvFlags, id: RpcId) -> Result<RecvMsg> {
        let homa = self.homa()?;
        self.reap(&homa);

        let mut inner = self.inner.lock().unwrap();
        loop {
            if self.is_shutdown() {
                return Err(HomaError::Shutdown);
            }

            if id != 0 {
                let rpc = inner
                    .client_rpcs
                    .get(&id)
                    .cloned()
                    .ok_or(HomaError::UnknownRpc)?;
                let deliverable = {
                    let r = rpc.inner.lock().unwrap();
                    r.error.is_some() || r.state == RpcState::Ready
                };
                if deliverable {
                    inner.ready_responses.retain(|r| !Arc::ptr_eq(r, &rpc));
                    return self.deliver(&homa, &mut inner, rpc);
                }
            } else {
                if flags.contains(RecvFlags::REQUEST) {
                    if let Some(rpc) = inner.ready_requests.pop_front() {
                        return self.deliver(&homa, &mut inner, rpc);
                    }
                }
                if flags.contains(RecvFlags::RESPONSE) {
                    if let Some(rpc) = inner.ready_responses.pop_front() {
                        return self.deliver(&homa, &mut inner, rpc);
                    }
                }
            }

            if flags.contains(RecvFlags::NONBLOCKING) {
                return Err(HomaError::WouldBlock);
            }
            inner = self.ready.wait(inner).unwrap();
        }
    }

    /// Hand a ready RPC's message to the application. Requests move to
    /// `InService`; responses (and errors) free the RPC.
    fn deliver(
        &self,
        homa: &Arc<Homa>,
        inner: &mut SockInner,
        rpc: Arc<HomaRpc>,
    ) -> Result<RecvMsg> {
        let result = {
            let mut r = rpc.inner.lock().unwrap();
            if let Some(error) = r.error {
                Err(error)
            } else {
                let data = r
                    .msgin
                    .as_ref()
                    .expect("ready RPC has no inbound message")
                    .assemble();
                if !rpc.is_client {
                    r.state = RpcState::InService;
                }
                Ok(data)
            }
        };
        match result {
            Ok(data) => {
                let msg = RecvMsg {
                    id: rpc.id,
                    source: rpc.remote(),
                    data,
                };
                if rpc.is_client {
                    self.free_rpc_locked(homa, inner, &rpc);
                }
                Ok(msg)
            }
            Err(error) => {
                self.free_rpc_locked(homa, inner, &rpc);
                Err(error)
            }
        }
    }

    /// Report readiness without consuming anything.
    pub fn poll(&self) -> PollEvents {
        let inner = self.inner.lock().unwrap();
        PollEvents {
            request: !inner.ready_requests.is_empty(),
            response: !inner.ready_responses.is_empty(),
        }
    }

    /// Abort all RPCs, release the ports, and drain the dead list. All
    /// blocked receivers wake with [`HomaError::Shutdown`].
    pub fn shutdown(self: &Arc<Self>) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(homa) = self.homa.upgrade() else {
            return;
        };

        let rpcs: Vec<Arc<HomaRpc>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.ready_requests.clear();
            inner.ready_responses.clear();
            inner.active.clear();
            let mut rpcs: Vec<Arc<HomaRpc>> =
                inner.client_rpcs.drain().map(|(_, r)| r).collect();
            rpcs.extend(inner.server_rpcs.drain().map(|(_, r)| r));
            rpcs
        };
        for rpc in rpcs {
            {
                let mut r = rpc.inner.lock().unwrap();
                if rpc.is_client {
                    r.error = Some(HomaError::Shutdown);
                }
                r.state = RpcState::ClientDone;
            }
            homa.remove_from_grantable(&rpc);
            homa.pacer().remove_throttled(&rpc);
            self.inner.lock().unwrap().dead.push_back(rpc);
        }
        self.ready.notify_all();

        homa.socktab().release(self.client_port, self);
        let server_port = self.server_port.swap(0, Ordering::AcqRel);
        if server_port != 0 {
            homa.socktab().release(server_port, self);
        }

        // Drain everything; nobody else will reap for this socket.
        while self.reap(&homa) {}
    }

    /// Release buffers of dead RPCs, at most [`REAP_BATCH_FRAMES`] frame
    /// buffers per pass. Returns true if dead RPCs remain.
    pub(crate) fn reap(&self, homa: &Arc<Homa>) -> bool {
        let mut freed = 0;
        loop {
            let rpc = {
                let mut inner = self.inner.lock().unwrap();
                if inner.dead.is_empty() {
                    return false;
                }
                if freed >= REAP_BATCH_FRAMES {
                    return true;
                }
                inner.dead.pop_front().unwrap()
            };
            let (msgin, msgout) = {
                let mut r = rpc.inner.lock().unwrap();
                (r.msgin.take(), r.msgout.take())
            };
            if let Some(mut msgin) = msgin {
                freed += msgin.num_segments();
                msgin.clear();
            }
            if let Some(msgout) = msgout {
                freed += msgout.frames.len();
            }
            rpc.num_frames.store(0, Ordering::Relaxed);
            Metrics::inc(&homa.metrics_registry().shard().rpcs_reaped);
        }
    }

    /// Move a completed RPC to the matching ready queue and wake
    /// receivers. The caller must not hold the RPC lock.
    pub(crate) fn rpc_ready(&self, rpc: &Arc<HomaRpc>) {
        rpc.inner.lock().unwrap().state = RpcState::Ready;
        let mut inner = self.inner.lock().unwrap();
        if self.is_shutdown() {
            return;
        }
        if rpc.is_client {
            inner.ready_responses.push_back(rpc.clone());
        } else {
            inner.ready_requests.push_back(rpc.clone());
        }
        drop(inner);
        self.ready.notify_all();
    }

    /// Abort an RPC with an error. Client RPCs deliver the error through
    /// the ready path; server RPCs are simply discarded.
    pub(crate) fn abort_rpc(&self, homa: &Arc<Homa>, rpc: &Arc<HomaRpc>, error: HomaError) {
        if rpc.is_client {
            {
                let mut r = rpc.inner.lock().unwrap();
                if r.state == RpcState::ClientDone {
                    return;
                }
                r.error = Some(error);
                r.state = RpcState::Ready;
            }
            homa.remove_from_grantable(rpc);
            homa.pacer().remove_throttled(rpc);
            let mut inner = self.inner.lock().unwrap();
            if !inner.ready_responses.iter().any(|r| Arc::ptr_eq(r, rpc)) {
                inner.ready_responses.push_back(rpc.clone());
            }
            drop(inner);
            self.ready.notify_all();
        } else {
            self.free_rpc(homa, rpc);
        }
    }

    /// Unlink an RPC and queue it for the reaper.
    pub(crate) fn free_rpc(&self, homa: &Arc<Homa>, rpc: &Arc<HomaRpc>) {
        let mut inner = self.inner.lock().unwrap();
        self.free_rpc_locked(homa, &mut inner, rpc);
    }

    fn free_rpc_locked(&self, homa: &Arc<Homa>, inner: &mut SockInner, rpc: &Arc<HomaRpc>) {
        let removed = if rpc.is_client {
            inner.client_rpcs.remove(&rpc.id).is_some()
        } else {
            inner.server_rpcs.remove(&rpc.server_key()).is_some()
        };
        if !removed {
            // Already freed by a racing path.
            return;
        }
        inner.active.retain(|r| !Arc::ptr_eq(r, rpc));
        inner.ready_requests.retain(|r| !Arc::ptr_eq(r, rpc));
        inner.ready_responses.retain(|r| !Arc::ptr_eq(r, rpc));
        rpc.inner.lock().unwrap().state = RpcState::ClientDone;
        homa.remove_from_grantable(rpc);
        homa.pacer().remove_throttled(rpc);
        inner.dead.push_back(rpc.clone());
    }

    /// Look up a client RPC by id (dispatcher path).
    pub(crate) fn find_client_rpc(&self, id: RpcId) -> Option<Arc<HomaRpc>> {
        self.inner.lock().unwrap().client_rpcs.get(&id).cloned()
    }

    /// Look up a server RPC by (client address, client port, id).
    pub(crate) fn find_server_rpc(
        &self,
        key: (Ipv4Addr, Port, RpcId),
    ) -> Option<Arc<HomaRpc>> {
        self.inner.lock().unwrap().server_rpcs.get(&key).cloned()
    }

    /// Insert a freshly created server RPC, unless a racing packet
    /// already created one (the existing RPC wins).
    pub(crate) fn insert_server_rpc(&self, rpc: Arc<HomaRpc>) -> Arc<HomaRpc> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        match inner.server_rpcs.entry(rpc.server_key()) {
            std::collections::hash_map::Entry::Occupied(e) => e.get().clone(),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(rpc.clone());
                inner.active.push(rpc.clone());
                rpc
            }
        }
    }
}
