//! Per-RPC state.
//!
//! One [`HomaRpc`] exists for each active request/response exchange; the
//! same structure serves outgoing RPCs on clients and incoming RPCs on
//! servers. The mutable core lives behind a mutex; the handful of fields
//! the grant scheduler must touch across RPCs are mirrored in atomics so
//! grant arbitration never acquires RPC locks (see `grant.rs`).

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::HomaError;
use crate::msgin::MsgIn;
use crate::msgout::MsgOut;
use crate::peer::Peer;
use crate::sock::HomaSock;
use crate::type_alias::*;
use crate::wire::{CommonHeader, PktType};

/// Sentinel for "no inbound message yet" in the atomic length mirror.
pub(crate) const MSGIN_UNINIT: usize = usize::MAX;

/// Lifecycle states of an RPC.
///
/// Client RPCs: `Outgoing -> Incoming -> Ready -> ClientDone`.
/// Server RPCs: `Incoming -> Ready -> InService -> Outgoing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RpcState {
    /// Waiting for the outbound message to be transmitted.
    Outgoing,

    /// At least one inbound packet has arrived; reassembly in progress.
    Incoming,

    /// The inbound message is complete and waiting to be read.
    Ready,

    /// Server only: the request has been read, the reply has not been
    /// presented yet.
    InService,

    /// Client only: set when the RPC is freed; the reaper finishes the
    /// cleanup later.
    ClientDone,
}

/// Mutable core of an RPC, guarded by the RPC lock.
pub(crate) struct RpcInner {
    pub state: RpcState,

    /// Clients only; a failed RPC carries its error here.
    pub error: Option<HomaError>,

    /// Message being received (response on clients, request on servers).
    pub msgin: Option<MsgIn>,

    /// Message being sent (request on clients, response on servers).
    pub msgout: Option<MsgOut>,
}

/// One active request/response exchange.
pub(crate) struct HomaRpc {
    /// Unique among RPCs issued from the client's port.
    pub id: RpcId,

    pub is_client: bool,

    /// The other machine (server for client RPCs, client for server
    /// RPCs).
    pub peer: Arc<Peer>,

    /// Our port (client port on clients, server port on servers).
    pub sport: Port,

    /// Port on `peer` that handles this RPC's packets.
    pub dport: Port,

    /// Socket that owns the RPC.
    pub sock: Weak<HomaSock>,

    pub inner: Mutex<RpcInner>,

    // Mirrors of inbound-message fields for the grant scheduler; see the
    // module comment. `msgin_length` holds MSGIN_UNINIT until the first
    // DATA packet arrives.
    pub msgin_length: AtomicUsize,
    pub bytes_remaining: AtomicUsize,
    pub incoming: AtomicUsize,

    /// Membership flags for the global lists.
    pub in_grantable: AtomicBool,
    pub in_throttled: AtomicBool,

    /// Timer ticks since the last packet arrived for this RPC.
    pub silent_ticks: AtomicU32,

    /// RESENDs issued since the last packet arrived for this RPC.
    pub num_resends: AtomicU32,

    /// Buffers held by msgin and msgout, for reap accounting.
    pub num_frames: AtomicUsize,
}

impl HomaRpc {
    pub(crate) fn new_client(
        sock: &Arc<HomaSock>,
        peer: Arc<Peer>,
        dport: Port,
        id: RpcId,
        msgout: MsgOut,
    ) -> Arc<Self> {
        let num_frames = msgout.frames.len();
        Arc::new(Self {
            id,
            is_client: true,
            peer,
            sport: sock.client_port(),
            dport,
            sock: Arc::downgrade(sock),
            inner: Mutex::new(RpcInner {
                state: RpcState::Outgoing,
                error: None,
                msgin: None,
                msgout: Some(msgout),
            }),
            msgin_length: AtomicUsize::new(MSGIN_UNINIT),
            bytes_remaining: AtomicUsize::new(0),
            incoming: AtomicUsize::new(0),
            in_grantable: AtomicBool::new(false),
            in_throttled: AtomicBool::new(false),
            silent_ticks: AtomicU32::new(0),
            num_resends: AtomicU32::new(0),
            num_frames: AtomicUsize::new(num_frames),
        })
    }

    pub(crate) fn new_server(
        sock: &Arc<HomaSock>,
        peer: Arc<Peer>,
        client_port: Port,
        id: RpcId,
        msgin: MsgIn,
    ) -> Arc<Self> {
        let length = msgin.total_length;
        let remaining = msgin.bytes_remaining;
        let incoming = msgin.incoming;
        Arc::new(Self {
            id,
            is_client: false,
            peer,
            sport: sock.server_port(),
            dport: client_port,
            sock: Arc::downgrade(sock),
            inner: Mutex::new(RpcInner {
                state: RpcState::Incoming,
                error: None,
                msgin: Some(msgin),
                msgout: None,
            }),
            msgin_length: AtomicUsize::new(length),
            bytes_remaining: AtomicUsize::new(remaining),
            incoming: AtomicUsize::new(incoming),
            in_grantable: AtomicBool::new(false),
            in_throttled: AtomicBool::new(false),
            silent_ticks: AtomicU32::new(0),
            num_resends: AtomicU32::new(0),
            num_frames: AtomicUsize::new(0),
        })
    }

    /// Header for a packet of the given type belonging to this RPC.
    #[inline]
    pub(crate) fn common(&self, pkt_type: PktType) -> CommonHeader {
        CommonHeader::new(self.sport, self.dport, pkt_type, self.id)
    }

    /// The remote endpoint of this RPC.
    #[inline]
    pub(crate) fn remote(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.peer.addr, self.dport)
    }

    /// Key under which a server RPC is hashed.
    #[inline]
    pub(crate) fn server_key(&self) -> (Ipv4Addr, Port, RpcId) {
        (self.peer.addr, self.dport, self.id)
    }

    /// Called whenever a packet arrives for this RPC: the peer is alive.
    #[inline]
    pub(crate) fn note_activity(&self) {
        self.silent_ticks.store(0, Ordering::Relaxed);
        self.num_resends.store(0, Ordering::Relaxed);
    }

    /// Refresh the scheduler-visible mirrors from the inbound message.
    /// Callers hold the RPC lock that protects `msgin`.
    pub(crate) fn sync_msgin_mirrors(&self, msgin: &MsgIn) {
        self.msgin_length
            .store(msgin.total_length, Ordering::Release);
        self.bytes_remaining
            .store(msgin.bytes_remaining, Ordering::Release);
        self.incoming.fetch_max(msgin.incoming, Ordering::AcqRel);
    }
}
