//! Per-datagram demultiplexing into state-machine transitions.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::metrics::Metrics;
use crate::msgin::{MsgIn, SegmentAdd};
use crate::rpc::{HomaRpc, RpcState};
use crate::sock::HomaSock;
use crate::transport::Homa;
use crate::type_alias::*;
use crate::wire::{self, CommonHeader, DataSegment, Packet, PktType, MIN_PACKET_LEN};

impl Homa {
    /// Entry point for received datagrams: the host facade calls this for
    /// every Homa packet it pulls off the wire.
    pub fn pkt_dispatch(self: &Arc<Self>, saddr: Ipv4Addr, datagram: &[u8]) {
        let metrics = self.metrics_registry().shard();
        if datagram.len() < MIN_PACKET_LEN {
            Metrics::inc(&metrics.short_packets);
            return;
        }
        let packet = match wire::parse(datagram) {
            Ok(packet) => packet,
            Err(wire::WireError::Short { .. }) => {
                Metrics::inc(&metrics.short_packets);
                return;
            }
            Err(wire::WireError::UnknownType(t)) => {
                log::debug!("dropping packet with unknown type {} from {}", t, saddr);
                Metrics::inc(&metrics.unknown_packet_types);
                return;
            }
        };
        let common = *packet.common();
        metrics.pkt_received(common.pkt_type);

        // Peer-level packets need no socket or RPC.
        match &packet {
            Packet::Cutoffs {
                cutoffs, version, ..
            } => {
                if let Some(peer) = self.find_peer(saddr) {
                    peer.set_cutoffs(*cutoffs, *version);
                }
                return;
            }
            Packet::Freeze { .. } => {
                log::debug!("FREEZE received from {}", saddr);
                return;
            }
            _ => {}
        }

        let Some(sock) = self.socktab().find(common.dport) else {
            Metrics::inc(&metrics.unknown_rpcs);
            return;
        };
        if sock.is_shutdown() {
            return;
        }
        let for_server = common.dport == sock.server_port();

        match packet {
            Packet::Data {
                message_length,
                incoming,
                cutoff_version,
                segments,
                ..
            } => {
                let rpc = if for_server {
                    self.find_or_create_server_rpc(
                        &sock,
                        saddr,
                        &common,
                        message_length,
                        incoming,
                    )
                } else {
                    sock.find_client_rpc(common.id)
                };
                let Some(rpc) = rpc else {
                    Metrics::inc(&self.metrics_registry().shard().unknown_rpcs);
                    return;
                };
                rpc.note_activity();
                self.data_pkt(&sock, &rpc, message_length, incoming, cutoff_version, &segments);
            }
            Packet::Grant {
                offset, priority, ..
            } => {
                let Some(rpc) = lookup(&sock, saddr, &common, for_server) else {
                    Metrics::inc(&self.metrics_registry().shard().unknown_rpcs);
                    return;
                };
                rpc.note_activity();
                self.grant_pkt(&rpc, offset as usize, priority);
            }
            Packet::Resend {
                offset,
                length,
                priority,
                ..
            } => {
                let Some(rpc) = lookup(&sock, saddr, &common, for_server) else {
                    if for_server {
                        // The server has no trace of this RPC (it may
                        // have restarted); tell the client to start over.
                        self.xmit_restart(saddr, &common);
                    } else {
                        Metrics::inc(&self.metrics_registry().shard().unknown_rpcs);
                    }
                    return;
                };
                rpc.note_activity();
                self.resend_pkt(&rpc, offset as usize, length as usize, priority);
            }
            Packet::Restart { .. } => {
                let Some(rpc) = (!for_server)
                    .then(|| sock.find_client_rpc(common.id))
                    .flatten()
                else {
                    Metrics::inc(&self.metrics_registry().shard().unknown_rpcs);
                    return;
                };
                rpc.note_activity();
                self.restart_pkt(&rpc);
            }
            Packet::Busy { .. } => {
                let Some(rpc) = lookup(&sock, saddr, &common, for_server) else {
                    if for_server {
                        self.xmit_restart(saddr, &common);
                    } else {
                        Metrics::inc(&self.metrics_registry().shard().unknown_rpcs);
                    }
                    return;
                };
                rpc.note_activity();
            }
            Packet::Cutoffs { .. } | Packet::Freeze { .. } => unreachable!("handled above"),
        }

        self.check_pacer();
    }

    /// Find the server RPC for an incoming DATA packet, creating it in
    /// INCOMING state on first contact.
    fn find_or_create_server_rpc(
        self: &Arc<Self>,
        sock: &Arc<HomaSock>,
        saddr: Ipv4Addr,
        common: &CommonHeader,
        message_length: u32,
        incoming: u32,
    ) -> Option<Arc<HomaRpc>> {
        let key = (saddr, common.sport, common.id);
        if let Some(rpc) = sock.find_server_rpc(key) {
            return Some(rpc);
        }
        let Some(peer) = self.find_peer(saddr) else {
            Metrics::inc(&self.metrics_registry().shard().server_cant_create_rpcs);
            return None;
        };
        let msgin = MsgIn::new(message_length as usize, incoming as usize);
        let rpc = HomaRpc::new_server(sock, peer, common.sport, common.id, msgin);
        Some(sock.insert_server_rpc(rpc))
    }

    /// DATA: feed the reassembler, publish grants, detect completion.
    fn data_pkt(
        self: &Arc<Self>,
        sock: &Arc<HomaSock>,
        rpc: &Arc<HomaRpc>,
        message_length: u32,
        incoming: u32,
        cutoff_version: u16,
        segments: &[DataSegment<'_>],
    ) {
        let (completed, scheduled) = {
            let mut guard = rpc.inner.lock().unwrap();
            let inner = &mut *guard;
            match inner.state {
                RpcState::ClientDone => return,
                RpcState::Outgoing if rpc.is_client => {
                    // First byte of the response: the request is
                    // implicitly complete at the server.
                    inner.state = RpcState::Incoming;
                }
                _ => {}
            }
            if inner.msgin.is_none() {
                // Client side, first response DATA.
                inner.msgin = Some(MsgIn::new(message_length as usize, incoming as usize));
            }
            let was_complete = inner.msgin.as_ref().unwrap().is_complete();
            let msgin = inner.msgin.as_mut().unwrap();
            for seg in segments {
                match msgin.add_segment(seg.offset as usize, seg.data) {
                    SegmentAdd::Added => {
                        rpc.num_frames.fetch_add(1, Ordering::Relaxed);
                    }
                    SegmentAdd::Duplicate => {}
                    SegmentAdd::OutOfRange => {
                        Metrics::inc(&self.metrics_registry().shard().short_packets);
                    }
                }
            }
            msgin.note_incoming(incoming as usize);
            rpc.sync_msgin_mirrors(msgin);
            let completed = !was_complete
                && msgin.is_complete()
                && matches!(inner.state, RpcState::Incoming);
            (completed, msgin.scheduled)
        };

        // If the sender's view of our cutoffs is stale, refresh it.
        if cutoff_version != self.cutoff_version() {
            self.maybe_send_cutoffs(rpc);
        }

        if completed {
            self.remove_from_grantable(rpc);
            let m = self.metrics_registry().shard();
            if rpc.is_client {
                Metrics::inc(&m.responses_received);
            } else {
                Metrics::inc(&m.requests_received);
            }
            sock.rpc_ready(rpc);
        } else if scheduled {
            self.manage_grants(rpc);
        }
    }

    /// GRANT: advance the send authorization, monotonically.
    fn grant_pkt(self: &Arc<Self>, rpc: &Arc<HomaRpc>, offset: usize, priority: Priority) {
        let has_more = {
            let mut inner = rpc.inner.lock().unwrap();
            let Some(out) = inner.msgout.as_mut() else {
                return;
            };
            out.grant(offset, priority);
            out.next_offset() < out.granted
        };
        if has_more {
            self.xmit_data(rpc, false);
        }
    }

    /// RESEND: retransmit the requested range, or assert liveness with
    /// BUSY when there is nothing (yet) to retransmit.
    fn resend_pkt(
        self: &Arc<Self>,
        rpc: &Arc<HomaRpc>,
        offset: usize,
        length: usize,
        priority: Priority,
    ) {
        if !self.resend_data(rpc, offset, length, priority) {
            self.xmit_control(
                rpc,
                PktType::Busy,
                wire::build_control(rpc.common(PktType::Busy)),
            );
        }
    }

    /// RESTART: the server lost its state for this RPC. Discard any
    /// partial response and transmit the request again from the start,
    /// under the same id.
    fn restart_pkt(self: &Arc<Self>, rpc: &Arc<HomaRpc>) {
        self.remove_from_grantable(rpc);
        {
            let mut guard = rpc.inner.lock().unwrap();
            let inner = &mut *guard;
            if inner.state == RpcState::ClientDone {
                return;
            }
            if let Some(msgin) = inner.msgin.take() {
                rpc.num_frames
                    .fetch_sub(msgin.num_segments(), Ordering::Relaxed);
            }
            rpc.msgin_length
                .store(crate::rpc::MSGIN_UNINIT, Ordering::Release);
            rpc.bytes_remaining.store(0, Ordering::Release);
            rpc.incoming.store(0, Ordering::Release);
            let Some(out) = inner.msgout.as_mut() else {
                return;
            };
            out.reset();
            inner.state = RpcState::Outgoing;
        }
        self.xmit_data(rpc, false);
    }

    /// Tell a client that its RPC is unknown here.
    fn xmit_restart(&self, saddr: Ipv4Addr, received: &CommonHeader) {
        let Some(peer) = self.find_peer(saddr) else {
            return;
        };
        let common = CommonHeader::new(
            received.dport,
            received.sport,
            PktType::Restart,
            received.id,
        );
        self.xmit_control_to(&peer, PktType::Restart, wire::build_control(common));
    }
}

/// Look up the RPC a non-DATA packet refers to.
fn lookup(
    sock: &Arc<HomaSock>,
    saddr: Ipv4Addr,
    common: &CommonHeader,
    for_server: bool,
) -> Option<Arc<HomaRpc>> {
    if for_server {
        sock.find_server_rpc((saddr, common.sport, common.id))
    } else {
        sock.find_client_rpc(common.id)
    }
}

