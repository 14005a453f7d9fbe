//! Silence detection: RESEND issuance and RPC abort.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::HomaError;
use crate::metrics::Metrics;
use crate::rpc::{HomaRpc, RpcState};
use crate::sock::HomaSock;
use crate::transport::Homa;
use crate::wire::{self, PktType};

/// What the tick handler decided to do about one silent RPC.
enum TimeoutAction {
    Skip,

    /// The outbound side is done and nothing more is expected; the RPC
    /// dies quietly (servers whose response went out).
    Retire,

    /// Ask the peer for a missing inbound range.
    Resend { offset: usize, length: usize },

    /// Nothing to ask for, but show the peer we are alive.
    Busy,

    /// Every authorized byte arrived; silence means grants are owed.
    Regrant,
}

impl Homa {
    /// One tick of the transport timer (design target: every 1 ms).
    /// Walks every socket's active list, escalating from counting
    /// silence, to RESEND/BUSY probes, to aborting the RPC.
    pub fn timer_tick(self: &Arc<Self>) {
        let tick = self.timer_ticks.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        for sock in self.socktab().sockets() {
            if sock.is_shutdown() {
                continue;
            }
            let active: Vec<Arc<HomaRpc>> = sock.inner.lock().unwrap().active.clone();
            for rpc in active {
                self.check_rpc_silence(&sock, &rpc, tick);
            }
        }
    }

    fn check_rpc_silence(self: &Arc<Self>, sock: &Arc<HomaSock>, rpc: &Arc<HomaRpc>, tick: u32) {
        let config = self.config();

        let action = {
            let inner = rpc.inner.lock().unwrap();
            match inner.state {
                // Nothing is expected from the network in these states.
                RpcState::Ready | RpcState::InService | RpcState::ClientDone => TimeoutAction::Skip,
                _ => {
                    let silent = rpc.silent_ticks.fetch_add(1, Ordering::Relaxed) + 1;
                    if silent < config.resend_ticks {
                        TimeoutAction::Skip
                    } else if !rpc.is_client
                        && matches!(inner.state, RpcState::Outgoing)
                        && inner
                            .msgout
                            .as_ref()
                            .is_some_and(|out| out.is_fully_sent() && out.is_fully_granted())
                    {
                        // The response is fully out and the client has
                        // gone quiet: it got everything.
                        TimeoutAction::Retire
                    } else {
                        match &inner.msgin {
                            Some(msgin) if !msgin.is_complete() => {
                                let authorized = msgin
                                    .incoming
                                    .max(rpc.incoming.load(Ordering::Relaxed));
                                let (offset, length) = msgin.resend_range(authorized);
                                if length == 0 {
                                    TimeoutAction::Regrant
                                } else {
                                    TimeoutAction::Resend { offset, length }
                                }
                            }
                            Some(_) => TimeoutAction::Busy,
                            // Client waiting for the first response byte:
                            // ask for the opening window. Servers still
                            // granting the request land in Resend above.
                            None if rpc.is_client
                                && inner
                                    .msgout
                                    .as_ref()
                                    .is_some_and(|out| out.is_fully_sent()) =>
                            {
                                TimeoutAction::Resend {
                                    offset: 0,
                                    length: config.rtt_bytes,
                                }
                            }
                            None => TimeoutAction::Busy,
                        }
                    }
                }
            }
        };

        match action {
            TimeoutAction::Skip => {}
            TimeoutAction::Retire => {
                sock.free_rpc(self, rpc);
            }
            TimeoutAction::Regrant => {
                self.manage_grants(rpc);
            }
            TimeoutAction::Resend { offset, length } => {
                if !self.peer_resend_allowed(rpc, tick) {
                    return;
                }
                let num_resends = rpc.num_resends.fetch_add(1, Ordering::Relaxed) + 1;
                if num_resends >= config.abort_resends {
                    self.abort_timed_out(sock, rpc);
                    return;
                }
                let priority = config.max_prio;
                self.xmit_control(
                    rpc,
                    PktType::Resend,
                    wire::build_resend(
                        rpc.common(PktType::Resend),
                        offset as u32,
                        length as u32,
                        priority,
                    ),
                );
            }
            TimeoutAction::Busy => {
                if !self.peer_resend_allowed(rpc, tick) {
                    return;
                }
                let num_resends = rpc.num_resends.fetch_add(1, Ordering::Relaxed) + 1;
                if num_resends >= config.abort_resends {
                    self.abort_timed_out(sock, rpc);
                    return;
                }
                self.xmit_control(
                    rpc,
                    PktType::Busy,
                    wire::build_control(rpc.common(PktType::Busy)),
                );
            }
        }
    }

    /// Rate-limit probes per peer: one RESEND/BUSY every
    /// `resend_interval` ticks across all of the peer's RPCs.
    fn peer_resend_allowed(&self, rpc: &HomaRpc, tick: u32) -> bool {
        let interval = self.config().resend_interval;
        let stamp = tick.wrapping_add(1); // 0 means "never"
        let last = rpc.peer.last_resend_tick.load(Ordering::Relaxed);
        if last != 0 && stamp.wrapping_sub(last) < interval {
            return false;
        }
        rpc.peer
            .last_resend_tick
            .compare_exchange(last, stamp, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    fn abort_timed_out(self: &Arc<Self>, sock: &Arc<HomaSock>, rpc: &Arc<HomaRpc>) {
        let m = self.metrics_registry().shard();
        if rpc.is_client {
            Metrics::inc(&m.client_rpc_timeouts);
            log::warn!(
                "aborting client RPC {} to {} after repeated resends",
                rpc.id,
                rpc.peer.addr
            );
        } else {
            Metrics::inc(&m.server_rpc_timeouts);
            log::warn!(
                "discarding server RPC {} from {} after repeated resends",
                rpc.id,
                rpc.peer.addr
            );
        }
        sock.abort_rpc(self, rpc, HomaError::Timeout);
    }
}
