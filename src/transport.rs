//! The transport instance: global state and the transmit paths.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use quanta::Clock;

use crate::config::HomaConfig;
use crate::driver::Driver;
use crate::error::{HomaError, Result};
use crate::grant::GrantState;
use crate::metrics::{Metrics, MetricsRegistry, MetricsSnapshot};
use crate::pacer::Pacer;
use crate::peer::{Peer, PeerTab};
use crate::rpc::HomaRpc;
use crate::sock::HomaSock;
use crate::socktab::SockTab;
use crate::wire::{self, PktType, NUM_PRIORITIES};

/// Design target for the timer tick period.
const TIMER_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// An instance of the transport.
///
/// Owns all global state: the socket and peer tables, the grant
/// scheduler, the pacer, and the metrics. The host facade feeds received
/// datagrams into [`Homa::pkt_dispatch`] and either calls
/// [`Homa::start`] for background pacing/timing or drives
/// [`Homa::timer_tick`] itself.
pub struct Homa {
    config: HomaConfig,
    driver: Arc<dyn Driver>,
    clock: Clock,
    epoch: u64,

    socktab: SockTab,
    peers: PeerTab,
    grantable: Mutex<GrantState>,
    pacer: Pacer,

    /// Cutoff vector published to peers for their unscheduled traffic.
    cutoffs: Mutex<[u32; NUM_PRIORITIES]>,

    /// Bumped by the prios-changed hook; peers refresh when their DATA
    /// packets echo an older version.
    cutoff_version: AtomicU16,

    /// Number of timer ticks so far; wraparound is harmless.
    pub(crate) timer_ticks: AtomicU32,

    metrics: MetricsRegistry,

    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Homa {
    /// Create a transport instance over the given driver.
    pub fn new(config: HomaConfig, driver: Arc<dyn Driver>) -> Result<Arc<Self>> {
        Self::with_clock(config, driver, Clock::new())
    }

    /// As [`Homa::new`], with an injected clock (tests use a mock).
    pub(crate) fn with_clock(
        config: HomaConfig,
        driver: Arc<dyn Driver>,
        clock: Clock,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let epoch = clock.raw();
        Ok(Arc::new(Self {
            pacer: Pacer::new(&config),
            cutoffs: Mutex::new(config.unsched_cutoffs),
            cutoff_version: AtomicU16::new(config.cutoff_version),
            config,
            driver,
            clock,
            epoch,
            socktab: SockTab::new(),
            peers: PeerTab::new(),
            grantable: Mutex::new(GrantState::new()),
            timer_ticks: AtomicU32::new(0),
            metrics: MetricsRegistry::new(),
            threads: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the pacer thread and the periodic timer. Threads hold weak
    /// references and exit when the instance is dropped or [`stop`]ped.
    ///
    /// [`stop`]: Homa::stop
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock().unwrap();

        let weak: Weak<Homa> = Arc::downgrade(self);
        threads.push(
            thread::Builder::new()
                .name("homa-pacer".into())
                .spawn(move || loop {
                    let Some(homa) = weak.upgrade() else {
                        return;
                    };
                    if homa.pacer.exit.load(Ordering::Acquire) {
                        return;
                    }
                    homa.pacer_iteration();
                })
                .expect("failed to spawn pacer thread"),
        );

        let weak: Weak<Homa> = Arc::downgrade(self);
        threads.push(
            thread::Builder::new()
                .name("homa-timer".into())
                .spawn(move || loop {
                    thread::sleep(TIMER_TICK_INTERVAL);
                    let Some(homa) = weak.upgrade() else {
                        return;
                    };
                    if homa.pacer.exit.load(Ordering::Acquire) {
                        return;
                    }
                    homa.timer_tick();
                })
                .expect("failed to spawn timer thread"),
        );
    }

    /// Stop background threads and wait for them.
    pub fn stop(&self) {
        self.pacer.stop();
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }

    /// Open a socket bound to a fresh ephemeral client port.
    pub fn socket(self: &Arc<Self>) -> Result<Arc<HomaSock>> {
        let port = self.socktab.alloc_client_port()?;
        let sock = HomaSock::new(self, port);
        self.socktab.claim_client(port, &sock)?;
        Ok(sock)
    }

    /// Abort every client RPC addressed to `daddr` with `error`; the host
    /// facade calls this on ICMP destination failures.
    pub fn peer_abort(self: &Arc<Self>, daddr: Ipv4Addr, error: HomaError) {
        for sock in self.socktab.sockets() {
            let rpcs: Vec<Arc<HomaRpc>> = {
                let inner = sock.inner.lock().unwrap();
                inner
                    .client_rpcs
                    .values()
                    .filter(|r| r.peer.addr == daddr)
                    .cloned()
                    .collect()
            };
            for rpc in rpcs {
                sock.abort_rpc(self, &rpc, error);
            }
        }
    }

    /// Install a new unscheduled-cutoff vector: the prios-changed hook.
    /// Peers pick the change up on their next contact.
    pub fn set_unsched_cutoffs(&self, cutoffs: [u32; NUM_PRIORITIES]) {
        *self.cutoffs.lock().unwrap() = cutoffs;
        self.cutoff_version.fetch_add(1, Ordering::AcqRel);
    }

    /// A point-in-time sum of the performance counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    #[inline]
    pub(crate) fn config(&self) -> &HomaConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn socktab(&self) -> &SockTab {
        &self.socktab
    }

    #[inline]
    pub(crate) fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    #[inline]
    pub(crate) fn grantable(&self) -> &Mutex<GrantState> {
        &self.grantable
    }

    #[inline]
    pub(crate) fn metrics_registry(&self) -> &MetricsRegistry {
        &self.metrics
    }

    #[inline]
    pub(crate) fn cutoff_version(&self) -> u16 {
        self.cutoff_version.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn current_cutoffs(&self) -> [u32; NUM_PRIORITIES] {
        *self.cutoffs.lock().unwrap()
    }

    /// Monotonic nanoseconds since this instance was created.
    #[inline]
    pub(crate) fn now_ns(&self) -> u64 {
        self.clock.delta_as_nanos(self.epoch, self.clock.raw())
    }

    pub(crate) fn find_peer(&self, addr: Ipv4Addr) -> Option<Arc<Peer>> {
        self.peers.find(addr, &*self.driver, &self.metrics)
    }

    /// Transmit one control packet for an RPC. Control packets are never
    /// paced and go out at the top of the priority band.
    pub(crate) fn xmit_control(&self, rpc: &HomaRpc, pkt_type: PktType, datagram: Vec<u8>) {
        self.xmit_control_to(&rpc.peer, pkt_type, datagram);
    }

    pub(crate) fn xmit_control_to(&self, peer: &Peer, pkt_type: PktType, datagram: Vec<u8>) {
        match self
            .driver
            .transmit(peer.route, self.config.max_prio, &datagram)
        {
            Ok(()) => self.metrics.shard().pkt_sent(pkt_type),
            Err(e) => {
                log::debug!(
                    "failed to transmit {:?} packet to {}: {}",
                    pkt_type,
                    peer.addr,
                    e
                );
                Metrics::inc(&self.metrics.shard().control_xmit_errors);
            }
        }
    }

    /// Transmit the sendable frames of an RPC's outbound message: frames
    /// before `granted`, gated by the NIC queue estimate. When the gate
    /// closes the RPC parks on the throttled list for the pacer.
    pub(crate) fn xmit_data(&self, rpc: &Arc<HomaRpc>, from_pacer: bool) {
        let mut sent_any = false;
        {
            let mut inner = rpc.inner.lock().unwrap();
            let Some(out) = inner.msgout.as_mut() else {
                return;
            };
            while !out.is_fully_sent() {
                let frame = &out.frames[out.next];
                // A 0-byte message still sends its one empty frame.
                if frame.data_len > 0 && frame.offset >= out.granted {
                    break;
                }
                let wire_len = frame.wire_len();
                if !self.pacer.bypasses_throttle(wire_len) {
                    // The pacer forces its first frame through so the
                    // pump always makes progress.
                    let force = from_pacer && !sent_any;
                    if !self.pacer.check_nic_queue(self.now_ns(), wire_len, force) {
                        self.pacer.add_throttled(rpc);
                        return;
                    }
                }
                let priority = if frame.offset < out.unscheduled {
                    rpc.peer
                        .unsched_priority(self.config.max_prio, out.length)
                } else {
                    out.sched_priority
                };
                match self.driver.transmit(rpc.peer.route, priority, &frame.datagram) {
                    Ok(()) => self.metrics.shard().pkt_sent(PktType::Data),
                    Err(e) => {
                        log::debug!(
                            "failed to transmit DATA packet to {}: {}",
                            rpc.peer.addr,
                            e
                        );
                        Metrics::inc(&self.metrics.shard().data_xmit_errors);
                    }
                }
                out.next += 1;
                sent_any = true;
            }
        }
        // Nothing sendable remains (sent out, or waiting on grants);
        // drop out of the pacer's round-robin.
        self.pacer.remove_throttled(rpc);
    }

    /// Retransmit the frames overlapping `[offset, offset + length)` at
    /// the requested priority, flagged as retransmissions. Returns false
    /// if there is no outbound message to resend from.
    pub(crate) fn resend_data(
        &self,
        rpc: &Arc<HomaRpc>,
        offset: usize,
        length: usize,
        priority: u8,
    ) -> bool {
        let inner = rpc.inner.lock().unwrap();
        let Some(out) = inner.msgout.as_ref() else {
            return false;
        };
        // Only data we have already handed to the network can be lost;
        // anything beyond the send cursor will go out in due course.
        let resend_end = out.next_offset();
        let mut resent = false;
        for frame in out.frames_in_range(offset, length) {
            if frame.offset >= resend_end {
                break;
            }
            match self
                .driver
                .transmit(rpc.peer.route, priority, &frame.retransmit_copy())
            {
                Ok(()) => {
                    self.metrics.shard().pkt_sent(PktType::Data);
                    Metrics::inc(&self.metrics.shard().resent_packets);
                }
                Err(e) => {
                    log::debug!(
                        "failed to retransmit DATA packet to {}: {}",
                        rpc.peer.addr,
                        e
                    );
                    Metrics::inc(&self.metrics.shard().data_xmit_errors);
                }
            }
            resent = true;
        }
        resent
    }

    /// Send our cutoff vector back along an RPC, rate-limited per peer.
    /// Called when the RPC's DATA packets echo a stale version.
    pub(crate) fn maybe_send_cutoffs(&self, rpc: &HomaRpc) {
        const CUTOFFS_REFRESH_TICKS: u32 = 1000;

        let peer = &rpc.peer;
        let tick = self.timer_ticks.load(Ordering::Relaxed);
        let stamp = tick.wrapping_add(1); // 0 means "never sent"
        let last = peer.last_cutoffs_sent_tick.load(Ordering::Relaxed);
        if last != 0 && stamp.wrapping_sub(last) < CUTOFFS_REFRESH_TICKS {
            return;
        }
        if peer
            .last_cutoffs_sent_tick
            .compare_exchange(last, stamp, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let datagram = wire::build_cutoffs(
            rpc.common(PktType::Cutoffs),
            &self.current_cutoffs(),
            self.cutoff_version(),
        );
        self.xmit_control(rpc, PktType::Cutoffs, datagram);
    }
}
