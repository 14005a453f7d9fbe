//! Mock drivers for whole-stack tests: a capture driver that records
//! every transmitted datagram, and a loopback network that shuttles
//! datagrams between transport instances on a pump thread (delivering
//! synchronously would re-enter the receiving instance on the sender's
//! stack).

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread;

use crate::driver::{Driver, Route};
use crate::transport::Homa;
use crate::type_alias::*;
use crate::wire::{self, Packet, PktType};

fn route_of(addr: Ipv4Addr) -> Route {
    Route(u32::from(addr) as u64)
}

fn addr_of(route: Route) -> Ipv4Addr {
    Ipv4Addr::from(route.0 as u32)
}

/// One recorded transmission.
pub(crate) struct SentPacket {
    pub dst: Ipv4Addr,
    pub priority: Priority,
    pub datagram: Vec<u8>,
}

impl SentPacket {
    pub(crate) fn pkt_type(&self) -> PktType {
        wire::parse(&self.datagram).unwrap().common().pkt_type
    }
}

/// A driver that records everything and delivers nothing.
pub(crate) struct CaptureDriver {
    pub sent: Mutex<Vec<SentPacket>>,
}

impl CaptureDriver {
    /// Returns the typed handle plus the erased clone to hand to
    /// [`Homa::new`].
    pub(crate) fn shared() -> (Arc<CaptureDriver>, Arc<dyn Driver>) {
        let driver = Arc::new(CaptureDriver {
            sent: Mutex::new(Vec::new()),
        });
        (driver.clone(), driver)
    }

    pub(crate) fn count(&self, pkt_type: PktType) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.pkt_type() == pkt_type)
            .count()
    }

    /// All GRANTs sent so far, as `(id, offset, priority)` in order.
    pub(crate) fn grants(&self) -> Vec<(RpcId, u32, Priority)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| match wire::parse(&p.datagram).unwrap() {
                Packet::Grant {
                    common,
                    offset,
                    priority,
                } => Some((common.id, offset, priority)),
                _ => None,
            })
            .collect()
    }

    /// First-segment offsets of DATA packets, with their retransmit flag.
    pub(crate) fn data_frames(&self) -> Vec<(u32, bool)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| match wire::parse(&p.datagram).unwrap() {
                Packet::Data {
                    retransmit,
                    segments,
                    ..
                } => Some((segments[0].offset, retransmit)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl Driver for CaptureDriver {
    fn route(&self, daddr: Ipv4Addr) -> io::Result<Route> {
        Ok(route_of(daddr))
    }

    fn transmit(&self, route: Route, priority: Priority, datagram: &[u8]) -> io::Result<()> {
        self.sent.lock().unwrap().push(SentPacket {
            dst: addr_of(route),
            priority,
            datagram: datagram.to_vec(),
        });
        Ok(())
    }
}

type DropFilter = Box<dyn FnMut(Ipv4Addr, &[u8]) -> bool + Send>;

struct NetInner {
    nodes: Mutex<HashMap<Ipv4Addr, Arc<Homa>>>,

    /// Returns true to drop the datagram (loss injection).
    drop_filter: Mutex<Option<DropFilter>>,

    /// Every datagram that reached the wire: (src, dst, type code).
    log: Mutex<Vec<(Ipv4Addr, Ipv4Addr, u8)>>,
}

/// A loopback network connecting transport instances in one process.
pub(crate) struct TestNet {
    inner: Arc<NetInner>,
    tx: mpsc::Sender<(Ipv4Addr, Ipv4Addr, Vec<u8>)>,
}

struct LoopbackDriver {
    addr: Ipv4Addr,
    tx: mpsc::Sender<(Ipv4Addr, Ipv4Addr, Vec<u8>)>,
}

impl Driver for LoopbackDriver {
    fn route(&self, daddr: Ipv4Addr) -> io::Result<Route> {
        Ok(route_of(daddr))
    }

    fn transmit(&self, route: Route, _priority: Priority, datagram: &[u8]) -> io::Result<()> {
        self.tx
            .send((self.addr, addr_of(route), datagram.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "network stopped"))
    }
}

impl TestNet {
    pub(crate) fn new() -> Self {
        let inner = Arc::new(NetInner {
            nodes: Mutex::new(HashMap::new()),
            drop_filter: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::channel::<(Ipv4Addr, Ipv4Addr, Vec<u8>)>();

        let weak: Weak<NetInner> = Arc::downgrade(&inner);
        thread::spawn(move || {
            while let Ok((src, dst, datagram)) = rx.recv() {
                let Some(net) = weak.upgrade() else { return };
                if let Some(filter) = net.drop_filter.lock().unwrap().as_mut() {
                    if filter(dst, &datagram) {
                        continue;
                    }
                }
                net.log.lock().unwrap().push((src, dst, datagram[13]));
                let node = net.nodes.lock().unwrap().get(&dst).cloned();
                if let Some(node) = node {
                    node.pkt_dispatch(src, &datagram);
                }
            }
        });

        Self { inner, tx }
    }

    /// Driver for a node at `addr`; pass to [`Homa::new`], then
    /// [`TestNet::register`] the instance.
    pub(crate) fn driver(&self, addr: Ipv4Addr) -> Arc<dyn Driver> {
        Arc::new(LoopbackDriver {
            addr,
            tx: self.tx.clone(),
        })
    }

    pub(crate) fn register(&self, addr: Ipv4Addr, homa: &Arc<Homa>) {
        self.inner.nodes.lock().unwrap().insert(addr, homa.clone());
    }

    /// Detach a node (simulates a crash; packets to it vanish).
    pub(crate) fn unregister(&self, addr: Ipv4Addr) {
        self.inner.nodes.lock().unwrap().remove(&addr);
    }

    pub(crate) fn set_drop_filter(
        &self,
        filter: impl FnMut(Ipv4Addr, &[u8]) -> bool + Send + 'static,
    ) {
        *self.inner.drop_filter.lock().unwrap() = Some(Box::new(filter));
    }

    /// Count of delivered-or-logged packets with the given type code.
    pub(crate) fn count(&self, pkt_type: PktType) -> usize {
        self.inner
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, t)| *t == pkt_type as u8)
            .count()
    }
}
