//! Interface to the host network stack.
//!
//! The transport core never opens sockets or touches the NIC directly; it
//! only needs a way to resolve a route to a destination and to hand fully
//! formed IP datagrams to an egress queue with a chosen priority. The
//! host-OS facade implements this trait; tests implement it with loopback
//! and capture drivers.

use std::io;
use std::net::Ipv4Addr;

use crate::type_alias::Priority;

/// Opaque route handle produced by [`Driver::route`].
///
/// Cached in the peer table for the lifetime of the process, so drivers
/// may hand out indices into internal routing state without refreshing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route(pub u64);

/// Host egress facade consumed by the transport core.
pub trait Driver: Send + Sync + 'static {
    /// Resolve a destination address into a route handle. Called once per
    /// peer; failures cause the triggering packet or send to be dropped.
    fn route(&self, daddr: Ipv4Addr) -> io::Result<Route>;

    /// Queue one datagram for transmission at the given egress priority.
    ///
    /// The datagram is a complete Homa packet (the IP header is the
    /// host's business). Errors are counted by the core and the packet is
    /// dropped; the transport recovers through its normal resend path.
    fn transmit(&self, route: Route, priority: Priority, datagram: &[u8]) -> io::Result<()>;
}
