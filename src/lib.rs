//! A receiver-driven, low-tail-latency datagram RPC transport.
//!
//! Homa delivers discrete request/response messages (up to ~1 MB) over a
//! lossy best-effort network. Receivers drive the schedule: senders blast
//! one RTT of *unscheduled* bytes and then wait for GRANTs, which the
//! receiver hands out in shortest-remaining-first order across everything
//! it is receiving. A link-rate pacer keeps the NIC queue shallow, and a
//! tick-driven timer recovers from loss and dead peers with RESEND /
//! RESTART probes.
//!
//! The crate is the protocol engine only: it consumes a [`Driver`] for
//! egress and routing, and the host facade feeds received datagrams to
//! [`Homa::pkt_dispatch`].

mod config;
mod dispatch;
mod driver;
mod error;
mod grant;
mod metrics;
mod msgin;
mod msgout;
mod pacer;
mod peer;
mod rpc;
mod sock;
mod socktab;
mod timer;
mod transport;
pub mod type_alias;
mod util;
mod wire;

pub use self::config::HomaConfig;
pub use self::driver::{Driver, Route};
pub use self::error::{HomaError, Result};
pub use self::metrics::MetricsSnapshot;
pub use self::sock::{HomaSock, PollEvents, RecvFlags, RecvMsg};
pub use self::transport::Homa;
pub use self::wire::{MAX_MESSAGE_SIZE, NUM_PRIORITIES};

#[cfg(test)]
mod tests;
