//! Error types surfaced to users of the transport.

use thiserror::Error;

use crate::type_alias::*;

/// Errors returned by user-visible transport operations, and stored in the
/// error slot of failed client RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HomaError {
    /// The RPC was aborted after too many unanswered RESENDs.
    #[error("RPC timed out")]
    Timeout,

    /// The socket has been shut down; all of its RPCs are aborted.
    #[error("socket has been shut down")]
    Shutdown,

    /// A non-blocking receive found no ready message.
    #[error("operation would block")]
    WouldBlock,

    /// The message exceeds the largest size the protocol carries.
    #[error("message length {0} exceeds the maximum message size")]
    MessageTooLong(usize),

    /// `bind` was given a port outside the server-port range.
    #[error("port {0} is not a valid server port")]
    InvalidPort(Port),

    /// `bind` was given a port that another socket already owns.
    #[error("port {0} is already in use")]
    PortInUse(Port),

    /// The RPC id does not name a live RPC on this socket.
    #[error("no such RPC")]
    UnknownRpc,

    /// No route to the destination, or the peer was reported dead.
    #[error("destination unreachable")]
    Unreachable,

    /// Every ephemeral client port is taken.
    #[error("no ephemeral ports available")]
    OutOfPorts,

    /// A tunable parameter has an out-of-range value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, HomaError>;
