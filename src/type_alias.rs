//! Type aliases used in this library.

/// [`u64`]: RPC identifier.
/// Unique among all RPCs issued from the same client port.
pub type RpcId = u64;

/// [`u16`]: Homa port number (client or server).
pub type Port = u16;

/// [`u8`]: In-network priority level. Larger numbers are higher priorities.
pub type Priority = u8;
