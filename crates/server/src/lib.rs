//! batchd-server — network side of the batchd failover pair.
//!
//! Provides the framed control channel, the primary controller, and the
//! driver that runs the secondary state machine against real sockets.
//! The runtime-free machine itself lives in `batchd-core`.

/// Failover networking: wire protocol, control channel, primary controller,
/// secondary driver, and the process-wide shared failover state.
pub mod failover;
