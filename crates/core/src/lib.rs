//! # batchd-core
//!
//! Runtime-free coordination core for the batchd primary/secondary failover
//! pair. One server of the pair is *active* and serves the batch queue; the
//! other is a warm standby that watches for loss of the active peer and
//! assumes the role when the peer is gone.
//!
//! This crate holds everything that can be exercised without a socket: the
//! secondary state machine (events in, actions out), the liveness-file and
//! active-marker protocols on shared storage, the license-fingerprint
//! persistence, and the fencing hook. The tokio side (the control channel,
//! the primary controller, and the driver that runs the machine against real
//! connections) lives in `batchd-server`.

/// Compile-time tuning constants: periods, deadlines, back-offs, exit codes.
pub mod config;
/// Failover roles, control-message kinds, reply codes, and the secondary state machine.
pub mod failover;
/// Fencing (STONITH) hook behind a trait, with the script-invoking production impl.
pub mod fence;
/// License fingerprint: host identifiers, XOR, and `license.fo` persistence.
pub mod license;
/// Liveness file: periodic mtime touch and skew-robust observation.
pub mod liveness;
/// Active-marker file created by a promoted secondary.
pub mod marker;
/// Filesystem layout under the server home directory.
pub mod paths;
