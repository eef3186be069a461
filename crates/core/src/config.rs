//! Global configuration constants for the failover core.
//!
//! Timing parameters, filesystem names, and exit codes are defined here.
//! These are compile-time constants; runtime configuration (hostnames, the
//! secondary delay, the control port) is handled via CLI arguments and
//! environment variables in the server binary.

/// Interval in seconds between handshakes from the active server.
///
/// The active server both touches the liveness file and (when a secondary is
/// registered) sends a HANDSHAKE control message at this period.
pub const HANDSHAKE_PERIOD_SECS: u64 = 5;

/// The secondary declares handshakes lost after this many seconds of silence.
///
/// Twice the handshake period: one missed handshake is tolerated.
pub const HANDSHAKE_GRACE_SECS: u64 = 2 * HANDSHAKE_PERIOD_SECS;

/// Tick interval of the secondary state machine main loop.
pub const SECONDARY_TICK_SECS: u64 = 1;

/// Back-off before retrying after a failed dial or a failed fence attempt.
pub const RETRY_BACKOFF_SECS: u64 = 10;

/// Settle time after acknowledging SECD_TAKEOVER, giving the primary room to
/// finish its own teardown before the secondary starts taking over.
pub const TAKEOVER_SETTLE_SECS: u64 = 10;

/// Base grace period before an unreachable primary is considered gone.
///
/// The takeover deadline is `start + TAKEOVER_GRACE_SECS + secondary_delay`,
/// computed once at secondary startup.
pub const TAKEOVER_GRACE_SECS: u64 = 5 * 60;

/// Deadline for bounded dial attempts from the secondary.
pub const DIAL_TIMEOUT_SECS: u64 = 8;

/// Deadline for the primary's dial back to an active secondary at reclaim.
pub const RECLAIM_DIAL_TIMEOUT_SECS: u64 = 4;

/// Deadline for a single framed send on the control channel.
///
/// A send that exceeds this is *peer-lost*: the sender closes the channel
/// and treats the peer as down.
pub const SEND_TIMEOUT_SECS: u64 = 5;

/// Maximum wait for the replies that must be awaited: the acknowledgement of
/// PRIM_IS_BACK, SECD_SHUTDOWN, and SECD_GO_INACTIVE.
pub const REPLY_DEADLINE_SECS: u64 = 600;

/// Maximum wait for the peer to close the connection while INACT.
pub const INACTIVE_WAIT_SECS: u64 = 600;

/// Number of observed liveness-mtime advances (without a handshake) after
/// which the secondary abandons the degraded state and reconnects.
pub const LIVENESS_ADVANCE_RECONNECT_THRESHOLD: u32 = 4;

/// While degraded with an unreadable liveness file, a bounded dial is
/// attempted once per this many ticks.
pub const DEGRADED_DIAL_EVERY_TICKS: u64 = 3;

/// Default control-channel port.
pub const DEFAULT_CONTROL_PORT: u16 = 15001;

/// Name of the liveness file under the private directory.
pub const LIVENESS_FILE_NAME: &str = "svrlive";

/// Name of the active-marker file under the private directory.
pub const ACTIVE_MARKER_FILE_NAME: &str = "secondary_active";

/// Name of the license-fingerprint file under the private directory.
pub const LICENSE_FILE_NAME: &str = "license.fo";

/// Name of the optional fencing executable under the private directory.
pub const FENCE_SCRIPT_NAME: &str = "stonith";

/// Private state directory under the server home.
pub const PRIV_DIR_NAME: &str = "server_priv";

/// Spool directory under the server home (fence output captures).
pub const SPOOL_DIR_NAME: &str = "spool";

/// Exit code: clean shutdown.
pub const EXIT_CLEAN: i32 = 0;

/// Exit code: registration rejected, or the peer was unreachable at takeover.
pub const EXIT_PEER_REJECTED: i32 = 1;

/// Exit code: the active secondary refused to go idle during primary reclaim.
pub const EXIT_SECONDARY_NOT_IDLING: i32 = 2;

/// Exit code: displaced primary recycling itself for the process supervisor.
///
/// The supervisor restarts the binary, which then runs the
/// takeover-from-secondary sequence at startup.
pub const EXIT_RECYCLE: i32 = 3;
