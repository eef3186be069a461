//! Failover networking for the batchd server pair.
//!
//! The control channel carries framed failover messages between the primary
//! and the secondary. The primary side ([`primary`]) emits handshakes and
//! accepts registration; the secondary side ([`secondary`]) drives the pure
//! state machine from `batchd-core` against real sockets.

/// Control-channel handle: deadline dial, framed send, reader task.
pub mod channel;
/// Primary controller: handshake timer, REGISTER accept, reclaim.
pub mod primary;
/// Wire protocol: framed messages with JSON bodies.
pub mod proto;
/// Driver running the secondary state machine on the tokio runtime.
pub mod secondary;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Operator policy for what the secondary should do when the primary shuts
/// down cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Send SECD_SHUTDOWN: the secondary goes down with the primary.
    ShutdownSecondary,
    /// Send SECD_GO_INACTIVE: the secondary stays up but remains passive.
    LeaveInactive,
}

/// Shared failover state, visible to every task in the process.
#[derive(Clone)]
pub struct FailoverShared {
    inner: Arc<FailoverInner>,
}

struct FailoverInner {
    /// True while this process holds the active role.
    active: AtomicBool,
    /// True once a primary has seen the active-marker file and must recycle.
    displaced: AtomicBool,
}

impl FailoverShared {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FailoverInner {
                active: AtomicBool::new(false),
                displaced: AtomicBool::new(false),
            }),
        }
    }

    /// Returns `true` if this process currently holds the active role.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self) {
        self.inner.active.store(true, Ordering::Release);
    }

    pub fn clear_active(&self) {
        self.inner.active.store(false, Ordering::Release);
    }

    /// Returns `true` once this primary has observed it was displaced.
    pub fn is_displaced(&self) -> bool {
        self.inner.displaced.load(Ordering::Acquire)
    }

    pub fn set_displaced(&self) {
        self.inner.displaced.store(true, Ordering::Release);
    }
}

impl Default for FailoverShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock seconds, the currency of the state machine's timers.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
