//! Failover roles, control-message vocabulary, and the secondary state
//! machine.
//!
//! The machine in [`machine`] is pure: it consumes enumerated events and
//! returns an action list, so every transition of the failover protocol can
//! be unit-tested with no sockets, no clock, and no filesystem.

pub mod machine;

/// Which half of the pair this process was started as. Fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Secondary => write!(f, "secondary"),
        }
    }
}

/// Authentication mode of the control-channel transport.
///
/// The transport's credential exchange is outside this crate; the mode is
/// carried on the channel handle and recorded in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    /// Reserved-port style peer trust.
    #[default]
    Reserved,
    /// External authenticator (e.g. a site credential service).
    External,
}

/// The six failover control messages. Wire tag values are load-bearing:
/// they are what travels in the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FailoverKind {
    /// Secondary → primary: recognise me as the standby.
    Register = 1,
    /// Primary → secondary: periodic "I am alive".
    Handshake = 2,
    /// Restarted primary → active secondary: surrender the active role.
    PrimIsBack = 3,
    /// Primary → secondary: go down now.
    SecdShutdown = 4,
    /// Primary → secondary: stay up but remain passive.
    SecdGoInactive = 5,
    /// Primary → secondary: clean primary shutdown, assume the active role.
    SecdTakeover = 6,
}

impl FailoverKind {
    /// Wire tag of this message kind.
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Decode a wire tag. Unknown tags are a protocol error at the receiver.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::Register),
            2 => Some(Self::Handshake),
            3 => Some(Self::PrimIsBack),
            4 => Some(Self::SecdShutdown),
            5 => Some(Self::SecdGoInactive),
            6 => Some(Self::SecdTakeover),
            _ => None,
        }
    }
}

/// Reply codes carried in control-channel replies.
pub mod reply_code {
    /// Plain acknowledgement.
    pub const OK: u32 = 0;
    /// The receiver could not service the request.
    pub const SYSTEM_ERROR: u32 = 1;
    /// A standby is already registered; the new REGISTER is rejected.
    pub const BUSY: u32 = 2;
    /// The receiver does not recognise the request at all.
    pub const UNKNOWN_REQUEST: u32 = 3;
}
