//! The secondary state machine.
//!
//! The original hand-off logic advanced its state partly inside a main loop
//! and partly inside socket callbacks, all through module globals. Here the
//! whole protocol is one owned [`FailoverContext`] and one transition
//! function: [`FailoverContext::step`] consumes a [`FailoverEvent`] and
//! returns the [`Action`]s the driver must perform. The driver (in
//! `batchd-server`) executes actions against real sockets and files and
//! feeds the results back as further events; tests feed events directly.
//!
//! Time never comes from a clock in this module. Ticks and asynchronous
//! events carry wall-clock seconds; dial, send, fence, and liveness results
//! are attributed to the tick that requested them.

use crate::config;
use crate::fence::FenceOutcome;
use crate::license;

use super::{reply_code, FailoverKind};

/// The secondary's position in the failover protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryState {
    /// Not connected to the primary; dialing with back-off.
    NoConn,
    /// Connected; REGISTER not yet sent.
    Conn,
    /// REGISTER sent; waiting on the reply.
    RegSent,
    /// Steady state: receiving periodic handshakes.
    Handshake,
    /// Handshakes have stopped; watching the liveness file.
    NoHandshake,
    /// Told to shut down.
    Shutdown,
    /// Taking over the active role.
    Takeover,
    /// Told to stay up but remain passive.
    Inactive,
    /// Idle until the primary comes back.
    Idle,
}

/// Everything that can happen to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverEvent {
    /// One-second main-loop tick.
    Tick { now: u64 },
    /// Result of a [`Action::Dial`] issued this tick.
    DialOutcome { connected: bool },
    /// Result of a [`Action::SendRegister`] issued this tick.
    SendOutcome { sent: bool },
    /// A reply with code 0 arrived on the channel.
    ReplyOk { text: Option<String>, now: u64 },
    /// A reply with a non-zero code arrived.
    ReplyError { code: u32 },
    /// The channel reached EOF while a reply was being awaited.
    ReplyEof,
    /// An inbound failover request arrived.
    Inbound { kind: FailoverKind, now: u64 },
    /// An inbound request carried a tag nobody recognises.
    InboundUnknown,
    /// The channel reached EOF on the request stream.
    PeerEof,
    /// An inbound frame failed to read or decode (not EOF).
    DecodeError,
    /// Result of a [`Action::StatLiveness`] issued this tick.
    Liveness { mtime: Option<u64> },
    /// Result of a [`Action::RunFence`] issued this tick.
    Fence { outcome: FenceOutcome },
    /// The bounded wait for the peer to close (INACT) completed.
    InactiveWaitDone,
}

/// What the driver must do next, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Dial the primary with the given deadline; report [`FailoverEvent::DialOutcome`].
    Dial { timeout_secs: u64 },
    /// Send REGISTER on the channel; report [`FailoverEvent::SendOutcome`].
    SendRegister,
    /// Close and drop the channel.
    CloseSocket,
    /// Observe the liveness file; report [`FailoverEvent::Liveness`].
    StatLiveness,
    /// Run the fencing hook against the primary; report [`FailoverEvent::Fence`].
    RunFence,
    /// Write the active-marker file with our hostname.
    WriteActiveMarker,
    /// Remove the active-marker file (idempotent).
    RemoveActiveMarker,
    /// Persist the license fingerprint; failure to persist is fatal.
    SaveFingerprint { fingerprint: u64 },
    /// Acknowledge the inbound request (code 0).
    ReplyAck,
    /// Hold the acknowledgement until the caller has quiesced.
    ReplyDeferred,
    /// Reject the inbound request with a code.
    ReplyError { code: u32 },
    /// Back off for this long before the next tick.
    Sleep { seconds: u64 },
    /// Block reading the channel until EOF or the deadline; report
    /// [`FailoverEvent::InactiveWaitDone`].
    AwaitPeerClose { seconds: u64 },
    /// Terminate the process.
    Exit { code: i32 },
    /// The machine has assumed the active role; the driver returns control
    /// to the caller for full active-server initialisation.
    Promote,
}

/// Startup parameters of the machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// This host's identifier (XOR partner for the license fingerprint).
    pub own_hostid: u64,
    /// Operator grace interval in seconds; `-1` means "start active now".
    pub secondary_delay: i64,
    /// Wall-clock seconds at startup.
    pub start_time: u64,
}

/// The owned state of the secondary half of the failover pair.
#[derive(Debug)]
pub struct FailoverContext {
    state: SecondaryState,
    now: u64,
    tick_count: u64,

    own_hostid: u64,
    /// Normalised grace interval (0 when the operator asked for -1).
    delay: u64,
    /// Operator asked for immediate takeover (`secondary_delay = -1`).
    immediate_takeover: bool,
    /// `start + 5 min + delay`, computed once; an unreachable primary past
    /// this deadline triggers takeover.
    takeover_deadline: u64,

    last_handshake: u64,
    socket_open: bool,
    promoted: bool,

    // Liveness bookkeeping while degraded (NoHandshake).
    observed_mtime: u64,
    liveness_seen_at: u64,
    mtime_advances: u32,
}

impl FailoverContext {
    pub fn new(cfg: MachineConfig) -> Self {
        let immediate_takeover = cfg.secondary_delay < 0;
        let delay = if immediate_takeover {
            0
        } else {
            cfg.secondary_delay as u64
        };
        Self {
            state: SecondaryState::NoConn,
            now: cfg.start_time,
            tick_count: 0,
            own_hostid: cfg.own_hostid,
            delay,
            immediate_takeover,
            takeover_deadline: cfg.start_time + config::TAKEOVER_GRACE_SECS + delay,
            last_handshake: cfg.start_time,
            socket_open: false,
            promoted: false,
            observed_mtime: 0,
            liveness_seen_at: 0,
            mtime_advances: 0,
        }
    }

    pub fn state(&self) -> SecondaryState {
        self.state
    }

    /// Whether the machine has assumed the active role.
    pub fn is_promoted(&self) -> bool {
        self.promoted
    }

    /// Whether the machine believes a control channel is open.
    pub fn socket_open(&self) -> bool {
        self.socket_open
    }

    /// Feed one event; returns the actions the driver must perform, in order.
    pub fn step(&mut self, event: FailoverEvent) -> Vec<Action> {
        match event {
            FailoverEvent::Tick { now } => self.on_tick(now),
            FailoverEvent::DialOutcome { connected } => self.on_dial(connected),
            FailoverEvent::SendOutcome { sent } => self.on_send(sent),
            FailoverEvent::ReplyOk { text, now } => self.on_reply_ok(text, now),
            FailoverEvent::ReplyError { code } => self.on_reply_error(code),
            FailoverEvent::ReplyEof => self.on_reply_eof(),
            FailoverEvent::Inbound { kind, now } => self.on_inbound(kind, now),
            FailoverEvent::InboundUnknown => self.on_inbound_unknown(),
            FailoverEvent::PeerEof => self.on_peer_eof(),
            FailoverEvent::DecodeError => self.on_decode_error(),
            FailoverEvent::Liveness { mtime } => self.on_liveness(mtime),
            FailoverEvent::Fence { outcome } => self.on_fence(outcome),
            FailoverEvent::InactiveWaitDone => self.on_inactive_wait_done(),
        }
    }

    fn on_tick(&mut self, now: u64) -> Vec<Action> {
        self.now = now;
        self.tick_count += 1;

        match self.state {
            SecondaryState::NoConn | SecondaryState::Idle => {
                // Fresh connection attempt; forget the degraded-mode
                // liveness bookkeeping.
                self.observed_mtime = 0;
                self.liveness_seen_at = 0;
                self.mtime_advances = 0;

                let mut actions = Vec::new();
                if self.socket_open {
                    self.socket_open = false;
                    actions.push(Action::CloseSocket);
                }
                actions.push(Action::Dial {
                    timeout_secs: config::DIAL_TIMEOUT_SECS,
                });
                actions
            }
            SecondaryState::Conn => vec![Action::SendRegister],
            SecondaryState::RegSent => Vec::new(),
            SecondaryState::Handshake => {
                if now >= self.last_handshake + config::HANDSHAKE_GRACE_SECS {
                    tracing::warn!(
                        silent_secs = now - self.last_handshake,
                        "no handshake from primary, entering degraded watch"
                    );
                    self.state = SecondaryState::NoHandshake;
                }
                Vec::new()
            }
            SecondaryState::NoHandshake => vec![Action::StatLiveness],
            SecondaryState::Shutdown => vec![Action::Exit {
                code: config::EXIT_CLEAN,
            }],
            SecondaryState::Takeover => {
                let mut actions = Vec::new();
                if self.socket_open {
                    self.socket_open = false;
                    actions.push(Action::CloseSocket);
                }
                tracing::info!(
                    "attempting to connect with primary one last time before taking over"
                );
                actions.push(Action::Dial {
                    timeout_secs: config::DIAL_TIMEOUT_SECS,
                });
                actions
            }
            SecondaryState::Inactive => vec![Action::AwaitPeerClose {
                seconds: config::INACTIVE_WAIT_SECS,
            }],
        }
    }

    fn on_dial(&mut self, connected: bool) -> Vec<Action> {
        match self.state {
            SecondaryState::NoConn | SecondaryState::Idle => {
                if connected {
                    tracing::info!("connected to primary, sending registration next tick");
                    self.socket_open = true;
                    self.state = SecondaryState::Conn;
                    Vec::new()
                } else if self.state == SecondaryState::NoConn
                    && (self.immediate_takeover || self.now > self.takeover_deadline)
                {
                    // Never been in contact and the grace period is spent
                    // (or the operator asked for immediate takeover).
                    self.state = SecondaryState::Takeover;
                    Vec::new()
                } else {
                    vec![Action::Sleep {
                        seconds: config::RETRY_BACKOFF_SECS,
                    }]
                }
            }
            SecondaryState::NoHandshake => {
                if connected {
                    tracing::info!("reconnected to primary");
                    self.socket_open = true;
                    self.state = SecondaryState::Conn;
                }
                Vec::new()
            }
            SecondaryState::Takeover => {
                if connected {
                    tracing::info!("reconnected with primary, aborting takeover");
                    self.socket_open = true;
                    self.state = SecondaryState::Conn;
                    Vec::new()
                } else {
                    vec![Action::RunFence]
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_send(&mut self, sent: bool) -> Vec<Action> {
        if self.state != SecondaryState::Conn {
            return Vec::new();
        }
        if sent {
            self.state = SecondaryState::RegSent;
            self.last_handshake = self.now;
            Vec::new()
        } else {
            self.state = SecondaryState::NoConn;
            self.socket_open = false;
            vec![Action::CloseSocket]
        }
    }

    /// Reply handler for REGISTER's reply.
    fn on_reply_ok(&mut self, text: Option<String>, now: u64) -> Vec<Action> {
        if self.state != SecondaryState::RegSent {
            tracing::debug!(state = ?self.state, "ignoring stray reply");
            return Vec::new();
        }
        match text {
            Some(text) => match license::parse_peer_identifier(&text) {
                Some(peer) => {
                    tracing::info!("registered with primary, awaiting handshakes");
                    self.state = SecondaryState::Handshake;
                    self.last_handshake = now;
                    vec![Action::SaveFingerprint {
                        fingerprint: license::fingerprint(self.own_hostid, peer),
                    }]
                }
                None => {
                    tracing::error!("malformed registration reply from primary");
                    self.state = SecondaryState::NoConn;
                    self.socket_open = false;
                    vec![Action::CloseSocket]
                }
            },
            None => {
                // A bare acknowledgement means the peer speaks the protocol
                // but cannot name itself: a build without failover support.
                tracing::error!("primary does not support failover, cannot be its standby");
                vec![Action::Exit {
                    code: config::EXIT_PEER_REJECTED,
                }]
            }
        }
    }

    fn on_reply_error(&mut self, code: u32) -> Vec<Action> {
        if code == reply_code::UNKNOWN_REQUEST {
            tracing::error!("primary rejected attempt to register as secondary");
            return vec![Action::Exit {
                code: config::EXIT_PEER_REJECTED,
            }];
        }
        tracing::warn!(code, "primary declined registration, will retry");
        self.state = SecondaryState::NoConn;
        self.socket_open = false;
        vec![Action::CloseSocket]
    }

    fn on_reply_eof(&mut self) -> Vec<Action> {
        if self.state == SecondaryState::RegSent {
            // We reached the primary and then it died. That is proof enough;
            // go straight to takeover rather than back to dialing.
            tracing::warn!("primary closed connection after registration was sent, taking over");
            self.socket_open = false;
            self.state = SecondaryState::Takeover;
            return vec![Action::CloseSocket];
        }
        self.on_peer_eof()
    }

    /// Dispatch of inbound failover requests while we are passive (or, for
    /// PRIM_IS_BACK, while we are the active secondary).
    fn on_inbound(&mut self, kind: FailoverKind, now: u64) -> Vec<Action> {
        match kind {
            FailoverKind::Handshake => {
                self.last_handshake = now;
                if self.state == SecondaryState::NoHandshake {
                    tracing::info!("handshakes resumed");
                    self.state = SecondaryState::Handshake;
                }
                vec![Action::ReplyAck]
            }
            FailoverKind::PrimIsBack => {
                tracing::warn!("received takeover message from primary, going inactive");
                self.promoted = false;
                self.state = SecondaryState::Idle;
                // Ack only after the caller has quiesced and persisted state.
                vec![Action::RemoveActiveMarker, Action::ReplyDeferred]
            }
            FailoverKind::SecdShutdown => {
                tracing::warn!("secondary told to shut down");
                self.state = SecondaryState::Shutdown;
                vec![
                    Action::ReplyAck,
                    Action::Exit {
                        code: config::EXIT_CLEAN,
                    },
                ]
            }
            FailoverKind::SecdGoInactive => {
                tracing::info!("secondary told to go inactive");
                self.promoted = false;
                self.state = SecondaryState::Inactive;
                // Any transition that surrenders the active role clears the
                // marker; removal of an absent marker is a no-op.
                vec![Action::ReplyAck, Action::RemoveActiveMarker]
            }
            FailoverKind::SecdTakeover => {
                tracing::warn!("primary is shutting down cleanly, assuming active role");
                self.state = SecondaryState::Takeover;
                vec![
                    Action::ReplyAck,
                    Action::Sleep {
                        seconds: config::TAKEOVER_SETTLE_SECS,
                    },
                ]
            }
            FailoverKind::Register => {
                tracing::warn!("registration request received by a secondary, rejecting");
                vec![Action::ReplyError {
                    code: reply_code::SYSTEM_ERROR,
                }]
            }
        }
    }

    fn on_inbound_unknown(&mut self) -> Vec<Action> {
        tracing::warn!("invalid failover request, rejecting");
        vec![Action::ReplyError {
            code: reply_code::SYSTEM_ERROR,
        }]
    }

    fn on_peer_eof(&mut self) -> Vec<Action> {
        // There is a race as to when this end sees the close the primary
        // initiated; if we were already told to idle, or never connected,
        // the state stands.
        if self.state != SecondaryState::Inactive && self.state != SecondaryState::NoConn {
            self.state = SecondaryState::NoHandshake;
        }
        self.socket_open = false;
        vec![Action::CloseSocket]
    }

    fn on_decode_error(&mut self) -> Vec<Action> {
        tracing::warn!("read or decode error on control channel");
        self.state = SecondaryState::NoConn;
        self.socket_open = false;
        vec![Action::CloseSocket]
    }

    fn on_liveness(&mut self, mtime: Option<u64>) -> Vec<Action> {
        if self.state != SecondaryState::NoHandshake {
            return Vec::new();
        }
        match mtime {
            Some(mtime) if mtime > self.observed_mtime => {
                // The liveness file is still being touched: someone is
                // alive over there even though handshakes stopped.
                self.observed_mtime = mtime;
                self.liveness_seen_at = self.now;
                self.mtime_advances += 1;
                if self.mtime_advances > config::LIVENESS_ADVANCE_RECONNECT_THRESHOLD
                    && !self.socket_open
                {
                    tracing::info!(
                        "liveness file still advancing without handshakes, reconnecting"
                    );
                    self.state = SecondaryState::NoConn;
                }
                Vec::new()
            }
            Some(_) => {
                // Stagnant. Strictly past the grace interval means the
                // active peer has stopped touching liveness.
                if self.now > self.liveness_seen_at + self.delay {
                    tracing::warn!(
                        stagnant_secs = self.now - self.liveness_seen_at,
                        "liveness file stagnant past grace interval, taking over"
                    );
                    self.state = SecondaryState::Takeover;
                }
                Vec::new()
            }
            None => {
                if self.now > self.last_handshake + self.delay {
                    // We cannot see shared storage either: we are probably
                    // the partitioned one. Reconnect, do not take over.
                    tracing::error!("secondary unable to stat server live file");
                    self.state = SecondaryState::NoConn;
                    Vec::new()
                } else if !self.socket_open
                    && self.tick_count % config::DEGRADED_DIAL_EVERY_TICKS == 0
                {
                    vec![Action::Dial {
                        timeout_secs: config::DIAL_TIMEOUT_SECS,
                    }]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn on_fence(&mut self, outcome: FenceOutcome) -> Vec<Action> {
        if self.state != SecondaryState::Takeover {
            return Vec::new();
        }
        match outcome {
            FenceOutcome::Failed => {
                tracing::warn!("secondary will attempt taking over again");
                vec![Action::Sleep {
                    seconds: config::RETRY_BACKOFF_SECS,
                }]
            }
            FenceOutcome::Fenced | FenceOutcome::Absent => {
                tracing::warn!("taking over as the active server");
                self.promoted = true;
                vec![Action::WriteActiveMarker, Action::Promote]
            }
        }
    }

    fn on_inactive_wait_done(&mut self) -> Vec<Action> {
        if self.state != SecondaryState::Inactive {
            return Vec::new();
        }
        tracing::debug!("secondary completed waiting for primary to go down");
        self.state = SecondaryState::Idle;
        self.socket_open = false;
        vec![
            Action::Sleep {
                seconds: config::TAKEOVER_SETTLE_SECS,
            },
            Action::CloseSocket,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: u64 = 1_000;
    const OWN_ID: u64 = 0xA5A5;

    fn machine(delay: i64) -> FailoverContext {
        FailoverContext::new(MachineConfig {
            own_hostid: OWN_ID,
            secondary_delay: delay,
            start_time: START,
        })
    }

    /// Drive a fresh machine through NOCONN → CONN → REGSENT → HANDSK.
    fn register(m: &mut FailoverContext, now: u64) {
        assert_eq!(
            m.step(FailoverEvent::Tick { now }),
            vec![Action::Dial {
                timeout_secs: config::DIAL_TIMEOUT_SECS
            }]
        );
        assert!(m.step(FailoverEvent::DialOutcome { connected: true }).is_empty());
        assert_eq!(m.state(), SecondaryState::Conn);

        assert_eq!(
            m.step(FailoverEvent::Tick { now: now + 1 }),
            vec![Action::SendRegister]
        );
        assert!(m.step(FailoverEvent::SendOutcome { sent: true }).is_empty());
        assert_eq!(m.state(), SecondaryState::RegSent);

        let actions = m.step(FailoverEvent::ReplyOk {
            text: Some("777".into()),
            now: now + 1,
        });
        assert_eq!(
            actions,
            vec![Action::SaveFingerprint {
                fingerprint: OWN_ID ^ 777
            }]
        );
        assert_eq!(m.state(), SecondaryState::Handshake);
    }

    #[test]
    fn clean_registration_reaches_handshake() {
        let mut m = machine(30);
        register(&mut m, START);
    }

    #[test]
    fn register_send_failure_reverts_to_noconn() {
        let mut m = machine(30);
        m.step(FailoverEvent::Tick { now: START });
        m.step(FailoverEvent::DialOutcome { connected: true });
        m.step(FailoverEvent::Tick { now: START + 1 });
        assert_eq!(
            m.step(FailoverEvent::SendOutcome { sent: false }),
            vec![Action::CloseSocket]
        );
        assert_eq!(m.state(), SecondaryState::NoConn);
    }

    #[test]
    fn dial_failure_backs_off_until_deadline_then_takes_over() {
        let mut m = machine(30);
        let deadline = START + config::TAKEOVER_GRACE_SECS + 30;

        // Before the deadline: sleep and retry.
        m.step(FailoverEvent::Tick { now: START });
        assert_eq!(
            m.step(FailoverEvent::DialOutcome { connected: false }),
            vec![Action::Sleep {
                seconds: config::RETRY_BACKOFF_SECS
            }]
        );
        assert_eq!(m.state(), SecondaryState::NoConn);

        // At exactly the deadline: still not takeover (strict >).
        m.step(FailoverEvent::Tick { now: deadline });
        assert_eq!(
            m.step(FailoverEvent::DialOutcome { connected: false }),
            vec![Action::Sleep {
                seconds: config::RETRY_BACKOFF_SECS
            }]
        );
        assert_eq!(m.state(), SecondaryState::NoConn);

        // Past it: takeover.
        m.step(FailoverEvent::Tick { now: deadline + 1 });
        assert!(m.step(FailoverEvent::DialOutcome { connected: false }).is_empty());
        assert_eq!(m.state(), SecondaryState::Takeover);
    }

    #[test]
    fn negative_delay_takes_over_on_first_dial_failure() {
        let mut m = machine(-1);
        m.step(FailoverEvent::Tick { now: START });
        m.step(FailoverEvent::DialOutcome { connected: false });
        assert_eq!(m.state(), SecondaryState::Takeover);
    }

    #[test]
    fn idle_dial_failure_only_sleeps() {
        let mut m = machine(-1);
        m.state = SecondaryState::Idle;
        m.step(FailoverEvent::Tick { now: START + 10_000 });
        assert_eq!(
            m.step(FailoverEvent::DialOutcome { connected: false }),
            vec![Action::Sleep {
                seconds: config::RETRY_BACKOFF_SECS
            }]
        );
        assert_eq!(m.state(), SecondaryState::Idle);
    }

    #[test]
    fn handshake_silence_enters_degraded_watch() {
        let mut m = machine(30);
        register(&mut m, START);
        // Registered at START+1; grace is 2 × handshake period.
        m.step(FailoverEvent::Tick {
            now: START + config::HANDSHAKE_GRACE_SECS,
        });
        assert_eq!(m.state(), SecondaryState::Handshake);
        m.step(FailoverEvent::Tick {
            now: START + 1 + config::HANDSHAKE_GRACE_SECS,
        });
        assert_eq!(m.state(), SecondaryState::NoHandshake);
    }

    #[test]
    fn inbound_handshake_recovers_from_degraded() {
        let mut m = machine(30);
        register(&mut m, START);
        m.step(FailoverEvent::Tick { now: START + 100 });
        assert_eq!(m.state(), SecondaryState::NoHandshake);

        let actions = m.step(FailoverEvent::Inbound {
            kind: FailoverKind::Handshake,
            now: START + 100,
        });
        assert_eq!(actions, vec![Action::ReplyAck]);
        assert_eq!(m.state(), SecondaryState::Handshake);

        // And the silence clock restarted.
        m.step(FailoverEvent::Tick { now: START + 105 });
        assert_eq!(m.state(), SecondaryState::Handshake);
    }

    #[test]
    fn stagnant_liveness_takes_over_strictly_after_delay() {
        let mut m = machine(30);
        register(&mut m, START);
        m.step(FailoverEvent::Tick { now: START + 100 });
        assert_eq!(m.state(), SecondaryState::NoHandshake);

        // First observation counts as an advance and pins `liveness_seen_at`.
        assert_eq!(
            m.step(FailoverEvent::Tick { now: START + 101 }),
            vec![Action::StatLiveness]
        );
        m.step(FailoverEvent::Liveness { mtime: Some(500) });
        assert_eq!(m.state(), SecondaryState::NoHandshake);

        // Stagnant for exactly `delay`: not yet a trigger.
        m.step(FailoverEvent::Tick { now: START + 131 });
        m.step(FailoverEvent::Liveness { mtime: Some(500) });
        assert_eq!(m.state(), SecondaryState::NoHandshake);

        // One second past: takeover.
        m.step(FailoverEvent::Tick { now: START + 132 });
        m.step(FailoverEvent::Liveness { mtime: Some(500) });
        assert_eq!(m.state(), SecondaryState::Takeover);
    }

    #[test]
    fn advancing_liveness_without_socket_reconnects() {
        let mut m = machine(30);
        register(&mut m, START);
        m.step(FailoverEvent::Tick { now: START + 100 });
        // Connection died along with the handshakes.
        m.step(FailoverEvent::PeerEof);
        assert_eq!(m.state(), SecondaryState::NoHandshake);

        for i in 0..4 {
            m.step(FailoverEvent::Tick { now: START + 101 + i });
            m.step(FailoverEvent::Liveness {
                mtime: Some(500 + i),
            });
            assert_eq!(m.state(), SecondaryState::NoHandshake);
        }
        m.step(FailoverEvent::Tick { now: START + 105 });
        m.step(FailoverEvent::Liveness { mtime: Some(504) });
        assert_eq!(m.state(), SecondaryState::NoConn);
    }

    #[test]
    fn advancing_liveness_with_socket_stays_degraded() {
        let mut m = machine(30);
        register(&mut m, START);
        m.step(FailoverEvent::Tick { now: START + 100 });
        assert_eq!(m.state(), SecondaryState::NoHandshake);
        assert!(m.socket_open());

        for i in 0..8 {
            m.step(FailoverEvent::Tick { now: START + 101 + i });
            m.step(FailoverEvent::Liveness {
                mtime: Some(500 + i),
            });
        }
        assert_eq!(m.state(), SecondaryState::NoHandshake);
    }

    #[test]
    fn unreadable_liveness_past_delay_reconnects_instead_of_takeover() {
        let mut m = machine(30);
        register(&mut m, START);
        m.step(FailoverEvent::Tick { now: START + 15 });
        assert_eq!(m.state(), SecondaryState::NoHandshake);

        // Handshake last seen at START+1; not yet past delay.
        m.step(FailoverEvent::Tick { now: START + 20 });
        m.step(FailoverEvent::Liveness { mtime: None });
        assert_eq!(m.state(), SecondaryState::NoHandshake);

        m.step(FailoverEvent::Tick { now: START + 200 });
        m.step(FailoverEvent::Liveness { mtime: None });
        assert_eq!(m.state(), SecondaryState::NoConn);
    }

    #[test]
    fn unreadable_liveness_dials_every_third_tick() {
        let mut m = machine(3_000);
        register(&mut m, START);
        m.step(FailoverEvent::Tick { now: START + 100 });
        m.step(FailoverEvent::PeerEof);
        assert_eq!(m.state(), SecondaryState::NoHandshake);
        assert!(!m.socket_open());

        let mut dials = 0;
        for i in 0..6 {
            m.step(FailoverEvent::Tick { now: START + 101 + i });
            let actions = m.step(FailoverEvent::Liveness { mtime: None });
            if actions.contains(&Action::Dial {
                timeout_secs: config::DIAL_TIMEOUT_SECS,
            }) {
                dials += 1;
                m.step(FailoverEvent::DialOutcome { connected: false });
            }
        }
        assert_eq!(dials, 2);
        assert_eq!(m.state(), SecondaryState::NoHandshake);
    }

    #[test]
    fn degraded_reconnect_success_restarts_registration() {
        let mut m = machine(3_000);
        register(&mut m, START);
        m.step(FailoverEvent::Tick { now: START + 100 });
        m.step(FailoverEvent::PeerEof);

        // Walk ticks until the third-tick dial fires, then connect.
        loop {
            m.step(FailoverEvent::Tick { now: START + 200 });
            let actions = m.step(FailoverEvent::Liveness { mtime: None });
            if !actions.is_empty() {
                m.step(FailoverEvent::DialOutcome { connected: true });
                break;
            }
        }
        assert_eq!(m.state(), SecondaryState::Conn);
    }

    #[test]
    fn eof_during_regsent_goes_straight_to_takeover() {
        let mut m = machine(30);
        m.step(FailoverEvent::Tick { now: START });
        m.step(FailoverEvent::DialOutcome { connected: true });
        m.step(FailoverEvent::Tick { now: START + 1 });
        m.step(FailoverEvent::SendOutcome { sent: true });
        assert_eq!(m.state(), SecondaryState::RegSent);

        assert_eq!(m.step(FailoverEvent::ReplyEof), vec![Action::CloseSocket]);
        assert_eq!(m.state(), SecondaryState::Takeover);
    }

    #[test]
    fn register_reply_without_text_is_fatal() {
        let mut m = machine(30);
        m.step(FailoverEvent::Tick { now: START });
        m.step(FailoverEvent::DialOutcome { connected: true });
        m.step(FailoverEvent::Tick { now: START + 1 });
        m.step(FailoverEvent::SendOutcome { sent: true });

        let actions = m.step(FailoverEvent::ReplyOk {
            text: None,
            now: START + 1,
        });
        assert_eq!(
            actions,
            vec![Action::Exit {
                code: config::EXIT_PEER_REJECTED
            }]
        );
    }

    #[test]
    fn unknown_request_reply_is_fatal() {
        let mut m = machine(30);
        m.step(FailoverEvent::Tick { now: START });
        m.step(FailoverEvent::DialOutcome { connected: true });
        m.step(FailoverEvent::Tick { now: START + 1 });
        m.step(FailoverEvent::SendOutcome { sent: true });

        let actions = m.step(FailoverEvent::ReplyError {
            code: reply_code::UNKNOWN_REQUEST,
        });
        assert_eq!(
            actions,
            vec![Action::Exit {
                code: config::EXIT_PEER_REJECTED
            }]
        );
    }

    #[test]
    fn busy_reply_reverts_to_noconn() {
        let mut m = machine(30);
        m.step(FailoverEvent::Tick { now: START });
        m.step(FailoverEvent::DialOutcome { connected: true });
        m.step(FailoverEvent::Tick { now: START + 1 });
        m.step(FailoverEvent::SendOutcome { sent: true });

        assert_eq!(
            m.step(FailoverEvent::ReplyError {
                code: reply_code::BUSY
            }),
            vec![Action::CloseSocket]
        );
        assert_eq!(m.state(), SecondaryState::NoConn);
    }

    #[test]
    fn malformed_register_reply_reverts_to_noconn() {
        let mut m = machine(30);
        m.step(FailoverEvent::Tick { now: START });
        m.step(FailoverEvent::DialOutcome { connected: true });
        m.step(FailoverEvent::Tick { now: START + 1 });
        m.step(FailoverEvent::SendOutcome { sent: true });

        let actions = m.step(FailoverEvent::ReplyOk {
            text: Some("not-decimal".into()),
            now: START + 1,
        });
        assert_eq!(actions, vec![Action::CloseSocket]);
        assert_eq!(m.state(), SecondaryState::NoConn);
    }

    #[test]
    fn takeover_fences_then_promotes() {
        let mut m = machine(-1);
        m.step(FailoverEvent::Tick { now: START });
        m.step(FailoverEvent::DialOutcome { connected: false });
        assert_eq!(m.state(), SecondaryState::Takeover);

        // One last dial, refused; then the fence runs.
        let actions = m.step(FailoverEvent::Tick { now: START + 1 });
        assert_eq!(
            actions,
            vec![Action::Dial {
                timeout_secs: config::DIAL_TIMEOUT_SECS
            }]
        );
        assert_eq!(
            m.step(FailoverEvent::DialOutcome { connected: false }),
            vec![Action::RunFence]
        );

        let actions = m.step(FailoverEvent::Fence {
            outcome: FenceOutcome::Absent,
        });
        assert_eq!(actions, vec![Action::WriteActiveMarker, Action::Promote]);
        assert!(m.is_promoted());
    }

    #[test]
    fn fence_failure_retries_takeover() {
        let mut m = machine(-1);
        m.step(FailoverEvent::Tick { now: START });
        m.step(FailoverEvent::DialOutcome { connected: false });
        m.step(FailoverEvent::Tick { now: START + 1 });
        m.step(FailoverEvent::DialOutcome { connected: false });

        let actions = m.step(FailoverEvent::Fence {
            outcome: FenceOutcome::Failed,
        });
        assert_eq!(
            actions,
            vec![Action::Sleep {
                seconds: config::RETRY_BACKOFF_SECS
            }]
        );
        assert_eq!(m.state(), SecondaryState::Takeover);
        assert!(!m.is_promoted());

        // The retry succeeds.
        m.step(FailoverEvent::Tick { now: START + 12 });
        m.step(FailoverEvent::DialOutcome { connected: false });
        let actions = m.step(FailoverEvent::Fence {
            outcome: FenceOutcome::Fenced,
        });
        assert_eq!(actions, vec![Action::WriteActiveMarker, Action::Promote]);
    }

    #[test]
    fn takeover_last_dial_success_aborts_takeover() {
        let mut m = machine(-1);
        m.step(FailoverEvent::Tick { now: START });
        m.step(FailoverEvent::DialOutcome { connected: false });
        m.step(FailoverEvent::Tick { now: START + 1 });
        m.step(FailoverEvent::DialOutcome { connected: true });
        assert_eq!(m.state(), SecondaryState::Conn);
        assert!(!m.is_promoted());
    }

    #[test]
    fn directed_takeover_acks_settles_then_takes_over() {
        let mut m = machine(30);
        register(&mut m, START);

        let actions = m.step(FailoverEvent::Inbound {
            kind: FailoverKind::SecdTakeover,
            now: START + 5,
        });
        assert_eq!(
            actions,
            vec![
                Action::ReplyAck,
                Action::Sleep {
                    seconds: config::TAKEOVER_SETTLE_SECS
                }
            ]
        );
        assert_eq!(m.state(), SecondaryState::Takeover);
    }

    #[test]
    fn shutdown_request_acks_and_exits_zero() {
        let mut m = machine(30);
        register(&mut m, START);

        let actions = m.step(FailoverEvent::Inbound {
            kind: FailoverKind::SecdShutdown,
            now: START + 5,
        });
        assert_eq!(
            actions,
            vec![
                Action::ReplyAck,
                Action::Exit {
                    code: config::EXIT_CLEAN
                }
            ]
        );
        assert_eq!(m.state(), SecondaryState::Shutdown);
    }

    #[test]
    fn go_inactive_acks_and_clears_marker() {
        let mut m = machine(30);
        register(&mut m, START);

        let actions = m.step(FailoverEvent::Inbound {
            kind: FailoverKind::SecdGoInactive,
            now: START + 5,
        });
        assert_eq!(actions, vec![Action::ReplyAck, Action::RemoveActiveMarker]);
        assert_eq!(m.state(), SecondaryState::Inactive);

        // The INACT wait: block for EOF, then settle and idle.
        assert_eq!(
            m.step(FailoverEvent::Tick { now: START + 6 }),
            vec![Action::AwaitPeerClose {
                seconds: config::INACTIVE_WAIT_SECS
            }]
        );
        let actions = m.step(FailoverEvent::InactiveWaitDone);
        assert_eq!(
            actions,
            vec![
                Action::Sleep {
                    seconds: config::TAKEOVER_SETTLE_SECS
                },
                Action::CloseSocket
            ]
        );
        assert_eq!(m.state(), SecondaryState::Idle);
    }

    #[test]
    fn prim_is_back_surrenders_and_defers_ack() {
        let mut m = machine(-1);
        // Become active first.
        m.step(FailoverEvent::Tick { now: START });
        m.step(FailoverEvent::DialOutcome { connected: false });
        m.step(FailoverEvent::Tick { now: START + 1 });
        m.step(FailoverEvent::DialOutcome { connected: false });
        m.step(FailoverEvent::Fence {
            outcome: FenceOutcome::Absent,
        });
        assert!(m.is_promoted());

        let actions = m.step(FailoverEvent::Inbound {
            kind: FailoverKind::PrimIsBack,
            now: START + 500,
        });
        assert_eq!(actions, vec![Action::RemoveActiveMarker, Action::ReplyDeferred]);
        assert!(!m.is_promoted());
        assert_eq!(m.state(), SecondaryState::Idle);
    }

    #[test]
    fn register_received_by_secondary_is_rejected() {
        let mut m = machine(30);
        register(&mut m, START);
        let actions = m.step(FailoverEvent::Inbound {
            kind: FailoverKind::Register,
            now: START + 5,
        });
        assert_eq!(
            actions,
            vec![Action::ReplyError {
                code: reply_code::SYSTEM_ERROR
            }]
        );
        assert_eq!(m.state(), SecondaryState::Handshake);
    }

    #[test]
    fn unknown_inbound_tag_is_rejected_without_transition() {
        let mut m = machine(30);
        register(&mut m, START);
        assert_eq!(
            m.step(FailoverEvent::InboundUnknown),
            vec![Action::ReplyError {
                code: reply_code::SYSTEM_ERROR
            }]
        );
        assert_eq!(m.state(), SecondaryState::Handshake);
    }

    #[test]
    fn peer_eof_in_steady_state_degrades() {
        let mut m = machine(30);
        register(&mut m, START);
        assert_eq!(m.step(FailoverEvent::PeerEof), vec![Action::CloseSocket]);
        assert_eq!(m.state(), SecondaryState::NoHandshake);
        assert!(!m.socket_open());
    }

    #[test]
    fn peer_eof_while_inactive_keeps_state() {
        let mut m = machine(30);
        register(&mut m, START);
        m.step(FailoverEvent::Inbound {
            kind: FailoverKind::SecdGoInactive,
            now: START + 5,
        });
        m.step(FailoverEvent::PeerEof);
        assert_eq!(m.state(), SecondaryState::Inactive);
    }

    #[test]
    fn decode_error_resets_to_noconn() {
        let mut m = machine(30);
        register(&mut m, START);
        assert_eq!(m.step(FailoverEvent::DecodeError), vec![Action::CloseSocket]);
        assert_eq!(m.state(), SecondaryState::NoConn);
    }

    #[test]
    fn shutdown_state_exits_on_tick() {
        let mut m = machine(30);
        register(&mut m, START);
        m.step(FailoverEvent::Inbound {
            kind: FailoverKind::SecdShutdown,
            now: START + 5,
        });
        assert_eq!(
            m.step(FailoverEvent::Tick { now: START + 6 }),
            vec![Action::Exit {
                code: config::EXIT_CLEAN
            }]
        );
    }

    #[test]
    fn noconn_tick_closes_lingering_socket_before_dialing() {
        let mut m = machine(30);
        register(&mut m, START);
        m.step(FailoverEvent::DecodeError);
        // DecodeError already closed; simulate a lingering socket instead.
        m.socket_open = true;
        let actions = m.step(FailoverEvent::Tick { now: START + 10 });
        assert_eq!(
            actions,
            vec![
                Action::CloseSocket,
                Action::Dial {
                    timeout_secs: config::DIAL_TIMEOUT_SECS
                }
            ]
        );
    }
}
