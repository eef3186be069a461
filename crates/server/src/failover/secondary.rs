//! Driver for the secondary state machine.
//!
//! [`SecondaryDriver::run`] ticks the pure machine from `batchd-core` once a
//! second, executes the actions it returns against real sockets and files,
//! and feeds the results back as events. It returns when the machine
//! promotes itself (the caller then begins full active-server
//! initialisation) or demands a process exit. [`SecondaryDriver::run_active`]
//! is the other half of the secondary's life: serving the control port while
//! active, until the restarted primary reclaims the role.

use super::channel::{ChannelRead, ControlChannel};
use super::proto::{self, Message};
use super::{unix_now, FailoverShared};
use batchd_core::config;
use batchd_core::failover::machine::{
    Action, FailoverContext, FailoverEvent, MachineConfig, SecondaryState,
};
use batchd_core::failover::{reply_code, AuthMethod, FailoverKind};
use batchd_core::fence::{Fence, FenceOutcome};
use batchd_core::license;
use batchd_core::liveness::LivenessFile;
use batchd_core::marker::ActiveMarker;
use batchd_core::paths::ServerHome;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpListener;
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Startup parameters of the secondary.
#[derive(Clone)]
pub struct SecondaryConfig {
    pub home: ServerHome,
    /// This host's name; written into the active marker on promotion.
    pub own_host: String,
    /// The primary's hostname, dialed for registration and fenced at takeover.
    pub primary_host: String,
    pub port: u16,
    /// This host's identifier (XOR partner for the license fingerprint).
    pub hostid: u64,
    /// Operator grace interval in seconds; `-1` means "start active now".
    pub secondary_delay: i64,
    pub auth: AuthMethod,
}

/// Why [`SecondaryDriver::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryOutcome {
    /// The machine assumed the active role; the marker is written and the
    /// shared active flag is set.
    Promoted,
    /// The machine demands a process exit with this code.
    Exit(i32),
}

/// Why [`SecondaryDriver::run_active`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveOutcome {
    /// The primary reclaimed the role; the machine is idle and the caller
    /// re-enters [`SecondaryDriver::run`].
    HandBack,
    /// An inbound request demands a process exit with this code.
    Exit(i32),
}

/// Runs the machine against real sockets, files, and the fence.
pub struct SecondaryDriver {
    cfg: SecondaryConfig,
    shared: FailoverShared,
    fence: Arc<dyn Fence + Send + Sync>,
    machine: FailoverContext,
    channel: Option<ControlChannel>,
    liveness: LivenessFile,
    marker: ActiveMarker,
}

impl SecondaryDriver {
    pub fn new(
        cfg: SecondaryConfig,
        shared: FailoverShared,
        fence: Arc<dyn Fence + Send + Sync>,
    ) -> Self {
        let machine = FailoverContext::new(MachineConfig {
            own_hostid: cfg.hostid,
            secondary_delay: cfg.secondary_delay,
            start_time: unix_now(),
        });
        let liveness = LivenessFile::new(cfg.home.liveness_path());
        let marker = ActiveMarker::new(cfg.home.marker_path());
        Self {
            cfg,
            shared,
            fence,
            machine,
            channel: None,
            liveness,
            marker,
        }
    }

    pub fn state(&self) -> SecondaryState {
        self.machine.state()
    }

    /// Run the passive side of the machine until promotion or exit.
    pub async fn run(&mut self) -> io::Result<SecondaryOutcome> {
        let mut ticker = interval(Duration::from_secs(config::SECONDARY_TICK_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = match self.channel.as_mut() {
                Some(channel) => {
                    let in_reg_sent = self.machine.state() == SecondaryState::RegSent;
                    tokio::select! {
                        _ = ticker.tick() => FailoverEvent::Tick { now: unix_now() },
                        read = channel.next() => read_to_event(read, in_reg_sent),
                    }
                }
                None => {
                    ticker.tick().await;
                    FailoverEvent::Tick { now: unix_now() }
                }
            };

            if let Some(outcome) = self.dispatch(event).await? {
                return Ok(outcome);
            }
        }
    }

    /// Feed one event through the machine and execute the resulting
    /// actions; action results are fed back until the machine settles.
    async fn dispatch(&mut self, event: FailoverEvent) -> io::Result<Option<SecondaryOutcome>> {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            if matches!(
                event,
                FailoverEvent::Inbound {
                    kind: FailoverKind::Handshake,
                    ..
                }
            ) {
                metrics::counter!("batchd_handshakes_received_total").increment(1);
            }

            for action in self.machine.step(event) {
                match action {
                    Action::Dial { timeout_secs } => {
                        let connected = match ControlChannel::dial(
                            &self.cfg.primary_host,
                            self.cfg.port,
                            Duration::from_secs(timeout_secs),
                            self.cfg.auth,
                        )
                        .await
                        {
                            Ok(channel) => {
                                self.channel = Some(channel);
                                true
                            }
                            Err(e) => {
                                tracing::debug!("dial to primary failed: {}", e);
                                false
                            }
                        };
                        queue.push_back(FailoverEvent::DialOutcome { connected });
                    }
                    Action::SendRegister => {
                        let sent = match self.channel.as_mut() {
                            Some(channel) => {
                                channel.send_request(FailoverKind::Register).await.is_ok()
                            }
                            None => false,
                        };
                        queue.push_back(FailoverEvent::SendOutcome { sent });
                    }
                    Action::CloseSocket => {
                        self.channel = None;
                    }
                    Action::StatLiveness => {
                        let mtime = self.liveness.observe_mtime().ok();
                        queue.push_back(FailoverEvent::Liveness { mtime });
                    }
                    Action::RunFence => {
                        let fence = Arc::clone(&self.fence);
                        let target = self.cfg.primary_host.clone();
                        // The hook may block for the duration of the external
                        // program; the machine takes no further actions until
                        // it returns.
                        let outcome = tokio::task::spawn_blocking(move || fence.fence(&target))
                            .await
                            .unwrap_or(FenceOutcome::Failed);
                        metrics::counter!("batchd_fence_invocations_total").increment(1);
                        queue.push_back(FailoverEvent::Fence { outcome });
                    }
                    Action::WriteActiveMarker => {
                        if let Err(e) = self.marker.create(&self.cfg.own_host) {
                            tracing::error!("cannot write active marker: {}", e);
                        }
                    }
                    Action::RemoveActiveMarker => {
                        if let Err(e) = self.marker.remove() {
                            tracing::warn!("cannot remove active marker: {}", e);
                        }
                    }
                    Action::SaveFingerprint { fingerprint } => {
                        let path = self.cfg.home.license_path();
                        if let Err(e) = license::save_fingerprint(&path, fingerprint) {
                            tracing::error!("unable to save primary host identifier: {}", e);
                            return Ok(Some(SecondaryOutcome::Exit(config::EXIT_PEER_REJECTED)));
                        }
                    }
                    Action::ReplyAck => {
                        if !self.send_reply(reply_code::OK).await {
                            queue.push_back(FailoverEvent::PeerEof);
                        }
                    }
                    Action::ReplyDeferred => {
                        // The passive secondary has nothing to persist
                        // before surrendering; acknowledge right away. The
                        // active loop holds this ack until quiesced instead.
                        if !self.send_reply(reply_code::OK).await {
                            queue.push_back(FailoverEvent::PeerEof);
                        }
                    }
                    Action::ReplyError { code } => {
                        let _ = self.send_reply(code).await;
                    }
                    Action::Sleep { seconds } => {
                        sleep(Duration::from_secs(seconds)).await;
                    }
                    Action::AwaitPeerClose { seconds } => {
                        if let Some(channel) = self.channel.as_mut() {
                            channel.await_peer_close(Duration::from_secs(seconds)).await;
                        }
                        queue.push_back(FailoverEvent::InactiveWaitDone);
                    }
                    Action::Exit { code } => {
                        return Ok(Some(SecondaryOutcome::Exit(code)));
                    }
                    Action::Promote => {
                        self.shared.set_active();
                        metrics::counter!("batchd_takeovers_total").increment(1);
                        tracing::warn!(host = %self.cfg.own_host, "secondary is now the active server");
                        return Ok(Some(SecondaryOutcome::Promoted));
                    }
                }
            }
        }

        metrics::gauge!("batchd_secondary_state").set(state_ordinal(self.machine.state()));
        Ok(None)
    }

    async fn send_reply(&mut self, code: u32) -> bool {
        match self.channel.as_mut() {
            Some(channel) => channel.send_reply(code, None).await.is_ok(),
            None => false,
        }
    }

    /// Serve the control port while this secondary is the active server:
    /// touch the liveness file every handshake period and answer the
    /// restarted primary when it comes to reclaim the role.
    pub async fn run_active(&mut self) -> io::Result<ActiveOutcome> {
        let listener = TcpListener::bind(("0.0.0.0", self.cfg.port)).await?;
        tracing::info!(port = self.cfg.port, "active secondary serving control port");

        // A single control peer is expected here: the restarted primary.
        // Serving it briefly pauses the liveness touch, which one handshake
        // period of stagnation absorbs.

        let mut ticker = interval(Duration::from_secs(config::HANDSHAKE_PERIOD_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.liveness.touch() {
                        tracing::warn!("cannot touch liveness file: {}", e);
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    tracing::info!(peer = %peer_addr, "control connection while active");
                    if let Some(outcome) = self.serve_while_active(stream).await? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Serve one control connection while active. The single interesting
    /// visitor is the restarted primary sending PRIM_IS_BACK.
    async fn serve_while_active(
        &mut self,
        stream: tokio::net::TcpStream,
    ) -> io::Result<Option<ActiveOutcome>> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        loop {
            let msg = match proto::read_frame(&mut reader).await {
                Ok(msg) => msg,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => {
                    tracing::debug!("control connection failed while active: {}", e);
                    return Ok(None);
                }
            };

            let kind = match msg {
                Message::Request(body) => match FailoverKind::from_tag(body.tag) {
                    Some(kind) => kind,
                    None => {
                        proto::write_reply(&mut writer, reply_code::SYSTEM_ERROR, None).await?;
                        continue;
                    }
                },
                Message::Reply(_) => {
                    tracing::debug!("unexpected reply on active control port");
                    continue;
                }
            };

            let mut deferred_ack = false;
            let mut exit_code = None;
            for action in self.machine.step(FailoverEvent::Inbound {
                kind,
                now: unix_now(),
            }) {
                match action {
                    Action::ReplyAck => {
                        proto::write_reply(&mut writer, reply_code::OK, None).await?;
                    }
                    Action::ReplyError { code } => {
                        proto::write_reply(&mut writer, code, None).await?;
                    }
                    Action::ReplyDeferred => deferred_ack = true,
                    Action::RemoveActiveMarker => {
                        if let Err(e) = self.marker.remove() {
                            tracing::warn!("cannot remove active marker: {}", e);
                        }
                    }
                    Action::Sleep { seconds } => sleep(Duration::from_secs(seconds)).await,
                    Action::Exit { code } => exit_code = Some(code),
                    other => {
                        tracing::debug!(?other, "ignoring machine action while active");
                    }
                }
            }

            if deferred_ack {
                // Quiesce before acknowledging: stop acting as the active
                // server, then let the primary proceed.
                self.shared.clear_active();
                proto::write_reply(&mut writer, reply_code::OK, None).await?;
                writer.flush().await?;
                tracing::info!("surrendered active role to primary");
                return Ok(Some(ActiveOutcome::HandBack));
            }
            if let Some(code) = exit_code {
                return Ok(Some(ActiveOutcome::Exit(code)));
            }
        }
    }
}

/// Map an inbound channel event to a machine event. EOF is a reply-EOF only
/// while the register reply is outstanding; otherwise it is the request
/// stream ending.
fn read_to_event(read: ChannelRead, in_reg_sent: bool) -> FailoverEvent {
    match read {
        ChannelRead::Request { kind } => FailoverEvent::Inbound {
            kind,
            now: unix_now(),
        },
        ChannelRead::UnknownRequest => FailoverEvent::InboundUnknown,
        ChannelRead::Reply(reply) => {
            if reply.code == reply_code::OK {
                FailoverEvent::ReplyOk {
                    text: reply.text,
                    now: unix_now(),
                }
            } else {
                FailoverEvent::ReplyError { code: reply.code }
            }
        }
        ChannelRead::Eof if in_reg_sent => FailoverEvent::ReplyEof,
        ChannelRead::Eof => FailoverEvent::PeerEof,
        ChannelRead::DecodeError => FailoverEvent::DecodeError,
    }
}

fn state_ordinal(state: SecondaryState) -> f64 {
    match state {
        SecondaryState::NoConn => 0.0,
        SecondaryState::Conn => 1.0,
        SecondaryState::RegSent => 2.0,
        SecondaryState::Handshake => 3.0,
        SecondaryState::NoHandshake => 4.0,
        SecondaryState::Shutdown => 5.0,
        SecondaryState::Takeover => 6.0,
        SecondaryState::Inactive => 7.0,
        SecondaryState::Idle => 8.0,
    }
}
