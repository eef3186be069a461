//! Primary controller: the active server's half of the failover protocol.
//!
//! Three responsibilities: the periodic handshake tick (touch liveness,
//! handshake the registered secondary, watch for the active marker), the
//! REGISTER acceptor on the control listener, and the reclaim sequence a
//! restarted primary runs after it was displaced.

use super::channel::{ChannelRead, ControlChannel};
use super::proto::{self, Message, ReplyBody};
use super::{FailoverShared, ShutdownPolicy};
use batchd_core::config;
use batchd_core::failover::{reply_code, AuthMethod, FailoverKind};
use batchd_core::liveness::LivenessFile;
use batchd_core::marker::ActiveMarker;
use batchd_core::paths::ServerHome;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Startup parameters of the primary controller.
#[derive(Debug, Clone)]
pub struct PrimaryConfig {
    pub home: ServerHome,
    /// This host's name, recorded in logs.
    pub own_host: String,
    /// This host's identifier; the REGISTER reply carries it as decimal text.
    pub hostid: u64,
    pub auth: AuthMethod,
}

/// The registered secondary's write side and reply queue.
///
/// The matching read side lives in the connection task, which forwards
/// replies here and clears the slot when the socket closes. Holding a
/// handle implies the peer is authenticated and idle-timeout exempt.
struct PeerHandle {
    id: u64,
    host: String,
    writer: BufWriter<OwnedWriteHalf>,
    acks: mpsc::Receiver<ReplyBody>,
    authenticated: bool,
    no_timeout: bool,
}

/// Handshake emitter, takeover detector, and REGISTER acceptor.
pub struct PrimaryController {
    cfg: PrimaryConfig,
    shared: FailoverShared,
    liveness: LivenessFile,
    marker: ActiveMarker,
    /// At most one registered secondary. The original tracked this as a
    /// connection handle that was set to -1 or -2 on loss; both are `None`.
    peer: Mutex<Option<PeerHandle>>,
    next_peer_id: AtomicU64,
}

impl PrimaryController {
    pub fn new(cfg: PrimaryConfig, shared: FailoverShared) -> Self {
        let liveness = LivenessFile::new(cfg.home.liveness_path());
        let marker = ActiveMarker::new(cfg.home.marker_path());
        Self {
            cfg,
            shared,
            liveness,
            marker,
            peer: Mutex::new(None),
            next_peer_id: AtomicU64::new(1),
        }
    }

    /// Whether a secondary is currently registered.
    pub async fn has_peer(&self) -> bool {
        self.peer.lock().await.is_some()
    }

    /// Run the handshake timer until this primary discovers it was
    /// displaced; returns the recycle exit code for the supervisor.
    pub async fn run_handshake_timer(&self) -> i32 {
        let mut ticker = interval(Duration::from_secs(config::HANDSHAKE_PERIOD_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(code) = self.handshake_tick().await {
                return code;
            }
        }
    }

    /// One handshake tick. Returns an exit code when the primary must
    /// recycle itself.
    pub async fn handshake_tick(&self) -> Option<i32> {
        // Touch svrlive as an "I am alive" sign. Failures are transient;
        // the next tick retries.
        if let Err(e) = self.liveness.touch() {
            tracing::warn!("cannot touch liveness file: {}", e);
        }

        let mut slot = self.peer.lock().await;
        if let Some(peer) = slot.as_mut() {
            let sent = timeout(
                Duration::from_secs(config::SEND_TIMEOUT_SECS),
                proto::write_request(&mut peer.writer, FailoverKind::Handshake),
            )
            .await;
            match sent {
                Ok(Ok(())) => {
                    metrics::counter!("batchd_handshakes_sent_total").increment(1);
                }
                _ => {
                    tracing::warn!(host = %peer.host, "handshake send failed, dropping secondary");
                    *slot = None;
                }
            }
        }
        drop(slot);

        // See if the secondary has taken over even though we are up.
        if self.marker.exists() {
            tracing::warn!("secondary is active, recycling to take back control");
            self.shared.set_displaced();
            return Some(config::EXIT_RECYCLE);
        }
        None
    }

    /// Accept control connections and serve each until it closes.
    pub async fn run_listener(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let controller = Arc::clone(&self);
            tokio::spawn(async move {
                let host = peer_addr.ip().to_string();
                if let Err(e) = controller.serve_connection(stream, host.clone()).await {
                    tracing::debug!(host = %host, "control connection ended: {}", e);
                }
            });
        }
    }

    /// Serve one inbound control connection.
    ///
    /// Before registration the write half is local; after a successful
    /// REGISTER it is parked in the peer slot for the handshake timer, and
    /// this task keeps reading: replies are forwarded to the slot's queue,
    /// and the slot is cleared when the socket closes.
    async fn serve_connection(&self, stream: TcpStream, peer_host: String) -> io::Result<()> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut local_writer = Some(BufWriter::new(write_half));
        let mut registered_id: Option<u64> = None;
        let mut acks_tx: Option<mpsc::Sender<ReplyBody>> = None;

        let result = loop {
            let msg = match proto::read_frame(&mut reader).await {
                Ok(msg) => msg,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
                Err(e) => break Err(e),
            };
            match msg {
                Message::Request(body) => match FailoverKind::from_tag(body.tag) {
                    Some(FailoverKind::Register) => {
                        let accepted = self
                            .accept_register(
                                &peer_host,
                                &mut local_writer,
                                &mut registered_id,
                                &mut acks_tx,
                            )
                            .await;
                        if let Err(e) = accepted {
                            break Err(e);
                        }
                    }
                    _ => {
                        // Anything else does not belong on the primary's
                        // control port.
                        tracing::warn!(
                            host = %peer_host,
                            tag = body.tag,
                            "rejecting unexpected failover request"
                        );
                        let replied = self
                            .reply_on_conn(
                                &mut local_writer,
                                registered_id,
                                reply_code::SYSTEM_ERROR,
                                None,
                            )
                            .await;
                        if let Err(e) = replied {
                            break Err(e);
                        }
                    }
                },
                Message::Reply(reply) => {
                    // Handshake acknowledgements land here; they matter only
                    // when shutdown signalling is waiting on one.
                    if let Some(tx) = &acks_tx {
                        let _ = tx.try_send(reply);
                    }
                }
            }
        };

        if let Some(id) = registered_id {
            let mut slot = self.peer.lock().await;
            if slot.as_ref().map(|p| p.id) == Some(id) {
                tracing::warn!(host = %peer_host, "secondary control connection closed");
                *slot = None;
            }
        }
        result
    }

    async fn accept_register(
        &self,
        peer_host: &str,
        local_writer: &mut Option<BufWriter<OwnedWriteHalf>>,
        registered_id: &mut Option<u64>,
        acks_tx: &mut Option<mpsc::Sender<ReplyBody>>,
    ) -> io::Result<()> {
        let mut slot = self.peer.lock().await;
        if slot.is_some() {
            drop(slot);
            tracing::warn!(host = %peer_host, "second secondary tried to register");
            return self
                .reply_on_conn(local_writer, *registered_id, reply_code::BUSY, None)
                .await;
        }

        let Some(writer) = local_writer.take() else {
            // The slot was cleared under us and the writer is gone; the
            // connection is unusable for a fresh registration.
            return Err(io::Error::other("connection no longer owns its writer"));
        };

        tracing::info!(host = %peer_host, "registering {} as secondary server", peer_host);
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(4);
        let handle = PeerHandle {
            id,
            host: peer_host.to_string(),
            writer,
            acks: rx,
            authenticated: true,
            no_timeout: true,
        };
        tracing::debug!(
            host = %handle.host,
            authenticated = handle.authenticated,
            no_timeout = handle.no_timeout,
            "secondary connection marked non-expiring"
        );
        *slot = Some(handle);
        *registered_id = Some(id);
        *acks_tx = Some(tx);

        // Record the peer first, then return the host id as decimal text.
        if let Some(peer) = slot.as_mut() {
            let replied = send_bounded(
                &mut peer.writer,
                reply_code::OK,
                Some(self.cfg.hostid.to_string()),
            )
            .await;
            if let Err(e) = replied {
                *slot = None;
                *registered_id = None;
                *acks_tx = None;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Reply on this connection, wherever its writer currently lives.
    async fn reply_on_conn(
        &self,
        local_writer: &mut Option<BufWriter<OwnedWriteHalf>>,
        registered_id: Option<u64>,
        code: u32,
        text: Option<String>,
    ) -> io::Result<()> {
        if let Some(writer) = local_writer.as_mut() {
            return send_bounded(writer, code, text).await;
        }
        let mut slot = self.peer.lock().await;
        match (registered_id, slot.as_mut()) {
            (Some(id), Some(peer)) if peer.id == id => {
                send_bounded(&mut peer.writer, code, text).await
            }
            // The connection was superseded; there is nothing to write on.
            _ => Ok(()),
        }
    }

    /// Tell the secondary what to do because this primary is shutting down
    /// cleanly, and wait (bounded) for the acknowledgement. A missing ack
    /// is logged, never fatal.
    pub async fn signal_secondary_shutdown(&self, policy: ShutdownPolicy) {
        let mut slot = self.peer.lock().await;
        let Some(peer) = slot.as_mut() else {
            return; // no secondary, nothing to do
        };
        let kind = match policy {
            ShutdownPolicy::ShutdownSecondary => FailoverKind::SecdShutdown,
            ShutdownPolicy::LeaveInactive => FailoverKind::SecdGoInactive,
        };
        tracing::info!(host = %peer.host, ?policy, "signalling secondary before shutdown");

        // The handshake timer is stopped by now; drain any acknowledgements
        // still queued from it so the next one is ours.
        while peer.acks.try_recv().is_ok() {}

        let sent = timeout(
            Duration::from_secs(config::SEND_TIMEOUT_SECS),
            proto::write_request(&mut peer.writer, kind),
        )
        .await;
        if !matches!(sent, Ok(Ok(()))) {
            tracing::warn!(host = %peer.host, "could not signal secondary, proceeding with shutdown");
            *slot = None;
            return;
        }

        match timeout(
            Duration::from_secs(config::REPLY_DEADLINE_SECS),
            peer.acks.recv(),
        )
        .await
        {
            Ok(Some(reply)) if reply.code == reply_code::OK => {
                tracing::info!(host = %peer.host, "secondary acknowledged shutdown signal");
            }
            Ok(Some(reply)) => {
                tracing::warn!(host = %peer.host, code = reply.code, "secondary rejected shutdown signal");
            }
            _ => {
                tracing::warn!(host = %peer.host, "no acknowledgement from secondary before deadline");
            }
        }
    }
}

/// Framed reply with the bounded send deadline.
async fn send_bounded(
    writer: &mut BufWriter<OwnedWriteHalf>,
    code: u32,
    text: Option<String>,
) -> io::Result<()> {
    timeout(
        Duration::from_secs(config::SEND_TIMEOUT_SECS),
        proto::write_reply(writer, code, text),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "peer lost: reply send timed out"))?
}

/// How the reclaim sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// The secondary acknowledged and has gone idle; proceed to full
    /// initialisation as the active server.
    Reclaimed,
    /// Could not dial or address the secondary at all.
    Unreachable,
    /// Dialed, but the secondary never acknowledged the demand.
    NotAcknowledged,
}

/// Take control back from an active secondary.
///
/// Run at primary startup when the active marker was seen: dial the
/// secondary with a short deadline, send PRIM_IS_BACK, and block awaiting
/// the acknowledgement, the one place the primary waits on a reply for up
/// to ten minutes.
pub async fn takeover_from_secondary(
    secondary_host: &str,
    port: u16,
    auth: AuthMethod,
) -> ReclaimOutcome {
    let mut channel = match ControlChannel::dial(
        secondary_host,
        port,
        Duration::from_secs(config::RECLAIM_DIAL_TIMEOUT_SECS),
        auth,
    )
    .await
    {
        Ok(channel) => channel,
        Err(e) => {
            tracing::error!(host = secondary_host, "cannot reach active secondary: {}", e);
            return ReclaimOutcome::Unreachable;
        }
    };

    if let Err(e) = channel.send_request(FailoverKind::PrimIsBack).await {
        tracing::error!("could not communicate with secondary: {}", e);
        return ReclaimOutcome::Unreachable;
    }

    match timeout(
        Duration::from_secs(config::REPLY_DEADLINE_SECS),
        channel.next(),
    )
    .await
    {
        Ok(ChannelRead::Reply(reply)) if reply.code == reply_code::OK => {
            tracing::info!("have taken control from secondary server");
            ReclaimOutcome::Reclaimed
        }
        Ok(other) => {
            tracing::error!(?other, "secondary did not acknowledge reclaim");
            ReclaimOutcome::NotAcknowledged
        }
        Err(_) => {
            tracing::error!("secondary not idling before deadline");
            ReclaimOutcome::NotAcknowledged
        }
    }
}
