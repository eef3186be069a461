//! The control-channel handle.
//!
//! A [`ControlChannel`] is the secondary's upstream connection (and the
//! restarted primary's reclaim connection): a deadline-bounded dial, a
//! framed send with a send-timeout, and a reader task that turns the inbound
//! stream into [`ChannelRead`] events. At most one channel exists per
//! process; holding one implies the peer is authenticated and exempt from
//! idle timeouts.

use super::proto::{self, Message, ReplyBody};
use batchd_core::config;
use batchd_core::failover::{AuthMethod, FailoverKind};
use std::io;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// What the read side delivered.
#[derive(Debug)]
pub enum ChannelRead {
    /// An inbound failover request.
    Request { kind: FailoverKind },
    /// An inbound request with a tag nobody recognises. The receiver must
    /// still reply (with a system-error code), so this is not a decode error.
    UnknownRequest,
    /// A reply to a request we sent.
    Reply(ReplyBody),
    /// The peer closed the connection.
    Eof,
    /// A read or decode failure other than EOF.
    DecodeError,
}

/// One authenticated control connection to the peer.
pub struct ControlChannel {
    writer: BufWriter<OwnedWriteHalf>,
    events: mpsc::Receiver<ChannelRead>,
    reader_task: JoinHandle<()>,
    auth: AuthMethod,
    authenticated: bool,
    no_timeout: bool,
}

impl ControlChannel {
    /// Dial the peer with a bounded deadline.
    pub async fn dial(
        host: &str,
        port: u16,
        deadline: Duration,
        auth: AuthMethod,
    ) -> io::Result<Self> {
        let stream = timeout(deadline, TcpStream::connect((host, port)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect deadline exceeded"))??;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, auth))
    }

    /// Wrap an established stream. The connection is marked authenticated
    /// and idle-timeout exempt: registration is the only way a channel
    /// comes to exist.
    pub fn from_stream(stream: TcpStream, auth: AuthMethod) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(8);
        let reader_task = tokio::spawn(read_loop(BufReader::new(read_half), tx));
        Self {
            writer: BufWriter::new(write_half),
            events: rx,
            reader_task,
            auth,
            authenticated: true,
            no_timeout: true,
        }
    }

    pub fn auth(&self) -> AuthMethod {
        self.auth
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_timeout_exempt(&self) -> bool {
        self.no_timeout
    }

    /// Send a failover request with the bounded send deadline.
    ///
    /// A timeout is *peer-lost*: the caller closes the channel and treats
    /// the peer as down.
    pub async fn send_request(&mut self, kind: FailoverKind) -> io::Result<()> {
        timeout(
            Duration::from_secs(config::SEND_TIMEOUT_SECS),
            proto::write_request(&mut self.writer, kind),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "peer lost: send timed out"))?
    }

    /// Send a reply with the bounded send deadline.
    pub async fn send_reply(&mut self, code: u32, text: Option<String>) -> io::Result<()> {
        timeout(
            Duration::from_secs(config::SEND_TIMEOUT_SECS),
            proto::write_reply(&mut self.writer, code, text),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "peer lost: send timed out"))?
    }

    /// Next inbound event. Returns [`ChannelRead::Eof`] if the reader task
    /// is gone and the queue is drained. Cancel-safe.
    pub async fn next(&mut self) -> ChannelRead {
        self.events.recv().await.unwrap_or(ChannelRead::Eof)
    }

    /// Block until the peer closes the connection, up to `deadline`.
    /// Anything the peer sends meanwhile is discarded.
    pub async fn await_peer_close(&mut self, deadline: Duration) {
        let _ = timeout(deadline, async {
            loop {
                match self.events.recv().await {
                    Some(ChannelRead::Eof) | Some(ChannelRead::DecodeError) | None => break,
                    Some(other) => {
                        tracing::debug!(?other, "discarding message while waiting for peer close");
                    }
                }
            }
        })
        .await;
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Reader half: decode frames into events until the stream ends.
async fn read_loop(mut reader: BufReader<OwnedReadHalf>, tx: mpsc::Sender<ChannelRead>) {
    loop {
        let event = match proto::read_frame(&mut reader).await {
            Ok(Message::Request(body)) => match FailoverKind::from_tag(body.tag) {
                Some(kind) => ChannelRead::Request { kind },
                None => ChannelRead::UnknownRequest,
            },
            Ok(Message::Reply(body)) => ChannelRead::Reply(body),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                let _ = tx.send(ChannelRead::Eof).await;
                return;
            }
            Err(e) => {
                tracing::debug!("control channel read failed: {}", e);
                let _ = tx.send(ChannelRead::DecodeError).await;
                return;
            }
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dial_refused_port_fails() {
        // Bind then drop to get a port with no listener.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = ControlChannel::dial(
            "127.0.0.1",
            port,
            Duration::from_secs(2),
            AuthMethod::Reserved,
        )
        .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn request_travels_and_eof_is_seen() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ch = ControlChannel::from_stream(stream, AuthMethod::Reserved);
            let got = ch.next().await;
            assert!(matches!(
                got,
                ChannelRead::Request {
                    kind: FailoverKind::Handshake
                }
            ));
            // Drop: the client sees EOF.
        });

        let mut client = ControlChannel::dial(
            "127.0.0.1",
            port,
            Duration::from_secs(5),
            AuthMethod::Reserved,
        )
        .await
        .unwrap();
        assert!(client.is_authenticated());
        assert!(client.is_timeout_exempt());
        client.send_request(FailoverKind::Handshake).await.unwrap();

        server.await.unwrap();
        assert!(matches!(client.next().await, ChannelRead::Eof));
    }
}
