//! Control-channel wire protocol: binary-framed messages over TCP.
//!
//! Every message is `[u32 msg_type BE][u32 payload_len BE][u32 crc32 BE][payload]`.
//! A failover request body is JSON `{"tag": <1..6>}`; a reply body is JSON
//! `{"code": <u32>}` with an optional `"text"` field. The REGISTER reply
//! text is the primary's host identifier as decimal ASCII, no trailing
//! newline.

use batchd_core::failover::FailoverKind;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// ── Message type constants ───────────────────────────────────────────

pub const MSG_REQUEST: u32 = 0x01;
pub const MSG_REPLY: u32 = 0x02;

/// Maximum single message payload. Control messages are tiny; anything
/// larger is a framing error.
const MAX_PAYLOAD_SIZE: u32 = 64 * 1024;

// ── Typed message payloads ───────────────────────────────────────────

/// A failover request: a single unsigned tag naming the message kind.
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestBody {
    pub tag: u32,
}

/// A reply: code 0 is an acknowledgement; REGISTER replies carry the
/// primary's host identifier in `text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyBody {
    pub code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// A decoded inbound message.
#[derive(Debug)]
pub enum Message {
    Request(RequestBody),
    Reply(ReplyBody),
}

// ── Encode / decode ──────────────────────────────────────────────────

/// Write a framed message: `[msg_type u32 BE][payload_len u32 BE][crc32 u32 BE][payload]`.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: u32,
    payload: &[u8],
) -> io::Result<()> {
    let mut header = [0u8; 12];
    header[..4].copy_from_slice(&msg_type.to_be_bytes());
    header[4..8].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    header[8..12].copy_from_slice(&crc32fast::hash(payload).to_be_bytes());
    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read a framed message, returning `(msg_type, payload)` after verifying
/// the payload checksum.
pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<(u32, Vec<u8>)> {
    let mut header = [0u8; 12];
    reader.read_exact(&mut header).await?;
    let msg_type = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let payload_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let stored_crc = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload too large: {} bytes", payload_len),
        ));
    }
    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    if crc32fast::hash(&payload) != stored_crc {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message checksum mismatch",
        ));
    }
    Ok((msg_type, payload))
}

/// Serialize a serde-compatible value to JSON bytes.
pub fn encode_json<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| io::Error::other(e.to_string()))
}

/// Deserialize a serde-compatible value from JSON bytes.
pub fn decode_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> io::Result<T> {
    serde_json::from_slice(bytes).map_err(|e| io::Error::other(e.to_string()))
}

// ── Failover message helpers ─────────────────────────────────────────

/// Send a failover request.
pub async fn write_request<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    kind: FailoverKind,
) -> io::Result<()> {
    let body = RequestBody { tag: kind.tag() };
    write_message(writer, MSG_REQUEST, &encode_json(&body)?).await
}

/// Send a reply. `text` is set only on the REGISTER reply.
pub async fn write_reply<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    code: u32,
    text: Option<String>,
) -> io::Result<()> {
    let body = ReplyBody { code, text };
    write_message(writer, MSG_REPLY, &encode_json(&body)?).await
}

/// Read and decode the next message on the channel.
///
/// EOF surfaces as `ErrorKind::UnexpectedEof`; any other failure (including
/// an unknown message type) is a decode error.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Message> {
    let (msg_type, payload) = read_message(reader).await?;
    match msg_type {
        MSG_REQUEST => Ok(Message::Request(decode_json(&payload)?)),
        MSG_REPLY => Ok(Message::Reply(decode_json(&payload)?)),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown message type {:#x}", other),
        )),
    }
}
