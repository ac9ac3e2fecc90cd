//! Wire framing, version 1. All integers are little-endian.
//!
//! ```text
//! client -> server  [u32 len][len bytes JSON request]
//! server -> client  [u32 len][len bytes JSON response]
//!                   [u64 payload len]           always present, 0 if no payload
//!                   [payload len raw bytes]     only when payload len > 0
//! ```
//!
//! Both sides must send each JSON part with its prefix; a peer that writes bare
//! JSON is rejected as a protocol error.

use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::protocol::{Reply, Response};

/// Upper bound for a single JSON part.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const PAYLOAD_CHUNK: usize = 64 * 1024;

async fn timed<T, F>(limit: Duration, fut: F) -> Result<T, ProtocolError>
where
    F: Future<Output = Result<T, ProtocolError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout(limit)),
    }
}

fn eof_as(what: &'static str) -> impl Fn(std::io::Error) -> ProtocolError {
    move |e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            ProtocolError::UnexpectedEof(what)
        } else {
            ProtocolError::Io(e)
        }
    }
}

async fn read_json_part<R: AsyncRead + Unpin>(
    reader: &mut R,
    prefix: &mut [u8; 4],
    filled: usize,
    what: &'static str,
) -> Result<Vec<u8>, ProtocolError> {
    reader
        .read_exact(&mut prefix[filled..])
        .await
        .map_err(eof_as(what))?;
    let len = u32::from_le_bytes(*prefix) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(eof_as(what))?;
    Ok(body)
}

/// Read one request.
///
/// Waiting for the first byte is unbounded (an idle client is allowed); once
/// a request has started, the rest of it must arrive within `limit`.
/// Returns `Ok(None)` when the peer closed cleanly between requests.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: Duration,
) -> Result<Option<serde_json::Value>, ProtocolError> {
    let mut prefix = [0u8; 4];
    let n = reader.read(&mut prefix[..1]).await?;
    if n == 0 {
        return Ok(None);
    }

    let body = timed(limit, read_json_part(reader, &mut prefix, 1, "request")).await?;
    let value = serde_json::from_slice(&body)?;
    Ok(Some(value))
}

/// Write a response, its length field and its payload, then flush.
pub async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: &Reply,
    limit: Duration,
) -> Result<(), ProtocolError> {
    let json = serde_json::to_vec(&reply.response)?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: json.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut head = Vec::with_capacity(4 + json.len() + 8);
    head.extend_from_slice(&(json.len() as u32).to_le_bytes());
    head.extend_from_slice(&json);
    head.extend_from_slice(&(reply.payload.len() as u64).to_le_bytes());

    timed(limit, async {
        writer.write_all(&head).await?;
        if !reply.payload.is_empty() {
            writer.write_all(&reply.payload).await?;
        }
        writer.flush().await?;
        Ok(())
    })
    .await
}

/// Client side: send one request.
///
/// The daemon itself never calls the client half; it is the reference
/// counterpart of `read_request`/`write_reply` that the tests talk through.
#[allow(dead_code)]
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &serde_json::Value,
) -> Result<(), ProtocolError> {
    let json = serde_json::to_vec(request)?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: json.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(&(json.len() as u32).to_le_bytes()).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

/// Client side: read a response and exactly the payload it announces.
#[allow(dead_code)]
pub async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Reply, ProtocolError> {
    let mut prefix = [0u8; 4];
    let body = read_json_part(reader, &mut prefix, 0, "response").await?;
    let response: Response = serde_json::from_slice(&body)?;

    // A short header, including an immediate close, is terminal.
    let mut header = [0u8; 8];
    let mut got = 0;
    while got < header.len() {
        let n = reader.read(&mut header[got..]).await?;
        if n == 0 {
            return Err(ProtocolError::UnexpectedEof("payload length"));
        }
        got += n;
    }
    let expected = u64::from_le_bytes(header);

    let mut payload = Vec::with_capacity(expected.min(PAYLOAD_CHUNK as u64) as usize);
    let mut chunk = vec![0u8; PAYLOAD_CHUNK];
    let mut remaining = expected;
    while remaining > 0 {
        let want = remaining.min(PAYLOAD_CHUNK as u64) as usize;
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(ProtocolError::IncompletePayload {
                expected,
                received: expected - remaining,
            });
        }
        payload.extend_from_slice(&chunk[..n]);
        remaining -= n as u64;
    }

    Ok(Reply { response, payload })
}
