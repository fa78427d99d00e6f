//! # Stream Codec
//!
//! Framing of request/response and gossip records on a negotiated stream.
//!
//! ```text
//! request:         u32_be(len) || lz4(bincode(RequestBody))
//! response chunk:  status u8 || [context 4 bytes] || u32_be(len) || payload
//! gossip frame:    u32_be(len) || bincode(GossipFrame)
//! ```
//!
//! A success chunk carries a compressed [`ResponseBody`]; context bytes are
//! present only when the protocol uses [`ContextBytes::ForkDigest`]. Error
//! chunks carry a UTF-8 message of at most [`MAX_ERROR_MESSAGE_LEN`] bytes and
//! never carry context bytes.
//!
//! Clean end-of-stream before a status byte ends a response; any other short
//! read is an error.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chain::ForkDigest;
use crate::messages::{
    self, CodecError, GossipFrame, MAX_DESERIALIZE_SIZE, MAX_PAYLOAD_SIZE, RequestBody,
    ResponseBody,
};
use crate::protocols::{ContextBytes, Protocol};

pub const MAX_ERROR_MESSAGE_LEN: usize = 256;

/// Largest compressed frame accepted. LZ4 worst case plus the size header.
pub const MAX_COMPRESSED_SIZE: usize = MAX_PAYLOAD_SIZE + MAX_PAYLOAD_SIZE / 255 + 16 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RespStatus {
    Success,
    InvalidRequest,
    ServerError,
    ResourceUnavailable,
    RateLimited,
    Unknown(u8),
}

impl RespStatus {
    pub fn to_byte(self) -> u8 {
        match self {
            RespStatus::Success => 0,
            RespStatus::InvalidRequest => 1,
            RespStatus::ServerError => 2,
            RespStatus::ResourceUnavailable => 3,
            RespStatus::RateLimited => 139,
            RespStatus::Unknown(b) => b,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => RespStatus::Success,
            1 => RespStatus::InvalidRequest,
            2 => RespStatus::ServerError,
            3 => RespStatus::ResourceUnavailable,
            139 => RespStatus::RateLimited,
            other => RespStatus::Unknown(other),
        }
    }
}

impl std::fmt::Display for RespStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RespStatus::Success => f.write_str("SUCCESS"),
            RespStatus::InvalidRequest => f.write_str("INVALID_REQUEST"),
            RespStatus::ServerError => f.write_str("SERVER_ERROR"),
            RespStatus::ResourceUnavailable => f.write_str("RESOURCE_UNAVAILABLE"),
            RespStatus::RateLimited => f.write_str("RATE_LIMITED"),
            RespStatus::Unknown(b) => write!(f, "UNKNOWN({b})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseChunk {
    Success {
        context: Option<ForkDigest>,
        body: ResponseBody,
    },
    Error {
        status: RespStatus,
        message: String,
    },
}

// ============================================================================
// Length-Prefixed Frames
// ============================================================================

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u32::try_from(bytes.len()).map_err(|_| CodecError::TooLarge {
        size: bytes.len(),
        limit: u32::MAX as usize,
    })?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(bytes).await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, limit: usize) -> Result<Vec<u8>, CodecError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > limit {
        return Err(CodecError::TooLarge { size: len, limit });
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

// ============================================================================
// Requests
// ============================================================================

pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    body: &RequestBody,
) -> Result<(), CodecError> {
    let bytes = messages::encode_compressed(body)?;
    write_frame(w, &bytes).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one request and checks it matches `protocol`'s method.
pub async fn read_request<R: AsyncRead + Unpin>(
    r: &mut R,
    protocol: &Protocol,
) -> Result<RequestBody, CodecError> {
    let bytes = read_frame(r, MAX_COMPRESSED_SIZE).await?;
    let body: RequestBody = messages::decode_compressed(&bytes)?;
    if !protocol.method.accepts_request(&body) {
        return Err(CodecError::UnexpectedBody(protocol.method.as_str()));
    }
    Ok(body)
}

// ============================================================================
// Response Chunks
// ============================================================================

pub async fn write_success_chunk<W: AsyncWrite + Unpin>(
    w: &mut W,
    protocol: &Protocol,
    context: Option<ForkDigest>,
    body: &ResponseBody,
) -> Result<(), CodecError> {
    let bytes = messages::encode_compressed(body)?;
    w.write_u8(RespStatus::Success.to_byte()).await?;
    if protocol.context_bytes() == ContextBytes::ForkDigest {
        let digest = context.ok_or(CodecError::UnexpectedBody("missing context bytes"))?;
        w.write_all(&digest.0).await?;
    }
    write_frame(w, &bytes).await?;
    w.flush().await?;
    Ok(())
}

pub async fn write_error_chunk<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: RespStatus,
    message: &str,
) -> Result<(), CodecError> {
    let mut end = message.len().min(MAX_ERROR_MESSAGE_LEN);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    w.write_u8(status.to_byte()).await?;
    write_frame(w, &message.as_bytes()[..end]).await?;
    w.flush().await?;
    Ok(())
}

/// Reads the next chunk, or `None` on clean end of stream.
pub async fn read_response_chunk<R: AsyncRead + Unpin>(
    r: &mut R,
    protocol: &Protocol,
) -> Result<Option<ResponseChunk>, CodecError> {
    let mut status = [0u8; 1];
    if r.read(&mut status).await? == 0 {
        return Ok(None);
    }
    let status = RespStatus::from_byte(status[0]);

    if status != RespStatus::Success {
        let bytes = read_frame(r, MAX_ERROR_MESSAGE_LEN).await?;
        let message = String::from_utf8_lossy(&bytes).into_owned();
        return Ok(Some(ResponseChunk::Error { status, message }));
    }

    let context = match protocol.context_bytes() {
        ContextBytes::Empty => None,
        ContextBytes::ForkDigest => {
            let mut digest = [0u8; 4];
            r.read_exact(&mut digest).await?;
            Some(ForkDigest(digest))
        }
    };
    let bytes = read_frame(r, MAX_COMPRESSED_SIZE).await?;
    let body: ResponseBody = messages::decode_compressed(&bytes)?;
    if !protocol.accepts_response(&body) {
        return Err(CodecError::UnexpectedBody(body.name()));
    }
    Ok(Some(ResponseChunk::Success { context, body }))
}

// ============================================================================
// Gossip Frames
// ============================================================================

pub async fn write_gossip_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &GossipFrame,
) -> Result<(), CodecError> {
    let bytes = messages::serialize(frame)?;
    write_frame(w, &bytes).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_gossip_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<GossipFrame, CodecError> {
    let bytes = read_frame(r, MAX_DESERIALIZE_SIZE as usize).await?;
    messages::deserialize_bounded(&bytes)
}
