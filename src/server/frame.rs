//! Binary chunk frame codec.
//!
//! Upload chunks travel as one binary WebSocket message each:
//!
//! ```text
//! [21 bytes correlation id][u16 BE header length][JSON ChunkMeta][payload]
//! ```
//!
//! The correlation id doubles as the upload session id, so all chunks of
//! one file carry the same prefix and every response can echo it back.

use anyhow::{Context, Result};
use bytes::Bytes;

use crate::upload::ChunkMeta;

/// Correlation ids are nanoid-style, always 21 bytes of ASCII.
pub const CORRELATION_ID_LEN: usize = 21;

const HEADER_LEN_BYTES: usize = 2;

#[derive(Debug)]
pub struct ChunkFrame {
    pub correlation_id: String,
    pub meta: ChunkMeta,
    pub payload: Bytes,
}

pub fn parse_chunk_frame(frame: &[u8]) -> Result<ChunkFrame> {
    anyhow::ensure!(
        frame.len() >= CORRELATION_ID_LEN + HEADER_LEN_BYTES,
        "chunk frame truncated: {} bytes",
        frame.len()
    );
    let correlation_id = std::str::from_utf8(&frame[..CORRELATION_ID_LEN])
        .context("correlation id is not valid UTF-8")?
        .to_string();
    let header_len = u16::from_be_bytes([
        frame[CORRELATION_ID_LEN],
        frame[CORRELATION_ID_LEN + 1],
    ]) as usize;
    let header_start = CORRELATION_ID_LEN + HEADER_LEN_BYTES;
    anyhow::ensure!(
        frame.len() >= header_start + header_len,
        "chunk frame header truncated"
    );
    let meta: ChunkMeta = serde_json::from_slice(&frame[header_start..header_start + header_len])
        .context("chunk metadata header did not parse")?;
    let payload = Bytes::copy_from_slice(&frame[header_start + header_len..]);
    Ok(ChunkFrame {
        correlation_id,
        meta,
        payload,
    })
}

pub fn encode_chunk_frame(correlation_id: &str, meta: &ChunkMeta, payload: &[u8]) -> Result<Vec<u8>> {
    anyhow::ensure!(
        correlation_id.len() == CORRELATION_ID_LEN,
        "correlation id must be exactly {} bytes",
        CORRELATION_ID_LEN
    );
    let header = serde_json::to_vec(meta)?;
    anyhow::ensure!(header.len() <= u16::MAX as usize, "chunk metadata too large");
    let mut frame = Vec::with_capacity(CORRELATION_ID_LEN + HEADER_LEN_BYTES + header.len() + payload.len());
    frame.extend_from_slice(correlation_id.as_bytes());
    frame.extend_from_slice(&(header.len() as u16).to_be_bytes());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    Ok(frame)
}
