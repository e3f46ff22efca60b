//! Chunking and chunk encoding
//!
//! The channel carries JSON text, so chunk bytes travel as standard base64.

use base64::prelude::*;

use crate::types::Result;

/// Split `content` into `chunk_size` slices; the last one may be shorter.
/// Empty content yields no chunks.
pub fn split_chunks(content: &[u8], chunk_size: usize) -> impl Iterator<Item = &[u8]> {
    content.chunks(chunk_size.max(1))
}

/// Number of chunks `split_chunks` yields for `len` bytes
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}

pub fn encode_chunk(chunk: &[u8]) -> String {
    BASE64_STANDARD.encode(chunk)
}

pub fn decode_chunk(data: &str) -> Result<Vec<u8>> {
    Ok(BASE64_STANDARD.decode(data)?)
}
