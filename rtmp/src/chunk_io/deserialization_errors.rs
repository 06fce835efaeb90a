use std::io;
use thiserror::Error;

/// Errors raised while turning bytes into RTMP messages
#[derive(Debug, Error)]
pub enum ChunkDeserializationError {
    #[error("Chunk with format 1, 2, or 3 arrived on csid {csid} before any format 0 chunk")]
    NoPreviousChunkOnStream { csid: u32 },

    #[error("Requested max chunk size of {chunk_size} is not within 1..=65536")]
    InvalidMaxChunkSize { chunk_size: usize },

    #[error("Failed to read chunk bytes: {0}")]
    Io(#[from] io::Error),
}
