use std::io;
use thiserror::Error;

/// Errors raised while turning RTMP messages into chunks
#[derive(Debug, Error)]
pub enum ChunkSerializationError {
    #[error("The message is too long ({size} bytes), messages cannot exceed 16777215 bytes")]
    MessageTooLong { size: u32 },

    #[error("Requested max chunk size of {chunk_size} is not within 1..=65536")]
    InvalidMaxChunkSize { chunk_size: u32 },

    #[error("Failed to write chunk bytes: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to form a set chunk size message: {0}")]
    MessageSerialization(#[from] crate::messages::MessageSerializationError),
}
