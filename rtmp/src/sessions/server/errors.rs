use crate::chunk_io::{ChunkDeserializationError, ChunkSerializationError};
use crate::messages::{MessageDeserializationError, MessageSerializationError};
use thiserror::Error;

/// Errors raised while a server session processes input or forms output
#[derive(Debug, Error)]
pub enum ServerSessionError {
    #[error("An error occurred deserializing incoming data: {0}")]
    ChunkDeserialization(#[from] ChunkDeserializationError),

    #[error("An error occurred serializing outbound messages: {0}")]
    ChunkSerialization(#[from] ChunkSerializationError),

    #[error("An error occurred while attempting to turn an RTMP message into a message payload: {0}")]
    MessageSerialization(#[from] MessageSerializationError),

    #[error("An error occurred while attempting to turn a message payload into an RTMP message: {0}")]
    MessageDeserialization(#[from] MessageDeserializationError),

    #[error("The connection request did not have a non-empty RTMP app name")]
    NoAppNameForConnectionRequest,

    #[error("The request id {0} could not be matched to an outstanding request")]
    InvalidRequestId(u32),

    #[error("The '{action}' action was attempted on non-existent stream id {stream_id}")]
    ActionAttemptedOnInactiveStream { action: String, stream_id: u32 },
}
