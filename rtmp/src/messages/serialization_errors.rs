use lml_amf0::Amf0SerializationError;
use std::io;
use thiserror::Error;

/// Errors raised while turning an `RtmpMessage` into a message payload
#[derive(Debug, Error)]
pub enum MessageSerializationError {
    #[error("Failed to encode an AMF0 encoded portion of the message: {0}")]
    Amf0Error(#[from] Amf0SerializationError),

    #[error("Failed to write message bytes: {0}")]
    Io(#[from] io::Error),
}
