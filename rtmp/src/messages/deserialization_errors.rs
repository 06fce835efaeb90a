use lml_amf0::Amf0DeserializationError;
use std::io;
use thiserror::Error;

/// Errors raised while turning a message payload into an `RtmpMessage`
#[derive(Debug, Error)]
pub enum MessageDeserializationError {
    #[error("The message contained an invalid or unknown value: {message}")]
    InvalidMessageFormat { message: String },

    #[error("Failed to decode an AMF0 encoded portion of the message: {0}")]
    Amf0Error(#[from] Amf0DeserializationError),

    #[error("Failed to read message bytes: {0}")]
    Io(#[from] io::Error),
}
