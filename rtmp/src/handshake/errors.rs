use thiserror::Error;

/// Errors that can occur while processing handshake bytes
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("First byte of the handshake was not the expected version of 3")]
    BadVersionId,

    #[error("Packet 2 did not echo the random data we sent in packet 1")]
    IncorrectRandomData,

    #[error("Packet 2 did not contain the epoch we sent in packet 1")]
    IncorrectPeerTime,

    #[error("Handshake bytes were given after the handshake has already completed")]
    HandshakeAlreadyCompleted,

    #[error("Digest offset {offset} is out of range")]
    DigestOffsetOutOfRange { offset: usize },
}
