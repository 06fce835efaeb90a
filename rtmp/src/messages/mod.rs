//! Typed representations of the RTMP message types the server works with,
//! and conversions between them and raw message payloads.

mod deserialization_errors;
mod message_payload;
mod serialization_errors;
mod types;

pub use self::deserialization_errors::MessageDeserializationError;
pub use self::message_payload::MessagePayload;
pub use self::serialization_errors::MessageSerializationError;

use crate::time::RtmpTimestamp;
use bytes::Bytes;
use lml_amf0::Amf0Value;

/// How a peer should enforce the bandwidth limit it was given
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum PeerBandwidthLimitType {
    Hard,
    Soft,
    Dynamic,
}

/// The user control events of message type 4
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum UserControlEventType {
    StreamBegin,
    StreamEof,
    StreamDry,
    SetBufferLength,
    StreamIsRecorded,
    PingRequest,
    PingResponse,
    BufferEmpty,
    BufferReady,
}

/// An RTMP message in deserialized form
#[derive(PartialEq, Debug, Clone)]
pub enum RtmpMessage {
    Unknown {
        type_id: u8,
        data: Bytes,
    },

    Abort {
        stream_id: u32,
    },

    Acknowledgement {
        sequence_number: u32,
    },

    Amf0Command {
        command_name: String,
        transaction_id: f64,
        command_object: Amf0Value,
        additional_arguments: Vec<Amf0Value>,
    },

    Amf0Data {
        values: Vec<Amf0Value>,
    },

    AudioData {
        data: Bytes,
    },

    SetChunkSize {
        size: u32,
    },

    SetPeerBandwidth {
        size: u32,
        limit_type: PeerBandwidthLimitType,
    },

    UserControl {
        event_type: UserControlEventType,
        stream_id: Option<u32>,
        buffer_length: Option<u32>,
        timestamp: Option<RtmpTimestamp>,
    },

    VideoData {
        data: Bytes,
    },

    WindowAcknowledgement {
        size: u32,
    },
}

impl RtmpMessage {
    /// Forms a message payload out of this message with AMF0 object encoding
    pub fn into_message_payload(
        self,
        timestamp: RtmpTimestamp,
        message_stream_id: u32,
    ) -> Result<MessagePayload, MessageSerializationError> {
        MessagePayload::from_rtmp_message(self, timestamp, message_stream_id)
    }
}
