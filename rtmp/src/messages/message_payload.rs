use super::types;
use super::RtmpMessage;
use super::{MessageDeserializationError, MessageSerializationError};
use crate::time::RtmpTimestamp;
use bytes::Bytes;

/// Message type ids for command and data messages in each object encoding.
/// In AMF3 encoding the ids shift and the body gains a leading format byte,
/// but the body itself is still AMF0 encoded.
const DATA_AMF0: u8 = 18;
const DATA_AMF3: u8 = 15;
const COMMAND_AMF0: u8 = 20;
const COMMAND_AMF3: u8 = 17;

/// Represents a raw RTMP message
#[derive(PartialEq, Debug, Clone)]
pub struct MessagePayload {
    pub timestamp: RtmpTimestamp,
    pub type_id: u8,
    pub message_stream_id: u32,
    pub data: Bytes,
}

impl MessagePayload {
    pub fn new() -> MessagePayload {
        MessagePayload {
            timestamp: RtmpTimestamp::new(0),
            message_stream_id: 0,
            type_id: 0,
            data: Bytes::new(),
        }
    }

    /// Deserializes the payload into its typed RTMP message
    pub fn to_rtmp_message(&self) -> Result<RtmpMessage, MessageDeserializationError> {
        match self.type_id {
            1 => types::set_chunk_size::deserialize(&self.data[..]),
            2 => types::abort::deserialize(&self.data[..]),
            3 => types::acknowledgement::deserialize(&self.data[..]),
            4 => types::user_control::deserialize(&self.data[..]),
            5 => types::window_acknowledgement_size::deserialize(&self.data[..]),
            6 => types::set_peer_bandwidth::deserialize(&self.data[..]),
            8 => types::audio_data::deserialize(self.data.clone()),
            9 => types::video_data::deserialize(self.data.clone()),
            DATA_AMF0 => types::amf0_data::deserialize(&self.data[..]),
            DATA_AMF3 => types::amf0_data::deserialize(strip_amf3_format_byte(&self.data[..])),
            COMMAND_AMF0 => types::amf0_command::deserialize(&self.data[..]),
            COMMAND_AMF3 => {
                types::amf0_command::deserialize(strip_amf3_format_byte(&self.data[..]))
            }
            _ => Ok(RtmpMessage::Unknown {
                type_id: self.type_id,
                data: self.data.clone(),
            }),
        }
    }

    /// Serializes an RTMP message into a payload with AMF0 object encoding
    pub fn from_rtmp_message(
        message: RtmpMessage,
        timestamp: RtmpTimestamp,
        message_stream_id: u32,
    ) -> Result<MessagePayload, MessageSerializationError> {
        MessagePayload::from_rtmp_message_with_encoding(
            message,
            timestamp,
            message_stream_id,
            false,
        )
    }

    /// Serializes an RTMP message into a payload.  When `amf3_encoding` is
    /// set, command and data messages use the shifted AMF3 type ids with a
    /// leading AMF0-format marker byte, as negotiated via the connect
    /// command's `objectEncoding` property.
    pub fn from_rtmp_message_with_encoding(
        message: RtmpMessage,
        timestamp: RtmpTimestamp,
        message_stream_id: u32,
        amf3_encoding: bool,
    ) -> Result<MessagePayload, MessageSerializationError> {
        let mut type_id = message_type_id(&message);

        let mut bytes = match message {
            RtmpMessage::Unknown { type_id: _, data } => data.to_vec(),

            RtmpMessage::Abort { stream_id } => types::abort::serialize(stream_id)?,

            RtmpMessage::Acknowledgement { sequence_number } => {
                types::acknowledgement::serialize(sequence_number)?
            }

            RtmpMessage::Amf0Command {
                command_name,
                transaction_id,
                command_object,
                additional_arguments,
            } => types::amf0_command::serialize(
                command_name,
                transaction_id,
                command_object,
                additional_arguments,
            )?,

            RtmpMessage::Amf0Data { values } => types::amf0_data::serialize(values)?,

            RtmpMessage::AudioData { data } => types::audio_data::serialize(data)?,

            RtmpMessage::SetChunkSize { size } => types::set_chunk_size::serialize(size)?,

            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                types::set_peer_bandwidth::serialize(limit_type, size)?
            }

            RtmpMessage::UserControl {
                event_type,
                stream_id,
                buffer_length,
                timestamp,
            } => types::user_control::serialize(event_type, stream_id, buffer_length, timestamp)?,

            RtmpMessage::VideoData { data } => types::video_data::serialize(data)?,

            RtmpMessage::WindowAcknowledgement { size } => {
                types::window_acknowledgement_size::serialize(size)?
            }
        };

        if amf3_encoding {
            match type_id {
                COMMAND_AMF0 => {
                    type_id = COMMAND_AMF3;
                    bytes.insert(0, 0);
                }
                DATA_AMF0 => {
                    type_id = DATA_AMF3;
                    bytes.insert(0, 0);
                }
                _ => (),
            }
        }

        Ok(MessagePayload {
            data: Bytes::from(bytes),
            type_id,
            message_stream_id,
            timestamp,
        })
    }
}

fn strip_amf3_format_byte(data: &[u8]) -> &[u8] {
    // An AMF3 envelope starts with a format byte (0x00 = the body is plain
    // AMF0), then the body follows as usual.
    if data.first() == Some(&0) {
        &data[1..]
    } else {
        data
    }
}

fn message_type_id(message: &RtmpMessage) -> u8 {
    match *message {
        RtmpMessage::Unknown { type_id, .. } => type_id,
        RtmpMessage::SetChunkSize { .. } => 1,
        RtmpMessage::Abort { .. } => 2,
        RtmpMessage::Acknowledgement { .. } => 3,
        RtmpMessage::UserControl { .. } => 4,
        RtmpMessage::WindowAcknowledgement { .. } => 5,
        RtmpMessage::SetPeerBandwidth { .. } => 6,
        RtmpMessage::AudioData { .. } => 8,
        RtmpMessage::VideoData { .. } => 9,
        RtmpMessage::Amf0Data { .. } => DATA_AMF0,
        RtmpMessage::Amf0Command { .. } => COMMAND_AMF0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{PeerBandwidthLimitType, UserControlEventType};
    use lml_amf0::Amf0Value;

    fn round_trip(message: RtmpMessage, expected_type_id: u8) {
        let payload =
            MessagePayload::from_rtmp_message(message.clone(), RtmpTimestamp::new(55), 15)
                .unwrap();

        assert_eq!(payload.type_id, expected_type_id, "incorrect type id");
        assert_eq!(payload.message_stream_id, 15);
        assert_eq!(payload.timestamp, 55);

        let result = payload.to_rtmp_message().unwrap();
        assert_eq!(result, message);
    }

    #[test]
    fn set_chunk_size_round_trips() {
        round_trip(RtmpMessage::SetChunkSize { size: 4096 }, 1);
    }

    #[test]
    fn abort_round_trips() {
        round_trip(RtmpMessage::Abort { stream_id: 23 }, 2);
    }

    #[test]
    fn acknowledgement_round_trips() {
        round_trip(RtmpMessage::Acknowledgement { sequence_number: 23 }, 3);
    }

    #[test]
    fn user_control_round_trips() {
        round_trip(
            RtmpMessage::UserControl {
                event_type: UserControlEventType::StreamBegin,
                stream_id: Some(33),
                buffer_length: None,
                timestamp: None,
            },
            4,
        );
    }

    #[test]
    fn window_acknowledgement_round_trips() {
        round_trip(RtmpMessage::WindowAcknowledgement { size: 25 }, 5);
    }

    #[test]
    fn set_peer_bandwidth_round_trips() {
        round_trip(
            RtmpMessage::SetPeerBandwidth {
                size: 33,
                limit_type: PeerBandwidthLimitType::Hard,
            },
            6,
        );
    }

    #[test]
    fn audio_data_round_trips() {
        round_trip(
            RtmpMessage::AudioData {
                data: Bytes::from(vec![33_u8]),
            },
            8,
        );
    }

    #[test]
    fn video_data_round_trips() {
        round_trip(
            RtmpMessage::VideoData {
                data: Bytes::from(vec![23_u8]),
            },
            9,
        );
    }

    #[test]
    fn amf0_data_round_trips() {
        round_trip(
            RtmpMessage::Amf0Data {
                values: vec![Amf0Value::Number(23.0)],
            },
            18,
        );
    }

    #[test]
    fn amf0_command_round_trips() {
        round_trip(
            RtmpMessage::Amf0Command {
                command_name: "test".to_string(),
                transaction_id: 23.0,
                command_object: Amf0Value::Null,
                additional_arguments: vec![Amf0Value::Number(2.0)],
            },
            20,
        );
    }

    #[test]
    fn unknown_message_round_trips() {
        round_trip(
            RtmpMessage::Unknown {
                type_id: 33,
                data: Bytes::from(vec![23_u8]),
            },
            33,
        );
    }

    #[test]
    fn amf3_encoding_shifts_command_type_id_and_prefixes_format_byte() {
        let message = RtmpMessage::Amf0Command {
            command_name: "onStatus".to_string(),
            transaction_id: 0.0,
            command_object: Amf0Value::Null,
            additional_arguments: vec![],
        };

        let payload = MessagePayload::from_rtmp_message_with_encoding(
            message.clone(),
            RtmpTimestamp::new(0),
            1,
            true,
        )
        .unwrap();

        assert_eq!(payload.type_id, 17);
        assert_eq!(payload.data[0], 0);

        // The AMF3 envelope deserializes back to the same command
        let result = payload.to_rtmp_message().unwrap();
        assert_eq!(result, message);
    }
}
