use crate::messages::{
    MessageDeserializationError, MessageSerializationError, RtmpMessage, UserControlEventType,
};
use crate::time::RtmpTimestamp;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

const STREAM_BEGIN: u16 = 0;
const STREAM_EOF: u16 = 1;
const STREAM_DRY: u16 = 2;
const SET_BUFFER_LENGTH: u16 = 3;
const STREAM_IS_RECORDED: u16 = 4;
const PING_REQUEST: u16 = 6;
const PING_RESPONSE: u16 = 7;
const BUFFER_EMPTY: u16 = 31;
const BUFFER_READY: u16 = 32;

pub fn serialize(
    event_type: UserControlEventType,
    stream_id: Option<u32>,
    buffer_length: Option<u32>,
    timestamp: Option<RtmpTimestamp>,
) -> Result<Vec<u8>, MessageSerializationError> {
    let mut cursor = Cursor::new(Vec::new());

    let event_id = match event_type {
        UserControlEventType::StreamBegin => STREAM_BEGIN,
        UserControlEventType::StreamEof => STREAM_EOF,
        UserControlEventType::StreamDry => STREAM_DRY,
        UserControlEventType::SetBufferLength => SET_BUFFER_LENGTH,
        UserControlEventType::StreamIsRecorded => STREAM_IS_RECORDED,
        UserControlEventType::PingRequest => PING_REQUEST,
        UserControlEventType::PingResponse => PING_RESPONSE,
        UserControlEventType::BufferEmpty => BUFFER_EMPTY,
        UserControlEventType::BufferReady => BUFFER_READY,
    };

    cursor.write_u16::<BigEndian>(event_id)?;

    if event_id <= STREAM_IS_RECORDED || event_id == BUFFER_EMPTY || event_id == BUFFER_READY {
        cursor.write_u32::<BigEndian>(stream_id.unwrap_or(0))?;
    }

    if event_id == SET_BUFFER_LENGTH {
        cursor.write_u32::<BigEndian>(buffer_length.unwrap_or(0))?;
    }

    if event_id == PING_REQUEST || event_id == PING_RESPONSE {
        cursor.write_u32::<BigEndian>(timestamp.map(|time| time.value).unwrap_or(0))?;
    }

    Ok(cursor.into_inner())
}

pub fn deserialize(data: &[u8]) -> Result<RtmpMessage, MessageDeserializationError> {
    let mut cursor = Cursor::new(data);

    let mut stream_id = None;
    let mut buffer_length = None;
    let mut timestamp = None;

    let event_id = cursor.read_u16::<BigEndian>()?;
    let event_type = match event_id {
        STREAM_BEGIN => UserControlEventType::StreamBegin,
        STREAM_EOF => UserControlEventType::StreamEof,
        STREAM_DRY => UserControlEventType::StreamDry,
        SET_BUFFER_LENGTH => UserControlEventType::SetBufferLength,
        STREAM_IS_RECORDED => UserControlEventType::StreamIsRecorded,
        PING_REQUEST => UserControlEventType::PingRequest,
        PING_RESPONSE => UserControlEventType::PingResponse,
        BUFFER_EMPTY => UserControlEventType::BufferEmpty,
        BUFFER_READY => UserControlEventType::BufferReady,
        x => {
            return Err(MessageDeserializationError::InvalidMessageFormat {
                message: format!("unknown user control event type {}", x),
            })
        }
    };

    if event_id <= STREAM_IS_RECORDED || event_id == BUFFER_EMPTY || event_id == BUFFER_READY {
        stream_id = Some(cursor.read_u32::<BigEndian>()?);
    }

    if event_id == SET_BUFFER_LENGTH {
        buffer_length = Some(cursor.read_u32::<BigEndian>()?);
    }

    if event_id == PING_REQUEST || event_id == PING_RESPONSE {
        timestamp = Some(RtmpTimestamp::new(cursor.read_u32::<BigEndian>()?));
    }

    Ok(RtmpMessage::UserControl {
        event_type,
        stream_id,
        buffer_length,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_begin_round_trips() {
        let bytes = serialize(UserControlEventType::StreamBegin, Some(1), None, None).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 1]);

        match deserialize(&bytes).unwrap() {
            RtmpMessage::UserControl {
                event_type: UserControlEventType::StreamBegin,
                stream_id: Some(1),
                buffer_length: None,
                timestamp: None,
            } => (),
            x => panic!("Unexpected message: {:?}", x),
        }
    }

    #[test]
    fn set_buffer_length_round_trips() {
        let bytes = serialize(
            UserControlEventType::SetBufferLength,
            Some(1),
            Some(3000),
            None,
        )
        .unwrap();

        match deserialize(&bytes).unwrap() {
            RtmpMessage::UserControl {
                event_type: UserControlEventType::SetBufferLength,
                stream_id: Some(1),
                buffer_length: Some(3000),
                timestamp: None,
            } => (),
            x => panic!("Unexpected message: {:?}", x),
        }
    }

    #[test]
    fn ping_request_round_trips() {
        let bytes = serialize(
            UserControlEventType::PingRequest,
            None,
            None,
            Some(RtmpTimestamp::new(7777)),
        )
        .unwrap();

        match deserialize(&bytes).unwrap() {
            RtmpMessage::UserControl {
                event_type: UserControlEventType::PingRequest,
                stream_id: None,
                buffer_length: None,
                timestamp: Some(time),
            } => assert_eq!(time, 7777),
            x => panic!("Unexpected message: {:?}", x),
        }
    }

    #[test]
    fn error_on_unknown_event_type() {
        let bytes = vec![0, 99, 0, 0, 0, 0];

        match deserialize(&bytes) {
            Err(MessageDeserializationError::InvalidMessageFormat { .. }) => (),
            x => panic!("Expected InvalidMessageFormat, got {:?}", x),
        }
    }
}
