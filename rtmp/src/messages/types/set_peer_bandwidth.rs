use crate::messages::{
    MessageDeserializationError, MessageSerializationError, PeerBandwidthLimitType, RtmpMessage,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub fn serialize(
    limit_type: PeerBandwidthLimitType,
    size: u32,
) -> Result<Vec<u8>, MessageSerializationError> {
    let mut cursor = Cursor::new(Vec::new());
    cursor.write_u32::<BigEndian>(size)?;

    let limit_type_id = match limit_type {
        PeerBandwidthLimitType::Hard => 0,
        PeerBandwidthLimitType::Soft => 1,
        PeerBandwidthLimitType::Dynamic => 2,
    };

    cursor.write_u8(limit_type_id)?;
    Ok(cursor.into_inner())
}

pub fn deserialize(data: &[u8]) -> Result<RtmpMessage, MessageDeserializationError> {
    let mut cursor = Cursor::new(data);
    let size = cursor.read_u32::<BigEndian>()?;
    let limit_type = match cursor.read_u8()? {
        0 => PeerBandwidthLimitType::Hard,
        1 => PeerBandwidthLimitType::Soft,
        2 => PeerBandwidthLimitType::Dynamic,
        x => {
            return Err(MessageDeserializationError::InvalidMessageFormat {
                message: format!("unknown peer bandwidth limit type {}", x),
            })
        }
    };

    Ok(RtmpMessage::SetPeerBandwidth { size, limit_type })
}
