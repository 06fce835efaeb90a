use crate::messages::{MessageDeserializationError, MessageSerializationError, RtmpMessage};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub fn serialize(size: u32) -> Result<Vec<u8>, MessageSerializationError> {
    let mut cursor = Cursor::new(Vec::new());
    cursor.write_u32::<BigEndian>(size)?;
    Ok(cursor.into_inner())
}

pub fn deserialize(data: &[u8]) -> Result<RtmpMessage, MessageDeserializationError> {
    let mut cursor = Cursor::new(data);

    // The most significant bit is reserved and must be ignored
    let size = cursor.read_u32::<BigEndian>()? & 0x7FFFFFFF;
    Ok(RtmpMessage::SetChunkSize { size })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_serialize_and_deserialize() {
        let bytes = serialize(4096).unwrap();

        match deserialize(&bytes).unwrap() {
            RtmpMessage::SetChunkSize { size: 4096 } => (),
            x => panic!("Unexpected message: {:?}", x),
        }
    }

    #[test]
    fn deserialization_masks_the_reserved_high_bit() {
        let bytes = vec![0x80, 0x00, 0x10, 0x00];

        match deserialize(&bytes).unwrap() {
            RtmpMessage::SetChunkSize { size: 0x1000 } => (),
            x => panic!("Unexpected message: {:?}", x),
        }
    }
}
