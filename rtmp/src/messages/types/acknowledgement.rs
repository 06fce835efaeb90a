use crate::messages::{MessageDeserializationError, MessageSerializationError, RtmpMessage};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub fn serialize(sequence_number: u32) -> Result<Vec<u8>, MessageSerializationError> {
    let mut cursor = Cursor::new(Vec::new());
    cursor.write_u32::<BigEndian>(sequence_number)?;
    Ok(cursor.into_inner())
}

pub fn deserialize(data: &[u8]) -> Result<RtmpMessage, MessageDeserializationError> {
    let mut cursor = Cursor::new(data);
    let sequence_number = cursor.read_u32::<BigEndian>()?;
    Ok(RtmpMessage::Acknowledgement { sequence_number })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_serialize_and_deserialize() {
        let bytes = serialize(2500000).unwrap();

        match deserialize(&bytes).unwrap() {
            RtmpMessage::Acknowledgement {
                sequence_number: 2500000,
            } => (),
            x => panic!("Unexpected message: {:?}", x),
        }
    }
}
