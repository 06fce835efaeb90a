use crate::messages::{MessageDeserializationError, MessageSerializationError, RtmpMessage};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub fn serialize(stream_id: u32) -> Result<Vec<u8>, MessageSerializationError> {
    let mut cursor = Cursor::new(Vec::new());
    cursor.write_u32::<BigEndian>(stream_id)?;
    Ok(cursor.into_inner())
}

pub fn deserialize(data: &[u8]) -> Result<RtmpMessage, MessageDeserializationError> {
    let mut cursor = Cursor::new(data);
    let stream_id = cursor.read_u32::<BigEndian>()?;
    Ok(RtmpMessage::Abort { stream_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_serialize_and_deserialize() {
        let bytes = serialize(523).unwrap();
        assert_eq!(bytes, vec![0, 0, 2, 11]);

        match deserialize(&bytes).unwrap() {
            RtmpMessage::Abort { stream_id: 523 } => (),
            x => panic!("Unexpected message: {:?}", x),
        }
    }
}
