use crate::messages::{MessageDeserializationError, MessageSerializationError, RtmpMessage};
use bytes::Bytes;

pub fn serialize(data: Bytes) -> Result<Vec<u8>, MessageSerializationError> {
    Ok(data.to_vec())
}

pub fn deserialize(data: Bytes) -> Result<RtmpMessage, MessageDeserializationError> {
    Ok(RtmpMessage::VideoData { data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_passes_through_unchanged() {
        let data = Bytes::from(vec![0x17_u8, 0x00, 0x00, 0x00, 0x00]);
        let bytes = serialize(data.clone()).unwrap();
        assert_eq!(&bytes[..], &data[..]);

        match deserialize(data.clone()).unwrap() {
            RtmpMessage::VideoData { data: result } => assert_eq!(result, data),
            x => panic!("Unexpected message: {:?}", x),
        }
    }
}
