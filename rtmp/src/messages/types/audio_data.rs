use crate::messages::{MessageDeserializationError, MessageSerializationError, RtmpMessage};
use bytes::Bytes;

pub fn serialize(data: Bytes) -> Result<Vec<u8>, MessageSerializationError> {
    Ok(data.to_vec())
}

pub fn deserialize(data: Bytes) -> Result<RtmpMessage, MessageDeserializationError> {
    Ok(RtmpMessage::AudioData { data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_passes_through_unchanged() {
        let data = Bytes::from(vec![0xAF_u8, 0x01, 0x21, 0x10]);
        let bytes = serialize(data.clone()).unwrap();
        assert_eq!(&bytes[..], &data[..]);

        match deserialize(data.clone()).unwrap() {
            RtmpMessage::AudioData { data: result } => assert_eq!(result, data),
            x => panic!("Unexpected message: {:?}", x),
        }
    }
}
