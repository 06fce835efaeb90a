use crate::messages::{MessageDeserializationError, MessageSerializationError, RtmpMessage};
use lml_amf0::Amf0Value;
use std::io::Cursor;

pub fn serialize(values: Vec<Amf0Value>) -> Result<Vec<u8>, MessageSerializationError> {
    let bytes = lml_amf0::serialize(&values)?;
    Ok(bytes)
}

pub fn deserialize(data: &[u8]) -> Result<RtmpMessage, MessageDeserializationError> {
    let mut cursor = Cursor::new(data);
    let values = lml_amf0::deserialize(&mut cursor)?;
    Ok(RtmpMessage::Amf0Data { values })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lml_amf0::Amf0Object;

    #[test]
    fn set_data_frame_round_trips() {
        let mut metadata = Amf0Object::new();
        metadata.insert("width", Amf0Value::Number(1280.0));
        metadata.insert("height", Amf0Value::Number(720.0));

        let values = vec![
            Amf0Value::Utf8String("@setDataFrame".to_string()),
            Amf0Value::Utf8String("onMetaData".to_string()),
            Amf0Value::Object(metadata),
        ];

        let bytes = serialize(values.clone()).unwrap();

        match deserialize(&bytes).unwrap() {
            RtmpMessage::Amf0Data { values: result } => assert_eq!(result, values),
            x => panic!("Unexpected message: {:?}", x),
        }
    }
}
