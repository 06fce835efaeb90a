use crate::messages::{MessageDeserializationError, MessageSerializationError, RtmpMessage};
use lml_amf0::Amf0Value;
use std::io::Cursor;

pub fn serialize(
    command_name: String,
    transaction_id: f64,
    command_object: Amf0Value,
    mut additional_arguments: Vec<Amf0Value>,
) -> Result<Vec<u8>, MessageSerializationError> {
    let mut values = vec![
        Amf0Value::Utf8String(command_name),
        Amf0Value::Number(transaction_id),
        command_object,
    ];
    values.append(&mut additional_arguments);

    let bytes = lml_amf0::serialize(&values)?;
    Ok(bytes)
}

pub fn deserialize(data: &[u8]) -> Result<RtmpMessage, MessageDeserializationError> {
    let mut cursor = Cursor::new(data);
    let mut values = lml_amf0::deserialize(&mut cursor)?;

    if values.len() < 2 {
        return Err(MessageDeserializationError::InvalidMessageFormat {
            message: "command message did not contain a name and transaction id".to_string(),
        });
    }

    let command_name = match values.remove(0) {
        Amf0Value::Utf8String(name) => name,
        x => {
            return Err(MessageDeserializationError::InvalidMessageFormat {
                message: format!("command name was not a string: {:?}", x),
            })
        }
    };

    let transaction_id = match values.remove(0) {
        Amf0Value::Number(id) => id,
        x => {
            return Err(MessageDeserializationError::InvalidMessageFormat {
                message: format!("transaction id was not a number: {:?}", x),
            })
        }
    };

    let command_object = if values.is_empty() {
        Amf0Value::Null
    } else {
        values.remove(0)
    };

    Ok(RtmpMessage::Amf0Command {
        command_name,
        transaction_id,
        command_object,
        additional_arguments: values,
    })
}
