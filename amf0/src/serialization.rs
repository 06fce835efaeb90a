//! Module contains functionality for serializing values into bytes
//! based on the AMF0 specification.

use crate::errors::Amf0SerializationError;
use crate::markers;
use crate::{Amf0Object, Amf0Value};
use byteorder::{BigEndian, WriteBytesExt};

/// Serializes values into an amf0 encoded vector of bytes
pub fn serialize(values: &[Amf0Value]) -> Result<Vec<u8>, Amf0SerializationError> {
    let mut bytes = vec![];
    for value in values {
        serialize_value(value, &mut bytes)?;
    }

    Ok(bytes)
}

fn serialize_value(value: &Amf0Value, bytes: &mut Vec<u8>) -> Result<(), Amf0SerializationError> {
    match *value {
        Amf0Value::Boolean(val) => Ok(serialize_bool(val, bytes)),
        Amf0Value::Null => Ok(serialize_null(bytes)),
        Amf0Value::Undefined => Ok(serialize_undefined(bytes)),
        Amf0Value::Number(val) => serialize_number(val, bytes),
        Amf0Value::Utf8String(ref val) => serialize_string(val, bytes),
        Amf0Value::LongString(ref val) => serialize_long_string(val, bytes),
        Amf0Value::Object(ref val) => serialize_object(val, bytes),
        Amf0Value::EcmaArray(ref val) => serialize_ecma_array(val, bytes),
        Amf0Value::StrictArray(ref val) => serialize_strict_array(val, bytes),
        Amf0Value::Date {
            unix_epoch_ms,
            timezone_offset_minutes,
        } => serialize_date(unix_epoch_ms, timezone_offset_minutes, bytes),
    }
}

fn serialize_number(value: f64, bytes: &mut Vec<u8>) -> Result<(), Amf0SerializationError> {
    bytes.push(markers::NUMBER_MARKER);
    bytes.write_f64::<BigEndian>(value)?;
    Ok(())
}

fn serialize_bool(value: bool, bytes: &mut Vec<u8>) {
    bytes.push(markers::BOOLEAN_MARKER);
    bytes.push(value as u8);
}

fn serialize_string(value: &str, bytes: &mut Vec<u8>) -> Result<(), Amf0SerializationError> {
    if value.len() > (u16::MAX as usize) {
        return Err(Amf0SerializationError::NormalStringTooLong);
    }

    bytes.push(markers::STRING_MARKER);
    bytes.write_u16::<BigEndian>(value.len() as u16)?;
    bytes.extend(value.as_bytes());
    Ok(())
}

fn serialize_long_string(value: &str, bytes: &mut Vec<u8>) -> Result<(), Amf0SerializationError> {
    bytes.push(markers::LONG_STRING_MARKER);
    bytes.write_u32::<BigEndian>(value.len() as u32)?;
    bytes.extend(value.as_bytes());
    Ok(())
}

fn serialize_date(
    unix_epoch_ms: f64,
    timezone_offset_minutes: i16,
    bytes: &mut Vec<u8>,
) -> Result<(), Amf0SerializationError> {
    bytes.push(markers::DATE_MARKER);
    bytes.write_f64::<BigEndian>(unix_epoch_ms)?;
    bytes.write_i16::<BigEndian>(timezone_offset_minutes)?;
    Ok(())
}

fn serialize_null(bytes: &mut Vec<u8>) {
    bytes.push(markers::NULL_MARKER);
}

fn serialize_undefined(bytes: &mut Vec<u8>) {
    bytes.push(markers::UNDEFINED_MARKER);
}

fn serialize_object_properties(
    properties: &Amf0Object,
    bytes: &mut Vec<u8>,
) -> Result<(), Amf0SerializationError> {
    for (name, value) in properties.iter() {
        if name.len() > (u16::MAX as usize) {
            return Err(Amf0SerializationError::NormalStringTooLong);
        }

        bytes.write_u16::<BigEndian>(name.len() as u16)?;
        bytes.extend(name.as_bytes());
        serialize_value(value, bytes)?;
    }

    bytes.write_u16::<BigEndian>(markers::UTF_8_EMPTY_MARKER)?;
    bytes.push(markers::OBJECT_END_MARKER);
    Ok(())
}

fn serialize_object(
    properties: &Amf0Object,
    bytes: &mut Vec<u8>,
) -> Result<(), Amf0SerializationError> {
    bytes.push(markers::OBJECT_MARKER);
    serialize_object_properties(properties, bytes)
}

fn serialize_ecma_array(
    properties: &Amf0Object,
    bytes: &mut Vec<u8>,
) -> Result<(), Amf0SerializationError> {
    bytes.push(markers::ECMA_ARRAY_MARKER);
    bytes.write_u32::<BigEndian>(properties.len() as u32)?;
    serialize_object_properties(properties, bytes)
}

fn serialize_strict_array(
    array: &[Amf0Value],
    bytes: &mut Vec<u8>,
) -> Result<(), Amf0SerializationError> {
    bytes.push(markers::STRICT_ARRAY_MARKER);
    bytes.write_u32::<BigEndian>(array.len() as u32)?;

    for value in array {
        serialize_value(value, bytes)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::serialize;
    use crate::markers;
    use crate::{Amf0Object, Amf0Value};
    use byteorder::{BigEndian, WriteBytesExt};

    #[test]
    fn can_serialize_number() {
        let number: f64 = 332.0;

        let input = vec![Amf0Value::Number(number)];
        let result = serialize(&input).unwrap();

        let mut expected = vec![];
        expected.write_u8(markers::NUMBER_MARKER).unwrap();
        expected.write_f64::<BigEndian>(number).unwrap();

        assert_eq!(result, expected);
    }

    #[test]
    fn can_serialize_boolean() {
        let input = vec![Amf0Value::Boolean(true)];
        let result = serialize(&input).unwrap();

        let expected = vec![markers::BOOLEAN_MARKER, 1];
        assert_eq!(result, expected);
    }

    #[test]
    fn can_serialize_string() {
        let input = vec![Amf0Value::Utf8String("test".to_string())];
        let result = serialize(&input).unwrap();

        let mut expected = vec![];
        expected.write_u8(markers::STRING_MARKER).unwrap();
        expected.write_u16::<BigEndian>(4).unwrap();
        expected.extend("test".as_bytes());

        assert_eq!(result, expected);
    }

    #[test]
    fn can_serialize_long_string() {
        let input = vec![Amf0Value::LongString("test".to_string())];
        let result = serialize(&input).unwrap();

        let mut expected = vec![];
        expected.write_u8(markers::LONG_STRING_MARKER).unwrap();
        expected.write_u32::<BigEndian>(4).unwrap();
        expected.extend("test".as_bytes());

        assert_eq!(result, expected);
    }

    #[test]
    fn can_serialize_null() {
        let input = vec![Amf0Value::Null];
        let result = serialize(&input).unwrap();

        let expected = vec![markers::NULL_MARKER];
        assert_eq!(result, expected);
    }

    #[test]
    fn can_serialize_undefined() {
        let input = vec![Amf0Value::Undefined];
        let result = serialize(&input).unwrap();

        let expected = vec![markers::UNDEFINED_MARKER];
        assert_eq!(result, expected);
    }

    #[test]
    fn can_serialize_object_in_property_order() {
        let number: f64 = 332.0;

        let mut properties = Amf0Object::new();
        properties.insert("test", Amf0Value::Number(number));
        properties.insert("app", Amf0Value::Boolean(false));

        let input = vec![Amf0Value::Object(properties)];
        let result = serialize(&input).unwrap();

        let mut expected = vec![];
        expected.write_u8(markers::OBJECT_MARKER).unwrap();
        expected.write_u16::<BigEndian>(4).unwrap();
        expected.extend("test".as_bytes());
        expected.write_u8(markers::NUMBER_MARKER).unwrap();
        expected.write_f64::<BigEndian>(number).unwrap();
        expected.write_u16::<BigEndian>(3).unwrap();
        expected.extend("app".as_bytes());
        expected.write_u8(markers::BOOLEAN_MARKER).unwrap();
        expected.write_u8(0).unwrap();
        expected.write_u16::<BigEndian>(markers::UTF_8_EMPTY_MARKER).unwrap();
        expected.write_u8(markers::OBJECT_END_MARKER).unwrap();

        assert_eq!(result, expected);
    }

    #[test]
    fn can_serialize_ecma_array() {
        let mut properties = Amf0Object::new();
        properties.insert("version", Amf0Value::Utf8String("5,0,3,3029".to_string()));

        let input = vec![Amf0Value::EcmaArray(properties)];
        let result = serialize(&input).unwrap();

        let mut expected = vec![];
        expected.write_u8(markers::ECMA_ARRAY_MARKER).unwrap();
        expected.write_u32::<BigEndian>(1).unwrap();
        expected.write_u16::<BigEndian>(7).unwrap();
        expected.extend("version".as_bytes());
        expected.write_u8(markers::STRING_MARKER).unwrap();
        expected.write_u16::<BigEndian>(10).unwrap();
        expected.extend("5,0,3,3029".as_bytes());
        expected.write_u16::<BigEndian>(markers::UTF_8_EMPTY_MARKER).unwrap();
        expected.write_u8(markers::OBJECT_END_MARKER).unwrap();

        assert_eq!(result, expected);
    }

    #[test]
    fn can_serialize_strict_array() {
        let number: f64 = 332.0;

        let input = vec![Amf0Value::StrictArray(vec![Amf0Value::Number(number)])];
        let result = serialize(&input).unwrap();

        let mut expected = vec![];
        expected.write_u8(markers::STRICT_ARRAY_MARKER).unwrap();
        expected.write_u32::<BigEndian>(1).unwrap();
        expected.write_u8(markers::NUMBER_MARKER).unwrap();
        expected.write_f64::<BigEndian>(number).unwrap();

        assert_eq!(result, expected);
    }

    #[test]
    fn can_serialize_date() {
        let input = vec![Amf0Value::Date {
            unix_epoch_ms: 1234567890.0,
            timezone_offset_minutes: 0,
        }];
        let result = serialize(&input).unwrap();

        let mut expected = vec![];
        expected.write_u8(markers::DATE_MARKER).unwrap();
        expected.write_f64::<BigEndian>(1234567890.0).unwrap();
        expected.write_i16::<BigEndian>(0).unwrap();

        assert_eq!(result, expected);
    }

    #[test]
    fn error_when_string_length_exceeds_u16() {
        let long = "a".repeat(65536);
        let input = vec![Amf0Value::Utf8String(long)];

        match serialize(&input) {
            Err(crate::Amf0SerializationError::NormalStringTooLong) => (),
            x => panic!("Expected NormalStringTooLong, got {:?}", x),
        }
    }
}
