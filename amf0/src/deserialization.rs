//! This module contains functionality to deserialize values from bytes
//! that were encoded via the AMF0 specification.

use crate::errors::Amf0DeserializationError;
use crate::markers;
use crate::{Amf0Object, Amf0Value};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;

struct ObjectProperty {
    label: String,
    value: Amf0Value,
}

/// Takes any readable byte stream and converts it into an array of AMF0 values
pub fn deserialize<R: Read>(bytes: &mut R) -> Result<Vec<Amf0Value>, Amf0DeserializationError> {
    let mut results = vec![];

    while let Some(value) = read_next_value(bytes)? {
        results.push(value);
    }

    Ok(results)
}

fn read_next_value<R: Read>(bytes: &mut R) -> Result<Option<Amf0Value>, Amf0DeserializationError> {
    let mut buffer: [u8; 1] = [0];
    let bytes_read = bytes.read(&mut buffer)?;

    if bytes_read == 0 {
        return Ok(None);
    }

    if buffer[0] == markers::OBJECT_END_MARKER {
        return Ok(None);
    }

    match buffer[0] {
        markers::BOOLEAN_MARKER => parse_bool(bytes).map(Some),
        markers::NULL_MARKER => Ok(Some(Amf0Value::Null)),
        markers::UNDEFINED_MARKER => Ok(Some(Amf0Value::Undefined)),
        markers::NUMBER_MARKER => parse_number(bytes).map(Some),
        markers::OBJECT_MARKER => parse_object(bytes).map(Some),
        markers::ECMA_ARRAY_MARKER => parse_ecma_array(bytes).map(Some),
        markers::STRING_MARKER => parse_string(bytes).map(Some),
        markers::LONG_STRING_MARKER => parse_long_string(bytes).map(Some),
        markers::STRICT_ARRAY_MARKER => parse_strict_array(bytes).map(Some),
        markers::DATE_MARKER => parse_date(bytes).map(Some),
        _ => Err(Amf0DeserializationError::UnknownMarker { marker: buffer[0] }),
    }
}

fn parse_number<R: Read>(bytes: &mut R) -> Result<Amf0Value, Amf0DeserializationError> {
    let number = bytes.read_f64::<BigEndian>()?;
    Ok(Amf0Value::Number(number))
}

fn parse_bool<R: Read>(bytes: &mut R) -> Result<Amf0Value, Amf0DeserializationError> {
    let value = bytes.read_u8()?;
    Ok(Amf0Value::Boolean(value != 0))
}

fn parse_string<R: Read>(bytes: &mut R) -> Result<Amf0Value, Amf0DeserializationError> {
    let length = bytes.read_u16::<BigEndian>()?;
    let mut buffer = vec![0_u8; length as usize];
    bytes.read_exact(&mut buffer)?;

    let value = String::from_utf8(buffer)?;
    Ok(Amf0Value::Utf8String(value))
}

fn parse_long_string<R: Read>(bytes: &mut R) -> Result<Amf0Value, Amf0DeserializationError> {
    let length = bytes.read_u32::<BigEndian>()?;
    let mut buffer = vec![0_u8; length as usize];
    bytes.read_exact(&mut buffer)?;

    let value = String::from_utf8(buffer)?;
    Ok(Amf0Value::LongString(value))
}

fn parse_date<R: Read>(bytes: &mut R) -> Result<Amf0Value, Amf0DeserializationError> {
    let unix_epoch_ms = bytes.read_f64::<BigEndian>()?;
    let timezone_offset_minutes = bytes.read_i16::<BigEndian>()?;

    Ok(Amf0Value::Date {
        unix_epoch_ms,
        timezone_offset_minutes,
    })
}

fn parse_object_properties<R: Read>(
    bytes: &mut R,
) -> Result<Amf0Object, Amf0DeserializationError> {
    let mut properties = Amf0Object::new();

    while let Some(property) = parse_object_property(bytes)? {
        properties.insert(&property.label, property.value);
    }

    Ok(properties)
}

fn parse_object<R: Read>(bytes: &mut R) -> Result<Amf0Value, Amf0DeserializationError> {
    let properties = parse_object_properties(bytes)?;
    Ok(Amf0Value::Object(properties))
}

fn parse_ecma_array<R: Read>(bytes: &mut R) -> Result<Amf0Value, Amf0DeserializationError> {
    // The advertised count is unreliable in the wild.  Real encoders terminate
    // the associative part with an empty key plus the object end marker, the
    // same way plain objects end, so the count is read and ignored and the
    // body is parsed exactly like an object body.
    let _associative_count = bytes.read_u32::<BigEndian>()?;
    let properties = parse_object_properties(bytes)?;
    Ok(Amf0Value::EcmaArray(properties))
}

fn parse_strict_array<R: Read>(bytes: &mut R) -> Result<Amf0Value, Amf0DeserializationError> {
    let array_count = bytes.read_u32::<BigEndian>()?;
    let mut values: Vec<Amf0Value> = Vec::new();

    for _ in 0..array_count {
        match read_next_value(bytes)? {
            Some(value) => values.push(value),
            None => break,
        };
    }

    Ok(Amf0Value::StrictArray(values))
}

fn parse_object_property<R: Read>(
    bytes: &mut R,
) -> Result<Option<ObjectProperty>, Amf0DeserializationError> {
    let label_length = bytes.read_u16::<BigEndian>()?;
    if label_length == 0 {
        // Next byte should be the end of object marker.  We need to read this
        // to make sure we progress the current position.
        let byte = bytes.read_u8()?;
        if byte != markers::OBJECT_END_MARKER {
            return Err(Amf0DeserializationError::UnexpectedEmptyObjectPropertyName);
        }

        return Ok(None);
    }

    let mut label_buffer = vec![0; label_length as usize];
    bytes.read_exact(&mut label_buffer)?;
    let label = String::from_utf8(label_buffer)?;

    let value = match read_next_value(bytes)? {
        Some(value) => value,
        None => return Err(Amf0DeserializationError::UnexpectedEof),
    };

    Ok(Some(ObjectProperty { label, value }))
}

#[cfg(test)]
mod tests {
    use super::deserialize;
    use crate::markers;
    use crate::serialization::serialize;
    use crate::{Amf0DeserializationError, Amf0Object, Amf0Value};
    use byteorder::{BigEndian, WriteBytesExt};
    use std::io::Cursor;

    #[test]
    fn can_deserialize_number() {
        let number: f64 = 332.0;

        let mut vector = vec![];
        vector.write_u8(markers::NUMBER_MARKER).unwrap();
        vector.write_f64::<BigEndian>(number).unwrap();

        let mut input = Cursor::new(vector);
        let result = deserialize(&mut input).unwrap();

        assert_eq!(result, vec![Amf0Value::Number(number)]);
    }

    #[test]
    fn can_deserialize_boolean() {
        let mut vector = vec![];
        vector.write_u8(markers::BOOLEAN_MARKER).unwrap();
        vector.write_u8(1).unwrap();

        let mut input = Cursor::new(vector);
        let result = deserialize(&mut input).unwrap();

        assert_eq!(result, vec![Amf0Value::Boolean(true)]);
    }

    #[test]
    fn can_deserialize_string() {
        let value = "test";

        let mut vector = vec![];
        vector.write_u8(markers::STRING_MARKER).unwrap();
        vector.write_u16::<BigEndian>(value.len() as u16).unwrap();
        vector.extend(value.as_bytes());

        let mut input = Cursor::new(vector);
        let result = deserialize(&mut input).unwrap();

        assert_eq!(result, vec![Amf0Value::Utf8String(value.to_string())]);
    }

    #[test]
    fn can_deserialize_object_preserving_order() {
        let number: f64 = 332.0;

        let mut vector = vec![];
        vector.write_u8(markers::OBJECT_MARKER).unwrap();
        vector.write_u16::<BigEndian>(4).unwrap();
        vector.extend("test".as_bytes());
        vector.write_u8(markers::NUMBER_MARKER).unwrap();
        vector.write_f64::<BigEndian>(number).unwrap();
        vector.write_u16::<BigEndian>(3).unwrap();
        vector.extend("app".as_bytes());
        vector.write_u8(markers::NULL_MARKER).unwrap();
        vector.write_u16::<BigEndian>(markers::UTF_8_EMPTY_MARKER).unwrap();
        vector.write_u8(markers::OBJECT_END_MARKER).unwrap();

        let mut input = Cursor::new(vector);
        let result = deserialize(&mut input).unwrap();

        let mut expected = Amf0Object::new();
        expected.insert("test", Amf0Value::Number(number));
        expected.insert("app", Amf0Value::Null);

        assert_eq!(result, vec![Amf0Value::Object(expected)]);
    }

    #[test]
    fn ecma_array_ignores_advertised_length() {
        let mut vector = vec![];
        vector.write_u8(markers::ECMA_ARRAY_MARKER).unwrap();
        vector.write_u32::<BigEndian>(999).unwrap(); // bogus count
        vector.write_u16::<BigEndian>(3).unwrap();
        vector.extend("key".as_bytes());
        vector.write_u8(markers::BOOLEAN_MARKER).unwrap();
        vector.write_u8(0).unwrap();
        vector.write_u16::<BigEndian>(markers::UTF_8_EMPTY_MARKER).unwrap();
        vector.write_u8(markers::OBJECT_END_MARKER).unwrap();

        let mut input = Cursor::new(vector);
        let result = deserialize(&mut input).unwrap();

        let mut expected = Amf0Object::new();
        expected.insert("key", Amf0Value::Boolean(false));

        assert_eq!(result, vec![Amf0Value::EcmaArray(expected)]);
    }

    #[test]
    fn error_on_unknown_marker() {
        let vector = vec![0x0E_u8]; // record set, unsupported
        let mut input = Cursor::new(vector);

        match deserialize(&mut input) {
            Err(Amf0DeserializationError::UnknownMarker { marker: 0x0E }) => (),
            x => panic!("Expected UnknownMarker, got {:?}", x),
        }
    }

    #[test]
    fn every_value_round_trips() {
        let mut object = Amf0Object::new();
        object.insert("level", Amf0Value::Utf8String("status".to_string()));
        object.insert("code", Amf0Value::Number(0.0));

        let mut array = Amf0Object::new();
        array.insert("version", Amf0Value::Utf8String("5,0,3,3029".to_string()));

        let input = vec![
            Amf0Value::Number(523.4),
            Amf0Value::Boolean(true),
            Amf0Value::Utf8String("short".to_string()),
            Amf0Value::LongString("long".to_string()),
            Amf0Value::Object(object),
            Amf0Value::EcmaArray(array),
            Amf0Value::StrictArray(vec![Amf0Value::Number(1.0), Amf0Value::Null]),
            Amf0Value::Date {
                unix_epoch_ms: 1234567890.0,
                timezone_offset_minutes: -120,
            },
            Amf0Value::Null,
            Amf0Value::Undefined,
        ];

        let bytes = serialize(&input).unwrap();
        let mut cursor = Cursor::new(bytes);
        let output = deserialize(&mut cursor).unwrap();

        assert_eq!(input, output);
    }
}
