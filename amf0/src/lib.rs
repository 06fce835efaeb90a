//! This crate provides functionality for serializing and deserializing data
//! based on the Adobe AMF0 encoding specification located at
//! <https://wwwimages2.adobe.com/content/dam/acom/en/devnet/pdf/amf0-file-format-specification.pdf>
//!
//! # Examples
//! ```
//! use std::io::Cursor;
//! use lml_amf0::{Amf0Object, Amf0Value, serialize, deserialize};
//!
//! // Put some data into the Amf0Value types
//! let mut properties = Amf0Object::new();
//! properties.insert("app", Amf0Value::Number(99.0));
//! properties.insert("second", Amf0Value::Utf8String("test".to_string()));
//!
//! let value1 = Amf0Value::Number(32.0);
//! let value2 = Amf0Value::Boolean(true);
//! let object = Amf0Value::Object(properties);
//!
//! let input = vec![value1, object, value2];
//!
//! // Serialize the values into a vector of bytes
//! let serialized_data = serialize(&input).unwrap();
//!
//! // Deserialize the vector of bytes back into Amf0Value types
//! let mut serialized_cursor = Cursor::new(serialized_data);
//! let results = deserialize(&mut serialized_cursor).unwrap();
//!
//! assert_eq!(input, results);
//! ```

extern crate byteorder;
extern crate thiserror;

mod deserialization;
mod errors;
mod serialization;

pub use deserialization::deserialize;
pub use errors::{Amf0DeserializationError, Amf0SerializationError};
pub use serialization::serialize;

use std::collections::HashMap;

/// An Enum representing the different supported types of Amf0 values
#[derive(PartialEq, Debug, Clone)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    Utf8String(String),
    LongString(String),
    Object(Amf0Object),
    EcmaArray(Amf0Object),
    StrictArray(Vec<Amf0Value>),
    Date {
        unix_epoch_ms: f64,
        timezone_offset_minutes: i16,
    },
    Null,
    Undefined,
}

impl Amf0Value {
    pub fn get_number(self) -> Option<f64> {
        match self {
            Amf0Value::Number(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_boolean(self) -> Option<bool> {
        match self {
            Amf0Value::Boolean(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_string(self) -> Option<String> {
        match self {
            Amf0Value::Utf8String(value) => Some(value),
            Amf0Value::LongString(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_object_properties(self) -> Option<Amf0Object> {
        match self {
            Amf0Value::Object(properties) => Some(properties),
            Amf0Value::EcmaArray(properties) => Some(properties),
            _ => None,
        }
    }
}

/// An AMF0 object body.
///
/// Property order is significant on the wire (some clients depend on it), so
/// the object keeps its pairs in insertion order while also maintaining a
/// hash index for constant time lookups by key.
#[derive(Debug, Clone, Default)]
pub struct Amf0Object {
    pairs: Vec<(String, Amf0Value)>,
    index: HashMap<String, usize>,
}

impl Amf0Object {
    pub fn new() -> Amf0Object {
        Amf0Object {
            pairs: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Adds a property, replacing any previous value stored for the key while
    /// keeping the key's original position.
    pub fn insert(&mut self, key: &str, value: Amf0Value) {
        match self.index.get(key) {
            Some(position) => self.pairs[*position].1 = value,
            None => {
                self.index.insert(key.to_string(), self.pairs.len());
                self.pairs.push((key.to_string(), value));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Amf0Value> {
        self.index.get(key).map(|position| &self.pairs[*position].1)
    }

    /// Removes the property with the given key and returns its value
    pub fn remove(&mut self, key: &str) -> Option<Amf0Value> {
        let position = self.index.remove(key)?;
        let (_, value) = self.pairs.remove(position);
        for index in self.index.values_mut() {
            if *index > position {
                *index -= 1;
            }
        }

        Some(value)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterates the properties in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Amf0Value)> {
        self.pairs.iter().map(|(key, value)| (key.as_str(), value))
    }
}

impl PartialEq for Amf0Object {
    fn eq(&self, other: &Amf0Object) -> bool {
        self.pairs == other.pairs
    }
}

impl FromIterator<(String, Amf0Value)> for Amf0Object {
    fn from_iter<T: IntoIterator<Item = (String, Amf0Value)>>(iter: T) -> Amf0Object {
        let mut object = Amf0Object::new();
        for (key, value) in iter {
            object.insert(&key, value);
        }

        object
    }
}

mod markers {
    pub const NUMBER_MARKER: u8 = 0;
    pub const BOOLEAN_MARKER: u8 = 1;
    pub const STRING_MARKER: u8 = 2;
    pub const OBJECT_MARKER: u8 = 3;
    pub const NULL_MARKER: u8 = 5;
    pub const UNDEFINED_MARKER: u8 = 6;
    pub const ECMA_ARRAY_MARKER: u8 = 8;
    pub const OBJECT_END_MARKER: u8 = 9;
    pub const STRICT_ARRAY_MARKER: u8 = 10;
    pub const DATE_MARKER: u8 = 11;
    pub const LONG_STRING_MARKER: u8 = 12;
    pub const UTF_8_EMPTY_MARKER: u16 = 0;
}

#[cfg(test)]
mod tests {
    use super::{Amf0Object, Amf0Value};

    #[test]
    fn object_preserves_insertion_order() {
        let mut object = Amf0Object::new();
        object.insert("zeta", Amf0Value::Number(1.0));
        object.insert("alpha", Amf0Value::Number(2.0));
        object.insert("mid", Amf0Value::Number(3.0));

        let keys: Vec<&str> = object.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn object_lookup_by_key() {
        let mut object = Amf0Object::new();
        object.insert("app", Amf0Value::Utf8String("live".to_string()));

        assert_eq!(
            object.get("app"),
            Some(&Amf0Value::Utf8String("live".to_string()))
        );
        assert_eq!(object.get("missing"), None);
    }

    #[test]
    fn object_insert_replaces_in_place() {
        let mut object = Amf0Object::new();
        object.insert("first", Amf0Value::Number(1.0));
        object.insert("second", Amf0Value::Number(2.0));
        object.insert("first", Amf0Value::Number(3.0));

        let keys: Vec<&str> = object.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["first", "second"]);
        assert_eq!(object.get("first"), Some(&Amf0Value::Number(3.0)));
    }

    #[test]
    fn object_remove_keeps_index_valid() {
        let mut object = Amf0Object::new();
        object.insert("one", Amf0Value::Number(1.0));
        object.insert("two", Amf0Value::Number(2.0));
        object.insert("three", Amf0Value::Number(3.0));

        assert_eq!(object.remove("one"), Some(Amf0Value::Number(1.0)));
        assert_eq!(object.get("three"), Some(&Amf0Value::Number(3.0)));
        assert_eq!(object.len(), 2);
    }
}
