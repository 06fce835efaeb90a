//! Serialization and deserialization of the RTMP chunk stream.
//!
//! RTMP messages travel as chunks whose headers are delta compressed against
//! the previous chunk on the same chunk stream id, so one serializer and one
//! deserializer instance must see every byte exchanged with a peer.

mod chunk_header;
mod deserialization_errors;
mod deserializer;
mod serialization_errors;
mod serializer;

pub use self::deserialization_errors::ChunkDeserializationError;
pub use self::deserializer::ChunkDeserializer;
pub use self::serialization_errors::ChunkSerializationError;
pub use self::serializer::{ChunkSerializer, Packet};

/// Inbound and outbound chunk sizes start at 128 bytes until renegotiated
pub const INITIAL_MAX_CHUNK_SIZE: u32 = 128;

/// The largest chunk size either side may negotiate
pub const MAX_NEGOTIABLE_CHUNK_SIZE: u32 = 65536;
