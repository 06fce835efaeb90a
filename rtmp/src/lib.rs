//! Building blocks for the server side of the RTMP protocol: the handshake
//! (both the plain and the digest flavor), chunk stream serialization and
//! deserialization, typed RTMP messages, and a server session that performs
//! the connect / createStream / publish / play command workflows.

pub mod chunk_io;
pub mod handshake;
pub mod messages;
pub mod sessions;
pub mod time;
