//! Media primitives shared by the streaming server: unaligned bit reading,
//! AAC and H.264 parameter set parsers, the packet / track / stream model
//! with its event fan-out, and remuxers that repackage live media into FLV,
//! fragmented MP4 / CMAF, and RTP.

pub mod bits;
pub mod codec;
pub mod context;
pub mod events;
pub mod format;
pub mod info;
pub mod packet;
pub mod recorder;

#[cfg(any(test, feature = "test-utils"))]
pub mod testutil;
