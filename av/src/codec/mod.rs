//! Codec-aware track sources.
//!
//! A `TrackSource` owns the parse state for one elementary stream: it
//! decodes parameter sets into the shared stream information, attaches
//! timing and frame side data to packets, keeps the stream's info frame
//! around for late subscribers, and fans parsed packets out to listeners.

pub mod aac;
pub mod avc;

use crate::context::CodecContext;
use crate::events::EventDispatcher;
use crate::format::StreamEvent;
use crate::info::SharedInformation;
use crate::packet::{Packet, PacketKind};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Colour description values, clamped to "unspecified" when a stream
/// advertises something outside the known tables
pub const COL_PRI_UNSPECIFIED: u8 = 2;
pub const COL_PRI_NB: u8 = 23;
pub const COL_TRC_UNSPECIFIED: u8 = 2;
pub const COL_TRC_NB: u8 = 19;
pub const COL_SPC_UNSPECIFIED: u8 = 2;
pub const COL_SPC_NB: u8 = 15;

/// Errors raised while parsing codec data
#[derive(Debug, Error)]
pub enum CodecParseError {
    #[error("data not enough while parsing {0}")]
    NotEnoughData(&'static str),

    #[error("failed to initialize the bit reader")]
    BitReaderInit,

    #[error("{0}")]
    InvalidData(String),

    #[error("unrecognized packet type 0x{0:02X}")]
    UnrecognizedPacketType(u8),
}

/// The decoder configuration a remuxer needs to describe the track in a
/// container sample entry
#[derive(Debug, Clone)]
pub enum DecoderConfig {
    Audio {
        channel_configuration: u8,
        sampling_frequency: u32,
        config: Vec<u8>,
    },

    Video {
        avcc: Bytes,
    },
}

/// The active sequence/picture parameter sets of a video source, as RBSP
#[derive(Debug, Clone)]
pub struct ParameterSets {
    pub sps: Bytes,
    pub pps: Bytes,
}

/// A codec-aware source feeding one track
pub trait TrackSource: Send + Sync {
    /// The codec tag this source handles ("AAC", "AVC")
    fn kind(&self) -> &'static str;

    /// Whether the source produces audio or video packets
    fn media_kind(&self) -> PacketKind;

    /// A snapshot of the codec parse context
    fn context(&self) -> CodecContext;

    /// The stream information this source fills in
    fn information(&self) -> SharedInformation;

    /// Parses one packet in place, attaching side data and updating the
    /// shared stream information
    fn parse(&self, packet: &mut Packet) -> Result<(), CodecParseError>;

    /// Fans a parsed packet out to every listener
    fn sink(&self, packet: Arc<Packet>);

    /// The packet carrying the codec's parameter set, if one arrived
    fn info_frame(&self) -> Option<Packet>;

    /// Stores the packet carrying the codec's parameter set
    fn set_info_frame(&self, packet: Packet);

    /// The dispatcher delivering this source's packet events
    fn events(&self) -> &EventDispatcher<StreamEvent>;

    /// The decoder configuration for container sample entries, available
    /// once the info frame has been parsed
    fn decoder_config(&self) -> Option<DecoderConfig>;

    /// The active SPS/PPS pair, for packetizers that re-emit them in band
    fn parameter_sets(&self) -> Option<ParameterSets> {
        None
    }
}

type SourceFactory = fn(SharedInformation) -> Arc<dyn TrackSource>;

/// The codec registry: codec tag string to source factory
static SOURCES: &[(&str, SourceFactory)] = &[("AAC", aac::new_source), ("AVC", avc::new_source)];

/// Creates a registered source for the codec tag
pub fn new_source(tag: &str, info: SharedInformation) -> Option<Arc<dyn TrackSource>> {
    SOURCES
        .iter()
        .find(|(name, _)| *name == tag)
        .map(|(_, factory)| factory(info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::shared_information;

    #[test]
    fn registry_creates_sources_by_codec_tag() {
        let aac = new_source("AAC", shared_information()).unwrap();
        assert_eq!(aac.kind(), "AAC");
        assert_eq!(aac.media_kind(), PacketKind::Audio);

        let avc = new_source("AVC", shared_information()).unwrap();
        assert_eq!(avc.kind(), "AVC");
        assert_eq!(avc.media_kind(), PacketKind::Video);

        assert!(new_source("VP6", shared_information()).is_none());
    }
}
