//! Per codec, per track parse state that the fMP4 writer consumes verbatim.

/// The trun/sdtp sample flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags {
    pub is_leading: u8,
    pub sample_depends_on: u8,
    pub sample_is_depended_on: u8,
    pub sample_has_redundancy: u8,
    pub is_non_sync: u8,
}

/// Codec parse state carried by a track source
#[derive(Debug, Clone, Default)]
pub struct CodecContext {
    pub mime_type: String,
    pub codec: String,

    /// Ticks between successive samples at the stream timescale
    pub ref_sample_duration: u32,
    pub flags: SampleFlags,
}
