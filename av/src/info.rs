//! Per-stream information, shared between the stream and the codec parsers
//! that fill it in as parameter sets arrive.

use parking_lot::RwLock;
use std::sync::Arc;

/// A numerator/denominator pair for time scales and frame rates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rational {
    pub num: f64,
    pub den: f64,
}

impl Default for Rational {
    fn default() -> Rational {
        Rational { num: 30.0, den: 1.0 }
    }
}

/// Metadata describing a media stream, mutated by the codec parsers when an
/// SPS or AudioSpecificConfig arrives and read by the remuxers.
#[derive(Debug, Clone)]
pub struct Information {
    pub mime_type: String,
    pub codecs: Vec<String>,
    pub timescale: u32,
    pub time_base: u32,
    pub timestamp: u32,
    pub duration: u32,
    pub size: i64,
    pub width: u32,
    pub height: u32,
    pub codec_width: u32,
    pub codec_height: u32,
    pub audio_data_rate: u32,
    pub video_data_rate: u32,
    pub bit_rate: u32,
    pub frame_rate: Rational,
    pub sample_rate: u32,
    pub sample_size: u32,
    pub channels: u32,
}

impl Information {
    pub fn new() -> Information {
        Information {
            mime_type: String::new(),
            codecs: Vec::new(),
            timescale: 1000,
            time_base: 0,
            timestamp: 0,
            duration: 0,
            size: 0,
            width: 0,
            height: 0,
            codec_width: 0,
            codec_height: 0,
            audio_data_rate: 0,
            video_data_rate: 0,
            bit_rate: 0,
            frame_rate: Rational::default(),
            sample_rate: 0,
            sample_size: 0,
            channels: 0,
        }
    }
}

impl Default for Information {
    fn default() -> Information {
        Information::new()
    }
}

/// The handle codec parsers and remuxers share to one stream's information
pub type SharedInformation = Arc<RwLock<Information>>;

pub fn shared_information() -> SharedInformation {
    Arc::new(RwLock::new(Information::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timescale_defaults_to_milliseconds() {
        let info = Information::new();
        assert_eq!(info.timescale, 1000);
    }
}
