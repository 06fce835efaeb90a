//! AAC AudioSpecificConfig parsing and raw frame handling.

use super::{CodecParseError, DecoderConfig, TrackSource};
use crate::bits::BitReader;
use crate::context::CodecContext;
use crate::events::EventDispatcher;
use crate::format::{event_type, StreamEvent};
use crate::info::SharedInformation;
use crate::packet::{Packet, PacketKind, Side};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

// Audio object types the parser branches on
pub const AOT_NULL: u8 = 0;
pub const AOT_AAC_LC: u8 = 2;
pub const AOT_SBR: u8 = 5;
pub const AOT_ER_BSAC: u8 = 22;
pub const AOT_PS: u8 = 29;
pub const AOT_ESCAPE: u8 = 31;
pub const AOT_ALS: u8 = 36;

/// FLV audio data types
pub const SPECIFIC_CONFIG: u8 = 0x00;
pub const RAW_FRAME_DATA: u8 = 0x01;

/// Sampling frequencies by index; 13-15 are reserved/escape
pub const SAMPLING_FREQUENCIES: [u32; 16] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350, 0,
    0, 0,
];

/// Channel counts by channel configuration
pub const CHANNELS: [u16; 8] = [0, 1, 2, 3, 4, 5, 6, 8];

struct AacState {
    ctx: CodecContext,

    audio_object_type: u8,
    sampling_frequency_index: u8,
    sampling_frequency: u32,
    channel_configuration: u8,
    channels: u16,
    extension_audio_object_type: u8,
    extension_sampling_frequency_index: u8,
    extension_sampling_frequency: u32,
    extension_channel_configuration: u8,
    config: Vec<u8>,
}

/// The AAC track source
pub struct Aac {
    info: SharedInformation,
    state: Mutex<AacState>,
    events: EventDispatcher<StreamEvent>,
    info_frame: Mutex<Option<Packet>>,
}

pub fn new_source(info: SharedInformation) -> Arc<dyn TrackSource> {
    Arc::new(Aac::new(info))
}

impl Aac {
    pub fn new(info: SharedInformation) -> Aac {
        let timescale = info.read().timescale;

        let mut ctx = CodecContext::default();
        ctx.mime_type = "audio/mp4".to_string();
        ctx.ref_sample_duration = timescale * 1024 / 44100;
        ctx.flags.is_leading = 0;
        ctx.flags.sample_depends_on = 1;
        ctx.flags.sample_is_depended_on = 0;
        ctx.flags.sample_has_redundancy = 0;
        ctx.flags.is_non_sync = 0;

        Aac {
            info,
            state: Mutex::new(AacState {
                ctx,
                audio_object_type: AOT_NULL,
                sampling_frequency_index: 0,
                sampling_frequency: 0,
                channel_configuration: 0,
                channels: 0,
                extension_audio_object_type: AOT_NULL,
                extension_sampling_frequency_index: 0,
                extension_sampling_frequency: 0,
                extension_channel_configuration: 0,
                config: Vec::new(),
            }),
            events: EventDispatcher::new(),
            info_frame: Mutex::new(None),
        }
    }

    /// The serialized 2 or 4 byte AudioSpecificConfig, normalized per the
    /// SBR rules, once a config packet has been parsed
    pub fn config(&self) -> Vec<u8> {
        self.state.lock().config.clone()
    }

    pub fn sampling_frequency(&self) -> u32 {
        self.state.lock().sampling_frequency
    }

    fn parse_specific_config(&self, packet: &mut Packet) -> Result<(), CodecParseError> {
        if packet.left() < 2 {
            return Err(CodecParseError::NotEnoughData("AAC specific config"));
        }

        *self.info_frame.lock() = Some(packet.clone());

        let data = packet.remaining();
        let mut gb =
            BitReader::new(&data).ok_or(CodecParseError::BitReaderInit)?;

        let mut state = self.state.lock();
        let mut info = self.info.write();

        state.audio_object_type = gb.read_bits(5) as u8;
        if state.audio_object_type == AOT_ESCAPE {
            state.audio_object_type = 32 + gb.read_bits(6) as u8;
        }

        state.sampling_frequency_index = gb.read_bits(4) as u8;
        if state.sampling_frequency_index == 0xF {
            state.sampling_frequency = gb.read_bits(24);
        } else {
            state.sampling_frequency =
                SAMPLING_FREQUENCIES[state.sampling_frequency_index as usize];
        }
        info.sample_rate = state.sampling_frequency;

        state.channel_configuration = gb.read_bits(4) as u8;
        if (state.channel_configuration as usize) < CHANNELS.len() {
            state.channels = CHANNELS[state.channel_configuration as usize];
            info.channels = state.channels as u32;
        }

        if state.audio_object_type == AOT_SBR
            || (state.audio_object_type == AOT_PS
                // Check for the W6132 Annex YYYY draft MP3onMP4 sentinel
                && (gb.show_bits(3) & 0x03) == 0
                && (gb.show_bits(9) & 0x3F) == 0)
        {
            state.extension_sampling_frequency_index = gb.read_bits(4) as u8;
            if state.extension_sampling_frequency_index == 0xF {
                state.extension_sampling_frequency = gb.read_bits(24);
            } else {
                state.extension_sampling_frequency =
                    SAMPLING_FREQUENCIES[state.extension_sampling_frequency_index as usize];
            }
            info.sample_rate = state.extension_sampling_frequency;

            state.extension_audio_object_type = gb.read_bits(5) as u8;
            match state.extension_audio_object_type {
                AOT_ESCAPE => {
                    state.extension_audio_object_type = 32 + gb.read_bits(6) as u8;
                }
                AOT_ER_BSAC => {
                    state.extension_channel_configuration = gb.read_bits(4) as u8;
                    state.channels =
                        CHANNELS[(state.extension_channel_configuration & 0x07) as usize];
                    info.channels = state.extension_channel_configuration as u32;
                }
                _ => (),
            }
        } else {
            state.extension_audio_object_type = AOT_NULL;
            state.extension_sampling_frequency = 0;
        }

        if state.audio_object_type == AOT_ALS {
            gb.skip_bits(5);
            if gb.show_bits_long(24) != 0x00414C53 {
                // "\0ALS"
                gb.skip_bits(24);
            }

            parse_config_als(&mut gb, &mut state, &mut info)?;
        }

        if state.sampling_frequency == 0 {
            // Index 13 and 14 are reserved
            return Err(CodecParseError::InvalidData(format!(
                "reserved sampling frequency index {}",
                state.sampling_frequency_index
            )));
        }

        state.ctx.ref_sample_duration = info.timescale * 1024 / state.sampling_frequency;

        // Normalize: advertise SBR unless the stream is mono AAC-LC
        state.audio_object_type = AOT_SBR;
        state.extension_sampling_frequency_index = state.sampling_frequency_index;
        if state.sampling_frequency_index >= 6 {
            state.extension_sampling_frequency_index -= 3;
        } else if state.channel_configuration == 1 {
            state.audio_object_type = AOT_AAC_LC;
        }

        if state.audio_object_type == AOT_SBR {
            state.config = vec![
                (state.audio_object_type << 3) | (state.sampling_frequency_index >> 1),
                (state.sampling_frequency_index << 7)
                    | (state.channel_configuration << 3)
                    | (state.extension_sampling_frequency_index >> 1),
                (state.extension_sampling_frequency_index << 7) | 0x08,
                0x00,
            ];
        } else {
            state.config = vec![
                (state.audio_object_type << 3) | (state.sampling_frequency_index >> 1),
                (state.sampling_frequency_index << 7) | (state.channel_configuration << 3),
            ];
        }

        state.ctx.codec = format!("mp4a.40.{}", state.audio_object_type);
        let codec = state.ctx.codec.clone();
        info.codecs.push(codec);

        Ok(())
    }

    fn parse_raw_frame(&self, packet: &mut Packet) {
        let timestamp = self.info.read().timestamp;

        packet.side = Side::Audio {
            sample_rate: 0,
            sample_size: 0,
            sample_type: 0,
            data_type: RAW_FRAME_DATA,
            dts: timestamp,
            pts: timestamp,
            data: packet.remaining(),
        };
    }
}

fn parse_config_als(
    gb: &mut BitReader,
    state: &mut AacState,
    info: &mut crate::info::Information,
) -> Result<(), CodecParseError> {
    if gb.left() < 112 {
        return Err(CodecParseError::NotEnoughData("ALS config"));
    }

    if gb.read_bits_long(32) != 0x414C5300 {
        // "ALS\0"
        return Err(CodecParseError::InvalidData("ALS sentinel missing".to_string()));
    }

    // Override the AudioSpecificConfig channel configuration and sample
    // rate, which are unreliable in old ALS conformance files
    state.sampling_frequency = gb.read_bits_long(32);
    info.sample_rate = state.sampling_frequency;

    // Skip the number of samples
    gb.skip_bits(32);

    state.channel_configuration = 0;
    state.channels = gb.read_bits(16) as u16 + 1;
    info.channels = state.channels as u32;
    Ok(())
}

impl TrackSource for Aac {
    fn kind(&self) -> &'static str {
        "AAC"
    }

    fn media_kind(&self) -> PacketKind {
        PacketKind::Audio
    }

    fn context(&self) -> CodecContext {
        self.state.lock().ctx.clone()
    }

    fn information(&self) -> SharedInformation {
        self.info.clone()
    }

    fn parse(&self, packet: &mut Packet) -> Result<(), CodecParseError> {
        if packet.left() < 1 {
            return Err(CodecParseError::NotEnoughData("AAC packet"));
        }

        self.info.write().timestamp = packet.timestamp;

        let data_type = packet.payload[packet.position];
        packet.advance(1);
        packet.codec = "AAC";

        match data_type {
            SPECIFIC_CONFIG => {
                let timestamp = self.info.read().timestamp;
                self.parse_specific_config(packet)?;
                packet.side = Side::Audio {
                    sample_rate: 0,
                    sample_size: 0,
                    sample_type: 0,
                    data_type: SPECIFIC_CONFIG,
                    dts: timestamp,
                    pts: timestamp,
                    data: packet.remaining(),
                };
                Ok(())
            }

            RAW_FRAME_DATA => {
                self.parse_raw_frame(packet);
                Ok(())
            }

            x => {
                debug!(data_type = x, "unrecognized AAC packet type");
                Err(CodecParseError::UnrecognizedPacketType(x))
            }
        }
    }

    fn sink(&self, packet: Arc<Packet>) {
        let mut event = StreamEvent::packet(packet);
        self.events.dispatch_event(event_type::PACKET, &mut event);
    }

    fn info_frame(&self) -> Option<Packet> {
        self.info_frame.lock().clone()
    }

    fn set_info_frame(&self, packet: Packet) {
        *self.info_frame.lock() = Some(packet);
    }

    fn events(&self) -> &EventDispatcher<StreamEvent> {
        &self.events
    }

    fn decoder_config(&self) -> Option<DecoderConfig> {
        let state = self.state.lock();
        if state.config.is_empty() {
            return None;
        }

        Some(DecoderConfig::Audio {
            channel_configuration: state.channel_configuration,
            sampling_frequency: state.sampling_frequency,
            config: state.config.clone(),
        })
    }
}
