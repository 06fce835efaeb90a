//! H.264 decoder configuration record, SPS/PPS/VUI/HRD, and NAL unit
//! stream parsing.

use super::{
    CodecParseError, DecoderConfig, ParameterSets, TrackSource, COL_PRI_NB, COL_PRI_UNSPECIFIED,
    COL_SPC_NB, COL_SPC_UNSPECIFIED, COL_TRC_NB, COL_TRC_UNSPECIFIED,
};
use crate::bits::BitReader;
use crate::context::CodecContext;
use crate::events::EventDispatcher;
use crate::format::{event_type, StreamEvent};
use crate::info::{Rational, SharedInformation};
use crate::packet::{Packet, PacketKind, Side};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_PICTURE_COUNT: u32 = 36;
const MAX_SPS_COUNT: u32 = 32;
const MAX_PPS_COUNT: u32 = 256;
const MAX_LOG2_MAX_FRAME_NUM: u32 = 12 + 4;
const MIN_LOG2_MAX_FRAME_NUM: u32 = 4;
const EXTENDED_SAR: u8 = 255;

/// FLV video data types
pub const SEQUENCE_HEADER: u8 = 0x00;
pub const NALU: u8 = 0x01;
pub const END_OF_SEQUENCE: u8 = 0x02;

/// NAL unit types
pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR_SLICE: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// RTMP/FLV video frame types
pub const KEYFRAME: u8 = 0x1;
pub const INTER_FRAME: u8 = 0x2;
pub const GENERATED_KEYFRAME: u8 = 0x4;
pub const INFO_OR_COMMAND_FRAME: u8 = 0x5;

const PIXEL_ASPECT: [Rational; 17] = [
    Rational { num: 0.0, den: 1.0 },
    Rational { num: 1.0, den: 1.0 },
    Rational { num: 12.0, den: 11.0 },
    Rational { num: 10.0, den: 11.0 },
    Rational { num: 16.0, den: 11.0 },
    Rational { num: 40.0, den: 33.0 },
    Rational { num: 24.0, den: 11.0 },
    Rational { num: 20.0, den: 11.0 },
    Rational { num: 32.0, den: 11.0 },
    Rational { num: 80.0, den: 33.0 },
    Rational { num: 18.0, den: 11.0 },
    Rational { num: 15.0, den: 11.0 },
    Rational { num: 64.0, den: 33.0 },
    Rational { num: 160.0, den: 99.0 },
    Rational { num: 4.0, den: 3.0 },
    Rational { num: 3.0, den: 2.0 },
    Rational { num: 2.0, den: 1.0 },
];

/// Hypothetical reference decoder parameters
#[derive(Debug, Clone, Default)]
pub struct Hrd {
    pub cpb_cnt: u32,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub bit_rate_value: [u32; 32],
    pub cpb_size_value: [u32; 32],
    pub cbr_flag: u32,
    pub initial_cpb_removal_delay_length: u32,
    pub cpb_removal_delay_length: u32,
    pub dpb_output_delay_length: u32,
    pub time_offset_length: u32,
}

/// Video usability information
#[derive(Debug, Clone, Default)]
pub struct Vui {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar: Rational,
    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,
    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: u8,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u32,
    pub chroma_sample_loc_type_bottom_field: u32,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,
    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd: Hrd,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd: Hrd,
    pub low_delay_hrd_flag: bool,
    pub pic_struct_present_flag: bool,
    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

/// Sequence parameter set
#[derive(Debug, Clone, Default)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_set_flags: u8,
    pub reserved_zero_2bits: u8,
    pub level_idc: u8,
    pub id: u32,
    pub chroma_format_idc: u32,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma: u32,
    pub bit_depth_chroma: u32,
    pub transform_bypass: bool,
    pub seq_scaling_matrix_present_flag: bool,
    pub log2_max_frame_num: u32,
    pub poc_type: u32,
    pub log2_max_poc_lsb: u32,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: u32,
    pub offset_for_top_to_bottom_field: u32,
    pub num_ref_frames_in_poc_cycle: u32,
    pub offset_for_ref_frame: Vec<u16>,
    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width: u32,
    pub pic_height: u32,
    pub frame_mbs_only_flag: u8,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,
    pub vui_parameters_present_flag: bool,
    pub vui: Vui,
    pub data: Vec<u8>,
}

/// Picture parameter set
#[derive(Debug, Clone, Default)]
pub struct Pps {
    pub id: u32,
    pub sps_id: u32,
    pub entropy_coding_mode_flag: bool,
    pub pic_order_present_flag: bool,
    pub num_slice_groups: u32,
    pub slice_group_map_type: u32,
    pub num_ref_idx: [u32; 2],
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp: i32,
    pub pic_init_qs: i32,
    pub chroma_qp_index_offset: [i32; 2],
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,
    pub pic_scaling_matrix_present_flag: bool,
    pub chroma_qp_diff: bool,
    pub data: Vec<u8>,
}

struct AvcState {
    ctx: CodecContext,

    // Decoder configuration record
    avcc: Bytes,
    configuration_version: u8,
    profile_indication: u8,
    profile_compatibility: u8,
    level_indication: u8,
    nal_length_size: u32,
    sps: Sps,
    pps: Pps,
}

/// The H.264 track source
pub struct Avc {
    info: SharedInformation,
    state: Mutex<AvcState>,
    events: EventDispatcher<StreamEvent>,
    info_frame: Mutex<Option<Packet>>,
}

pub fn new_source(info: SharedInformation) -> Arc<dyn TrackSource> {
    Arc::new(Avc::new(info))
}

impl Avc {
    pub fn new(info: SharedInformation) -> Avc {
        let mut ctx = CodecContext::default();
        ctx.mime_type = "video/mp4".to_string();
        ctx.flags.is_leading = 0;
        ctx.flags.sample_has_redundancy = 0;
        ctx.flags.is_non_sync = 0;

        Avc {
            info,
            state: Mutex::new(AvcState {
                ctx,
                avcc: Bytes::new(),
                configuration_version: 0,
                profile_indication: 0,
                profile_compatibility: 0,
                level_indication: 0,
                nal_length_size: 4,
                sps: Sps::default(),
                pps: Pps::default(),
            }),
            events: EventDispatcher::new(),
            info_frame: Mutex::new(None),
        }
    }

    pub fn sps(&self) -> Sps {
        self.state.lock().sps.clone()
    }

    pub fn pps(&self) -> Pps {
        self.state.lock().pps.clone()
    }

    fn parse_decoder_configuration_record(
        &self,
        packet: &Packet,
        data: Bytes,
    ) -> Result<(), CodecParseError> {
        if data.len() < 7 {
            return Err(CodecParseError::NotEnoughData(
                "AVC decoder configuration record",
            ));
        }

        {
            let mut state = self.state.lock();
            state.avcc = data.clone();
            state.configuration_version = data[0];
            state.profile_indication = data[1];
            state.profile_compatibility = data[2];
            state.level_indication = data[3];

            if state.configuration_version != 1 {
                return Err(CodecParseError::InvalidData(format!(
                    "invalid AVC configuration version: {}",
                    state.configuration_version
                )));
            }

            state.nal_length_size = (data[4] & 0x03) as u32 + 1;
            if state.nal_length_size < 3 {
                return Err(CodecParseError::InvalidData(format!(
                    "invalid NAL length size: {}",
                    state.nal_length_size
                )));
            }
        }

        let mut i = 5_usize;

        let sps_count = (data[i] & 0x1F) as usize;
        i += 1;

        for _ in 0..sps_count {
            if i + 2 > data.len() {
                return Err(CodecParseError::NotEnoughData("SPS length"));
            }

            let n = ((data[i] as usize) << 8) | data[i + 1] as usize;
            if n == 0 {
                continue;
            }

            i += 2;
            if i + n > data.len() {
                return Err(CodecParseError::NotEnoughData("SPS"));
            }

            self.parse_sps(&data[i..i + n])?;
            i += n;
        }

        if i >= data.len() {
            return Err(CodecParseError::NotEnoughData("PPS count"));
        }

        let pps_count = data[i] as usize;
        i += 1;

        for _ in 0..pps_count {
            if i + 2 > data.len() {
                return Err(CodecParseError::NotEnoughData("PPS length"));
            }

            let n = ((data[i] as usize) << 8) | data[i + 1] as usize;
            if n == 0 {
                continue;
            }

            i += 2;
            if i + n > data.len() {
                return Err(CodecParseError::NotEnoughData("PPS"));
            }

            self.parse_pps(&data[i..i + n])?;
            i += n;
        }

        *self.info_frame.lock() = Some(packet.clone());
        Ok(())
    }

    /// Parses one SPS NAL unit.  The parse runs against a scratch SPS and is
    /// only committed on success, so a malformed SPS never leaves partially
    /// initialized state behind.
    fn parse_sps(&self, data: &[u8]) -> Result<(), CodecParseError> {
        if data.len() < 4 {
            return Err(CodecParseError::NotEnoughData("SPS"));
        }

        let codec = format!(
            "avc1.{:02x}{:02x}{:02x}",
            data[1], data[2], data[3]
        );

        let rbsp = ebsp_to_rbsp(data);
        let mut gb = BitReader::new(&rbsp).ok_or(CodecParseError::BitReaderInit)?;

        let mut sps = Sps::default();
        sps.data = rbsp.clone();

        gb.read_bits(8); // NAL header

        sps.profile_idc = gb.read_bits(8) as u8;
        sps.constraint_set_flags = gb.read_bits(1) as u8; // constraint_set0_flag
        sps.constraint_set_flags |= (gb.read_bits(1) as u8) << 1; // constraint_set1_flag
        sps.constraint_set_flags |= (gb.read_bits(1) as u8) << 2; // constraint_set2_flag
        sps.constraint_set_flags |= (gb.read_bits(1) as u8) << 3; // constraint_set3_flag
        sps.constraint_set_flags |= (gb.read_bits(1) as u8) << 4; // constraint_set4_flag
        sps.constraint_set_flags |= (gb.read_bits(1) as u8) << 5; // constraint_set5_flag
        sps.reserved_zero_2bits = gb.read_bits(2) as u8;
        sps.level_idc = gb.read_bits(8) as u8;
        sps.id = gb.read_ue();

        if sps.id >= MAX_SPS_COUNT {
            return Err(CodecParseError::InvalidData(format!(
                "SPS id {} out of range",
                sps.id
            )));
        }

        sps.vui.video_full_range_flag = 1;
        sps.vui.matrix_coefficients = COL_SPC_UNSPECIFIED;

        match sps.profile_idc {
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 144 => {
                sps.chroma_format_idc = gb.read_ue();
                if sps.chroma_format_idc > 3 {
                    return Err(CodecParseError::InvalidData(format!(
                        "bad chroma_format_idc {}",
                        sps.chroma_format_idc
                    )));
                } else if sps.chroma_format_idc == 3 {
                    sps.separate_colour_plane_flag = gb.read_flag();
                    if sps.separate_colour_plane_flag {
                        return Err(CodecParseError::InvalidData(
                            "separate colour planes are not supported".to_string(),
                        ));
                    }
                }

                sps.bit_depth_luma = gb.read_ue() + 8;
                sps.bit_depth_chroma = gb.read_ue() + 8;
                if sps.bit_depth_chroma != sps.bit_depth_luma {
                    return Err(CodecParseError::InvalidData(
                        "different chroma and luma bit depth".to_string(),
                    ));
                }

                if !(8..=14).contains(&sps.bit_depth_luma)
                    || !(8..=14).contains(&sps.bit_depth_chroma)
                {
                    return Err(CodecParseError::InvalidData(format!(
                        "illegal bit depth value ({}, {})",
                        sps.bit_depth_luma, sps.bit_depth_chroma
                    )));
                }

                sps.transform_bypass = gb.read_flag();

                sps.seq_scaling_matrix_present_flag = gb.read_flag();
                if sps.seq_scaling_matrix_present_flag {
                    skip_scaling_matrices(&mut gb, sps.chroma_format_idc, 8);
                }
            }

            _ => {
                sps.chroma_format_idc = 1;
                sps.bit_depth_luma = 8;
                sps.bit_depth_chroma = 8;
            }
        }

        sps.log2_max_frame_num = gb.read_ue() + 4;
        if !(MIN_LOG2_MAX_FRAME_NUM..=MAX_LOG2_MAX_FRAME_NUM).contains(&sps.log2_max_frame_num) {
            return Err(CodecParseError::InvalidData(format!(
                "log2_max_frame_num_minus4 out of range (0-12): {}",
                sps.log2_max_frame_num - 4
            )));
        }

        sps.poc_type = gb.read_ue();
        if sps.poc_type == 0 {
            sps.log2_max_poc_lsb = gb.read_ue() + 4;
            if sps.log2_max_poc_lsb > 16 {
                return Err(CodecParseError::InvalidData(format!(
                    "log2_max_poc_lsb ({}) is out of range",
                    sps.log2_max_poc_lsb
                )));
            }
        } else if sps.poc_type == 1 {
            sps.delta_pic_order_always_zero_flag = gb.read_flag();
            sps.offset_for_non_ref_pic = gb.read_ue();
            sps.offset_for_top_to_bottom_field = gb.read_ue();
            sps.num_ref_frames_in_poc_cycle = gb.read_ue();

            if sps.num_ref_frames_in_poc_cycle >= 256 {
                return Err(CodecParseError::InvalidData(format!(
                    "poc_cycle_length overflow {}",
                    sps.num_ref_frames_in_poc_cycle
                )));
            }

            for _ in 0..sps.num_ref_frames_in_poc_cycle {
                sps.offset_for_ref_frame.push(gb.read_ue() as u16);
            }
        } else if sps.poc_type != 2 {
            return Err(CodecParseError::InvalidData(format!(
                "illegal POC type {}",
                sps.poc_type
            )));
        }

        sps.max_num_ref_frames = gb.read_ue();
        if sps.max_num_ref_frames > MAX_PICTURE_COUNT - 2 || sps.max_num_ref_frames > 16 {
            return Err(CodecParseError::InvalidData(format!(
                "too many reference frames {}",
                sps.max_num_ref_frames
            )));
        }

        sps.gaps_in_frame_num_value_allowed_flag = gb.read_flag();
        sps.pic_width = gb.read_ue() + 1;
        sps.pic_height = gb.read_ue() + 1;
        if sps.pic_width >= (i32::MAX / 16) as u32
            || sps.pic_height >= (i32::MAX / 16) as u32
            || !check_image_size(16 * sps.pic_width, 16 * sps.pic_height)
        {
            return Err(CodecParseError::InvalidData(
                "pic_width or pic_height overflow".to_string(),
            ));
        }

        sps.frame_mbs_only_flag = gb.read_bits(1) as u8;
        if sps.frame_mbs_only_flag == 0 {
            sps.mb_adaptive_frame_field_flag = gb.read_flag();
        }

        let mut codec_width = 16 * sps.pic_width;
        let mut codec_height = 16 * sps.pic_height * (2 - sps.frame_mbs_only_flag as u32);

        sps.direct_8x8_inference_flag = gb.read_flag();
        sps.frame_cropping_flag = gb.read_flag();
        if sps.frame_cropping_flag {
            let crop_left = gb.read_ue();
            let crop_right = gb.read_ue();
            let crop_top = gb.read_ue();
            let crop_bottom = gb.read_ue();

            let vsub = if sps.chroma_format_idc == 1 { 1 } else { 0 };
            let hsub = if sps.chroma_format_idc == 1 || sps.chroma_format_idc == 2 {
                1
            } else {
                0
            };
            let step_x = 1_u32 << hsub;
            let step_y = (2 - sps.frame_mbs_only_flag as u32) << vsub;

            let limit = (i32::MAX / 4) as u32;
            if crop_left > limit / step_x
                || crop_right > limit / step_x
                || crop_top > limit / step_y
                || crop_bottom > limit / step_y
                || (crop_left + crop_right) * step_x >= codec_width
                || (crop_top + crop_bottom) * step_y >= codec_height
            {
                return Err(CodecParseError::InvalidData(format!(
                    "invalid crop values l={} r={} t={} b={} w={} h={}",
                    crop_left, crop_right, crop_top, crop_bottom, codec_width, codec_height
                )));
            }

            sps.frame_crop_left_offset = crop_left * step_x;
            sps.frame_crop_right_offset = crop_right * step_x;
            sps.frame_crop_top_offset = crop_top * step_y;
            sps.frame_crop_bottom_offset = crop_bottom * step_y;
        }

        sps.vui_parameters_present_flag = gb.read_flag();
        if sps.vui_parameters_present_flag {
            if let Err(error) = decode_vui_parameters(&mut gb, &mut sps.vui) {
                // Recoverable: leave the questionable VUI values to the
                // decoder and keep deriving the rest of the information
                warn!("{}", error);
            }
        }

        codec_width -= sps.frame_crop_left_offset + sps.frame_crop_right_offset;
        codec_height -= sps.frame_crop_top_offset + sps.frame_crop_bottom_offset;

        let (timescale, frame_rate) = {
            let mut info = self.info.write();
            info.codec_width = codec_width;
            info.codec_height = codec_height;
            info.width = codec_width;
            info.height = codec_height;

            if sps.vui.timing_info_present_flag {
                info.frame_rate = Rational {
                    num: sps.vui.time_scale as f64,
                    den: (sps.vui.num_units_in_tick * 2) as f64,
                };
            }

            if sps.vui.sar.den > 1.0 {
                info.width *= (sps.vui.sar.num / sps.vui.sar.den) as u32;
            }

            info.codecs.push(codec.clone());
            (info.timescale, info.frame_rate)
        };

        let mut state = self.state.lock();
        if sps.vui.timing_info_present_flag && frame_rate.num > 0.0 {
            state.ctx.ref_sample_duration =
                (timescale as f64 * frame_rate.den / frame_rate.num) as u32;
        }
        state.ctx.codec = codec;
        state.sps = sps;
        Ok(())
    }

    fn parse_pps(&self, data: &[u8]) -> Result<(), CodecParseError> {
        let rbsp = ebsp_to_rbsp(data);
        let mut gb = BitReader::new(&rbsp).ok_or(CodecParseError::BitReaderInit)?;

        let mut state = self.state.lock();
        let mut pps = Pps::default();
        pps.data = rbsp.clone();

        gb.read_bits(8); // NAL header

        pps.id = gb.read_ue();
        if pps.id >= MAX_PPS_COUNT {
            return Err(CodecParseError::InvalidData(format!(
                "PPS id {} out of range",
                pps.id
            )));
        }

        pps.sps_id = gb.read_ue();
        if pps.sps_id >= MAX_SPS_COUNT {
            return Err(CodecParseError::InvalidData(format!(
                "SPS id {} out of range",
                pps.sps_id
            )));
        }

        let sps = &state.sps;
        if sps.bit_depth_luma > 14 {
            return Err(CodecParseError::InvalidData(format!(
                "invalid bit_depth_luma {}",
                sps.bit_depth_luma
            )));
        } else if sps.bit_depth_luma == 11 || sps.bit_depth_luma == 13 {
            return Err(CodecParseError::InvalidData(format!(
                "unimplemented bit_depth_luma {}",
                sps.bit_depth_luma
            )));
        }

        pps.entropy_coding_mode_flag = gb.read_flag();
        pps.pic_order_present_flag = gb.read_flag();
        pps.num_slice_groups = gb.read_ue() + 1;
        if pps.num_slice_groups > 1 {
            // Flexible macroblock ordering is parsed past, not interpreted
            pps.slice_group_map_type = gb.read_ue();
            debug!("FMO not supported");
        }

        pps.num_ref_idx[0] = gb.read_ue() + 1;
        pps.num_ref_idx[1] = gb.read_ue() + 1;
        if pps.num_ref_idx[0] > 32 || pps.num_ref_idx[1] > 32 {
            return Err(CodecParseError::InvalidData(
                "reference overflow (pps)".to_string(),
            ));
        }

        let qp_bd_offset = 6 * (sps.bit_depth_luma as i32 - 8);

        pps.weighted_pred_flag = gb.read_flag();
        pps.weighted_bipred_idc = gb.read_bits(2) as u8;
        pps.pic_init_qp = gb.read_se() + 26 + qp_bd_offset;
        pps.pic_init_qs = gb.read_se() + 26 + qp_bd_offset;
        pps.chroma_qp_index_offset[0] = gb.read_se();
        pps.deblocking_filter_control_present_flag = gb.read_flag();
        pps.constrained_intra_pred_flag = gb.read_flag();
        pps.redundant_pic_cnt_present_flag = gb.read_flag();

        if gb.left() > 0 && more_rbsp_in_pps(sps) {
            pps.transform_8x8_mode_flag = gb.read_flag();
            pps.pic_scaling_matrix_present_flag = gb.read_flag();
            if pps.pic_scaling_matrix_present_flag {
                let extra = if sps.chroma_format_idc == 3 { 6 } else { 2 };
                gb.read_bits(6 + extra * pps.transform_8x8_mode_flag as usize);
            }

            pps.chroma_qp_index_offset[1] = gb.read_se(); // second_chroma_qp_index_offset
        } else {
            pps.chroma_qp_index_offset[1] = pps.chroma_qp_index_offset[0];
        }

        if pps.chroma_qp_index_offset[0] != pps.chroma_qp_index_offset[1] {
            pps.chroma_qp_diff = true;
        }

        state.pps = pps;
        Ok(())
    }

    fn parse_nal_units(
        &self,
        packet: &mut Packet,
        frame_type: u8,
        data_type: u8,
        cts: u32,
        data: Bytes,
    ) -> Result<(), CodecParseError> {
        let nal_length_size = self.state.lock().nal_length_size as usize;
        let (time_base, timestamp) = {
            let info = self.info.read();
            (info.time_base, info.timestamp)
        };

        let dts = time_base + timestamp;
        let pts = cts + dts;

        let mut keyframe = frame_type == KEYFRAME;
        let mut nalu_type = 0_u8;
        let mut nalus: Vec<Bytes> = Vec::new();

        let size = data.len();
        let mut i = 0_usize;
        while i < size {
            if i + 4 >= size {
                return Err(CodecParseError::NotEnoughData("AVC NAL units"));
            }

            let mut nalu_size = ((data[i] as usize) << 24)
                | ((data[i + 1] as usize) << 16)
                | ((data[i + 2] as usize) << 8)
                | data[i + 3] as usize;
            if nal_length_size == 3 {
                nalu_size >>= 8;
            }

            i += 4;

            if i + nalu_size > size {
                return Err(CodecParseError::InvalidData(format!(
                    "malformed NAL units near timestamp {}",
                    dts
                )));
            }

            let nalu = data.slice(i..i + nalu_size);
            i += nalu_size;

            nalu_type = nalu[0] & 0x1F;
            if nalu_type == NAL_IDR_SLICE {
                keyframe = true;
            }

            nalus.push(nalu);
        }

        packet.side = Side::Video {
            frame_type,
            data_type,
            cts,
            dts,
            pts,
            keyframe,
            nalu_type,
            nalus,
            data,
        };

        Ok(())
    }
}

impl TrackSource for Avc {
    fn kind(&self) -> &'static str {
        "AVC"
    }

    fn media_kind(&self) -> PacketKind {
        PacketKind::Video
    }

    fn context(&self) -> CodecContext {
        self.state.lock().ctx.clone()
    }

    fn information(&self) -> SharedInformation {
        self.info.clone()
    }

    fn parse(&self, packet: &mut Packet) -> Result<(), CodecParseError> {
        if packet.payload.len() < 5 {
            return Err(CodecParseError::NotEnoughData("AVC packet"));
        }

        self.info.write().timestamp = packet.timestamp;
        packet.codec = "AVC";

        let payload = packet.payload.clone();
        let frame_type = payload[0] >> 4;
        let data_type = payload[1];
        let cts =
            ((payload[2] as u32) << 16) | ((payload[3] as u32) << 8) | payload[4] as u32;
        let body = payload.slice(5..);

        packet.position = 5;

        match data_type {
            SEQUENCE_HEADER => {
                self.parse_decoder_configuration_record(packet, body.clone())?;
                packet.side = Side::Video {
                    frame_type,
                    data_type,
                    cts,
                    dts: 0,
                    pts: 0,
                    keyframe: true,
                    nalu_type: 0,
                    nalus: Vec::new(),
                    data: body,
                };
                Ok(())
            }

            NALU => self.parse_nal_units(packet, frame_type, data_type, cts, body),

            END_OF_SEQUENCE => {
                debug!("AVC sequence end");
                packet.side = Side::Video {
                    frame_type,
                    data_type,
                    cts,
                    dts: self.info.read().time_base + self.info.read().timestamp,
                    pts: 0,
                    keyframe: false,
                    nalu_type: 0,
                    nalus: Vec::new(),
                    data: body,
                };
                Ok(())
            }

            x => {
                debug!(data_type = x, "unrecognized AVC packet type");
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
        if state.avcc.is_empty() {
            return None;
        }

        Some(DecoderConfig::Video {
            avcc: state.avcc.clone(),
        })
    }

    fn parameter_sets(&self) -> Option<ParameterSets> {
        let state = self.state.lock();
        if state.sps.data.is_empty() || state.pps.data.is_empty() {
            return None;
        }

        Some(ParameterSets {
            sps: Bytes::from(state.sps.data.clone()),
            pps: Bytes::from(state.pps.data.clone()),
        })
    }
}

fn decode_vui_parameters(gb: &mut BitReader, vui: &mut Vui) -> Result<(), CodecParseError> {
    vui.aspect_ratio_info_present_flag = gb.read_flag();
    if vui.aspect_ratio_info_present_flag {
        vui.aspect_ratio_idc = gb.read_bits(8) as u8;
        if vui.aspect_ratio_idc == EXTENDED_SAR {
            vui.sar = Rational {
                num: gb.read_bits(16) as f64,
                den: gb.read_bits(16) as f64,
            };
        } else if (vui.aspect_ratio_idc as usize) < PIXEL_ASPECT.len() {
            vui.sar = PIXEL_ASPECT[vui.aspect_ratio_idc as usize];
        } else {
            return Err(CodecParseError::InvalidData("illegal aspect ratio".to_string()));
        }
    } else {
        vui.sar = Rational { num: 0.0, den: 0.0 };
    }

    vui.overscan_info_present_flag = gb.read_flag();
    if vui.overscan_info_present_flag {
        vui.overscan_appropriate_flag = gb.read_flag();
    }

    vui.video_signal_type_present_flag = gb.read_flag();
    if vui.video_signal_type_present_flag {
        vui.video_format = gb.read_bits(3) as u8;
        vui.video_full_range_flag = gb.read_bits(1) as u8;
        vui.colour_description_present_flag = gb.read_flag();

        if vui.colour_description_present_flag {
            vui.colour_primaries = gb.read_bits(8) as u8;
            vui.transfer_characteristics = gb.read_bits(8) as u8;
            vui.matrix_coefficients = gb.read_bits(8) as u8;

            // Values outside the tables are substituted, not fatal
            if vui.colour_primaries >= COL_PRI_NB {
                vui.colour_primaries = COL_PRI_UNSPECIFIED;
            }
            if vui.transfer_characteristics >= COL_TRC_NB {
                vui.transfer_characteristics = COL_TRC_UNSPECIFIED;
            }
            if vui.matrix_coefficients >= COL_SPC_NB {
                vui.matrix_coefficients = COL_SPC_UNSPECIFIED;
            }
        }
    }

    vui.chroma_loc_info_present_flag = gb.read_flag();
    if vui.chroma_loc_info_present_flag {
        vui.chroma_sample_loc_type_top_field = gb.read_ue();
        vui.chroma_sample_loc_type_bottom_field = gb.read_ue();
    }

    if gb.left() < 10 {
        return Err(CodecParseError::InvalidData("truncated VUI".to_string()));
    }

    vui.timing_info_present_flag = gb.read_flag();
    if vui.timing_info_present_flag {
        vui.num_units_in_tick = gb.read_bits_long(32);
        vui.time_scale = gb.read_bits_long(32);

        if vui.num_units_in_tick == 0 || vui.time_scale == 0 {
            warn!(
                time_scale = vui.time_scale,
                num_units_in_tick = vui.num_units_in_tick,
                "time_scale/num_units_in_tick invalid or unsupported"
            );
            vui.timing_info_present_flag = false;
        }

        vui.fixed_frame_rate_flag = gb.read_flag();
    }

    vui.nal_hrd_parameters_present_flag = gb.read_flag();
    if vui.nal_hrd_parameters_present_flag {
        decode_hrd_parameters(gb, &mut vui.nal_hrd)?;
    }

    vui.vcl_hrd_parameters_present_flag = gb.read_flag();
    if vui.vcl_hrd_parameters_present_flag {
        decode_hrd_parameters(gb, &mut vui.vcl_hrd)?;
    }

    if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
        vui.low_delay_hrd_flag = gb.read_flag();
    }

    vui.pic_struct_present_flag = gb.read_flag();
    if gb.left() == 0 {
        return Ok(());
    }

    vui.bitstream_restriction_flag = gb.read_flag();
    if vui.bitstream_restriction_flag {
        vui.motion_vectors_over_pic_boundaries_flag = gb.read_flag();
        vui.max_bytes_per_pic_denom = gb.read_ue();
        vui.max_bits_per_mb_denom = gb.read_ue();
        vui.log2_max_mv_length_horizontal = gb.read_ue();
        vui.log2_max_mv_length_vertical = gb.read_ue();
        vui.max_num_reorder_frames = gb.read_ue();
        vui.max_dec_frame_buffering = gb.read_ue();

        if gb.left() < 0 {
            vui.max_num_reorder_frames = 0;
            vui.bitstream_restriction_flag = false;
        }

        if vui.max_num_reorder_frames > 16 {
            vui.max_num_reorder_frames = 16;
            return Err(CodecParseError::InvalidData(
                "clipping illegal max_num_reorder_frames to 16".to_string(),
            ));
        }
    }

    Ok(())
}

fn decode_hrd_parameters(gb: &mut BitReader, hrd: &mut Hrd) -> Result<(), CodecParseError> {
    hrd.cpb_cnt = gb.read_ue() + 1;
    if hrd.cpb_cnt > 32 {
        return Err(CodecParseError::InvalidData(format!(
            "invalid cpb_cnt {}",
            hrd.cpb_cnt
        )));
    }

    hrd.bit_rate_scale = gb.read_bits(4) as u8;
    hrd.cpb_size_scale = gb.read_bits(4) as u8;

    for i in 0..hrd.cpb_cnt as usize {
        hrd.bit_rate_value[i] = gb.read_ue();
        hrd.cpb_size_value[i] = gb.read_ue();
        hrd.cbr_flag |= gb.read_bits(1) << i;
    }

    hrd.initial_cpb_removal_delay_length = gb.read_bits(5) + 1;
    hrd.cpb_removal_delay_length = gb.read_bits(5) + 1;
    hrd.dpb_output_delay_length = gb.read_bits(5) + 1;
    hrd.time_offset_length = gb.read_bits(5);

    Ok(())
}

fn skip_scaling_matrices(gb: &mut BitReader, chroma_format_idc: u32, base_count: usize) {
    let mut count = base_count;
    if chroma_format_idc == 3 {
        count += 4;
    }

    for i in 0..count {
        if gb.read_bits(1) != 0 {
            // seq_scaling_list_present_flag
            let size = if i >= 6 { 64 } else { 16 };
            let mut last = 8_i32;
            let mut next = 8_i32;

            for _ in 0..size {
                let delta = gb.read_se();
                next = (last + delta + 256) % 256;
                if next != 0 {
                    last = next;
                }
            }
        }
    }
}

fn more_rbsp_in_pps(sps: &Sps) -> bool {
    if (sps.profile_idc == 66 || sps.profile_idc == 77 || sps.profile_idc == 88)
        && (sps.constraint_set_flags & 7) != 0
    {
        debug!("current profile doesn't provide more RBSP data in PPS, skipping");
        return false;
    }

    true
}

fn check_image_size(width: u32, height: u32) -> bool {
    width != 0 && height != 0 && (width + 128) * (height + 128) < (i32::MAX / 8) as u32
}

/// EBSP to RBSP: drops the 0x03 of every 00 00 03 emulation prevention
/// pattern
fn ebsp_to_rbsp(data: &[u8]) -> Vec<u8> {
    let mut rbsp = Vec::with_capacity(data.len());
    rbsp.extend_from_slice(&data[..data.len().min(2)]);

    for j in 2..data.len() {
        if data[j] == 0x03 && data[j - 1] == 0x00 && data[j - 2] == 0x00 {
            continue;
        }

        rbsp.push(data[j]);
    }

    rbsp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::shared_information;
    use crate::testutil::{avcc_record, simple_pps, sps_720p30, BitWriter};

    fn sequence_header_packet(sps: &[u8], pps: &[u8]) -> Packet {
        let mut payload = vec![0x17, 0x00, 0x00, 0x00, 0x00];
        payload.extend(avcc_record(sps, pps));
        Packet::new(PacketKind::Video, Bytes::from(payload))
    }

    #[test]
    fn sps_derives_720p_dimensions_and_frame_rate() {
        let info = shared_information();
        let avc = Avc::new(info.clone());

        let mut packet = sequence_header_packet(&sps_720p30(), &simple_pps());
        avc.parse(&mut packet).unwrap();

        let info = info.read();
        assert_eq!(info.codec_width, 1280);
        assert_eq!(info.codec_height, 720);
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.frame_rate.num, 60.0);
        assert_eq!(info.frame_rate.den, 2.0);

        assert_eq!(avc.context().codec, "avc1.42001f");
        assert!(avc.info_frame().is_some());
    }

    #[test]
    fn pps_fields_are_decoded() {
        let avc = Avc::new(shared_information());

        let mut packet = sequence_header_packet(&sps_720p30(), &simple_pps());
        avc.parse(&mut packet).unwrap();

        let pps = avc.pps();
        assert_eq!(pps.id, 0);
        assert_eq!(pps.sps_id, 0);
        assert_eq!(pps.num_slice_groups, 1);
        assert_eq!(pps.num_ref_idx, [1, 1]);
        assert_eq!(pps.pic_init_qp, 26);
        assert_eq!(pps.chroma_qp_index_offset, [2, 2]);
        assert!(pps.deblocking_filter_control_present_flag);
    }

    #[test]
    fn cropping_is_subtracted_from_the_derived_size() {
        // 1920x1088 coded, cropped to 1920x1080: crop_bottom = 4 with
        // step_y = 2 for 4:2:0 frame macroblocks
        let mut writer = BitWriter::new();
        writer.put(0x67, 8);
        writer.put(66, 8);
        writer.put(0, 8);
        writer.put(40, 8);
        writer.put_ue(0); // sps id
        writer.put_ue(0); // log2_max_frame_num_minus4
        writer.put_ue(2); // poc type 2
        writer.put_ue(1); // max_num_ref_frames
        writer.put(0, 1);
        writer.put_ue(119); // 120 * 16 = 1920
        writer.put_ue(67); // 68 * 16 = 1088
        writer.put(1, 1); // frame_mbs_only_flag
        writer.put(1, 1); // direct_8x8_inference_flag
        writer.put(1, 1); // frame_cropping_flag
        writer.put_ue(0); // crop left
        writer.put_ue(0); // crop right
        writer.put_ue(0); // crop top
        writer.put_ue(4); // crop bottom -> 8 luma rows
        writer.put(0, 1); // vui_parameters_present_flag
        let sps = writer.finish();

        let info = shared_information();
        let avc = Avc::new(info.clone());

        let mut packet = sequence_header_packet(&sps, &simple_pps());
        avc.parse(&mut packet).unwrap();

        let info = info.read();
        assert_eq!(info.codec_width, 1920);
        assert_eq!(info.codec_height, 1080);
    }

    #[test]
    fn malformed_sps_is_discarded_entirely() {
        let info = shared_information();
        let avc = Avc::new(info.clone());

        // POC type 1 with an oversized cycle length must fail without
        // leaving a partially parsed SPS behind
        let mut writer = BitWriter::new();
        writer.put(0x67, 8);
        writer.put(66, 8);
        writer.put(0, 8);
        writer.put(31, 8);
        writer.put_ue(0); // sps id
        writer.put_ue(0); // log2_max_frame_num_minus4
        writer.put_ue(1); // poc type 1
        writer.put(0, 1); // delta_pic_order_always_zero_flag
        writer.put_ue(0); // offset_for_non_ref_pic
        writer.put_ue(0); // offset_for_top_to_bottom_field
        writer.put_ue(300); // num_ref_frames_in_poc_cycle: overflow
        let sps = writer.finish();

        let mut packet = sequence_header_packet(&sps, &simple_pps());
        match avc.parse(&mut packet) {
            Err(CodecParseError::InvalidData(_)) => (),
            x => panic!("Expected InvalidData, got {:?}", x),
        }

        assert_eq!(avc.sps().pic_width, 0, "SPS state must stay untouched");
    }

    #[test]
    fn nal_units_are_split_and_idr_marks_keyframes() {
        let info = shared_information();
        let avc = Avc::new(info.clone());

        let mut config = sequence_header_packet(&sps_720p30(), &simple_pps());
        avc.parse(&mut config).unwrap();

        // An inter frame packet carrying an IDR slice: keyframe anyway
        let nalu = vec![0x65, 0x88, 0x84, 0x21]; // type 5
        let mut payload = vec![0x27, 0x01, 0x00, 0x00, 0x10]; // cts = 16
        payload.extend((nalu.len() as u32).to_be_bytes());
        payload.extend(&nalu);

        let mut packet = Packet::new(PacketKind::Video, Bytes::from(payload));
        packet.timestamp = 1000;
        avc.parse(&mut packet).unwrap();

        match packet.side {
            Side::Video {
                keyframe: true,
                nalu_type: NAL_IDR_SLICE,
                cts: 16,
                dts: 1000,
                pts: 1016,
                ref nalus,
                ..
            } => {
                assert_eq!(nalus.len(), 1);
                assert_eq!(&nalus[0][..], &nalu[..]);
            }
            ref x => panic!("Unexpected side data: {:?}", x),
        }
    }

    #[test]
    fn truncated_nal_unit_is_malformed() {
        let avc = Avc::new(shared_information());

        let mut payload = vec![0x17, 0x01, 0x00, 0x00, 0x00];
        payload.extend(100_u32.to_be_bytes()); // NALU length beyond the data
        payload.extend([0x65, 0x01]);

        let mut packet = Packet::new(PacketKind::Video, Bytes::from(payload));
        match avc.parse(&mut packet) {
            Err(CodecParseError::InvalidData(_)) => (),
            x => panic!("Expected InvalidData, got {:?}", x),
        }
    }

    #[test]
    fn ebsp_unescaping_removes_emulation_prevention_bytes() {
        let data = [0x67, 0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00];
        assert_eq!(
            ebsp_to_rbsp(&data),
            vec![0x67, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn invalid_configuration_version_is_rejected() {
        let avc = Avc::new(shared_information());

        let mut payload = vec![0x17, 0x00, 0x00, 0x00, 0x00];
        payload.extend([0x02, 0x42, 0x00, 0x1F, 0xFF, 0xE0, 0x00]);

        let mut packet = Packet::new(PacketKind::Video, Bytes::from(payload));
        match avc.parse(&mut packet) {
            Err(CodecParseError::InvalidData(_)) => (),
            x => panic!("Expected InvalidData, got {:?}", x),
        }
    }
}
