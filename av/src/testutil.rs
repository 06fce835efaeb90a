//! Shared builders for codec and remuxer tests: a bit writer with
//! Exp-Golomb support and known-good parameter sets.

/// Writes bit fields most significant bit first
pub struct BitWriter {
    bits: Vec<bool>,
}

impl BitWriter {
    pub fn new() -> BitWriter {
        BitWriter { bits: Vec::new() }
    }

    pub fn put(&mut self, value: u32, count: usize) {
        for i in (0..count).rev() {
            self.bits.push((value >> i) & 1 == 1);
        }
    }

    pub fn put_ue(&mut self, value: u32) {
        let coded = value + 1;
        let length = 32 - coded.leading_zeros() as usize;
        self.put(0, length - 1);
        self.put(coded, length);
    }

    pub fn put_se(&mut self, value: i32) {
        let mapped = if value <= 0 {
            (-value as u32) * 2
        } else {
            (value as u32) * 2 - 1
        };
        self.put_ue(mapped);
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.bits.push(true); // rbsp stop bit
        let mut bytes = vec![0_u8; (self.bits.len() + 7) / 8];
        for (index, bit) in self.bits.iter().enumerate() {
            if *bit {
                bytes[index / 8] |= 1 << (7 - (index % 8));
            }
        }
        bytes
    }
}

/// A baseline profile SPS for 1280x720 at 30 fps
pub fn sps_720p30() -> Vec<u8> {
    let mut writer = BitWriter::new();
    writer.put(0x67, 8); // NAL header: SPS
    writer.put(66, 8); // profile_idc: baseline
    writer.put(0, 8); // constraint flags + reserved
    writer.put(31, 8); // level_idc
    writer.put_ue(0); // seq_parameter_set_id
    writer.put_ue(0); // log2_max_frame_num_minus4
    writer.put_ue(0); // pic_order_cnt_type
    writer.put_ue(0); // log2_max_pic_order_cnt_lsb_minus4
    writer.put_ue(1); // max_num_ref_frames
    writer.put(0, 1); // gaps_in_frame_num_value_allowed_flag
    writer.put_ue(79); // pic_width_in_mbs_minus1 (80 * 16 = 1280)
    writer.put_ue(44); // pic_height_in_map_units_minus1 (45 * 16 = 720)
    writer.put(1, 1); // frame_mbs_only_flag
    writer.put(1, 1); // direct_8x8_inference_flag
    writer.put(0, 1); // frame_cropping_flag
    writer.put(1, 1); // vui_parameters_present_flag
    writer.put(0, 1); // aspect_ratio_info_present_flag
    writer.put(0, 1); // overscan_info_present_flag
    writer.put(0, 1); // video_signal_type_present_flag
    writer.put(0, 1); // chroma_loc_info_present_flag
    writer.put(1, 1); // timing_info_present_flag
    writer.put(1, 32); // num_units_in_tick
    writer.put(60, 32); // time_scale -> 30 fps
    writer.put(1, 1); // fixed_frame_rate_flag
    writer.put(0, 1); // nal_hrd_parameters_present_flag
    writer.put(0, 1); // vcl_hrd_parameters_present_flag
    writer.put(0, 1); // pic_struct_present_flag
    writer.put(0, 1); // bitstream_restriction_flag
    writer.finish()
}

/// A minimal PPS referencing SPS 0
pub fn simple_pps() -> Vec<u8> {
    let mut writer = BitWriter::new();
    writer.put(0x68, 8); // NAL header: PPS
    writer.put_ue(0); // pic_parameter_set_id
    writer.put_ue(0); // seq_parameter_set_id
    writer.put(0, 1); // entropy_coding_mode_flag
    writer.put(0, 1); // bottom_field_pic_order_in_frame_present_flag
    writer.put_ue(0); // num_slice_groups_minus1
    writer.put_ue(0); // num_ref_idx_l0_default_active_minus1
    writer.put_ue(0); // num_ref_idx_l1_default_active_minus1
    writer.put(0, 1); // weighted_pred_flag
    writer.put(0, 2); // weighted_bipred_idc
    writer.put_se(0); // pic_init_qp_minus26
    writer.put_se(0); // pic_init_qs_minus26
    writer.put_se(2); // chroma_qp_index_offset
    writer.put(1, 1); // deblocking_filter_control_present_flag
    writer.put(0, 1); // constrained_intra_pred_flag
    writer.put(0, 1); // redundant_pic_cnt_present_flag
    writer.finish()
}

/// An AVCDecoderConfigurationRecord wrapping the given SPS and PPS
pub fn avcc_record(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let mut record = vec![
        0x01, // configurationVersion
        sps[1], sps[2], sps[3], // profile / compat / level
        0xFF, // lengthSizeMinusOne = 3
        0xE1, // numOfSequenceParameterSets = 1
    ];
    record.push((sps.len() >> 8) as u8);
    record.push(sps.len() as u8);
    record.extend_from_slice(sps);
    record.push(0x01); // numOfPictureParameterSets
    record.push((pps.len() >> 8) as u8);
    record.push(pps.len() as u8);
    record.extend_from_slice(pps);
    record
}

/// A complete FLV-shaped AVC sequence header payload
pub fn avc_sequence_header_payload() -> Vec<u8> {
    let mut payload = vec![0x17, 0x00, 0x00, 0x00, 0x00];
    payload.extend(avcc_record(&sps_720p30(), &simple_pps()));
    payload
}
