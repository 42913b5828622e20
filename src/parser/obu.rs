// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::internal_utils::stream::*;
use crate::internal_utils::*;
use crate::parser::mp4box::CodecConfiguration;
use crate::*;

#[derive(Debug)]
struct ObuHeader {
    obu_type: u8,
    size: u32,
}

/// The subset of the AV1 sequence header needed to resolve color information
/// when the container carries no colr box. Only the OBU fields up to and
/// including color_config() are parsed.
#[derive(Debug, Default)]
pub struct Av1SequenceHeader {
    reduced_still_picture_header: bool,
    pub max_width: u32,
    pub max_height: u32,
    pub bit_depth: u8,
    pub yuv_format: PixelFormat,
    pub color_primaries: ColorPrimaries,
    pub transfer_characteristics: TransferCharacteristics,
    pub matrix_coefficients: MatrixCoefficients,
    pub yuv_range: YuvRange,
    pub config: CodecConfiguration,
}

impl Av1SequenceHeader {
    fn parse_profile(&mut self, bits: &mut IBitStream) -> AvifResult<()> {
        self.config.seq_profile = bits.read(3)? as u8;
        if self.config.seq_profile > 2 {
            return AvifError::bmff_parse_failed("invalid seq_profile");
        }
        let still_picture = bits.read_bool()?;
        self.reduced_still_picture_header = bits.read_bool()?;
        if self.reduced_still_picture_header && !still_picture {
            return AvifError::bmff_parse_failed("invalid reduced_still_picture_header");
        }
        if self.reduced_still_picture_header {
            self.config.seq_level_idx0 = bits.read(5)? as u8;
        } else {
            let mut buffer_delay_length = 0;
            let mut decoder_model_info_present_flag = false;
            let timing_info_present_flag = bits.read_bool()?;
            if timing_info_present_flag {
                // num_units_in_display_tick, time_scale
                bits.skip(64)?;
                let equal_picture_interval = bits.read_bool()?;
                if equal_picture_interval {
                    // num_ticks_per_picture_minus_1
                    bits.skip_uvlc()?;
                }
                decoder_model_info_present_flag = bits.read_bool()?;
                if decoder_model_info_present_flag {
                    let buffer_delay_length_minus_1 = bits.read(5)?;
                    buffer_delay_length = buffer_delay_length_minus_1 + 1;
                    // num_units_in_decoding_tick
                    bits.skip(32)?;
                    // buffer_removal_time_length_minus_1
                    // frame_presentation_time_length_minus_1
                    bits.skip(10)?;
                }
            }
            let initial_display_delay_present_flag = bits.read_bool()?;
            let operating_points_cnt_minus_1 = bits.read(5)?;
            for i in 0..operating_points_cnt_minus_1 + 1 {
                // operating_point_idc
                bits.skip(12)?;
                let seq_level_idx = bits.read(5)?;
                if i == 0 {
                    self.config.seq_level_idx0 = seq_level_idx as u8;
                }
                if seq_level_idx > 7 {
                    let seq_tier = bits.read(1)?;
                    if i == 0 {
                        self.config.seq_tier0 = seq_tier as u8;
                    }
                }
                if decoder_model_info_present_flag {
                    let decoder_model_present_for_this_op = bits.read_bool()?;
                    if decoder_model_present_for_this_op {
                        // decoder_buffer_delay, encoder_buffer_delay,
                        // low_delay_mode_flag
                        bits.skip(buffer_delay_length as u64 * 2 + 1)?;
                    }
                }
                if initial_display_delay_present_flag {
                    let initial_display_delay_present_for_this_op = bits.read_bool()?;
                    if initial_display_delay_present_for_this_op {
                        // initial_display_delay_minus_1
                        bits.skip(4)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn parse_frame_max_dimensions(&mut self, bits: &mut IBitStream) -> AvifResult<()> {
        let frame_width_bits_minus_1 = bits.read(4)? as u8;
        let frame_height_bits_minus_1 = bits.read(4)? as u8;
        let max_frame_width_minus_1 = bits.read(frame_width_bits_minus_1 + 1)?;
        let max_frame_height_minus_1 = bits.read(frame_height_bits_minus_1 + 1)?;
        self.max_width = checked_add!(max_frame_width_minus_1, 1)?;
        self.max_height = checked_add!(max_frame_height_minus_1, 1)?;
        let frame_id_numbers_present_flag =
            if self.reduced_still_picture_header { false } else { bits.read_bool()? };
        if frame_id_numbers_present_flag {
            // delta_frame_id_length_minus_2, additional_frame_id_length_minus_1
            bits.skip(7)?;
        }
        Ok(())
    }

    fn parse_enabled_features(&mut self, bits: &mut IBitStream) -> AvifResult<()> {
        // use_128x128_superblock, enable_filter_intra,
        // enable_intra_edge_filter
        bits.skip(3)?;
        if self.reduced_still_picture_header {
            return Ok(());
        }
        // enable_interintra_compound, enable_masked_compound,
        // enable_warped_motion, enable_dual_filter
        bits.skip(4)?;
        let enable_order_hint = bits.read_bool()?;
        if enable_order_hint {
            // enable_jnt_comp, enable_ref_frame_mvs
            bits.skip(2)?;
        }
        let seq_choose_screen_content_tools = bits.read_bool()?;
        let seq_force_screen_content_tools = if seq_choose_screen_content_tools {
            2 // SELECT_SCREEN_CONTENT_TOOLS
        } else {
            bits.read(1)?
        };
        if seq_force_screen_content_tools > 0 {
            let seq_choose_integer_mv = bits.read_bool()?;
            if !seq_choose_integer_mv {
                // seq_force_integer_mv
                bits.skip(1)?;
            }
        }
        if enable_order_hint {
            // order_hint_bits_minus_1
            bits.skip(3)?;
        }
        Ok(())
    }

    fn parse_color_config(&mut self, bits: &mut IBitStream) -> AvifResult<()> {
        self.config.high_bitdepth = bits.read_bool()?;
        if self.config.seq_profile == 2 && self.config.high_bitdepth {
            self.config.twelve_bit = bits.read_bool()?;
            self.bit_depth = if self.config.twelve_bit { 12 } else { 10 };
        } else {
            self.bit_depth = if self.config.high_bitdepth { 10 } else { 8 };
        }
        if self.config.seq_profile != 1 {
            self.config.monochrome = bits.read_bool()?;
        }
        let color_description_present_flag = bits.read_bool()?;
        if color_description_present_flag {
            self.color_primaries = (bits.read(8)? as u16).into();
            self.transfer_characteristics = (bits.read(8)? as u16).into();
            self.matrix_coefficients = (bits.read(8)? as u16).into();
        } else {
            self.color_primaries = ColorPrimaries::Unspecified;
            self.transfer_characteristics = TransferCharacteristics::Unspecified;
            self.matrix_coefficients = MatrixCoefficients::Unspecified;
        }
        if self.config.monochrome {
            let color_range = bits.read_bool()?;
            self.yuv_range = if color_range { YuvRange::Full } else { YuvRange::Limited };
            self.config.chroma_subsampling_x = 1;
            self.config.chroma_subsampling_y = 1;
            self.yuv_format = PixelFormat::Yuv400;
            return Ok(());
        } else if self.color_primaries == ColorPrimaries::Bt709
            && self.transfer_characteristics == TransferCharacteristics::Srgb
            && self.matrix_coefficients == MatrixCoefficients::Identity
        {
            self.yuv_range = YuvRange::Full;
            self.yuv_format = PixelFormat::Yuv444;
        } else {
            let color_range = bits.read_bool()?;
            self.yuv_range = if color_range { YuvRange::Full } else { YuvRange::Limited };
            match self.config.seq_profile {
                0 => {
                    self.config.chroma_subsampling_x = 1;
                    self.config.chroma_subsampling_y = 1;
                    self.yuv_format = PixelFormat::Yuv420;
                }
                1 => {
                    self.yuv_format = PixelFormat::Yuv444;
                }
                2 => {
                    if self.bit_depth == 12 {
                        self.config.chroma_subsampling_x = bits.read(1)? as u8;
                        if self.config.chroma_subsampling_x == 1 {
                            self.config.chroma_subsampling_y = bits.read(1)? as u8;
                        }
                    } else {
                        self.config.chroma_subsampling_x = 1;
                    }
                    self.yuv_format = if self.config.chroma_subsampling_x == 1 {
                        if self.config.chroma_subsampling_y == 1 {
                            PixelFormat::Yuv420
                        } else {
                            PixelFormat::Yuv422
                        }
                    } else {
                        PixelFormat::Yuv444
                    };
                }
                _ => {} // Not reached.
            }
            if self.config.chroma_subsampling_x == 1 && self.config.chroma_subsampling_y == 1 {
                self.config.chroma_sample_position = bits.read(2)?.into();
            }
        }
        // separate_uv_delta_q
        bits.skip(1)?;
        Ok(())
    }

    fn parse_obu_header(stream: &mut IStream) -> AvifResult<ObuHeader> {
        // Section 5.3.2 of the AV1 specification.
        let mut bits = stream.sub_bit_stream(1)?;
        let obu_forbidden_bit = bits.read(1)?;
        if obu_forbidden_bit != 0 {
            return AvifError::bmff_parse_failed("invalid obu_forbidden_bit");
        }
        let obu_type = bits.read(4)? as u8;
        let obu_extension_flag = bits.read_bool()?;
        let obu_has_size_field = bits.read_bool()?;
        // obu_reserved_1bit. The value is ignored by a decoder.
        bits.skip(1)?;

        if obu_extension_flag {
            // temporal_id, spatial_id, extension_header_reserved_3bits
            stream.skip(1)?;
        }

        let size = if obu_has_size_field {
            stream.read_uleb128()?
        } else {
            u32_from_usize(stream.bytes_left())?
        };

        Ok(ObuHeader { obu_type, size })
    }

    /// Scans the OBU stream for the first sequence header. `data` may be a
    /// prefix of the real payload, in which case the parse fails and the
    /// caller can retry with a longer prefix.
    pub(crate) fn parse_from_obus(data: &[u8]) -> AvifResult<Self> {
        let mut stream = IStream::create(data);
        while stream.has_bytes_left() {
            let obu = Self::parse_obu_header(&mut stream)?;
            let obu_size = usize_from_u32(obu.size)?;
            if obu.obu_type != /*OBU_SEQUENCE_HEADER=*/ 1 {
                // Not a sequence header. Skip this obu.
                stream.skip(obu_size)?;
                continue;
            }
            let mut bits = stream.sub_bit_stream(obu_size)?;
            let mut sequence_header = Av1SequenceHeader::default();
            sequence_header.parse_profile(&mut bits)?;
            sequence_header.parse_frame_max_dimensions(&mut bits)?;
            sequence_header.parse_enabled_features(&mut bits)?;
            // enable_superres, enable_cdef, enable_restoration
            bits.skip(3)?;
            sequence_header.parse_color_config(&mut bits)?;
            // film_grain_params_present
            bits.skip(1)?;
            return Ok(sequence_header);
        }
        AvifError::bmff_parse_failed("could not find sequence header obu")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A reduced still picture sequence header for an 8-bit 420 image with no
    // color description:
    //   seq_profile = 0 (3 bits)
    //   still_picture = 1, reduced_still_picture_header = 1
    //   seq_level_idx_0 = 0 (5 bits)
    //   frame_width_bits_minus_1 = 7, frame_height_bits_minus_1 = 7 (4+4)
    //   max_frame_width_minus_1 = 63 (8 bits), max_frame_height_minus_1 = 63
    //   use_128x128_superblock = 1, enable_filter_intra = 0,
    //   enable_intra_edge_filter = 0
    //   enable_superres = 0, enable_cdef = 0, enable_restoration = 0
    //   high_bitdepth = 0, monochrome = 0,
    //   color_description_present_flag = 0
    //   color_range = 0, chroma_sample_position = 0 (2 bits)
    //   separate_uv_delta_q = 0, padding to byte
    fn still_picture_sequence_header_obu() -> Vec<u8> {
        let payload_bits: Vec<(u32, u8)> = vec![
            (0, 3),  // seq_profile
            (1, 1),  // still_picture
            (1, 1),  // reduced_still_picture_header
            (0, 5),  // seq_level_idx_0
            (7, 4),  // frame_width_bits_minus_1
            (7, 4),  // frame_height_bits_minus_1
            (63, 8), // max_frame_width_minus_1
            (63, 8), // max_frame_height_minus_1
            (1, 1),  // use_128x128_superblock
            (0, 1),  // enable_filter_intra
            (0, 1),  // enable_intra_edge_filter
            (0, 1),  // enable_superres
            (0, 1),  // enable_cdef
            (0, 1),  // enable_restoration
            (0, 1),  // high_bitdepth
            (0, 1),  // monochrome
            (0, 1),  // color_description_present_flag
            (0, 1),  // color_range
            (0, 2),  // chroma_sample_position
            (0, 1),  // separate_uv_delta_q
        ];
        let mut bytes = Vec::new();
        let mut current: u16 = 0;
        let mut filled: u8 = 0;
        for (value, bit_count) in payload_bits {
            for i in (0..bit_count).rev() {
                current = (current << 1) | ((value >> i) & 1) as u16;
                filled += 1;
                if filled == 8 {
                    bytes.push(current as u8);
                    current = 0;
                    filled = 0;
                }
            }
        }
        if filled > 0 {
            bytes.push((current << (8 - filled)) as u8);
        }
        // obu header: forbidden 0, type 1 (sequence header), no extension,
        // has size field, reserved 0 -> 0b0000_1010.
        let mut obu = vec![0x0A, bytes.len() as u8];
        obu.append(&mut bytes);
        obu
    }

    #[test]
    fn parse_still_picture_sequence_header() {
        let obu = still_picture_sequence_header_obu();
        let sequence_header = Av1SequenceHeader::parse_from_obus(&obu).unwrap();
        assert_eq!(sequence_header.max_width, 64);
        assert_eq!(sequence_header.max_height, 64);
        assert_eq!(sequence_header.bit_depth, 8);
        assert_eq!(sequence_header.yuv_format, PixelFormat::Yuv420);
        assert_eq!(sequence_header.yuv_range, YuvRange::Limited);
        assert_eq!(
            sequence_header.color_primaries,
            ColorPrimaries::Unspecified
        );
        assert_eq!(
            sequence_header.matrix_coefficients,
            MatrixCoefficients::Unspecified
        );
    }

    #[test]
    fn truncated_prefix_fails_then_succeeds() {
        let obu = still_picture_sequence_header_obu();
        assert!(Av1SequenceHeader::parse_from_obus(&obu[..2]).is_err());
        assert!(Av1SequenceHeader::parse_from_obus(&obu).is_ok());
    }

    #[test]
    fn skips_non_sequence_header_obus() {
        // A temporal delimiter obu (type 2) followed by the sequence header.
        let mut data = vec![0x12, 0x00];
        data.extend_from_slice(&still_picture_sequence_header_obu());
        assert!(Av1SequenceHeader::parse_from_obus(&data).is_ok());
    }
}
