//! Minimal H.264 sequence parameter set parser: just enough of the
//! syntax to recover the coded dimensions and the RFC 6381 codec tag.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SpsError {
    #[error("bitstream ended inside the sequence parameter set")]
    Truncated,
    #[error("exp-golomb code exceeds 32 bits")]
    OversizedCode,
}

/// Decoded view of a sequence parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

impl Sps {
    /// Parses a NAL unit body (header byte already stripped, emulation
    /// prevention bytes still present).
    pub fn parse(body: &[u8]) -> Result<Self, SpsError> {
        let rbsp = unescape_rbsp(body);
        let mut r = BitReader::new(&rbsp);

        let profile_idc = r.bits(8)? as u8;
        let _constraint_flags = r.bits(8)?;
        let level_idc = r.bits(8)? as u8;
        let _seq_parameter_set_id = r.ue()?;

        if has_chroma_info(profile_idc) {
            let chroma_format_idc = r.ue()?;
            if chroma_format_idc == 3 {
                let _separate_colour_plane_flag = r.bit()?;
            }
            let _bit_depth_luma_minus8 = r.ue()?;
            let _bit_depth_chroma_minus8 = r.ue()?;
            let _qpprime_y_zero_transform_bypass_flag = r.bit()?;
            if r.bit()? == 1 {
                let lists = if chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..lists {
                    if r.bit()? == 1 {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        let _log2_max_frame_num_minus4 = r.ue()?;
        match r.ue()? {
            0 => {
                let _log2_max_pic_order_cnt_lsb_minus4 = r.ue()?;
            }
            1 => {
                let _delta_pic_order_always_zero_flag = r.bit()?;
                let _offset_for_non_ref_pic = r.se()?;
                let _offset_for_top_to_bottom_field = r.se()?;
                for _ in 0..r.ue()? {
                    let _offset_for_ref_frame = r.se()?;
                }
            }
            _ => {}
        }
        let _max_num_ref_frames = r.ue()?;
        let _gaps_in_frame_num_value_allowed_flag = r.bit()?;

        let pic_width_in_mbs_minus1 = r.ue()?;
        let pic_height_in_map_units_minus1 = r.ue()?;
        let frame_mbs_only_flag = r.bit()?;
        if frame_mbs_only_flag == 0 {
            let _mb_adaptive_frame_field_flag = r.bit()?;
        }
        let _direct_8x8_inference_flag = r.bit()?;
        let (left, right, top, bottom) = if r.bit()? == 1 {
            (r.ue()?, r.ue()?, r.ue()?, r.ue()?)
        } else {
            (0, 0, 0, 0)
        };

        Ok(Sps {
            profile_idc,
            level_idc,
            width: (pic_width_in_mbs_minus1 + 1) * 16 - right * 2 - left * 2,
            height: (2 - frame_mbs_only_flag) * ((pic_height_in_map_units_minus1 + 1) * 16)
                - (top + bottom) * 2,
        })
    }

    /// RFC 6381 `avc1.PPCCLL` tag with the constraint byte zeroed.
    pub fn codec_string(&self) -> String {
        format!("avc1.{:02x}00{:02x}", self.profile_idc, self.level_idc)
    }
}

/// Profiles whose SPS carries chroma format and scaling list fields.
fn has_chroma_info(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

/// Strips `00 00 03` emulation prevention bytes from a NAL body.
fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), SpsError> {
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.se()?;
            next_scale = (last_scale as i64 + delta as i64).rem_euclid(256) as i32;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Result<u32, SpsError> {
        let byte = *self.data.get(self.pos / 8).ok_or(SpsError::Truncated)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Ok(bit as u32)
    }

    fn bits(&mut self, count: u32) -> Result<u32, SpsError> {
        let mut acc = 0;
        for _ in 0..count {
            acc = (acc << 1) | self.bit()?;
        }
        Ok(acc)
    }

    /// Unsigned exp-golomb code.
    fn ue(&mut self) -> Result<u32, SpsError> {
        let mut zeros = 0;
        while self.bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return Err(SpsError::OversizedCode);
            }
        }
        Ok((1u32 << zeros) - 1 + self.bits(zeros)?)
    }

    /// Signed exp-golomb code.
    fn se(&mut self) -> Result<i32, SpsError> {
        let k = self.ue()?;
        Ok(if k % 2 == 0 {
            -((k / 2) as i32)
        } else {
            (k / 2 + 1) as i32
        })
    }
}

#[cfg(test)]
#[path = "sps_test.rs"]
mod sps_test;
