use bytes::{Buf, Bytes};
use std::io::Cursor;

use crate::error::{Error, Result};

/// Parsed AVCDecoderConfigurationRecord (ISO/IEC 14496-15 §5.3.3.1).
///
/// Two configs are equal iff every scalar field and every parameter set
/// matches byte-for-byte in order, which is exactly what the derived
/// `PartialEq` provides.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AvcConfig {
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    pub length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = Cursor::new(data);
        if buf.remaining() < 7 {
            return Err(Error::BadAvcConfig("record too short"));
        }
        let version = buf.get_u8();
        if version != 1 {
            return Err(Error::BadAvcConfig("version not 1"));
        }
        let profile = buf.get_u8();
        let compatibility = buf.get_u8();
        let level = buf.get_u8();
        let length_size = (buf.get_u8() & 0x03) + 1;
        if length_size != 4 {
            return Err(Error::BadAvcConfig("unsupported nalu length size"));
        }

        let sps_count = (buf.get_u8() & 0x1f) as usize;
        let mut sps = Vec::with_capacity(sps_count);
        for _ in 0..sps_count {
            sps.push(read_parameter_set(&mut buf, "sps")?);
        }

        if buf.remaining() < 1 {
            return Err(Error::BadAvcConfig("missing pps count"));
        }
        let pps_count = buf.get_u8() as usize;
        let mut pps = Vec::with_capacity(pps_count);
        for _ in 0..pps_count {
            pps.push(read_parameter_set(&mut buf, "pps")?);
        }

        Ok(Self {
            profile,
            compatibility,
            level,
            length_size,
            sps,
            pps,
        })
    }
}

fn read_parameter_set(buf: &mut Cursor<&[u8]>, what: &'static str) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(Error::BadAvcConfig(what));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(Error::BadAvcConfig(what));
    }
    let bytes = Bytes::copy_from_slice(&buf.chunk()[..len]);
    buf.advance(len);
    Ok(bytes)
}

/// Subset of the sequence parameter set needed for admission and init
/// segments: coded dimensions, profile/level, and the VUI frame rate when
/// the bitstream carries timing info.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
    /// 0.0 when the SPS has no VUI timing information.
    pub fps: f64,
}

/// Parse an SPS NAL unit (including the one-byte NAL header).
pub fn parse_sps(nal: &[u8]) -> Result<SpsInfo> {
    if nal.len() < 4 {
        return Err(Error::BadAvcConfig("sps too short"));
    }
    if nal[0] & 0x1f != 7 {
        return Err(Error::BadAvcConfig("not an sps nal unit"));
    }
    let rbsp = strip_emulation_prevention(&nal[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)? as u8;
    r.read_bits(8)?; // constraint flags + reserved
    let level_idc = r.read_bits(8)? as u8;
    r.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1u32;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.read_bit()?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bit()?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? == 1 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.read_bit()?; // delta_pic_order_always_zero_flag
        r.read_se()?; // offset_for_non_ref_pic
        r.read_se()?; // offset_for_top_to_bottom_field
        let cycle = r.read_ue()?;
        for _ in 0..cycle {
            r.read_se()?;
        }
    }
    r.read_ue()?; // max_num_ref_frames
    r.read_bit()?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs = r.read_ue()? + 1;
    let pic_height_in_map_units = r.read_ue()? + 1;
    let frame_mbs_only = r.read_bit()?;
    if frame_mbs_only == 0 {
        r.read_bit()?; // mb_adaptive_frame_field_flag
    }
    r.read_bit()?; // direct_8x8_inference_flag

    let mut crop_left = 0u32;
    let mut crop_right = 0u32;
    let mut crop_top = 0u32;
    let mut crop_bottom = 0u32;
    if r.read_bit()? == 1 {
        crop_left = r.read_ue()?;
        crop_right = r.read_ue()?;
        crop_top = r.read_ue()?;
        crop_bottom = r.read_ue()?;
    }

    let (crop_unit_x, crop_unit_y) = match chroma_format_idc {
        0 => (1, 2 - frame_mbs_only),
        1 => (2, 2 * (2 - frame_mbs_only)),
        2 => (2, 2 - frame_mbs_only),
        _ => (1, 2 - frame_mbs_only),
    };

    let width = pic_width_in_mbs * 16 - (crop_left + crop_right) * crop_unit_x;
    let height =
        pic_height_in_map_units * 16 * (2 - frame_mbs_only) - (crop_top + crop_bottom) * crop_unit_y;

    let mut fps = 0.0;
    if r.read_bit()? == 1 {
        // vui_parameters_present_flag
        fps = parse_vui_fps(&mut r).unwrap_or(0.0);
    }

    Ok(SpsInfo {
        profile_idc,
        level_idc,
        width,
        height,
        fps,
    })
}

fn parse_vui_fps(r: &mut BitReader) -> Result<f64> {
    if r.read_bit()? == 1 {
        // aspect_ratio_info_present_flag
        let idc = r.read_bits(8)?;
        if idc == 255 {
            r.read_bits(16)?; // sar_width
            r.read_bits(16)?; // sar_height
        }
    }
    if r.read_bit()? == 1 {
        r.read_bit()?; // overscan_appropriate_flag
    }
    if r.read_bit()? == 1 {
        // video_signal_type_present_flag
        r.read_bits(3)?; // video_format
        r.read_bit()?; // video_full_range_flag
        if r.read_bit()? == 1 {
            r.read_bits(24)?; // colour description
        }
    }
    if r.read_bit()? == 1 {
        // chroma_loc_info_present_flag
        r.read_ue()?;
        r.read_ue()?;
    }
    if r.read_bit()? == 1 {
        // timing_info_present_flag
        let num_units_in_tick = r.read_bits(32)?;
        let time_scale = r.read_bits(32)?;
        if num_units_in_tick > 0 {
            return Ok(time_scale as f64 / (2.0 * num_units_in_tick as f64));
        }
    }
    Ok(0.0)
}

fn skip_scaling_list(r: &mut BitReader, size: usize) -> Result<()> {
    let mut last = 8i64;
    let mut next = 8i64;
    for _ in 0..size {
        if next != 0 {
            let delta = r.read_se()? as i64;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

/// Scan a 4-byte-length-prefixed AVCC payload for an IDR slice.
pub fn contains_idr(data: &[u8]) -> bool {
    let mut offset = 0usize;
    while offset + 4 <= data.len() {
        let len = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        if len == 0 || offset + 4 + len > data.len() {
            return false;
        }
        if data[offset + 4] & 0x1f == 5 {
            return true;
        }
        offset += 4 + len;
    }
    false
}

fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<u32> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or(Error::BadAvcConfig("sps truncated"))?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit as u32)
    }

    fn read_bits(&mut self, count: usize) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Ok(value)
    }

    fn read_ue(&mut self) -> Result<u32> {
        let mut zeros = 0usize;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return Err(Error::BadAvcConfig("sps exp-golomb overflow"));
            }
        }
        let rest = if zeros == 0 { 0 } else { self.read_bits(zeros)? };
        Ok((1u32 << zeros) - 1 + rest)
    }

    fn read_se(&mut self) -> Result<i32> {
        let ue = self.read_ue()? as i64;
        let value = if ue % 2 == 0 { -(ue / 2) } else { (ue + 1) / 2 };
        Ok(value as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BitWriter {
        bytes: Vec<u8>,
        bit: u8,
        acc: u8,
    }

    impl BitWriter {
        fn new() -> Self {
            Self {
                bytes: Vec::new(),
                bit: 0,
                acc: 0,
            }
        }

        fn put_bit(&mut self, v: u32) {
            self.acc = (self.acc << 1) | (v as u8 & 1);
            self.bit += 1;
            if self.bit == 8 {
                self.bytes.push(self.acc);
                self.acc = 0;
                self.bit = 0;
            }
        }

        fn put_bits(&mut self, v: u32, count: usize) {
            for i in (0..count).rev() {
                self.put_bit((v >> i) & 1);
            }
        }

        fn put_ue(&mut self, v: u32) {
            let coded = v + 1;
            let bits = 32 - coded.leading_zeros() as usize;
            for _ in 0..bits - 1 {
                self.put_bit(0);
            }
            self.put_bits(coded, bits);
        }

        fn finish(mut self) -> Vec<u8> {
            // rbsp_stop_one_bit + alignment
            self.put_bit(1);
            while self.bit != 0 {
                self.put_bit(0);
            }
            self.bytes
        }
    }

    /// Baseline-profile SPS with the given macroblock dimensions and
    /// optional VUI timing info.
    fn make_sps(mb_width: u32, mb_height: u32, timing: Option<(u32, u32)>) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_bits(66, 8); // profile_idc (baseline: no chroma branch)
        w.put_bits(0, 8); // constraint flags
        w.put_bits(30, 8); // level_idc
        w.put_ue(0); // seq_parameter_set_id
        w.put_ue(0); // log2_max_frame_num_minus4
        w.put_ue(2); // pic_order_cnt_type (no extra fields)
        w.put_ue(1); // max_num_ref_frames
        w.put_bit(0); // gaps_in_frame_num_value_allowed_flag
        w.put_ue(mb_width - 1);
        w.put_ue(mb_height - 1);
        w.put_bit(1); // frame_mbs_only_flag
        w.put_bit(0); // direct_8x8_inference_flag
        w.put_bit(0); // frame_cropping_flag
        match timing {
            Some((num_units, time_scale)) => {
                w.put_bit(1); // vui_parameters_present_flag
                w.put_bit(0); // aspect_ratio_info_present_flag
                w.put_bit(0); // overscan_info_present_flag
                w.put_bit(0); // video_signal_type_present_flag
                w.put_bit(0); // chroma_loc_info_present_flag
                w.put_bit(1); // timing_info_present_flag
                w.put_bits(num_units, 32);
                w.put_bits(time_scale, 32);
            }
            None => w.put_bit(0),
        }
        let mut nal = vec![0x67]; // nal header: SPS
        nal.extend_from_slice(&w.finish());
        nal
    }

    fn make_avcc_record(sps: &[u8], pps: &[u8]) -> Vec<u8> {
        let mut rec = vec![1, 66, 0, 30, 0xff, 0xe1];
        rec.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        rec.extend_from_slice(sps);
        rec.push(1);
        rec.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        rec.extend_from_slice(pps);
        rec
    }

    #[test]
    fn parses_avcc_record() {
        let sps = make_sps(80, 45, None);
        let pps = [0x68, 0xce, 0x3c, 0x80];
        let rec = make_avcc_record(&sps, &pps);
        let cfg = AvcConfig::parse(&rec).unwrap();
        assert_eq!(cfg.profile, 66);
        assert_eq!(cfg.level, 30);
        assert_eq!(cfg.length_size, 4);
        assert_eq!(cfg.sps.len(), 1);
        assert_eq!(cfg.pps.len(), 1);
        assert_eq!(&cfg.sps[0][..], &sps[..]);
    }

    #[test]
    fn rejects_bad_version_and_truncation() {
        assert!(AvcConfig::parse(&[2, 66, 0, 30, 0xff, 0xe1, 0]).is_err());
        assert!(AvcConfig::parse(&[1, 66, 0]).is_err());
        // nalu length size 2 is unsupported
        assert!(AvcConfig::parse(&[1, 66, 0, 30, 0xfd, 0xe0, 0]).is_err());
        // sps length runs past the end
        assert!(AvcConfig::parse(&[1, 66, 0, 30, 0xff, 0xe1, 0, 9, 0x67]).is_err());
    }

    #[test]
    fn config_equality_covers_parameter_sets() {
        let sps = make_sps(80, 45, None);
        let pps = [0x68u8, 0xce, 0x3c, 0x80];
        let a = AvcConfig::parse(&make_avcc_record(&sps, &pps)).unwrap();
        let b = AvcConfig::parse(&make_avcc_record(&sps, &pps)).unwrap();
        assert_eq!(a, b);
        let other_sps = make_sps(120, 68, None);
        let c = AvcConfig::parse(&make_avcc_record(&other_sps, &pps)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn sps_dimensions_720p() {
        let info = parse_sps(&make_sps(80, 45, None)).unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.profile_idc, 66);
        assert_eq!(info.fps, 0.0);
    }

    #[test]
    fn sps_vui_frame_rate() {
        let info = parse_sps(&make_sps(80, 45, Some((1, 60)))).unwrap();
        assert_eq!(info.fps, 30.0);
    }

    #[test]
    fn sps_rejects_wrong_nal_type() {
        assert!(parse_sps(&[0x68, 0xce, 0x3c, 0x80]).is_err());
    }

    #[test]
    fn idr_detection() {
        // one non-IDR then one IDR, both length-prefixed
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&[0x41, 0x00]);
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&[0x65, 0x00]);
        assert!(contains_idr(&payload));

        let mut non_idr = Vec::new();
        non_idr.extend_from_slice(&2u32.to_be_bytes());
        non_idr.extend_from_slice(&[0x41, 0x00]);
        assert!(!contains_idr(&non_idr));
        assert!(!contains_idr(&[0, 0]));
    }

    #[test]
    fn emulation_prevention_stripping() {
        assert_eq!(
            strip_emulation_prevention(&[0x00, 0x00, 0x03, 0x01]),
            vec![0x00, 0x00, 0x01]
        );
        assert_eq!(
            strip_emulation_prevention(&[0x01, 0x00, 0x03, 0x00]),
            vec![0x01, 0x00, 0x03, 0x00]
        );
    }
}
