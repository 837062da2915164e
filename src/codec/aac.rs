use bytes::Bytes;

use crate::error::{Error, Result};

const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Parsed AudioSpecificConfig (ISO/IEC 14496-3 §1.6.2.1).
///
/// Equality covers object type, sample rate, channel configuration and the
/// raw ASC bytes, so a re-sent identical config does not count as a change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AacConfig {
    pub asc: Bytes,
    pub object_type: u8,
    pub sample_rate: u32,
    pub channels: u8,
}

impl AacConfig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::BadAacConfig("empty"));
        }
        let mut r = AscReader::new(data);

        let mut object_type = r.read_bits(5)? as u8;
        if object_type == 31 {
            object_type = 32 + r.read_bits(6)? as u8;
        }

        let frequency_index = r.read_bits(4)? as usize;
        let sample_rate = if frequency_index == 15 {
            r.read_bits(24)?
        } else {
            *SAMPLE_RATES
                .get(frequency_index)
                .ok_or(Error::BadAacConfig("reserved frequency index"))?
        };
        if sample_rate == 0 {
            return Err(Error::BadAacConfig("zero sample rate"));
        }

        let channels = r.read_bits(4)? as u8;

        Ok(Self {
            asc: Bytes::copy_from_slice(data),
            object_type,
            sample_rate,
            channels,
        })
    }
}

struct AscReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AscReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bits(&mut self, count: usize) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            let byte = self
                .data
                .get(self.pos / 8)
                .ok_or(Error::BadAacConfig("truncated"))?;
            let bit = (byte >> (7 - (self.pos % 8))) & 1;
            value = (value << 1) | bit as u32;
            self.pos += 1;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aac_lc_48k_stereo() {
        // object type 2 (LC), frequency index 3 (48000), 2 channels
        let cfg = AacConfig::parse(&[0x11, 0x90]).unwrap();
        assert_eq!(cfg.object_type, 2);
        assert_eq!(cfg.sample_rate, 48_000);
        assert_eq!(cfg.channels, 2);
        assert_eq!(&cfg.asc[..], &[0x11, 0x90]);
    }

    #[test]
    fn parses_aac_lc_44k_stereo() {
        // object type 2, frequency index 4 (44100), 2 channels
        let cfg = AacConfig::parse(&[0x12, 0x10]).unwrap();
        assert_eq!(cfg.sample_rate, 44_100);
        assert_eq!(cfg.channels, 2);
    }

    #[test]
    fn parses_explicit_frequency() {
        // object type 2, frequency index 15, explicit 48000, 1 channel
        // bits: 00010 1111 000000001011101110000000 0001
        let mut bits = String::new();
        bits.push_str("00010");
        bits.push_str("1111");
        bits.push_str(&format!("{:024b}", 48_000));
        bits.push_str("0001");
        while bits.len() % 8 != 0 {
            bits.push('0');
        }
        let bytes: Vec<u8> = bits
            .as_bytes()
            .chunks(8)
            .map(|c| u8::from_str_radix(std::str::from_utf8(c).unwrap(), 2).unwrap())
            .collect();
        let cfg = AacConfig::parse(&bytes).unwrap();
        assert_eq!(cfg.sample_rate, 48_000);
        assert_eq!(cfg.channels, 1);
    }

    #[test]
    fn rejects_empty_and_truncated() {
        assert!(AacConfig::parse(&[]).is_err());
        assert!(AacConfig::parse(&[0x11]).is_err());
    }

    #[test]
    fn equality_includes_asc_bytes() {
        let a = AacConfig::parse(&[0x11, 0x90]).unwrap();
        let b = AacConfig::parse(&[0x11, 0x90]).unwrap();
        assert_eq!(a, b);
        let c = AacConfig::parse(&[0x12, 0x10]).unwrap();
        assert_ne!(a, c);
    }
}
