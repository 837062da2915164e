use bytes::{Buf, Bytes};
use std::convert::TryFrom;
use std::io::Cursor;

use crate::error::{Error, Result};

// Field            | Type
// ---------------- | ----
// Frame Type       | u4
// Codec ID         | u4
// AVC Packet Type  | u8
// Composition Time | i24
// Body             | [u8]
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum FrameType {
    KeyFrame,
    InterFrame,
    DisposableInterFrame,
    GeneratedKeyFrame,
    VideoInfoFrame,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(val: u8) -> Result<Self> {
        Ok(match val {
            1 => Self::KeyFrame,
            2 => Self::InterFrame,
            3 => Self::DisposableInterFrame,
            4 => Self::GeneratedKeyFrame,
            5 => Self::VideoInfoFrame,
            _ => return Err(Error::BadAvcConfig("unknown frame type")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum AvcPacketType {
    SequenceHeader,
    NalUnit,
    EndOfSequence,
}

impl TryFrom<u8> for AvcPacketType {
    type Error = Error;

    fn try_from(val: u8) -> Result<Self> {
        Ok(match val {
            0 => Self::SequenceHeader,
            1 => Self::NalUnit,
            2 => Self::EndOfSequence,
            _ => return Err(Error::BadAvcConfig("unknown avc packet type")),
        })
    }
}

pub const CODEC_ID_AVC: u8 = 7;
pub const SOUND_FORMAT_AAC: u8 = 10;

#[derive(Debug, Clone)]
pub struct VideoTag {
    pub frame_type: FrameType,
    pub codec_id: u8,
    pub packet_type: AvcPacketType,
    pub composition_time_ms: i32,
    pub body: Bytes,
}

impl VideoTag {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(Error::BadAvcConfig("video tag too short"));
        }
        let mut buf = Cursor::new(data);
        let header = buf.get_u8();
        let codec_id = header & 0x0f;
        let frame_type = FrameType::try_from(header >> 4)?;
        let packet_type = AvcPacketType::try_from(buf.get_u8())?;
        // signed 24-bit composition offset
        let raw = buf.get_uint(3) as u32;
        let composition_time_ms = ((raw << 8) as i32) >> 8;
        let body = Bytes::copy_from_slice(buf.chunk());
        Ok(Self {
            frame_type,
            codec_id,
            packet_type,
            composition_time_ms,
            body,
        })
    }

    pub fn is_avc(&self) -> bool {
        self.codec_id == CODEC_ID_AVC
    }

    pub fn is_sequence_header(&self) -> bool {
        self.packet_type == AvcPacketType::SequenceHeader
    }

    pub fn is_keyframe(&self) -> bool {
        self.frame_type == FrameType::KeyFrame
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum AacPacketType {
    SequenceHeader,
    Raw,
}

impl TryFrom<u8> for AacPacketType {
    type Error = Error;

    fn try_from(val: u8) -> Result<Self> {
        Ok(match val {
            0 => Self::SequenceHeader,
            1 => Self::Raw,
            _ => return Err(Error::BadAacConfig("unknown aac packet type")),
        })
    }
}

// Field            | Type
// ---------------- | ----
// Sound Format     | u4
// Rate/Size/Type   | u4
// AAC Packet Type  | u8 (AAC only)
// Body             | [u8]
#[derive(Debug, Clone)]
pub struct AudioTag {
    pub sound_format: u8,
    pub packet_type: AacPacketType,
    pub body: Bytes,
}

impl AudioTag {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::BadAacConfig("audio tag empty"));
        }
        let sound_format = data[0] >> 4;
        if sound_format != SOUND_FORMAT_AAC {
            // caller decides whether a non-AAC stream is an error
            return Ok(Self {
                sound_format,
                packet_type: AacPacketType::Raw,
                body: Bytes::new(),
            });
        }
        if data.len() < 2 {
            return Err(Error::BadAacConfig("audio tag too short"));
        }
        let packet_type = AacPacketType::try_from(data[1])?;
        Ok(Self {
            sound_format,
            packet_type,
            body: Bytes::copy_from_slice(&data[2..]),
        })
    }

    pub fn is_aac(&self) -> bool {
        self.sound_format == SOUND_FORMAT_AAC
    }

    pub fn is_sequence_header(&self) -> bool {
        self.packet_type == AacPacketType::SequenceHeader
    }
}
