//! Fragmented-MP4 writing: init segments (`ftyp`+`moov`) and media
//! fragments (`moof`+`mdat`). Boxes are emitted directly as size-prefixed
//! byte runs; nothing here touches the filesystem.

use bytes::Bytes;

pub const VIDEO_TIMESCALE: u32 = 90_000;
const MOVIE_TIMESCALE: u32 = 1_000;

/// trun sample flags: sync sample (depends on nothing).
pub const SYNC_SAMPLE_FLAGS: u32 = 0x0200_0000;
/// trun sample flags: non-sync sample that depends on others.
pub const NON_SYNC_SAMPLE_FLAGS: u32 = 0x0101_0000;

#[derive(Debug, Clone)]
pub struct VideoTrackParams {
    pub track_id: u32,
    pub timescale: u32,
    pub sps: Bytes,
    pub pps: Bytes,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct AudioTrackParams {
    pub track_id: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub asc: Bytes,
}

/// One media sample ready for a track run.
#[derive(Debug, Clone)]
pub struct FullSample {
    pub decode_time: u64,
    pub duration: u32,
    pub flags: u32,
    pub cts_offset: i32,
    pub data: Bytes,
}

/// A sample tagged with the track it belongs to.
#[derive(Debug, Clone)]
pub struct TrackSample {
    pub track_id: u32,
    pub sample: FullSample,
}

pub fn ms_to_scale(ms: i64, timescale: u32) -> u32 {
    if ms <= 0 {
        return 0;
    }
    ((ms * timescale as i64) / 1000) as u32
}

pub fn ms_to_scale_u64(ms: i64, timescale: u32) -> u64 {
    if ms <= 0 {
        return 0;
    }
    ((ms * timescale as i64) / 1000) as u64
}

pub fn ms_to_scale_i32(ms: i64, timescale: u32) -> i32 {
    if ms == 0 {
        return 0;
    }
    ((ms * timescale as i64) / 1000) as i32
}

pub fn scale_to_ms(value: u64, timescale: u32) -> i64 {
    if timescale == 0 {
        return 0;
    }
    (value as i64).saturating_mul(1000) / timescale as i64
}

fn push_box(buf: &mut Vec<u8>, fourcc: &[u8; 4], content: &[u8]) {
    buf.extend_from_slice(&((content.len() + 8) as u32).to_be_bytes());
    buf.extend_from_slice(fourcc);
    buf.extend_from_slice(content);
}

fn full_box_header(version: u8, flags: u32) -> [u8; 4] {
    let f = flags.to_be_bytes();
    [version, f[1], f[2], f[3]]
}

const IDENTITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// Build an init segment with a video track and an optional audio track.
pub fn build_init_segment(video: &VideoTrackParams, audio: Option<&AudioTrackParams>) -> Vec<u8> {
    let mut buf = Vec::new();
    write_ftyp(&mut buf);

    let mut moov = Vec::new();
    let next_track_id = audio.map(|a| a.track_id).unwrap_or(video.track_id) + 1;
    write_mvhd(&mut moov, next_track_id);
    write_video_trak(&mut moov, video);
    if let Some(audio) = audio {
        write_audio_trak(&mut moov, audio);
    }

    let mut mvex = Vec::new();
    write_trex(&mut mvex, video.track_id);
    if let Some(audio) = audio {
        write_trex(&mut mvex, audio.track_id);
    }
    push_box(&mut moov, b"mvex", &mvex);

    push_box(&mut buf, b"moov", &moov);
    buf
}

fn write_ftyp(buf: &mut Vec<u8>) {
    let mut content = Vec::new();
    content.extend_from_slice(b"isom"); // major brand
    content.extend_from_slice(&512u32.to_be_bytes()); // minor version
    for brand in [b"isom", b"iso6", b"avc1", b"mp41"] {
        content.extend_from_slice(brand);
    }
    push_box(buf, b"ftyp", &content);
}

fn write_mvhd(buf: &mut Vec<u8>, next_track_id: u32) {
    let mut content = Vec::new();
    content.extend_from_slice(&full_box_header(0, 0));
    content.extend_from_slice(&0u32.to_be_bytes()); // creation time
    content.extend_from_slice(&0u32.to_be_bytes()); // modification time
    content.extend_from_slice(&MOVIE_TIMESCALE.to_be_bytes());
    content.extend_from_slice(&0u32.to_be_bytes()); // duration (live)
    content.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
    content.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
    content.extend_from_slice(&[0u8; 10]); // reserved
    for m in IDENTITY_MATRIX {
        content.extend_from_slice(&m.to_be_bytes());
    }
    content.extend_from_slice(&[0u8; 24]); // pre_defined
    content.extend_from_slice(&next_track_id.to_be_bytes());
    push_box(buf, b"mvhd", &content);
}

fn write_tkhd(buf: &mut Vec<u8>, track_id: u32, width: u32, height: u32, volume: u16) {
    let mut content = Vec::new();
    content.extend_from_slice(&full_box_header(0, 3)); // enabled + in movie
    content.extend_from_slice(&0u32.to_be_bytes()); // creation time
    content.extend_from_slice(&0u32.to_be_bytes()); // modification time
    content.extend_from_slice(&track_id.to_be_bytes());
    content.extend_from_slice(&0u32.to_be_bytes()); // reserved
    content.extend_from_slice(&0u32.to_be_bytes()); // duration
    content.extend_from_slice(&[0u8; 8]); // reserved
    content.extend_from_slice(&0u16.to_be_bytes()); // layer
    content.extend_from_slice(&0u16.to_be_bytes()); // alternate group
    content.extend_from_slice(&volume.to_be_bytes());
    content.extend_from_slice(&0u16.to_be_bytes()); // reserved
    for m in IDENTITY_MATRIX {
        content.extend_from_slice(&m.to_be_bytes());
    }
    content.extend_from_slice(&(width << 16).to_be_bytes()); // 16.16 fixed
    content.extend_from_slice(&(height << 16).to_be_bytes());
    push_box(buf, b"tkhd", &content);
}

fn write_mdhd(buf: &mut Vec<u8>, timescale: u32) {
    let mut content = Vec::new();
    content.extend_from_slice(&full_box_header(0, 0));
    content.extend_from_slice(&0u32.to_be_bytes()); // creation time
    content.extend_from_slice(&0u32.to_be_bytes()); // modification time
    content.extend_from_slice(&timescale.to_be_bytes());
    content.extend_from_slice(&0u32.to_be_bytes()); // duration
    content.extend_from_slice(&0x55c4u16.to_be_bytes()); // language: und
    content.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
    push_box(buf, b"mdhd", &content);
}

fn write_hdlr(buf: &mut Vec<u8>, handler_type: &[u8; 4], name: &[u8]) {
    let mut content = Vec::new();
    content.extend_from_slice(&full_box_header(0, 0));
    content.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
    content.extend_from_slice(handler_type);
    content.extend_from_slice(&[0u8; 12]); // reserved
    content.extend_from_slice(name);
    content.push(0);
    push_box(buf, b"hdlr", &content);
}

fn write_dinf(buf: &mut Vec<u8>) {
    let mut dref = Vec::new();
    dref.extend_from_slice(&full_box_header(0, 0));
    dref.extend_from_slice(&1u32.to_be_bytes()); // entry count
    let url = full_box_header(0, 1); // self-contained
    push_box(&mut dref, b"url ", &url);
    let mut dinf = Vec::new();
    push_box(&mut dinf, b"dref", &dref);
    push_box(buf, b"dinf", &dinf);
}

fn write_empty_sample_tables(buf: &mut Vec<u8>) {
    let empty4 = {
        let mut c = Vec::new();
        c.extend_from_slice(&full_box_header(0, 0));
        c.extend_from_slice(&0u32.to_be_bytes());
        c
    };
    push_box(buf, b"stts", &empty4);
    push_box(buf, b"stsc", &empty4);
    let mut stsz = Vec::new();
    stsz.extend_from_slice(&full_box_header(0, 0));
    stsz.extend_from_slice(&0u32.to_be_bytes()); // sample size
    stsz.extend_from_slice(&0u32.to_be_bytes()); // sample count
    push_box(buf, b"stsz", &stsz);
    push_box(buf, b"stco", &empty4);
}

fn write_video_trak(buf: &mut Vec<u8>, video: &VideoTrackParams) {
    let mut trak = Vec::new();
    write_tkhd(&mut trak, video.track_id, video.width, video.height, 0);

    let mut mdia = Vec::new();
    write_mdhd(&mut mdia, video.timescale);
    write_hdlr(&mut mdia, b"vide", b"VideoHandler");

    let mut minf = Vec::new();
    let mut vmhd = Vec::new();
    vmhd.extend_from_slice(&full_box_header(0, 1));
    vmhd.extend_from_slice(&[0u8; 8]); // graphics mode + opcolor
    push_box(&mut minf, b"vmhd", &vmhd);
    write_dinf(&mut minf);

    let mut stbl = Vec::new();
    let mut stsd = Vec::new();
    stsd.extend_from_slice(&full_box_header(0, 0));
    stsd.extend_from_slice(&1u32.to_be_bytes()); // entry count
    write_avc1(&mut stsd, video);
    push_box(&mut stbl, b"stsd", &stsd);
    write_empty_sample_tables(&mut stbl);
    push_box(&mut minf, b"stbl", &stbl);

    push_box(&mut mdia, b"minf", &minf);
    push_box(&mut trak, b"mdia", &mdia);
    push_box(buf, b"trak", &trak);
}

fn write_avc1(buf: &mut Vec<u8>, video: &VideoTrackParams) {
    let mut content = Vec::new();
    content.extend_from_slice(&[0u8; 6]); // reserved
    content.extend_from_slice(&1u16.to_be_bytes()); // data reference index
    content.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
    content.extend_from_slice(&0u16.to_be_bytes()); // reserved
    content.extend_from_slice(&[0u8; 12]); // pre_defined
    content.extend_from_slice(&(video.width as u16).to_be_bytes());
    content.extend_from_slice(&(video.height as u16).to_be_bytes());
    content.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi
    content.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    content.extend_from_slice(&0u32.to_be_bytes()); // reserved
    content.extend_from_slice(&1u16.to_be_bytes()); // frame count
    content.extend_from_slice(&[0u8; 32]); // compressor name
    content.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
    content.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined
    write_avcc(&mut content, video);
    push_box(buf, b"avc1", &content);
}

fn write_avcc(buf: &mut Vec<u8>, video: &VideoTrackParams) {
    let sps = &video.sps;
    let pps = &video.pps;
    let mut content = Vec::new();
    content.push(1); // configuration version
    if sps.len() >= 4 {
        content.push(sps[1]); // profile
        content.push(sps[2]); // compatibility
        content.push(sps[3]); // level
    } else {
        content.extend_from_slice(&[0x42, 0x00, 0x1e]);
    }
    content.push(0xff); // 4-byte NAL lengths
    content.push(0xe1); // one SPS
    content.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    content.extend_from_slice(sps);
    content.push(1); // one PPS
    content.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    content.extend_from_slice(pps);
    push_box(buf, b"avcC", &content);
}

fn write_audio_trak(buf: &mut Vec<u8>, audio: &AudioTrackParams) {
    let mut trak = Vec::new();
    write_tkhd(&mut trak, audio.track_id, 0, 0, 0x0100);

    let mut mdia = Vec::new();
    write_mdhd(&mut mdia, audio.sample_rate);
    write_hdlr(&mut mdia, b"soun", b"SoundHandler");

    let mut minf = Vec::new();
    let mut smhd = Vec::new();
    smhd.extend_from_slice(&full_box_header(0, 0));
    smhd.extend_from_slice(&0u16.to_be_bytes()); // balance
    smhd.extend_from_slice(&0u16.to_be_bytes()); // reserved
    push_box(&mut minf, b"smhd", &smhd);
    write_dinf(&mut minf);

    let mut stbl = Vec::new();
    let mut stsd = Vec::new();
    stsd.extend_from_slice(&full_box_header(0, 0));
    stsd.extend_from_slice(&1u32.to_be_bytes());
    write_mp4a(&mut stsd, audio);
    push_box(&mut stbl, b"stsd", &stsd);
    write_empty_sample_tables(&mut stbl);
    push_box(&mut minf, b"stbl", &stbl);

    push_box(&mut mdia, b"minf", &minf);
    push_box(&mut trak, b"mdia", &mdia);
    push_box(buf, b"trak", &trak);
}

fn write_mp4a(buf: &mut Vec<u8>, audio: &AudioTrackParams) {
    let mut content = Vec::new();
    content.extend_from_slice(&[0u8; 6]); // reserved
    content.extend_from_slice(&1u16.to_be_bytes()); // data reference index
    content.extend_from_slice(&[0u8; 8]); // reserved
    content.extend_from_slice(&audio.channels.to_be_bytes());
    content.extend_from_slice(&16u16.to_be_bytes()); // sample size
    content.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
    content.extend_from_slice(&0u16.to_be_bytes()); // reserved
    // 16.16 fixed-point sample rate, low 16 bits of the rate
    content.extend_from_slice(&(((audio.sample_rate as u16) as u32) << 16).to_be_bytes());
    write_esds(&mut content, audio);
    push_box(buf, b"mp4a", &content);
}

fn write_esds(buf: &mut Vec<u8>, audio: &AudioTrackParams) {
    let dec_specific = descriptor(0x05, &audio.asc);

    let mut dcd = Vec::new();
    dcd.push(0x40); // objectTypeIndication: MPEG-4 audio
    dcd.push(0x15); // streamType audio, reserved bit set
    dcd.extend_from_slice(&[0, 0, 0]); // bufferSizeDB
    dcd.extend_from_slice(&0u32.to_be_bytes()); // maxBitrate
    dcd.extend_from_slice(&0u32.to_be_bytes()); // avgBitrate
    dcd.extend_from_slice(&dec_specific);
    let decoder_config = descriptor(0x04, &dcd);

    let sl_config = descriptor(0x06, &[0x02]);

    let mut es = Vec::new();
    es.extend_from_slice(&(audio.track_id as u16).to_be_bytes()); // ES_ID
    es.push(0); // no stream dependencies
    es.extend_from_slice(&decoder_config);
    es.extend_from_slice(&sl_config);
    let es_descriptor = descriptor(0x03, &es);

    let mut content = Vec::new();
    content.extend_from_slice(&full_box_header(0, 0));
    content.extend_from_slice(&es_descriptor);
    push_box(buf, b"esds", &content);
}

/// MPEG-4 expandable descriptor: tag, 7-bits-per-byte size, body.
fn descriptor(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut sizes = Vec::new();
    let mut len = body.len();
    loop {
        sizes.push((len & 0x7f) as u8);
        len >>= 7;
        if len == 0 {
            break;
        }
    }
    sizes.reverse();
    let mut out = Vec::with_capacity(1 + sizes.len() + body.len());
    out.push(tag);
    for (i, s) in sizes.iter().enumerate() {
        if i + 1 < sizes.len() {
            out.push(s | 0x80);
        } else {
            out.push(*s);
        }
    }
    out.extend_from_slice(body);
    out
}

fn write_trex(buf: &mut Vec<u8>, track_id: u32) {
    let mut content = Vec::new();
    content.extend_from_slice(&full_box_header(0, 0));
    content.extend_from_slice(&track_id.to_be_bytes());
    content.extend_from_slice(&1u32.to_be_bytes()); // default description index
    content.extend_from_slice(&0u32.to_be_bytes()); // default duration
    content.extend_from_slice(&0u32.to_be_bytes()); // default size
    content.extend_from_slice(&0u32.to_be_bytes()); // default flags
    push_box(buf, b"trex", &content);
}

/// A multi-track `moof`+`mdat` fragment under construction.
#[derive(Debug)]
pub struct Fragment {
    seq: u32,
    tracks: Vec<(u32, Vec<FullSample>)>,
}

const TFHD_SIZE: usize = 16;
const TFDT_SIZE: usize = 20;
const MFHD_SIZE: usize = 16;

impl Fragment {
    pub fn new(seq: u32, track_ids: &[u32]) -> Self {
        Self {
            seq,
            tracks: track_ids.iter().map(|&id| (id, Vec::new())).collect(),
        }
    }

    /// Append a sample to its track run. Samples for unknown tracks are
    /// dropped; the caller only ever routes configured track ids here.
    pub fn add_sample(&mut self, ts: TrackSample) {
        if let Some((_, samples)) = self.tracks.iter_mut().find(|(id, _)| *id == ts.track_id) {
            samples.push(ts.sample);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.iter().all(|(_, samples)| samples.is_empty())
    }

    pub fn encode(&self) -> Vec<u8> {
        let trun_size = |n: usize| 20 + 16 * n;
        let traf_size = |n: usize| 8 + TFHD_SIZE + TFDT_SIZE + trun_size(n);

        let moof_size: usize = 8
            + MFHD_SIZE
            + self
                .tracks
                .iter()
                .map(|(_, s)| traf_size(s.len()))
                .sum::<usize>();

        let mut buf = Vec::new();

        let mut moof = Vec::new();
        let mut mfhd = Vec::new();
        mfhd.extend_from_slice(&full_box_header(0, 0));
        mfhd.extend_from_slice(&self.seq.to_be_bytes());
        push_box(&mut moof, b"mfhd", &mfhd);

        // data offsets are relative to the start of moof
        let mut data_offset = moof_size + 8;
        for (track_id, samples) in &self.tracks {
            let mut traf = Vec::new();

            let mut tfhd = Vec::new();
            tfhd.extend_from_slice(&full_box_header(0, 0x02_0000)); // default-base-is-moof
            tfhd.extend_from_slice(&track_id.to_be_bytes());
            push_box(&mut traf, b"tfhd", &tfhd);

            let base_time = samples.first().map(|s| s.decode_time).unwrap_or(0);
            let mut tfdt = Vec::new();
            tfdt.extend_from_slice(&full_box_header(1, 0));
            tfdt.extend_from_slice(&base_time.to_be_bytes());
            push_box(&mut traf, b"tfdt", &tfdt);

            let mut trun = Vec::new();
            // data-offset + duration + size + flags + cts present
            trun.extend_from_slice(&full_box_header(0, 0x000f01));
            trun.extend_from_slice(&(samples.len() as u32).to_be_bytes());
            trun.extend_from_slice(&(data_offset as u32).to_be_bytes());
            for sample in samples {
                trun.extend_from_slice(&sample.duration.to_be_bytes());
                trun.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
                trun.extend_from_slice(&sample.flags.to_be_bytes());
                trun.extend_from_slice(&sample.cts_offset.to_be_bytes());
            }
            push_box(&mut traf, b"trun", &trun);

            push_box(&mut moof, b"traf", &traf);
            data_offset += samples.iter().map(|s| s.data.len()).sum::<usize>();
        }
        push_box(&mut buf, b"moof", &moof);
        debug_assert_eq!(buf.len(), moof_size);

        let mdat_len: usize = self
            .tracks
            .iter()
            .flat_map(|(_, s)| s.iter())
            .map(|s| s.data.len())
            .sum();
        buf.extend_from_slice(&((mdat_len + 8) as u32).to_be_bytes());
        buf.extend_from_slice(b"mdat");
        for (_, samples) in &self.tracks {
            for sample in samples {
                buf.extend_from_slice(&sample.data);
            }
        }
        buf
    }
}
