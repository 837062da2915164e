//! Append-only fMP4 archive writer. One recorder per stream name, shared
//! across publisher reconnects; timestamps of later sessions are rebased so
//! the concatenated timeline stays strictly monotone.

use bytes::Bytes;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::codec::avc::AvcConfig;
use crate::codec::AacConfig;
use crate::error::{Error, Result};
use crate::fmp4::{self, Fragment, TrackSample, VIDEO_TIMESCALE};
use crate::track::{PendingSample, TrackState};

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;
const FALLBACK_FRAGMENT_MS: i64 = 2_000;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub fragment_duration: Duration,
    pub low_bitrate_threshold: i64,
    pub max_duration_low: Duration,
    pub max_size_high_bytes: i64,
    pub allow_no_audio: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LimitMode {
    Unset,
    Duration,
    Size,
}

struct FragmentBuilder {
    idx: i64,
    samples: Vec<TrackSample>,
}

struct Inner {
    cfg: RecorderConfig,
    file: Option<fs::File>,
    bytes_written: i64,

    limit_mode: LimitMode,
    max_duration_ms: i64,
    max_size_bytes: i64,

    sessions: u32,
    session_started: bool,
    session_offset_ms: i64,

    started: bool,
    start_ts_ms: i64,
    last_ts_ms: i64,

    fragment_seq: u32,
    fragment_duration_ms: i64,
    current_fragment: Option<FragmentBuilder>,

    audio_timescale: u32,
    video_id: u32,
    audio_id: u32,

    avc_config: Option<AvcConfig>,
    aac_config: Option<AacConfig>,

    init_written: bool,
    ignore_audio: bool,

    video_state: TrackState,
    audio_state: TrackState,

    stopped: bool,
    failed: bool,
}

pub struct Recorder {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder").field("path", &self.path).finish()
    }
}

impl Recorder {
    pub fn new(cfg: RecorderConfig, path: &Path) -> Result<Self> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o644);
        let file = options.open(path)?;
        let fragment_duration_ms = cfg.fragment_duration.as_millis() as i64;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                cfg,
                file: Some(file),
                bytes_written: 0,
                limit_mode: LimitMode::Unset,
                max_duration_ms: 0,
                max_size_bytes: 0,
                sessions: 0,
                session_started: false,
                session_offset_ms: 0,
                started: false,
                start_ts_ms: 0,
                last_ts_ms: 0,
                fragment_seq: 0,
                fragment_duration_ms,
                current_fragment: None,
                audio_timescale: 0,
                video_id: 0,
                audio_id: 0,
                avc_config: None,
                aac_config: None,
                init_written: false,
                ignore_audio: false,
                video_state: TrackState::new(true),
                audio_state: TrackState::new(false),
                stopped: false,
                failed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin a (re)connect session; the next sample computes the rebase
    /// offset against the last written timestamp.
    pub fn start_session(&self) {
        let mut inner = self.inner.lock().expect("recorder lock");
        inner.sessions += 1;
        inner.session_started = false;
        inner.session_offset_ms = 0;
    }

    /// First bitrate observation decides the limit mode; later calls are
    /// ignored, the mode is immutable for the recording.
    pub fn set_bitrate(&self, bitrate: i64) {
        let mut inner = self.inner.lock().expect("recorder lock");
        if inner.limit_mode != LimitMode::Unset {
            return;
        }
        if bitrate <= inner.cfg.low_bitrate_threshold {
            inner.limit_mode = LimitMode::Duration;
            inner.max_duration_ms = inner.cfg.max_duration_low.as_millis() as i64;
        } else {
            inner.limit_mode = LimitMode::Size;
            inner.max_size_bytes = inner.cfg.max_size_high_bytes;
        }
    }

    pub fn update_video_config(&self, cfg: &AvcConfig) -> Result<()> {
        let mut inner = self.inner.lock().expect("recorder lock");
        if inner.init_written && inner.avc_config.as_ref() != Some(cfg) {
            if inner.sessions > 1 {
                return Err(Error::AppendNotPossible);
            }
            inner.mark_failed("video config changed");
            return Ok(());
        }
        inner.avc_config = Some(cfg.clone());
        inner.maybe_write_init()
    }

    pub fn update_audio_config(&self, cfg: &AacConfig) -> Result<()> {
        let mut inner = self.inner.lock().expect("recorder lock");
        if inner.init_written {
            if inner.audio_id == 0 {
                if inner.sessions > 1 {
                    return Err(Error::AppendNotPossible);
                }
                inner.ignore_audio = true;
                return Ok(());
            }
            if inner.aac_config.as_ref() != Some(cfg) {
                if inner.sessions > 1 {
                    return Err(Error::AppendNotPossible);
                }
                inner.mark_failed("audio config changed");
                return Ok(());
            }
        }
        inner.audio_timescale = cfg.sample_rate;
        let mut default_dur_ms = (1024.0 * 1000.0 / cfg.sample_rate as f64).round() as i64;
        if default_dur_ms <= 0 {
            default_dur_ms = 20;
        }
        inner.audio_state.default_dur_ms = default_dur_ms;
        inner.aac_config = Some(cfg.clone());
        inner.maybe_write_init()
    }

    pub fn add_video_sample(&self, dts_ms: i64, cts_ms: i64, data: Bytes, is_key: bool) {
        let mut inner = self.inner.lock().expect("recorder lock");
        inner.add_sample(
            true,
            PendingSample {
                dts_ms,
                cts_ms,
                data,
                is_key,
            },
        );
    }

    pub fn add_audio_sample(&self, dts_ms: i64, data: Bytes) {
        let mut inner = self.inner.lock().expect("recorder lock");
        inner.add_sample(
            false,
            PendingSample {
                dts_ms,
                cts_ms: 0,
                data,
                is_key: false,
            },
        );
    }

    pub fn flush(&self) {
        let mut inner = self.inner.lock().expect("recorder lock");
        inner.flush();
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("recorder lock");
        inner.flush();
        inner.file = None;
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().expect("recorder lock").stopped
    }

    pub fn is_failed(&self) -> bool {
        self.inner.lock().expect("recorder lock").failed
    }

    pub fn bytes_written(&self) -> i64 {
        self.inner.lock().expect("recorder lock").bytes_written
    }

    pub fn last_timestamp_ms(&self) -> i64 {
        self.inner.lock().expect("recorder lock").last_ts_ms
    }
}

impl Inner {
    fn add_sample(&mut self, is_video: bool, mut sample: PendingSample) {
        if self.stopped || self.failed || !self.init_written {
            return;
        }
        if !is_video && (self.ignore_audio || self.audio_id == 0) {
            return;
        }
        let adjusted = self.adjust_ts(sample.dts_ms);
        if self.limit_mode == LimitMode::Duration
            && self.max_duration_ms > 0
            && self.started
            && adjusted - self.start_ts_ms >= self.max_duration_ms
        {
            self.stopped = true;
            return;
        }
        sample.dts_ms = adjusted;
        self.ensure_start(sample.dts_ms);

        if let Some(full) = self.ingest_sample(is_video, sample) {
            if let Err(err) = self.append_to_fragment(full) {
                self.mark_failed(&err.to_string());
            }
        }
    }

    fn ingest_sample(&mut self, is_video: bool, mut sample: PendingSample) -> Option<TrackSample> {
        let (video_id, audio_id, audio_timescale) =
            (self.video_id, self.audio_id, self.audio_timescale);
        let state = if is_video {
            &mut self.video_state
        } else {
            &mut self.audio_state
        };
        if state.timescale == 0 {
            if is_video {
                state.timescale = VIDEO_TIMESCALE;
                state.track_id = video_id;
                if state.default_dur_ms == 0 {
                    state.default_dur_ms = 33;
                }
            } else {
                state.timescale = audio_timescale;
                state.track_id = audio_id;
            }
        }
        if state.has_started {
            if let Some(pending) = &state.pending {
                if sample.dts_ms <= pending.dts_ms {
                    sample.dts_ms = pending.dts_ms + state.last_dur_ms.max(1);
                }
            }
        }
        let Some(pending) = state.pending.take() else {
            state.last_dts_ms = sample.dts_ms;
            state.has_started = true;
            state.pending = Some(sample);
            return None;
        };
        let dur_ms = state.pick_duration(sample.dts_ms - pending.dts_ms);
        let full = state.build_full_sample(&pending, dur_ms);
        state.last_dur_ms = dur_ms;
        state.last_dts_ms = sample.dts_ms;
        state.pending = Some(sample);
        Some(full)
    }

    fn flush(&mut self) {
        if let Err(err) = self.flush_track(true) {
            self.mark_failed(&err.to_string());
        }
        if let Err(err) = self.flush_track(false) {
            self.mark_failed(&err.to_string());
        }
        if let Err(err) = self.finalize_fragment() {
            self.mark_failed(&err.to_string());
        }
    }

    fn flush_track(&mut self, is_video: bool) -> Result<()> {
        if !self.init_written {
            return Ok(());
        }
        let state = if is_video {
            &mut self.video_state
        } else {
            &mut self.audio_state
        };
        let Some(pending) = state.pending.take() else {
            return Ok(());
        };
        let dur_ms = state.pick_duration(0);
        let full = state.build_full_sample(&pending, dur_ms);
        self.append_to_fragment(full)
    }

    fn append_to_fragment(&mut self, full: TrackSample) -> Result<()> {
        let timescale = if full.track_id == self.video_id {
            VIDEO_TIMESCALE
        } else {
            self.audio_timescale
        };
        let ts_ms = fmp4::scale_to_ms(full.sample.decode_time, timescale);
        let idx = self.fragment_index(ts_ms);
        let switch = match &self.current_fragment {
            Some(fragment) => fragment.idx != idx,
            None => true,
        };
        if switch {
            self.finalize_fragment()?;
            self.current_fragment = Some(FragmentBuilder {
                idx,
                samples: Vec::new(),
            });
        }
        self.current_fragment
            .as_mut()
            .expect("fragment builder just ensured")
            .samples
            .push(full);
        Ok(())
    }

    fn fragment_index(&self, ts_ms: i64) -> i64 {
        let rel = (ts_ms - self.start_ts_ms).max(0);
        let window = if self.fragment_duration_ms > 0 {
            self.fragment_duration_ms
        } else {
            FALLBACK_FRAGMENT_MS
        };
        rel / window
    }

    fn finalize_fragment(&mut self) -> Result<()> {
        let Some(builder) = self.current_fragment.take() else {
            return Ok(());
        };
        if builder.samples.is_empty() {
            return Ok(());
        }
        let mut track_ids = Vec::with_capacity(2);
        if self.video_id != 0 {
            track_ids.push(self.video_id);
        }
        if self.audio_id != 0 {
            track_ids.push(self.audio_id);
        }
        let mut fragment = Fragment::new(self.fragment_seq + 1, &track_ids);
        for sample in builder.samples {
            fragment.add_sample(sample);
        }
        self.write_bytes(&fragment.encode())?;
        self.fragment_seq += 1;
        Ok(())
    }

    fn maybe_write_init(&mut self) -> Result<()> {
        if self.init_written {
            return Ok(());
        }
        let Some(avc) = &self.avc_config else {
            return Ok(());
        };
        let (Some(sps), Some(pps)) = (avc.sps.first(), avc.pps.first()) else {
            return Ok(());
        };
        if !self.cfg.allow_no_audio && self.aac_config.is_none() {
            return Ok(());
        }

        let info = crate::codec::avc::parse_sps(sps).unwrap_or_default();
        let video = fmp4::VideoTrackParams {
            track_id: VIDEO_TRACK_ID,
            timescale: VIDEO_TIMESCALE,
            sps: sps.clone(),
            pps: pps.clone(),
            width: info.width,
            height: info.height,
        };
        self.video_id = VIDEO_TRACK_ID;
        self.video_state.track_id = VIDEO_TRACK_ID;
        self.video_state.timescale = VIDEO_TIMESCALE;
        self.video_state.default_dur_ms = 33;

        let audio = self.aac_config.as_ref().map(|aac| {
            let channels = if aac.channels == 0 { 2 } else { aac.channels };
            fmp4::AudioTrackParams {
                track_id: AUDIO_TRACK_ID,
                sample_rate: aac.sample_rate,
                channels: channels as u16,
                asc: aac.asc.clone(),
            }
        });
        match &audio {
            Some(params) => {
                self.audio_id = AUDIO_TRACK_ID;
                self.audio_timescale = params.sample_rate;
                self.audio_state.track_id = AUDIO_TRACK_ID;
                self.audio_state.timescale = params.sample_rate;
            }
            None => self.ignore_audio = true,
        }

        let init = fmp4::build_init_segment(&video, audio.as_ref());
        self.write_bytes(&init)?;
        self.init_written = true;
        Ok(())
    }

    /// Rebase a wire timestamp into the archive timeline so a reconnect
    /// continues strictly after the last written sample.
    fn adjust_ts(&mut self, ts_ms: i64) -> i64 {
        if !self.session_started {
            self.session_started = true;
            if self.last_ts_ms > 0 && ts_ms < self.last_ts_ms + 1 {
                self.session_offset_ms = (self.last_ts_ms + 1) - ts_ms;
            } else {
                self.session_offset_ms = 0;
            }
        }
        let adjusted = ts_ms + self.session_offset_ms;
        if adjusted > self.last_ts_ms {
            self.last_ts_ms = adjusted;
        }
        adjusted
    }

    fn ensure_start(&mut self, ts_ms: i64) {
        if self.started {
            return;
        }
        self.started = true;
        self.start_ts_ms = ts_ms;
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "archive file closed",
            )));
        };
        if data.is_empty() {
            return Ok(());
        }
        file.write_all(data)?;
        self.bytes_written += data.len() as i64;
        if self.limit_mode == LimitMode::Size
            && self.max_size_bytes > 0
            && self.bytes_written >= self.max_size_bytes
        {
            self.stopped = true;
        }
        Ok(())
    }

    fn mark_failed(&mut self, reason: &str) {
        if self.failed {
            return;
        }
        self.failed = true;
        self.stopped = true;
        log::warn!("archive recorder stopped: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> RecorderConfig {
        RecorderConfig {
            fragment_duration: Duration::from_secs(2),
            low_bitrate_threshold: 12_000_000,
            max_duration_low: Duration::from_secs(90 * 60),
            max_size_high_bytes: 5 * 1024 * 1024 * 1024,
            allow_no_audio: false,
        }
    }

    fn avc_fixture(seed: u8) -> AvcConfig {
        AvcConfig {
            profile: 66,
            compatibility: 0,
            level: 30,
            length_size: 4,
            sps: vec![Bytes::copy_from_slice(&[0x67, 0x42, 0x00, 0x1e, seed])],
            pps: vec![Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80])],
        }
    }

    fn aac_fixture() -> AacConfig {
        AacConfig::parse(&[0x11, 0x90]).unwrap()
    }

    fn recorder_in(dir: &TempDir) -> Recorder {
        let rec = Recorder::new(config(), &dir.path().join("archive.mp4")).unwrap();
        rec.start_session();
        rec.set_bitrate(1_000_000);
        rec.update_video_config(&avc_fixture(1)).unwrap();
        rec.update_audio_config(&aac_fixture()).unwrap();
        rec
    }

    fn feed(rec: &Recorder, from_ms: i64, until_ms: i64) {
        let mut ts = from_ms;
        while ts < until_ms {
            rec.add_video_sample(ts, 0, Bytes::from_static(&[0xaa; 32]), ts == from_ms);
            ts += 33;
        }
    }

    #[test]
    fn writes_init_then_fragments() {
        let dir = TempDir::new().unwrap();
        let rec = recorder_in(&dir);
        let after_init = rec.bytes_written();
        assert!(after_init > 0);
        feed(&rec, 0, 5_000);
        rec.close();
        let bytes = std::fs::read(dir.path().join("archive.mp4")).unwrap();
        assert_eq!(bytes.len() as i64, rec.bytes_written());
        assert!(bytes.len() as i64 > after_init);
        // starts with an ftyp box
        assert_eq!(&bytes[4..8], b"ftyp");
    }

    #[test]
    fn reconnect_rebases_timestamps() {
        let dir = TempDir::new().unwrap();
        let rec = recorder_in(&dir);
        feed(&rec, 0, 10_000);
        rec.flush();
        let last = rec.last_timestamp_ms();
        assert!(last >= 9_900);

        rec.start_session();
        // second session restarts near zero, must land after `last`
        feed(&rec, 500, 1_500);
        rec.flush();
        assert!(rec.last_timestamp_ms() > last);
        rec.close();
    }

    #[test]
    fn config_change_in_first_session_fails_recorder() {
        let dir = TempDir::new().unwrap();
        let rec = recorder_in(&dir);
        feed(&rec, 0, 1_000);
        rec.update_video_config(&avc_fixture(2)).unwrap();
        assert!(rec.is_failed());
        assert!(rec.is_stopped());
    }

    #[test]
    fn config_change_across_sessions_is_append_not_possible() {
        let dir = TempDir::new().unwrap();
        let rec = recorder_in(&dir);
        feed(&rec, 0, 1_000);
        rec.start_session();
        let err = rec.update_video_config(&avc_fixture(2)).unwrap_err();
        assert!(matches!(err, Error::AppendNotPossible));
        let err = rec.update_audio_config(&AacConfig::parse(&[0x12, 0x10]).unwrap()).unwrap_err();
        assert!(matches!(err, Error::AppendNotPossible));
    }

    #[test]
    fn identical_config_resend_is_fine() {
        let dir = TempDir::new().unwrap();
        let rec = recorder_in(&dir);
        rec.start_session();
        rec.update_video_config(&avc_fixture(1)).unwrap();
        rec.update_audio_config(&aac_fixture()).unwrap();
        assert!(!rec.is_failed());
    }

    #[test]
    fn duration_limit_stops_recorder() {
        let dir = TempDir::new().unwrap();
        let rec = Recorder::new(
            RecorderConfig {
                max_duration_low: Duration::from_secs(2),
                ..config()
            },
            &dir.path().join("archive.mp4"),
        )
        .unwrap();
        rec.start_session();
        rec.set_bitrate(1_000); // below threshold: duration mode
        rec.update_video_config(&avc_fixture(1)).unwrap();
        rec.update_audio_config(&aac_fixture()).unwrap();
        feed(&rec, 0, 5_000);
        assert!(rec.is_stopped());
        assert!(!rec.is_failed());
        rec.close();
    }

    #[test]
    fn size_limit_stops_recorder() {
        let dir = TempDir::new().unwrap();
        let rec = Recorder::new(
            RecorderConfig {
                max_size_high_bytes: 2_000,
                ..config()
            },
            &dir.path().join("archive.mp4"),
        )
        .unwrap();
        rec.start_session();
        rec.set_bitrate(50_000_000); // above threshold: size mode
        rec.update_video_config(&avc_fixture(1)).unwrap();
        rec.update_audio_config(&aac_fixture()).unwrap();
        feed(&rec, 0, 20_000);
        rec.flush();
        assert!(rec.is_stopped());
    }

    #[test]
    fn samples_before_init_are_dropped() {
        let dir = TempDir::new().unwrap();
        let rec = Recorder::new(config(), &dir.path().join("archive.mp4")).unwrap();
        rec.start_session();
        rec.add_video_sample(0, 0, Bytes::from_static(&[1]), true);
        rec.close();
        assert_eq!(rec.bytes_written(), 0);
    }
}
