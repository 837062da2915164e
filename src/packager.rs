//! LL-HLS fMP4 packager. Samples arrive in wire milliseconds, get a
//! one-sample lookahead per track for real durations, and are assigned to
//! partial segments by arithmetic on the latched start timestamp. Every part
//! and segment lands on disk atomically before the playlist that names it.

use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;

use crate::codec::avc::{self, AvcConfig};
use crate::codec::AacConfig;
use crate::config::HlsSettings;
use crate::error::Result;
use crate::fmp4::{self, Fragment, TrackSample, VIDEO_TIMESCALE};
use crate::playlist::{PlaylistConfig, PlaylistManager};
use crate::storage::{self, Storage};
use crate::track::{PendingSample, TrackState};

/// DTS jumps beyond this are treated as a broken timeline and force a
/// re-init with a discontinuity.
const MAX_DTS_JUMP_MS: i64 = 5_000;

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;

pub fn segment_name(seq: u64) -> String {
    format!("seg_{:06}.m4s", seq)
}

pub fn part_name(seg_seq: u64, part_idx: i64) -> String {
    format!("part_{:06}_{:02}.m4s", seg_seq, part_idx)
}

#[derive(Debug, Clone)]
pub struct PackagerConfig {
    pub segment_duration: Duration,
    pub part_duration: Duration,
    pub target_duration: Duration,
    pub hold_back: Duration,
    pub part_hold_back: Duration,
    pub keep_segments: usize,
    pub rewind_window: Duration,
    pub init_filename: String,
    pub playlist_name: String,
    pub rewind_playlist_name: String,
    pub enable_partial: bool,
    pub allow_no_audio: bool,
}

impl PackagerConfig {
    pub fn from_settings(hls: &HlsSettings, allow_no_audio: bool) -> Self {
        Self {
            segment_duration: hls.segment_duration(),
            part_duration: hls.part_duration(),
            target_duration: hls.target_duration(),
            hold_back: hls.hold_back(),
            part_hold_back: hls.part_hold_back(),
            keep_segments: hls.keep_segments,
            rewind_window: hls.rewind_window(),
            init_filename: hls.init_filename.clone(),
            playlist_name: hls.playlist_name.clone(),
            rewind_playlist_name: hls.rewind_playlist_name.clone(),
            enable_partial: hls.enable_partial,
            allow_no_audio,
        }
    }
}

struct PartBuilder {
    seg_seq: u64,
    part_idx: i64,
    start_ms: i64,
    end_ms: i64,
    samples: Vec<TrackSample>,
}

struct SegmentBuilder {
    seq: u64,
    start_ms: i64,
    buffer: Vec<u8>,
    duration_ms: i64,
}

pub struct Packager {
    cfg: PackagerConfig,
    live_dir: PathBuf,
    rewind_dir: Option<PathBuf>,

    playlist: PlaylistManager,
    rewind: Option<PlaylistManager>,

    video_id: u32,
    audio_id: u32,
    audio_timescale: u32,
    avc_config: Option<AvcConfig>,
    aac_config: Option<AacConfig>,

    init_written: bool,
    started: bool,
    start_ts_ms: i64,
    segment_offset: u64,
    last_segment_seq: u64,
    fragment_seq: u32,

    part_duration_ms: i64,
    segment_duration_ms: i64,

    current_part: Option<PartBuilder>,
    current_segment: Option<SegmentBuilder>,

    video_state: TrackState,
    audio_state: TrackState,

    pending_discontinuity: bool,
}

impl Packager {
    pub fn new(cfg: PackagerConfig, storage: &Storage, stream_name: &str) -> Self {
        let live_dir = storage.stream_dir(stream_name);
        let rewind_dir = storage.enable_rewind.then(|| storage.rewind_dir(stream_name));

        let playlist = PlaylistManager::new(
            PlaylistConfig {
                target_duration: cfg.target_duration,
                part_duration: cfg.part_duration,
                hold_back: cfg.hold_back,
                part_hold_back: cfg.part_hold_back,
                keep_segments: cfg.keep_segments,
                enable_partial: cfg.enable_partial,
                init_filename: cfg.init_filename.clone(),
                playlist_name: cfg.playlist_name.clone(),
            },
            live_dir.clone(),
        );
        let rewind = rewind_dir.clone().map(|dir| {
            let segment_secs = cfg.segment_duration.as_secs().max(1);
            PlaylistManager::new(
                PlaylistConfig {
                    target_duration: cfg.target_duration,
                    part_duration: cfg.part_duration,
                    hold_back: cfg.hold_back,
                    part_hold_back: cfg.part_hold_back,
                    keep_segments: (cfg.rewind_window.as_secs() / segment_secs) as usize,
                    enable_partial: false,
                    init_filename: cfg.init_filename.clone(),
                    playlist_name: cfg.rewind_playlist_name.clone(),
                },
                dir,
            )
        });

        let part_duration_ms = cfg.part_duration.as_millis() as i64;
        let segment_duration_ms = cfg.segment_duration.as_millis() as i64;
        let mut packager = Self {
            cfg,
            live_dir,
            rewind_dir,
            playlist,
            rewind,
            video_id: 0,
            audio_id: 0,
            audio_timescale: 0,
            avc_config: None,
            aac_config: None,
            init_written: false,
            started: false,
            start_ts_ms: 0,
            segment_offset: 0,
            last_segment_seq: 0,
            fragment_seq: 0,
            part_duration_ms,
            segment_duration_ms,
            current_part: None,
            current_segment: None,
            video_state: TrackState::new(true),
            audio_state: TrackState::new(false),
            pending_discontinuity: false,
        };
        packager.resume_from_existing();
        packager
    }

    /// Pick up where a previous process left off: the largest sequence in
    /// the live (or, failing that, rewind) playlist becomes the offset, and
    /// the next segment starts after a discontinuity.
    fn resume_from_existing(&mut self) {
        let live_path = self.live_dir.join(&self.cfg.playlist_name);
        let (mut last_seq, mut has_segments) =
            match self.playlist.load_from_file(&live_path, true) {
                Ok(loaded) => loaded,
                Err(err) => {
                    log::warn!("resume live playlist error: {}", err);
                    (0, false)
                }
            };
        if let (Some(rewind), Some(dir)) = (&mut self.rewind, &self.rewind_dir) {
            let rewind_path = dir.join(&self.cfg.rewind_playlist_name);
            match rewind.load_from_file(&rewind_path, true) {
                Ok((rewind_last, rewind_has)) => {
                    if !has_segments && rewind_has {
                        last_seq = rewind_last;
                        has_segments = true;
                    }
                }
                Err(err) => log::warn!("resume rewind playlist error: {}", err),
            }
        }
        if has_segments {
            self.segment_offset = last_seq;
            self.last_segment_seq = last_seq;
            self.pending_discontinuity = true;
        }
    }

    pub fn update_video_config(&mut self, cfg: &AvcConfig) -> Result<()> {
        if self.init_written && self.avc_config.as_ref() != Some(cfg) {
            self.reset(false)?;
        }
        self.avc_config = Some(cfg.clone());
        self.maybe_write_init()
    }

    pub fn update_audio_config(&mut self, cfg: &AacConfig) -> Result<()> {
        if self.init_written
            && (self
                .aac_config
                .as_ref()
                .is_some_and(|c| c.sample_rate != cfg.sample_rate)
                || self.audio_id == 0)
        {
            self.reset(false)?;
        }
        self.audio_timescale = cfg.sample_rate;
        let mut default_dur_ms = (1024.0 * 1000.0 / cfg.sample_rate as f64).round() as i64;
        if default_dur_ms == 0 {
            default_dur_ms = 20;
        }
        self.audio_state.default_dur_ms = default_dur_ms;
        self.aac_config = Some(cfg.clone());
        self.maybe_write_init()
    }

    pub fn add_video_sample(
        &mut self,
        dts_ms: i64,
        cts_ms: i64,
        data: Bytes,
        is_key: bool,
    ) -> Result<()> {
        self.add_sample(
            true,
            PendingSample {
                dts_ms,
                cts_ms,
                data,
                is_key,
            },
        )
    }

    pub fn add_audio_sample(&mut self, dts_ms: i64, data: Bytes) -> Result<()> {
        self.add_sample(
            false,
            PendingSample {
                dts_ms,
                cts_ms: 0,
                data,
                is_key: false,
            },
        )
    }

    /// Emit everything still pending: both lookahead samples, the open part
    /// and the open segment.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_track(true)?;
        self.flush_track(false)?;
        self.finalize_part()?;
        self.finalize_segment()
    }

    pub fn last_segment_seq(&self) -> u64 {
        self.last_segment_seq
    }

    fn add_sample(&mut self, is_video: bool, mut sample: PendingSample) -> Result<()> {
        if !self.init_written {
            return Ok(());
        }
        if !is_video && self.aac_config.is_none() {
            return Ok(());
        }
        self.ensure_start(sample.dts_ms);
        if sample.dts_ms < self.start_ts_ms {
            sample.dts_ms = self.start_ts_ms;
        }
        if let Some(full) = self.ingest_sample(is_video, sample)? {
            self.append_to_part(full)?;
        }
        Ok(())
    }

    fn ingest_sample(
        &mut self,
        is_video: bool,
        mut sample: PendingSample,
    ) -> Result<Option<TrackSample>> {
        self.bind_track_defaults(is_video);

        let jumped = {
            let state = self.state(is_video);
            state.has_started
                && state.last_dts_ms != 0
                && (sample.dts_ms - state.last_dts_ms).abs() > MAX_DTS_JUMP_MS
        };
        if jumped {
            self.reset(true)?;
            self.state_mut(is_video).clear();
        }

        let state = self.state_mut(is_video);
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
            return Ok(None);
        };
        let dur_ms = state.pick_duration(sample.dts_ms - pending.dts_ms);
        let full = state.build_full_sample(&pending, dur_ms);
        state.last_dur_ms = dur_ms;
        state.last_dts_ms = sample.dts_ms;
        state.pending = Some(sample);
        Ok(Some(full))
    }

    fn flush_track(&mut self, is_video: bool) -> Result<()> {
        if !self.init_written {
            return Ok(());
        }
        let state = self.state_mut(is_video);
        let Some(pending) = state.pending.take() else {
            return Ok(());
        };
        let dur_ms = state.pick_duration(0);
        let full = state.build_full_sample(&pending, dur_ms);
        self.append_to_part(full)
    }

    fn append_to_part(&mut self, full: TrackSample) -> Result<()> {
        let timescale = if full.track_id == self.video_id {
            VIDEO_TIMESCALE
        } else {
            self.audio_timescale
        };
        let ts_ms = fmp4::scale_to_ms(full.sample.decode_time, timescale);
        let (part_idx, seg_seq, part_start_ms) = self.compute_part_index(ts_ms);
        let part_end_ms = part_start_ms + self.part_duration_ms;

        let switch = match &self.current_part {
            Some(part) => part.part_idx != part_idx || part.seg_seq != seg_seq,
            None => true,
        };
        if switch {
            self.finalize_part()?;
            self.current_part = Some(PartBuilder {
                seg_seq,
                part_idx,
                start_ms: part_start_ms,
                end_ms: part_end_ms,
                samples: Vec::new(),
            });
        }
        self.current_part
            .as_mut()
            .expect("part builder just ensured")
            .samples
            .push(full);
        Ok(())
    }

    fn compute_part_index(&self, ts_ms: i64) -> (i64, u64, i64) {
        let rel = (ts_ms - self.start_ts_ms).max(0);
        let parts_per_segment = (self.segment_duration_ms / self.part_duration_ms).max(1);
        let global_part_idx = rel / self.part_duration_ms;
        let seg_idx = rel / self.segment_duration_ms;
        let seg_seq = seg_idx as u64 + 1 + self.segment_offset;
        let seg_start_ms = self.start_ts_ms + seg_idx * self.segment_duration_ms;
        let part_idx = (global_part_idx - seg_idx * parts_per_segment).max(0);
        let part_start_ms = seg_start_ms + part_idx * self.part_duration_ms;
        (part_idx, seg_seq, part_start_ms)
    }

    fn finalize_part(&mut self) -> Result<()> {
        let Some(part) = self.current_part.take() else {
            return Ok(());
        };
        if part.samples.is_empty() {
            return Ok(());
        }
        self.ensure_segment_builder(part.seg_seq, part.start_ms)?;

        let mut fragment = Fragment::new(self.fragment_seq + 1, &self.track_ids());
        for sample in part.samples {
            fragment.add_sample(sample);
        }
        let bytes = fragment.encode();

        let part_file = part_name(part.seg_seq, part.part_idx);
        storage::write_file_atomic(&self.live_dir.join(&part_file), &bytes)?;

        self.playlist.add_part(
            part.seg_seq,
            &part_file,
            self.part_duration_ms as f64 / 1000.0,
        );
        let segment = self
            .current_segment
            .as_mut()
            .expect("segment builder ensured above");
        segment.buffer.extend_from_slice(&bytes);
        segment.duration_ms += self.part_duration_ms;
        let segment_full = part.end_ms >= segment.start_ms + self.segment_duration_ms;
        self.fragment_seq += 1;

        if segment_full {
            self.finalize_segment()?;
        }
        self.playlist.write()?;
        Ok(())
    }

    fn finalize_segment(&mut self) -> Result<()> {
        let Some(segment) = self.current_segment.take() else {
            return Ok(());
        };
        if segment.buffer.is_empty() {
            return Ok(());
        }
        let seg_file = segment_name(segment.seq);
        let seg_path = self.live_dir.join(&seg_file);
        storage::write_file_atomic(&seg_path, &segment.buffer)?;
        let duration_s = segment.duration_ms as f64 / 1000.0;
        self.playlist.finalize_segment(segment.seq, &seg_file, duration_s);

        if let (Some(rewind), Some(rewind_dir)) = (&mut self.rewind, &self.rewind_dir) {
            if let Err(err) = storage::copy_or_link(&seg_path, &rewind_dir.join(&seg_file)) {
                log::warn!("rewind copy error: {}", err);
            }
            rewind.finalize_segment(segment.seq, &seg_file, duration_s);
            let removed = rewind.prune();
            rewind.remove_files(&removed);
            if let Err(err) = rewind.write() {
                log::warn!("rewind playlist write error: {}", err);
            }
        }

        let removed = self.playlist.prune();
        self.playlist.remove_files(&removed);
        self.playlist.write()?;
        self.last_segment_seq = segment.seq;
        Ok(())
    }

    fn ensure_segment_builder(&mut self, seg_seq: u64, start_ms: i64) -> Result<()> {
        let needs_finalize = match &self.current_segment {
            Some(current) if current.seq == seg_seq => return Ok(()),
            Some(_) => true,
            None => false,
        };
        if needs_finalize {
            self.finalize_segment()?;
        }
        let seg_start_ms = start_ms - (start_ms - self.start_ts_ms) % self.segment_duration_ms;
        self.current_segment = Some(SegmentBuilder {
            seq: seg_seq,
            start_ms: seg_start_ms,
            buffer: Vec::new(),
            duration_ms: 0,
        });
        if self.pending_discontinuity {
            self.playlist.mark_discontinuity_next();
            if let Some(rewind) = &mut self.rewind {
                rewind.mark_discontinuity_next();
            }
            self.pending_discontinuity = false;
        }
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

        let info = avc::parse_sps(sps).unwrap_or_default();
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
        if let Some(audio) = &audio {
            self.audio_id = AUDIO_TRACK_ID;
            self.audio_timescale = audio.sample_rate;
            self.audio_state.track_id = AUDIO_TRACK_ID;
            self.audio_state.timescale = audio.sample_rate;
        }

        let init = fmp4::build_init_segment(&video, audio.as_ref());
        storage::write_file_atomic(&self.live_dir.join(&self.cfg.init_filename), &init)?;
        if let (Some(rewind), Some(rewind_dir)) = (&self.rewind, &self.rewind_dir) {
            if let Err(err) =
                storage::write_file_atomic(&rewind_dir.join(&self.cfg.init_filename), &init)
            {
                log::warn!("rewind init write error: {}", err);
            }
            if let Err(err) = rewind.write() {
                log::warn!("rewind playlist write error: {}", err);
            }
        }
        self.init_written = true;
        self.playlist.write()?;
        Ok(())
    }

    fn ensure_start(&mut self, dts_ms: i64) {
        if self.started {
            return;
        }
        self.started = true;
        self.start_ts_ms = dts_ms;
    }

    /// Drop progress (finalizing what is already buffered), arm a
    /// discontinuity and start sequence numbering past the last segment.
    fn reset(&mut self, reinit: bool) -> Result<()> {
        if let Err(err) = self.finalize_part() {
            log::warn!("reset part finalize error: {}", err);
        }
        if let Err(err) = self.finalize_segment() {
            log::warn!("reset segment finalize error: {}", err);
        }
        self.pending_discontinuity = true;
        self.segment_offset = self.last_segment_seq;
        self.start_ts_ms = 0;
        self.started = false;
        self.current_part = None;
        self.current_segment = None;
        self.video_state.pending = None;
        self.audio_state.pending = None;
        self.init_written = false;
        self.video_id = 0;
        self.audio_id = 0;
        self.fragment_seq = 0;
        if reinit {
            self.maybe_write_init()?;
        }
        Ok(())
    }

    fn bind_track_defaults(&mut self, is_video: bool) {
        let (video_id, audio_id, audio_timescale) =
            (self.video_id, self.audio_id, self.audio_timescale);
        let state = self.state_mut(is_video);
        if state.timescale != 0 {
            return;
        }
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

    fn track_ids(&self) -> Vec<u32> {
        let mut ids = Vec::with_capacity(2);
        if self.video_id != 0 {
            ids.push(self.video_id);
        }
        if self.audio_id != 0 {
            ids.push(self.audio_id);
        }
        ids
    }

    fn state(&self, is_video: bool) -> &TrackState {
        if is_video {
            &self.video_state
        } else {
            &self.audio_state
        }
    }

    fn state_mut(&mut self, is_video: bool) -> &mut TrackState {
        if is_video {
            &mut self.video_state
        } else {
            &mut self.audio_state
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn test_config() -> PackagerConfig {
        PackagerConfig {
            segment_duration: Duration::from_secs(2),
            part_duration: Duration::from_millis(200),
            target_duration: Duration::from_secs(2),
            hold_back: Duration::from_secs(6),
            part_hold_back: Duration::from_secs(1),
            keep_segments: 6,
            rewind_window: Duration::from_secs(3600),
            init_filename: "init.mp4".to_string(),
            playlist_name: "index.m3u8".to_string(),
            rewind_playlist_name: "index.m3u8".to_string(),
            enable_partial: true,
            allow_no_audio: false,
        }
    }

    fn test_storage(dir: &TempDir, rewind: bool) -> Storage {
        Storage::new(dir.path().join("live"), dir.path().join("rewind"), rewind)
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

    // samples interleaved in timestamp order, like the wire delivers them
    fn feed(p: &mut Packager, from_ms: i64, until_ms: i64) {
        let mut video_ts = from_ms;
        let mut audio_ts = from_ms;
        while video_ts < until_ms || audio_ts < until_ms {
            if audio_ts < until_ms && (audio_ts <= video_ts || video_ts >= until_ms) {
                p.add_audio_sample(audio_ts, Bytes::from_static(&[0xbb; 16]))
                    .unwrap();
                audio_ts += 21;
            } else {
                let is_key = (video_ts - from_ms) % 2_000 == 0;
                p.add_video_sample(video_ts, 0, Bytes::from_static(&[0xaa; 64]), is_key)
                    .unwrap();
                video_ts += 33;
            }
        }
    }

    fn new_packager(storage: &Storage) -> Packager {
        storage.ensure_stream_dirs("teststream").unwrap();
        let mut p = Packager::new(test_config(), storage, "teststream");
        p.update_video_config(&avc_fixture(1)).unwrap();
        p.update_audio_config(&aac_fixture()).unwrap();
        p
    }

    #[test]
    fn happy_path_produces_window_of_segments() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir, false);
        let mut p = new_packager(&storage);
        feed(&mut p, 0, 20_000);
        p.flush().unwrap();

        let live = storage.stream_dir("teststream");
        assert!(live.join("init.mp4").is_file());
        let playlist = fs::read_to_string(live.join("index.m3u8")).unwrap();
        assert!(playlist.contains("#EXT-X-TARGETDURATION:2"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:5"));
        assert_eq!(playlist.matches("#EXTINF:").count(), 6);
        assert!(!playlist.contains("#EXT-X-DISCONTINUITY"));
        assert!(live.join("seg_000005.m4s").is_file());
        assert!(live.join("seg_000010.m4s").is_file());
        // pruned segments and their parts are gone
        assert!(!live.join("seg_000001.m4s").exists());
        assert!(!live.join("part_000001_00.m4s").exists());
    }

    #[test]
    fn segment_bytes_are_concatenation_of_parts() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir, false);
        let mut p = new_packager(&storage);
        feed(&mut p, 0, 20_000);
        p.flush().unwrap();

        let live = storage.stream_dir("teststream");
        let seg = fs::read(live.join("seg_000007.m4s")).unwrap();
        let mut parts = Vec::new();
        for idx in 0..10 {
            parts.extend_from_slice(&fs::read(live.join(part_name(7, idx))).unwrap());
        }
        assert_eq!(seg, parts);
    }

    #[test]
    fn nothing_written_before_init() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir, false);
        storage.ensure_stream_dirs("teststream").unwrap();
        let mut p = Packager::new(test_config(), &storage, "teststream");
        p.add_video_sample(0, 0, Bytes::from_static(&[1, 2, 3]), true)
            .unwrap();
        p.add_audio_sample(0, Bytes::from_static(&[4])).unwrap();
        p.flush().unwrap();
        let live = storage.stream_dir("teststream");
        assert!(!live.join("init.mp4").exists());
        assert!(!live.join("index.m3u8").exists());
    }

    #[test]
    fn rewind_holds_segments_without_parts() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir, true);
        let mut p = new_packager(&storage);
        feed(&mut p, 0, 6_000);
        p.flush().unwrap();

        let rewind = storage.rewind_dir("teststream");
        assert!(rewind.join("init.mp4").is_file());
        assert!(rewind.join("seg_000001.m4s").is_file());
        let playlist = fs::read_to_string(rewind.join("index.m3u8")).unwrap();
        assert!(!playlist.contains("#EXT-X-PART"));
        assert!(playlist.contains("seg_000001.m4s"));
        // live pruning does not touch the rewind copy
        let live_playlist =
            fs::read_to_string(storage.stream_dir("teststream").join("index.m3u8")).unwrap();
        assert!(live_playlist.contains("#EXT-X-PART-INF"));
    }

    #[test]
    fn video_config_change_resets_with_discontinuity() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir, false);
        let mut p = new_packager(&storage);
        feed(&mut p, 0, 5_000);

        p.update_video_config(&avc_fixture(2)).unwrap();
        feed(&mut p, 5_000, 8_000);
        p.flush().unwrap();

        let live = storage.stream_dir("teststream");
        let playlist = fs::read_to_string(live.join("index.m3u8")).unwrap();
        assert_eq!(playlist.matches("#EXT-X-DISCONTINUITY").count(), 1);
        // sequence numbering continued past the pre-reset maximum
        assert!(playlist.contains("seg_000004.m4s"));
    }

    #[test]
    fn resume_continues_sequence_after_restart() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir, false);
        {
            let mut p = new_packager(&storage);
            feed(&mut p, 0, 4_100);
            p.flush().unwrap();
        }
        let mut p = new_packager(&storage);
        feed(&mut p, 0, 2_100);
        p.flush().unwrap();

        let live = storage.stream_dir("teststream");
        let playlist = fs::read_to_string(live.join("index.m3u8")).unwrap();
        assert!(playlist.contains("#EXT-X-DISCONTINUITY"));
        assert!(playlist.contains("seg_000004.m4s"));
    }

    #[test]
    fn large_dts_jump_forces_reinit() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir, false);
        let mut p = new_packager(&storage);
        feed(&mut p, 0, 3_000);
        // broken timeline: jump 20 s forward
        feed(&mut p, 23_000, 26_000);
        p.flush().unwrap();

        let live = storage.stream_dir("teststream");
        let playlist = fs::read_to_string(live.join("index.m3u8")).unwrap();
        assert!(playlist.contains("#EXT-X-DISCONTINUITY"));
        assert!(live.join("init.mp4").is_file());
    }

    #[test]
    fn audio_only_samples_wait_for_audio_config() {
        let dir = TempDir::new().unwrap();
        let storage = test_storage(&dir, false);
        storage.ensure_stream_dirs("teststream").unwrap();
        let mut p = Packager::new(
            PackagerConfig {
                allow_no_audio: true,
                ..test_config()
            },
            &storage,
            "teststream",
        );
        p.update_video_config(&avc_fixture(1)).unwrap();
        // init exists (video-only), but audio samples are dropped
        p.add_audio_sample(0, Bytes::from_static(&[1])).unwrap();
        for ts in (0..3_000).step_by(33) {
            p.add_video_sample(ts, 0, Bytes::from_static(&[0xaa; 8]), ts == 0)
                .unwrap();
        }
        p.flush().unwrap();
        let live = storage.stream_dir("teststream");
        assert!(live.join("init.mp4").is_file());
        assert!(live.join("seg_000001.m4s").is_file());
    }
}
