//! Pre-admission stream inspection. Every sample seen before the admission
//! decision feeds this accumulator; once it declares itself final the policy
//! evaluates the result.

use bytes::Bytes;
use std::time::Duration;

use crate::codec::avc::{self, AvcConfig};
use crate::codec::AacConfig;

#[derive(Debug, Clone, Default)]
pub struct InspectResult {
    pub video_codec: String,
    pub audio_codec: String,
    pub width: u32,
    pub height: u32,
    pub video_fps: f64,
    pub profile: u8,
    pub level: u8,
    pub sps: Bytes,
    pub pps: Bytes,
    pub asc: Bytes,
    pub sample_rate: u32,
    pub channels: u8,
    pub gop_seconds: f64,
    pub keyframe_received: bool,
    pub initial_bitrate: i64,
}

#[derive(Debug, Clone)]
pub struct InspectConfig {
    pub first_keyframe_timeout: Duration,
    pub max_inspect_duration: Duration,
    pub allow_no_audio: bool,
    pub bitrate_window: Duration,
}

pub struct Inspector {
    first_keyframe_timeout_ms: i64,
    max_inspect_duration_ms: i64,
    allow_no_audio: bool,
    bitrate_window_ms: i64,

    start_ts_ms: i64,
    started: bool,
    video_config_done: bool,
    audio_config_done: bool,

    last_keyframe_ts: i64,
    keyframes_seen: u32,
    video_frames: u64,
    video_first_ts: i64,
    video_last_ts: i64,

    bitrate_start_ts: i64,
    bitrate_bytes: i64,

    result: InspectResult,
    finalized: bool,
}

impl Inspector {
    pub fn new(cfg: InspectConfig) -> Self {
        Self {
            first_keyframe_timeout_ms: cfg.first_keyframe_timeout.as_millis() as i64,
            max_inspect_duration_ms: cfg.max_inspect_duration.as_millis() as i64,
            allow_no_audio: cfg.allow_no_audio,
            bitrate_window_ms: cfg.bitrate_window.as_millis() as i64,
            start_ts_ms: 0,
            started: false,
            video_config_done: false,
            audio_config_done: false,
            last_keyframe_ts: 0,
            keyframes_seen: 0,
            video_frames: 0,
            video_first_ts: 0,
            video_last_ts: 0,
            bitrate_start_ts: 0,
            bitrate_bytes: 0,
            result: InspectResult::default(),
            finalized: false,
        }
    }

    pub fn on_video_config(&mut self, cfg: &AvcConfig) {
        let (Some(sps), Some(pps)) = (cfg.sps.first(), cfg.pps.first()) else {
            return;
        };
        if let Ok(parsed) = avc::parse_sps(sps) {
            self.result.width = parsed.width;
            self.result.height = parsed.height;
            self.result.profile = parsed.profile_idc;
            self.result.level = parsed.level_idc;
            if parsed.fps > 0.0 && self.result.video_fps == 0.0 {
                self.result.video_fps = parsed.fps;
            }
        }
        self.result.video_codec = "H264".to_string();
        self.result.sps = sps.clone();
        self.result.pps = pps.clone();
        self.video_config_done = true;
    }

    pub fn on_audio_config(&mut self, cfg: &AacConfig) {
        self.result.audio_codec = "AAC".to_string();
        self.result.asc = cfg.asc.clone();
        self.result.sample_rate = cfg.sample_rate;
        self.result.channels = cfg.channels;
        self.audio_config_done = true;
    }

    pub fn on_video_sample(&mut self, ts_ms: i64, data: &[u8], is_key: bool) {
        self.observe_start(ts_ms);
        self.observe_bitrate(ts_ms, data.len() as i64);
        if self.video_frames == 0 {
            self.video_first_ts = ts_ms;
        }
        self.video_last_ts = ts_ms;
        self.video_frames += 1;

        if is_key {
            self.result.keyframe_received = true;
            if self.keyframes_seen > 0 {
                self.result.gop_seconds = (ts_ms - self.last_keyframe_ts) as f64 / 1000.0;
            }
            self.last_keyframe_ts = ts_ms;
            self.keyframes_seen += 1;
        }
        self.maybe_finalize(ts_ms);
    }

    pub fn on_audio_sample(&mut self, ts_ms: i64, data: &[u8]) {
        self.observe_start(ts_ms);
        self.observe_bitrate(ts_ms, data.len() as i64);
        self.maybe_finalize(ts_ms);
    }

    /// FPS reported by the publisher's metadata; only taken when the SPS did
    /// not already provide one.
    pub fn set_video_fps(&mut self, value: f64) {
        if value <= 0.0 {
            return;
        }
        if self.result.video_fps == 0.0 {
            self.result.video_fps = value;
        }
    }

    /// Timeout-driven finalization, called on every sample tick.
    pub fn finalize_if_timeout(&mut self, ts_ms: i64) {
        self.observe_start(ts_ms);
        if self.finalized {
            return;
        }
        if self.first_keyframe_timeout_ms > 0
            && !self.result.keyframe_received
            && ts_ms - self.start_ts_ms >= self.first_keyframe_timeout_ms
        {
            self.finalized = true;
            return;
        }
        if self.max_inspect_duration_ms > 0
            && ts_ms - self.start_ts_ms >= self.max_inspect_duration_ms
        {
            self.finalized = true;
        }
    }

    pub fn result(&mut self) -> Option<InspectResult> {
        if !self.finalized {
            return None;
        }
        if self.result.video_fps == 0.0 {
            self.result.video_fps = self.estimate_fps();
        }
        Some(self.result.clone())
    }

    fn observe_start(&mut self, ts_ms: i64) {
        if self.started {
            return;
        }
        self.started = true;
        self.start_ts_ms = ts_ms;
        self.bitrate_start_ts = ts_ms;
    }

    fn observe_bitrate(&mut self, ts_ms: i64, bytes: i64) {
        if !self.started {
            return;
        }
        self.bitrate_bytes += bytes;
        if self.bitrate_window_ms <= 0 {
            return;
        }
        if ts_ms - self.bitrate_start_ts >= self.bitrate_window_ms {
            let seconds = (ts_ms - self.bitrate_start_ts) as f64 / 1000.0;
            if seconds > 0.0 {
                self.result.initial_bitrate = ((self.bitrate_bytes * 8) as f64 / seconds) as i64;
            }
            self.bitrate_start_ts = ts_ms;
            self.bitrate_bytes = 0;
        }
    }

    fn maybe_finalize(&mut self, ts_ms: i64) {
        if self.finalized || !self.video_config_done {
            return;
        }
        if !self.result.keyframe_received {
            if self.first_keyframe_timeout_ms > 0
                && ts_ms - self.start_ts_ms >= self.first_keyframe_timeout_ms
            {
                self.finalized = true;
            }
            return;
        }
        if !self.audio_config_done && !self.allow_no_audio {
            if self.max_inspect_duration_ms > 0
                && ts_ms - self.start_ts_ms >= self.max_inspect_duration_ms
            {
                self.finalized = true;
            }
            return;
        }
        self.finalized = true;
    }

    fn estimate_fps(&self) -> f64 {
        if self.video_frames < 2 || self.video_last_ts <= self.video_first_ts {
            return 0.0;
        }
        let span = (self.video_last_ts - self.video_first_ts) as f64 / 1000.0;
        (self.video_frames - 1) as f64 / span
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::avc::AvcConfig;
    use bytes::Bytes;

    fn config() -> InspectConfig {
        InspectConfig {
            first_keyframe_timeout: Duration::from_secs(2),
            max_inspect_duration: Duration::from_secs(5),
            allow_no_audio: false,
            bitrate_window: Duration::from_secs(2),
        }
    }

    fn avc_config() -> AvcConfig {
        // any SPS bytes; width/height come out zero when parsing fails,
        // which inspection tolerates
        AvcConfig {
            profile: 66,
            compatibility: 0,
            level: 30,
            length_size: 4,
            sps: vec![Bytes::from_static(&[0x67, 0x42, 0x00, 0x1e])],
            pps: vec![Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80])],
        }
    }

    fn aac_config() -> AacConfig {
        AacConfig::parse(&[0x11, 0x90]).unwrap()
    }

    #[test]
    fn ready_after_configs_and_keyframe() {
        let mut ins = Inspector::new(config());
        ins.on_video_config(&avc_config());
        ins.on_audio_config(&aac_config());
        assert!(ins.result().is_none());
        ins.on_video_sample(0, &[0u8; 100], true);
        let result = ins.result().expect("final");
        assert!(result.keyframe_received);
        assert_eq!(result.video_codec, "H264");
        assert_eq!(result.audio_codec, "AAC");
        assert_eq!(result.sample_rate, 48_000);
    }

    #[test]
    fn keyframe_timeout_finalizes_without_keyframe() {
        let mut ins = Inspector::new(config());
        ins.on_video_config(&avc_config());
        ins.on_video_sample(0, &[0u8; 10], false);
        assert!(ins.result().is_none());
        ins.on_video_sample(2_100, &[0u8; 10], false);
        let result = ins.result().expect("final after timeout");
        assert!(!result.keyframe_received);
    }

    #[test]
    fn timeout_tick_finalizes_without_any_video() {
        let mut ins = Inspector::new(config());
        ins.on_audio_sample(0, &[0u8; 10]);
        ins.finalize_if_timeout(2_500);
        assert!(ins.result().is_some());
    }

    #[test]
    fn gop_measured_between_keyframes() {
        let mut ins = Inspector::new(InspectConfig {
            allow_no_audio: true,
            ..config()
        });
        ins.on_video_config(&avc_config());
        ins.on_video_sample(0, &[0u8; 10], true);
        for i in 1..60 {
            ins.on_video_sample(i * 33, &[0u8; 10], false);
        }
        ins.on_video_sample(60 * 33, &[0u8; 10], true);
        let result = ins.result().unwrap();
        assert!((result.gop_seconds - 1.98).abs() < 0.01);
    }

    #[test]
    fn fps_estimated_from_frame_count() {
        let mut ins = Inspector::new(InspectConfig {
            allow_no_audio: true,
            ..config()
        });
        ins.on_video_config(&avc_config());
        for i in 0..31 {
            ins.on_video_sample(i * 33, &[0u8; 10], i == 0);
        }
        let result = ins.result().unwrap();
        assert!((result.video_fps - 30.3).abs() < 0.5);
    }

    #[test]
    fn metadata_fps_wins_when_sps_has_none() {
        let mut ins = Inspector::new(InspectConfig {
            allow_no_audio: true,
            ..config()
        });
        ins.set_video_fps(60.0);
        ins.on_video_config(&avc_config());
        ins.on_video_sample(0, &[0u8; 10], true);
        assert_eq!(ins.result().unwrap().video_fps, 60.0);
    }

    #[test]
    fn bitrate_window_measures_bits_per_second() {
        let mut ins = Inspector::new(config());
        ins.on_video_sample(0, &[0u8; 125_000], true); // 1 Mbit
        ins.on_video_sample(2_000, &[0u8; 125_000], false);
        // window of exactly 2s closed with 2 Mbit observed
        let mut probe = ins;
        probe.finalize_if_timeout(10_000);
        let result = probe.result();
        // no video config, so finalization came from the timeout tick
        let result = result.expect("finalized");
        assert_eq!(result.initial_bitrate, 1_000_000);
    }
}
