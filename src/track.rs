//! Per-track ingest state shared by the live packager and the archive
//! recorder: a one-sample lookahead so every emitted sample carries a real
//! duration.

use bytes::Bytes;

use crate::fmp4::{self, FullSample, TrackSample};

#[derive(Debug, Clone)]
pub struct PendingSample {
    pub dts_ms: i64,
    pub cts_ms: i64,
    pub data: Bytes,
    pub is_key: bool,
}

#[derive(Debug)]
pub struct TrackState {
    pub timescale: u32,
    pub pending: Option<PendingSample>,
    pub last_dur_ms: i64,
    pub default_dur_ms: i64,
    pub last_dts_ms: i64,
    pub has_started: bool,
    pub track_id: u32,
    pub is_video: bool,
}

impl TrackState {
    pub fn new(is_video: bool) -> Self {
        Self {
            timescale: 0,
            pending: None,
            last_dur_ms: 0,
            default_dur_ms: 0,
            last_dts_ms: 0,
            has_started: false,
            track_id: 0,
            is_video,
        }
    }

    /// Clear per-stream progress, keeping the track identity and defaults.
    pub fn clear(&mut self) {
        self.pending = None;
        self.has_started = false;
        self.last_dts_ms = 0;
        self.last_dur_ms = 0;
    }

    /// Duration fallback chain: measured delta, then the last emitted
    /// duration, then the track default, never below 1 ms.
    pub fn pick_duration(&self, delta_ms: i64) -> i64 {
        let mut dur = delta_ms;
        if dur <= 0 {
            dur = self.last_dur_ms;
        }
        if dur <= 0 {
            dur = self.default_dur_ms;
        }
        if dur <= 0 {
            dur = 1;
        }
        dur
    }

    pub fn build_full_sample(&self, sample: &PendingSample, dur_ms: i64) -> TrackSample {
        let flags = if self.is_video {
            if sample.is_key {
                fmp4::SYNC_SAMPLE_FLAGS
            } else {
                fmp4::NON_SYNC_SAMPLE_FLAGS
            }
        } else {
            0
        };
        TrackSample {
            track_id: self.track_id,
            sample: FullSample {
                decode_time: fmp4::ms_to_scale_u64(sample.dts_ms, self.timescale),
                duration: fmp4::ms_to_scale(dur_ms, self.timescale),
                flags,
                cts_offset: fmp4::ms_to_scale_i32(sample.cts_ms, self.timescale),
                data: sample.data.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_fallback_chain() {
        let mut state = TrackState::new(true);
        state.default_dur_ms = 33;
        assert_eq!(state.pick_duration(40), 40);
        assert_eq!(state.pick_duration(0), 33);
        state.last_dur_ms = 20;
        assert_eq!(state.pick_duration(-5), 20);
        state.last_dur_ms = 0;
        state.default_dur_ms = 0;
        assert_eq!(state.pick_duration(0), 1);
    }

    #[test]
    fn video_samples_carry_sync_flags() {
        let mut state = TrackState::new(true);
        state.timescale = 90_000;
        state.track_id = 1;
        let key = state.build_full_sample(
            &PendingSample {
                dts_ms: 1000,
                cts_ms: 33,
                data: Bytes::from_static(b"x"),
                is_key: true,
            },
            33,
        );
        assert_eq!(key.sample.flags, fmp4::SYNC_SAMPLE_FLAGS);
        assert_eq!(key.sample.decode_time, 90_000);
        assert_eq!(key.sample.duration, 2970);
        assert_eq!(key.sample.cts_offset, 2970);

        let inter = state.build_full_sample(
            &PendingSample {
                dts_ms: 1033,
                cts_ms: 0,
                data: Bytes::from_static(b"y"),
                is_key: false,
            },
            33,
        );
        assert_eq!(inter.sample.flags, fmp4::NON_SYNC_SAMPLE_FLAGS);
    }

    #[test]
    fn audio_samples_have_zero_flags() {
        let mut state = TrackState::new(false);
        state.timescale = 48_000;
        state.track_id = 2;
        let s = state.build_full_sample(
            &PendingSample {
                dts_ms: 0,
                cts_ms: 0,
                data: Bytes::from_static(b"a"),
                is_key: false,
            },
            21,
        );
        assert_eq!(s.sample.flags, 0);
    }
}
