//! Per-connection publish session: feeds the inspector until the policy
//! decides, buffering everything seen so far; on accept the buffer drains
//! into the packager and archive recorder and live forwarding begins.

use bytes::Bytes;
use std::sync::Arc;

use crate::archive::recorder::Recorder;
use crate::archive::ArchiveManager;
use crate::codec::avc::AvcConfig;
use crate::codec::AacConfig;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::inspect::{InspectConfig, InspectResult, Inspector};
use crate::packager::{Packager, PackagerConfig};
use crate::policy::{Decision, HttpPolicy};
use crate::rtmp::mask_stream_key;
use crate::storage::Storage;

enum BufferedInput {
    VideoConfig(AvcConfig),
    AudioConfig(AacConfig),
    Video {
        dts_ms: i64,
        cts_ms: i64,
        data: Bytes,
        is_key: bool,
    },
    Audio {
        dts_ms: i64,
        data: Bytes,
    },
}

impl BufferedInput {
    fn timestamp(&self) -> Option<i64> {
        match self {
            BufferedInput::Video { dts_ms, .. } | BufferedInput::Audio { dts_ms, .. } => {
                Some(*dts_ms)
            }
            _ => None,
        }
    }
}

pub struct Session {
    pub stream_key: String,
    pub stream_name: String,

    policy: Arc<HttpPolicy>,
    archive: Option<Arc<ArchiveManager>>,
    recorder: Option<Arc<Recorder>>,

    inspector: Inspector,
    packager: Packager,

    accepted: bool,
    closed: bool,
    video_info_sent: bool,

    buffer: Vec<BufferedInput>,
    buffer_start_ms: i64,
    max_buffer_dur_ms: i64,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &Settings,
        policy: Arc<HttpPolicy>,
        storage: &Storage,
        archive: Option<Arc<ArchiveManager>>,
        stream_key: String,
        stream_name: String,
        enable_rewind: bool,
    ) -> Self {
        let stream_name = if stream_name.is_empty() {
            stream_key.clone()
        } else {
            stream_name
        };
        let mut session_storage = storage.clone();
        session_storage.enable_rewind = storage.enable_rewind && enable_rewind;

        let inspector = Inspector::new(InspectConfig {
            first_keyframe_timeout: settings.policy.first_keyframe_timeout(),
            max_inspect_duration: settings.policy.max_inspect_duration(),
            allow_no_audio: settings.policy.allow_no_audio,
            bitrate_window: settings.policy.initial_bitrate_window(),
        });
        // directories appear lazily on the first atomic write, so a
        // rejected publish leaves nothing behind
        let packager = Packager::new(
            PackagerConfig::from_settings(&settings.hls, settings.policy.allow_no_audio),
            &session_storage,
            &stream_name,
        );

        Self {
            stream_key,
            stream_name,
            policy,
            archive,
            recorder: None,
            inspector,
            packager,
            accepted: false,
            closed: false,
            video_info_sent: false,
            buffer: Vec::new(),
            buffer_start_ms: 0,
            max_buffer_dur_ms: settings.limits.max_buffered_seconds as i64 * 1_000,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub async fn handle_video_config(&mut self, cfg: AvcConfig) -> Result<()> {
        self.inspector.on_video_config(&cfg);
        if self.accepted {
            if let Some(recorder) = &self.recorder {
                recorder.update_video_config(&cfg)?;
            }
            return self.packager.update_video_config(&cfg);
        }
        self.push_buffer(BufferedInput::VideoConfig(cfg))
    }

    pub async fn handle_audio_config(&mut self, cfg: AacConfig) -> Result<()> {
        self.inspector.on_audio_config(&cfg);
        if self.accepted {
            if let Some(recorder) = &self.recorder {
                recorder.update_audio_config(&cfg)?;
            }
            return self.packager.update_audio_config(&cfg);
        }
        self.push_buffer(BufferedInput::AudioConfig(cfg))
    }

    pub async fn handle_video_sample(
        &mut self,
        dts_ms: i64,
        cts_ms: i64,
        data: Bytes,
        is_key: bool,
    ) -> Result<()> {
        self.inspector.on_video_sample(dts_ms, &data, is_key);
        self.inspector.finalize_if_timeout(dts_ms);
        self.try_notify_video_info().await;
        self.maybe_decide()?;
        if self.accepted {
            if let Some(recorder) = &self.recorder {
                recorder.add_video_sample(dts_ms, cts_ms, data.clone(), is_key);
            }
            return self.packager.add_video_sample(dts_ms, cts_ms, data, is_key);
        }
        self.push_buffer(BufferedInput::Video {
            dts_ms,
            cts_ms,
            data,
            is_key,
        })
    }

    pub async fn handle_audio_sample(&mut self, dts_ms: i64, data: Bytes) -> Result<()> {
        self.inspector.on_audio_sample(dts_ms, &data);
        self.inspector.finalize_if_timeout(dts_ms);
        self.try_notify_video_info().await;
        self.maybe_decide()?;
        if self.accepted {
            if let Some(recorder) = &self.recorder {
                recorder.add_audio_sample(dts_ms, data.clone());
            }
            return self.packager.add_audio_sample(dts_ms, data);
        }
        self.push_buffer(BufferedInput::Audio { dts_ms, data })
    }

    pub async fn handle_metadata_fps(&mut self, fps: Option<f64>) {
        if let Some(fps) = fps {
            if fps > 0.0 {
                self.inspector.set_video_fps(fps);
            }
        }
        self.try_notify_video_info().await;
    }

    /// Flush output, release the archive session and tell the admission
    /// service the stream ended. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.accepted {
            if let Err(err) = self.packager.flush() {
                log::warn!("packager flush error: {}", err);
            }
        }
        if let Some(archive) = &self.archive {
            archive.end_session(&self.stream_name);
        }
        if let Err(err) = self.policy.notify_stream_end(&self.stream_key).await {
            log::warn!("stream end notify error: {}", err);
        }
    }

    fn maybe_decide(&mut self) -> Result<()> {
        if self.accepted {
            return Ok(());
        }
        let Some(result) = self.inspector.result() else {
            return Ok(());
        };
        let outcome = self.policy.evaluate(&result);
        match outcome.decision {
            Decision::Reject => {
                log::info!(
                    "stream rejected: stream_key_hash={} reason={}",
                    mask_stream_key(&self.stream_key),
                    outcome.reason
                );
                Err(Error::Rejected {
                    reason: outcome.reason,
                })
            }
            Decision::Accept | Decision::Degraded => {
                log::info!(
                    "stream accepted: stream_key_hash={} decision={:?}",
                    mask_stream_key(&self.stream_key),
                    outcome.decision
                );
                self.accepted = true;
                self.start_archive(&result)?;
                self.drain_buffer()
            }
        }
    }

    async fn try_notify_video_info(&mut self) {
        if self.video_info_sent {
            return;
        }
        let Some(result) = self.inspector.result() else {
            return;
        };
        if result.video_fps <= 0.0 {
            return;
        }
        self.video_info_sent = true;
        if let Err(err) = self.policy.notify_video_info(&self.stream_name, &result).await {
            log::warn!("video info notify error: {}", err);
        }
    }

    fn start_archive(&mut self, result: &InspectResult) -> Result<()> {
        let Some(archive) = &self.archive else {
            return Ok(());
        };
        if self.recorder.is_some() {
            return Ok(());
        }
        self.recorder = archive.start(&self.stream_name, result.initial_bitrate)?;
        Ok(())
    }

    fn push_buffer(&mut self, input: BufferedInput) -> Result<()> {
        if let Some(ts_ms) = input.timestamp() {
            if self.buffer_start_ms == 0 {
                self.buffer_start_ms = ts_ms;
            }
            if self.max_buffer_dur_ms > 0 && ts_ms - self.buffer_start_ms > self.max_buffer_dur_ms {
                return Err(Error::BufferExceeded);
            }
        }
        self.buffer.push(input);
        Ok(())
    }

    /// Replay everything observed pre-admission, configs first in arrival
    /// order, into the packager and (when present) the recorder.
    fn drain_buffer(&mut self) -> Result<()> {
        for input in std::mem::take(&mut self.buffer) {
            match input {
                BufferedInput::VideoConfig(cfg) => {
                    if let Some(recorder) = &self.recorder {
                        recorder.update_video_config(&cfg)?;
                    }
                    self.packager.update_video_config(&cfg)?;
                }
                BufferedInput::AudioConfig(cfg) => {
                    if let Some(recorder) = &self.recorder {
                        recorder.update_audio_config(&cfg)?;
                    }
                    self.packager.update_audio_config(&cfg)?;
                }
                BufferedInput::Video {
                    dts_ms,
                    cts_ms,
                    data,
                    is_key,
                } => {
                    if let Some(recorder) = &self.recorder {
                        recorder.add_video_sample(dts_ms, cts_ms, data.clone(), is_key);
                    }
                    self.packager.add_video_sample(dts_ms, cts_ms, data, is_key)?;
                }
                BufferedInput::Audio { dts_ms, data } => {
                    if let Some(recorder) = &self.recorder {
                        recorder.add_audio_sample(dts_ms, data.clone());
                    }
                    self.packager.add_audio_sample(dts_ms, data)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyRules;
    use std::time::Duration;
    use tempfile::TempDir;

    fn debug_policy(allow_no_audio: bool) -> Arc<HttpPolicy> {
        Arc::new(HttpPolicy::new(
            String::new(),
            String::new(),
            String::new(),
            String::new(),
            Duration::from_secs(1),
            String::new(),
            true,
            PolicyRules {
                max_width: 1920,
                max_height: 1920,
                max_gop_seconds: 10.0,
                allow_no_audio,
                on_gop_too_long: "degraded".to_string(),
                reject_if_video_not_h264: true,
                reject_if_audio_not_aac: true,
            },
        ))
    }

    fn test_settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.storage.root_dir = dir.path().join("live").to_string_lossy().into_owned();
        settings.storage.rewind_root = dir.path().join("rw").to_string_lossy().into_owned();
        settings.storage.enable_rewind = false;
        settings.limits.max_buffered_seconds = 2;
        settings
    }

    fn patient_settings(dir: &TempDir) -> Settings {
        // timeouts far beyond the feed so only the buffer bound can trip
        let mut settings = test_settings(dir);
        settings.policy.first_keyframe_timeout_ms = 60_000;
        settings.policy.max_inspect_duration_ms = 60_000;
        settings
    }

    fn test_storage(settings: &Settings) -> Storage {
        Storage::new(
            settings.storage.root_dir.clone(),
            settings.storage.rewind_root.clone(),
            settings.storage.enable_rewind,
        )
    }

    fn avc_fixture() -> AvcConfig {
        AvcConfig {
            profile: 66,
            compatibility: 0,
            level: 30,
            length_size: 4,
            sps: vec![Bytes::from_static(&[0x67, 0x42, 0x00, 0x1e, 0x01])],
            pps: vec![Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80])],
        }
    }

    #[tokio::test]
    async fn buffer_overflow_errors_out() {
        let dir = TempDir::new().unwrap();
        let settings = patient_settings(&dir);
        let storage = test_storage(&settings);
        let mut session = Session::new(
            &settings,
            debug_policy(false),
            &storage,
            None,
            "key".to_string(),
            "name".to_string(),
            false,
        );
        // no video config arrives, so the session never becomes ready
        let mut outcome = Ok(());
        for ts in (0..4_000).step_by(100) {
            outcome = session
                .handle_audio_sample(ts, Bytes::from_static(&[0u8; 10]))
                .await;
            if outcome.is_err() {
                break;
            }
        }
        assert!(matches!(outcome.unwrap_err(), Error::BufferExceeded));
    }

    #[tokio::test]
    async fn accepts_and_drains_into_packager() {
        let dir = TempDir::new().unwrap();
        let mut settings = test_settings(&dir);
        settings.policy.allow_no_audio = true;
        let storage = test_storage(&settings);
        let mut session = Session::new(
            &settings,
            debug_policy(true),
            &storage,
            None,
            "key".to_string(),
            "name".to_string(),
            false,
        );
        session.handle_video_config(avc_fixture()).await.unwrap();
        for ts in (0..3_000).step_by(33) {
            session
                .handle_video_sample(ts, 0, Bytes::from_static(&[0xaa; 32]), ts % 2_000 == 0)
                .await
                .unwrap();
        }
        assert!(session.is_accepted());
        session.close().await;

        let live = storage.stream_dir("name");
        assert!(live.join("init.mp4").is_file());
        assert!(live.join("seg_000001.m4s").is_file());
    }

    #[tokio::test]
    async fn rejects_when_no_keyframe_before_timeout() {
        let dir = TempDir::new().unwrap();
        let settings = test_settings(&dir);
        let storage = test_storage(&settings);
        let mut session = Session::new(
            &settings,
            debug_policy(true),
            &storage,
            None,
            "key".to_string(),
            "name".to_string(),
            false,
        );
        session.handle_video_config(avc_fixture()).await.unwrap();
        let mut outcome = Ok(());
        for ts in (0..3_000).step_by(33) {
            outcome = session
                .handle_video_sample(ts, 0, Bytes::from_static(&[0xaa; 32]), false)
                .await;
            if outcome.is_err() {
                break;
            }
        }
        match outcome.unwrap_err() {
            Error::Rejected { reason } => assert_eq!(reason, "NO_KEYFRAME_TIMEOUT"),
            other => panic!("unexpected error: {other}"),
        }
        // nothing packaged for a rejected stream
        assert!(!storage.stream_dir("name").join("seg_000001.m4s").exists());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let settings = test_settings(&dir);
        let storage = test_storage(&settings);
        let mut session = Session::new(
            &settings,
            debug_policy(true),
            &storage,
            None,
            "key".to_string(),
            "name".to_string(),
            false,
        );
        session.close().await;
        session.close().await;
    }
}
