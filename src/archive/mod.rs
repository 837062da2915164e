//! Per-stream archive lifecycle. The manager owns recorders across
//! publisher reconnects: a disconnect arms a grace timer, a re-publish
//! within the grace resumes the same recorder, and expiry finalizes the
//! archive and converts it to VOD HLS with ffmpeg.

pub mod recorder;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::config::ArchiveSettings;
use crate::error::{Error, Result};
use crate::policy::HttpPolicy;
use recorder::{Recorder, RecorderConfig};

struct ArchiveState {
    record_dir: PathBuf,
    record_path: PathBuf,
    hls_dir: PathBuf,
    recorder: Option<Arc<Recorder>>,
    active: bool,
    closing: bool,
    finalizing: bool,
    converting: bool,
    timer: Option<JoinHandle<()>>,
}

pub struct ArchiveManager {
    cfg: ArchiveSettings,
    policy: Arc<HttpPolicy>,
    allow_no_audio: bool,
    states: Mutex<HashMap<String, ArchiveState>>,
}

impl ArchiveManager {
    pub fn new(cfg: ArchiveSettings, policy: Arc<HttpPolicy>, allow_no_audio: bool) -> Self {
        Self {
            cfg,
            policy,
            allow_no_audio,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enable
    }

    /// Gate a new publish: a stream whose archive is being finalized or
    /// converted is busy, one with an active recording is already live.
    pub fn can_publish(&self, stream_name: &str) -> Result<()> {
        if !self.enabled() || stream_name.is_empty() {
            return Ok(());
        }
        let states = self.states.lock().expect("archive state lock");
        match states.get(stream_name) {
            None => Ok(()),
            Some(state) if state.finalizing || state.converting => Err(Error::ArchiveBusy),
            Some(state) if state.active => Err(Error::ArchiveActive),
            Some(_) => Ok(()),
        }
    }

    /// Start (or resume) recording for a stream. Within the reconnect grace
    /// the existing recorder is reused; otherwise stale state is cleared and
    /// a fresh recorder created under freshly rendered directories.
    pub fn start(
        self: &Arc<Self>,
        stream_name: &str,
        bitrate: i64,
    ) -> Result<Option<Arc<Recorder>>> {
        if !self.enabled() || stream_name.is_empty() {
            return Ok(None);
        }
        {
            let mut states = self.states.lock().expect("archive state lock");
            if let Some(state) = states.get_mut(stream_name) {
                if state.finalizing || state.converting {
                    return Err(Error::ArchiveBusy);
                }
                if state.active {
                    return Err(Error::ArchiveActive);
                }
                if state.closing {
                    if let Some(timer) = state.timer.take() {
                        timer.abort();
                    }
                    state.closing = false;
                    state.active = true;
                    let recorder = state.recorder.clone();
                    drop(states);
                    if let Some(recorder) = &recorder {
                        recorder.start_session();
                        recorder.set_bitrate(bitrate);
                    }
                    return Ok(recorder);
                }
                // finished state left behind: clear its directories
                remove_dir_logged(&state.record_dir);
                remove_dir_logged(&state.hls_dir);
                states.remove(stream_name);
            } else {
                if self.cfg.record_dir_template.contains("{streamName}") {
                    remove_dir_logged(&Path::new(&self.cfg.root_dir).join(stream_name));
                }
                if self.cfg.hls_dir_template.contains("{streamName}") {
                    remove_dir_logged(&Path::new(&self.cfg.hls_root_dir).join(stream_name));
                }
            }
        }

        if self.cfg.root_dir.is_empty() || self.cfg.hls_root_dir.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "archive root dir empty",
            )));
        }
        if self.cfg.record_filename.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "archive record filename empty",
            )));
        }

        let start = Utc::now();
        let record_dir = Path::new(&self.cfg.root_dir).join(render_template(
            &self.cfg.record_dir_template,
            stream_name,
            start,
        ));
        let hls_dir = Path::new(&self.cfg.hls_root_dir).join(render_template(
            &self.cfg.hls_dir_template,
            stream_name,
            start,
        ));
        std::fs::create_dir_all(&record_dir)?;
        let record_path = record_dir.join(&self.cfg.record_filename);
        let recorder = Arc::new(Recorder::new(
            RecorderConfig {
                fragment_duration: self.cfg.fragment_duration(),
                low_bitrate_threshold: self.cfg.low_bitrate_threshold,
                max_duration_low: self.cfg.max_duration_low(),
                max_size_high_bytes: self.cfg.max_size_high_bytes,
                allow_no_audio: self.allow_no_audio,
            },
            &record_path,
        )?);
        recorder.start_session();
        recorder.set_bitrate(bitrate);

        let mut states = self.states.lock().expect("archive state lock");
        states.insert(
            stream_name.to_string(),
            ArchiveState {
                record_dir,
                record_path,
                hls_dir,
                recorder: Some(recorder.clone()),
                active: true,
                closing: false,
                finalizing: false,
                converting: false,
                timer: None,
            },
        );
        Ok(Some(recorder))
    }

    /// Publisher went away: flush, then either finalize immediately or give
    /// a reconnect the grace window to resume.
    pub fn end_session(self: &Arc<Self>, stream_name: &str) {
        if !self.enabled() || stream_name.is_empty() {
            return;
        }
        let grace = self.cfg.reconnect_grace();
        let recorder = {
            let mut states = self.states.lock().expect("archive state lock");
            let Some(state) = states.get_mut(stream_name) else {
                return;
            };
            if state.closing || state.finalizing || state.converting {
                return;
            }
            state.active = false;
            state.closing = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            if !grace.is_zero() {
                let manager = Arc::clone(self);
                let name = stream_name.to_string();
                state.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    manager.finalize(&name).await;
                }));
            }
            state.recorder.clone()
        };

        if let Some(recorder) = recorder {
            recorder.flush();
        }
        if grace.is_zero() {
            let manager = Arc::clone(self);
            let name = stream_name.to_string();
            tokio::spawn(async move {
                manager.finalize(&name).await;
            });
        }
    }

    /// Close the recorder, convert the archive to VOD HLS and report the
    /// outcome. State phases keep concurrent publishes out until done.
    pub async fn finalize(self: &Arc<Self>, stream_name: &str) {
        if !self.enabled() || stream_name.is_empty() {
            return;
        }
        let (recorder, record_path, hls_dir) = {
            let mut states = self.states.lock().expect("archive state lock");
            let Some(state) = states.get_mut(stream_name) else {
                return;
            };
            if state.finalizing || state.converting {
                return;
            }
            state.closing = false;
            state.finalizing = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            (
                state.recorder.clone(),
                state.record_path.clone(),
                state.hls_dir.clone(),
            )
        };

        if let Some(recorder) = &recorder {
            recorder.close();
        }

        {
            let mut states = self.states.lock().expect("archive state lock");
            let Some(state) = states.get_mut(stream_name) else {
                return;
            };
            state.converting = true;
        }

        let result = self.convert_to_hls(&record_path, &hls_dir).await;
        if let Err(err) = &result {
            log::error!("archive convert error: stream={} err={}", stream_name, err);
        }
        if let Err(err) = self
            .policy
            .notify_archive_status(stream_name, result.is_ok())
            .await
        {
            log::warn!("archive status notify error: stream={} err={}", stream_name, err);
        }

        let mut states = self.states.lock().expect("archive state lock");
        if let Some(state) = states.get_mut(stream_name) {
            state.finalizing = false;
            state.converting = false;
            state.recorder = None;
        }
    }

    async fn convert_to_hls(&self, record_path: &Path, hls_dir: &Path) -> Result<()> {
        let info = std::fs::metadata(record_path)?;
        if info.len() == 0 {
            return Err(Error::TranscodeFailed("archive empty".to_string()));
        }
        match std::fs::remove_dir_all(hls_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        std::fs::create_dir_all(hls_dir)?;

        let segment_pattern = hls_dir.join("segment_%06d.m4s");
        let out_playlist = hls_dir.join("index.m3u8");
        let hls_time = self.cfg.hls_segment_duration_secs.to_string();
        let output = tokio::process::Command::new(&self.cfg.ffmpeg_path)
            .arg("-hide_banner")
            .arg("-y")
            .arg("-i")
            .arg(record_path)
            .args(["-map", "0:v:0", "-map", "0:a:0?"])
            .args(["-c:v", "copy", "-c:a", "copy"])
            .args(["-f", "hls"])
            .args(["-hls_time", hls_time.as_str()])
            .args(["-hls_list_size", "0"])
            .args([
                "-hls_flags",
                "program_date_time+independent_segments+round_durations",
            ])
            .args(["-hls_segment_type", "fmp4"])
            .arg("-hls_segment_filename")
            .arg(&segment_pattern)
            .arg(&out_playlist)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::TranscodeFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    #[cfg(test)]
    fn state_flags(&self, stream_name: &str) -> Option<(bool, bool, bool, bool)> {
        let states = self.states.lock().expect("archive state lock");
        states
            .get(stream_name)
            .map(|s| (s.active, s.closing, s.finalizing, s.converting))
    }
}

fn remove_dir_logged(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("archive cleanup error: dir={} err={}", dir.display(), err),
    }
}

fn render_template(template: &str, stream_name: &str, start: DateTime<Utc>) -> String {
    let template = if template.is_empty() {
        "{streamName}/{startUTC}"
    } else {
        template
    };
    let start_utc = start.format("%Y%m%dT%H%M%SZ").to_string();
    template
        .replace("{streamName}", stream_name)
        .replace("{startUTC}", &start_utc)
}
