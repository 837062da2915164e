use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Complete server configuration. Every field has a compiled default and can
/// be overridden through a YAML file or `HLSGATE_`-prefixed environment
/// variables (`HLSGATE_POLICY__MAX_WIDTH=1280` etc.).
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub rtmp: RtmpSettings,
    pub policy: PolicySettings,
    pub hls: HlsSettings,
    pub storage: StorageSettings,
    pub limits: LimitsSettings,
    pub auth: AuthSettings,
    pub archive: ArchiveSettings,
    pub log_level: String,
    pub debug_rtmp: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rtmp: RtmpSettings::default(),
            policy: PolicySettings::default(),
            hls: HlsSettings::default(),
            storage: StorageSettings::default(),
            limits: LimitsSettings::default(),
            auth: AuthSettings::default(),
            archive: ArchiveSettings::default(),
            log_level: "info".to_string(),
            debug_rtmp: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RtmpSettings {
    pub listen_addr: String,
    pub app: String,
}

impl Default for RtmpSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1935".to_string(),
            app: "live2".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicySettings {
    pub max_width: u32,
    pub max_height: u32,
    pub first_keyframe_timeout_ms: u64,
    pub max_gop_seconds: f64,
    pub allow_no_audio: bool,
    /// "reject" or "degraded"
    pub on_gop_too_long: String,
    pub reject_if_video_not_h264: bool,
    pub reject_if_audio_not_aac: bool,
    pub max_inspect_duration_ms: u64,
    pub initial_bitrate_window_ms: u64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1920,
            first_keyframe_timeout_ms: 2_000,
            max_gop_seconds: 2.0,
            allow_no_audio: false,
            on_gop_too_long: "degraded".to_string(),
            reject_if_video_not_h264: true,
            reject_if_audio_not_aac: true,
            max_inspect_duration_ms: 5_000,
            initial_bitrate_window_ms: 2_000,
        }
    }
}

impl PolicySettings {
    pub fn first_keyframe_timeout(&self) -> Duration {
        Duration::from_millis(self.first_keyframe_timeout_ms)
    }

    pub fn max_inspect_duration(&self) -> Duration {
        Duration::from_millis(self.max_inspect_duration_ms)
    }

    pub fn initial_bitrate_window(&self) -> Duration {
        Duration::from_millis(self.initial_bitrate_window_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HlsSettings {
    pub segment_duration_ms: u64,
    pub part_duration_ms: u64,
    pub target_duration_ms: u64,
    pub hold_back_ms: u64,
    pub part_hold_back_ms: u64,
    pub keep_segments: usize,
    pub enable_partial: bool,
    pub playlist_name: String,
    pub init_filename: String,
    pub rewind_playlist_name: String,
    pub rewind_window_secs: u64,
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            segment_duration_ms: 2_000,
            part_duration_ms: 200,
            target_duration_ms: 2_000,
            hold_back_ms: 6_000,
            part_hold_back_ms: 1_000,
            keep_segments: 6,
            enable_partial: true,
            playlist_name: "index.m3u8".to_string(),
            init_filename: "init.mp4".to_string(),
            rewind_playlist_name: "index.m3u8".to_string(),
            rewind_window_secs: 3_600,
        }
    }
}

impl HlsSettings {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_duration_ms)
    }

    pub fn part_duration(&self) -> Duration {
        Duration::from_millis(self.part_duration_ms)
    }

    pub fn target_duration(&self) -> Duration {
        Duration::from_millis(self.target_duration_ms)
    }

    pub fn hold_back(&self) -> Duration {
        Duration::from_millis(self.hold_back_ms)
    }

    pub fn part_hold_back(&self) -> Duration {
        Duration::from_millis(self.part_hold_back_ms)
    }

    pub fn rewind_window(&self) -> Duration {
        Duration::from_secs(self.rewind_window_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub root_dir: String,
    pub rewind_root: String,
    pub enable_rewind: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root_dir: "./live-hls".to_string(),
            rewind_root: "./hls_rewind".to_string(),
            enable_rewind: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsSettings {
    pub max_concurrent_streams: usize,
    pub max_buffered_seconds: u64,
    pub cleanup_delay_secs: u64,
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 10,
            max_buffered_seconds: 10,
            cleanup_delay_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    pub auth_url: String,
    pub stream_end_url: String,
    pub api_key: String,
    pub version: String,
    pub auth_timeout_ms: u64,
    pub http_user_agent: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            auth_url: "https://api.tokuly.com/live/checkstream".to_string(),
            stream_end_url: "https://api.tokuly.com/live/endstream".to_string(),
            api_key: String::new(),
            version: "hlsgate/0.1".to_string(),
            auth_timeout_ms: 3_000,
            http_user_agent: "hlsgate/0.1".to_string(),
        }
    }
}

impl AuthSettings {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveSettings {
    pub enable: bool,
    pub root_dir: String,
    pub hls_root_dir: String,
    pub record_dir_template: String,
    pub hls_dir_template: String,
    pub record_filename: String,
    pub ffmpeg_path: String,
    pub reconnect_grace_secs: u64,
    pub fragment_duration_ms: u64,
    pub hls_segment_duration_secs: u64,
    pub low_bitrate_threshold: i64,
    pub max_duration_low_secs: u64,
    pub max_size_high_bytes: i64,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            enable: true,
            root_dir: "./archive".to_string(),
            hls_root_dir: "./archive-hls".to_string(),
            record_dir_template: "{streamName}/{startUTC}".to_string(),
            hls_dir_template: "{streamName}/{startUTC}".to_string(),
            record_filename: "archive.mp4".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            reconnect_grace_secs: 30,
            fragment_duration_ms: 2_000,
            hls_segment_duration_secs: 10,
            low_bitrate_threshold: 12_000_000,
            max_duration_low_secs: 90 * 60,
            max_size_high_bytes: 5 * 1024 * 1024 * 1024,
        }
    }
}

impl ArchiveSettings {
    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }

    pub fn fragment_duration(&self) -> Duration {
        Duration::from_millis(self.fragment_duration_ms)
    }

    pub fn max_duration_low(&self) -> Duration {
        Duration::from_secs(self.max_duration_low_secs)
    }
}

const CONFIG_PATHS: [&str; 3] = [
    "hlsgate.yaml",
    "config/hlsgate.yaml",
    "/etc/hlsgate/conf.yaml",
];

/// Load settings from the first config file found plus environment
/// overrides. Any load or parse failure falls back to compiled defaults.
pub fn load() -> Settings {
    match try_load() {
        Ok(settings) => settings,
        Err(err) => {
            log::warn!("config load failed, using defaults: {}", err);
            Settings::default()
        }
    }
}

fn try_load() -> Result<Settings, config::ConfigError> {
    let mut builder = Config::builder()
        .set_default("log_level", "info")?
        .set_default("debug_rtmp", false)?
        .set_default("rtmp.listen_addr", "0.0.0.0:1935")?
        .set_default("rtmp.app", "live2")?
        .set_default("policy.max_width", 1920)?
        .set_default("policy.max_height", 1920)?
        .set_default("policy.first_keyframe_timeout_ms", 2_000)?
        .set_default("policy.max_gop_seconds", 2.0)?
        .set_default("policy.allow_no_audio", false)?
        .set_default("policy.on_gop_too_long", "degraded")?
        .set_default("policy.reject_if_video_not_h264", true)?
        .set_default("policy.reject_if_audio_not_aac", true)?
        .set_default("policy.max_inspect_duration_ms", 5_000)?
        .set_default("policy.initial_bitrate_window_ms", 2_000)?
        .set_default("hls.segment_duration_ms", 2_000)?
        .set_default("hls.part_duration_ms", 200)?
        .set_default("hls.target_duration_ms", 2_000)?
        .set_default("hls.hold_back_ms", 6_000)?
        .set_default("hls.part_hold_back_ms", 1_000)?
        .set_default("hls.keep_segments", 6)?
        .set_default("hls.enable_partial", true)?
        .set_default("hls.playlist_name", "index.m3u8")?
        .set_default("hls.init_filename", "init.mp4")?
        .set_default("hls.rewind_playlist_name", "index.m3u8")?
        .set_default("hls.rewind_window_secs", 3_600)?
        .set_default("storage.root_dir", "./live-hls")?
        .set_default("storage.rewind_root", "./hls_rewind")?
        .set_default("storage.enable_rewind", true)?
        .set_default("limits.max_concurrent_streams", 10)?
        .set_default("limits.max_buffered_seconds", 10)?
        .set_default("limits.cleanup_delay_secs", 30)?
        .set_default("auth.auth_url", "https://api.tokuly.com/live/checkstream")?
        .set_default("auth.stream_end_url", "https://api.tokuly.com/live/endstream")?
        .set_default("auth.api_key", "")?
        .set_default("auth.version", "hlsgate/0.1")?
        .set_default("auth.auth_timeout_ms", 3_000)?
        .set_default("auth.http_user_agent", "hlsgate/0.1")?
        .set_default("archive.enable", true)?
        .set_default("archive.root_dir", "./archive")?
        .set_default("archive.hls_root_dir", "./archive-hls")?
        .set_default("archive.record_dir_template", "{streamName}/{startUTC}")?
        .set_default("archive.hls_dir_template", "{streamName}/{startUTC}")?
        .set_default("archive.record_filename", "archive.mp4")?
        .set_default("archive.ffmpeg_path", "ffmpeg")?
        .set_default("archive.reconnect_grace_secs", 30)?
        .set_default("archive.fragment_duration_ms", 2_000)?
        .set_default("archive.hls_segment_duration_secs", 10)?
        .set_default("archive.low_bitrate_threshold", 12_000_000)?
        .set_default("archive.max_duration_low_secs", 90 * 60)?
        .set_default("archive.max_size_high_bytes", 5i64 * 1024 * 1024 * 1024)?;

    for path in CONFIG_PATHS {
        if Path::new(path).exists() {
            builder = builder.add_source(File::from(Path::new(path)));
            break;
        }
    }

    builder
        .add_source(Environment::with_prefix("HLSGATE").separator("__"))
        .build()?
        .try_deserialize()
}
