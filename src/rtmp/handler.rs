//! Bridge between the RTMP framer and the publish session. The framer
//! owns the wire protocol; this handler validates the publish, runs the
//! admission call and dispatches decoded FLV tags into the session.

use scuffle_rtmp::session::server::{ServerSessionError, SessionData, SessionHandler};
use std::sync::Arc;

use crate::archive::ArchiveManager;
use crate::codec::amf;
use crate::codec::avc::{self, AvcConfig};
use crate::codec::flv::{AacPacketType, AudioTag, AvcPacketType, VideoTag};
use crate::codec::AacConfig;
use crate::config::Settings;
use crate::policy::{Decision, HttpPolicy};
use crate::rtmp::{
    mask_stream_key, normalize_app, sanitize_stream_key, sanitize_stream_name, Session,
    StreamManager,
};
use crate::storage::Storage;

const METADATA_FPS_KEYS: [&str; 3] = ["framerate", "videoframerate", "video_fps"];

pub struct IngestHandler {
    settings: Arc<Settings>,
    policy: Arc<HttpPolicy>,
    storage: Arc<Storage>,
    streams: Arc<StreamManager>,
    archive: Option<Arc<ArchiveManager>>,
    remote_ip: String,
    session: Option<Session>,
}

impl IngestHandler {
    pub fn new(
        settings: Arc<Settings>,
        policy: Arc<HttpPolicy>,
        storage: Arc<Storage>,
        streams: Arc<StreamManager>,
        archive: Option<Arc<ArchiveManager>>,
        remote_ip: String,
    ) -> Self {
        Self {
            settings,
            policy,
            storage,
            streams,
            archive,
            remote_ip,
            session: None,
        }
    }

    /// The framer's error type has no application-level reject variant;
    /// the real reason is logged before this sentinel closes the session.
    fn refuse() -> ServerSessionError {
        ServerSessionError::InvalidChunkSize(0)
    }

    fn validate_app(&self, app: &str) -> bool {
        let expected = normalize_app(&self.settings.rtmp.app);
        if expected.is_empty() {
            return true;
        }
        normalize_app(app) == expected
    }

    async fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
            self.streams
                .remove(&session.stream_key, &session.stream_name);
        }
    }

    async fn handle_video(
        &mut self,
        timestamp: u32,
        data: &[u8],
    ) -> Result<(), ServerSessionError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let tag = match VideoTag::parse(data) {
            Ok(tag) => tag,
            Err(err) => {
                log::warn!("video tag parse error: {}", err);
                return Err(Self::refuse());
            }
        };
        if !tag.is_avc() {
            if self.settings.policy.reject_if_video_not_h264 {
                log::info!("stream rejected: reason=CODEC_UNSUPPORTED");
                return Err(Self::refuse());
            }
            return Ok(());
        }
        let outcome = match tag.packet_type {
            AvcPacketType::SequenceHeader => match AvcConfig::parse(&tag.body) {
                Ok(cfg) => session.handle_video_config(cfg).await,
                Err(err) => Err(err),
            },
            AvcPacketType::NalUnit => {
                let is_key = tag.is_keyframe() || avc::contains_idr(&tag.body);
                session
                    .handle_video_sample(
                        timestamp as i64,
                        tag.composition_time_ms as i64,
                        tag.body,
                        is_key,
                    )
                    .await
            }
            AvcPacketType::EndOfSequence => Ok(()),
        };
        outcome.map_err(|err| {
            log::warn!("publish aborted: {}", err);
            Self::refuse()
        })
    }

    async fn handle_audio(
        &mut self,
        timestamp: u32,
        data: &[u8],
    ) -> Result<(), ServerSessionError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let tag = match AudioTag::parse(data) {
            Ok(tag) => tag,
            Err(err) => {
                log::warn!("audio tag parse error: {}", err);
                return Err(Self::refuse());
            }
        };
        if !tag.is_aac() {
            if self.settings.policy.reject_if_audio_not_aac {
                log::info!("stream rejected: reason=AUDIO_UNSUPPORTED");
                return Err(Self::refuse());
            }
            return Ok(());
        }
        let outcome = match tag.packet_type {
            AacPacketType::SequenceHeader => match AacConfig::parse(&tag.body) {
                Ok(cfg) => session.handle_audio_config(cfg).await,
                Err(err) => Err(err),
            },
            AacPacketType::Raw => session.handle_audio_sample(timestamp as i64, tag.body).await,
        };
        outcome.map_err(|err| {
            log::warn!("publish aborted: {}", err);
            Self::refuse()
        })
    }

    async fn handle_script_data(&mut self, data: &[u8]) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let values = amf::decode_all(data);
        if let Some(meta) = amf::find_metadata(&values) {
            let fps = amf::metadata_number(meta, &METADATA_FPS_KEYS);
            session.handle_metadata_fps(fps).await;
        }
    }
}

impl SessionHandler for IngestHandler {
    async fn on_publish(
        &mut self,
        _stream_id: u32,
        app_name: &str,
        stream_key: &str,
    ) -> Result<(), ServerSessionError> {
        if !self.validate_app(app_name) {
            log::info!("publish refused: invalid app {:?}", normalize_app(app_name));
            return Err(Self::refuse());
        }
        let stream_key = sanitize_stream_key(stream_key);
        if stream_key.is_empty() {
            log::info!("publish refused: empty stream key");
            return Err(Self::refuse());
        }
        if self.session.is_some() {
            log::info!("publish refused: already publishing");
            return Err(Self::refuse());
        }

        let auth = self
            .policy
            .authorize(&stream_key, &self.remote_ip, "", app_name)
            .await;
        if auth.decision == Decision::Reject {
            log::info!(
                "stream rejected: stream_key_hash={} reason={}",
                mask_stream_key(&stream_key),
                auth.reason
            );
            return Err(Self::refuse());
        }

        let mut stream_name = stream_key.clone();
        if !auth.stream_name.is_empty() {
            let sanitized = sanitize_stream_name(&auth.stream_name);
            if !sanitized.is_empty() {
                stream_name = sanitized;
            }
        }
        if self.settings.debug_rtmp {
            stream_name = "rtmp-test".to_string();
        }

        if let Some(archive) = &self.archive {
            if let Err(err) = archive.can_publish(&stream_name) {
                log::info!(
                    "publish refused: stream_key_hash={} err={}",
                    mask_stream_key(&stream_key),
                    err
                );
                return Err(Self::refuse());
            }
        }

        let enable_rewind = self.storage.enable_rewind && auth.allow_rewind.unwrap_or(true);
        let session = Session::new(
            &self.settings,
            self.policy.clone(),
            &self.storage,
            self.archive.clone(),
            stream_key.clone(),
            stream_name.clone(),
            enable_rewind,
        );
        if let Err(err) = self.streams.register(&stream_key, &stream_name) {
            log::info!(
                "publish refused: stream_key_hash={} err={}",
                mask_stream_key(&stream_key),
                err
            );
            return Err(Self::refuse());
        }
        self.session = Some(session);
        log::info!(
            "publish start: stream_key_hash={} app={} remote={}",
            mask_stream_key(&stream_key),
            app_name,
            self.remote_ip
        );
        Ok(())
    }

    async fn on_unpublish(&mut self, _stream_id: u32) -> Result<(), ServerSessionError> {
        self.teardown().await;
        Ok(())
    }

    async fn on_data(&mut self, _stream_id: u32, data: SessionData) -> Result<(), ServerSessionError> {
        match data {
            SessionData::Video { timestamp, data } => self.handle_video(timestamp, &data).await,
            SessionData::Audio { timestamp, data } => self.handle_audio(timestamp, &data).await,
            SessionData::Amf0 { timestamp: _, data } => {
                self.handle_script_data(&data).await;
                Ok(())
            }
        }
    }
}

impl Drop for IngestHandler {
    fn drop(&mut self) {
        // abrupt disconnects skip on_unpublish; finish the close elsewhere
        if let Some(mut session) = self.session.take() {
            let streams = self.streams.clone();
            tokio::spawn(async move {
                let key = session.stream_key.clone();
                let name = session.stream_name.clone();
                session.close().await;
                streams.remove(&key, &name);
            });
        }
    }
}
