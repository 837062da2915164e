use anyhow::{Context, Result};
use chrono::Local;
use scuffle_rtmp::ServerSession;
use std::io::Write;
use std::sync::Arc;
use tokio::net::TcpListener;

use hlsgate::archive::ArchiveManager;
use hlsgate::config;
use hlsgate::policy::{HttpPolicy, PolicyRules};
use hlsgate::rtmp::{IngestHandler, StreamManager};
use hlsgate::storage::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Arc::new(config::load());

    let env = env_logger::Env::default()
        .filter_or(env_logger::DEFAULT_FILTER_ENV, settings.log_level.clone());
    env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.module_path().unwrap_or("<unnamed>"),
                &record.args()
            )
        })
        .init();

    let storage = Arc::new(Storage::new(
        settings.storage.root_dir.clone(),
        settings.storage.rewind_root.clone(),
        settings.storage.enable_rewind,
    ));
    let streams = Arc::new(StreamManager::new(
        settings.limits.max_concurrent_streams,
        storage.clone(),
        std::time::Duration::from_secs(settings.limits.cleanup_delay_secs),
    ));
    let policy = Arc::new(HttpPolicy::new(
        settings.auth.auth_url.clone(),
        settings.auth.stream_end_url.clone(),
        settings.auth.api_key.clone(),
        settings.auth.version.clone(),
        settings.auth.auth_timeout(),
        settings.auth.http_user_agent.clone(),
        settings.debug_rtmp,
        PolicyRules {
            max_width: settings.policy.max_width,
            max_height: settings.policy.max_height,
            max_gop_seconds: settings.policy.max_gop_seconds,
            allow_no_audio: settings.policy.allow_no_audio,
            on_gop_too_long: settings.policy.on_gop_too_long.clone(),
            reject_if_video_not_h264: settings.policy.reject_if_video_not_h264,
            reject_if_audio_not_aac: settings.policy.reject_if_audio_not_aac,
        },
    ));
    let archive = settings.archive.enable.then(|| {
        Arc::new(ArchiveManager::new(
            settings.archive.clone(),
            policy.clone(),
            settings.policy.allow_no_audio,
        ))
    });

    let listener = TcpListener::bind(&settings.rtmp.listen_addr)
        .await
        .with_context(|| format!("failed to listen on {}", settings.rtmp.listen_addr))?;
    log::info!("rtmp listening on {}", settings.rtmp.listen_addr);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                log::error!("accept error: {}", err);
                continue;
            }
        };
        log::debug!("new connection from {}", addr);

        let handler = IngestHandler::new(
            settings.clone(),
            policy.clone(),
            storage.clone(),
            streams.clone(),
            archive.clone(),
            addr.ip().to_string(),
        );
        tokio::spawn(async move {
            let session = ServerSession::new(stream, handler);
            if let Err(err) = session.run().await {
                log::debug!("session ended from {}: {:?}", addr, err);
            }
        });
    }
}
