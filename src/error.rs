use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad avc config: {0}")]
    BadAvcConfig(&'static str),

    #[error("bad aac config: {0}")]
    BadAacConfig(&'static str),

    #[error("unauthorized")]
    Unauthorized,

    #[error("max concurrent streams reached")]
    ConcurrencyLimit,

    #[error("stream key already publishing")]
    KeyAlreadyPublishing,

    #[error("archive busy")]
    ArchiveBusy,

    #[error("archive already active")]
    ArchiveActive,

    #[error("archive append not possible")]
    AppendNotPossible,

    #[error("admission buffer exceeded")]
    BufferExceeded,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("transcode failed: {0}")]
    TranscodeFailed(String),

    #[error("stream rejected: {reason}")]
    Rejected { reason: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
