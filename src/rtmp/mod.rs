pub mod handler;
pub mod manager;
pub mod session;

pub use handler::IngestHandler;
pub use manager::StreamManager;
pub use session::Session;

use sha2::{Digest, Sha256};

/// Stream keys are credentials; logs carry a short digest instead.
pub fn mask_stream_key(stream_key: &str) -> String {
    if stream_key.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(stream_key.as_bytes());
    hex::encode(&digest[..4])
}

/// Publishing names may arrive as `name`, `/name/`, or `name?key=value`.
/// The key wins when present; otherwise the path basename is the key.
pub fn sanitize_stream_key(name: &str) -> String {
    let name = name.trim().trim_matches('/');
    if name.is_empty() {
        return String::new();
    }
    let (path, query) = match name.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (name, None),
    };
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                if key == "key" && !value.is_empty() {
                    return value.to_string();
                }
            }
        }
    }
    let base = base_name(path);
    if base == "." || base == ".." {
        return String::new();
    }
    base
}

/// Stream names come from the admission service and become directory
/// names: trim, drop any query, take the basename, refuse dot segments.
pub fn sanitize_stream_name(name: &str) -> String {
    let name = name.trim().trim_matches('/');
    if name.is_empty() {
        return String::new();
    }
    let path = name.split_once('?').map(|(p, _)| p).unwrap_or(name);
    let base = base_name(path);
    if base == "." || base == ".." {
        return String::new();
    }
    base
}

pub fn normalize_app(name: &str) -> String {
    let name = name.trim();
    let name = name.split_once('?').map(|(p, _)| p).unwrap_or(name);
    name.trim_matches('/').to_string()
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}
