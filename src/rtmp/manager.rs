//! Registry of live publishers. Bounds concurrency, refuses duplicate
//! stream keys, and sweeps stream directories a while after the last
//! session for a key went away (unless the key came back).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::rtmp::mask_stream_key;
use crate::storage::Storage;

struct Inner {
    sessions: HashMap<String, String>,
    cleanup_timers: HashMap<String, JoinHandle<()>>,
}

pub struct StreamManager {
    inner: Mutex<Inner>,
    max_concurrent: usize,
    cleanup_delay: Duration,
    storage: Arc<Storage>,
}

impl StreamManager {
    pub fn new(max_concurrent: usize, storage: Arc<Storage>, cleanup_delay: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                cleanup_timers: HashMap::new(),
            }),
            max_concurrent,
            cleanup_delay,
            storage,
        }
    }

    pub fn register(&self, stream_key: &str, stream_name: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("stream manager lock");
        if inner.sessions.contains_key(stream_key) {
            return Err(Error::KeyAlreadyPublishing);
        }
        if self.max_concurrent > 0 && inner.sessions.len() >= self.max_concurrent {
            return Err(Error::ConcurrencyLimit);
        }
        inner
            .sessions
            .insert(stream_key.to_string(), stream_name.to_string());
        if let Some(timer) = inner.cleanup_timers.remove(stream_key) {
            timer.abort();
        }
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("stream manager lock").sessions.len()
    }

    /// Drop a session and arm the delayed directory sweep for its name.
    pub fn remove(self: &Arc<Self>, stream_key: &str, stream_name: &str) {
        if stream_key.is_empty() {
            return;
        }
        let stream_name = if stream_name.is_empty() {
            stream_key
        } else {
            stream_name
        };
        let mut inner = self.inner.lock().expect("stream manager lock");
        inner.sessions.remove(stream_key);
        if self.cleanup_delay.is_zero() {
            return;
        }
        if let Some(timer) = inner.cleanup_timers.remove(stream_key) {
            timer.abort();
        }
        let manager = Arc::clone(self);
        let key = stream_key.to_string();
        let name = stream_name.to_string();
        let delay = self.cleanup_delay;
        inner.cleanup_timers.insert(
            key.clone(),
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                manager.cleanup_if_inactive(&key, &name);
            }),
        );
    }

    fn cleanup_if_inactive(&self, stream_key: &str, stream_name: &str) {
        {
            let mut inner = self.inner.lock().expect("stream manager lock");
            inner.cleanup_timers.remove(stream_key);
            if inner.sessions.contains_key(stream_key) {
                return;
            }
        }
        if let Err(err) = self.storage.remove_stream_dirs(stream_name) {
            log::warn!(
                "cleanup error: stream_key_hash={} err={}",
                mask_stream_key(stream_key),
                err
            );
        }
    }
}
