use crate::media_group::MediaGroupBuffer;
use anyhow::Result;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperSettings {
    pub interval: Duration,
    pub retention: Duration,
    pub retry_backoff: Duration,
}

impl From<&crate::config::Reaper> for ReaperSettings {
    fn from(cfg: &crate::config::Reaper) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_seconds),
            retention: Duration::from_secs(cfg.retention_seconds),
            retry_backoff: Duration::from_secs(cfg.retry_seconds),
        }
    }
}

/// Evict albums older than `retention` whose finalize never ran. Returns the
/// number of evicted albums.
pub fn sweep(buffer: &MediaGroupBuffer, retention: Duration) -> Result<usize> {
    let mut evicted = buffer.evict_older_than(retention)?;
    for (key, batch) in evicted.iter_mut() {
        batch.cancel_timer();
        warn!(
            user_id = key.user_id,
            group_id = %key.group_id,
            batch = %batch.id,
            items = batch.items.len(),
            age_secs = batch.age().as_secs(),
            "evicted stale album without sending"
        );
    }
    Ok(evicted.len())
}

/// Background loop that periodically sweeps the album buffer.
pub struct Reaper {
    buffer: MediaGroupBuffer,
    settings: ReaperSettings,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    pub fn new(buffer: MediaGroupBuffer, settings: ReaperSettings) -> Self {
        Self {
            buffer,
            settings,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the sweep loop. A second call while the loop is alive does
    /// nothing and returns `false`.
    pub fn start(&self) -> bool {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("album reaper already running");
            return false;
        }
        let buffer = self.buffer.clone();
        let settings = self.settings;
        *handle = Some(tokio::spawn(run(settings, move || {
            let evicted = sweep(&buffer, settings.retention)?;
            debug!(evicted, remaining = buffer.len(), "album sweep finished");
            Ok(evicted)
        })));
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Call `sweep_once` every `interval`. After a failed sweep the next attempt
/// comes after `retry_backoff` instead, then the regular interval resumes.
async fn run<F>(settings: ReaperSettings, mut sweep_once: F)
where
    F: FnMut() -> Result<usize> + Send + 'static,
{
    let mut wait = settings.interval;
    loop {
        tokio::time::sleep(wait).await;
        wait = match sweep_once() {
            Ok(_) => settings.interval,
            Err(err) => {
                error!(?err, retry_in = ?settings.retry_backoff, "album sweep failed");
                settings.retry_backoff
            }
        };
    }
}
