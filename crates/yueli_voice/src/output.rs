//! Audio output devices.

use crate::tts::OutputFormat;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AudioError {
    #[error("audio device `{0}` unavailable")]
    DeviceUnavailable(String),
    #[error("playback failed: {0}")]
    Playback(String),
}

/// What to play.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioPayload {
    /// Sound file on disk, e.g. an action's reaction sound.
    File { path: PathBuf, duration: Duration },
    /// Audio already in memory, e.g. one synthesized sentence.
    Encoded {
        label: String,
        bytes: Arc<[u8]>,
        format: OutputFormat,
        duration: Duration,
    },
}

impl AudioPayload {
    pub fn duration(&self) -> Duration {
        match self {
            AudioPayload::File { duration, .. } | AudioPayload::Encoded { duration, .. } => *duration,
        }
    }

    pub fn label(&self) -> String {
        match self {
            AudioPayload::File { path, .. } => path.display().to_string(),
            AudioPayload::Encoded { label, .. } => label.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackHandle(pub u64);

/// A started playback.
#[derive(Debug)]
pub struct Playback {
    pub handle: PlaybackHandle,
    /// Resolves when playback ends on its own. Dropped (resolving to an
    /// error) if the device gives up mid-way.
    pub finished: oneshot::Receiver<()>,
}

/// Output device driven by exactly one router consumer loop.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    fn device(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Start playing `payload` and return without waiting for it to end.
    async fn play(&self, payload: &AudioPayload) -> Result<Playback, AudioError>;

    /// Stop a playback immediately. Unknown or finished handles are ignored.
    async fn stop(&self, handle: PlaybackHandle);
}

/// Device that "plays" each payload by waiting out its duration.
pub struct SimulatedOutput {
    device: String,
    available: AtomicBool,
    next_handle: AtomicU64,
    active: Arc<Mutex<HashMap<PlaybackHandle, oneshot::Sender<()>>>>,
    history: Mutex<Vec<String>>,
}

impl SimulatedOutput {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            available: AtomicBool::new(true),
            next_handle: AtomicU64::new(1),
            active: Arc::new(Mutex::new(HashMap::new())),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Labels of every payload started so far, in order.
    pub async fn history(&self) -> Vec<String> {
        self.history.lock().await.clone()
    }
}

#[async_trait]
impl AudioOutput for SimulatedOutput {
    fn device(&self) -> &str {
        &self.device
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn play(&self, payload: &AudioPayload) -> Result<Playback, AudioError> {
        if !self.is_available() {
            return Err(AudioError::DeviceUnavailable(self.device.clone()));
        }

        let handle = PlaybackHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (done_tx, done_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        self.active.lock().await.insert(handle, stop_tx);

        let label = payload.label();
        tracing::debug!(device = %self.device, handle = handle.0, "Playing {}", label);
        self.history.lock().await.push(label);

        let duration = payload.duration();
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    let _ = done_tx.send(());
                }
                _ = stop_rx => {}
            }
            active.lock().await.remove(&handle);
        });

        Ok(Playback {
            handle,
            finished: done_rx,
        })
    }

    async fn stop(&self, handle: PlaybackHandle) {
        if let Some(stop) = self.active.lock().await.remove(&handle) {
            let _ = stop.send(());
            tracing::debug!(device = %self.device, handle = handle.0, "Playback stopped");
        }
    }
}
