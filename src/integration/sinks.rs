//! Narrow interfaces to audio playback and image generation

use async_trait::async_trait;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::Result;

/// Default image shown for an empty scene
pub const PLACEHOLDER_IMAGE_URL: &str = "https://placehold.co/400";

/// Fire-and-forget utterance playback
pub trait AudioSink: Send + Sync {
    /// Queue an utterance; failures are not reported
    fn enqueue(&self, utterance: &str);
}

/// Audio sink handing utterances to a playback worker over a bounded channel
#[derive(Clone)]
pub struct ChannelAudioSink {
    tx: Sender<String>,
}

impl ChannelAudioSink {
    /// Create a sink and the receiver a playback worker drains
    pub fn bounded(capacity: usize) -> (Self, Receiver<String>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AudioSink for ChannelAudioSink {
    fn enqueue(&self, utterance: &str) {
        match self.tx.try_send(utterance.to_string()) {
            Ok(()) => debug!(chars = utterance.len(), "utterance queued for playback"),
            Err(TrySendError::Full(_)) => warn!("playback queue full, dropping utterance"),
            Err(TrySendError::Disconnected(_)) => debug!("playback worker gone, dropping utterance"),
        }
    }
}

/// Audio sink that discards everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn enqueue(&self, _utterance: &str) {}
}

/// Image-generation backend
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generate an image for `prompt` and return its URL
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Generator that always returns a fixed placeholder URL
#[derive(Clone, Debug)]
pub struct PlaceholderImageGenerator {
    url: String,
}

impl PlaceholderImageGenerator {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for PlaceholderImageGenerator {
    fn default() -> Self {
        Self::new(PLACEHOLDER_IMAGE_URL)
    }
}

#[async_trait]
impl ImageGenerator for PlaceholderImageGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        debug!(chars = prompt.len(), "placeholder image requested");
        Ok(self.url.clone())
    }
}
