//! Image-prompt derivation from scene revisions
//!
//! Observes the scene store. Each new revision cancels the derivation in
//! flight, describes the scene in prose through the completion transport and
//! asks the image generator for a URL. The empty scene short-circuits to a
//! fixed prompt and placeholder image.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::integration::sinks::{ImageGenerator, PLACEHOLDER_IMAGE_URL};
use crate::llm::prompts::IMAGE_DESCRIPTION_PROMPT;
use crate::llm::transport::{ChatMessage, CompletionRequest, CompletionTransport};
use crate::scene::markup::parse_document;
use crate::scene::store::DocumentStore;
use crate::{Result, StagehandError};

/// Image derivation settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Whether scene revisions produce images at all
    pub enabled: bool,

    /// Prompt used for an empty scene
    pub empty_prompt: String,

    /// Image shown for an empty scene
    pub placeholder_url: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            empty_prompt: "Empty scene".to_string(),
            placeholder_url: PLACEHOLDER_IMAGE_URL.to_string(),
        }
    }
}

/// Image derived from one scene revision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedImage {
    pub revision: u64,
    pub prompt: String,
    pub url: String,
}

/// Whether `content` is an empty `<root_tag>` document
pub fn is_empty_scene(content: &str, root_tag: &str) -> bool {
    match parse_document(content) {
        Ok(root) => root.name == root_tag && root.children.is_empty() && root.attributes.is_empty(),
        Err(_) => false,
    }
}

#[derive(Clone)]
struct Deriver {
    transport: Arc<dyn CompletionTransport>,
    generator: Arc<dyn ImageGenerator>,
    config: ImageConfig,
    root_tag: String,
    /// Last generated (prompt, url), reused for repeated prompts
    last: Arc<Mutex<Option<(String, String)>>>,
    generator_calls: Arc<AtomicU64>,
}

impl Deriver {
    async fn derive(&self, revision: u64, content: &str, cancel: &CancellationToken) -> Result<RenderedImage> {
        if is_empty_scene(content, &self.root_tag) {
            return Ok(RenderedImage {
                revision,
                prompt: self.config.empty_prompt.clone(),
                url: self.config.placeholder_url.clone(),
            });
        }

        let request = CompletionRequest::new(vec![
            ChatMessage::system(IMAGE_DESCRIPTION_PROMPT),
            ChatMessage::user(content),
        ]);
        let prompt = self.transport.complete(request, cancel.clone()).await?;
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(StagehandError::ParseError(
                "scene description came back empty".to_string(),
            ));
        }

        let cached = self
            .last
            .lock()
            .as_ref()
            .filter(|(last_prompt, _)| *last_prompt == prompt)
            .map(|(_, url)| url.clone());
        if let Some(url) = cached {
            debug!(revision, "prompt unchanged, reusing image");
            return Ok(RenderedImage { revision, prompt, url });
        }

        let url = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StagehandError::Cancelled),
            url = self.generator.generate(&prompt) => {
                self.generator_calls.fetch_add(1, Ordering::SeqCst);
                url?
            }
        };
        *self.last.lock() = Some((prompt.clone(), url.clone()));

        Ok(RenderedImage { revision, prompt, url })
    }
}

/// Spawns and owns the derivation observer
pub struct ImagePromptDeriver;

impl ImagePromptDeriver {
    /// Start observing `store` on the current runtime
    pub fn spawn(
        store: &DocumentStore,
        transport: Arc<dyn CompletionTransport>,
        generator: Arc<dyn ImageGenerator>,
        root_tag: impl Into<String>,
        config: ImageConfig,
    ) -> ImageDeriverHandle {
        let (image_tx, image_rx) = watch::channel(None);
        let derivations = Arc::new(AtomicU64::new(0));
        let generator_calls = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();

        let deriver = Deriver {
            transport,
            generator,
            config,
            root_tag: root_tag.into(),
            last: Arc::new(Mutex::new(None)),
            generator_calls: Arc::clone(&generator_calls),
        };

        let task = tokio::spawn(observe(
            store.observe(),
            deriver,
            image_tx,
            Arc::clone(&derivations),
            shutdown.clone(),
        ));

        ImageDeriverHandle {
            images: image_rx,
            derivations,
            generator_calls,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }
}

async fn observe(
    mut scenes: watch::Receiver<crate::scene::store::SharedDocument>,
    deriver: Deriver,
    image_tx: watch::Sender<Option<RenderedImage>>,
    derivations: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    let image_tx = Arc::new(image_tx);
    let latest = Arc::new(AtomicU64::new(0));
    let mut in_flight: Option<CancellationToken> = None;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            changed = scenes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let doc = scenes.borrow_and_update().clone();
        if !deriver.config.enabled {
            continue;
        }

        if let Some(previous) = in_flight.take() {
            previous.cancel();
        }
        let cancel = shutdown.child_token();
        in_flight = Some(cancel.clone());

        let generation = derivations.fetch_add(1, Ordering::SeqCst) + 1;
        latest.store(generation, Ordering::SeqCst);
        debug!(revision = doc.revision, generation, "deriving image prompt");

        let deriver = deriver.clone();
        let image_tx = Arc::clone(&image_tx);
        let latest = Arc::clone(&latest);
        tokio::spawn(async move {
            match deriver.derive(doc.revision, &doc.content, &cancel).await {
                Ok(image) => {
                    if cancel.is_cancelled() || latest.load(Ordering::SeqCst) != generation {
                        debug!(generation, "dropping superseded image");
                        return;
                    }
                    info!(revision = image.revision, url = %image.url, "scene image updated");
                    let _ = image_tx.send(Some(image));
                }
                Err(StagehandError::Cancelled) => debug!(generation, "image derivation cancelled"),
                Err(e) => warn!(generation, error = %e, "image derivation failed"),
            }
        });
    }

    if let Some(previous) = in_flight.take() {
        previous.cancel();
    }
}

/// Handle to the running derivation observer
pub struct ImageDeriverHandle {
    images: watch::Receiver<Option<RenderedImage>>,
    derivations: Arc<AtomicU64>,
    generator_calls: Arc<AtomicU64>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ImageDeriverHandle {
    /// Subscribe to rendered images (latest value replayed)
    pub fn subscribe(&self) -> watch::Receiver<Option<RenderedImage>> {
        let mut rx = self.images.clone();
        rx.mark_changed();
        rx
    }

    pub fn latest(&self) -> Option<RenderedImage> {
        self.images.borrow().clone()
    }

    /// Number of derivations started, one per observed scene revision
    pub fn derivation_count(&self) -> u64 {
        self.derivations.load(Ordering::SeqCst)
    }

    /// Number of image-generator invocations
    pub fn generator_calls(&self) -> u64 {
        self.generator_calls.load(Ordering::SeqCst)
    }

    /// Stop observing and cancel the derivation in flight
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
