//! Composition root
//!
//! Wires the scene slot, the dialogue slot and image derivation around one
//! completion transport: text/voice -> scene turn -> scene store -> image,
//! and simulate -> dialogue turn -> audio sink + transcript store.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::integration::config::StagehandConfig;
use crate::integration::coordinator::{
    PipelineCoordinator, PipelineEvent, PipelineHandle, SlotStatus, TriggerSender,
};
use crate::integration::image::{ImageDeriverHandle, ImagePromptDeriver, RenderedImage};
use crate::integration::planner::{DialoguePlanner, ScenePlanner};
use crate::integration::queue::TriggerSource;
use crate::integration::sinks::{AudioSink, ImageGenerator, NullAudioSink, PlaceholderImageGenerator};
use crate::llm::transport::CompletionTransport;
use crate::scene::store::{DocumentStore, SharedDocument};
use crate::tools::dispatcher::ToolDispatcher;
use crate::Result;

/// Configured but not yet running pipeline
pub struct Stagehand {
    config: StagehandConfig,
    transport: Arc<dyn CompletionTransport>,
    audio: Arc<dyn AudioSink>,
    images: Arc<dyn ImageGenerator>,
    scene: DocumentStore,
    transcript: DocumentStore,
}

impl Stagehand {
    pub fn builder(transport: Arc<dyn CompletionTransport>) -> StagehandBuilder {
        StagehandBuilder::new(transport)
    }

    /// Scene store, usable before the pipeline starts
    pub fn scene_store(&self) -> &DocumentStore {
        &self.scene
    }

    /// Spawn every slot on the current runtime
    pub fn start(self) -> StagehandHandle {
        let config = &self.config;

        let scene_planner = ScenePlanner::new(ToolDispatcher::new(config.scene.root_tag.clone()))
            .with_max_tokens(config.scene.max_tokens);
        let scene = PipelineCoordinator::spawn(
            scene_planner,
            Arc::clone(&self.transport),
            self.scene.clone(),
            &config.pipeline,
        );

        let dialogue_planner = DialoguePlanner::new(self.scene.clone(), Arc::clone(&self.audio))
            .with_default_requirement(config.dialogue.default_requirement.clone())
            .with_max_tokens(config.dialogue.max_tokens);
        let dialogue = PipelineCoordinator::spawn(
            dialogue_planner,
            Arc::clone(&self.transport),
            self.transcript.clone(),
            &config.pipeline,
        );

        let images = ImagePromptDeriver::spawn(
            &self.scene,
            Arc::clone(&self.transport),
            Arc::clone(&self.images),
            config.scene.root_tag.clone(),
            config.image.clone(),
        );

        info!("Stagehand pipeline started");

        StagehandHandle {
            scene,
            dialogue,
            images,
            scene_store: self.scene,
            transcript_store: self.transcript,
        }
    }
}

/// Builder for [`Stagehand`]
pub struct StagehandBuilder {
    config: StagehandConfig,
    transport: Arc<dyn CompletionTransport>,
    audio: Option<Arc<dyn AudioSink>>,
    images: Option<Arc<dyn ImageGenerator>>,
}

impl StagehandBuilder {
    pub fn new(transport: Arc<dyn CompletionTransport>) -> Self {
        Self {
            config: StagehandConfig::default(),
            transport,
            audio: None,
            images: None,
        }
    }

    /// Set the complete configuration
    pub fn with_config(mut self, config: StagehandConfig) -> Self {
        self.config = config;
        self
    }

    /// Send dialogue utterances to `sink` (discarded by default)
    pub fn with_audio_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.audio = Some(sink);
        self
    }

    /// Generate scene images with `generator` (placeholder by default)
    pub fn with_image_generator(mut self, generator: Arc<dyn ImageGenerator>) -> Self {
        self.images = Some(generator);
        self
    }

    /// Validate the configuration and create the stores
    pub fn build(self) -> Result<Stagehand> {
        self.config.validate()?;

        let images = self.images.unwrap_or_else(|| {
            Arc::new(PlaceholderImageGenerator::new(
                self.config.image.placeholder_url.clone(),
            ))
        });

        Ok(Stagehand {
            scene: DocumentStore::new(self.config.scene.initial_document.clone()),
            transcript: DocumentStore::new(String::new()),
            audio: self.audio.unwrap_or_else(|| Arc::new(NullAudioSink)),
            images,
            transport: self.transport,
            config: self.config,
        })
    }
}

/// Handle to the running pipeline
pub struct StagehandHandle {
    scene: PipelineHandle,
    dialogue: PipelineHandle,
    images: ImageDeriverHandle,
    scene_store: DocumentStore,
    transcript_store: DocumentStore,
}

impl StagehandHandle {
    /// Submit typed text to the scene slot
    pub fn submit_text(&self, text: impl Into<String>) -> Result<bool> {
        self.scene.submit(text, TriggerSource::Text)
    }

    /// Submit recognized speech to the scene slot
    pub fn submit_voice(&self, text: impl Into<String>) -> Result<bool> {
        self.scene.submit(text, TriggerSource::Voice)
    }

    /// Trigger source for a speech-recognition stream
    pub fn voice_trigger(&self) -> TriggerSender {
        self.scene.trigger_sender(TriggerSource::Voice)
    }

    /// Start a simulated dialogue; a blank requirement uses the configured default
    pub fn simulate(&self, requirement: impl Into<String>) -> Result<bool> {
        self.dialogue.submit(requirement, TriggerSource::Button)
    }

    /// Cancel the active scene and dialogue turns
    pub fn stop(&self) -> Result<()> {
        self.scene.cancel()?;
        self.dialogue.cancel()
    }

    pub fn scene(&self) -> SharedDocument {
        self.scene_store.current()
    }

    pub fn transcript(&self) -> SharedDocument {
        self.transcript_store.current()
    }

    pub fn scene_store(&self) -> &DocumentStore {
        &self.scene_store
    }

    pub fn observe_scene(&self) -> watch::Receiver<SharedDocument> {
        self.scene_store.observe()
    }

    pub fn observe_transcript(&self) -> watch::Receiver<SharedDocument> {
        self.transcript_store.observe()
    }

    pub fn observe_images(&self) -> watch::Receiver<Option<RenderedImage>> {
        self.images.subscribe()
    }

    pub fn scene_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.scene.subscribe()
    }

    pub fn dialogue_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.dialogue.subscribe()
    }

    pub fn scene_status(&self) -> SlotStatus {
        self.scene.status()
    }

    pub fn dialogue_status(&self) -> SlotStatus {
        self.dialogue.status()
    }

    pub fn images(&self) -> &ImageDeriverHandle {
        &self.images
    }

    pub fn scene_pipeline(&self) -> &PipelineHandle {
        &self.scene
    }

    pub fn dialogue_pipeline(&self) -> &PipelineHandle {
        &self.dialogue
    }

    /// Stop every slot and the image observer
    pub async fn shutdown(&self) {
        self.scene.shutdown().await;
        self.dialogue.shutdown().await;
        self.images.shutdown().await;
        info!("Stagehand pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedTransport;
    use crate::StagehandError;

    fn transport() -> Arc<dyn CompletionTransport> {
        Arc::new(ScriptedTransport::new())
    }

    #[test]
    fn test_builder_validates_config() {
        let mut config = StagehandConfig::default();
        config.scene.root_tag = String::new();

        let result = Stagehand::builder(transport()).with_config(config).build();
        assert!(matches!(result, Err(StagehandError::ConfigError(_))));
    }

    #[test]
    fn test_builder_creates_initial_scene() {
        let stagehand = Stagehand::builder(transport())
            .with_config(StagehandConfig::default().with_root_tag("stage"))
            .build()
            .unwrap();
        assert_eq!(stagehand.scene_store().content(), "<stage></stage>");
        assert_eq!(stagehand.scene_store().revision(), 0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let handle = Stagehand::builder(transport())
            .with_config(StagehandConfig::default().without_images())
            .build()
            .unwrap()
            .start();

        assert!(!handle.submit_text("   ").unwrap());
        assert_eq!(handle.scene().content, "<scene></scene>");
        assert!(handle.transcript().content.is_empty());
        handle.shutdown().await;
        assert!(handle.submit_text("after shutdown").is_err());
    }
}
