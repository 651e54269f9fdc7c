//! Configuration for the whole pipeline
//!
//! Every section has defaults; a TOML file may override any subset.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::integration::coordinator::PipelineConfig;
use crate::integration::image::ImageConfig;
use crate::llm::config::LLMConfig;
use crate::llm::prompts::DEFAULT_DIALOGUE_REQUIREMENT;
use crate::{Result, StagehandError};

/// Scene slot settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Required root element of every scene document
    pub root_tag: String,

    /// Document the store starts with
    pub initial_document: String,

    /// Generation limit for scene turns (model default when unset)
    pub max_tokens: Option<usize>,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            root_tag: "scene".to_string(),
            initial_document: "<scene></scene>".to_string(),
            max_tokens: None,
        }
    }
}

/// Dialogue slot settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Requirement used when a simulation is triggered without one
    pub default_requirement: String,

    /// Generation limit for dialogue turns
    pub max_tokens: usize,

    /// Utterances buffered for the playback worker
    pub audio_queue_size: usize,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            default_requirement: DEFAULT_DIALOGUE_REQUIREMENT.to_string(),
            max_tokens: 4000,
            audio_queue_size: 64,
        }
    }
}

/// Configuration for the complete pipeline
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagehandConfig {
    pub llm: LLMConfig,
    pub scene: SceneConfig,
    pub dialogue: DialogueConfig,
    pub image: ImageConfig,
    pub pipeline: PipelineConfig,
}

impl StagehandConfig {
    /// Default config file location (`<config dir>/stagehand/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("stagehand").join("config.toml"))
    }

    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text).map_err(|e| {
            StagehandError::ConfigError(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load the default config file, or defaults when it does not exist
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn with_llm(mut self, llm: LLMConfig) -> Self {
        self.llm = llm;
        self
    }

    pub fn with_root_tag(mut self, root_tag: impl Into<String>) -> Self {
        let root_tag = root_tag.into();
        self.scene.initial_document = format!("<{0}></{0}>", root_tag);
        self.scene.root_tag = root_tag;
        self
    }

    /// Disable image derivation
    pub fn without_images(mut self) -> Self {
        self.image.enabled = false;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.llm.validate()?;
        if self.scene.root_tag.trim().is_empty() {
            return Err(StagehandError::ConfigError(
                "scene.root_tag must not be empty".to_string(),
            ));
        }
        if !self
            .scene
            .initial_document
            .trim_start()
            .starts_with(&format!("<{}", self.scene.root_tag))
        {
            return Err(StagehandError::ConfigError(format!(
                "scene.initial_document must start with <{}>",
                self.scene.root_tag
            )));
        }
        if self.scene.max_tokens == Some(0) || self.dialogue.max_tokens == 0 {
            return Err(StagehandError::ConfigError(
                "token limits must be greater than zero".to_string(),
            ));
        }
        if self.dialogue.audio_queue_size == 0 || self.pipeline.event_capacity == 0 {
            return Err(StagehandError::ConfigError(
                "buffer sizes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
