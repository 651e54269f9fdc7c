//! Local model settings

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Result, StagehandError};

/// In-situ quantization applied when the model loads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationType {
    None,
    #[default]
    Q4k,
    Q4_0,
    Q8_0,
}

impl QuantizationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantizationType::None => "none",
            QuantizationType::Q4k => "q4k",
            QuantizationType::Q4_0 => "q4_0",
            QuantizationType::Q8_0 => "q8_0",
        }
    }
}

impl fmt::Display for QuantizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantizationType {
    type Err = StagehandError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "f16" => Ok(QuantizationType::None),
            "q4k" => Ok(QuantizationType::Q4k),
            "q4_0" => Ok(QuantizationType::Q4_0),
            "q8_0" => Ok(QuantizationType::Q8_0),
            other => Err(StagehandError::ConfigError(format!(
                "unknown quantization `{}`",
                other
            ))),
        }
    }
}

/// Sampler settings shared by every turn
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        // Low temperature keeps tool arguments well-formed
        Self {
            temperature: 0.3,
            top_p: 0.9,
        }
    }
}

/// Settings for the local completion model (`[llm]` in the config file)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    /// HuggingFace model id or local path; must support tool calls
    pub model_id: String,

    pub quantization: QuantizationType,

    pub sampling: SamplingConfig,

    /// Generation limit for requests that carry none
    pub default_max_tokens: usize,

    /// Paged-attention block size; `None` disables paged attention
    pub paged_attention_block: Option<usize>,

    /// Forward engine logs
    pub engine_logging: bool,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            model_id: "Qwen/Qwen2.5-3B-Instruct".to_string(),
            quantization: QuantizationType::default(),
            sampling: SamplingConfig::default(),
            default_max_tokens: 2048,
            paged_attention_block: Some(32),
            engine_logging: false,
        }
    }
}

impl LLMConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    pub fn with_quantization(mut self, quantization: QuantizationType) -> Self {
        self.quantization = quantization;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, top_p: f32) -> Self {
        self.sampling = SamplingConfig { temperature, top_p };
        self
    }

    pub fn without_paged_attention(mut self) -> Self {
        self.paged_attention_block = None;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(StagehandError::ConfigError(
                "llm.model_id must not be empty".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.sampling.temperature) {
            return Err(StagehandError::ConfigError(format!(
                "llm.sampling.temperature {} is outside 0..=2",
                self.sampling.temperature
            )));
        }
        if !(self.sampling.top_p > 0.0 && self.sampling.top_p <= 1.0) {
            return Err(StagehandError::ConfigError(format!(
                "llm.sampling.top_p {} is outside (0, 1]",
                self.sampling.top_p
            )));
        }
        if self.default_max_tokens == 0 || self.paged_attention_block == Some(0) {
            return Err(StagehandError::ConfigError(
                "llm token and block sizes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LLMConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quantization, QuantizationType::Q4k);
        assert_eq!(config.paged_attention_block, Some(32));
    }

    #[test]
    fn test_quantization_from_str() {
        assert_eq!("Q8_0".parse::<QuantizationType>().unwrap(), QuantizationType::Q8_0);
        assert_eq!("f16".parse::<QuantizationType>().unwrap(), QuantizationType::None);
        assert!("q3".parse::<QuantizationType>().is_err());
    }

    #[test]
    fn test_validate_rejects_sampling_out_of_range() {
        assert!(LLMConfig::default().with_sampling(3.0, 0.9).validate().is_err());
        assert!(LLMConfig::default().with_sampling(0.5, 0.0).validate().is_err());
        assert!(LLMConfig::new(" ").validate().is_err());
    }

    #[test]
    fn test_nested_toml_keeps_defaults() {
        let config: LLMConfig =
            toml::from_str("quantization = \"q4_0\"\n[sampling]\ntemperature = 0.1").unwrap();
        assert_eq!(config.quantization, QuantizationType::Q4_0);
        assert_eq!(config.sampling.temperature, 0.1);
        assert_eq!(config.sampling.top_p, 0.9);
        assert_eq!(config.default_max_tokens, 2048);
    }
}
