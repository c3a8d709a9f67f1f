//! Runtime configuration for llama-session.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Every knob the demo activities used to hard-code (model paths, context
//! size, stop words, media marker) lives here with a documented default.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::multimodal::preprocessor::DEFAULT_MEDIA_MARKER;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "llama-session",
    about = "Drive a local multimodal LLM session from the command line"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override the model path from the configuration.
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Override the multimodal projector path from the configuration.
    #[arg(long)]
    pub projector: Option<PathBuf>,

    /// Text the built-in scripted backend replies with.
    #[arg(long, default_value = "Once upon a time a brave robot crossed the desert.")]
    pub script: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a chat completion against the text model.
    Chat {
        /// User message (defaults to the demo story prompt).
        #[arg(long)]
        prompt: Option<String>,

        /// Stream tokens as they are generated.
        #[arg(long)]
        stream: bool,
    },

    /// Describe an image or audio clip with the multimodal projector.
    Vision {
        /// Media file to attach.
        media: PathBuf,

        /// Question about the media.
        #[arg(long)]
        prompt: Option<String>,
    },

    /// Resolve the configured model files and print their descriptors.
    Models,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model configuration.
    pub model: ModelConfig,

    /// Text generation defaults.
    pub generation: GenerationConfig,

    /// Multimodal generation defaults.
    pub multimodal: MultimodalConfig,

    /// Chat prompt formatting.
    pub chat: ChatConfig,

    /// Session engine tuning.
    pub session: SessionConfig,
}

/// Model-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to the GGUF model file.
    pub model_path: PathBuf,

    /// Path to the multimodal projector (mmproj) GGUF file.
    pub projector_path: Option<PathBuf>,

    /// Context size in tokens.
    pub context_size: u32,

    /// Number of GPU layers to offload (0 = CPU only).
    pub n_gpu_layers: i32,

    /// Shift the KV cache instead of failing when the context is full.
    /// Multimodal models should keep this off.
    pub context_shift: bool,

    /// Create an embedding-only context.
    pub embedding: bool,

    /// Batch size for prompt processing.
    pub n_batch: u32,

    /// Number of threads for computation.
    pub n_threads: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.gguf"),
            projector_path: None,
            context_size: 2048,
            n_gpu_layers: 0,
            context_shift: true,
            embedding: false,
            n_batch: 512,
            n_threads: 4,
        }
    }
}

/// Sampling defaults for text completions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum tokens to generate.
    pub max_tokens: usize,

    /// Sampling temperature (0.0 = greedy).
    pub temperature: f32,

    /// Nucleus sampling threshold.
    pub top_p: f32,

    /// Stop sequences.
    pub stop: Vec<String>,

    /// Fixed RNG seed (random when unset).
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            temperature: 0.7,
            top_p: 0.95,
            stop: vec!["</s>".to_string(), "\n".to_string()],
            seed: None,
        }
    }
}

/// Defaults for completions that carry media.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultimodalConfig {
    /// Marker replaced by each media embedding, in order.
    pub media_marker: String,

    /// Maximum tokens to generate.
    pub max_tokens: usize,

    /// Sampling temperature.
    pub temperature: f32,

    /// Stop sequences.
    pub stop: Vec<String>,
}

impl Default for MultimodalConfig {
    fn default() -> Self {
        Self {
            media_marker: DEFAULT_MEDIA_MARKER.to_string(),
            max_tokens: 100,
            temperature: 0.1,
            stop: vec![
                "</s>".to_string(),
                "\n".to_string(),
                "User:".to_string(),
                "<end_of_utterance>".to_string(),
            ],
        }
    }
}

/// Chat formatting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// System prompt prepended to demo conversations.
    pub system_prompt: String,

    /// Template used when the model carries none (ChatML when unset).
    pub template: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful assistant.".to_string(),
            template: None,
        }
    }
}

/// Per-session engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Prompt positions preserved when the KV cache is shifted.
    pub n_keep: usize,

    /// Reuse the common token prefix of consecutive text prompts.
    pub prompt_cache: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            n_keep: 0,
            prompt_cache: true,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(model) = &cli.model {
            self.model.model_path = model.clone();
        }
        if let Some(projector) = &cli.projector {
            self.model.projector_path = Some(projector.clone());
        }
    }
}
