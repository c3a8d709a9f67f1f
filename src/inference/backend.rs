//! Boundary to the native inference library.
//!
//! The session layer never touches weights, kernels or vocabularies. It
//! drives an opaque native library through the [`NativeBackend`] /
//! [`NativeContext`] pair defined here. A context is created once per
//! session and is only ever used from that session's worker thread, so
//! implementations need `Send` but not `Sync`.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::inference::registry::ModelDescriptor;
use crate::multimodal::media::MediaInput;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Unsupported model format: {0}")]
    UnsupportedFormat(String),

    #[error("Out of memory: model needs {0} bytes")]
    OutOfMemory(u64),

    #[error("Context creation failed: {0}")]
    ContextFailed(String),

    #[error("Multimodal projector failed: {0}")]
    ProjectorFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Media encoding failed: {0}")]
    MediaEncode(String),

    #[error("Context is full ({used}/{n_ctx} positions)")]
    ContextFull { used: usize, n_ctx: usize },
}

/// Token ID type.
pub type TokenId = i32;

/// Context construction parameters (mirrors `initContext` options).
#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    /// Path to the model file.
    pub model: PathBuf,

    /// Context size in tokens.
    pub n_ctx: u32,

    /// Number of layers to offload to the GPU (0 = CPU only).
    pub n_gpu_layers: i32,

    /// Create an embedding-only context.
    pub embedding: bool,

    /// Allow shifting the KV cache when the context fills up.
    pub ctx_shift: bool,

    /// Batch size for prompt processing.
    pub n_batch: u32,

    /// Number of threads for computation.
    pub n_threads: u32,
}

impl ContextParams {
    pub fn from_descriptor(descriptor: &ModelDescriptor) -> Self {
        Self {
            model: descriptor.path.clone(),
            n_ctx: descriptor.context_size,
            n_gpu_layers: descriptor.gpu_layers,
            embedding: descriptor.embedding,
            ctx_shift: descriptor.context_shift,
            n_batch: descriptor.n_batch,
            n_threads: descriptor.n_threads,
        }
    }
}

/// Media modalities a loaded projector can encode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultimodalSupport {
    pub vision: bool,
    pub audio: bool,
}

/// Embedding produced by the projector for one media item.
///
/// Occupies `n_tokens` context positions once evaluated.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub n_tokens: usize,
    pub n_embd: usize,
    pub data: Vec<f32>,
}

/// Entry point of the native library: builds contexts.
pub trait NativeBackend: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Load a model and allocate its context.
    fn init_context(&self, params: &ContextParams) -> Result<Box<dyn NativeContext>, BackendError>;
}

/// A loaded model context. Dropping it releases the native resources.
pub trait NativeContext: Send {
    /// Context window in positions.
    fn n_ctx(&self) -> usize;

    /// Chat template embedded in the model metadata, if any.
    fn chat_template(&self) -> Option<String>;

    /// Attach a multimodal projector.
    fn init_multimodal(&mut self, projector: &Path) -> Result<MultimodalSupport, BackendError>;

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, BackendError>;

    /// Evaluate tokens at the end of the KV cache, leaving logits for the last one.
    fn eval_tokens(&mut self, tokens: &[TokenId]) -> Result<(), BackendError>;

    /// Run the projector over raw media bytes.
    fn encode_media(&mut self, media: &MediaInput, bytes: &[u8]) -> Result<Embedding, BackendError>;

    /// Evaluate a media embedding at the end of the KV cache.
    fn eval_embedding(&mut self, embedding: &Embedding) -> Result<(), BackendError>;

    /// Logits of the last evaluated position.
    fn logits(&self) -> &[f32];

    /// Raw bytes of a token's text piece. May be an incomplete UTF-8 sequence.
    fn token_to_piece(&self, token: TokenId) -> Vec<u8>;

    /// End-of-generation token (EOS / EOT).
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Positions currently used in the KV cache.
    fn kv_used(&self) -> usize;

    /// Drop `n_discard` positions after the first `n_keep` and shift the rest down.
    fn kv_shift(&mut self, n_keep: usize, n_discard: usize) -> Result<(), BackendError>;

    /// Truncate the KV cache to the first `n` positions.
    fn kv_truncate(&mut self, n: usize);
}
