//! Multimodal input handling.
//!
//! - [`media`]: media validation and MIME mapping
//! - [`preprocessor`]: placeholder binding and projector embedding

pub mod media;
pub mod preprocessor;

pub use media::{mime_for_path, MediaInput, MediaKind};
pub use preprocessor::{embed, prepare, EmbeddingBlock, PromptChunk, PromptPlan, DEFAULT_MEDIA_MARKER};
