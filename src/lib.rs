//! llama-session: local multimodal LLM inference sessions.
//!
//! Drives an opaque llama.cpp-style native library safely:
//!   model files -> [`ModelRegistry`] -> [`Session`] (one context, one worker
//!   thread) -> one generation at a time through the decode loop
//!
//! Image and audio inputs are embedded by the multimodal projector and
//! interleaved with the prompt at media markers.

pub mod chat;
pub mod config;
pub mod error;
pub mod inference;
pub mod manager;
pub mod multimodal;
pub mod notify;
pub mod session;

pub use chat::{ChatMessage, ChatTemplate, ContentPart, MessageContent, Role};
pub use error::{ErrorKind, Result, SessionError};
pub use inference::backend::{NativeBackend, NativeContext};
pub use inference::engine::{GenerationRequest, GenerationResult, StopReason, StreamToken, Timings};
pub use inference::registry::{ModelDescriptor, ModelRegistry};
pub use manager::SessionManager;
pub use notify::{ChannelNotifier, Notifier, SessionEvent, TracingNotifier};
pub use session::{Generation, Session, SessionId, SessionSettings, SessionState};
