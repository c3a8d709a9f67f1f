//! Error taxonomy for session operations.
//!
//! Every failure surfaced to a caller is a [`SessionError`]. The coarse
//! [`ErrorKind`] lets callers branch on the category without matching on
//! payloads (e.g. retry a `load()` after `Load`, back off after `Busy`).

use std::path::PathBuf;

use thiserror::Error;

use crate::inference::backend::BackendError;
use crate::session::SessionState;

/// Coarse error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Load,
    InvalidState,
    Busy,
    UnsupportedMedia,
    PlaceholderMismatch,
    Generation,
    InvalidRequest,
    Template,
    WorkerShutdown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Load => "load",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Busy => "busy",
            ErrorKind::UnsupportedMedia => "unsupported_media",
            ErrorKind::PlaceholderMismatch => "placeholder_mismatch",
            ErrorKind::Generation => "generation",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Template => "template",
            ErrorKind::WorkerShutdown => "worker_shutdown",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("File not found or unreadable: {path}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Failed to load context: {reason}")]
    Load { reason: String },

    #[error("Operation '{operation}' not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Session {session} already has a generation in flight")]
    Busy { session: u64 },

    #[error("Unsupported media '{path}' ({mime})")]
    UnsupportedMedia { path: PathBuf, mime: String },

    #[error("Prompt has {markers} media placeholder(s) but {media} media item(s) were given")]
    PlaceholderMismatch { markers: usize, media: usize },

    #[error("Generation failed: {message}")]
    Generation { message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Chat template error: {0}")]
    Template(String),

    #[error("Session worker shut down unexpectedly")]
    WorkerShutdown,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NotFound { .. } => ErrorKind::NotFound,
            SessionError::Load { .. } => ErrorKind::Load,
            SessionError::InvalidState { .. } => ErrorKind::InvalidState,
            SessionError::Busy { .. } => ErrorKind::Busy,
            SessionError::UnsupportedMedia { .. } => ErrorKind::UnsupportedMedia,
            SessionError::PlaceholderMismatch { .. } => ErrorKind::PlaceholderMismatch,
            SessionError::Generation { .. } => ErrorKind::Generation,
            SessionError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            SessionError::Template(_) => ErrorKind::Template,
            SessionError::WorkerShutdown => ErrorKind::WorkerShutdown,
        }
    }

    pub(crate) fn not_found(path: impl Into<PathBuf>, source: Option<std::io::Error>) -> Self {
        SessionError::NotFound {
            path: path.into(),
            source,
        }
    }

    /// Map a backend failure raised while constructing a context or projector.
    pub(crate) fn from_load(err: BackendError) -> Self {
        SessionError::Load {
            reason: err.to_string(),
        }
    }

    /// Map a backend failure raised inside the decode loop.
    pub(crate) fn from_decode(err: BackendError) -> Self {
        SessionError::Generation {
            message: err.to_string(),
        }
    }
}

impl From<minijinja::Error> for SessionError {
    fn from(err: minijinja::Error) -> Self {
        SessionError::Template(err.to_string())
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
