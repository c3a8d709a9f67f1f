//! Session lifecycle notifications.
//!
//! Sessions report progress to a caller-supplied [`Notifier`] instead of
//! writing to any UI directly. Each event carries a human-readable status
//! line (the text a front end would show) alongside the structured data.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, SessionError};
use crate::inference::engine::StopReason;
use crate::session::{SessionId, SessionState};

/// Lifecycle stage an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Projector,
    Format,
    Generation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        session: SessionId,
        state: SessionState,
        status: String,
    },
    GenerationStarted {
        session: SessionId,
        request_id: Uuid,
    },
    GenerationFinished {
        session: SessionId,
        request_id: Uuid,
        token_count: usize,
        tokens_per_second: f64,
        stop_reason: StopReason,
    },
    GenerationFailed {
        session: SessionId,
        request_id: Uuid,
        kind: ErrorKind,
        message: String,
    },
    /// A request or prompt refused before it reached the worker.
    RequestRejected {
        session: SessionId,
        kind: ErrorKind,
        status: String,
    },
}

impl SessionEvent {
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::StateChanged { session, .. }
            | SessionEvent::GenerationStarted { session, .. }
            | SessionEvent::GenerationFinished { session, .. }
            | SessionEvent::GenerationFailed { session, .. }
            | SessionEvent::RequestRejected { session, .. } => *session,
        }
    }

    /// Status line for this event.
    pub fn status(&self) -> String {
        match self {
            SessionEvent::StateChanged { status, .. }
            | SessionEvent::RequestRejected { status, .. } => status.clone(),
            SessionEvent::GenerationStarted { .. } => "Generating response...".to_string(),
            SessionEvent::GenerationFinished { .. } => "Completed!".to_string(),
            SessionEvent::GenerationFailed { message, .. } => {
                format!("Error during completion: {message}")
            }
        }
    }
}

/// Status line for entering `state`. `Failed` is reported through
/// [`status_for_error`] instead.
pub fn status_for_state(state: SessionState, model: &str) -> String {
    match state {
        SessionState::Uninitialized => "Initializing...".to_string(),
        SessionState::Loading => format!("Loading model: {model}..."),
        SessionState::Ready => "Llama context loaded successfully!".to_string(),
        SessionState::MultimodalLoading => {
            "Main context loaded! Initializing multimodal projector...".to_string()
        }
        SessionState::MultimodalReady => "Model and projector loaded. Ready!".to_string(),
        SessionState::Failed => "Error: Failed to load Llama context.".to_string(),
        SessionState::Closed => "Session closed.".to_string(),
    }
}

/// Status line replacing the normal one after a failure.
pub fn status_for_error(stage: Stage, err: &SessionError) -> String {
    match stage {
        Stage::Load => format!("Error: Failed to load Llama context.\n{err}"),
        Stage::Projector => format!("Error: Failed to init multimodal projector.\n{err}"),
        Stage::Format => format!("Error formatting prompt: {err}"),
        Stage::Generation => format!("Error during completion: {err}"),
    }
}

/// Receives session events. Called from the session's worker thread, and
/// from the caller's thread for rejected requests, so implementations should
/// hand the event off rather than block.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: SessionEvent);
}

impl<F> Notifier for F
where
    F: Fn(SessionEvent) + Send + Sync,
{
    fn notify(&self, event: SessionEvent) {
        self(event)
    }
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Logs every event. The default when no notifier is supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: SessionEvent) {
        match &event {
            SessionEvent::GenerationFailed { kind, .. }
            | SessionEvent::RequestRejected { kind, .. } => {
                warn!(session = event.session(), kind = %kind, "{}", event.status())
            }
            _ => info!(session = event.session(), "{}", event.status()),
        }
    }
}

/// Forwards events to an unbounded channel for an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: SessionEvent) {
        // Consumer gone: nobody is watching.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_status_lines() {
        assert_eq!(
            status_for_state(SessionState::Loading, "SmolVLM2"),
            "Loading model: SmolVLM2..."
        );
        assert_eq!(
            status_for_state(SessionState::MultimodalReady, "x"),
            "Model and projector loaded. Ready!"
        );
        let err = SessionError::Generation {
            message: "decode failed".into(),
        };
        assert_eq!(
            status_for_error(Stage::Generation, &err),
            "Error during completion: Generation failed: decode failed"
        );
        let err = SessionError::PlaceholderMismatch { markers: 0, media: 1 };
        assert!(status_for_error(Stage::Format, &err).starts_with("Error formatting prompt: Prompt has 0"));
    }

    #[test]
    fn test_closure_notifier() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let notifier: SharedNotifier = Arc::new(move |e: SessionEvent| {
            sink.lock().unwrap().push(e.status());
        });
        notifier.notify(SessionEvent::GenerationStarted {
            session: 1,
            request_id: Uuid::new_v4(),
        });
        assert_eq!(*seen.lock().unwrap(), vec!["Generating response..."]);
    }

    #[tokio::test]
    async fn test_channel_notifier() {
        let (notifier, mut rx) = ChannelNotifier::channel();
        notifier.notify(SessionEvent::StateChanged {
            session: 7,
            state: SessionState::Ready,
            status: status_for_state(SessionState::Ready, "m"),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session(), 7);
        assert_eq!(event.status(), "Llama context loaded successfully!");

        drop(rx);
        notifier.notify(SessionEvent::GenerationStarted {
            session: 7,
            request_id: Uuid::new_v4(),
        });
    }
}
