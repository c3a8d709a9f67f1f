//! Inference sessions.
//!
//! A [`Session`] owns exactly one native context, held by a dedicated
//! worker thread. Callers drive it through async methods; the lifecycle is
//!
//! ```text
//! Uninitialized -> Loading -> Ready -> MultimodalLoading -> MultimodalReady
//!                     |                       |
//!                     v                       v (projector rejected)
//!                   Failed (retry load)     Ready
//! ```
//!
//! and any state moves to `Closed` on teardown. Generation requests are
//! accepted only in `Ready` / `MultimodalReady`, one at a time.
//!
//! - [`gate`]: the one-in-flight request serializer
//! - [`generation`]: the caller-side handle of a submitted request

pub mod gate;
pub mod generation;
mod worker;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::{ChatMessage, ChatTemplate};
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::inference::backend::{ContextParams, NativeBackend};
use crate::inference::engine::{EngineConfig, GenerationRequest, GenerationResult, StreamToken};
use crate::inference::registry::{check_readable, ModelDescriptor};
use crate::multimodal::preprocessor::{self, PromptPlan, DEFAULT_MEDIA_MARKER};
use crate::notify::{
    status_for_error, status_for_state, SessionEvent, SharedNotifier, Stage, TracingNotifier,
};

use gate::RequestGate;
use generation::CancelToken;
pub use generation::Generation;
use worker::{Command, Job, WorkerHandle};

/// Session identifier (the native library's context id).
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique session ID.
pub fn new_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Loading,
    Ready,
    MultimodalLoading,
    MultimodalReady,
    Failed,
    Closed,
}

impl SessionState {
    /// Whether generation requests are accepted.
    pub fn accepts_requests(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::MultimodalReady)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::MultimodalLoading => "multimodal_loading",
            SessionState::MultimodalReady => "multimodal_ready",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-session tuning that is not part of the model descriptor.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Positions preserved at the start of the KV cache on a context shift.
    pub n_keep: usize,

    /// Reuse the common prefix of consecutive text prompts.
    pub prompt_cache: bool,

    /// Marker bound to media items in prompts.
    pub media_marker: String,

    /// Chat template overriding the model's own.
    pub chat_template: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            n_keep: 0,
            prompt_cache: true,
            media_marker: DEFAULT_MEDIA_MARKER.to_string(),
            chat_template: None,
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            n_keep: config.session.n_keep,
            prompt_cache: config.session.prompt_cache,
            media_marker: config.multimodal.media_marker.clone(),
            chat_template: config.chat.template.clone(),
        }
    }
}

/// State visible to both the caller side and the worker thread.
pub(crate) struct Shared {
    pub id: SessionId,
    pub model_name: String,
    state: watch::Sender<SessionState>,
    status: Mutex<String>,
    notifier: SharedNotifier,
    model_template: Mutex<Option<String>>,
}

impl Shared {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `next` if `allowed(current)`, atomically. Returns the
    /// rejected current state otherwise.
    fn try_transition(
        &self,
        allowed: impl FnOnce(SessionState) -> bool,
        next: SessionState,
    ) -> std::result::Result<(), SessionState> {
        let mut rejected = None;
        self.state.send_if_modified(|state| {
            if allowed(*state) {
                *state = next;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });
        match rejected {
            Some(state) => Err(state),
            None => {
                self.announce(next, status_for_state(next, &self.model_name));
                Ok(())
            }
        }
    }

    /// Unconditional move, except that `Closed` is final.
    pub fn set_state(&self, next: SessionState, status: String) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            self.announce(next, status);
        }
        changed
    }

    fn announce(&self, state: SessionState, status: String) {
        debug!(session = self.id, state = %state, "State changed");
        self.emit(SessionEvent::StateChanged {
            session: self.id,
            state,
            status,
        });
    }

    pub fn emit(&self, event: SessionEvent) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = event.status();
        self.notifier.notify(event);
    }

    pub fn set_model_template(&self, template: Option<String>) {
        *self
            .model_template
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = template;
    }

    fn model_template(&self) -> Option<String> {
        self.model_template
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct Inner {
    shared: Arc<Shared>,
    descriptor: ModelDescriptor,
    backend: Arc<dyn NativeBackend>,
    settings: SessionSettings,
    gate: RequestGate,
    worker: Mutex<Option<WorkerHandle>>,
    current: Mutex<Option<CancelToken>>,
}

impl Inner {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            n_batch: self.descriptor.n_batch as usize,
            n_keep: self.settings.n_keep,
            context_shift: self.descriptor.context_shift,
            prompt_cache: self.settings.prompt_cache,
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        match worker.as_ref() {
            Some(handle) => handle.send(command),
            None => Err(SessionError::WorkerShutdown),
        }
    }

    fn cancel_current(&self) {
        if let Some(token) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            token.cancel();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let handle = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // The worker exits on its own after the queued commands and
            // releases the context on its thread; don't block here.
            self.cancel_current();
            drop(handle.shutdown());
            debug!(session = self.shared.id, "Session dropped, worker detached");
        }
    }
}

/// A handle to one inference session. Clones share the session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("model", &self.inner.descriptor.path)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Create an uninitialized session that logs its events.
    pub fn create(descriptor: ModelDescriptor, backend: Arc<dyn NativeBackend>) -> Self {
        Self::create_with_settings(
            descriptor,
            backend,
            Arc::new(TracingNotifier),
            SessionSettings::default(),
        )
    }

    pub fn create_with_settings(
        descriptor: ModelDescriptor,
        backend: Arc<dyn NativeBackend>,
        notifier: SharedNotifier,
        settings: SessionSettings,
    ) -> Self {
        let id = new_session_id();
        let (state, _) = watch::channel(SessionState::Uninitialized);
        let shared = Arc::new(Shared {
            id,
            model_name: descriptor.display_name(),
            state,
            status: Mutex::new(status_for_state(SessionState::Uninitialized, "")),
            notifier,
            model_template: Mutex::new(None),
        });
        debug!(session = id, model = %descriptor.path.display(), "Session created");

        Self {
            inner: Arc::new(Inner {
                shared,
                descriptor,
                backend,
                settings,
                gate: RequestGate::new(),
                worker: Mutex::new(None),
                current: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.shared.id
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.inner.descriptor
    }

    pub fn state(&self) -> SessionState {
        self.inner.shared.state()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.shared.state.subscribe()
    }

    /// Latest status line.
    pub fn status(&self) -> String {
        self.inner
            .shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.gate.is_busy()
    }

    /// Construct the native context. Idempotent once loaded; retries after
    /// a failure.
    pub async fn load(&self) -> Result<SessionState> {
        let shared = &self.inner.shared;
        match shared.try_transition(
            |s| matches!(s, SessionState::Uninitialized | SessionState::Failed),
            SessionState::Loading,
        ) {
            Ok(()) => {}
            Err(state) if state.accepts_requests() => return Ok(state),
            Err(state) => {
                return Err(SessionError::InvalidState {
                    operation: "load",
                    state,
                })
            }
        }

        info!(session = self.id(), model = %self.inner.descriptor.path.display(), "Loading model");

        let (reply, rx) = oneshot::channel();
        let command = Command::Load {
            params: ContextParams::from_descriptor(&self.inner.descriptor),
            reply,
        };
        if let Err(e) = self.ensure_worker().and_then(|_| self.inner.send(command)) {
            shared.set_state(SessionState::Failed, e.to_string());
            return Err(e);
        }
        rx.await.map_err(|_| SessionError::WorkerShutdown)?
    }

    fn ensure_worker(&self) -> Result<()> {
        let mut worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if worker.is_none() {
            *worker = Some(WorkerHandle::spawn(
                self.inner.shared.clone(),
                self.inner.backend.clone(),
                self.inner.engine_config(),
            )?);
        }
        Ok(())
    }

    /// Attach a multimodal projector to the loaded context. Only from
    /// `Ready`; a rejected projector leaves the session `Ready`.
    pub async fn load_multimodal_projector(&self, path: &Path) -> Result<SessionState> {
        let shared = &self.inner.shared;
        shared
            .try_transition(|s| s == SessionState::Ready, SessionState::MultimodalLoading)
            .map_err(|state| SessionError::InvalidState {
                operation: "load_multimodal_projector",
                state,
            })?;

        if let Err(e) = check_readable(path) {
            shared.set_state(SessionState::Ready, e.to_string());
            return Err(e);
        }

        let (reply, rx) = oneshot::channel();
        self.inner.send(Command::LoadProjector {
            path: path.to_path_buf(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::WorkerShutdown)?
    }

    /// Queue a generation. Fails with `Busy` right away if one is in flight.
    pub fn submit(&self, request: GenerationRequest) -> Result<Generation> {
        let guard = self.inner.gate.try_acquire().ok_or(SessionError::Busy {
            session: self.id(),
        })?;

        let state = self.state();
        if !state.accepts_requests() {
            return Err(SessionError::InvalidState {
                operation: "generate",
                state,
            });
        }
        let plan = self
            .plan(&request, state)
            .map_err(|e| self.reject(Stage::Format, e))?;

        let request_id = Uuid::new_v4();
        let cancel = CancelToken::new();
        let (reply, result_rx) = oneshot::channel();
        let (tokens, tokens_rx) = if request.stream {
            let (tx, rx) = mpsc::unbounded_channel::<StreamToken>();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        *self
            .inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());

        self.inner.send(Command::Generate(Job {
            request_id,
            request,
            plan,
            cancel: cancel.clone(),
            tokens,
            reply,
            guard,
        }))?;

        Ok(Generation::new(request_id, tokens_rx, result_rx, cancel))
    }

    fn plan(&self, request: &GenerationRequest, state: SessionState) -> Result<PromptPlan> {
        request.validate()?;
        if !request.media_paths.is_empty() && state != SessionState::MultimodalReady {
            return Err(SessionError::InvalidState {
                operation: "generate with media",
                state,
            });
        }
        preprocessor::prepare(
            &request.prompt,
            &request.media_paths,
            &self.inner.settings.media_marker,
        )
    }

    /// Report a caller-side failure on the status line and pass it on.
    fn reject(&self, stage: Stage, err: SessionError) -> SessionError {
        warn!(session = self.id(), error = %err, "Request rejected");
        self.inner.shared.emit(SessionEvent::RequestRejected {
            session: self.id(),
            kind: err.kind(),
            status: status_for_error(stage, &err),
        });
        err
    }

    /// Run a request and wait for the whole result.
    pub async fn complete(&self, request: GenerationRequest) -> Result<GenerationResult> {
        self.submit(request.streaming(false))?.finish().await
    }

    /// Run a request, handing each token to `on_token` as it arrives.
    pub async fn complete_streaming<F>(
        &self,
        request: GenerationRequest,
        mut on_token: F,
    ) -> Result<GenerationResult>
    where
        F: FnMut(StreamToken),
    {
        let mut generation = self.submit(request.streaming(true))?;
        while let Some(token) = generation.next_token().await {
            on_token(token);
        }
        generation.finish().await
    }

    /// Cancel the in-flight generation, if any.
    pub fn cancel(&self) -> bool {
        if !self.is_busy() {
            return false;
        }
        self.inner.cancel_current();
        true
    }

    /// Render chat messages into a prompt. Template precedence: `template`,
    /// then the configured one, then the model's own, then ChatML.
    pub fn format_chat(&self, messages: &[ChatMessage], template: Option<&str>) -> Result<String> {
        let state = self.state();
        if state == SessionState::Closed {
            return Err(SessionError::InvalidState {
                operation: "format_chat",
                state,
            });
        }

        let source = template
            .map(str::to_string)
            .or_else(|| self.inner.settings.chat_template.clone())
            .or_else(|| self.inner.shared.model_template());
        let template = match source {
            Some(source) => ChatTemplate::new(source),
            None => ChatTemplate::chatml(),
        };
        template
            .render(messages, &self.inner.settings.media_marker, true)
            .map_err(|e| self.reject(Stage::Format, e))
    }

    /// Cancel any generation, stop the worker and release the context.
    /// Every later operation fails with `InvalidState`.
    pub async fn teardown(&self) {
        // Closed before cancelling; the worker also stops jobs it finds on a
        // closed session.
        let status = status_for_state(SessionState::Closed, &self.inner.shared.model_name);
        let closed_now = self.inner.shared.set_state(SessionState::Closed, status);
        self.inner.cancel_current();
        if !closed_now {
            return;
        }

        let handle = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let thread = handle.shutdown();
            if let Err(e) = tokio::task::spawn_blocking(move || thread.join()).await {
                warn!(session = self.id(), error = %e, "Failed to join session worker");
            }
        }
        info!(session = self.id(), "Session closed");
    }
}
