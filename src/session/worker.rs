//! The session worker thread.
//!
//! One OS thread per session owns the native context. Every context call
//! happens here, driven by [`Command`]s received in order; results go back
//! over oneshot channels and tokens over the job's stream channel. The
//! context is dropped on this thread when the worker exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::inference::backend::{ContextParams, MultimodalSupport, NativeBackend, NativeContext};
use crate::inference::engine::{
    EngineConfig, GenerationEngine, GenerationRequest, GenerationResult, PromptCache, StreamToken,
};
use crate::multimodal::preprocessor::PromptPlan;
use crate::notify::{status_for_error, status_for_state, SessionEvent, Stage};
use crate::session::gate::InFlightGuard;
use crate::session::generation::CancelToken;
use crate::session::{SessionState, Shared};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// A generation job, with everything the worker needs to answer it.
pub(crate) struct Job {
    pub request_id: Uuid,
    pub request: GenerationRequest,
    pub plan: PromptPlan,
    pub cancel: CancelToken,
    pub tokens: Option<mpsc::UnboundedSender<StreamToken>>,
    pub reply: Reply<GenerationResult>,
    pub guard: InFlightGuard,
}

pub(crate) enum Command {
    Load {
        params: ContextParams,
        reply: Reply<SessionState>,
    },
    LoadProjector {
        path: PathBuf,
        reply: Reply<SessionState>,
    },
    Generate(Job),
    Shutdown,
}

pub(crate) struct WorkerHandle {
    tx: mpsc::UnboundedSender<Command>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn(
        shared: Arc<Shared>,
        backend: Arc<dyn NativeBackend>,
        config: EngineConfig,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name(format!("llama-session-{}", shared.id))
            .spawn(move || {
                Worker {
                    shared,
                    backend,
                    config,
                    ctx: None,
                    support: None,
                    cache: PromptCache::default(),
                }
                .run(rx)
            })
            .map_err(|e| SessionError::Load {
                reason: format!("failed to spawn worker thread: {e}"),
            })?;
        Ok(Self { tx, thread })
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| SessionError::WorkerShutdown)
    }

    /// Ask the worker to exit after the commands already queued.
    pub fn shutdown(self) -> JoinHandle<()> {
        let _ = self.tx.send(Command::Shutdown);
        self.thread
    }
}

struct Worker {
    shared: Arc<Shared>,
    backend: Arc<dyn NativeBackend>,
    config: EngineConfig,
    ctx: Option<Box<dyn NativeContext>>,
    support: Option<MultimodalSupport>,
    cache: PromptCache,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!(session = self.shared.id, backend = self.backend.name(), "Worker started");

        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Load { params, reply } => {
                    let _ = reply.send(self.load(&params));
                }
                Command::LoadProjector { path, reply } => {
                    let _ = reply.send(self.load_projector(&path));
                }
                Command::Generate(job) => self.generate(job),
                Command::Shutdown => break,
            }
        }

        if self.ctx.take().is_some() {
            info!(session = self.shared.id, "Context released");
        }
        debug!(session = self.shared.id, "Worker stopped");
    }

    fn load(&mut self, params: &ContextParams) -> Result<SessionState> {
        let state = self.shared.state();
        if state == SessionState::Closed {
            return Err(SessionError::InvalidState {
                operation: "load",
                state,
            });
        }

        match self.backend.init_context(params) {
            Ok(ctx) => {
                info!(
                    session = self.shared.id,
                    model = %params.model.display(),
                    n_ctx = ctx.n_ctx(),
                    "Context loaded"
                );
                self.shared.set_model_template(ctx.chat_template());
                self.ctx = Some(ctx);
                self.support = None;
                self.cache = PromptCache::default();
                let status = status_for_state(SessionState::Ready, &self.shared.model_name);
                if !self.shared.set_state(SessionState::Ready, status) {
                    // Closed while loading; the context goes when the worker exits.
                    return Err(SessionError::InvalidState {
                        operation: "load",
                        state: self.shared.state(),
                    });
                }
                Ok(SessionState::Ready)
            }
            Err(e) => {
                let err = SessionError::from_load(e);
                error!(session = self.shared.id, error = %err, "Context load failed");
                self.shared
                    .set_state(SessionState::Failed, status_for_error(Stage::Load, &err));
                Err(err)
            }
        }
    }

    fn load_projector(&mut self, path: &std::path::Path) -> Result<SessionState> {
        let Some(ctx) = self.ctx.as_mut() else {
            return Err(SessionError::InvalidState {
                operation: "load_multimodal_projector",
                state: self.shared.state(),
            });
        };

        match ctx.init_multimodal(path) {
            Ok(support) => {
                info!(
                    session = self.shared.id,
                    projector = %path.display(),
                    vision = support.vision,
                    audio = support.audio,
                    "Multimodal projector loaded"
                );
                self.support = Some(support);
                let status = status_for_state(SessionState::MultimodalReady, &self.shared.model_name);
                if !self.shared.set_state(SessionState::MultimodalReady, status) {
                    return Err(SessionError::InvalidState {
                        operation: "load_multimodal_projector",
                        state: self.shared.state(),
                    });
                }
                Ok(SessionState::MultimodalReady)
            }
            Err(e) => {
                let err = SessionError::from_load(e);
                warn!(session = self.shared.id, error = %err, "Projector load failed, text context kept");
                self.shared
                    .set_state(SessionState::Ready, status_for_error(Stage::Projector, &err));
                Err(err)
            }
        }
    }

    fn generate(&mut self, job: Job) {
        let Job {
            request_id,
            request,
            plan,
            cancel,
            tokens,
            reply,
            guard,
        } = job;
        let session = self.shared.id;

        info!(
            session,
            request_id = %request_id,
            max_tokens = request.max_tokens,
            media = plan.media.len(),
            stream = request.stream,
            "Starting generation"
        );
        self.shared.emit(SessionEvent::GenerationStarted {
            session,
            request_id,
        });

        let result = match self.ctx.as_mut() {
            Some(ctx) => {
                let shared = &self.shared;
                let cancelled = || {
                    cancel.is_cancelled()
                        || reply.is_closed()
                        || shared.state() == SessionState::Closed
                };
                let mut on_token = |token: StreamToken| {
                    if let Some(tx) = &tokens {
                        let _ = tx.send(token);
                    }
                    !reply.is_closed()
                };
                GenerationEngine::new(&mut **ctx, &self.config, &mut self.cache).run(
                    &request,
                    &plan,
                    self.support,
                    &cancelled,
                    &mut on_token,
                )
            }
            None => Err(SessionError::InvalidState {
                operation: "generate",
                state: self.shared.state(),
            }),
        };

        match &result {
            Ok(r) => self.shared.emit(SessionEvent::GenerationFinished {
                session,
                request_id,
                token_count: r.token_count,
                tokens_per_second: r.tokens_per_second,
                stop_reason: r.stop_reason.clone(),
            }),
            Err(e) => {
                error!(session, request_id = %request_id, error = %e, "Generation failed");
                self.shared.emit(SessionEvent::GenerationFailed {
                    session,
                    request_id,
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }

        // End the token stream and free the slot before the result lands, so
        // a caller woken by the result can submit again immediately.
        drop(tokens);
        drop(guard);
        let _ = reply.send(result);
    }
}
