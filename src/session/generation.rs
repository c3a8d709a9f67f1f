//! Caller-side handle for a submitted generation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::inference::engine::{GenerationResult, StreamToken};

/// Cooperative cancellation flag, polled by the decode loop once per step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A generation in flight.
///
/// Streamed tokens (if requested) arrive in order and always before the
/// result. Dropping the handle cancels the generation.
#[derive(Debug)]
pub struct Generation {
    id: Uuid,
    tokens: Option<mpsc::UnboundedReceiver<StreamToken>>,
    result: oneshot::Receiver<Result<GenerationResult>>,
    cancel: CancelToken,
}

impl Generation {
    pub(crate) fn new(
        id: Uuid,
        tokens: Option<mpsc::UnboundedReceiver<StreamToken>>,
        result: oneshot::Receiver<Result<GenerationResult>>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            id,
            tokens,
            result,
            cancel,
        }
    }

    /// Request id, as logged by the worker.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Next streamed token. `None` once the stream ends or if the request
    /// was not streaming.
    pub async fn next_token(&mut self) -> Option<StreamToken> {
        match self.tokens.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Take the token channel as a `Stream`. Only the first call returns it.
    pub fn token_stream(&mut self) -> Option<UnboundedReceiverStream<StreamToken>> {
        self.tokens.take().map(UnboundedReceiverStream::new)
    }

    /// Wait for the final result. Tokens not yet consumed are discarded.
    pub async fn finish(self) -> Result<GenerationResult> {
        let Generation { result, tokens, .. } = self;
        drop(tokens);
        result.await.map_err(|_| SessionError::WorkerShutdown)?
    }
}
