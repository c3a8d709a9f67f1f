//! Scripted in-process backend.
//!
//! Stands in for the native library in tests, benchmarks and the demo
//! binary. It validates model files the way a GGUF loader would (magic
//! bytes) and replays a fixed script of token pieces, one per decode step,
//! before emitting end-of-generation. Faults (slow steps, decode failure at a
//! given step, oversized models) can be injected, and allocation counters
//! let callers observe context lifetime.

use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::inference::backend::{
    BackendError, ContextParams, Embedding, MultimodalSupport, NativeBackend, NativeContext,
    TokenId,
};
use crate::multimodal::media::{MediaInput, MediaKind};

const GGUF_MAGIC: &[u8; 4] = b"GGUF";

const BOS_TOKEN: TokenId = 0;
const EOS_TOKEN: TokenId = 1;
/// Script piece `i` is token `SCRIPT_BASE + i`.
const SCRIPT_BASE: TokenId = 2;
/// Prompt tokens live above every script token.
const PROMPT_BASE: TokenId = 1024;
const N_VOCAB: usize = 2048;

/// Projector output size per image, in context positions.
const IMAGE_TOKENS: usize = 64;
/// Audio bytes per context position.
const AUDIO_BYTES_PER_TOKEN: usize = 1024;
const N_EMBD: usize = 8;

/// What the stub replies and how it misbehaves.
#[derive(Debug, Clone)]
pub struct StubScript {
    /// Token pieces replayed one per decode step.
    pub pieces: Vec<String>,

    /// Sleep this long in every generated-token evaluation.
    pub step_delay: Duration,

    /// Sleep this long while constructing a context.
    pub load_delay: Duration,

    /// Fail evaluation of the generated token at this step (0-based).
    pub fail_at: Option<usize>,

    /// Refuse models larger than this many bytes with an out-of-memory error.
    pub max_model_bytes: Option<u64>,

    /// Projector also supports audio.
    pub audio: bool,

    /// Chat template reported in the model metadata.
    pub chat_template: Option<String>,
}

impl Default for StubScript {
    fn default() -> Self {
        Self {
            pieces: Vec::new(),
            step_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            fail_at: None,
            max_model_bytes: None,
            audio: true,
            chat_template: None,
        }
    }
}

impl StubScript {
    /// Script from explicit pieces.
    pub fn pieces<S: Into<String>>(pieces: impl IntoIterator<Item = S>) -> Self {
        Self {
            pieces: pieces.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Script that replies `text` word by word, keeping the whitespace.
    pub fn words(text: &str) -> Self {
        let mut pieces = Vec::new();
        let mut current = String::new();
        for ch in text.chars() {
            if ch.is_whitespace() && !current.trim().is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            current.push(ch);
        }
        if !current.is_empty() {
            pieces.push(current);
        }
        Self::pieces(pieces)
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_fail_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn with_max_model_bytes(mut self, bytes: u64) -> Self {
        self.max_model_bytes = Some(bytes);
        self
    }

    pub fn with_audio(mut self, audio: bool) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_chat_template(mut self, template: impl Into<String>) -> Self {
        self.chat_template = Some(template.into());
        self
    }
}

/// Context lifetime counters shared by a backend and its contexts.
#[derive(Debug, Default)]
pub struct StubCounters {
    allocated: AtomicUsize,
    released: AtomicUsize,
    projectors: AtomicUsize,
}

impl StubCounters {
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn projectors(&self) -> usize {
        self.projectors.load(Ordering::SeqCst)
    }

    /// Contexts currently alive.
    pub fn live(&self) -> usize {
        self.allocated().saturating_sub(self.released())
    }
}

/// The scripted backend.
pub struct StubBackend {
    script: Arc<StubScript>,
    counters: Arc<StubCounters>,
}

impl StubBackend {
    pub fn new(script: StubScript) -> Self {
        Self {
            script: Arc::new(script),
            counters: Arc::new(StubCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<StubCounters> {
        self.counters.clone()
    }
}

fn check_gguf(path: &Path) -> Result<u64, BackendError> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| BackendError::ModelLoadFailed(format!("{}: {e}", path.display())))?;
    let size = file
        .metadata()
        .map_err(|e| BackendError::ModelLoadFailed(e.to_string()))?
        .len();
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .map_err(|_| BackendError::UnsupportedFormat(format!("{}: file too short", path.display())))?;
    if &magic != GGUF_MAGIC {
        return Err(BackendError::UnsupportedFormat(format!(
            "{}: bad magic {:02x?}",
            path.display(),
            magic
        )));
    }
    Ok(size)
}

impl NativeBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn init_context(&self, params: &ContextParams) -> Result<Box<dyn NativeContext>, BackendError> {
        let size = check_gguf(&params.model)?;
        if !self.script.load_delay.is_zero() {
            std::thread::sleep(self.script.load_delay);
        }
        if let Some(limit) = self.script.max_model_bytes {
            if size > limit {
                return Err(BackendError::OutOfMemory(size));
            }
        }
        if params.n_ctx == 0 {
            return Err(BackendError::ContextFailed("n_ctx must be > 0".to_string()));
        }

        self.counters.allocated.fetch_add(1, Ordering::SeqCst);
        debug!(model = %params.model.display(), n_ctx = params.n_ctx, "Stub context allocated");

        Ok(Box::new(StubContext {
            script: self.script.clone(),
            counters: self.counters.clone(),
            n_ctx: params.n_ctx as usize,
            pos: 0,
            last: None,
            support: None,
            logits: vec![0.0; N_VOCAB],
        }))
    }
}

/// Last evaluated position, which decides the next scripted token.
#[derive(Debug, Clone, Copy)]
enum Last {
    Prompt,
    Script(usize),
}

struct StubContext {
    script: Arc<StubScript>,
    counters: Arc<StubCounters>,
    n_ctx: usize,
    pos: usize,
    last: Option<Last>,
    support: Option<MultimodalSupport>,
    logits: Vec<f32>,
}

impl StubContext {
    fn reserve(&self, n: usize) -> Result<(), BackendError> {
        if self.pos + n > self.n_ctx {
            return Err(BackendError::ContextFull {
                used: self.pos,
                n_ctx: self.n_ctx,
            });
        }
        Ok(())
    }

    fn refresh_logits(&mut self) {
        self.logits.iter_mut().for_each(|l| *l = 0.0);
        let next = match self.last {
            None => return,
            Some(Last::Prompt) => 0,
            Some(Last::Script(i)) => i + 1,
        };
        let capacity = (PROMPT_BASE - SCRIPT_BASE) as usize;
        let token = if next < self.script.pieces.len() && next < capacity {
            SCRIPT_BASE + next as TokenId
        } else {
            EOS_TOKEN
        };
        self.logits[token as usize] = 30.0;
    }

    fn script_index(token: TokenId) -> Option<usize> {
        (SCRIPT_BASE..PROMPT_BASE)
            .contains(&token)
            .then(|| (token - SCRIPT_BASE) as usize)
    }
}

impl NativeContext for StubContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn chat_template(&self) -> Option<String> {
        self.script.chat_template.clone()
    }

    fn init_multimodal(&mut self, projector: &Path) -> Result<MultimodalSupport, BackendError> {
        check_gguf(projector).map_err(|e| BackendError::ProjectorFailed(e.to_string()))?;
        let support = MultimodalSupport {
            vision: true,
            audio: self.script.audio,
        };
        self.support = Some(support);
        self.counters.projectors.fetch_add(1, Ordering::SeqCst);
        Ok(support)
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, BackendError> {
        // ~1 token per 4 bytes, ids derived from the bytes so equal text
        // tokenizes identically.
        let span = (N_VOCAB as TokenId - PROMPT_BASE) as u32;
        let mut tokens: Vec<TokenId> = text
            .as_bytes()
            .chunks(4)
            .map(|chunk| {
                let h = chunk
                    .iter()
                    .fold(17u32, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u32));
                PROMPT_BASE + (h % span) as TokenId
            })
            .collect();
        if add_special {
            tokens.insert(0, BOS_TOKEN);
        }
        Ok(tokens)
    }

    fn eval_tokens(&mut self, tokens: &[TokenId]) -> Result<(), BackendError> {
        let Some(&last) = tokens.last() else {
            return Ok(());
        };
        self.reserve(tokens.len())?;

        match Self::script_index(last) {
            Some(step) => {
                if !self.script.step_delay.is_zero() {
                    std::thread::sleep(self.script.step_delay);
                }
                if self.script.fail_at == Some(step) {
                    return Err(BackendError::Decode(format!("injected failure at step {step}")));
                }
                self.last = Some(Last::Script(step));
            }
            None => self.last = Some(Last::Prompt),
        }
        self.pos += tokens.len();
        self.refresh_logits();
        Ok(())
    }

    fn encode_media(&mut self, media: &MediaInput, bytes: &[u8]) -> Result<Embedding, BackendError> {
        let support = self
            .support
            .ok_or_else(|| BackendError::MediaEncode("no projector loaded".to_string()))?;
        let n_tokens = match media.kind {
            MediaKind::Image if support.vision => IMAGE_TOKENS,
            MediaKind::Audio if support.audio => (bytes.len() / AUDIO_BYTES_PER_TOKEN).max(1),
            kind => {
                return Err(BackendError::MediaEncode(format!(
                    "projector cannot encode {kind}"
                )))
            }
        };
        let data = (0..n_tokens * N_EMBD)
            .map(|i| bytes.get(i % bytes.len().max(1)).copied().unwrap_or(0) as f32 / 255.0)
            .collect();
        Ok(Embedding {
            n_tokens,
            n_embd: N_EMBD,
            data,
        })
    }

    fn eval_embedding(&mut self, embedding: &Embedding) -> Result<(), BackendError> {
        self.reserve(embedding.n_tokens)?;
        self.pos += embedding.n_tokens;
        self.last = Some(Last::Prompt);
        self.refresh_logits();
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        match Self::script_index(token) {
            Some(i) => self
                .script
                .pieces
                .get(i)
                .map(|p| p.as_bytes().to_vec())
                .unwrap_or_default(),
            None if token == EOS_TOKEN => b"</s>".to_vec(),
            None => Vec::new(),
        }
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS_TOKEN
    }

    fn kv_used(&self) -> usize {
        self.pos
    }

    fn kv_shift(&mut self, n_keep: usize, n_discard: usize) -> Result<(), BackendError> {
        if n_keep + n_discard > self.pos {
            return Err(BackendError::Decode(format!(
                "cannot discard {n_discard} positions after {n_keep} of {}",
                self.pos
            )));
        }
        self.pos -= n_discard;
        Ok(())
    }

    fn kv_truncate(&mut self, n: usize) {
        self.pos = self.pos.min(n);
    }
}

impl Drop for StubContext {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        debug!("Stub context released");
    }
}
