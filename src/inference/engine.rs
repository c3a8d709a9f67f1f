//! Generation engine: drives the decode loop over a native context.
//!
//! The engine:
//! 1. Evaluates the prompt (text tokens and media embeddings, in order),
//!    reusing the cached token prefix of the previous text prompt
//! 2. Samples one token at a time under the request's temperature / top-p
//! 3. Stops on end-of-generation, a stop sequence, `max_tokens` or cancellation
//! 4. Shifts the KV cache when the context fills up, if allowed
//! 5. Emits text fragments through a callback as soon as they are final

use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::{GenerationConfig, MultimodalConfig};
use crate::error::{Result, SessionError};
use crate::inference::backend::{MultimodalSupport, NativeContext, TokenId};
use crate::inference::sampler::{Sampler, SamplerParams};
use crate::inference::stop::{StopMatcher, Utf8Buffer};
use crate::multimodal::preprocessor::{self, PromptChunk, PromptPlan};

/// A generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Fully formatted prompt, including media markers.
    pub prompt: String,

    /// Maximum tokens to generate.
    pub max_tokens: usize,

    /// Stop sequences, without duplicates.
    pub stop_sequences: Vec<String>,

    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,

    /// Top-p (nucleus) sampling threshold.
    pub top_p: f32,

    /// RNG seed for reproducible sampling.
    pub seed: Option<u64>,

    /// Media bound to the prompt's markers, in order.
    pub media_paths: Vec<PathBuf>,

    /// Deliver tokens incrementally.
    pub stream: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self::from_config(prompt, &GenerationConfig::default())
    }

    pub fn from_config(prompt: impl Into<String>, config: &GenerationConfig) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: config.max_tokens,
            stop_sequences: Vec::new(),
            temperature: config.temperature,
            top_p: config.top_p,
            seed: config.seed,
            media_paths: Vec::new(),
            stream: false,
        }
        .with_stop_sequences(config.stop.iter().cloned())
    }

    /// Request carrying media, with the multimodal sampling defaults.
    pub fn multimodal(
        prompt: impl Into<String>,
        media_paths: Vec<PathBuf>,
        config: &MultimodalConfig,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: config.max_tokens,
            stop_sequences: Vec::new(),
            temperature: config.temperature,
            top_p: GenerationConfig::default().top_p,
            seed: None,
            media_paths,
            stream: true,
        }
        .with_stop_sequences(config.stop.iter().cloned())
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Replace the stop sequences, dropping duplicates but keeping order.
    pub fn with_stop_sequences<S: Into<String>>(mut self, stops: impl IntoIterator<Item = S>) -> Self {
        self.stop_sequences.clear();
        for stop in stops {
            let stop = stop.into();
            if !self.stop_sequences.contains(&stop) {
                self.stop_sequences.push(stop);
            }
        }
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_media(mut self, media_paths: Vec<PathBuf>) -> Self {
        self.media_paths = media_paths;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SessionError::InvalidRequest(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SessionError::InvalidRequest(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }

    fn sampler_params(&self) -> SamplerParams {
        SamplerParams {
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
        }
    }
}

/// One incremental text fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamToken {
    /// Position in the stream, starting at 0.
    pub index: usize,
    pub text: String,
}

/// Why the decode loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndOfGeneration,
    StopSequence(String),
    MaxTokens,
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::EndOfGeneration => write!(f, "eos"),
            StopReason::StopSequence(s) => write!(f, "stop:{s:?}"),
            StopReason::MaxTokens => write!(f, "length"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Prompt and decode timings (mirrors the native `timings` map).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timings {
    /// Prompt positions evaluated (excludes reused cache).
    pub prompt_n: usize,
    pub prompt_ms: u64,
    pub predicted_n: usize,
    pub predicted_ms: u64,
    /// Unrounded decode throughput.
    pub predicted_per_second: f64,
}

/// Final result of a generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub text: String,
    pub token_count: usize,
    /// Decode time in milliseconds.
    pub elapsed_ms: u64,
    pub tokens_per_second: f64,
    pub stop_reason: StopReason,
    pub timings: Timings,
}

/// `round(tokens / seconds)`; 0 when nothing was generated or no time elapsed.
pub fn tokens_per_second(token_count: usize, elapsed_ms: u64) -> f64 {
    if token_count == 0 || elapsed_ms == 0 {
        return 0.0;
    }
    (token_count as f64 / (elapsed_ms as f64 / 1000.0)).round()
}

/// Engine tuning, fixed per session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max tokens per prompt evaluation call.
    pub n_batch: usize,

    /// Positions preserved at the start of the KV cache when shifting.
    pub n_keep: usize,

    /// Shift the KV cache when full instead of failing.
    pub context_shift: bool,

    /// Reuse the common prefix of consecutive text prompts.
    pub prompt_cache: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_batch: 512,
            n_keep: 0,
            context_shift: true,
            prompt_cache: true,
        }
    }
}

/// Tokens currently held in the KV cache, when that is known exactly.
#[derive(Debug, Default)]
pub struct PromptCache {
    tokens: Vec<TokenId>,
    valid: bool,
}

impl PromptCache {
    /// Cached tokens, if the cache mirrors the KV state.
    pub fn tokens(&self) -> Option<&[TokenId]> {
        self.valid.then_some(self.tokens.as_slice())
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.tokens.clear();
    }
}

/// Length of the common prefix of two token sequences.
pub fn common_prefix(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

struct Ingested {
    evaluated: usize,
    cacheable: bool,
}

/// Runs one generation against a context. Borrowed for a single request.
pub struct GenerationEngine<'a> {
    ctx: &'a mut dyn NativeContext,
    config: &'a EngineConfig,
    cache: &'a mut PromptCache,
}

impl<'a> GenerationEngine<'a> {
    pub fn new(ctx: &'a mut dyn NativeContext, config: &'a EngineConfig, cache: &'a mut PromptCache) -> Self {
        Self { ctx, config, cache }
    }

    /// Run a request to completion.
    ///
    /// `cancelled` is polled once per decode step and between prompt batches.
    /// `on_token` receives each final text fragment in order; returning
    /// `false` (receiver gone) stops generation as cancelled.
    pub fn run(
        &mut self,
        request: &GenerationRequest,
        plan: &PromptPlan,
        support: Option<MultimodalSupport>,
        cancelled: &dyn Fn() -> bool,
        on_token: &mut dyn FnMut(StreamToken) -> bool,
    ) -> Result<GenerationResult> {
        let prompt_start = Instant::now();
        let ingested = self.ingest_prompt(plan, support, cancelled)?;
        let prompt_ms = prompt_start.elapsed().as_millis() as u64;
        let mut cacheable = ingested.cacheable;

        debug!(
            prompt_n = ingested.evaluated,
            prompt_ms,
            kv_used = self.ctx.kv_used(),
            "Prompt evaluated"
        );

        let gen_start = Instant::now();
        let mut sampler = Sampler::new(request.sampler_params());
        let mut utf8 = Utf8Buffer::new();
        let mut stop = StopMatcher::new(&request.stop_sequences);
        let mut index = 0usize;
        let mut token_count = 0usize;

        let mut reason = loop {
            if cancelled() {
                break StopReason::Cancelled;
            }
            if token_count >= request.max_tokens {
                break StopReason::MaxTokens;
            }

            let token = sampler
                .sample(self.ctx.logits())
                .ok_or_else(|| SessionError::Generation {
                    message: "backend returned no logits".to_string(),
                })?;
            if self.ctx.is_end_of_generation(token) {
                break StopReason::EndOfGeneration;
            }
            token_count += 1;

            let text = utf8.push(&self.ctx.token_to_piece(token));
            let step = stop.push(&text);
            if !emit(on_token, &mut index, step.emit) {
                break StopReason::Cancelled;
            }
            if let Some(sequence) = step.matched {
                break StopReason::StopSequence(sequence);
            }

            if self.ensure_room(1)? {
                cacheable = false;
            }
            self.ctx
                .eval_tokens(&[token])
                .map_err(SessionError::from_decode)?;
            if cacheable {
                self.cache.tokens.push(token);
            }
        };

        if matches!(reason, StopReason::EndOfGeneration | StopReason::MaxTokens) {
            let step = stop.push(&utf8.finish());
            emit(on_token, &mut index, step.emit);
            match step.matched {
                Some(sequence) => reason = StopReason::StopSequence(sequence),
                None => {
                    let rest = stop.finish();
                    emit(on_token, &mut index, rest);
                }
            }
        }

        // The cache only mirrors the KV state after a clean run.
        self.cache.valid = cacheable && self.config.prompt_cache;

        let predicted_ms = gen_start.elapsed().as_millis() as u64;
        let predicted_per_second = if predicted_ms > 0 {
            token_count as f64 * 1000.0 / predicted_ms as f64
        } else {
            0.0
        };

        info!(
            tokens = token_count,
            predicted_ms,
            prompt_n = ingested.evaluated,
            reason = %reason,
            "Generation complete"
        );

        Ok(GenerationResult {
            text: stop.into_text(),
            token_count,
            elapsed_ms: predicted_ms,
            tokens_per_second: tokens_per_second(token_count, predicted_ms),
            stop_reason: reason,
            timings: Timings {
                prompt_n: ingested.evaluated,
                prompt_ms,
                predicted_n: token_count,
                predicted_ms,
                predicted_per_second,
            },
        })
    }

    fn ingest_prompt(
        &mut self,
        plan: &PromptPlan,
        support: Option<MultimodalSupport>,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Ingested> {
        // Invalid until the run completes cleanly.
        let reusable = if self.config.prompt_cache {
            self.cache.tokens().map(<[TokenId]>::to_vec)
        } else {
            None
        };
        self.cache.invalidate();

        if plan.has_media() {
            let support = support.ok_or_else(|| SessionError::Generation {
                message: "no multimodal projector loaded".to_string(),
            })?;
            let block = preprocessor::embed(&mut *self.ctx, support, &plan.media)?;
            self.ctx.kv_truncate(0);

            let mut evaluated = 0;
            // BOS goes in front of the first chunk, even when that chunk is media.
            let mut add_special = true;
            for chunk in &plan.chunks {
                if cancelled() {
                    break;
                }
                match chunk {
                    PromptChunk::Text(text) => {
                        let tokens = self
                            .ctx
                            .tokenize(text, add_special)
                            .map_err(SessionError::from_decode)?;
                        evaluated += self.eval_batched(&tokens, cancelled)?;
                    }
                    PromptChunk::Media(i) => {
                        if add_special {
                            let bos = self
                                .ctx
                                .tokenize("", true)
                                .map_err(SessionError::from_decode)?;
                            evaluated += self.eval_batched(&bos, cancelled)?;
                        }
                        let embedding = &block.embeddings[*i];
                        self.ctx
                            .eval_embedding(embedding)
                            .map_err(SessionError::from_decode)?;
                        evaluated += embedding.n_tokens;
                    }
                }
                add_special = false;
            }
            return Ok(Ingested {
                evaluated,
                cacheable: false,
            });
        }

        let text: String = plan
            .chunks
            .iter()
            .filter_map(|c| match c {
                PromptChunk::Text(t) => Some(t.as_str()),
                PromptChunk::Media(_) => None,
            })
            .collect();
        let tokens = self
            .ctx
            .tokenize(&text, true)
            .map_err(SessionError::from_decode)?;
        if tokens.is_empty() {
            return Err(SessionError::InvalidRequest("prompt is empty".to_string()));
        }

        // Keep at least one token to evaluate so fresh logits exist.
        let reuse = reusable
            .map(|cached| common_prefix(&cached, &tokens))
            .unwrap_or(0)
            .min(tokens.len() - 1);
        self.ctx.kv_truncate(reuse);
        if reuse > 0 {
            debug!(reuse, total = tokens.len(), "Reusing cached prompt prefix");
        }

        let pending = &tokens[reuse..];
        let evaluated = self.eval_batched(pending, cancelled)?;
        // A prompt cut short by cancellation leaves the KV cache behind the
        // token list, so it must not be remembered.
        let complete = evaluated == pending.len();
        if complete {
            self.cache.tokens = tokens;
        }

        Ok(Ingested {
            evaluated,
            cacheable: complete,
        })
    }

    /// Evaluate `tokens` in `n_batch` slices. Returns how many were evaluated
    /// before a cancellation was seen.
    fn eval_batched(&mut self, tokens: &[TokenId], cancelled: &dyn Fn() -> bool) -> Result<usize> {
        let mut evaluated = 0;
        for batch in tokens.chunks(self.config.n_batch.max(1)) {
            if cancelled() {
                break;
            }
            self.ctx
                .eval_tokens(batch)
                .map_err(SessionError::from_decode)?;
            evaluated += batch.len();
        }
        Ok(evaluated)
    }

    /// Make room for `n` more positions. Returns whether the cache was shifted.
    fn ensure_room(&mut self, n: usize) -> Result<bool> {
        let used = self.ctx.kv_used();
        let n_ctx = self.ctx.n_ctx();
        if used + n <= n_ctx {
            return Ok(false);
        }
        if !self.config.context_shift {
            return Err(SessionError::Generation {
                message: format!(
                    "context window exhausted ({used}/{n_ctx} positions) and context shift is disabled"
                ),
            });
        }

        let n_keep = self.config.n_keep.min(used);
        let n_discard = (used - n_keep) / 2;
        if n_discard == 0 {
            return Err(SessionError::Generation {
                message: format!("context window of {n_ctx} positions is too small to shift"),
            });
        }
        self.ctx
            .kv_shift(n_keep, n_discard)
            .map_err(SessionError::from_decode)?;
        debug!(n_keep, n_discard, n_ctx, "Context shifted");
        Ok(true)
    }
}

fn emit(on_token: &mut dyn FnMut(StreamToken) -> bool, index: &mut usize, text: String) -> bool {
    if text.is_empty() {
        return true;
    }
    let token = StreamToken { index: *index, text };
    *index += 1;
    on_token(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::backend::{ContextParams, NativeBackend};
    use crate::inference::stub::{StubBackend, StubScript};
    use std::path::Path;

    fn context(dir: &Path, script: StubScript, n_ctx: u32) -> Box<dyn NativeContext> {
        let model = dir.join("model.gguf");
        std::fs::write(&model, b"GGUF").unwrap();
        StubBackend::new(script)
            .init_context(&ContextParams {
                model,
                n_ctx,
                n_gpu_layers: 0,
                embedding: false,
                ctx_shift: true,
                n_batch: 8,
                n_threads: 1,
            })
            .unwrap()
    }

    fn text_plan(prompt: &str) -> PromptPlan {
        PromptPlan {
            chunks: vec![PromptChunk::Text(prompt.to_string())],
            media: Vec::new(),
        }
    }

    fn run_collect(
        ctx: &mut dyn NativeContext,
        config: &EngineConfig,
        cache: &mut PromptCache,
        request: &GenerationRequest,
    ) -> (Result<GenerationResult>, Vec<StreamToken>) {
        let mut tokens = Vec::new();
        let result = GenerationEngine::new(ctx, config, cache).run(
            request,
            &text_plan(&request.prompt),
            None,
            &|| false,
            &mut |t| {
                tokens.push(t);
                true
            },
        );
        (result, tokens)
    }

    #[test]
    fn test_tokens_per_second() {
        assert_eq!(tokens_per_second(0, 5000), 0.0);
        assert_eq!(tokens_per_second(50, 5000), 10.0);
        assert_eq!(tokens_per_second(7, 0), 0.0);
        assert_eq!(tokens_per_second(3, 2000), 2.0);
    }

    #[test]
    fn test_stop_sequence_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), StubScript::pieces(["Hello</s>World", "!"]), 256);
        let mut cache = PromptCache::default();
        let request = GenerationRequest::new("Say hello")
            .with_stop_sequences(["</s>"])
            .with_temperature(0.0);

        let (result, tokens) = run_collect(&mut *ctx, &EngineConfig::default(), &mut cache, &request);
        let result = result.unwrap();
        assert_eq!(result.text, "Hello");
        assert_eq!(result.stop_reason, StopReason::StopSequence("</s>".into()));
        assert_eq!(result.token_count, 1);
        let streamed: String = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(streamed, "Hello");
    }

    #[test]
    fn test_max_tokens_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), StubScript::words("one two three four five"), 256);
        let mut cache = PromptCache::default();
        let request = GenerationRequest::new("count")
            .with_stop_sequences(Vec::<String>::new())
            .with_max_tokens(3);

        let (result, tokens) = run_collect(&mut *ctx, &EngineConfig::default(), &mut cache, &request);
        let result = result.unwrap();
        assert_eq!(result.stop_reason, StopReason::MaxTokens);
        assert_eq!(result.text, "one two three");
        assert_eq!(result.timings.predicted_n, 3);
        let indices: Vec<usize> = tokens.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_end_of_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), StubScript::pieces(["a", "b"]), 256);
        let mut cache = PromptCache::default();
        let request = GenerationRequest::new("x").with_stop_sequences(Vec::<String>::new());

        let (result, _) = run_collect(&mut *ctx, &EngineConfig::default(), &mut cache, &request);
        let result = result.unwrap();
        assert_eq!(result.text, "ab");
        assert_eq!(result.stop_reason, StopReason::EndOfGeneration);
    }

    #[test]
    fn test_decode_failure_keeps_streamed_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), StubScript::words("a b c d").with_fail_at(1), 256);
        let mut cache = PromptCache::default();
        let request = GenerationRequest::new("x").with_stop_sequences(Vec::<String>::new());

        let (result, tokens) = run_collect(&mut *ctx, &EngineConfig::default(), &mut cache, &request);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Generation);
        let streamed: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(streamed, vec!["a", " b"]);
        assert!(cache.tokens().is_none());
    }

    #[test]
    fn test_context_exhausted_without_shift() {
        let dir = tempfile::tempdir().unwrap();
        let script = StubScript::pieces(vec!["x"; 40]);
        let mut ctx = context(dir.path(), script, 16);
        let mut cache = PromptCache::default();
        let config = EngineConfig {
            context_shift: false,
            ..Default::default()
        };
        let request = GenerationRequest::new("abcd").with_stop_sequences(Vec::<String>::new());

        let (result, _) = run_collect(&mut *ctx, &config, &mut cache, &request);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("context window exhausted"));
    }

    #[test]
    fn test_context_shift_continues() {
        let dir = tempfile::tempdir().unwrap();
        let script = StubScript::pieces(vec!["x"; 40]);
        let mut ctx = context(dir.path(), script, 16);
        let mut cache = PromptCache::default();
        let config = EngineConfig {
            n_keep: 2,
            ..Default::default()
        };
        let request = GenerationRequest::new("abcd").with_stop_sequences(Vec::<String>::new());

        let (result, _) = run_collect(&mut *ctx, &config, &mut cache, &request);
        let result = result.unwrap();
        assert_eq!(result.token_count, 40);
        assert_eq!(result.stop_reason, StopReason::EndOfGeneration);
        assert!(ctx.kv_used() <= 16);
        // A shifted cache no longer mirrors the token history.
        assert!(cache.tokens().is_none());

        // So the follow-up evaluates its whole prompt again.
        let (again, _) = run_collect(&mut *ctx, &config, &mut cache, &request);
        assert_eq!(again.unwrap().timings.prompt_n, 2);
    }

    #[test]
    fn test_prompt_prefix_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), StubScript::pieces(["ok"]), 512);
        let mut cache = PromptCache::default();
        let config = EngineConfig::default();

        let first = GenerationRequest::new("The quick brown fox jumps over the lazy dog.");
        let (r1, _) = run_collect(&mut *ctx, &config, &mut cache, &first);
        let r1 = r1.unwrap();
        assert_eq!(r1.timings.prompt_n, 12);

        let second = GenerationRequest::new("The quick brown fox jumps over the lazy dog. Again!");
        let (r2, _) = run_collect(&mut *ctx, &config, &mut cache, &second);
        let r2 = r2.unwrap();
        assert!(r2.timings.prompt_n < r1.timings.prompt_n);
        assert_eq!(r2.text, "ok");
    }

    #[test]
    fn test_cancel_during_prompt_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), StubScript::pieces(["ok"]), 256);
        let mut cache = PromptCache::default();
        let config = EngineConfig {
            n_batch: 4,
            ..Default::default()
        };
        let prompt = "The quick brown fox jumps over the lazy dog.";
        let request = GenerationRequest::new(prompt);

        // Cancelled before the second of three prompt batches.
        let calls = std::cell::Cell::new(0);
        let cancelled = || {
            calls.set(calls.get() + 1);
            calls.get() > 1
        };
        let result = GenerationEngine::new(&mut *ctx, &config, &mut cache)
            .run(&request, &text_plan(prompt), None, &cancelled, &mut |_| true)
            .unwrap();
        assert_eq!(result.stop_reason, StopReason::Cancelled);
        assert_eq!(result.timings.prompt_n, 4);
        assert_eq!(ctx.kv_used(), 4);
        assert!(cache.tokens().is_none());

        let (again, _) = run_collect(&mut *ctx, &config, &mut cache, &request);
        let again = again.unwrap();
        assert_eq!(again.timings.prompt_n, 12);
        assert_eq!(again.text, "ok");
        assert_eq!(ctx.kv_used(), 13);
        assert_eq!(cache.tokens().map(<[TokenId]>::len), Some(13));
    }

    #[test]
    fn test_media_prompt_starts_with_bos_and_drops_cache() {
        use crate::multimodal::preprocessor::DEFAULT_MEDIA_MARKER;

        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), StubScript::pieces(["ok"]), 512);
        let projector = dir.path().join("mmproj.gguf");
        std::fs::write(&projector, b"GGUF").unwrap();
        let support = ctx.init_multimodal(&projector).unwrap();
        let image = dir.path().join("bike.png");
        std::fs::write(&image, b"\x89PNG").unwrap();
        let mut cache = PromptCache::default();
        let config = EngineConfig::default();

        let text = GenerationRequest::new("Describe");
        let (first, _) = run_collect(&mut *ctx, &config, &mut cache, &text);
        assert_eq!(first.unwrap().timings.prompt_n, 3);
        assert!(cache.tokens().is_some());

        let prompt = "<__media__>Describe";
        let plan = preprocessor::prepare(prompt, &[image.clone()], DEFAULT_MEDIA_MARKER).unwrap();
        let request = GenerationRequest::new(prompt).with_media(vec![image]);
        let result = GenerationEngine::new(&mut *ctx, &config, &mut cache)
            .run(&request, &plan, Some(support), &|| false, &mut |_| true)
            .unwrap();
        // BOS, 64 image positions, then two text tokens.
        assert_eq!(result.timings.prompt_n, 67);
        assert_eq!(result.text, "ok");
        assert!(cache.tokens().is_none());

        let (after, _) = run_collect(&mut *ctx, &config, &mut cache, &text);
        assert_eq!(after.unwrap().timings.prompt_n, 3);
    }

    #[test]
    fn test_cancel_before_first_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), StubScript::words("a b c"), 256);
        let mut cache = PromptCache::default();
        let request = GenerationRequest::new("x");
        let mut tokens = Vec::new();

        let result = GenerationEngine::new(&mut *ctx, &EngineConfig::default(), &mut cache)
            .run(&request, &text_plan("x"), None, &|| true, &mut |t| {
                tokens.push(t);
                true
            })
            .unwrap();
        assert_eq!(result.stop_reason, StopReason::Cancelled);
        assert!(tokens.is_empty());
        assert_eq!(result.token_count, 0);
        assert_eq!(result.tokens_per_second, 0.0);
    }

    #[test]
    fn test_request_validation() {
        assert!(GenerationRequest::new("x").validate().is_ok());
        assert!(GenerationRequest::new("x").with_temperature(-0.1).validate().is_err());
        assert!(GenerationRequest::new("x").with_temperature(f32::NAN).validate().is_err());
        assert!(GenerationRequest::new("x").with_top_p(0.0).validate().is_err());
    }

    #[test]
    fn test_stop_sequences_are_deduplicated() {
        let request = GenerationRequest::new("x").with_stop_sequences(["</s>", "\n", "</s>"]);
        assert_eq!(request.stop_sequences, vec!["</s>", "\n"]);
    }
}
