//! Shared fixtures: model, projector and media files in a temp dir.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use llama_session::inference::registry::ModelDescriptor;
use llama_session::inference::stub::{StubBackend, StubCounters, StubScript};
use llama_session::Session;

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// A file the stub backend accepts as a GGUF model or projector.
pub fn gguf(dir: &Path, name: &str) -> PathBuf {
    write_file(dir, name, b"GGUF\x03\x00\x00\x00")
}

pub fn png(dir: &Path, name: &str) -> PathBuf {
    write_file(dir, name, &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a])
}

/// Two seconds of silence-sized audio (2048 bytes).
pub fn wav(dir: &Path, name: &str) -> PathBuf {
    write_file(dir, name, &[0u8; 2048])
}

/// A session over a fresh model file, plus the backend's counters.
pub fn session_with(
    dir: &Path,
    descriptor: impl FnOnce(&mut ModelDescriptor),
    script: StubScript,
) -> (Session, Arc<StubCounters>) {
    let mut desc = ModelDescriptor::new(gguf(dir, "model.gguf"));
    descriptor(&mut desc);
    let backend = StubBackend::new(script);
    let counters = backend.counters();
    (Session::create(desc, Arc::new(backend)), counters)
}

pub fn session(dir: &Path, script: StubScript) -> (Session, Arc<StubCounters>) {
    session_with(dir, |_| {}, script)
}

/// `n` single-character pieces.
pub fn repeat_script(n: usize) -> StubScript {
    StubScript::pieces(vec!["x"; n])
}

/// Poll `cond` every 5ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
