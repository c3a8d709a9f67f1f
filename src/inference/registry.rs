//! Model registry: model/projector file pairs and their load state.
//!
//! Resolution only reads the filesystem (existence and read permission);
//! it never opens the model with the backend. Loading is the session's job,
//! which reports back through [`ModelRegistry::mark_loaded`].

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::error::{Result, SessionError};
use crate::session::SessionId;

/// Everything needed to construct a native context. Immutable once a
/// session is created from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Path to the model file.
    pub path: PathBuf,

    /// Context size in tokens.
    pub context_size: u32,

    /// Number of GPU layers to offload.
    pub gpu_layers: i32,

    /// Shift the KV cache instead of failing when the context fills up.
    pub context_shift: bool,

    /// Multimodal projector paired with the model.
    pub projector_path: Option<PathBuf>,

    /// Create an embedding-only context.
    pub embedding: bool,

    /// Batch size for prompt processing.
    pub n_batch: u32,

    /// Number of threads for computation.
    pub n_threads: u32,
}

impl ModelDescriptor {
    /// Descriptor for `path` with the default model settings.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::from_config(path, &ModelConfig::default())
    }

    pub fn from_config(path: impl Into<PathBuf>, config: &ModelConfig) -> Self {
        Self {
            path: path.into(),
            context_size: config.context_size,
            gpu_layers: config.n_gpu_layers,
            context_shift: config.context_shift,
            projector_path: None,
            embedding: config.embedding,
            n_batch: config.n_batch,
            n_threads: config.n_threads,
        }
    }

    /// File name for status messages.
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("model")
            .to_string()
    }
}

/// Whether a registered model is backing a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loaded { session: SessionId },
}

/// One model/projector pair known to the registry.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub descriptor: ModelDescriptor,

    /// Model file size in bytes.
    pub file_size: u64,

    /// Projector file size in bytes.
    pub projector_size: Option<u64>,

    pub state: LoadState,
}

/// Check that `path` is a regular, readable file. Returns its size.
pub(crate) fn check_readable(path: &Path) -> Result<u64> {
    let metadata =
        std::fs::metadata(path).map_err(|e| SessionError::not_found(path, Some(e)))?;
    if !metadata.is_file() {
        return Err(SessionError::not_found(path, None));
    }
    File::open(path).map_err(|e| SessionError::not_found(path, Some(e)))?;
    Ok(metadata.len())
}

/// Registry of model files, keyed by model path.
pub struct ModelRegistry {
    defaults: ModelConfig,
    entries: RwLock<HashMap<PathBuf, RegistryEntry>>,
}

impl ModelRegistry {
    pub fn new(defaults: ModelConfig) -> Self {
        Self {
            defaults,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Validate a model (and optional projector) and return its descriptor.
    ///
    /// Re-resolving a known path refreshes the file sizes and projector but
    /// keeps the load state.
    pub fn resolve(&self, model_path: &Path, projector_path: Option<&Path>) -> Result<ModelDescriptor> {
        let file_size = check_readable(model_path)?;
        let projector_size = projector_path.map(check_readable).transpose()?;

        let mut descriptor = ModelDescriptor::from_config(model_path, &self.defaults);
        descriptor.projector_path = projector_path.map(Path::to_path_buf);

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let state = entries
            .get(model_path)
            .map(|e| e.state)
            .unwrap_or(LoadState::Unloaded);
        entries.insert(
            model_path.to_path_buf(),
            RegistryEntry {
                descriptor: descriptor.clone(),
                file_size,
                projector_size,
                state,
            },
        );

        info!(
            model = %model_path.display(),
            file_size,
            projector = projector_path.map(|p| p.display().to_string()),
            n_ctx = descriptor.context_size,
            "Resolved model"
        );

        Ok(descriptor)
    }

    /// Record that `session` holds a context for the model.
    pub fn mark_loaded(&self, model_path: &Path, session: SessionId) {
        self.set_state(model_path, LoadState::Loaded { session });
    }

    /// Record that the model no longer backs a session.
    pub fn mark_unloaded(&self, model_path: &Path) {
        self.set_state(model_path, LoadState::Unloaded);
    }

    fn set_state(&self, model_path: &Path, state: LoadState) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(model_path) {
            debug!(model = %model_path.display(), ?state, "Registry state change");
            entry.state = state;
        }
    }

    pub fn get(&self, model_path: &Path) -> Option<RegistryEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model_path)
            .cloned()
    }

    /// All entries, sorted by path.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.descriptor.path.cmp(&b.descriptor.path));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_resolve_uses_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let model = write_file(dir.path(), "gemma.gguf", b"GGUF....");
        let config = ModelConfig {
            context_size: 4096,
            context_shift: false,
            ..Default::default()
        };
        let registry = ModelRegistry::new(config);

        let descriptor = registry.resolve(&model, None).unwrap();
        assert_eq!(descriptor.path, model);
        assert_eq!(descriptor.context_size, 4096);
        assert!(!descriptor.context_shift);
        assert_eq!(descriptor.projector_path, None);

        let entry = registry.get(&model).unwrap();
        assert_eq!(entry.file_size, 8);
        assert_eq!(entry.state, LoadState::Unloaded);
    }

    #[test]
    fn test_missing_model_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(ModelConfig::default());
        let err = registry
            .resolve(&dir.path().join("missing.gguf"), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(registry.entries().is_empty());
    }

    #[test]
    fn test_missing_projector_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let model = write_file(dir.path(), "smolvlm.gguf", b"GGUF");
        let registry = ModelRegistry::new(ModelConfig::default());
        let err = registry
            .resolve(&model, Some(&dir.path().join("mmproj.gguf")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_directory_is_not_a_model() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(ModelConfig::default());
        let err = registry.resolve(dir.path(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_load_state_survives_re_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let model = write_file(dir.path(), "smolvlm.gguf", b"GGUF");
        let projector = write_file(dir.path(), "mmproj.gguf", b"GGUF");
        let registry = ModelRegistry::new(ModelConfig::default());

        registry.resolve(&model, None).unwrap();
        registry.mark_loaded(&model, 7);
        let descriptor = registry.resolve(&model, Some(&projector)).unwrap();
        assert_eq!(descriptor.projector_path.as_deref(), Some(projector.as_path()));

        let entry = registry.get(&model).unwrap();
        assert_eq!(entry.state, LoadState::Loaded { session: 7 });
        assert_eq!(entry.projector_size, Some(4));

        registry.mark_unloaded(&model);
        assert_eq!(registry.get(&model).unwrap().state, LoadState::Unloaded);
    }
}
