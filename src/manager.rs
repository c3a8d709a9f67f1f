//! Session manager: the context-id keyed front door.
//!
//! Resolves model files through the [`ModelRegistry`], creates and loads
//! sessions against one backend, and keeps them addressable by id until
//! released. Every session shares the manager's notifier and settings.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::inference::backend::NativeBackend;
use crate::inference::registry::{LoadState, ModelRegistry};
use crate::notify::{SharedNotifier, TracingNotifier};
use crate::session::{Session, SessionId, SessionSettings, SessionState};

pub struct SessionManager {
    backend: Arc<dyn NativeBackend>,
    registry: ModelRegistry,
    notifier: SharedNotifier,
    settings: SessionSettings,
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn NativeBackend>, config: &Config) -> Self {
        Self::with_notifier(backend, config, Arc::new(TracingNotifier))
    }

    pub fn with_notifier(
        backend: Arc<dyn NativeBackend>,
        config: &Config,
        notifier: SharedNotifier,
    ) -> Self {
        Self {
            backend,
            registry: ModelRegistry::new(config.model.clone()),
            notifier,
            settings: SessionSettings::from_config(config),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Resolve, create and load a session; with a projector, attach it too.
    /// All or nothing: on any failure the half-built session is torn down.
    pub async fn init_context(&self, model: &Path, projector: Option<&Path>) -> Result<Session> {
        let descriptor = self.registry.resolve(model, projector)?;
        let session = Session::create_with_settings(
            descriptor,
            self.backend.clone(),
            self.notifier.clone(),
            self.settings.clone(),
        );

        let loaded = async {
            session.load().await?;
            if let Some(projector) = projector {
                session.load_multimodal_projector(projector).await?;
            }
            Ok::<_, SessionError>(())
        }
        .await;
        if let Err(e) = loaded {
            warn!(session = session.id(), error = %e, "Context init failed, releasing session");
            session.teardown().await;
            return Err(e);
        }

        self.registry.mark_loaded(model, session.id());
        self.sessions
            .write()
            .await
            .insert(session.id(), session.clone());
        info!(session = session.id(), state = %session.state(), "Session registered");
        Ok(session)
    }

    /// Attach a projector to a registered session.
    pub async fn init_multimodal(&self, id: SessionId, projector: &Path) -> Result<SessionState> {
        let session = self.session(id).await?;
        session.load_multimodal_projector(projector).await
    }

    pub async fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.read().await.get(&id).cloned()
    }

    async fn session(&self, id: SessionId) -> Result<Session> {
        self.get(id)
            .await
            .ok_or_else(|| SessionError::InvalidRequest(format!("unknown session {id}")))
    }

    /// Ids of registered sessions, ascending.
    pub async fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Tear down and forget a session. `false` if the id is unknown.
    pub async fn release(&self, id: SessionId) -> bool {
        let Some(session) = self.sessions.write().await.remove(&id) else {
            return false;
        };
        session.teardown().await;

        let model = &session.descriptor().path;
        if let Some(entry) = self.registry.get(model) {
            if entry.state == (LoadState::Loaded { session: id }) {
                self.registry.mark_unloaded(model);
            }
        }
        info!(session = id, "Session released");
        true
    }

    pub async fn release_all(&self) {
        for id in self.ids().await {
            self.release(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::inference::stub::{StubBackend, StubScript};

    fn write(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn test_init_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let model = write(dir.path(), "gemma.gguf", b"GGUF");
        let backend = StubBackend::new(StubScript::words("hi"));
        let counters = backend.counters();
        let manager = SessionManager::new(Arc::new(backend), &Config::default());

        let session = manager.init_context(&model, None).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(manager.ids().await, vec![session.id()]);
        assert_eq!(
            manager.registry().get(&model).unwrap().state,
            LoadState::Loaded { session: session.id() }
        );

        assert!(manager.release(session.id()).await);
        assert!(!manager.release(session.id()).await);
        assert_eq!(manager.registry().get(&model).unwrap().state, LoadState::Unloaded);
        assert_eq!(counters.released(), 1);
    }

    #[tokio::test]
    async fn test_failed_projector_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let model = write(dir.path(), "smolvlm.gguf", b"GGUF");
        let projector = write(dir.path(), "mmproj.gguf", b"nope");
        let backend = StubBackend::new(StubScript::default());
        let counters = backend.counters();
        let manager = SessionManager::new(Arc::new(backend), &Config::default());

        let err = manager
            .init_context(&model, Some(&projector))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Load);
        assert!(manager.ids().await.is_empty());
        assert_eq!(counters.allocated(), 1);
        assert_eq!(counters.live(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let manager = SessionManager::new(
            Arc::new(StubBackend::new(StubScript::default())),
            &Config::default(),
        );
        let err = manager
            .init_multimodal(42, Path::new("mmproj.gguf"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(manager.get(42).await.is_none());
    }
}
