//! Prompt/media binding and projector embedding.
//!
//! A prompt carries one marker per media item. [`prepare`] splits the prompt
//! at the markers and binds the n-th marker to the n-th media path; [`embed`]
//! runs the projector over the media so the engine can evaluate text chunks
//! and embeddings in prompt order.

use std::path::PathBuf;

use tracing::debug;

use crate::error::{Result, SessionError};
use crate::inference::backend::{Embedding, MultimodalSupport, NativeContext};
use crate::multimodal::media::{MediaInput, MediaKind};

/// Marker understood by llama.cpp-style multimodal chat templates.
pub const DEFAULT_MEDIA_MARKER: &str = "<__media__>";

/// A piece of the prompt in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptChunk {
    Text(String),
    /// Index into [`PromptPlan::media`].
    Media(usize),
}

/// A validated prompt ready for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPlan {
    pub chunks: Vec<PromptChunk>,
    pub media: Vec<MediaInput>,
}

impl PromptPlan {
    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }
}

/// Split `prompt` at each `marker`. Empty text between markers is dropped.
pub fn split_prompt(prompt: &str, marker: &str, media_count: usize) -> Result<Vec<PromptChunk>> {
    if marker.is_empty() {
        return Err(SessionError::InvalidRequest(
            "media marker must not be empty".to_string(),
        ));
    }

    let markers = prompt.matches(marker).count();
    if markers != media_count {
        return Err(SessionError::PlaceholderMismatch {
            markers,
            media: media_count,
        });
    }

    let mut chunks = Vec::with_capacity(markers * 2 + 1);
    for (i, text) in prompt.split(marker).enumerate() {
        if i > 0 {
            chunks.push(PromptChunk::Media(i - 1));
        }
        if !text.is_empty() {
            chunks.push(PromptChunk::Text(text.to_string()));
        }
    }
    Ok(chunks)
}

/// Check marker counts, then validate every media path.
pub fn prepare(prompt: &str, media_paths: &[PathBuf], marker: &str) -> Result<PromptPlan> {
    let chunks = split_prompt(prompt, marker, media_paths.len())?;
    let media = media_paths
        .iter()
        .map(|p| MediaInput::validate(p))
        .collect::<Result<Vec<_>>>()?;
    Ok(PromptPlan { chunks, media })
}

/// Projector output for every media item of a prompt, in media order.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingBlock {
    pub embeddings: Vec<Embedding>,
}

impl EmbeddingBlock {
    /// Context positions the block occupies.
    pub fn n_tokens(&self) -> usize {
        self.embeddings.iter().map(|e| e.n_tokens).sum()
    }
}

/// Encode every media item with the loaded projector.
pub fn embed(
    ctx: &mut dyn NativeContext,
    support: MultimodalSupport,
    media: &[MediaInput],
) -> Result<EmbeddingBlock> {
    let mut embeddings = Vec::with_capacity(media.len());
    for item in media {
        let supported = match item.kind {
            MediaKind::Image => support.vision,
            MediaKind::Audio => support.audio,
        };
        if !supported {
            return Err(SessionError::UnsupportedMedia {
                path: item.path.clone(),
                mime: item.mime.to_string(),
            });
        }

        let bytes = item.read_bytes()?;
        let embedding = ctx
            .encode_media(item, &bytes)
            .map_err(SessionError::from_decode)?;
        debug!(
            path = %item.path.display(),
            kind = %item.kind,
            n_tokens = embedding.n_tokens,
            "Encoded media"
        );
        embeddings.push(embedding);
    }
    Ok(EmbeddingBlock { embeddings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_single_placeholder() {
        let chunks = split_prompt("Describe <__media__>", DEFAULT_MEDIA_MARKER, 1).unwrap();
        assert_eq!(
            chunks,
            vec![PromptChunk::Text("Describe ".into()), PromptChunk::Media(0)]
        );
    }

    #[test]
    fn test_two_placeholders_one_path() {
        let err = split_prompt("<__media__> vs <__media__>", DEFAULT_MEDIA_MARKER, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlaceholderMismatch);
        match err {
            SessionError::PlaceholderMismatch { markers, media } => {
                assert_eq!(markers, 2);
                assert_eq!(media, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_media_without_marker() {
        let err = split_prompt("Describe this", DEFAULT_MEDIA_MARKER, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlaceholderMismatch);
    }

    #[test]
    fn test_order_follows_markers() {
        let chunks = split_prompt("<__media__>A<__media__><__media__>B", DEFAULT_MEDIA_MARKER, 3).unwrap();
        assert_eq!(
            chunks,
            vec![
                PromptChunk::Media(0),
                PromptChunk::Text("A".into()),
                PromptChunk::Media(1),
                PromptChunk::Media(2),
                PromptChunk::Text("B".into()),
            ]
        );
    }

    #[test]
    fn test_custom_marker() {
        let chunks = split_prompt("look: <image>\n", "<image>", 1).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(split_prompt("x", "", 0).is_err());
    }

    #[test]
    fn test_prepare_checks_markers_before_files() {
        // The path does not exist, but the count mismatch is reported first.
        let err = prepare(
            "<__media__><__media__>",
            &[PathBuf::from("/nonexistent/a.png")],
            DEFAULT_MEDIA_MARKER,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlaceholderMismatch);
    }

    #[test]
    fn test_prepare_binds_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        std::fs::write(&a, b"\x89PNG").unwrap();

        let plan = prepare("Describe <__media__>", &[a.clone()], DEFAULT_MEDIA_MARKER).unwrap();
        assert!(plan.has_media());
        assert_eq!(plan.media[0].path, a);
        assert_eq!(plan.media[0].mime, "image/png");
    }
}
