//! Media validation and MIME mapping.

use std::path::{Path, PathBuf};

use crate::error::{Result, SessionError};
use crate::inference::registry::check_readable;

/// Fallback MIME type for unknown extensions. Never accepted as input.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Which projector path a media item goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Image => write!(f, "image"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// MIME type for a path, matched case-insensitively on the extension.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        _ => OCTET_STREAM,
    }
}

pub fn kind_for_mime(mime: &str) -> Option<MediaKind> {
    if mime.starts_with("image/") {
        Some(MediaKind::Image)
    } else if mime.starts_with("audio/") {
        Some(MediaKind::Audio)
    } else {
        None
    }
}

/// A media reference that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInput {
    pub path: PathBuf,
    pub mime: &'static str,
    pub kind: MediaKind,
    pub size: u64,
}

impl MediaInput {
    /// Validate `path`: readable regular file with a supported extension.
    pub fn validate(path: &Path) -> Result<Self> {
        let size = check_readable(path)?;
        let mime = mime_for_path(path);
        let kind = kind_for_mime(mime).ok_or_else(|| SessionError::UnsupportedMedia {
            path: path.to_path_buf(),
            mime: mime.to_string(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            mime,
            kind,
            size,
        })
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path).map_err(|e| SessionError::not_found(&self.path, Some(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_mime_mapping() {
        assert_eq!(mime_for_path(Path::new("photo.PNG")), "image/png");
        assert_eq!(mime_for_path(Path::new("a/b/c.jpeg")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("shot.JpG")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("clip.wav")), "audio/wav");
        assert_eq!(mime_for_path(Path::new("song.Mp3")), "audio/mpeg");
        assert_eq!(mime_for_path(Path::new("movie.mp4")), OCTET_STREAM);
        assert_eq!(mime_for_path(Path::new("no_extension")), OCTET_STREAM);
    }

    #[test]
    fn test_validate_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();

        let err = MediaInput::validate(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedMedia);
    }

    #[test]
    fn test_validate_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = MediaInput::validate(&dir.path().join("bike.png")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_validate_accepts_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Voice.WAV");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        let media = MediaInput::validate(&path).unwrap();
        assert_eq!(media.kind, MediaKind::Audio);
        assert_eq!(media.mime, "audio/wav");
        assert_eq!(media.size, 2048);
        assert_eq!(media.read_bytes().unwrap().len(), 2048);
    }
}
