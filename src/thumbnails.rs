//! Thumbnail Store (C3): file-backed image storage keyed by diagram id (§4.3).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use base64::Engine;
use thiserror::Error;

/// How long a thumbnail file may outlive its diagram row before the reaper
/// considers it orphaned (§3.2 invariant 9, §4.3).
pub const ORPHAN_GRACE: Duration = Duration::from_secs(5 * 60);

/// Errors raised by the thumbnail store.
#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("unsupported image type in data URL: {0}")]
    UnsupportedType(String),
    #[error("malformed data URL")]
    MalformedDataUrl,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

const ALLOWED_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp", "image/gif"];

/// Replaces any character outside `[A-Za-z0-9_-]` with `_`, eliminating path
/// traversal regardless of what the caller passes as a diagram id.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// File-backed thumbnail storage rooted at a single directory.
#[derive(Debug, Clone)]
pub struct ThumbnailStore {
    root: PathBuf,
}

impl ThumbnailStore {
    /// Opens (creating if needed) a thumbnail store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.png", sanitize_id(id)))
    }

    /// Decodes `data_url` and writes it to disk keyed by `id`.
    ///
    /// Only `image/png|jpeg|webp|gif` data URLs are accepted (no SVG, to avoid
    /// script payloads); the decoded bytes are always written with a `.png`
    /// extension regardless of source mime type, matching §4.3's fixed
    /// on-disk naming.
    pub fn save(&self, id: &str, data_url: &str) -> Result<(), ThumbnailError> {
        let (mime, b64_payload) = parse_data_url(data_url)?;
        if !ALLOWED_MIME_TYPES.contains(&mime.as_str()) {
            return Err(ThumbnailError::UnsupportedType(mime));
        }
        let bytes = base64::engine::general_purpose::STANDARD.decode(b64_payload)?;
        std::fs::write(self.path_for(id), bytes)?;
        Ok(())
    }

    /// Loads the stored image for `id` and re-encodes it as a `data:image/png`
    /// URL, or `None` if no thumbnail exists.
    pub fn load(&self, id: &str) -> Result<Option<String>, ThumbnailError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(Some(format!("data:image/png;base64,{encoded}")))
    }

    /// Returns `true` iff a thumbnail file exists for `id`.
    pub fn exists(&self, id: &str) -> bool {
        self.path_for(id).exists()
    }

    /// Deletes the thumbnail for `id`, if any. A missing file is not an error.
    pub fn delete(&self, id: &str) -> Result<(), ThumbnailError> {
        let path = self.path_for(id);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists the sanitized ids of every stored thumbnail.
    pub fn list(&self) -> Result<Vec<String>, ThumbnailError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        Ok(ids)
    }

    /// Deletes every file whose id is absent from `existing_ids` *and* whose
    /// mtime is older than `min_age` (§3.2 invariant 9, §4.3, §8 scenario 6).
    ///
    /// A file newer than `min_age` is preserved even if its id is unknown,
    /// since it may belong to a `save` still in flight concurrently with a
    /// diagram creation that hasn't committed yet.
    pub fn cleanup_orphans(
        &self,
        existing_ids: &HashSet<String>,
        min_age: Duration,
    ) -> Result<Vec<String>, ThumbnailError> {
        let mut deleted = Vec::new();
        let now = SystemTime::now();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if existing_ids.contains(&stem) {
                continue;
            }
            let age = match entry.metadata().and_then(|m| m.modified()) {
                Ok(mtime) => now.duration_since(mtime).unwrap_or(Duration::ZERO),
                Err(_) => continue,
            };
            if age < min_age {
                continue;
            }
            if std::fs::remove_file(&path).is_ok() {
                deleted.push(stem);
            }
        }
        Ok(deleted)
    }

    /// The directory this store is rooted at.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Parses a `data:<mime>;base64,<payload>` URL into `(mime, payload)`.
fn parse_data_url(data_url: &str) -> Result<(String, &str), ThumbnailError> {
    let rest = data_url.strip_prefix("data:").ok_or(ThumbnailError::MalformedDataUrl)?;
    let (header, payload) = rest.split_once(',').ok_or(ThumbnailError::MalformedDataUrl)?;
    let mime = header.strip_suffix(";base64").ok_or(ThumbnailError::MalformedDataUrl)?;
    Ok((mime.to_string(), payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY_PNG_B64: &str =
        "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNk+A8AAQUBAScY42YAAAAASUVORK5CYII=";

    #[test]
    fn sanitize_strips_traversal_characters() {
        assert_eq!(sanitize_id("../../etc/passwd"), "______etc_passwd");
        assert_eq!(sanitize_id("abc-123_DEF"), "abc-123_DEF");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThumbnailStore::open(dir.path()).unwrap();
        let data_url = format!("data:image/png;base64,{TINY_PNG_B64}");
        store.save("abc", &data_url).unwrap();
        assert!(store.exists("abc"));
        let loaded = store.load("abc").unwrap().unwrap();
        assert!(loaded.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn rejects_svg_mime_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThumbnailStore::open(dir.path()).unwrap();
        let data_url = "data:image/svg+xml;base64,PHN2Zy8+";
        assert!(matches!(store.save("x", data_url), Err(ThumbnailError::UnsupportedType(_))));
    }

    #[test]
    fn cleanup_orphans_preserves_known_and_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThumbnailStore::open(dir.path()).unwrap();
        let data_url = format!("data:image/png;base64,{TINY_PNG_B64}");
        store.save("known", &data_url).unwrap();
        store.save("fresh-orphan", &data_url).unwrap();

        let existing: HashSet<String> = ["known".to_string()].into_iter().collect();
        let deleted = store.cleanup_orphans(&existing, Duration::from_secs(3600)).unwrap();
        assert!(deleted.is_empty());
        assert!(store.exists("fresh-orphan"));
    }

    #[test]
    fn cleanup_orphans_deletes_old_unknown_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThumbnailStore::open(dir.path()).unwrap();
        let data_url = format!("data:image/png;base64,{TINY_PNG_B64}");
        store.save("stale-orphan", &data_url).unwrap();

        let existing = HashSet::new();
        let deleted = store.cleanup_orphans(&existing, Duration::from_secs(0)).unwrap();
        assert_eq!(deleted, vec!["stale-orphan".to_string()]);
        assert!(!store.exists("stale-orphan"));
    }
}
