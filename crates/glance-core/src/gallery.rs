//! The trained recognition gallery — the single on-disk model artifact.
//!
//! A gallery is the full set of labeled embeddings produced by a training
//! run. It is replaced atomically on retrain (write-new-then-rename), and a
//! missing file is simply the untrained state, not an error.

use crate::types::{Embedding, GalleryEntry, Match};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;

pub const GALLERY_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed gallery file: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported gallery version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gallery {
    pub version: u32,
    /// RFC 3339 timestamp of the training run; `None` until first trained.
    pub trained_at: Option<String>,
    pub entries: Vec<GalleryEntry>,
}

impl Gallery {
    /// The untrained state: no entries, never trained.
    pub fn empty() -> Self {
        Self {
            version: GALLERY_VERSION,
            trained_at: None,
            entries: Vec::new(),
        }
    }

    /// A freshly trained gallery, stamped with the current time.
    pub fn new(entries: Vec<GalleryEntry>) -> Self {
        Self {
            version: GALLERY_VERSION,
            trained_at: Some(chrono::Utc::now().to_rfc3339()),
            entries,
        }
    }

    /// Load the gallery from disk. A missing file yields the empty
    /// (untrained) gallery; a present-but-unreadable file is an error.
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::empty()),
            Err(e) => return Err(e.into()),
        };

        let gallery: Gallery = serde_json::from_slice(&data)?;
        if gallery.version != GALLERY_VERSION {
            return Err(GalleryError::UnsupportedVersion(gallery.version));
        }
        Ok(gallery)
    }

    /// Persist the gallery, replacing any prior artifact atomically: the new
    /// content is written to a sibling temp file and renamed over the target,
    /// so concurrent readers see the old or the new artifact in full.
    pub fn save(&self, path: &Path) -> Result<(), GalleryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;

        tracing::debug!(path = %path.display(), entries = self.entries.len(), "gallery saved");
        Ok(())
    }

    /// Delete the on-disk artifact. Already absent is fine.
    pub fn remove_file(path: &Path) -> Result<(), GalleryError> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Match a probe embedding against every entry and apply the known/unknown
    /// threshold. The full gallery is always scanned.
    pub fn best_match(&self, probe: &Embedding, threshold: f32) -> Match {
        let mut best_similarity = f32::NEG_INFINITY;
        let mut best_user: Option<&str> = None;

        for entry in &self.entries {
            let similarity = probe.similarity(&entry.embedding);
            if similarity > best_similarity {
                best_similarity = similarity;
                best_user = Some(&entry.user_id);
            }
        }

        if best_similarity >= threshold {
            Match {
                user_id: best_user.map(str::to_owned),
                similarity: best_similarity,
            }
        } else {
            Match {
                user_id: None,
                similarity: if best_similarity == f32::NEG_INFINITY {
                    0.0
                } else {
                    best_similarity
                },
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(user_id: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            source: "capture.jpg".to_string(),
            embedding: Embedding { values },
        }
    }

    #[test]
    fn test_load_missing_file_is_untrained() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Gallery::load(&dir.path().join("gallery.json")).unwrap();
        assert!(gallery.is_empty());
        assert!(gallery.trained_at.is_none());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");

        let gallery = Gallery::new(vec![entry("alice", vec![1.0, 0.0]), entry("bob", vec![0.0, 1.0])]);
        gallery.save(&path).unwrap();

        let loaded = Gallery::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.entries[0].user_id, "alice");
        assert_eq!(loaded.trained_at, gallery.trained_at);
    }

    #[test]
    fn test_save_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");

        Gallery::new(vec![entry("alice", vec![1.0, 0.0])]).save(&path).unwrap();
        Gallery::new(vec![entry("bob", vec![0.0, 1.0])]).save(&path).unwrap();

        let loaded = Gallery::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.entries[0].user_id, "bob");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_malformed_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(Gallery::load(&path), Err(GalleryError::Malformed(_))));
    }

    #[test]
    fn test_load_rejects_future_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        let mut gallery = Gallery::new(vec![]);
        gallery.version = GALLERY_VERSION + 1;
        std::fs::write(&path, serde_json::to_vec(&gallery).unwrap()).unwrap();
        assert!(matches!(
            Gallery::load(&path),
            Err(GalleryError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_best_match_above_threshold() {
        let gallery = Gallery::new(vec![
            entry("alice", vec![1.0, 0.0, 0.0]),
            entry("bob", vec![0.0, 1.0, 0.0]),
        ]);
        let probe = Embedding { values: vec![0.9, 0.1, 0.0] };

        let found = gallery.best_match(&probe, 0.4);
        assert_eq!(found.user_id.as_deref(), Some("alice"));
        assert!(found.similarity > 0.9);
    }

    #[test]
    fn test_best_match_below_threshold_is_unknown() {
        let gallery = Gallery::new(vec![entry("alice", vec![1.0, 0.0])]);
        let probe = Embedding { values: vec![0.0, 1.0] };

        let found = gallery.best_match(&probe, 0.4);
        assert!(found.user_id.is_none());
        assert!(found.similarity.abs() < 1e-6);
    }

    #[test]
    fn test_best_match_empty_gallery() {
        let gallery = Gallery::empty();
        let probe = Embedding { values: vec![1.0, 0.0] };

        let found = gallery.best_match(&probe, 0.4);
        assert!(found.user_id.is_none());
        assert_eq!(found.similarity, 0.0);
    }

    #[test]
    fn test_best_match_scans_all_entries() {
        // Best match last in the list must still win.
        let gallery = Gallery::new(vec![
            entry("decoy1", vec![0.0, 1.0, 0.0]),
            entry("decoy2", vec![0.0, 0.0, 1.0]),
            entry("target", vec![1.0, 0.0, 0.0]),
        ]);
        let probe = Embedding { values: vec![1.0, 0.0, 0.0] };

        let found = gallery.best_match(&probe, 0.5);
        assert_eq!(found.user_id.as_deref(), Some("target"));
        assert!((found.similarity - 1.0).abs() < 1e-6);
    }
}
