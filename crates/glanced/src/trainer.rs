//! Full retrain of the recognition gallery from the capture store.

use crate::engine::{EngineError, EngineHandle};
use crate::store::{CaptureStore, StoreError};
use glance_core::{Gallery, GalleryEntry, GalleryError};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("engine unavailable: {0}")]
    Engine(#[from] EngineError),
}

/// What a training run processed, for the response message and the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainSummary {
    pub users: usize,
    pub images: usize,
    pub skipped: usize,
}

impl fmt::Display for TrainSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.users == 0 {
            write!(f, "no usable enrollment images found; saved an empty gallery")
        } else {
            write!(
                f,
                "trained {} user(s) from {} image(s), {} skipped",
                self.users, self.images, self.skipped
            )
        }
    }
}

/// Rebuild the gallery from every capture image and persist it atomically.
///
/// This is a full retrain over the whole labeled set, not an incremental
/// update. Unreadable or faceless images are skipped with a warning; an empty
/// store produces an empty gallery rather than an error. The artifact on disk
/// is only ever replaced whole.
pub async fn train(
    store: &CaptureStore,
    engine: &EngineHandle,
    artifact_path: &Path,
) -> Result<(Gallery, TrainSummary), TrainError> {
    let labeled = store.labeled_images()?;
    tracing::info!(images = labeled.len(), "training started");

    let mut entries = Vec::new();
    let mut users = BTreeSet::new();
    let mut skipped = 0usize;

    for (user_id, path) in labeled {
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable capture");
                skipped += 1;
                continue;
            }
        };

        let image = match image::load_from_memory(&bytes) {
            Ok(image) => image.to_luma8(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping undecodable capture");
                skipped += 1;
                continue;
            }
        };

        let observations = match engine.analyze(image).await {
            Ok(observations) => observations,
            Err(EngineError::ChannelClosed) => return Err(EngineError::ChannelClosed.into()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping capture after inference failure");
                skipped += 1;
                continue;
            }
        };

        // Observations arrive sorted by detection confidence; the first is
        // the enrollment subject.
        let Some(observation) = observations.into_iter().next() else {
            tracing::warn!(path = %path.display(), "skipping capture with no detectable face");
            skipped += 1;
            continue;
        };

        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        users.insert(user_id.clone());
        entries.push(GalleryEntry {
            id: Uuid::new_v4(),
            user_id,
            source,
            embedding: observation.embedding,
        });
    }

    let summary = TrainSummary {
        users: users.len(),
        images: entries.len(),
        skipped,
    };

    let gallery = Gallery::new(entries);
    gallery.save(artifact_path)?;
    tracing::info!(%summary, "training complete");

    Ok((gallery, summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_display() {
        let summary = TrainSummary { users: 2, images: 5, skipped: 1 };
        assert_eq!(summary.to_string(), "trained 2 user(s) from 5 image(s), 1 skipped");
    }

    #[test]
    fn test_summary_display_empty() {
        let summary = TrainSummary { users: 0, images: 0, skipped: 0 };
        assert_eq!(
            summary.to_string(),
            "no usable enrollment images found; saved an empty gallery"
        );
    }
}
