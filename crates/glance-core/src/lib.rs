//! glance-core — Face detection and embedding engine wrapper.
//!
//! Wraps SCRFD face detection and ArcFace embedding extraction, both running
//! via ONNX Runtime for CPU inference, and provides the gallery of labeled
//! embeddings that recognition results are matched against.

mod alignment;
pub mod detector;
pub mod embedder;
pub mod gallery;
pub mod types;

pub use detector::{DetectorError, FaceDetector};
pub use embedder::{EmbedderError, FaceEmbedder};
pub use gallery::{Gallery, GalleryError};
pub use types::{Embedding, FaceBox, GalleryEntry, Match};
