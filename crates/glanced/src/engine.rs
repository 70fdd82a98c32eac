//! The inference engine thread.
//!
//! ort sessions require exclusive access, so a dedicated OS thread owns both
//! models and serves requests over a channel. Handlers keep a clone-safe
//! [`EngineHandle`]; all inference — single-shot, streaming and training —
//! funnels through this one thread, which also serializes concurrent
//! streaming sessions at the engine.

use glance_core::{Embedding, FaceBox, FaceDetector, FaceEmbedder};
use image::GrayImage;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] glance_core::DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] glance_core::EmbedderError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One detected face with its embedding, in descending detection confidence
/// order within a frame.
pub struct Observation {
    pub face: FaceBox,
    pub embedding: Embedding,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Analyze {
        image: GrayImage,
        reply: oneshot::Sender<Result<Vec<Observation>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Detect every face in the frame and extract an embedding for each.
    pub async fn analyze(&self, image: GrayImage) -> Result<Vec<Observation>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads both ONNX models synchronously, then enters the request loop.
/// Fails fast at startup if either model is unavailable.
pub fn spawn_engine(detector_path: &str, embedder_path: &str) -> Result<EngineHandle, EngineError> {
    let mut detector = FaceDetector::load(detector_path)?;
    let mut embedder = FaceEmbedder::load(embedder_path)?;

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("glance-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze { image, reply } => {
                        let _ = reply.send(run_analyze(&mut detector, &mut embedder, &image));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx })
}

fn run_analyze(
    detector: &mut FaceDetector,
    embedder: &mut FaceEmbedder,
    image: &GrayImage,
) -> Result<Vec<Observation>, EngineError> {
    let faces = detector.detect(image)?;

    let mut observations = Vec::with_capacity(faces.len());
    for face in faces {
        // Alignment needs landmarks; a landmark-less detection cannot be embedded.
        if face.landmarks.is_none() {
            tracing::debug!(confidence = face.confidence, "dropping detection without landmarks");
            continue;
        }
        let embedding = embedder.embed(image, &face)?;
        observations.push(Observation { face, embedding });
    }

    Ok(observations)
}
