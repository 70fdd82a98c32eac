//! The HTTP and WebSocket surface of the daemon.
//!
//! Every operation is stateless across calls: the only shared state is the
//! capture store on disk and the current gallery handle, swapped whole after
//! a retrain. Streaming recognition answers exactly one frame at a time, in
//! receipt order.

use crate::config::Config;
use crate::engine::{EngineError, EngineHandle, Observation};
use crate::store::{CaptureStore, InfoPatch, StoreError};
use crate::trainer::{self, TrainError};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use glance_core::Gallery;
use image::GrayImage;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Identity reported for a face the gallery has no confident match for.
pub const UNKNOWN_ID: &str = "Unknown";

/// Uploads and frames larger than this are rejected outright.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Arc<CaptureStore>,
    engine: EngineHandle,
    /// Current-gallery handle: readers clone the inner Arc and keep using the
    /// gallery they grabbed; train and reset swap in a replacement whole.
    gallery: Arc<RwLock<Arc<Gallery>>>,
    /// At most one retrain in flight; reset also takes it to avoid racing an
    /// artifact write.
    train_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(config: Config, store: CaptureStore, engine: EngineHandle, gallery: Gallery) -> Self {
        Self {
            config: Arc::new(config),
            store: Arc::new(store),
            engine,
            gallery: Arc::new(RwLock::new(Arc::new(gallery))),
            train_lock: Arc::new(Mutex::new(())),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/upload", post(upload))
        .route("/train", post(train))
        .route("/recognize", post(recognize))
        .route("/ids", get(ids))
        .route("/reset", post(reset))
        .route("/status", get(status))
        .route("/liveRecognize", get(live_recognize))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        // The enrolling frontend is a browser app on another origin.
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("could not decode image")]
    Decode,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gallery(#[from] glance_core::GalleryError),
    #[error(transparent)]
    Train(#[from] TrainError),
    #[error("inference failed: {0}")]
    Engine(#[from] EngineError),
    #[error("recognition timed out")]
    Timeout,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Decode => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadRequest(_) | ApiError::Store(StoreError::InvalidUserId(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// One recognized face region, in the shape the frontend draws from.
#[derive(Debug, Clone, Serialize)]
pub struct FaceResult {
    pub id: String,
    pub confidence: f32,
    pub rect: [i32; 4],
}

#[derive(Debug, Serialize)]
pub struct RecognizeResponse {
    pub results: Vec<FaceResult>,
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut user_id: Option<String> = None;
    let mut file: Option<(Option<String>, Bytes)> = None;
    let mut patch = InfoPatch::default();

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        match field.name().unwrap_or("") {
            "file" => {
                let filename = field.file_name().map(str::to_owned);
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                file = Some((filename, bytes));
            }
            "user_id" => user_id = Some(field.text().await.map_err(bad_multipart)?),
            "name" => patch.name = Some(field.text().await.map_err(bad_multipart)?),
            "role" => patch.role = Some(field.text().await.map_err(bad_multipart)?),
            "age" => patch.age = Some(field.text().await.map_err(bad_multipart)?),
            other => tracing::debug!(field = other, "ignoring unknown upload field"),
        }
    }

    let user_id = user_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing user_id".into()))?;
    let (filename, bytes) = file.ok_or_else(|| ApiError::BadRequest("missing file".into()))?;

    let path = state
        .store
        .save_capture(&user_id, &bytes, filename.as_deref())?;
    if !patch.is_empty() {
        state.store.upsert_info(&user_id, &patch).await?;
    }

    tracing::info!(user_id, path = %path.display(), "capture enrolled");
    Ok(Json(json!({
        "status": "success",
        "saved_to": path.display().to_string(),
    })))
}

async fn train(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let _running = state.train_lock.lock().await;

    let (gallery, summary) =
        trainer::train(&state.store, &state.engine, &state.config.gallery_path()).await?;
    *state.gallery.write().await = Arc::new(gallery);

    Ok(Json(json!({
        "status": "training complete",
        "message": summary.to_string(),
    })))
}

async fn recognize(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<RecognizeResponse>, ApiError> {
    let bytes = image_bytes(req).await?;
    let frame = decode_frame(&bytes)?;

    let results = tokio::time::timeout(state.config.recognize_timeout(), analyze_frame(&state, frame))
        .await
        .map_err(|_| ApiError::Timeout)??;

    Ok(Json(RecognizeResponse { results }))
}

async fn ids(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let users = state.store.list_users()?;
    Ok(Json(json!({ "users": users })))
}

async fn reset(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let _running = state.train_lock.lock().await;

    state.store.reset()?;
    Gallery::remove_file(&state.config.gallery_path())?;
    *state.gallery.write().await = Arc::new(Gallery::empty());

    tracing::info!("capture store and gallery reset");
    Ok(Json(json!({ "status": "reset complete" })))
}

async fn status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let users = state.store.list_users()?.len();
    let gallery = state.gallery.read().await.clone();

    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "users": users,
        "gallery_size": gallery.len(),
        "trained_at": gallery.trained_at.clone(),
    })))
}

async fn live_recognize(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_frames(socket, state))
}

/// The streaming loop: one JSON reply per binary frame, in receipt order.
/// The next frame is not read until the current one is answered. Peer
/// disconnects and transport errors end the loop; they are not failures.
async fn stream_frames(mut socket: WebSocket, state: AppState) {
    tracing::debug!("live recognition stream opened");

    loop {
        let frame = match socket.recv().await {
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(_))) | None => break,
            // Text frames carry no image; ping/pong are answered by axum.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "stream transport error");
                break;
            }
        };

        let reply = match decode_frame(&frame) {
            Ok(image) => match analyze_frame(&state, image).await {
                Ok(results) => json!({ "results": results }),
                Err(e) => json!({ "error": e.to_string() }),
            },
            Err(e) => json!({ "error": e.to_string() }),
        };

        if socket.send(Message::Text(reply.to_string())).await.is_err() {
            break;
        }
    }

    tracing::debug!("live recognition stream closed");
}

/// Image bytes for a recognize call: either the raw request body or the sole
/// `file` part of a multipart form (what the browser frontend posts).
async fn image_bytes(req: Request) -> Result<Bytes, ApiError> {
    let is_multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    if is_multipart {
        let mut multipart = Multipart::from_request(req, &()).await.map_err(|e| {
            ApiError::BadRequest(format!("malformed multipart body: {e}"))
        })?;
        while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
            if field.name() == Some("file") {
                return field.bytes().await.map_err(bad_multipart);
            }
        }
        Err(ApiError::BadRequest("missing file part".into()))
    } else {
        Bytes::from_request(req, &())
            .await
            .map_err(|e| ApiError::BadRequest(format!("unreadable request body: {e}")))
    }
}

fn bad_multipart(e: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::BadRequest(format!("malformed multipart body: {e}"))
}

/// Decode an uploaded frame into grayscale, or report a decode failure.
/// Distinct from "zero faces found", which is a successful empty result.
fn decode_frame(bytes: &[u8]) -> Result<GrayImage, ApiError> {
    if bytes.is_empty() {
        return Err(ApiError::Decode);
    }
    image::load_from_memory(bytes)
        .map(|image| image.to_luma8())
        .map_err(|_| ApiError::Decode)
}

/// Run detection + embedding and match every face against the gallery the
/// call started with.
async fn analyze_frame(state: &AppState, frame: GrayImage) -> Result<Vec<FaceResult>, ApiError> {
    let gallery = state.gallery.read().await.clone();
    let observations = state.engine.analyze(frame).await?;

    Ok(observations
        .iter()
        .map(|obs| face_result(obs, &gallery, state.config.match_threshold))
        .collect())
}

/// Apply the known/unknown policy to one observation.
fn face_result(observation: &Observation, gallery: &Gallery, threshold: f32) -> FaceResult {
    let found = gallery.best_match(&observation.embedding, threshold);
    FaceResult {
        id: found.user_id.unwrap_or_else(|| UNKNOWN_ID.to_owned()),
        confidence: found.similarity,
        rect: observation.face.rect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glance_core::{Embedding, FaceBox, GalleryEntry};
    use uuid::Uuid;

    fn observation(values: Vec<f32>) -> Observation {
        Observation {
            face: FaceBox {
                x: 10.0,
                y: 20.0,
                width: 30.0,
                height: 40.0,
                confidence: 0.9,
                landmarks: None,
            },
            embedding: Embedding { values },
        }
    }

    fn gallery_of(user_id: &str, values: Vec<f32>) -> Gallery {
        Gallery::new(vec![GalleryEntry {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            source: "a.jpg".to_string(),
            embedding: Embedding { values },
        }])
    }

    #[test]
    fn test_face_result_matches_enrolled_user() {
        let gallery = gallery_of("alice", vec![1.0, 0.0]);
        let result = face_result(&observation(vec![1.0, 0.0]), &gallery, 0.4);

        assert_eq!(result.id, "alice");
        assert!((result.confidence - 1.0).abs() < 1e-6);
        assert_eq!(result.rect, [10, 20, 30, 40]);
    }

    #[test]
    fn test_face_result_below_threshold_is_unknown() {
        let gallery = gallery_of("alice", vec![1.0, 0.0]);
        let result = face_result(&observation(vec![0.0, 1.0]), &gallery, 0.4);

        assert_eq!(result.id, UNKNOWN_ID);
        assert!(result.confidence.abs() < 1e-6);
    }

    #[test]
    fn test_face_result_untrained_gallery_is_unknown() {
        let result = face_result(&observation(vec![1.0, 0.0]), &Gallery::empty(), 0.4);
        assert_eq!(result.id, UNKNOWN_ID);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_decode_frame_rejects_garbage() {
        assert!(matches!(decode_frame(b"not an image"), Err(ApiError::Decode)));
        assert!(matches!(decode_frame(b""), Err(ApiError::Decode)));
    }

    #[test]
    fn test_decode_frame_accepts_png() {
        let mut bytes = Vec::new();
        let image = image::DynamicImage::new_rgb8(4, 4);
        image
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(frame.dimensions(), (4, 4));
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(ApiError::Decode.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            ApiError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Store(StoreError::InvalidUserId("..".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ApiError::Engine(EngineError::ChannelClosed).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_face_result_wire_shape() {
        let gallery = gallery_of("alice", vec![1.0, 0.0]);
        let result = face_result(&observation(vec![1.0, 0.0]), &gallery, 0.4);

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["id"], "alice");
        assert_eq!(value["rect"], serde_json::json!([10, 20, 30, 40]));
        assert!(value["confidence"].is_number());
    }
}
