use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Address the HTTP server binds to (default: 127.0.0.1:8090).
    pub listen_addr: String,
    /// Root directory for persisted state: the capture dataset and the gallery.
    pub data_dir: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Cosine similarity threshold separating a known identity from "Unknown".
    pub match_threshold: f32,
    /// Timeout in seconds for a single-shot recognize call.
    pub recognize_timeout_secs: u64,
}

impl Config {
    /// Load configuration from `GLANCE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("GLANCE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| {
                        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("glance")
            });

        let model_dir = std::env::var("GLANCE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        Self {
            listen_addr: std::env::var("GLANCE_LISTEN_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8090".to_string()),
            data_dir,
            model_dir,
            match_threshold: env_f32("GLANCE_MATCH_THRESHOLD", 0.40),
            recognize_timeout_secs: env_u64("GLANCE_RECOGNIZE_TIMEOUT_SECS", 10),
        }
    }

    /// Root of the per-user capture directories.
    pub fn dataset_dir(&self) -> PathBuf {
        self.data_dir.join("dataset")
    }

    /// Path of the trained gallery artifact.
    pub fn gallery_path(&self) -> PathBuf {
        self.data_dir.join("gallery.json")
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn recognize_timeout(&self) -> Duration {
        Duration::from_secs(self.recognize_timeout_secs)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
