//! Application configuration and shared state

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Process-level configuration, read from the environment at startup
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the connection config JSON
    pub connection_config_path: PathBuf,
    /// Path where calibration results are persisted
    pub calibration_path: PathBuf,
    /// Interface the preview server binds to
    pub bind_addr: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            connection_config_path: std::env::var("TAGSIGHT_CONNECTION_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("connection_config.json")),
            calibration_path: std::env::var("TAGSIGHT_CALIBRATION_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("calibration_config.json")),
            bind_addr: std::env::var("TAGSIGHT_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
        }
    }
}

/// Device identity and endpoints, loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Device name, also the suffix of the telemetry namespace
    pub name: String,
    /// Telemetry transport address, recorded for operators
    pub bus_uri: String,
    /// Port the preview server listens on
    pub video_port: u16,
}

impl ConnectionConfig {
    /// Load from a JSON file. A missing or malformed file is fatal at
    /// startup, the only fatal configuration path.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }
}

/// Shared state handed to the preview server handlers
#[derive(Clone)]
pub struct AppState {
    /// Device name from the connection config
    pub device_name: String,
    /// Most recently published preview frame
    pub preview_rx: watch::Receiver<Option<Arc<image::RgbImage>>>,
}
