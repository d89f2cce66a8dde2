//! Error handling for TagSight

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Camera capture error
    #[error("Camera error: {0}")]
    Camera(String),

    /// Calibration error
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// Pose solver error (degenerate geometry, no convergence)
    #[error("Solver error: {0}")]
    Solver(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Image encode/decode error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
