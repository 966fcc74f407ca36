//! Error types for berth

use thiserror::Error;

/// Result type for berth operations
pub type Result<T> = std::result::Result<T, BerthError>;

/// Berth error types
#[derive(Error, Debug)]
pub enum BerthError {
    #[error("Image resolution failed for {image}: {reason}")]
    ImageResolution { image: String, reason: String },

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Timed out waiting for port bindings on container {0}")]
    PortBindingTimeout(String),

    #[error("Malformed container request: {0}")]
    MalformedRequest(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BerthError {
    /// Build an image resolution error for the given reference
    pub fn image_resolution(image: &str, reason: impl Into<String>) -> Self {
        Self::ImageResolution {
            image: image.to_string(),
            reason: reason.into(),
        }
    }
}
