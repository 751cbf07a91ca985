//! Error types for the regolith library.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading tiles, detecting craters or
/// converting terrain.
#[derive(Error, Debug)]
pub enum RegolithError {
    /// IO error when reading or writing files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The tile could not be fetched or read from the local store.
    ///
    /// Recoverable by retrying at the tile source.
    #[error("Tile unavailable: lat={lat}, lon={lon}: {reason}")]
    TileUnavailable { lat: i32, lon: i32, reason: String },

    /// The raster header or payload is structurally invalid.
    #[error("Malformed tile: {reason}")]
    MalformedTile { reason: String },

    /// Coordinates are outside the valid planetary grid.
    #[error("Coordinates out of bounds: lat={lat}, lon={lon} (valid: lat ±90°, lon 0°..360°)")]
    OutOfBounds { lat: i32, lon: i32 },

    /// A configuration value cannot be used.
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// Mesh assembly failed before any export step ran.
    #[error("Triangulation failed: {reason}")]
    Triangulation { reason: String },

    /// An export step reported failure.
    #[error("Export stage '{stage}' failed: {reason}")]
    ExportFailed { stage: String, reason: String },

    /// An export step did not finish in time.
    #[error("Export stage '{stage}' timed out after {timeout_secs}s")]
    ExportTimedOut { stage: String, timeout_secs: u64 },

    /// A tile download failed.
    #[error("Failed to download {filename}: {reason}")]
    DownloadFailed { filename: String, reason: String },

    /// The requested file was not found.
    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    /// PNG encoding or decoding error.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// CSV reading or writing error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error from the download client.
    #[cfg(feature = "download")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RegolithError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        RegolithError::MalformedTile {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        RegolithError::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    /// Returns `true` if retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegolithError::TileUnavailable { .. } | RegolithError::DownloadFailed { .. }
        )
    }
}

/// Result type alias using [`RegolithError`].
pub type Result<T> = std::result::Result<T, RegolithError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegolithError::malformed("width is zero");
        assert!(err.to_string().contains("width is zero"));

        let err = RegolithError::OutOfBounds { lat: 91, lon: 0 };
        assert!(err.to_string().contains("91"));

        let err = RegolithError::ExportTimedOut {
            stage: "gltf-pipeline".to_string(),
            timeout_secs: 30,
        };
        assert!(err.to_string().contains("gltf-pipeline"));
        assert!(err.to_string().contains("30s"));

        let err = RegolithError::FileNotFound {
            path: PathBuf::from("lat-30_lon000.pgm"),
        };
        assert!(err.to_string().contains("lat-30_lon000.pgm"));
    }

    #[test]
    fn test_retryable() {
        let err = RegolithError::TileUnavailable {
            lat: -30,
            lon: 0,
            reason: "HTTP 503".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!RegolithError::malformed("bad header").is_retryable());
    }
}
