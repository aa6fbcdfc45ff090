//! Error taxonomy shared by every crate in the workspace.
//!
//! Library code returns [`Result`]; binaries wrap it in `anyhow`.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the library crates.
pub type Result<T> = std::result::Result<T, ExplorerError>;

/// Everything that can go wrong between loading a workload and persisting
/// an exploration result.
#[derive(Error, Debug)]
pub enum ExplorerError {
    /// Malformed workload field, unknown weighting function, bad architecture.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Bit-width vector does not fit the layer registry.
    #[error("invalid bit widths: {reason} (got {got:?}, expected {expected} values in [{min}, {max}])")]
    InvalidBitWidths {
        reason: &'static str,
        got: Vec<u32>,
        expected: usize,
        min: u32,
        max: u32,
    },

    /// Missing, unreadable, unwritable or incompatible calibration file.
    #[error("calibration file {}: {reason}", path.display())]
    CalibrationFile { path: PathBuf, reason: String },

    /// A quantizer is enabled but has never been calibrated.
    #[error("quantizer {0} is enabled but not calibrated")]
    Uncalibrated(String),

    /// Scoring one individual failed.
    #[error("evaluation of individual {index} failed: {source}")]
    Evaluation {
        index: usize,
        #[source]
        source: Box<ExplorerError>,
    },

    /// The accuracy function returned something outside `[0, 1]`.
    #[error("accuracy {0} is outside [0, 1]")]
    InvalidAccuracy(f64),

    /// Malformed or truncated dataset file.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Background task could not be joined.
    #[error("task join: {0}")]
    Join(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("progress bar template: {0}")]
    Progress(#[from] indicatif::style::TemplateError),
}

impl ExplorerError {
    /// Shorthand for [`ExplorerError::Configuration`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn calibration_file(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CalibrationFile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that must abort a run before any evaluation.
    pub fn is_fatal_setup(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::InvalidBitWidths { .. } | Self::CalibrationFile { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_error_keeps_index_and_source() {
        let err = ExplorerError::Evaluation {
            index: 3,
            source: Box::new(ExplorerError::InvalidAccuracy(1.5)),
        };
        let msg = err.to_string();
        assert!(msg.contains("individual 3"));
        assert!(msg.contains("1.5"));
        assert!(!err.is_fatal_setup());
    }

    #[test]
    fn calibration_file_error_is_fatal() {
        let err = ExplorerError::calibration_file("calib.safetensors", "layer count mismatch");
        assert!(err.is_fatal_setup());
        assert!(err.to_string().contains("calib.safetensors"));
    }
}
