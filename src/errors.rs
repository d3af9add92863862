use thiserror::Error;
use std::io;
use std::path::PathBuf;

/// Custom error types for pendant drop analysis
#[derive(Error, Debug)]
pub enum PendantDropError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to load configuration from {path}: {source}")]
    ConfigLoad {
        source: toml::de::Error,
        path: PathBuf,
    },

    #[error("CSV output error: {0}")]
    CsvOutput(#[from] csv::Error),

    #[error("Invalid input path: {0}")]
    InvalidPath(PathBuf),

    #[error("No input images to analyse")]
    NoImages,

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Fit did not converge after {iterations} iterations")]
    FitDivergence { iterations: usize },

    #[error("Invalid needle calibration: width {0} px")]
    CalibrationInvalid(f64),

    #[error("Domain error: {0}")]
    Domain(String),

    #[error("Analysis cancelled")]
    Cancelled,
}

/// Per-drop failure category, kept on a failed analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InsufficientData,
    FitDivergence,
    CalibrationInvalid,
    Domain,
    Other,
}

impl PendantDropError {
    /// Classify an error raised by a stage of a single drop analysis.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PendantDropError::InsufficientData(_) => FailureKind::InsufficientData,
            PendantDropError::FitDivergence { .. } => FailureKind::FitDivergence,
            PendantDropError::CalibrationInvalid(_) => FailureKind::CalibrationInvalid,
            PendantDropError::Domain(_) => FailureKind::Domain,
            _ => FailureKind::Other,
        }
    }
}

/// Type alias for Result with our custom error type
pub type Result<T> = std::result::Result<T, PendantDropError>;
