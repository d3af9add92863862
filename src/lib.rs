// src/lib.rs - Library interface for pendant drop tensiometry

pub mod analysis;
pub mod cancellation;
pub mod config;
pub mod contour;
pub mod errors;
pub mod fitting;
pub mod image_io;
pub mod image_utils;
pub mod output;
pub mod physical_properties;
pub mod pipeline;
pub mod synthetic;
pub mod young_laplace;

// Re-export commonly used types and functions
pub use errors::{FailureKind, PendantDropError, Result};
pub use config::Config;
pub use cancellation::CancellationToken;
pub use image_io::{InputImage, load_image, load_image_sequence, save_image};
pub use image_utils::Region;

// Stages of a drop analysis
pub use contour::{extract_needle_edges, extract_profile, needle_calibration, DropProfile, NeedleCalibration, NeedleEdges};
pub use young_laplace::YoungLaplaceShape;
pub use fitting::{fit, fit_profile, FitOptions, FitParameters, FitResiduals, FitResult};
pub use physical_properties::{PhysicalConstants, PhysicalProperties};

// Orchestration and reporting
pub use analysis::{AnalysisStatus, DropAnalysis, StageOptions};
pub use pipeline::{AnalysisSession, TimelineRow};
pub use output::{save_drops, save_session};
pub use synthetic::{RenderedDrop, SyntheticDrop};
