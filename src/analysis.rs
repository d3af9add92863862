//! Per-image analysis: extraction, fit and physical properties as a small
//! state machine with typed stage outputs.
//!
//! Each stage output is kept until an upstream input changes. Editing the
//! drop region drops the profile and everything computed from it, editing
//! the needle region or the constants only drops what depends on them, so
//! the next `run` recomputes the invalidated stages and nothing else.

use std::sync::Arc;

use image::DynamicImage;

use crate::cancellation::CancellationToken;
use crate::config::Config;
use crate::contour::{self, DropProfile, ExtractionParams, NeedleCalibration, NeedleEdges};
use crate::errors::{FailureKind, PendantDropError, Result};
use crate::fitting::{self, FitOptions, FitResiduals, FitResult};
use crate::image_io::InputImage;
use crate::image_utils::Region;
use crate::physical_properties::{self, PhysicalConstants, PhysicalProperties};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStatus {
    Pending,
    Extracting,
    Fitting,
    ComputingProperties,
    Done,
    Cancelled,
    Failed(FailureKind),
}

impl AnalysisStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Done | AnalysisStatus::Cancelled | AnalysisStatus::Failed(_))
    }
}

/// Settings shared by every analysis of a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageOptions {
    pub extraction: ExtractionParams,
    pub fit: FitOptions,
}

impl StageOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            extraction: config.extraction_params(),
            fit: config.fit_options(),
        }
    }
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            extraction: ExtractionParams::default(),
            fit: FitOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DropAnalysis {
    input: InputImage,
    drop_region: Region,
    needle_region: Region,
    constants: PhysicalConstants,
    status: AnalysisStatus,
    cancel: CancellationToken,
    error: Option<String>,

    profile: Option<DropProfile>,
    needle_edges: Option<NeedleEdges>,
    calibration: Option<NeedleCalibration>,
    fit: Option<FitResult>,
    fitted_curve: Option<Vec<(f64, f64)>>,
    properties: Option<PhysicalProperties>,
}

impl DropAnalysis {
    pub fn new(input: InputImage, drop_region: Region, needle_region: Region, constants: PhysicalConstants) -> Self {
        Self {
            input,
            drop_region,
            needle_region,
            constants,
            status: AnalysisStatus::Pending,
            cancel: CancellationToken::new(),
            error: None,
            profile: None,
            needle_edges: None,
            calibration: None,
            fit: None,
            fitted_curve: None,
            properties: None,
        }
    }

    pub fn status(&self) -> AnalysisStatus {
        self.status
    }

    /// Message of the error that failed this analysis
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn input(&self) -> &InputImage {
        &self.input
    }

    pub fn image(&self) -> &Arc<DynamicImage> {
        &self.input.image
    }

    pub fn timestamp(&self) -> f64 {
        self.input.timestamp
    }

    pub fn is_image_replicated(&self) -> bool {
        self.input.is_replicated
    }

    pub fn drop_region(&self) -> Region {
        self.drop_region
    }

    pub fn needle_region(&self) -> Region {
        self.needle_region
    }

    pub fn constants(&self) -> &PhysicalConstants {
        &self.constants
    }

    pub fn profile(&self) -> Option<&DropProfile> {
        self.profile.as_ref()
    }

    pub fn needle_edges(&self) -> Option<&NeedleEdges> {
        self.needle_edges.as_ref()
    }

    pub fn calibration(&self) -> Option<&NeedleCalibration> {
        self.calibration.as_ref()
    }

    pub fn fit(&self) -> Option<&FitResult> {
        self.fit.as_ref()
    }

    pub fn residuals(&self) -> Option<&FitResiduals> {
        self.fit.as_ref().map(|f| &f.residuals)
    }

    pub fn fitted_curve(&self) -> Option<&[(f64, f64)]> {
        self.fitted_curve.as_deref()
    }

    pub fn properties(&self) -> Option<&PhysicalProperties> {
        self.properties.as_ref()
    }

    /// Handle that cancels this analysis from another thread
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether `run` has work to do
    pub fn is_runnable(&self) -> bool {
        self.status == AnalysisStatus::Pending
    }

    /// Cancel the analysis and discard its partial results. A cancelled
    /// analysis never runs again.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if self.status != AnalysisStatus::Cancelled {
            log::debug!("{}: cancelled", self.input.filename);
        }
        self.discard_results();
        self.status = AnalysisStatus::Cancelled;
    }

    pub fn set_drop_region(&mut self, region: Region) {
        if self.status == AnalysisStatus::Cancelled || region == self.drop_region {
            return;
        }
        self.drop_region = region;
        self.profile = None;
        self.fit = None;
        self.fitted_curve = None;
        self.properties = None;
        self.restart();
    }

    pub fn set_needle_region(&mut self, region: Region) {
        if self.status == AnalysisStatus::Cancelled || region == self.needle_region {
            return;
        }
        self.needle_region = region;
        self.needle_edges = None;
        self.calibration = None;
        self.properties = None;
        self.restart();
    }

    pub fn set_constants(&mut self, constants: PhysicalConstants) {
        if self.status == AnalysisStatus::Cancelled || constants == self.constants {
            return;
        }
        self.constants = constants;
        self.properties = None;
        self.restart();
    }

    fn restart(&mut self) {
        self.error = None;
        self.status = AnalysisStatus::Pending;
    }

    fn discard_results(&mut self) {
        self.profile = None;
        self.needle_edges = None;
        self.calibration = None;
        self.fit = None;
        self.fitted_curve = None;
        self.properties = None;
    }

    fn enter(&mut self, status: AnalysisStatus) {
        log::debug!("{}: {:?} -> {:?}", self.input.filename, self.status, status);
        self.status = status;
    }

    /// Run every stage whose output is missing, in order, until the
    /// analysis is done, failed or cancelled.
    pub fn run(&mut self, options: &StageOptions) -> AnalysisStatus {
        if self.status.is_terminal() && self.status != AnalysisStatus::Done {
            return self.status;
        }

        match self.run_stages(options) {
            Ok(()) => self.enter(AnalysisStatus::Done),
            Err(PendantDropError::Cancelled) => self.cancel(),
            Err(e) => {
                log::warn!("{}: analysis failed while {:?}: {}", self.input.filename, self.status, e);
                self.error = Some(e.to_string());
                self.enter(AnalysisStatus::Failed(e.failure_kind()));
            }
        }

        self.status
    }

    fn run_stages(&mut self, options: &StageOptions) -> Result<()> {
        self.cancel.check()?;

        // Stage 1: silhouette and needle calibration
        if self.profile.is_none() || self.calibration.is_none() {
            self.enter(AnalysisStatus::Extracting);
            self.extract(&options.extraction)?;
        }

        // Stage 2: shape fit
        if self.fit.is_none() {
            self.enter(AnalysisStatus::Fitting);
            let profile = self.profile.as_ref().ok_or_else(|| {
                PendantDropError::InsufficientData("no drop profile".to_string())
            })?;
            let fit = fitting::fit_profile(profile, &options.fit, &self.cancel)?;
            log::debug!(
                "{}: fit converged in {} iterations (R0 {:.2} px, Bo {:.4})",
                self.input.filename,
                fit.iterations,
                fit.parameters.apex_radius,
                fit.parameters.bond_number
            );
            self.fitted_curve = Some(fitting::fitted_curve(&fit, options.fit.integration_step, &self.cancel)?);
            self.fit = Some(fit);
        }

        // Stage 3: physical properties
        if self.properties.is_none() {
            self.enter(AnalysisStatus::ComputingProperties);
            let (Some(fit), Some(calibration)) = (&self.fit, &self.calibration) else {
                return Err(PendantDropError::CalibrationInvalid(f64::NAN));
            };
            let properties = physical_properties::compute(
                fit,
                calibration,
                &self.constants,
                options.fit.integration_step,
                &self.cancel,
            )?;
            self.properties = Some(properties);
        }

        Ok(())
    }

    fn extract(&mut self, params: &ExtractionParams) -> Result<()> {
        if self.calibration.is_none() {
            self.needle_edges = if self.needle_region.is_degenerate() {
                None
            } else {
                contour::extract_needle_edges(&self.input.image, &self.needle_region, params)
            };
            self.calibration = Some(
                self.needle_edges
                    .as_ref()
                    .map(contour::needle_calibration)
                    .unwrap_or(NeedleCalibration { width_px: f64::NAN }),
            );
        }

        if self.profile.is_none() {
            if self.drop_region.is_degenerate() {
                return Err(PendantDropError::InsufficientData(format!(
                    "degenerate drop region {:?}",
                    self.drop_region
                )));
            }
            let profile = contour::extract_profile(&self.input.image, &self.drop_region, params);
            log::debug!("{}: extracted {} profile points", self.input.filename, profile.len());
            self.profile = Some(profile);
        }

        self.cancel.check()
    }
}
