use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::contour::ExtractionParams;
use crate::errors::{PendantDropError, Result};
use crate::fitting::FitOptions;
use crate::image_utils::Region;
use crate::physical_properties::PhysicalConstants;

/// Configuration for a pendant drop analysis run
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub input_path: String,
    pub output_base_dir: String,

    /// Seconds between consecutive images of the input sequence
    #[serde(default = "default_frame_interval")]
    pub frame_interval: f64,

    #[serde(default = "default_parallel")]
    pub use_parallel: bool,

    /// Worker threads, 0 means one per CPU core
    #[serde(default)]
    pub num_threads: usize,

    // Foreground detection
    #[serde(default = "default_gaussian_kernel_size")]
    pub gaussian_kernel_size: u32,

    #[serde(default = "default_threshold")]
    pub threshold: u8,

    // Physical constants (SI units)
    pub inner_density: f64,
    pub outer_density: f64,
    pub needle_diameter: f64,

    #[serde(default = "default_gravity")]
    pub gravity: f64,

    // Young-Laplace fit
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    #[serde(default = "default_xtol")]
    pub xtol: f64,

    #[serde(default = "default_ftol")]
    pub ftol: f64,

    #[serde(default = "default_integration_step")]
    pub integration_step: f64,

    #[serde(default = "default_min_profile_points")]
    pub min_profile_points: usize,

    // Tables last so the struct serializes back to valid TOML
    pub drop_region: Region,
    pub needle_region: Region,
}

fn default_frame_interval() -> f64 {
    1.0
}

fn default_parallel() -> bool {
    true
}

fn default_gaussian_kernel_size() -> u32 {
    3
}

fn default_threshold() -> u8 {
    30
}

fn default_gravity() -> f64 {
    9.80035
}

fn default_max_iterations() -> usize {
    100
}

fn default_xtol() -> f64 {
    1e-10
}

fn default_ftol() -> f64 {
    1e-12
}

fn default_integration_step() -> f64 {
    2e-3
}

fn default_min_profile_points() -> usize {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_path: "./input".to_string(),
            output_base_dir: "./output".to_string(),
            frame_interval: default_frame_interval(),
            use_parallel: true,
            num_threads: 0,
            gaussian_kernel_size: default_gaussian_kernel_size(),
            threshold: default_threshold(),
            inner_density: 998.0, // water
            outer_density: 0.0,
            needle_diameter: 0.001,
            gravity: default_gravity(),
            max_iterations: default_max_iterations(),
            xtol: default_xtol(),
            ftol: default_ftol(),
            integration_step: default_integration_step(),
            min_profile_points: default_min_profile_points(),
            drop_region: Region::default(),
            needle_region: Region::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PendantDropError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;

        toml::from_str(&content).map_err(|source| PendantDropError::ConfigLoad {
            source,
            path: path.to_path_buf(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let input_path = PathBuf::from(&self.input_path);
        if !input_path.exists() {
            return Err(PendantDropError::InvalidPath(input_path));
        }

        if self.gaussian_kernel_size == 0 || self.gaussian_kernel_size % 2 == 0 {
            return Err(PendantDropError::Config(
                "gaussian_kernel_size must be a positive odd number".to_string(),
            ));
        }

        if !(self.frame_interval >= 0.0) {
            return Err(PendantDropError::Config(
                "frame_interval must be >= 0.0".to_string(),
            ));
        }

        if self.inner_density - self.outer_density <= 0.0 {
            return Err(PendantDropError::Config(
                "inner_density must be greater than outer_density".to_string(),
            ));
        }

        if !(self.needle_diameter > 0.0) {
            return Err(PendantDropError::Config(
                "needle_diameter must be > 0.0".to_string(),
            ));
        }

        if !(self.gravity > 0.0) {
            return Err(PendantDropError::Config(
                "gravity must be > 0.0".to_string(),
            ));
        }

        if self.max_iterations == 0 {
            return Err(PendantDropError::Config(
                "max_iterations must be > 0".to_string(),
            ));
        }

        if !(self.xtol > 0.0) || !(self.ftol > 0.0) {
            return Err(PendantDropError::Config(
                "xtol and ftol must be > 0.0".to_string(),
            ));
        }

        if !(self.integration_step > 0.0 && self.integration_step < 0.1) {
            return Err(PendantDropError::Config(
                "integration_step must be between 0.0 and 0.1".to_string(),
            ));
        }

        if self.min_profile_points < 5 {
            return Err(PendantDropError::Config(
                "min_profile_points must be >= 5 to constrain the fit".to_string(),
            ));
        }

        if self.drop_region.is_degenerate() {
            log::warn!("drop_region {:?} is degenerate, every drop will lack a profile", self.drop_region);
        }

        if self.needle_region.is_degenerate() {
            log::warn!("needle_region {:?} is degenerate, no drop can be calibrated", self.needle_region);
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            PendantDropError::Config(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(path, content)?;

        Ok(())
    }

    pub fn extraction_params(&self) -> ExtractionParams {
        ExtractionParams {
            gaussian_kernel_size: self.gaussian_kernel_size,
            threshold: self.threshold,
        }
    }

    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            max_iterations: self.max_iterations,
            xtol: self.xtol,
            ftol: self.ftol,
            integration_step: self.integration_step,
            min_profile_points: self.min_profile_points,
        }
    }

    pub fn physical_constants(&self) -> PhysicalConstants {
        PhysicalConstants {
            density_delta: self.inner_density - self.outer_density,
            gravity: self.gravity,
            needle_diameter: self.needle_diameter,
        }
    }
}
