//! Physical quantities derived from a fitted drop shape.

use std::f64::consts::PI;

use crate::cancellation::CancellationToken;
use crate::contour::NeedleCalibration;
use crate::errors::{PendantDropError, Result};
use crate::fitting::FitResult;
use crate::young_laplace::YoungLaplaceShape;

/// Bond numbers below this leave the interfacial tension unconstrained
const MIN_BOND_NUMBER: f64 = 1e-6;

/// Physical constants of one experiment, in SI units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalConstants {
    /// Inner minus outer phase density (kg/m^3)
    pub density_delta: f64,
    /// Gravitational acceleration (m/s^2)
    pub gravity: f64,
    /// True outer diameter of the needle (m)
    pub needle_diameter: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalProperties {
    /// N/m
    pub interfacial_tension: f64,
    /// m^3
    pub volume: f64,
    /// m^2
    pub surface_area: f64,
    /// m
    pub apex_radius: f64,
    pub bond_number: f64,
    pub worthington: f64,
    /// rad
    pub rotation: f64,
}

impl PhysicalProperties {
    pub fn rotation_degrees(&self) -> f64 {
        self.rotation.to_degrees()
    }
}

/// Metres per pixel
pub fn pixel_scale(calibration: &NeedleCalibration, constants: &PhysicalConstants) -> Result<f64> {
    if !calibration.is_valid() {
        return Err(PendantDropError::CalibrationInvalid(calibration.width_px));
    }
    let scale = constants.needle_diameter / calibration.width_px;
    if !(scale.is_finite() && scale > 0.0) {
        return Err(PendantDropError::Domain(format!(
            "needle diameter {} m gives a pixel scale of {}",
            constants.needle_diameter, scale
        )));
    }
    Ok(scale)
}

/// `gamma = drho * g * R0^2 / Bo`, with `R0` in metres
pub fn interfacial_tension(apex_radius: f64, bond_number: f64, constants: &PhysicalConstants) -> Result<f64> {
    if !(bond_number > MIN_BOND_NUMBER) {
        return Err(PendantDropError::Domain(format!(
            "Bond number {:e} is too small to determine the interfacial tension",
            bond_number
        )));
    }
    let gamma = constants.density_delta * constants.gravity * apex_radius * apex_radius / bond_number;
    if !(gamma.is_finite() && gamma > 0.0) {
        return Err(PendantDropError::Domain(format!("interfacial tension {}", gamma)));
    }
    Ok(gamma)
}

/// Ratio of the drop volume to the largest volume the needle can hold at
/// this interfacial tension, `drho * g * V / (pi * gamma * D)`
pub fn worthington_number(volume: f64, gamma: f64, constants: &PhysicalConstants) -> f64 {
    constants.density_delta * constants.gravity * volume / (PI * gamma * constants.needle_diameter)
}

/// Convert a fit into physical properties.
///
/// Volume and surface area are integrated over the arclength range that the
/// observed silhouette covers, so a cropped drop reports the volume of the
/// visible part.
pub fn compute(
    fit: &FitResult,
    calibration: &NeedleCalibration,
    constants: &PhysicalConstants,
    integration_step: f64,
    cancel: &CancellationToken,
) -> Result<PhysicalProperties> {
    let scale = pixel_scale(calibration, constants)?;
    let params = &fit.parameters;
    let apex_radius = params.apex_radius * scale;
    let gamma = interfacial_tension(apex_radius, params.bond_number, constants)?;

    let shape = YoungLaplaceShape::integrate(
        params.bond_number,
        fit.arclength_range,
        integration_step,
        cancel,
    )?;
    let volume = shape.volume(fit.arclength_range) * apex_radius.powi(3);
    let surface_area = shape.surface_area(fit.arclength_range) * apex_radius.powi(2);
    if volume < 0.0 || !volume.is_finite() {
        return Err(PendantDropError::Domain(format!("computed volume {}", volume)));
    }

    Ok(PhysicalProperties {
        interfacial_tension: gamma,
        volume,
        surface_area,
        apex_radius,
        bond_number: params.bond_number,
        worthington: worthington_number(volume, gamma, constants),
        rotation: params.rotation,
    })
}
