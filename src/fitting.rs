//! Young-Laplace profile fitting.
//!
//! The extracted silhouette is matched against the shape model under the
//! transform
//!
//! ```text
//! image = apex + R0 * Rot(theta) * (r, -z)
//! ```
//!
//! where `(r, z)` is a model point with `r` the signed radial coordinate.
//! Each residual is the signed distance (in pixels, positive outside the
//! drop) from an observed point to the nearest point of the model curve.
//! The five parameters are found with a Levenberg-Marquardt loop that
//! checks for cancellation on every trial step.

use nalgebra::{Matrix3, Matrix5, Vector3, Vector5};

use crate::cancellation::CancellationToken;
use crate::contour::DropProfile;
use crate::errors::{PendantDropError, Result};
use crate::young_laplace::YoungLaplaceShape;

/// Bond numbers tried when seeding the fit
const BOND_SEEDS: [f64; 11] = [0.0, 0.05, 0.1, 0.2, 0.35, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0];

/// Upper bound on the dimensionless arclength ever integrated
const MAX_ARCLENGTH: f64 = 50.0;

/// Extra table length integrated beyond what the current trial needs
const ARCLENGTH_HEADROOM: f64 = 1.25;

/// A fitted apex radius beyond this multiple of the profile's bounding-box
/// diagonal means the points carry no curvature to fit
const MAX_RADIUS_PER_EXTENT: f64 = 10.0;

const INITIAL_LAMBDA: f64 = 1e-3;
const MAX_LAMBDA: f64 = 1e16;
const DIAGONAL_FLOOR: f64 = 1e-12;

/// Share of the drop height, measured from the apex, used for the local
/// circle fit of the initial guess
const APEX_BAND: f64 = 0.15;

/// Solver settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    /// Trial steps (accepted or rejected) before giving up
    pub max_iterations: usize,
    /// Relative tolerance on the parameter update
    pub xtol: f64,
    /// Relative tolerance on the decrease of the residual sum of squares
    pub ftol: f64,
    /// Arclength step of the shape integration
    pub integration_step: f64,
    /// Profiles with fewer points cannot constrain five parameters
    pub min_profile_points: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            xtol: 1e-10,
            ftol: 1e-12,
            integration_step: 2e-3,
            min_profile_points: 10,
        }
    }
}

/// Fitted drop shape in image coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitParameters {
    /// Apex position (px)
    pub apex_x: f64,
    pub apex_y: f64,
    /// Radius of curvature at the apex (px)
    pub apex_radius: f64,
    pub bond_number: f64,
    /// Counter-clockwise rotation of the drop axis (rad)
    pub rotation: f64,
}

impl FitParameters {
    fn to_vector(self) -> Vector5<f64> {
        Vector5::new(self.apex_x, self.apex_y, self.apex_radius, self.bond_number, self.rotation)
    }

    fn from_vector(v: &Vector5<f64>) -> Self {
        Self {
            apex_x: v[0],
            apex_y: v[1],
            apex_radius: v[2],
            bond_number: v[3],
            rotation: v[4],
        }
    }

    /// Image position of the model point `(r, z)`
    pub fn model_to_image(&self, r: f64, z: f64) -> (f64, f64) {
        let (sin, cos) = self.rotation.sin_cos();
        let (u, v) = (self.apex_radius * r, -self.apex_radius * z);
        (
            self.apex_x + cos * u - sin * v,
            self.apex_y + sin * u + cos * v,
        )
    }

    /// Offset of an image point from the apex in the drop's own frame, in
    /// pixels: `(radial, downward)`
    fn image_to_frame(&self, point: (f64, f64)) -> (f64, f64) {
        let (sin, cos) = self.rotation.sin_cos();
        let (v1, v2) = (point.0 - self.apex_x, point.1 - self.apex_y);
        (cos * v1 + sin * v2, -sin * v1 + cos * v2)
    }
}

/// Per-point fit residuals: `(signed arclength parameter, signed distance
/// in px)`. The arclength is negative on the left branch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitResiduals {
    pub points: Vec<(f64, f64)>,
}

impl FitResiduals {
    pub fn rms(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        (self.points.iter().map(|p| p.1 * p.1).sum::<f64>() / self.points.len() as f64).sqrt()
    }
}

/// Outcome of a converged fit
#[derive(Debug, Clone)]
pub struct FitResult {
    pub parameters: FitParameters,
    pub residuals: FitResiduals,
    /// Largest dimensionless arclength matched by an observed point
    pub arclength_range: f64,
    /// Trial steps taken
    pub iterations: usize,
    /// Residual sum of squares at the start and after each accepted step
    pub cost_history: Vec<f64>,
}

/// Keeps the last shape table so that trials sharing a Bond number reuse it
#[derive(Default)]
struct ShapeCache {
    shape: Option<YoungLaplaceShape>,
}

impl ShapeCache {
    fn get(
        &mut self,
        bond: f64,
        arclength: f64,
        step: f64,
        cancel: &CancellationToken,
    ) -> Result<&YoungLaplaceShape> {
        let shape = match self.shape.take() {
            Some(shape) if shape.bond() == bond && shape.covers(arclength) => shape,
            _ => YoungLaplaceShape::integrate(
                bond,
                (arclength * ARCLENGTH_HEADROOM).min(MAX_ARCLENGTH),
                step,
                cancel,
            )?,
        };
        Ok(self.shape.insert(shape))
    }
}

struct Evaluation {
    cost: f64,
    residuals: Vec<f64>,
    arclengths: Vec<f64>,
    /// J^T J and J^T e, accumulated row by row
    normal_matrix: Matrix5<f64>,
    gradient: Vector5<f64>,
}

/// Least-squares problem of one silhouette
struct ProfileProblem<'a> {
    points: &'a [(f64, f64)],
    /// Polyline length of the silhouette (px)
    observed_arclength: f64,
    step: f64,
    shape: ShapeCache,
    perturbed: ShapeCache,
}

impl<'a> ProfileProblem<'a> {
    fn new(profile: &'a DropProfile, step: f64) -> Self {
        Self {
            points: &profile.points,
            observed_arclength: profile.arclength(),
            step,
            shape: ShapeCache::default(),
            perturbed: ShapeCache::default(),
        }
    }

    /// Dimensionless arclength the model must cover for this apex radius
    fn arclength_needed(&self, apex_radius: f64) -> f64 {
        (self.observed_arclength / apex_radius * 1.2 + 0.5).min(MAX_ARCLENGTH)
    }

    fn evaluate(
        &mut self,
        params: &FitParameters,
        with_jacobian: bool,
        cancel: &CancellationToken,
    ) -> Result<Evaluation> {
        let r0 = params.apex_radius;
        let bond = params.bond_number;
        let arclength = self.arclength_needed(r0);
        let bond_delta = 1e-6 * bond.max(1.0);

        let shape = self.shape.get(bond, arclength, self.step, cancel)?;
        let perturbed = if with_jacobian {
            Some(self.perturbed.get(bond + bond_delta, arclength, self.step, cancel)?)
        } else {
            None
        };

        let (sin, cos) = params.rotation.sin_cos();
        let mut evaluation = Evaluation {
            cost: 0.0,
            residuals: Vec::with_capacity(self.points.len()),
            arclengths: Vec::with_capacity(self.points.len()),
            normal_matrix: Matrix5::zeros(),
            gradient: Vector5::zeros(),
        };

        for &point in self.points {
            let (w1, w2) = params.image_to_frame(point);
            let branch = if w1 >= 0.0 { 1.0 } else { -1.0 };
            let q = (branch * w1 / r0, -w2 / r0);

            let closest = shape.closest_point(q);
            let c = closest.point;
            let d = (q.0 - c.x, q.1 - c.z);
            let normal = (c.phi.sin(), -c.phi.cos());
            let side = if normal.0 * d.0 + normal.1 * d.1 >= 0.0 { 1.0 } else { -1.0 };
            let dir = if closest.distance > 1e-12 {
                (side * d.0 / closest.distance, side * d.1 / closest.distance)
            } else {
                normal
            };

            let residual = side * closest.distance * r0;
            evaluation.cost += residual * residual;
            evaluation.residuals.push(residual);
            evaluation.arclengths.push(branch * c.s);

            if let Some(perturbed) = perturbed {
                let shifted = perturbed.point_at(c.s);
                let dx_dbond = (shifted.x - c.x) / bond_delta;
                let dz_dbond = (shifted.z - c.z) / bond_delta;

                let row = Vector5::new(
                    -dir.0 * branch * cos - dir.1 * sin,
                    -dir.0 * branch * sin + dir.1 * cos,
                    -(dir.0 * c.x + dir.1 * c.z),
                    -r0 * (dir.0 * dx_dbond + dir.1 * dz_dbond),
                    dir.0 * branch * w2 + dir.1 * w1,
                );
                evaluation.normal_matrix += row * row.transpose();
                evaluation.gradient += row * residual;
            }
        }

        Ok(evaluation)
    }
}

/// Geometric starting point for the fit.
///
/// The apex is the profile's lowest point (image y grows downward), refined
/// together with the apex radius by a parabola fitted to the points near
/// the apex. The rotation follows the line through the midpoints of the
/// two branches. The Bond number starts at zero.
pub fn initial_guess(profile: &DropProfile) -> Result<FitParameters> {
    let points = &profile.points;
    if points.len() < 3 {
        return Err(PendantDropError::InsufficientData(format!(
            "profile has {} points", points.len()
        )));
    }

    let (min_x, max_x, min_y, max_y) = points.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
        |(x0, x1, y0, y1), p| (x0.min(p.0), x1.max(p.0), y0.min(p.1), y1.max(p.1)),
    );
    let height = max_y - min_y;

    let lowest: Vec<&(f64, f64)> = points.iter().filter(|p| p.1 >= max_y - 0.5).collect();
    let mut apex_x = lowest.iter().map(|p| p.0).sum::<f64>() / lowest.len() as f64;
    let mut apex_y = max_y;
    let mut apex_radius = ((max_x - min_x) / 2.0).max(1.0);

    let near_apex: Vec<&(f64, f64)> = points.iter().filter(|p| p.1 >= max_y - APEX_BAND * height).collect();
    if let Some((x, y, radius)) = fit_apex_parabola(&near_apex) {
        apex_x = x;
        apex_y = y;
        apex_radius = radius;
    }

    let rotation = estimate_rotation(points, apex_x, apex_y, height);

    Ok(FitParameters {
        apex_x,
        apex_y,
        apex_radius,
        bond_number: 0.0,
        rotation,
    })
}

/// Vertex and radius of curvature of `y = a + b x + c x^2` through the
/// points, if the parabola opens upward in the image (c < 0)
fn fit_apex_parabola(points: &[&(f64, f64)]) -> Option<(f64, f64, f64)> {
    if points.len() < 3 {
        return None;
    }

    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / points.len() as f64;
    let mut normal = Matrix3::zeros();
    let mut rhs = Vector3::zeros();
    for p in points {
        let x = p.0 - mean_x;
        let basis = Vector3::new(1.0, x, x * x);
        normal += basis * basis.transpose();
        rhs += basis * p.1;
    }

    let coefficients = normal.lu().solve(&rhs)?;
    let (a, b, c) = (coefficients[0], coefficients[1], coefficients[2]);
    if !(c < 0.0) {
        return None;
    }

    let radius = 1.0 / (2.0 * c.abs());
    let vertex_x = mean_x - b / (2.0 * c);
    let vertex_y = a - b * b / (4.0 * c);
    if !(radius.is_finite() && vertex_x.is_finite() && vertex_y.is_finite()) {
        return None;
    }

    Some((vertex_x, vertex_y, radius))
}

/// Tilt of the drop axis from the midpoints of the two branches sampled at
/// several heights above the apex. Zero when the branches cannot be paired.
fn estimate_rotation(points: &[(f64, f64)], apex_x: f64, apex_y: f64, height: f64) -> f64 {
    let nearest_at = |y: f64, left: bool| {
        points
            .iter()
            .filter(|p| (p.0 < apex_x) == left)
            .min_by(|a, b| (a.1 - y).abs().total_cmp(&(b.1 - y).abs()))
            .filter(|p| (p.1 - y).abs() < 2.0)
    };

    let midpoints: Vec<(f64, f64)> = (1..10)
        .map(|k| apex_y - k as f64 * height / 10.0)
        .filter_map(|y| match (nearest_at(y, true), nearest_at(y, false)) {
            (Some(l), Some(r)) => Some(((l.0 + r.0) / 2.0, y)),
            _ => None,
        })
        .collect();

    if midpoints.len() < 2 {
        return 0.0;
    }

    let n = midpoints.len() as f64;
    let mean_x = midpoints.iter().map(|m| m.0).sum::<f64>() / n;
    let mean_y = midpoints.iter().map(|m| m.1).sum::<f64>() / n;
    let syy: f64 = midpoints.iter().map(|m| (m.1 - mean_y).powi(2)).sum();
    if syy <= 0.0 {
        return 0.0;
    }
    let sxy: f64 = midpoints.iter().map(|m| (m.1 - mean_y) * (m.0 - mean_x)).sum();

    // Going up the axis, x changes by -tan(theta) per unit of y
    -(sxy / syy).atan()
}

/// Diagonal of the bounding box of the profile points
fn profile_extent(profile: &DropProfile) -> f64 {
    let (x_min, x_max, y_min, y_max) = profile.points.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
        |(x0, x1, y0, y1), p| (x0.min(p.0), x1.max(p.0), y0.min(p.1), y1.max(p.1)),
    );
    (x_max - x_min).hypot(y_max - y_min)
}

fn check_profile(profile: &DropProfile, options: &FitOptions) -> Result<()> {
    if profile.len() < options.min_profile_points {
        return Err(PendantDropError::InsufficientData(format!(
            "profile has {} points, at least {} are needed",
            profile.len(),
            options.min_profile_points
        )));
    }
    Ok(())
}

/// Replace the Bond number of `guess` with the best of a coarse scan
pub fn seed_bond_number(
    profile: &DropProfile,
    guess: &FitParameters,
    options: &FitOptions,
    cancel: &CancellationToken,
) -> Result<FitParameters> {
    let mut problem = ProfileProblem::new(profile, options.integration_step);
    let mut best = (f64::INFINITY, *guess);

    for &bond in &BOND_SEEDS {
        cancel.check()?;
        let trial = FitParameters { bond_number: bond, ..*guess };
        let cost = problem.evaluate(&trial, false, cancel)?.cost;
        if cost < best.0 {
            best = (cost, trial);
        }
    }

    log::debug!("Bond number seed {} (cost {:.4e})", best.1.bond_number, best.0);
    Ok(best.1)
}

/// Fit the Young-Laplace shape to `profile`, starting from `initial`.
///
/// Fails with `InsufficientData` for short profiles and `Cancelled` when
/// `cancel` fires. `FitDivergence` is returned when `max_iterations` trial
/// steps pass without convergence, or when the fit settles on an apex
/// radius out of proportion to the profile (flat or collinear points).
pub fn fit(
    profile: &DropProfile,
    initial: &FitParameters,
    options: &FitOptions,
    cancel: &CancellationToken,
) -> Result<FitResult> {
    check_profile(profile, options)?;
    if !(initial.apex_radius > 0.0) {
        return Err(PendantDropError::InsufficientData(format!(
            "invalid initial apex radius {}", initial.apex_radius
        )));
    }

    let mut problem = ProfileProblem::new(profile, options.integration_step);
    let mut params = *initial;
    let mut current = problem.evaluate(&params, true, cancel)?;
    let mut cost_history = vec![current.cost];
    let mut lambda = INITIAL_LAMBDA;

    let max_radius = MAX_RADIUS_PER_EXTENT * profile_extent(profile);
    let finish = |params: FitParameters, evaluation: &Evaluation, iterations: usize, cost_history: Vec<f64>| {
        if !(params.apex_radius <= max_radius) {
            log::warn!(
                "fitted apex radius {:.4e} px is out of proportion to a profile spanning {:.1} px",
                params.apex_radius,
                max_radius / MAX_RADIUS_PER_EXTENT
            );
            return Err(PendantDropError::FitDivergence { iterations });
        }

        let arclength_range = evaluation.arclengths.iter().fold(0.0f64, |m, s| m.max(s.abs()));
        Ok(FitResult {
            parameters: params,
            residuals: FitResiduals {
                points: evaluation.arclengths.iter().copied().zip(evaluation.residuals.iter().copied()).collect(),
            },
            arclength_range,
            iterations,
            cost_history,
        })
    };

    for iteration in 1..=options.max_iterations {
        cancel.check()?;

        if current.cost == 0.0 {
            return finish(params, &current, iteration - 1, cost_history);
        }

        let x = params.to_vector();
        let mut damped = current.normal_matrix;
        for i in 0..5 {
            damped[(i, i)] += lambda * current.normal_matrix[(i, i)].max(DIAGONAL_FLOOR);
        }

        let Some(delta) = damped.cholesky().map(|c| c.solve(&(-current.gradient))) else {
            lambda *= 10.0;
            continue;
        };

        let step_is_small = (0..5).all(|i| delta[i].abs() <= options.xtol * (x[i].abs() + options.xtol));

        let mut candidate = FitParameters::from_vector(&(x + delta));
        candidate.bond_number = candidate.bond_number.max(0.0);

        let trial = if candidate.apex_radius > 0.0 {
            Some(problem.evaluate(&candidate, false, cancel)?)
        } else {
            None
        };

        match trial {
            Some(trial) if trial.cost < current.cost => {
                let improvement = (current.cost - trial.cost) / current.cost;
                params = candidate;
                cost_history.push(trial.cost);
                lambda = (lambda / 10.0).max(1e-12);

                if step_is_small || improvement <= options.ftol {
                    log::debug!("fit converged after {} iterations, cost {:.6e}", iteration, trial.cost);
                    return finish(params, &trial, iteration, cost_history);
                }

                current = problem.evaluate(&params, true, cancel)?;
            }
            _ => {
                lambda *= 10.0;
                if step_is_small || lambda > MAX_LAMBDA {
                    log::debug!("fit stalled at a minimum after {} iterations, cost {:.6e}", iteration, current.cost);
                    return finish(params, &current, iteration, cost_history);
                }
            }
        }
    }

    Err(PendantDropError::FitDivergence { iterations: options.max_iterations })
}

/// Full fit of a silhouette: geometric guess, Bond number seed, then
/// Levenberg-Marquardt refinement.
pub fn fit_profile(
    profile: &DropProfile,
    options: &FitOptions,
    cancel: &CancellationToken,
) -> Result<FitResult> {
    check_profile(profile, options)?;
    let guess = initial_guess(profile)?;
    let seeded = seed_bond_number(profile, &guess, options, cancel)?;
    fit(profile, &seeded, options, cancel)
}

/// Model curve of a fit in image coordinates, from the top of the left
/// branch through the apex to the top of the right branch.
pub fn fitted_curve(
    result: &FitResult,
    step: f64,
    cancel: &CancellationToken,
) -> Result<Vec<(f64, f64)>> {
    let params = &result.parameters;
    let range = result.arclength_range.max(step);
    let shape = YoungLaplaceShape::integrate(params.bond_number, range, step, cancel)?;

    let branch: Vec<(f64, f64)> = (0..shape.len())
        .map(|i| shape.sample(i))
        .take_while(|p| p.s <= range)
        .map(|p| (p.x, p.z))
        .collect();

    Ok(branch
        .iter()
        .rev()
        .map(|&(r, z)| params.model_to_image(-r, z))
        .chain(branch.iter().skip(1).map(|&(r, z)| params.model_to_image(r, z)))
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// Silhouette sampled from the model itself, transformed into image
    /// coordinates: left branch top to apex to right branch top.
    pub(crate) fn synthetic_profile(truth: &FitParameters, every: usize, arclength: f64) -> DropProfile {
        let shape = YoungLaplaceShape::integrate(truth.bond_number, arclength, 2e-3, &CancellationToken::new()).unwrap();
        let right: Vec<(f64, f64)> = (1..shape.len())
            .step_by(every)
            .map(|i| shape.sample(i))
            .take_while(|p| !(p.x < 0.2 && p.phi > std::f64::consts::FRAC_PI_2))
            .map(|p| (p.x, p.z))
            .collect();

        let points = right
            .iter()
            .rev()
            .map(|&(r, z)| truth.model_to_image(-r, z))
            .chain(std::iter::once(truth.model_to_image(0.0, 0.0)))
            .chain(right.iter().map(|&(r, z)| truth.model_to_image(r, z)))
            .collect();
        DropProfile::new(points)
    }

    fn relative_error(actual: f64, expected: f64) -> f64 {
        ((actual - expected) / expected).abs()
    }

    #[test]
    fn recovers_known_parameters() {
        for &bond in &[0.1, 0.5, 1.0, 2.0] {
            let truth = FitParameters {
                apex_x: 320.3,
                apex_y: 410.7,
                apex_radius: 95.0,
                bond_number: bond,
                rotation: 0.05,
            };
            let profile = synthetic_profile(&truth, 20, 3.0);
            let result = fit_profile(&profile, &FitOptions::default(), &CancellationToken::new()).unwrap();
            let fitted = result.parameters;

            assert!(relative_error(fitted.apex_x, truth.apex_x) < 1e-3);
            assert!(relative_error(fitted.apex_y, truth.apex_y) < 1e-3);
            assert!(relative_error(fitted.apex_radius, truth.apex_radius) < 1e-3, "Bo {}: R0 {}", bond, fitted.apex_radius);
            assert!(relative_error(fitted.bond_number, bond) < 1e-3, "Bo {}: fitted {}", bond, fitted.bond_number);
            assert!(relative_error(fitted.rotation, truth.rotation) < 1e-3);
            assert!(result.residuals.rms() < 1e-3);
        }
    }

    #[test]
    fn residual_never_increases() {
        let truth = FitParameters {
            apex_x: 250.0,
            apex_y: 300.0,
            apex_radius: 70.0,
            bond_number: 0.4,
            rotation: -0.08,
        };
        let profile = synthetic_profile(&truth, 10, 3.0);
        let start = FitParameters {
            apex_x: 246.0,
            apex_y: 303.0,
            apex_radius: 60.0,
            bond_number: 0.2,
            rotation: 0.0,
        };
        let result = fit(&profile, &start, &FitOptions::default(), &CancellationToken::new()).unwrap();

        assert!(result.cost_history.len() > 1);
        for pair in result.cost_history.windows(2) {
            assert!(pair[1] <= pair[0], "cost rose from {} to {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn symmetric_drop_has_no_rotation() {
        let truth = FitParameters {
            apex_x: 200.0,
            apex_y: 300.0,
            apex_radius: 80.0,
            bond_number: 0.4,
            rotation: 0.0,
        };
        let profile = synthetic_profile(&truth, 10, 3.0);
        let options = FitOptions { max_iterations: 200, ..FitOptions::default() };
        let cancel = CancellationToken::new();

        let full = fit_profile(&profile, &options, &cancel).unwrap();
        assert!(full.parameters.rotation.abs() < 1e-6);

        let mid = profile.len() / 2;
        let left = DropProfile::new(profile.points[..=mid].to_vec());
        let right = DropProfile::new(profile.points[mid..].to_vec());
        let left_fit = fit_profile(&left, &options, &cancel).unwrap();
        let right_fit = fit_profile(&right, &options, &cancel).unwrap();

        assert_approx_eq!(left_fit.parameters.apex_radius, right_fit.parameters.apex_radius, 0.05);
        assert_approx_eq!(left_fit.parameters.apex_radius, 80.0, 0.05);
    }

    #[test]
    fn tolerates_a_cropped_branch() {
        let truth = FitParameters {
            apex_x: 200.0,
            apex_y: 300.0,
            apex_radius: 80.0,
            bond_number: 0.4,
            rotation: 0.1,
        };
        let full = synthetic_profile(&truth, 10, 3.0);
        let mid = full.len() / 2;
        let cropped: Vec<(f64, f64)> = full
            .points
            .iter()
            .enumerate()
            .filter(|(i, p)| *i <= mid || p.1 > 300.0 - 0.8 * 80.0)
            .map(|(_, p)| *p)
            .collect();

        let result = fit_profile(&DropProfile::new(cropped), &FitOptions::default(), &CancellationToken::new()).unwrap();
        assert!(relative_error(result.parameters.bond_number, 0.4) < 1e-2);
        assert!(relative_error(result.parameters.rotation, 0.1) < 1e-2);
    }

    #[test]
    fn short_profiles_are_insufficient() {
        let empty = DropProfile::empty();
        let result = fit_profile(&empty, &FitOptions::default(), &CancellationToken::new());
        assert!(matches!(result, Err(PendantDropError::InsufficientData(_))));

        let few = DropProfile::new((0..9).map(|i| (i as f64, (i as f64 - 4.0).powi(2))).collect());
        let result = fit_profile(&few, &FitOptions::default(), &CancellationToken::new());
        assert!(matches!(result, Err(PendantDropError::InsufficientData(_))));
    }

    #[test]
    fn iteration_budget_is_enforced() {
        let truth = FitParameters {
            apex_x: 150.0,
            apex_y: 200.0,
            apex_radius: 50.0,
            bond_number: 0.3,
            rotation: 0.0,
        };
        let profile = synthetic_profile(&truth, 10, 3.0);
        let start = FitParameters { apex_radius: 30.0, bond_number: 1.0, ..truth };
        let options = FitOptions { max_iterations: 1, ..FitOptions::default() };

        let result = fit(&profile, &start, &options, &CancellationToken::new());
        assert!(matches!(result, Err(PendantDropError::FitDivergence { iterations: 1 })));
    }

    #[test]
    fn cancelled_fit_stops_at_the_first_checkpoint() {
        let truth = FitParameters {
            apex_x: 150.0,
            apex_y: 200.0,
            apex_radius: 50.0,
            bond_number: 0.3,
            rotation: 0.0,
        };
        let profile = synthetic_profile(&truth, 10, 3.0);
        let token = CancellationToken::new();
        token.cancel();

        let result = fit_profile(&profile, &FitOptions::default(), &token);
        assert!(matches!(result, Err(PendantDropError::Cancelled)));
    }

    #[test]
    fn cancelling_from_another_thread_stops_a_running_fit() {
        let truth = FitParameters {
            apex_x: 150.0,
            apex_y: 200.0,
            apex_radius: 50.0,
            bond_number: 0.3,
            rotation: 0.0,
        };
        // Dense and never satisfied, so the loop keeps going until cancelled
        let profile = synthetic_profile(&truth, 1, 3.0);
        let start = FitParameters { apex_x: 140.0, apex_radius: 35.0, bond_number: 1.2, rotation: 0.1, ..truth };
        let options = FitOptions { xtol: 0.0, ftol: 0.0, max_iterations: 100_000, ..FitOptions::default() };

        let token = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let canceller = {
            let token = token.clone();
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                while token.checkpoints() < 3 {
                    if finished.load(Ordering::SeqCst) {
                        return None;
                    }
                    thread::yield_now();
                }
                token.cancel();
                Some(token.checkpoints())
            })
        };

        let result = fit(&profile, &start, &options, &token);
        finished.store(true, Ordering::SeqCst);
        let at_cancel = canceller.join().unwrap().expect("fit ended before it could be cancelled");

        assert!(matches!(result, Err(PendantDropError::Cancelled)), "{:?}", result.map(|r| r.iterations));
        assert!(at_cancel >= 3);
        assert!(token.checkpoints() - at_cancel <= 2, "{} checkpoints after cancelling", token.checkpoints() - at_cancel);
    }

    #[test]
    fn collinear_points_do_not_fit() {
        let line = DropProfile::new((0..30).map(|i| (100.0 + i as f64, 200.0)).collect());
        let start = FitParameters {
            apex_x: 114.5,
            apex_y: 200.0,
            apex_radius: 20.0,
            bond_number: 0.3,
            rotation: 0.0,
        };

        let result = fit(&line, &start, &FitOptions::default(), &CancellationToken::new());
        assert!(
            matches!(result, Err(PendantDropError::FitDivergence { .. })),
            "{:?}",
            result.map(|r| r.parameters)
        );
    }

    #[test]
    fn initial_guess_finds_the_apex() {
        let truth = FitParameters {
            apex_x: 120.0,
            apex_y: 240.0,
            apex_radius: 40.0,
            bond_number: 0.3,
            rotation: 0.0,
        };
        let profile = synthetic_profile(&truth, 5, 3.0);
        let guess = initial_guess(&profile).unwrap();

        assert_approx_eq!(guess.apex_x, 120.0, 1e-6);
        assert_approx_eq!(guess.apex_y, 240.0, 1.0);
        assert!(guess.apex_radius > 30.0 && guess.apex_radius < 50.0);
        assert!(guess.rotation.abs() < 1e-9);
        assert_eq!(guess.bond_number, 0.0);
    }

    #[test]
    fn fitted_curve_passes_through_the_apex() {
        let truth = FitParameters {
            apex_x: 100.0,
            apex_y: 150.0,
            apex_radius: 40.0,
            bond_number: 0.3,
            rotation: 0.0,
        };
        let result = FitResult {
            parameters: truth,
            residuals: FitResiduals::default(),
            arclength_range: 2.0,
            iterations: 0,
            cost_history: Vec::new(),
        };
        let curve = fitted_curve(&result, 2e-3, &CancellationToken::new()).unwrap();

        assert_eq!(curve.len() % 2, 1);
        let apex = curve[curve.len() / 2];
        assert_approx_eq!(apex.0, 100.0, 1e-9);
        assert_approx_eq!(apex.1, 150.0, 1e-9);

        // Mirror symmetric about the apex column
        let (first, last) = (curve[0], curve[curve.len() - 1]);
        assert_approx_eq!(first.0 + last.0, 200.0, 1e-9);
        assert_approx_eq!(first.1, last.1, 1e-9);
    }
}
