//! Dimensionless Young-Laplace shape of an axisymmetric pendant drop.
//!
//! Lengths are in units of the apex radius and the arclength `s` runs from
//! the apex:
//!
//! ```text
//! dx/ds = cos(phi)
//! dz/ds = sin(phi)
//! dphi/ds = 2 - Bo*z - sin(phi)/x,    x(0) = z(0) = phi(0) = 0
//! ```
//!
//! `z` points from the apex into the drop (against gravity). The curve is
//! stored as a table sampled every `step` so the fitter can query it under
//! many trial transforms without re-integrating.

use std::f64::consts::PI;

use crate::cancellation::CancellationToken;
use crate::errors::{PendantDropError, Result};

/// Steps between two cancellation checkpoints
const CANCEL_CHECK_INTERVAL: usize = 256;

/// Stride of the coarse pass of the closest-point search
const SEARCH_STRIDE: usize = 8;

/// One sample of the shape curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapePoint {
    pub s: f64,
    pub x: f64,
    pub z: f64,
    pub phi: f64,
}

/// Closest point of the curve to a query point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosestPoint {
    pub point: ShapePoint,
    /// Euclidean distance to the query point
    pub distance: f64,
}

/// Tabulated solution of the Young-Laplace system for one Bond number
#[derive(Debug, Clone)]
pub struct YoungLaplaceShape {
    bond: f64,
    step: f64,
    x: Vec<f64>,
    z: Vec<f64>,
    phi: Vec<f64>,
    /// The curve turned past the horizontal (phi > pi) or reached the axis
    terminated: bool,
}

#[inline]
fn derivatives(bond: f64, x: f64, z: f64, phi: f64) -> (f64, f64, f64) {
    let (sin_phi, cos_phi) = phi.sin_cos();
    (cos_phi, sin_phi, 2.0 - bond * z - sin_phi / x)
}

impl YoungLaplaceShape {
    /// Integrate the shape for `bond` up to `arclength_max`.
    ///
    /// The first step uses the series expansion about the apex, where the
    /// `sin(phi)/x` term is singular; the rest is classic RK4 with a fixed
    /// step. Integration also stops once phi passes pi.
    pub fn integrate(
        bond: f64,
        arclength_max: f64,
        step: f64,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if !(step > 0.0) || !step.is_finite() {
            return Err(PendantDropError::Domain(format!("invalid integration step {}", step)));
        }
        if !(bond >= 0.0) || !bond.is_finite() {
            return Err(PendantDropError::Domain(format!("invalid Bond number {}", bond)));
        }

        let capacity = (arclength_max.max(step) / step).ceil() as usize + 2;
        let mut shape = Self {
            bond,
            step,
            x: Vec::with_capacity(capacity),
            z: Vec::with_capacity(capacity),
            phi: Vec::with_capacity(capacity),
            terminated: false,
        };

        shape.push(0.0, 0.0, 0.0);

        // x ~ s - s^3/6, z ~ s^2/2 - (Bo/32 + 1/24) s^4, phi ~ s - Bo s^3/8
        let s = step;
        let (mut x, mut z, mut phi) = (
            s - s.powi(3) / 6.0,
            s * s / 2.0 - (bond / 32.0 + 1.0 / 24.0) * s.powi(4),
            s - bond * s.powi(3) / 8.0,
        );
        shape.push(x, z, phi);

        let h = step;
        let mut steps = 1usize;
        while (steps as f64) * h < arclength_max {
            if steps % CANCEL_CHECK_INTERVAL == 0 {
                cancel.check()?;
            }

            let k1 = derivatives(bond, x, z, phi);
            let k2 = derivatives(bond, x + 0.5 * h * k1.0, z + 0.5 * h * k1.1, phi + 0.5 * h * k1.2);
            let k3 = derivatives(bond, x + 0.5 * h * k2.0, z + 0.5 * h * k2.1, phi + 0.5 * h * k2.2);
            let k4 = derivatives(bond, x + h * k3.0, z + h * k3.1, phi + h * k3.2);

            x += h / 6.0 * (k1.0 + 2.0 * k2.0 + 2.0 * k3.0 + k4.0);
            z += h / 6.0 * (k1.1 + 2.0 * k2.1 + 2.0 * k3.1 + k4.1);
            phi += h / 6.0 * (k1.2 + 2.0 * k2.2 + 2.0 * k3.2 + k4.2);
            steps += 1;

            if !(x.is_finite() && z.is_finite() && phi.is_finite()) {
                shape.terminated = true;
                break;
            }

            shape.push(x, z, phi);

            if phi > PI || x <= 0.0 {
                shape.terminated = true;
                break;
            }
        }

        Ok(shape)
    }

    fn push(&mut self, x: f64, z: f64, phi: f64) {
        self.x.push(x);
        self.z.push(z);
        self.phi.push(phi);
    }

    pub fn bond(&self) -> f64 {
        self.bond
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Arclength of the last sample
    pub fn arclength_end(&self) -> f64 {
        (self.len().saturating_sub(1)) as f64 * self.step
    }

    /// Whether the table reaches `arclength`, or can never be extended
    pub fn covers(&self, arclength: f64) -> bool {
        self.terminated || self.arclength_end() >= arclength
    }

    pub fn sample(&self, i: usize) -> ShapePoint {
        ShapePoint {
            s: i as f64 * self.step,
            x: self.x[i],
            z: self.z[i],
            phi: self.phi[i],
        }
    }

    fn lerp(&self, i: usize, t: f64) -> ShapePoint {
        let j = (i + 1).min(self.len() - 1);
        ShapePoint {
            s: (i as f64 + t) * self.step,
            x: self.x[i] + t * (self.x[j] - self.x[i]),
            z: self.z[i] + t * (self.z[j] - self.z[i]),
            phi: self.phi[i] + t * (self.phi[j] - self.phi[i]),
        }
    }

    /// Linearly interpolated point at arclength `s`, clamped to the table
    pub fn point_at(&self, s: f64) -> ShapePoint {
        let last = self.len() - 1;
        let position = (s / self.step).clamp(0.0, last as f64);
        let i = (position.floor() as usize).min(last.saturating_sub(1));
        self.lerp(i, position - i as f64)
    }

    #[inline]
    fn distance_sq(&self, i: usize, q: (f64, f64)) -> f64 {
        (self.x[i] - q.0).powi(2) + (self.z[i] - q.1).powi(2)
    }

    /// Nearest point of the curve to `q = (x, z)`, with `x >= 0` expected.
    ///
    /// A coarse pass over every `SEARCH_STRIDE`-th sample is refined over
    /// the neighbouring samples, then projected onto the adjacent segments.
    pub fn closest_point(&self, q: (f64, f64)) -> ClosestPoint {
        let n = self.len();

        let coarse = (0..n)
            .step_by(SEARCH_STRIDE)
            .chain(std::iter::once(n - 1))
            .min_by(|&a, &b| self.distance_sq(a, q).total_cmp(&self.distance_sq(b, q)))
            .unwrap_or(0);

        let lo = coarse.saturating_sub(SEARCH_STRIDE);
        let hi = (coarse + SEARCH_STRIDE).min(n - 1);
        let nearest = (lo..=hi)
            .min_by(|&a, &b| self.distance_sq(a, q).total_cmp(&self.distance_sq(b, q)))
            .unwrap_or(coarse);

        let mut best: Option<(f64, ShapePoint)> = None;
        for i in [nearest.wrapping_sub(1), nearest] {
            if i >= n.saturating_sub(1) {
                continue;
            }
            let (ax, az) = (self.x[i], self.z[i]);
            let (dx, dz) = (self.x[i + 1] - ax, self.z[i + 1] - az);
            let len_sq = dx * dx + dz * dz;
            let t = if len_sq > 0.0 {
                (((q.0 - ax) * dx + (q.1 - az) * dz) / len_sq).clamp(0.0, 1.0)
            } else {
                0.0
            };

            let point = self.lerp(i, t);
            let d = (point.x - q.0).powi(2) + (point.z - q.1).powi(2);
            if best.map_or(true, |(best_d, _)| d < best_d) {
                best = Some((d, point));
            }
        }

        let (d, point) = best.unwrap_or_else(|| {
            let point = self.sample(nearest);
            (self.distance_sq(nearest, q), point)
        });

        ClosestPoint { point, distance: d.sqrt() }
    }

    /// Dimensionless volume of revolution from the apex to `arclength`,
    /// `pi * integral(x^2 dz)`.
    pub fn volume(&self, arclength: f64) -> f64 {
        PI * self.integrate_segments(arclength, |a, b| {
            0.5 * (a.x * a.x + b.x * b.x) * (b.z - a.z)
        })
    }

    /// Dimensionless surface area of revolution from the apex to
    /// `arclength`, `2 pi * integral(x ds)`.
    pub fn surface_area(&self, arclength: f64) -> f64 {
        2.0 * PI * self.integrate_segments(arclength, |a, b| {
            0.5 * (a.x + b.x) * (b.s - a.s)
        })
    }

    /// Trapezoid sum over the segments up to `arclength`, the last one
    /// truncated at the interpolated end point.
    fn integrate_segments<F>(&self, arclength: f64, term: F) -> f64
    where
        F: Fn(&ShapePoint, &ShapePoint) -> f64,
    {
        if self.len() < 2 || arclength <= 0.0 {
            return 0.0;
        }

        let end = self.point_at(arclength);
        let mut total = 0.0;
        let mut previous = self.sample(0);
        for i in 1..self.len() {
            let current = self.sample(i);
            if current.s >= end.s {
                break;
            }
            total += term(&previous, &current);
            previous = current;
        }

        total + term(&previous, &end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn integrate(bond: f64, arclength: f64) -> YoungLaplaceShape {
        YoungLaplaceShape::integrate(bond, arclength, 2e-3, &CancellationToken::new()).unwrap()
    }

    #[test]
    fn zero_bond_number_is_a_unit_sphere() {
        let shape = integrate(0.0, 10.0);

        for &s in &[0.1, 0.5, 1.0, 2.0, 3.0] {
            let p = shape.point_at(s);
            assert_approx_eq!(p.x, s.sin(), 1e-5);
            assert_approx_eq!(p.z, 1.0 - s.cos(), 1e-5);
            assert_approx_eq!(p.phi, s, 1e-5);
        }

        // Stops once the profile closes over the top of the sphere
        assert!(shape.covers(10.0));
        assert!(shape.arclength_end() < PI + 0.01);
    }

    #[test]
    fn sphere_volume_and_area() {
        let shape = integrate(0.0, 10.0);
        assert_approx_eq!(shape.volume(PI / 2.0), 2.0 * PI / 3.0, 1e-4);
        assert_approx_eq!(shape.surface_area(PI / 2.0), 2.0 * PI, 1e-4);
        assert_approx_eq!(shape.volume(PI), 4.0 * PI / 3.0, 1e-3);
        assert_approx_eq!(shape.surface_area(PI), 4.0 * PI, 1e-3);
    }

    #[test]
    fn stops_at_requested_arclength() {
        let shape = integrate(0.5, 1.5);
        assert!(!shape.covers(2.0));
        assert!(shape.covers(1.5));
        assert!(shape.arclength_end() < 1.5 + 2e-3 + 1e-12);
    }

    #[test]
    fn gravity_narrows_the_drop() {
        // With gravity the curvature decays with height, so the drop is
        // wider than a sphere at the same arclength.
        let sphere = integrate(0.0, 2.0);
        let pendant = integrate(0.5, 2.0);
        assert!(pendant.point_at(2.0).x > sphere.point_at(2.0).x);
        assert!(pendant.point_at(2.0).phi < sphere.point_at(2.0).phi);
    }

    #[test]
    fn closest_point_projects_onto_the_curve() {
        let shape = integrate(0.0, 10.0);

        // Point outside the unit sphere, along the direction of s = 1
        let (x, z) = (1.5 * 1.0f64.sin(), 1.0 - 1.5 * 1.0f64.cos());
        let closest = shape.closest_point((x, z));
        assert_approx_eq!(closest.point.s, 1.0, 1e-3);
        assert_approx_eq!(closest.distance, 0.5, 1e-5);

        let apex = shape.closest_point((0.0, -0.25));
        assert_approx_eq!(apex.point.s, 0.0, 1e-9);
        assert_approx_eq!(apex.distance, 0.25, 1e-9);
    }

    #[test]
    fn cancelled_integration_stops() {
        let token = CancellationToken::new();
        token.cancel();
        let result = YoungLaplaceShape::integrate(0.3, 20.0, 1e-3, &token);
        assert!(matches!(result, Err(PendantDropError::Cancelled)));
    }

    #[test]
    fn negative_bond_number_is_rejected() {
        let result = YoungLaplaceShape::integrate(-0.1, 1.0, 1e-3, &CancellationToken::new());
        assert!(matches!(result, Err(PendantDropError::Domain(_))));
    }
}
