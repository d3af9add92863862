//! Drop images rendered from the shape model, with known parameters.
//!
//! Used to exercise the whole pipeline without a camera: the silhouette
//! is filled row by row from the integrated profile and the needle
//! continues the top of the profile up to the image edge.

use image::{GrayImage, Luma};

use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::young_laplace::YoungLaplaceShape;

/// Geometry of a rendered drop, in pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticDrop {
    pub apex_x: f64,
    pub apex_y: f64,
    pub apex_radius: f64,
    pub bond_number: f64,
    /// Dimensionless arclength where the drop meets the needle
    pub arclength: f64,
    pub width: u32,
    pub height: u32,
}

impl Default for SyntheticDrop {
    fn default() -> Self {
        Self {
            apex_x: 160.0,
            apex_y: 300.0,
            apex_radius: 60.0,
            bond_number: 0.4,
            arclength: 2.6,
            width: 320,
            height: 340,
        }
    }
}

/// A rendered frame and the first pixel row below the needle
#[derive(Debug, Clone)]
pub struct RenderedDrop {
    pub image: GrayImage,
    pub drop_top: i32,
}

impl SyntheticDrop {
    pub fn with_bond_number(bond_number: f64) -> Self {
        Self { bond_number, ..Self::default() }
    }

    /// Dark drop on a white background
    pub fn render(&self, cancel: &CancellationToken) -> Result<RenderedDrop> {
        let shape = YoungLaplaceShape::integrate(self.bond_number, self.arclength, 2e-3, cancel)?;
        let samples: Vec<_> = (0..shape.len()).map(|i| shape.sample(i)).collect();
        let top = samples[samples.len() - 1];

        // Half width of the silhouette at model height z
        let half_width_at = |z: f64| -> Option<f64> {
            if z < 0.0 {
                return None;
            }
            if z > top.z {
                return Some(top.x);
            }
            samples.windows(2).find(|w| w[1].z >= z).map(|w| {
                let t = (z - w[0].z) / (w[1].z - w[0].z);
                w[0].x + t * (w[1].x - w[0].x)
            })
        };

        let mut image = GrayImage::from_pixel(self.width, self.height, Luma([255]));
        for py in 0..self.height {
            let z = (self.apex_y - (py as f64 + 0.5)) / self.apex_radius;
            let Some(half) = half_width_at(z) else { continue };
            for px in 0..self.width {
                if ((px as f64 + 0.5) - self.apex_x).abs() / self.apex_radius <= half {
                    image.put_pixel(px, py, Luma([0]));
                }
            }
        }

        let drop_top = (self.apex_y - top.z * self.apex_radius) as i32 + 1;
        Ok(RenderedDrop { image, drop_top })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apex_row_is_the_lowest_dark_row() {
        let drop = SyntheticDrop::default();
        let rendered = drop.render(&CancellationToken::new()).unwrap();
        let column = drop.apex_x as u32;

        assert_eq!(rendered.image.get_pixel(column, 299)[0], 0);
        assert_eq!(rendered.image.get_pixel(column, 300)[0], 255);
        assert!(rendered.drop_top > 0 && rendered.drop_top < 300);
        // Needle reaches the top edge
        assert_eq!(rendered.image.get_pixel(column, 0)[0], 0);
        assert_eq!(rendered.image.get_pixel(0, 0)[0], 255);
    }

    #[test]
    fn cancelled_render_fails() {
        let token = CancellationToken::new();
        token.cancel();
        let drop = SyntheticDrop { arclength: 3.0, ..SyntheticDrop::default() };
        assert!(drop.render(&token).is_err());
    }
}
