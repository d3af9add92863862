//! Drop silhouette and needle edge extraction.
//!
//! Both paths share the same foreground detection: grayscale crop, Gaussian
//! blur, inverse binary threshold (the backlit drop is dark), then border
//! following via `imageproc::contours::find_contours`.

use std::collections::HashSet;

use image::{imageops, DynamicImage, GrayImage};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::contrast::threshold;
use imageproc::filter::gaussian_blur_f32;

use crate::image_utils::{crop_grayscale, Region};

/// Contour points closer than this to the crop border are clipping artifacts
const IGNORE_EDGE_MARGIN: i32 = 1;

/// Foreground detection parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractionParams {
    /// Odd Gaussian kernel size, 1 disables the blur
    pub gaussian_kernel_size: u32,
    /// Pixels darker than or equal to this become foreground
    pub threshold: u8,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self {
            gaussian_kernel_size: 3,
            threshold: 30,
        }
    }
}

/// Ordered drop silhouette in image pixel coordinates.
///
/// Points follow the contour (arclength order) without duplicates. An
/// empty profile means no usable contour was found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DropProfile {
    pub points: Vec<(f64, f64)>,
}

impl DropProfile {
    pub fn new(points: Vec<(f64, f64)>) -> Self {
        Self { points }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Length of the polyline through the profile points
    pub fn arclength(&self) -> f64 {
        self.points
            .windows(2)
            .map(|w| (w[1].0 - w[0].0).hypot(w[1].1 - w[0].1))
            .sum()
    }
}

/// The two boundary curves of the needle, each sorted top to bottom
#[derive(Debug, Clone, PartialEq)]
pub struct NeedleEdges {
    pub left: Vec<(f64, f64)>,
    pub right: Vec<(f64, f64)>,
}

/// Apparent needle width used to convert pixels to metres
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeedleCalibration {
    pub width_px: f64,
}

impl NeedleCalibration {
    pub fn is_valid(&self) -> bool {
        self.width_px.is_finite() && self.width_px > 0.0
    }
}

/// Gaussian sigma matching an odd kernel size (OpenCV convention)
fn kernel_sigma(kernel_size: u32) -> f32 {
    0.3 * ((kernel_size as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Blur and inverse-threshold a grayscale crop so that dark pixels become
/// the 255-valued foreground.
pub fn apply_foreground_detection(gray: &GrayImage, params: &ExtractionParams) -> GrayImage {
    let blurred = if params.gaussian_kernel_size > 1 {
        gaussian_blur_f32(gray, kernel_sigma(params.gaussian_kernel_size))
    } else {
        gray.clone()
    };

    let mut mask = threshold(&blurred, params.threshold);
    imageops::invert(&mut mask);
    mask
}

fn enclosed_area(contour: &Contour<i32>) -> f64 {
    let points = &contour.points;
    let n = points.len();
    if n < 3 {
        return 0.0;
    }

    let twice_area: i64 = (0..n)
        .map(|i| {
            let p = points[i];
            let q = points[(i + 1) % n];
            p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64
        })
        .sum();

    (twice_area as f64 / 2.0).abs()
}

/// Outer border enclosing the largest area, if any
fn largest_outer_contour(mask: &GrayImage) -> Option<Vec<(i32, i32)>> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .map(|c| (enclosed_area(&c), c))
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, c)| c.points.iter().map(|p| (p.x, p.y)).collect())
}

/// Drop duplicate and back-tracking border points, keeping the first visit
pub fn squish_contour(contour: &[(i32, i32)]) -> Vec<(i32, i32)> {
    let mut seen = HashSet::with_capacity(contour.len());
    contour
        .iter()
        .copied()
        .filter(|point| seen.insert(*point))
        .collect()
}

fn drop_edge_points(points: Vec<(i32, i32)>, width: u32, height: u32) -> Vec<(i32, i32)> {
    let (width, height) = (width as i32, height as i32);
    if width < IGNORE_EDGE_MARGIN || height < IGNORE_EDGE_MARGIN {
        return points;
    }

    points
        .into_iter()
        .filter(|&(x, y)| {
            IGNORE_EDGE_MARGIN < x && x < width - IGNORE_EDGE_MARGIN
                && IGNORE_EDGE_MARGIN < y && y < height - IGNORE_EDGE_MARGIN
        })
        .collect()
}

/// Rotate a cyclic point sequence so it starts right after its widest gap,
/// which is where border points were cut out. A closed silhouette is cut
/// at its topmost point instead.
fn order_by_arclength(mut points: Vec<(i32, i32)>) -> Vec<(i32, i32)> {
    let n = points.len();
    if n < 3 {
        return points;
    }

    let gap = |i: usize| {
        let (a, b) = (points[i], points[(i + 1) % n]);
        (((b.0 - a.0).pow(2) + (b.1 - a.1).pow(2)) as f64).sqrt()
    };

    let (widest, widest_gap) = (0..n)
        .map(|i| (i, gap(i)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((n - 1, 0.0));

    let start = if widest_gap > 1.5 {
        (widest + 1) % n
    } else {
        (0..n).min_by_key(|&i| (points[i].1, points[i].0)).unwrap_or(0)
    };

    points.rotate_left(start);
    points
}

/// Extract the drop silhouette from `region` of `image`.
///
/// A degenerate or fully out-of-bounds region, or an image without any
/// foreground, yields an empty profile.
pub fn extract_profile(image: &DynamicImage, region: &Region, params: &ExtractionParams) -> DropProfile {
    let Some((gray, clipped)) = crop_grayscale(image, region) else {
        return DropProfile::empty();
    };

    let mask = apply_foreground_detection(&gray, params);
    let Some(contour) = largest_outer_contour(&mask) else {
        return DropProfile::empty();
    };

    let points = drop_edge_points(squish_contour(&contour), clipped.width, clipped.height);
    let points = order_by_arclength(points);

    DropProfile::new(
        points
            .into_iter()
            .map(|(x, y)| ((x + clipped.x) as f64, (y + clipped.y) as f64))
            .collect(),
    )
}

/// Extract the left and right needle edges from `region` of `image`.
pub fn extract_needle_edges(
    image: &DynamicImage,
    region: &Region,
    params: &ExtractionParams,
) -> Option<NeedleEdges> {
    let (gray, clipped) = crop_grayscale(image, region)?;
    let mask = apply_foreground_detection(&gray, params);
    let contour = largest_outer_contour(&mask)?;
    let points = drop_edge_points(squish_contour(&contour), clipped.width, clipped.height);

    if points.len() < 4 {
        return None;
    }

    let centre_x = points.iter().map(|p| p.0 as f64).sum::<f64>() / points.len() as f64;
    let to_image = |&(x, y): &(i32, i32)| ((x + clipped.x) as f64, (y + clipped.y) as f64);

    let mut left: Vec<(f64, f64)> = points.iter().filter(|p| (p.0 as f64) < centre_x).map(to_image).collect();
    let mut right: Vec<(f64, f64)> = points.iter().filter(|p| (p.0 as f64) > centre_x).map(to_image).collect();

    if left.len() < 2 || right.len() < 2 {
        return None;
    }

    left.sort_by(|a, b| a.1.total_cmp(&b.1));
    right.sort_by(|a, b| a.1.total_cmp(&b.1));

    Some(NeedleEdges { left, right })
}

/// Least-squares line `x = a + b*y`, `None` when the points share one row
fn fit_edge_line(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

    let syy: f64 = points.iter().map(|p| (p.1 - mean_y).powi(2)).sum();
    if syy <= f64::EPSILON {
        return None;
    }
    let sxy: f64 = points.iter().map(|p| (p.1 - mean_y) * (p.0 - mean_x)).sum();

    let b = sxy / syy;
    Some((mean_x - b * mean_y, b))
}

fn distance_to_line(point: (f64, f64), line: (f64, f64)) -> f64 {
    let (a, b) = line;
    (point.0 - (a + b * point.1)).abs() / (1.0 + b * b).sqrt()
}

/// Mean perpendicular separation of the two needle edges over the central
/// half of their vertical extent, measured between boundary pixel centres.
///
/// A width that cannot be measured is reported as NaN and rejected
/// downstream.
pub fn needle_calibration(edges: &NeedleEdges) -> NeedleCalibration {
    let invalid = NeedleCalibration { width_px: f64::NAN };

    let (Some(left_line), Some(right_line)) = (fit_edge_line(&edges.left), fit_edge_line(&edges.right)) else {
        return invalid;
    };

    let all_y = edges.left.iter().chain(edges.right.iter()).map(|p| p.1);
    let (y_min, y_max) = all_y.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), y| (lo.min(y), hi.max(y)));
    let quarter = (y_max - y_min) / 4.0;
    let in_band = |p: &&(f64, f64)| p.1 >= y_min + quarter && p.1 <= y_max - quarter;

    let distances: Vec<f64> = edges.left.iter().filter(in_band).map(|&p| distance_to_line(p, right_line))
        .chain(edges.right.iter().filter(in_band).map(|&p| distance_to_line(p, left_line)))
        .collect();

    if distances.is_empty() {
        return invalid;
    }

    let mean = distances.iter().sum::<f64>() / distances.len() as f64;
    NeedleCalibration { width_px: mean }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use image::Luma;

    fn white(width: u32, height: u32) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([255]))
    }

    /// Dark disc hanging from the top edge of the image
    fn hanging_disc(width: u32, height: u32, cx: f64, cy: f64, radius: f64) -> GrayImage {
        let mut img = white(width, height);
        for y in 0..height {
            for x in 0..width {
                let (dx, dy) = (x as f64 - cx, y as f64 - cy);
                let in_disc = dx * dx + dy * dy <= radius * radius;
                let in_stem = (y as f64) < cy && dx.abs() <= radius * 0.5;
                if in_disc || in_stem {
                    img.put_pixel(x, y, Luma([0]));
                }
            }
        }
        img
    }

    #[test]
    fn all_white_image_gives_empty_profile() {
        let image = DynamicImage::ImageLuma8(white(64, 64));
        let profile = extract_profile(&image, &Region::new(0, 0, 64, 64), &ExtractionParams::default());
        assert!(profile.is_empty());
    }

    #[test]
    fn degenerate_region_gives_empty_profile() {
        let image = DynamicImage::ImageLuma8(hanging_disc(64, 64, 32.0, 30.0, 15.0));
        let params = ExtractionParams::default();
        assert!(extract_profile(&image, &Region::new(0, 0, 0, 64), &params).is_empty());
        assert!(extract_profile(&image, &Region::new(0, 0, 64, 0), &params).is_empty());
        assert!(extract_profile(&image, &Region::new(500, 500, 10, 10), &params).is_empty());
    }

    #[test]
    fn profile_is_duplicate_free_and_away_from_crop_border() {
        let image = DynamicImage::ImageLuma8(hanging_disc(80, 80, 40.0, 35.0, 20.0));
        let region = Region::new(5, 10, 70, 65);
        let profile = extract_profile(&image, &region, &ExtractionParams::default());

        assert!(profile.len() > 50);

        let unique: HashSet<(i64, i64)> = profile.points.iter().map(|p| (p.0 as i64, p.1 as i64)).collect();
        assert_eq!(unique.len(), profile.len());

        for &(x, y) in &profile.points {
            assert!(x > (region.x + 1) as f64 && x < (region.right() - 1) as f64);
            assert!(y > (region.y + 1) as f64 && y < (region.bottom() - 1) as f64);
        }

        // The apex of the disc is its lowest point
        let lowest = profile.points.iter().map(|p| p.1).fold(f64::MIN, f64::max);
        assert!((lowest - 55.0).abs() <= 2.0, "lowest point {}", lowest);
    }

    #[test]
    fn profile_is_ordered_along_the_contour() {
        let image = DynamicImage::ImageLuma8(hanging_disc(80, 80, 40.0, 35.0, 20.0));
        let profile = extract_profile(&image, &Region::new(0, 20, 80, 60), &ExtractionParams::default());

        let max_step = profile.points.windows(2)
            .map(|w| (w[1].0 - w[0].0).hypot(w[1].1 - w[0].1))
            .fold(0.0, f64::max);
        assert!(max_step < 2.0, "contour jumps by {}", max_step);
    }

    #[test]
    fn largest_blob_wins() {
        let mut img = hanging_disc(100, 100, 60.0, 50.0, 25.0);
        for y in 10..14 {
            for x in 10..14 {
                img.put_pixel(x, y, Luma([0]));
            }
        }
        let image = DynamicImage::ImageLuma8(img);
        let profile = extract_profile(&image, &Region::new(0, 0, 100, 100), &ExtractionParams::default());
        assert!(profile.points.iter().all(|p| p.0 > 20.0));
    }

    #[test]
    fn squish_removes_backtracking() {
        let contour = vec![(0, 0), (1, 0), (2, 0), (1, 0), (1, 1), (0, 0)];
        assert_eq!(squish_contour(&contour), vec![(0, 0), (1, 0), (2, 0), (1, 1)]);
    }

    #[test]
    fn needle_width_is_the_edge_separation() {
        let mut img = white(60, 40);
        for y in 0..40 {
            for x in 20..32 {
                img.put_pixel(x, y, Luma([0]));
            }
        }
        let image = DynamicImage::ImageLuma8(img);
        let params = ExtractionParams { gaussian_kernel_size: 1, threshold: 30 };

        let edges = extract_needle_edges(&image, &Region::new(0, 0, 60, 40), &params).unwrap();
        assert!(edges.left.iter().all(|p| p.0 == 20.0));
        assert!(edges.right.iter().all(|p| p.0 == 31.0));

        let calibration = needle_calibration(&edges);
        assert!(calibration.is_valid());
        // Boundary columns 20 and 31
        assert_approx_eq!(calibration.width_px, 11.0, 1e-9);
    }

    #[test]
    fn needle_edges_require_a_needle() {
        let image = DynamicImage::ImageLuma8(white(30, 30));
        assert!(extract_needle_edges(&image, &Region::new(0, 0, 30, 30), &ExtractionParams::default()).is_none());
    }

    #[test]
    fn flat_edges_give_invalid_calibration() {
        let edges = NeedleEdges {
            left: vec![(1.0, 5.0), (2.0, 5.0)],
            right: vec![(8.0, 5.0), (9.0, 5.0)],
        };
        assert!(!needle_calibration(&edges).is_valid());
    }
}
