use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in image pixel coordinates.
///
/// A region may extend past the image bounds; it is clipped when used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Build a region from two opposite corners, in any order.
    pub fn from_corners(p0: (i32, i32), p1: (i32, i32)) -> Self {
        let (x0, x1) = (p0.0.min(p1.0), p0.0.max(p1.0));
        let (y0, y1) = (p0.1.min(p1.1), p0.1.max(p1.1));
        Self {
            x: x0,
            y: y0,
            width: (x1 as i64 - x0 as i64) as u32,
            height: (y1 as i64 - y0 as i64) as u32,
        }
    }

    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exclusive right edge. Wider than `i32` so any region fits.
    #[inline]
    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    #[inline]
    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// (left, top, right, bottom)
    pub fn as_ltrb(&self) -> [i64; 4] {
        [self.x as i64, self.y as i64, self.right(), self.bottom()]
    }

    /// Intersection with an image of the given size, `None` if empty.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<Region> {
        let x0 = (self.x as i64).max(0);
        let y0 = (self.y as i64).max(0);
        let x1 = self.right().min(width as i64);
        let y1 = self.bottom().min(height as i64);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        // 0 <= x0 < x1 <= width, so every value fits its field
        Some(Region {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// Crop a region out of an image as an 8-bit grayscale buffer.
///
/// Returns the crop together with the clipped region it covers, or `None`
/// when the region is degenerate or lies entirely outside the image.
pub fn crop_grayscale(image: &DynamicImage, region: &Region) -> Option<(GrayImage, Region)> {
    if region.is_degenerate() {
        return None;
    }

    let clipped = region.clip_to(image.width(), image.height())?;
    let crop = image.crop_imm(
        clipped.x as u32,
        clipped.y as u32,
        clipped.width,
        clipped.height,
    );

    // Already-grayscale images pass through `to_luma8` unchanged
    Some((crop.to_luma8(), clipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    #[test]
    fn corners_are_normalised() {
        let region = Region::from_corners((30, 40), (10, 5));
        assert_eq!(region, Region::new(10, 5, 20, 35));
        assert_eq!(region.as_ltrb(), [10, 5, 30, 40]);
    }

    #[test]
    fn clipping_keeps_overlap_only() {
        let region = Region::new(-5, 90, 20, 30);
        assert_eq!(region.clip_to(100, 100), Some(Region::new(0, 90, 15, 10)));
        assert_eq!(Region::new(200, 0, 10, 10).clip_to(100, 100), None);
    }

    #[test]
    fn huge_regions_do_not_overflow() {
        let region = Region::new(i32::MAX - 10, 5, u32::MAX, 20);
        assert_eq!(region.right(), i32::MAX as i64 - 10 + u32::MAX as i64);
        assert_eq!(region.clip_to(100, 100), None);

        let covering = Region::new(-50, -50, u32::MAX, u32::MAX);
        assert_eq!(covering.clip_to(64, 48), Some(Region::new(0, 0, 64, 48)));

        let corners = Region::from_corners((i32::MIN, 0), (i32::MAX, 10));
        assert_eq!(corners.width, u32::MAX);
        assert_eq!(corners.as_ltrb(), [i32::MIN as i64, 0, i32::MAX as i64, 10]);

        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 10, Luma([0])));
        let (crop, clipped) = crop_grayscale(&image, &covering).unwrap();
        assert_eq!(crop.dimensions(), (10, 10));
        assert_eq!(clipped, Region::new(0, 0, 10, 10));
    }

    #[test]
    fn degenerate_region_yields_no_crop() {
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 10, Luma([0])));
        assert!(crop_grayscale(&image, &Region::new(0, 0, 0, 5)).is_none());
        assert!(crop_grayscale(&image, &Region::new(0, 0, 5, 0)).is_none());
    }

    #[test]
    fn colour_crop_is_converted_to_grayscale() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, Rgb([255, 255, 255])));
        let (crop, clipped) = crop_grayscale(&image, &Region::new(2, 1, 10, 3)).unwrap();
        assert_eq!(clipped, Region::new(2, 1, 6, 3));
        assert_eq!(crop.dimensions(), (6, 3));
        assert_eq!(crop.get_pixel(0, 0)[0], 255);
    }
}
