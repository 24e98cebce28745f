//! Letterbox preprocessing
//!
//! Aspect-preserving resize to the square model input with gray padding.
//! The recorded transform maps model-space outputs back to original-image
//! coordinates.

use image::{imageops, Rgb, RgbImage};
use visionguard_common::{BBox, Point};

/// Pad value for letterbox borders
const PAD_GRAY: u8 = 114;

/// Forward/inverse mapping between original-image and model-input space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl LetterboxTransform {
    /// Map an original-image point into model-input space.
    #[must_use]
    pub fn apply(&self, point: Point) -> Point {
        Point::new(
            point.x * self.scale + self.pad_x,
            point.y * self.scale + self.pad_y,
        )
    }

    /// Map a model-input point back into original-image space.
    #[must_use]
    pub fn invert(&self, point: Point) -> Point {
        Point::new(
            (point.x - self.pad_x) / self.scale,
            (point.y - self.pad_y) / self.scale,
        )
    }

    /// Map a model-space box back into original-image space.
    #[must_use]
    pub fn invert_bbox(&self, bbox: &BBox) -> BBox {
        let top_left = self.invert(Point::new(bbox.x, bbox.y));
        let bottom_right = self.invert(Point::new(bbox.x + bbox.width, bbox.y + bbox.height));
        BBox::from_corners(top_left.x, top_left.y, bottom_right.x, bottom_right.y)
    }
}

/// Letterbox `image` into a `input_size` × `input_size` canvas.
///
/// The content is scaled by `min(input_size/w, input_size/h)` and centered;
/// borders are filled with gray (114).
#[must_use]
pub fn letterbox(image: &RgbImage, input_size: u32) -> (RgbImage, LetterboxTransform) {
    let (width, height) = (image.width(), image.height());
    let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);

    let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, input_size);
    let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, input_size);

    let resized = imageops::resize(
        image,
        scaled_width,
        scaled_height,
        imageops::FilterType::Triangle,
    );

    let pad_x = (input_size - scaled_width) / 2;
    let pad_y = (input_size - scaled_height) / 2;

    let mut canvas = RgbImage::from_pixel(input_size, input_size, Rgb([PAD_GRAY; 3]));
    imageops::replace(&mut canvas, &resized, i64::from(pad_x), i64::from(pad_y));

    let transform = LetterboxTransform {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
    };
    (canvas, transform)
}
