//! Axis-aligned boxes and points in image pixel coordinates

use serde::{Deserialize, Serialize};

/// A point in image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    #[must_use]
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounding box (top-left corner + size), in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    #[must_use]
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a box from corner coordinates.
    #[must_use]
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: (x2 - x1).max(0.0),
            height: (y2 - y1).max(0.0),
        }
    }

    /// Center point of the box.
    #[must_use]
    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Bottom-center point, the representative point for ROI membership
    /// (approximates where the object touches the ground plane).
    #[must_use]
    pub fn bottom_center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height)
    }

    #[must_use]
    #[inline]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersection over union with another box. Uses the continuous
    /// convention (no `+1` pixel) uniformly across the codebase.
    #[must_use]
    #[inline]
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection_width = (x2 - x1).max(0.0);
        let intersection_height = (y2 - y1).max(0.0);
        let intersection_area = intersection_width * intersection_height;

        let union_area = self.area() + other.area() - intersection_area;

        if union_area > 0.0 {
            intersection_area / union_area
        } else {
            0.0
        }
    }

    /// Clip the box to frame bounds.
    #[must_use]
    pub fn clipped(&self, frame_width: u32, frame_height: u32) -> BBox {
        let x1 = self.x.clamp(0.0, frame_width as f32);
        let y1 = self.y.clamp(0.0, frame_height as f32);
        let x2 = (self.x + self.width).clamp(0.0, frame_width as f32);
        let y2 = (self.y + self.height).clamp(0.0, frame_height as f32);
        BBox::from_corners(x1, y1, x2, y2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_overlap() {
        let a = BBox::new(0.0, 0.0, 100.0, 100.0);
        let b = BBox::new(50.0, 50.0, 100.0, 100.0);

        let iou = a.iou(&b);
        assert!(iou > 0.0 && iou < 1.0);

        // Identical boxes
        let c = BBox::new(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&c) - 1.0).abs() < 0.001);

        // Disjoint boxes
        let d = BBox::new(200.0, 200.0, 50.0, 50.0);
        assert_eq!(a.iou(&d), 0.0);
    }

    #[test]
    fn test_iou_degenerate_boxes() {
        let zero = BBox::new(0.0, 0.0, 0.0, 0.0);
        assert_eq!(zero.iou(&zero), 0.0);
    }

    #[test]
    fn test_clip_to_frame() {
        let b = BBox::new(-10.0, -10.0, 100.0, 100.0);
        let clipped = b.clipped(640, 480);
        assert_eq!(clipped.x, 0.0);
        assert_eq!(clipped.y, 0.0);
        assert_eq!(clipped.width, 90.0);
        assert_eq!(clipped.height, 90.0);

        let b = BBox::new(600.0, 440.0, 100.0, 100.0);
        let clipped = b.clipped(640, 480);
        assert_eq!(clipped.width, 40.0);
        assert_eq!(clipped.height, 40.0);
    }

    #[test]
    fn test_bottom_center() {
        let b = BBox::new(100.0, 100.0, 50.0, 80.0);
        let p = b.bottom_center();
        assert_eq!(p.x, 125.0);
        assert_eq!(p.y, 180.0);
    }
}
