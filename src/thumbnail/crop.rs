//! Crop rectangle for a thumbnail, centered on detected faces.

use serde::{Deserialize, Serialize};

use crate::config::AspectRatio;

/// Face bounding box in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Largest `aspect` rectangle that fits the image, centered on the midpoint of
/// the union of `faces` (image center when empty) and clamped inside the image.
pub fn plan_crop(width: u32, height: u32, aspect: AspectRatio, faces: &[FaceBox]) -> CropRect {
    let full = CropRect {
        x: 0,
        y: 0,
        width,
        height,
    };
    let Some(target) = aspect.ratio() else {
        return full;
    };
    if width == 0 || height == 0 {
        return full;
    }
    let (w, h) = (f64::from(width), f64::from(height));

    let (crop_w, crop_h) = if w / h > target {
        (h * target, h)
    } else {
        (w, w / target)
    };

    // Size is fixed first so the position clamp works on whole pixels.
    let crop_width = (crop_w.round() as u32).clamp(1, width);
    let crop_height = (crop_h.round() as u32).clamp(1, height);

    let (cx, cy) = face_center(faces).unwrap_or((w / 2.0, h / 2.0));

    CropRect {
        x: place(cx, crop_width, width),
        y: place(cy, crop_height, height),
        width: crop_width,
        height: crop_height,
    }
}

/// Start offset of a `span`-wide window centered on `center`, kept inside `[0, extent]`.
fn place(center: f64, span: u32, extent: u32) -> u32 {
    let start = (center - f64::from(span) / 2.0).round() as i64;
    start.clamp(0, i64::from(extent - span)) as u32
}

fn face_center(faces: &[FaceBox]) -> Option<(f64, f64)> {
    let first = faces.first()?;
    let init = (first.x, first.y, first.x + first.width, first.y + first.height);
    let (min_x, min_y, max_x, max_y) = faces.iter().fold(init, |(x0, y0, x1, y1), f| {
        (
            x0.min(f.x),
            y0.min(f.y),
            x1.max(f.x + f.width),
            y1.max(f.y + f.height),
        )
    });
    Some(((min_x + max_x) / 2.0, (min_y + max_y) / 2.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f64, y: f64, width: f64, height: f64) -> FaceBox {
        FaceBox {
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn original_returns_full_image() {
        let r = plan_crop(1920, 1080, AspectRatio::Original, &[face(0.0, 0.0, 10.0, 10.0)]);
        assert_eq!(
            r,
            CropRect {
                x: 0,
                y: 0,
                width: 1920,
                height: 1080
            }
        );
    }

    #[test]
    fn square_center_crop_of_landscape() {
        let r = plan_crop(1920, 1080, AspectRatio::Square, &[]);
        assert_eq!(
            r,
            CropRect {
                x: 420,
                y: 0,
                width: 1080,
                height: 1080
            }
        );
    }

    #[test]
    fn square_crop_follows_face_and_clamps_right() {
        let r = plan_crop(1920, 1080, AspectRatio::Square, &[face(1600.0, 400.0, 200.0, 200.0)]);
        assert_eq!(
            r,
            CropRect {
                x: 840,
                y: 0,
                width: 1080,
                height: 1080
            }
        );
    }

    #[test]
    fn portrait_crop_centered_on_face_union() {
        let faces = [face(100.0, 100.0, 100.0, 100.0), face(500.0, 300.0, 100.0, 100.0)];
        // Union midpoint x = 350; crop width = 1080 * 9/16 = 607.5.
        let r = plan_crop(1920, 1080, AspectRatio::Portrait9x16, &faces);
        assert_eq!(r.width, 608);
        assert_eq!(r.height, 1080);
        assert_eq!(r.x, 46);
        assert_eq!(r.y, 0);
    }

    #[test]
    fn landscape_crop_of_portrait_source_cuts_height() {
        let r = plan_crop(1080, 1920, AspectRatio::Landscape16x9, &[face(0.0, 0.0, 50.0, 50.0)]);
        assert_eq!(r.width, 1080);
        assert_eq!(r.height, 608);
        assert_eq!(r.x, 0);
        assert_eq!(r.y, 0);
    }

    #[test]
    fn crop_stays_inside_image_for_faces_at_every_edge() {
        let dims = [
            (1920, 1080),
            (1080, 1920),
            (1281, 721),
            (641, 359),
            (333, 333),
            (17, 9),
            (1, 1),
            (2, 1000),
        ];
        let ratios = [
            AspectRatio::Square,
            AspectRatio::Portrait9x16,
            AspectRatio::Landscape16x9,
        ];
        for (w, h) in dims {
            let (fw, fh) = (f64::from(w), f64::from(h));
            let faces = [
                vec![],
                vec![face(0.0, 0.0, 1.0, 1.0)],
                vec![face(fw - 1.0, fh / 2.0, 1.0, 1.0)],
                vec![face(fw / 2.0, fh - 1.0, 1.0, 1.0)],
                vec![face(fw - 1.0, fh - 1.0, 1.0, 1.0)],
                vec![face(fw - 20.0, fh - 20.0, 40.0, 40.0)],
                vec![face(-10.0, -10.0, 5.0, 5.0)],
                vec![face(0.0, 0.0, 1.0, 1.0), face(fw - 1.0, fh - 1.0, 1.0, 1.0)],
            ];
            for aspect in ratios {
                for set in &faces {
                    let r = plan_crop(w, h, aspect, set);
                    assert!(r.width >= 1 && r.height >= 1, "{w}x{h} {aspect:?} {r:?}");
                    assert!(r.x + r.width <= w, "{w}x{h} {aspect:?} {set:?} {r:?}");
                    assert!(r.y + r.height <= h, "{w}x{h} {aspect:?} {set:?} {r:?}");
                }
            }
        }
    }

    #[test]
    fn half_pixel_crop_against_far_edge_stays_inside() {
        let r = plan_crop(1920, 1080, AspectRatio::Portrait9x16, &[face(1900.0, 500.0, 10.0, 10.0)]);
        assert_eq!((r.x, r.width), (1312, 608));
        let r = plan_crop(1080, 1920, AspectRatio::Landscape16x9, &[face(500.0, 1900.0, 10.0, 10.0)]);
        assert_eq!((r.y, r.height), (1312, 608));
    }

    #[test]
    fn crop_is_deterministic() {
        let faces = [face(10.0, 20.0, 30.0, 40.0)];
        assert_eq!(
            plan_crop(640, 480, AspectRatio::Square, &faces),
            plan_crop(640, 480, AspectRatio::Square, &faces)
        );
    }
}
