//! Annotated preview of a detection run.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};

use super::contour::Contour;
use super::CraterCandidate;

const MARK: Rgb<u8> = Rgb([255, 0, 0]);

/// Render accepted contours and their fitted circles in red over the
/// normalized intensity, downscaled so the long side is at most `max_dim`.
pub fn render(
    width: usize,
    height: usize,
    gray: &[u8],
    accepted: &[(&Contour, &CraterCandidate)],
    max_dim: u32,
) -> RgbImage {
    let base = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([gray[y as usize * width + x as usize]])
    });

    let long_side = width.max(height) as f64;
    let scale = (max_dim as f64 / long_side).min(1.0);
    let out_w = ((width as f64 * scale).round() as u32).max(1);
    let out_h = ((height as f64 * scale).round() as u32).max(1);

    let base = if scale < 1.0 {
        imageops::resize(&base, out_w, out_h, FilterType::Triangle)
    } else {
        base
    };

    let mut rgb = RgbImage::from_fn(base.width(), base.height(), |x, y| {
        let v = base.get_pixel(x, y)[0];
        Rgb([v, v, v])
    });

    for (contour, candidate) in accepted {
        for &(r, c) in &contour.points {
            put(&mut rgb, r as f64 * scale, c as f64 * scale);
        }
        draw_circle(
            &mut rgb,
            candidate.row * scale,
            candidate.column * scale,
            candidate.radius_px * scale,
        );
    }

    rgb
}

fn put(img: &mut RgbImage, row: f64, col: f64) {
    let (x, y) = (col.round(), row.round());
    if x < 0.0 || y < 0.0 || x >= img.width() as f64 || y >= img.height() as f64 {
        return;
    }
    img.put_pixel(x as u32, y as u32, MARK);
}

fn draw_circle(img: &mut RgbImage, row: f64, col: f64, radius: f64) {
    let steps = ((radius * std::f64::consts::TAU * 2.0).ceil() as usize).max(8);
    for i in 0..steps {
        let theta = i as f64 / steps as f64 * std::f64::consts::TAU;
        put(img, row + radius * theta.sin(), col + radius * theta.cos());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(row: f64, column: f64, radius_px: f64) -> CraterCandidate {
        CraterCandidate {
            row,
            column,
            radius_px,
            diameter_km: 1.0,
            circularity: 1.0,
            depth_km: 0.2,
        }
    }

    #[test]
    fn test_overlay_keeps_small_size() {
        let gray = vec![128u8; 40 * 20];
        let img = render(40, 20, &gray, &[], 1000);
        assert_eq!(img.dimensions(), (40, 20));
        assert_eq!(img.get_pixel(5, 5), &Rgb([128, 128, 128]));
    }

    #[test]
    fn test_overlay_downscales_long_side() {
        let gray = vec![0u8; 400 * 100];
        let img = render(400, 100, &gray, &[], 100);
        assert_eq!(img.dimensions(), (100, 25));
    }

    #[test]
    fn test_overlay_marks_candidates() {
        let gray = vec![0u8; 64 * 64];
        let contour = Contour {
            points: vec![(10, 10), (10, 11), (11, 11)],
        };
        let c = candidate(32.0, 32.0, 10.0);
        let img = render(64, 64, &gray, &[(&contour, &c)], 1000);

        assert_eq!(img.get_pixel(10, 10), &MARK);
        assert_eq!(img.get_pixel(42, 32), &MARK);
        assert_eq!(img.get_pixel(32, 32), &Rgb([0, 0, 0]));
    }
}
