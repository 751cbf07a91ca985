//! Rim refinement for traced crater outlines.
//!
//! Smoothing before the gradient pulls the strongest edge of a sloped wall
//! inside the crest of the rim. Each boundary point is pushed outward along
//! the ray from the contour centre, over the unsmoothed intensity, to where
//! the wall has nearly reached the level of the surrounding terrain.

use super::contour::Contour;

/// Fraction of the wall height still below the outer level at the crest.
const RIM_LEVEL: f64 = 0.25;

/// Sampling step along each ray, in samples.
const RAY_STEP: f64 = 0.25;

/// Bilinear intensity at a fractional (row, col), `None` outside the raster.
fn bilinear(gray: &[u8], width: usize, height: usize, row: f64, col: f64) -> Option<f64> {
    if row < 0.0 || col < 0.0 || row > (height - 1) as f64 || col > (width - 1) as f64 {
        return None;
    }
    let (r0, c0) = (row.floor() as usize, col.floor() as usize);
    let (r1, c1) = ((r0 + 1).min(height - 1), (c0 + 1).min(width - 1));
    let (fr, fc) = (row - r0 as f64, col - c0 as f64);
    let at = |r: usize, c: usize| gray[r * width + c] as f64;
    let top = at(r0, c0) * (1.0 - fc) + at(r0, c1) * fc;
    let bottom = at(r1, c0) * (1.0 - fc) + at(r1, c1) * fc;
    Some(top * (1.0 - fr) + bottom * fr)
}

/// Distance from one boundary point out to the crest, or `None` when the
/// ray cannot be followed (point at the centre, or the walk leaves the tile).
fn ray_offset(
    gray: &[u8],
    width: usize,
    height: usize,
    point: (usize, usize),
    center: (f64, f64),
    window: f64,
) -> Option<f64> {
    let (pr, pc) = (point.0 as f64, point.1 as f64);
    let (dr, dc) = (pr - center.0, pc - center.1);
    let dist = dr.hypot(dc);
    if dist < 1.0 {
        return None;
    }
    let (ur, uc) = (dr / dist, dc / dist);

    let steps = (window / RAY_STEP).ceil() as usize;
    let mut profile = Vec::with_capacity(steps + 1);
    for i in 0..=steps {
        let t = i as f64 * RAY_STEP;
        profile.push(bilinear(gray, width, height, pr + ur * t, pc + uc * t)?);
    }

    let mut outer = profile[steps / 2..].to_vec();
    outer.sort_by(f64::total_cmp);
    let outer_level = outer[outer.len() / 2];

    // Raised features and edges already on the crest stay put
    let wall = outer_level - profile[0];
    if wall <= 0.0 {
        return Some(0.0);
    }

    let level = outer_level - RIM_LEVEL * wall;
    profile
        .iter()
        .position(|&v| v >= level)
        .map(|i| i as f64 * RAY_STEP)
}

/// Median outward distance from the traced boundary to the rim crest.
///
/// `sigma` is the smoothing used for the edge map; the search reaches
/// `4·sigma + 2` samples past the boundary.
pub fn rim_offset(
    gray: &[u8],
    width: usize,
    height: usize,
    contour: &Contour,
    center: (f64, f64),
    sigma: f64,
) -> f64 {
    let window = (4.0 * sigma).ceil() + 2.0;
    let mut offsets: Vec<f64> = contour
        .points
        .iter()
        .filter_map(|&p| ray_offset(gray, width, height, p, center, window))
        .collect();
    if offsets.is_empty() {
        return 0.0;
    }
    offsets.sort_by(f64::total_cmp);
    offsets[offsets.len() / 2]
}
