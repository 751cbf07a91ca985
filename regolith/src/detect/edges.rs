//! Canny-style edge map: Gaussian smoothing, Sobel gradients, non-maximum
//! suppression and double-threshold hysteresis, plus the 3×3 closing used
//! to bridge small gaps in crater rims.
//!
//! All filters clamp indices at the raster border (replicate).

use std::collections::VecDeque;

type Kernel3 = [[f32; 3]; 3];

const SOBEL_KERNEL_X: Kernel3 = [[-1.0, 0.0, 1.0], [-2.0, 0.0, 2.0], [-1.0, 0.0, 1.0]];
const SOBEL_KERNEL_Y: Kernel3 = [[-1.0, -2.0, -1.0], [0.0, 0.0, 0.0], [1.0, 2.0, 1.0]];

const TAN_22_5_DEG: f32 = 0.41421356237;

/// Row-major single-channel float raster.
#[derive(Clone, Debug)]
pub struct Plane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Plane {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    /// Lift 8-bit intensities into a float plane.
    pub fn from_u8(width: usize, height: usize, gray: &[u8]) -> Self {
        Self {
            width,
            height,
            data: gray.iter().map(|&v| v as f32).collect(),
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[f32] {
        &self.data[y * self.width..(y + 1) * self.width]
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(0.0, f32::max)
    }
}

/// Binary raster of edge pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeMask {
    pub width: usize,
    pub height: usize,
    pub data: Vec<bool>,
}

impl EdgeMask {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![false; width * height],
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> bool {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, v: bool) {
        self.data[y * self.width + x] = v;
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }
}

/// Sobel response with per-pixel magnitude.
#[derive(Clone, Debug)]
pub struct Gradients {
    pub gx: Plane,
    pub gy: Plane,
    pub mag: Plane,
}

/// Normalized 1-D Gaussian taps covering ±3σ.
fn gaussian_taps(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as i32;
    let denom = 2.0 * sigma * sigma;
    let mut taps: Vec<f32> = (-radius..=radius)
        .map(|i| (-((i * i) as f32) / denom).exp())
        .collect();
    let sum: f32 = taps.iter().sum();
    for t in &mut taps {
        *t /= sum;
    }
    taps
}

/// Separable Gaussian blur.
pub fn gaussian_blur(input: &Plane, sigma: f32) -> Plane {
    let (w, h) = (input.width, input.height);
    if w == 0 || h == 0 || sigma <= 0.0 {
        return input.clone();
    }
    let taps = gaussian_taps(sigma);
    let radius = (taps.len() / 2) as isize;

    // horizontal
    let mut tmp = Plane::new(w, h);
    for y in 0..h {
        let row = input.row(y);
        let out = &mut tmp.data[y * w..(y + 1) * w];
        for (x, o) in out.iter_mut().enumerate() {
            let mut acc = 0.0;
            for (k, &t) in taps.iter().enumerate() {
                let xx = (x as isize + k as isize - radius).clamp(0, w as isize - 1) as usize;
                acc += row[xx] * t;
            }
            *o = acc;
        }
    }

    // vertical
    let mut out = Plane::new(w, h);
    for y in 0..h {
        for (k, &t) in taps.iter().enumerate() {
            let yy = (y as isize + k as isize - radius).clamp(0, h as isize - 1) as usize;
            let src = tmp.row(yy);
            let dst = &mut out.data[y * w..(y + 1) * w];
            for (d, &s) in dst.iter_mut().zip(src) {
                *d += s * t;
            }
        }
    }
    out
}

/// Sobel gradients with border clamping.
pub fn sobel_gradients(l: &Plane) -> Gradients {
    let (w, h) = (l.width, l.height);
    let mut gx = Plane::new(w, h);
    let mut gy = Plane::new(w, h);
    let mut mag = Plane::new(w, h);

    if w == 0 || h == 0 {
        return Gradients { gx, gy, mag };
    }

    for y in 0..h {
        let y_idx = [y.saturating_sub(1), y, (y + 1).min(h - 1)];
        let rows = [l.row(y_idx[0]), l.row(y_idx[1]), l.row(y_idx[2])];
        for x in 0..w {
            let x_idx = [x.saturating_sub(1), x, (x + 1).min(w - 1)];

            let mut sum_x = 0.0;
            let mut sum_y = 0.0;
            for (ky, yy_row) in rows.iter().enumerate() {
                let kx_row = &SOBEL_KERNEL_X[ky];
                let ky_row = &SOBEL_KERNEL_Y[ky];
                sum_x += yy_row[x_idx[0]] * kx_row[0]
                    + yy_row[x_idx[1]] * kx_row[1]
                    + yy_row[x_idx[2]] * kx_row[2];
                sum_y += yy_row[x_idx[0]] * ky_row[0]
                    + yy_row[x_idx[1]] * ky_row[1]
                    + yy_row[x_idx[2]] * ky_row[2];
            }

            let idx = y * w + x;
            gx.data[idx] = sum_x;
            gy.data[idx] = sum_y;
            mag.data[idx] = (sum_x * sum_x + sum_y * sum_y).sqrt();
        }
    }

    Gradients { gx, gy, mag }
}

/// Thin gradient ridges to one pixel along the quantized gradient direction.
///
/// A pixel survives when its magnitude is `>=` the neighbour behind it and
/// `>` the neighbour ahead of it, so a two-pixel plateau keeps exactly one
/// pixel. The outermost 1-pixel frame is always suppressed.
pub fn non_max_suppression(grad: &Gradients) -> Plane {
    let (w, h) = (grad.mag.width, grad.mag.height);
    let mut out = Plane::new(w, h);
    if w < 3 || h < 3 {
        return out;
    }

    for y in 1..h - 1 {
        let mag_prev = grad.mag.row(y - 1);
        let mag_row = grad.mag.row(y);
        let mag_next = grad.mag.row(y + 1);
        let gx_row = grad.gx.row(y);
        let gy_row = grad.gy.row(y);

        for x in 1..w - 1 {
            let mag = mag_row[x];
            if mag <= 0.0 {
                continue;
            }

            let gx = gx_row[x];
            let gy = gy_row[x];
            let abs_gx = gx.abs();
            let abs_gy = gy.abs();
            let same_sign = (gx >= 0.0 && gy >= 0.0) || (gx <= 0.0 && gy <= 0.0);

            // (behind, ahead) along the gradient
            let (behind, ahead) = if abs_gx >= abs_gy {
                if abs_gy <= abs_gx * TAN_22_5_DEG {
                    (mag_row[x - 1], mag_row[x + 1])
                } else if same_sign {
                    (mag_prev[x - 1], mag_next[x + 1])
                } else {
                    (mag_next[x - 1], mag_prev[x + 1])
                }
            } else if abs_gx <= abs_gy * TAN_22_5_DEG {
                (mag_prev[x], mag_next[x])
            } else if same_sign {
                (mag_prev[x - 1], mag_next[x + 1])
            } else {
                (mag_next[x - 1], mag_prev[x + 1])
            };

            if mag >= behind && mag > ahead {
                out.data[y * w + x] = mag;
            }
        }
    }

    out
}

/// Double-threshold hysteresis.
///
/// `low` and `high` are fractions of the strongest thinned response. Strong
/// pixels seed the map; weak pixels join when 8-connected to a seed.
pub fn hysteresis(thin: &Plane, low: f32, high: f32) -> EdgeMask {
    let (w, h) = (thin.width, thin.height);
    let mut mask = EdgeMask::new(w, h);
    let peak = thin.max();
    if peak <= 0.0 {
        return mask;
    }
    let low_abs = (low * peak).max(f32::MIN_POSITIVE);
    let high_abs = (high * peak).max(low_abs);

    let mut queue = VecDeque::new();
    for (i, &v) in thin.data.iter().enumerate() {
        if v >= high_abs {
            mask.data[i] = true;
            queue.push_back(i);
        }
    }

    while let Some(i) = queue.pop_front() {
        let (x, y) = ((i % w) as isize, (i / w) as isize);
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                    continue;
                }
                let j = ny as usize * w + nx as usize;
                if !mask.data[j] && thin.data[j] >= low_abs {
                    mask.data[j] = true;
                    queue.push_back(j);
                }
            }
        }
    }

    mask
}

/// 3×3 dilation followed by 3×3 erosion.
///
/// Pixels outside the raster count as background when dilating and as
/// foreground when eroding, so closing never eats into the border.
pub fn close_3x3(mask: &EdgeMask) -> EdgeMask {
    let dilated = morph_3x3(mask, false);
    morph_3x3(&dilated, true)
}

fn morph_3x3(mask: &EdgeMask, erode: bool) -> EdgeMask {
    let (w, h) = (mask.width, mask.height);
    let mut out = EdgeMask::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut hit = erode;
            'window: for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    let (nx, ny) = (x as isize + dx, y as isize + dy);
                    let inside = nx >= 0 && ny >= 0 && nx < w as isize && ny < h as isize;
                    let v = if inside {
                        mask.get(nx as usize, ny as usize)
                    } else {
                        erode
                    };
                    if erode && !v {
                        hit = false;
                        break 'window;
                    }
                    if !erode && v {
                        hit = true;
                        break 'window;
                    }
                }
            }
            out.set(x, y, hit);
        }
    }
    out
}

/// Full edge stage on an 8-bit intensity raster.
pub fn detect_edges(gray: &Plane, sigma: f32, low: f32, high: f32) -> EdgeMask {
    let smoothed = gaussian_blur(gray, sigma);
    let grad = sobel_gradients(&smoothed);
    let thin = non_max_suppression(&grad);
    let edges = hysteresis(&thin, low, high);
    close_3x3(&edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_plane(w: usize, h: usize, split: usize) -> Plane {
        let mut p = Plane::new(w, h);
        for y in 0..h {
            for x in split..w {
                p.data[y * w + x] = 255.0;
            }
        }
        p
    }

    #[test]
    fn test_gaussian_preserves_constant() {
        let mut p = Plane::new(9, 7);
        p.data.iter_mut().for_each(|v| *v = 42.0);
        let blurred = gaussian_blur(&p, 1.5);
        for v in blurred.data {
            assert!((v - 42.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_gaussian_taps_normalized() {
        let taps = gaussian_taps(2.0);
        assert_eq!(taps.len(), 13);
        let sum: f32 = taps.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_sobel_vertical_step() {
        let p = step_plane(8, 5, 4);
        let grad = sobel_gradients(&p);
        assert!(grad.gx.get(3, 2) > 0.0);
        assert!(grad.gx.get(4, 2) > 0.0);
        assert_eq!(grad.gy.get(3, 2), 0.0);
        assert_eq!(grad.mag.get(0, 2), 0.0);
    }

    #[test]
    fn test_nms_plateau_keeps_one_pixel() {
        // Unblurred step gives equal magnitude at x=3 and x=4
        let p = step_plane(8, 5, 4);
        let thin = non_max_suppression(&sobel_gradients(&p));
        for y in 1..4 {
            let kept: Vec<usize> = (0..8).filter(|&x| thin.get(x, y) > 0.0).collect();
            assert_eq!(kept, vec![4]);
        }
    }

    #[test]
    fn test_hysteresis_follows_weak_chain() {
        let mut thin = Plane::new(6, 1);
        thin.data = vec![10.0, 4.0, 2.0, 0.0, 4.0, 0.5];
        let mask = hysteresis(&thin, 0.1, 0.5);
        assert_eq!(mask.data, vec![true, true, true, false, false, false]);
    }

    #[test]
    fn test_hysteresis_empty_when_flat() {
        let thin = Plane::new(4, 4);
        assert_eq!(hysteresis(&thin, 0.1, 0.3).count(), 0);
    }

    #[test]
    fn test_closing_bridges_gap() {
        let mut mask = EdgeMask::new(7, 5);
        for x in [0, 1, 2, 4, 5, 6] {
            mask.set(x, 2, true);
        }
        let closed = close_3x3(&mask);
        assert!(closed.get(3, 2));
        assert!(!closed.get(3, 1));
        assert!(!closed.get(3, 3));
    }

    #[test]
    fn test_detect_edges_flat_is_empty() {
        let mut p = Plane::new(16, 16);
        p.data.iter_mut().for_each(|v| *v = 100.0);
        assert_eq!(detect_edges(&p, 1.0, 0.1, 0.3).count(), 0);
    }
}
