//! Crater detection on a single tile.
//!
//! The pipeline normalizes raw samples to 8-bit intensity, builds a
//! Canny-style edge map, traces the outer boundary of every edge component
//! and keeps the roughly circular ones above a minimum size:
//!
//! 1. Min/max stretch to `0..=255`
//! 2. Gaussian blur, Sobel gradients, non-maximum suppression, hysteresis
//! 3. 3×3 closing, 8-connected labeling, Moore-neighbour boundary trace
//! 4. Equivalent radius from the filled region, pushed out to the rim crest
//!    along rays from the centre; circularity `4π·A/P²`
//! 5. Depth from an assumed depth/diameter relationship
//!
//! Depth is an estimate, never a measurement: the tile is used only for
//! its planimetric shape.
//!
//! # Example
//!
//! ```ignore
//! use regolith::{detect, DetectionConfig, Tile};
//!
//! let tile = Tile::from_file("lat-30_lon000.pgm")?;
//! let result = detect(&tile, &DetectionConfig::default())?;
//! println!("{} craters, mean diameter {:.2} km",
//!     result.stats.count, result.stats.mean_diameter_km);
//! ```

pub mod contour;
pub mod edges;
pub mod overlay;
pub mod rim;

use std::time::Instant;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RegolithError, Result};
use crate::stats::DetectionStatistics;
use crate::tile::Tile;

use contour::find_contours;
use edges::{detect_edges, Plane};
use rim::rim_offset;

/// Rows decoded at a time while normalizing.
const NORMALIZE_CHUNK_ROWS: usize = 256;

/// Depth/diameter relationship used to estimate crater depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum DepthModel {
    /// `depth = ratio × diameter`
    Proportional { ratio: f64 },
    /// `depth = coefficient × diameter^exponent`
    PowerLaw { coefficient: f64, exponent: f64 },
}

impl Default for DepthModel {
    fn default() -> Self {
        DepthModel::Proportional { ratio: 0.2 }
    }
}

impl DepthModel {
    /// Unclamped depth in km for a diameter in km.
    pub fn depth_km(&self, diameter_km: f64) -> f64 {
        match *self {
            DepthModel::Proportional { ratio } => ratio * diameter_km,
            DepthModel::PowerLaw {
                coefficient,
                exponent,
            } => coefficient * diameter_km.powf(exponent),
        }
    }
}

/// Tunable parameters for [`detect`].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionConfig {
    /// Smallest diameter reported, in km.
    pub min_diameter_km: f64,
    /// Gaussian smoothing before gradients, in samples.
    pub sigma: f64,
    /// Weak hysteresis threshold as a fraction of the strongest edge.
    pub low_threshold: f64,
    /// Strong hysteresis threshold as a fraction of the strongest edge.
    pub high_threshold: f64,
    /// Contours below this circularity are rejected.
    pub min_circularity: f64,
    pub depth_model: DepthModel,
    /// Upper bound on any depth estimate, in km.
    pub max_depth_km: f64,
    /// Long side of the overlay image, in pixels.
    pub overlay_max_dim: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_diameter_km: 1.0,
            sigma: 1.0,
            low_threshold: 0.1,
            high_threshold: 0.3,
            min_circularity: 0.5,
            depth_model: DepthModel::default(),
            max_depth_km: 8.0,
            overlay_max_dim: 1000,
        }
    }
}

impl DetectionConfig {
    pub fn with_min_diameter_km(mut self, min_diameter_km: f64) -> Self {
        self.min_diameter_km = min_diameter_km;
        self
    }

    pub fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = sigma;
        self
    }

    pub fn with_thresholds(mut self, low: f64, high: f64) -> Self {
        self.low_threshold = low;
        self.high_threshold = high;
        self
    }

    pub fn with_min_circularity(mut self, min_circularity: f64) -> Self {
        self.min_circularity = min_circularity;
        self
    }

    pub fn with_depth_model(mut self, depth_model: DepthModel) -> Self {
        self.depth_model = depth_model;
        self
    }

    pub fn with_max_depth_km(mut self, max_depth_km: f64) -> Self {
        self.max_depth_km = max_depth_km;
        self
    }

    pub fn with_overlay_max_dim(mut self, overlay_max_dim: u32) -> Self {
        self.overlay_max_dim = overlay_max_dim;
        self
    }

    /// Check that every parameter is usable.
    pub fn validate(&self) -> Result<()> {
        if !(self.min_diameter_km >= 0.0 && self.min_diameter_km.is_finite()) {
            return Err(RegolithError::invalid_config(
                "min_diameter_km",
                format!("must be a non-negative number, got {}", self.min_diameter_km),
            ));
        }
        if !(self.sigma > 0.0 && self.sigma.is_finite()) {
            return Err(RegolithError::invalid_config(
                "sigma",
                format!("must be positive, got {}", self.sigma),
            ));
        }
        if !(0.0..=1.0).contains(&self.low_threshold)
            || !(0.0..=1.0).contains(&self.high_threshold)
            || self.low_threshold > self.high_threshold
        {
            return Err(RegolithError::invalid_config(
                "thresholds",
                format!(
                    "need 0 <= low <= high <= 1, got low={} high={}",
                    self.low_threshold, self.high_threshold
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_circularity) {
            return Err(RegolithError::invalid_config(
                "min_circularity",
                format!("must be within [0, 1], got {}", self.min_circularity),
            ));
        }
        if !(self.max_depth_km > 0.0) {
            return Err(RegolithError::invalid_config(
                "max_depth_km",
                format!("must be positive, got {}", self.max_depth_km),
            ));
        }
        if self.overlay_max_dim == 0 {
            return Err(RegolithError::invalid_config(
                "overlay_max_dim",
                "must be at least 1 pixel",
            ));
        }
        Ok(())
    }
}

/// One accepted crater.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CraterCandidate {
    /// Center row in sample space.
    pub row: f64,
    /// Center column in sample space.
    pub column: f64,
    /// Distance from the center to the rim crest, in samples.
    pub radius_px: f64,
    pub diameter_km: f64,
    /// `4π·area/perimeter²`, within `[0, 1]`.
    pub circularity: f64,
    /// Estimated from the configured depth model, never measured.
    pub depth_km: f64,
}

/// Output of one detection run.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// Accepted craters in raster order of their topmost boundary pixel.
    pub candidates: Vec<CraterCandidate>,
    pub stats: DetectionStatistics,
    /// Downscaled intensity with accepted contours marked.
    pub overlay: RgbImage,
}

impl DetectionResult {
    /// `true` when no contour passed the filters.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Stretch the sample range of `tile` to `0..=255`.
///
/// A flat tile maps to all zeros.
pub fn normalize_to_u8(tile: &Tile) -> Vec<u8> {
    let (min, max) = tile.sample_range();
    let span = (max - min) as f64;
    let mut out = Vec::with_capacity(tile.width() * tile.height());
    let mut buffer = Vec::new();
    let mut row = 0;
    while row < tile.height() {
        let read = tile.read_rows(row, NORMALIZE_CHUNK_ROWS, &mut buffer);
        if span == 0.0 {
            out.extend(std::iter::repeat(0u8).take(buffer.len()));
        } else {
            out.extend(
                buffer
                    .iter()
                    .map(|&v| ((v - min) as f64 * 255.0 / span).round() as u8),
            );
        }
        row += read;
    }
    out
}

/// Detect craters in `tile`.
///
/// Finding nothing is not an error: the result is empty with zeroed
/// statistics.
///
/// # Errors
///
/// Returns [`RegolithError::InvalidConfig`] if `config` fails validation.
pub fn detect(tile: &Tile, config: &DetectionConfig) -> Result<DetectionResult> {
    config.validate()?;
    let start = Instant::now();
    let (width, height) = (tile.width(), tile.height());
    let km_per_sample = tile.geometry().km_per_sample;

    let gray = normalize_to_u8(tile);
    let plane = Plane::from_u8(width, height, &gray);
    let edges = detect_edges(
        &plane,
        config.sigma as f32,
        config.low_threshold as f32,
        config.high_threshold as f32,
    );
    debug!(edge_pixels = edges.count(), "edge map built");

    let contours = find_contours(&edges);
    let total_contours = contours.len();

    let mut accepted = Vec::new();
    for contour in &contours {
        let perimeter = contour.perimeter();
        // Open traces enclose nothing
        if contour.area() <= 0.0 || perimeter <= 0.0 {
            continue;
        }

        let area = contour.filled_area() as f64;
        let (row, column) = contour.center();
        // The filled region ends half a sample beyond the boundary centres
        let boundary_radius = ((area / std::f64::consts::PI).sqrt() - 0.5).max(0.0);
        let radius_px = boundary_radius
            + rim_offset(&gray, width, height, contour, (row, column), config.sigma);
        let diameter_km = 2.0 * radius_px * km_per_sample;
        if diameter_km < config.min_diameter_km {
            continue;
        }

        let circularity =
            (4.0 * std::f64::consts::PI * area / (perimeter * perimeter)).clamp(0.0, 1.0);
        if circularity < config.min_circularity {
            continue;
        }

        let depth_km = config
            .depth_model
            .depth_km(diameter_km)
            .clamp(0.0, config.max_depth_km);

        accepted.push((
            contour,
            CraterCandidate {
                row,
                column,
                radius_px,
                diameter_km,
                circularity,
                depth_km,
            },
        ));
    }

    let overlay_marks: Vec<_> = accepted.iter().map(|(c, k)| (*c, k)).collect();
    let overlay = overlay::render(width, height, &gray, &overlay_marks, config.overlay_max_dim);

    let candidates: Vec<CraterCandidate> = accepted.into_iter().map(|(_, c)| c).collect();
    let stats = DetectionStatistics::from_candidates(&candidates, Some(tile.area_km2()));

    info!(
        contours = total_contours,
        craters = candidates.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "detection finished"
    );

    Ok(DetectionResult {
        candidates,
        stats,
        overlay,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TileGeometry;

    /// Flat terrain at 200 with circular pits at 100.
    fn pitted_tile(size: usize, km_per_sample: f64, pits: &[(f64, f64, f64)]) -> Tile {
        let mut samples = vec![200u16; size * size];
        for row in 0..size {
            for col in 0..size {
                for &(pr, pc, r) in pits {
                    let (dr, dc) = (row as f64 - pr, col as f64 - pc);
                    if dr * dr + dc * dc < r * r {
                        samples[row * size + col] = 100;
                    }
                }
            }
        }
        Tile::from_samples(
            size,
            size,
            255,
            &samples,
            TileGeometry::new(km_per_sample, 0.01),
        )
        .unwrap()
    }

    /// Paraboloid bowl 100 units deep in terrain at 1000, centered on the
    /// tile, with optional uniform noise of ±`noise` units.
    fn bowl_tile(size: usize, km_per_sample: f64, radius: f64, noise: u32) -> Tile {
        let center = (size / 2) as f64;
        let mut state = 0x2545_f491_u32;
        let samples: Vec<u16> = (0..size * size)
            .map(|i| {
                let d = ((i / size) as f64 - center).hypot((i % size) as f64 - center);
                let mut v = if d < radius {
                    1000.0 - 100.0 * (1.0 - (d / radius).powi(2))
                } else {
                    1000.0
                };
                if noise > 0 {
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    v += (state % (2 * noise + 1)) as f64 - noise as f64;
                }
                v.round() as u16
            })
            .collect();
        Tile::from_samples(
            size,
            size,
            4095,
            &samples,
            TileGeometry::new(km_per_sample, 0.01),
        )
        .unwrap()
    }

    #[test]
    fn test_bowl_crater_diameter_at_default_resolution() {
        // 2 km bowl at 100 m/sample
        let tile = bowl_tile(512, 0.1, 10.0, 0);
        let result = detect(&tile, &DetectionConfig::default()).unwrap();

        assert_eq!(result.candidates.len(), 1);
        let crater = &result.candidates[0];
        assert!(
            (crater.diameter_km - 2.0).abs() <= 0.2,
            "diameter {}",
            crater.diameter_km
        );
        assert!((crater.row - 256.0).abs() < 1.0);
        assert!((crater.column - 256.0).abs() < 1.0);
    }

    #[test]
    fn test_noisy_bowl_crater_diameter() {
        let tile = bowl_tile(512, 0.1, 10.0, 3);
        let result = detect(&tile, &DetectionConfig::default()).unwrap();

        assert_eq!(result.candidates.len(), 1);
        let crater = &result.candidates[0];
        assert!(
            (crater.diameter_km - 2.0).abs() <= 0.2,
            "diameter {}",
            crater.diameter_km
        );
    }

    #[test]
    fn test_bowl_crater_diameter_at_fine_resolution() {
        let tile = bowl_tile(512, 0.05, 20.0, 0);
        let result = detect(&tile, &DetectionConfig::default()).unwrap();

        assert_eq!(result.candidates.len(), 1);
        assert!((result.candidates[0].diameter_km - 2.0).abs() <= 0.2);
    }

    #[test]
    fn test_single_crater_detected() {
        // 2 km across at 50 m/sample is a 20 sample radius
        let tile = pitted_tile(512, 0.05, &[(256.0, 256.0, 20.0)]);
        let result = detect(&tile, &DetectionConfig::default()).unwrap();

        assert_eq!(result.candidates.len(), 1);
        let crater = &result.candidates[0];
        assert!(
            (crater.diameter_km - 2.0).abs() < 0.2,
            "diameter {}",
            crater.diameter_km
        );
        assert!((crater.row - 256.0).abs() < 2.0);
        assert!((crater.column - 256.0).abs() < 2.0);
        assert!(crater.circularity >= 0.5 && crater.circularity <= 1.0);
        assert!((crater.depth_km - 0.2 * crater.diameter_km).abs() < 1e-9);

        assert_eq!(result.stats.count, 1);
        assert_eq!(result.stats.max_diameter_km, crater.diameter_km);
        assert!(!result.is_empty());
    }

    #[test]
    fn test_min_diameter_filters_small_pits() {
        let tile = pitted_tile(512, 0.05, &[(256.0, 256.0, 20.0)]);
        let config = DetectionConfig::default().with_min_diameter_km(3.0);
        let result = detect(&tile, &config).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_flat_tile_is_empty_not_error() {
        let tile = Tile::from_samples(64, 64, 255, &[77; 64 * 64], TileGeometry::default()).unwrap();
        let result = detect(&tile, &DetectionConfig::default()).unwrap();

        assert!(result.is_empty());
        assert_eq!(result.stats.count, 0);
        assert_eq!(result.stats.mean_diameter_km, 0.0);
        assert_eq!(result.stats.max_depth_km, 0.0);
        assert_eq!(result.overlay.dimensions(), (64, 64));
    }

    #[test]
    fn test_candidates_respect_filters_on_noisy_tile() {
        let size = 256;
        let mut state = 0x2545_f491_u32;
        let mut samples = vec![0u16; size * size];
        for (i, s) in samples.iter_mut().enumerate() {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let (row, col) = ((i / size) as f64, (i % size) as f64);
            let pit = ((row - 90.0).powi(2) + (col - 100.0).powi(2)).sqrt() < 30.0
                || ((row - 190.0).powi(2) + (col - 170.0).powi(2)).sqrt() < 18.0;
            *s = if pit { 400 } else { 900 } + (state % 60) as u16;
        }
        let tile =
            Tile::from_samples(size, size, 1023, &samples, TileGeometry::new(0.1, 0.01)).unwrap();

        let config = DetectionConfig::default().with_sigma(2.0);
        let result = detect(&tile, &config).unwrap();

        for c in &result.candidates {
            assert!(c.diameter_km >= config.min_diameter_km);
            assert!((0.0..=1.0).contains(&c.circularity));
            assert!(c.circularity >= config.min_circularity);
            assert!(c.depth_km <= config.max_depth_km);
        }
        assert_eq!(result.stats.count, result.candidates.len());
    }

    #[test]
    fn test_overlay_is_downscaled() {
        let tile = pitted_tile(512, 0.05, &[(256.0, 256.0, 20.0)]);
        let config = DetectionConfig::default().with_overlay_max_dim(128);
        let result = detect(&tile, &config).unwrap();
        assert_eq!(result.overlay.dimensions(), (128, 128));
    }

    #[test]
    fn test_normalize_stretches_range() {
        let tile =
            Tile::from_samples(4, 1, 1000, &[100, 300, 500, 900], TileGeometry::default()).unwrap();
        assert_eq!(normalize_to_u8(&tile), vec![0, 64, 128, 255]);
    }

    #[test]
    fn test_depth_models() {
        let proportional = DepthModel::default();
        assert!((proportional.depth_km(5.0) - 1.0).abs() < 1e-12);

        let power = DepthModel::PowerLaw {
            coefficient: 0.2,
            exponent: 0.5,
        };
        assert!((power.depth_km(4.0) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_depth_is_clamped() {
        let tile = pitted_tile(512, 0.05, &[(256.0, 256.0, 20.0)]);
        let config = DetectionConfig::default()
            .with_depth_model(DepthModel::Proportional { ratio: 10.0 })
            .with_max_depth_km(3.0);
        let result = detect(&tile, &config).unwrap();
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].depth_km, 3.0);
    }

    #[test]
    fn test_invalid_config() {
        let bad = [
            DetectionConfig::default().with_sigma(0.0),
            DetectionConfig::default().with_thresholds(0.5, 0.2),
            DetectionConfig::default().with_thresholds(0.1, 1.5),
            DetectionConfig::default().with_min_circularity(1.2),
            DetectionConfig::default().with_max_depth_km(0.0),
            DetectionConfig::default().with_min_diameter_km(f64::NAN),
            DetectionConfig::default().with_overlay_max_dim(0),
        ];
        for config in bad {
            assert!(matches!(
                config.validate(),
                Err(RegolithError::InvalidConfig { .. })
            ));
        }
        assert!(DetectionConfig::default().validate().is_ok());
    }
}
