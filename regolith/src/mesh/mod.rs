//! Heightmap-to-mesh conversion.
//!
//! [`convert`] turns a tile into a [`TerrainMesh`] whose width stays within
//! `target_width` retained samples and whose triangle count stays within
//! `target_face_count`. Raw rows are decoded in strips of `chunk_rows`, so
//! the memory held for samples is one strip regardless of tile height.
//!
//! # Coordinates
//!
//! Mesh space is kilometers with the tile centered on the origin: `x` grows
//! with the column, `y` grows with the row and `z` is elevation. Triangles
//! wind clockwise seen from `+z`, which becomes counter-clockwise seen from
//! above once the mesh is written Y-up (see [`crate::export`]).

pub mod chunk;
pub mod decimate;

use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::error::{RegolithError, Result};
use crate::tile::Tile;

pub use chunk::{BoundaryRow, GridLayout, MeshChunk};
pub use decimate::DecimationStats;

#[inline]
pub(crate) fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub(crate) fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
pub(crate) fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub(crate) fn length_squared(a: [f64; 3]) -> f64 {
    dot(a, a)
}

/// Upward normal of a triangle in mesh space, scaled by twice its area.
#[inline]
pub(crate) fn triangle_normal(a: [f64; 3], b: [f64; 3], c: [f64; 3]) -> [f64; 3] {
    cross(sub(c, a), sub(b, a))
}

/// Parameters for [`convert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Raw rows decoded per strip.
    pub chunk_rows: usize,
    /// Upper bound on retained samples per row, at least 2.
    pub target_width: usize,
    /// Upper bound on triangles after decimation.
    pub target_face_count: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            chunk_rows: 1024,
            target_width: 1024,
            target_face_count: 500_000,
        }
    }
}

impl MeshConfig {
    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows;
        self
    }

    pub fn with_target_width(mut self, target_width: usize) -> Self {
        self.target_width = target_width;
        self
    }

    pub fn with_target_face_count(mut self, target_face_count: usize) -> Self {
        self.target_face_count = target_face_count;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_rows == 0 {
            return Err(RegolithError::invalid_config(
                "chunk_rows",
                "must be at least 1",
            ));
        }
        if self.target_width < 2 {
            return Err(RegolithError::invalid_config(
                "target_width",
                format!("must be at least 2, got {}", self.target_width),
            ));
        }
        if self.target_face_count == 0 {
            return Err(RegolithError::invalid_config(
                "target_face_count",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Indexed triangle mesh in kilometers.
///
/// Every face index is below `vertices.len()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerrainMesh {
    pub vertices: Vec<[f64; 3]>,
    pub faces: Vec<[u32; 3]>,
}

impl TerrainMesh {
    pub fn with_capacity(vertices: usize, faces: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(vertices),
            faces: Vec::with_capacity(faces),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// `true` when every face references existing, distinct vertices.
    pub fn indices_valid(&self) -> bool {
        let n = self.vertices.len() as u64;
        self.faces.iter().all(|&[a, b, c]| {
            (a as u64) < n && (b as u64) < n && (c as u64) < n && a != b && b != c && a != c
        })
    }

    /// Area-weighted unit vertex normals.
    ///
    /// Vertices with no non-degenerate incident face point straight up.
    pub fn vertex_normals(&self) -> Vec<[f64; 3]> {
        let mut normals = vec![[0.0; 3]; self.vertices.len()];
        for face in &self.faces {
            let [a, b, c] = face.map(|v| self.vertices[v as usize]);
            let n = triangle_normal(a, b, c);
            for &v in face {
                let acc = &mut normals[v as usize];
                acc[0] += n[0];
                acc[1] += n[1];
                acc[2] += n[2];
            }
        }
        for n in &mut normals {
            let len = length_squared(*n).sqrt();
            *n = if len > 0.0 {
                [n[0] / len, n[1] / len, n[2] / len]
            } else {
                [0.0, 0.0, 1.0]
            };
        }
        normals
    }

    /// Lowest and highest elevation, or `None` for an empty mesh.
    pub fn z_range(&self) -> Option<(f64, f64)> {
        let mut iter = self.vertices.iter().map(|v| v[2]);
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), z| (lo.min(z), hi.max(z))))
    }
}

/// What one conversion did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionReport {
    pub source_width: usize,
    pub source_height: usize,
    pub stride: usize,
    pub retained_width: usize,
    pub retained_height: usize,
    pub chunks: usize,
    pub faces_before: usize,
    pub faces_after: usize,
    pub vertices: usize,
    pub elapsed_ms: u64,
}

/// Mesh plus its conversion report.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    pub mesh: TerrainMesh,
    pub report: ConversionReport,
}

/// Assemble the full-resolution retained grid without decimating.
pub fn assemble(tile: &Tile, config: &MeshConfig) -> Result<(TerrainMesh, GridLayout, usize)> {
    config.validate()?;
    let layout = GridLayout::new(tile, config.target_width)?;
    let (mesh, chunks) = chunk::assemble(tile, &layout, config.chunk_rows);
    Ok((mesh, layout, chunks))
}

/// Convert `tile` into a decimated terrain mesh.
///
/// # Errors
///
/// - [`RegolithError::InvalidConfig`] if `config` fails validation
/// - [`RegolithError::Triangulation`] if the retained grid is thinner than
///   2×2 or decimation cannot meet the face budget
pub fn convert(tile: &Tile, config: &MeshConfig) -> Result<ConversionOutput> {
    let start = Instant::now();
    let (grid, layout, chunks) = assemble(tile, config)?;
    let faces_before = grid.face_count();
    info!(
        width = layout.columns,
        height = layout.rows,
        stride = layout.stride,
        faces = faces_before,
        "terrain grid assembled"
    );

    let (mesh, _) = decimate::decimate(grid, config.target_face_count);
    if mesh.faces.is_empty() || mesh.face_count() > config.target_face_count {
        return Err(RegolithError::Triangulation {
            reason: format!(
                "decimation left {} faces for a budget of {}",
                mesh.face_count(),
                config.target_face_count
            ),
        });
    }

    let report = ConversionReport {
        source_width: layout.source_width,
        source_height: layout.source_height,
        stride: layout.stride,
        retained_width: layout.columns,
        retained_height: layout.rows,
        chunks,
        faces_before,
        faces_after: mesh.face_count(),
        vertices: mesh.vertex_count(),
        elapsed_ms: start.elapsed().as_millis() as u64,
    };
    info!(
        faces = report.faces_after,
        vertices = report.vertices,
        elapsed_ms = report.elapsed_ms,
        "terrain mesh ready"
    );

    Ok(ConversionOutput { mesh, report })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TileGeometry;

    fn hills(width: usize, height: usize) -> Tile {
        let samples: Vec<u16> = (0..width * height)
            .map(|i| {
                let (r, c) = ((i / width) as f64, (i % width) as f64);
                (500.0 + 200.0 * (r / 17.0).sin() * (c / 23.0).cos()) as u16
            })
            .collect();
        Tile::from_samples(width, height, 1023, &samples, TileGeometry::new(0.1, 0.01)).unwrap()
    }

    #[test]
    fn test_convert_respects_width_and_budget() {
        let tile = hills(300, 200);
        let config = MeshConfig::default()
            .with_target_width(64)
            .with_target_face_count(2000)
            .with_chunk_rows(50);
        let out = convert(&tile, &config).unwrap();

        assert!(out.report.retained_width <= 64);
        assert_eq!(out.report.stride, 5);
        assert!(out.mesh.face_count() <= 2000);
        assert!(out.mesh.face_count() > 0);
        assert!(out.mesh.indices_valid());
        assert_eq!(out.report.chunks, 4);
        assert_eq!(out.report.faces_before, 2 * 59 * 39);
    }

    #[test]
    fn test_chunk_size_does_not_change_grid() {
        let tile = hills(256, 1024);
        let small = MeshConfig::default().with_chunk_rows(128);
        let large = MeshConfig::default().with_chunk_rows(512);

        let (a, _, chunks_a) = assemble(&tile, &small).unwrap();
        let (b, _, chunks_b) = assemble(&tile, &large).unwrap();

        assert_eq!(chunks_a, 8);
        assert_eq!(chunks_b, 2);
        assert_eq!(a.vertex_count(), b.vertex_count());
        assert_eq!(a.face_count(), b.face_count());
        assert_eq!(a, b);
    }

    #[test]
    fn test_flat_tile_has_constant_elevation() {
        let tile = Tile::from_samples(64, 48, 255, &[120; 64 * 48], TileGeometry::new(0.1, 0.01))
            .unwrap();
        let config = MeshConfig::default().with_target_face_count(100);
        let out = convert(&tile, &config).unwrap();

        let (lo, hi) = out.mesh.z_range().unwrap();
        assert!((lo - 1.2).abs() < 1e-9);
        assert!((hi - 1.2).abs() < 1e-9);
        assert!(out.mesh.face_count() <= 100);
    }

    #[test]
    fn test_tiny_tile_is_triangulation_error() {
        let tile = Tile::from_samples(5, 1, 255, &[1; 5], TileGeometry::default()).unwrap();
        assert!(matches!(
            convert(&tile, &MeshConfig::default()),
            Err(RegolithError::Triangulation { .. })
        ));
    }

    #[test]
    fn test_budget_below_one_chunk() {
        let tile = hills(40, 40);
        let config = MeshConfig::default()
            .with_chunk_rows(8)
            .with_target_face_count(10);
        let out = convert(&tile, &config).unwrap();
        assert!(out.mesh.face_count() <= 10);
        assert!(out.mesh.face_count() > 0);
    }

    #[test]
    fn test_vertex_normals_point_up_on_flat_grid() {
        let tile = Tile::from_samples(4, 4, 255, &[7; 16], TileGeometry::default()).unwrap();
        let (mesh, _, _) = assemble(&tile, &MeshConfig::default()).unwrap();
        for n in mesh.vertex_normals() {
            assert!((n[2] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_invalid_config() {
        for config in [
            MeshConfig::default().with_chunk_rows(0),
            MeshConfig::default().with_target_width(1),
            MeshConfig::default().with_target_face_count(0),
        ] {
            assert!(matches!(
                config.validate(),
                Err(RegolithError::InvalidConfig { .. })
            ));
        }
    }
}
