//! Row-chunked grid assembly.
//!
//! The tile is walked top to bottom in strips of `chunk_rows` raw rows.
//! Only rows and columns that are multiples of the stride become vertices.
//! The last retained row of one strip is handed to the next strip as a
//! [`BoundaryRow`] so the two strips share those vertices.

use tracing::debug;

use crate::error::{RegolithError, Result};
use crate::tile::Tile;

use super::TerrainMesh;

/// Sample step that keeps at most `target_width` retained columns.
pub fn stride_for(width: usize, target_width: usize) -> usize {
    width.div_ceil(target_width.max(1)).max(1)
}

/// Number of indices `0, stride, 2·stride, …` below `len`.
pub fn retained_count(len: usize, stride: usize) -> usize {
    if len == 0 {
        0
    } else {
        (len - 1) / stride + 1
    }
}

/// Placement of retained samples in mesh space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLayout {
    pub source_width: usize,
    pub source_height: usize,
    pub stride: usize,
    /// Retained columns per row.
    pub columns: usize,
    /// Retained rows.
    pub rows: usize,
    pub km_per_sample: f64,
    pub elevation_km_per_unit: f64,
}

impl GridLayout {
    /// Plan the retained grid for `tile`.
    ///
    /// # Errors
    ///
    /// Returns [`RegolithError::Triangulation`] if fewer than two rows or
    /// columns survive, or the vertex count would not fit 32-bit indices.
    pub fn new(tile: &Tile, target_width: usize) -> Result<Self> {
        let (width, height) = (tile.width(), tile.height());
        let stride = stride_for(width, target_width);
        let columns = retained_count(width, stride);
        let rows = retained_count(height, stride);

        if columns < 2 || rows < 2 {
            return Err(RegolithError::Triangulation {
                reason: format!(
                    "{}x{} tile keeps {}x{} samples at stride {}, need at least 2x2",
                    width, height, columns, rows, stride
                ),
            });
        }
        if columns
            .checked_mul(rows)
            .map_or(true, |n| n > u32::MAX as usize)
        {
            return Err(RegolithError::Triangulation {
                reason: format!("{}x{} vertices exceed 32-bit indexing", columns, rows),
            });
        }

        let geometry = tile.geometry();
        Ok(Self {
            source_width: width,
            source_height: height,
            stride,
            columns,
            rows,
            km_per_sample: geometry.km_per_sample,
            elevation_km_per_unit: geometry.elevation_km_per_unit,
        })
    }

    /// Vertex position of the raw sample at (`row`, `col`).
    #[inline]
    pub fn position(&self, row: usize, col: usize, sample: u16) -> [f64; 3] {
        let cx = (self.source_width - 1) as f64 / 2.0;
        let cy = (self.source_height - 1) as f64 / 2.0;
        [
            (col as f64 - cx) * self.km_per_sample,
            (row as f64 - cy) * self.km_per_sample,
            sample as f64 * self.elevation_km_per_unit,
        ]
    }

    /// Triangles produced by the full retained grid.
    pub fn face_count(&self) -> usize {
        2 * (self.columns - 1) * (self.rows - 1)
    }
}

/// Vertex base of the last retained row emitted so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryRow {
    /// Raw row index in the tile.
    pub row: usize,
    /// Index of the row's first vertex in the mesh.
    pub vertex_base: u32,
}

/// One horizontal strip of decoded raw rows.
#[derive(Debug, Clone, Copy)]
pub struct MeshChunk<'a> {
    /// Raw index of the first row in `samples`.
    pub first_row: usize,
    pub row_count: usize,
    /// Row-major samples, `row_count × source_width`.
    pub samples: &'a [u16],
}

/// Append the retained rows of `chunk` to `mesh`.
///
/// Quads are stitched to `boundary` when given. Returns the boundary to
/// pass to the next chunk, unchanged if this chunk held no retained row.
pub fn append_chunk(
    mesh: &mut TerrainMesh,
    layout: &GridLayout,
    chunk: &MeshChunk<'_>,
    mut boundary: Option<BoundaryRow>,
) -> Option<BoundaryRow> {
    let width = layout.source_width;
    let first_retained = chunk.first_row.div_ceil(layout.stride) * layout.stride;

    for row in (first_retained..chunk.first_row + chunk.row_count).step_by(layout.stride) {
        let local = &chunk.samples[(row - chunk.first_row) * width..][..width];
        let base = mesh.vertices.len() as u32;
        for col in (0..width).step_by(layout.stride) {
            mesh.vertices.push(layout.position(row, col, local[col]));
        }

        if let Some(prev) = boundary {
            let top = prev.vertex_base;
            for j in 0..layout.columns as u32 - 1 {
                let v0 = top + j;
                let v1 = v0 + 1;
                let v2 = base + j;
                let v3 = v2 + 1;
                mesh.faces.push([v0, v2, v1]);
                mesh.faces.push([v1, v2, v3]);
            }
        }

        boundary = Some(BoundaryRow {
            row,
            vertex_base: base,
        });
    }

    boundary
}

/// Walk `tile` in strips of `chunk_rows`, reusing one decode buffer.
///
/// Returns the assembled grid mesh and the number of strips read.
pub fn assemble(tile: &Tile, layout: &GridLayout, chunk_rows: usize) -> (TerrainMesh, usize) {
    let chunk_rows = chunk_rows.max(1);
    let mut mesh = TerrainMesh::with_capacity(layout.columns * layout.rows, layout.face_count());
    let mut buffer = Vec::new();
    let mut boundary = None;
    let mut chunks = 0;
    let mut start = 0;

    while start < layout.source_height {
        let row_count = tile.read_rows(start, chunk_rows, &mut buffer);
        let chunk = MeshChunk {
            first_row: start,
            row_count,
            samples: &buffer,
        };
        boundary = append_chunk(&mut mesh, layout, &chunk, boundary);
        debug!(
            first_row = start,
            rows = row_count,
            vertices = mesh.vertices.len(),
            "chunk assembled"
        );
        chunks += 1;
        start += row_count;
    }

    (mesh, chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TileGeometry;

    fn ramp_tile(width: usize, height: usize) -> Tile {
        let samples: Vec<u16> = (0..width * height).map(|i| (i % 251) as u16).collect();
        Tile::from_samples(width, height, 255, &samples, TileGeometry::new(0.1, 0.01)).unwrap()
    }

    #[test]
    fn test_stride_bounds_width() {
        for width in [2, 3, 100, 1023, 1024, 1025, 2048, 4097, 10_000] {
            for target in [2, 3, 7, 512, 1024] {
                let stride = stride_for(width, target);
                let kept = retained_count(width, stride);
                assert!(kept <= target, "width {} target {} kept {}", width, target, kept);
                assert!(kept >= 1);
            }
        }
        assert_eq!(stride_for(1024, 1024), 1);
        assert_eq!(stride_for(1025, 1024), 2);
        assert_eq!(retained_count(1025, 2), 513);
    }

    #[test]
    fn test_layout_rejects_thin_tiles() {
        let tile = ramp_tile(10, 1);
        assert!(matches!(
            GridLayout::new(&tile, 1024),
            Err(RegolithError::Triangulation { .. })
        ));

        // Stride 5 on a 3-row tile keeps one row
        let tile = ramp_tile(10, 3);
        assert!(matches!(
            GridLayout::new(&tile, 2),
            Err(RegolithError::Triangulation { .. })
        ));
    }

    #[test]
    fn test_positions_are_centered() {
        let tile = ramp_tile(5, 3);
        let layout = GridLayout::new(&tile, 1024).unwrap();
        assert_eq!(layout.position(0, 0, 0), [-0.2, -0.1, 0.0]);
        let p = layout.position(2, 4, 100);
        assert!((p[0] - 0.2).abs() < 1e-12);
        assert!((p[1] - 0.1).abs() < 1e-12);
        assert!((p[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_chunk_grid() {
        let tile = ramp_tile(4, 3);
        let layout = GridLayout::new(&tile, 1024).unwrap();
        let (mesh, chunks) = assemble(&tile, &layout, 1024);

        assert_eq!(chunks, 1);
        assert_eq!(mesh.vertices.len(), 12);
        assert_eq!(mesh.faces.len(), 12);
        assert_eq!(mesh.faces[0], [0, 4, 1]);
        assert_eq!(mesh.faces[1], [1, 4, 5]);
    }

    #[test]
    fn test_chunking_matches_single_pass() {
        let tile = ramp_tile(37, 101);
        let layout = GridLayout::new(&tile, 16).unwrap();
        let (whole, _) = assemble(&tile, &layout, 1000);

        for chunk_rows in [1, 2, 3, 7, 10, 64] {
            let (chunked, _) = assemble(&tile, &layout, chunk_rows);
            assert_eq!(chunked.vertices, whole.vertices, "chunk_rows {}", chunk_rows);
            assert_eq!(chunked.faces, whole.faces, "chunk_rows {}", chunk_rows);
        }
    }

    #[test]
    fn test_boundary_vertices_are_shared() {
        let tile = ramp_tile(9, 40);
        let layout = GridLayout::new(&tile, 1024).unwrap();
        let (mesh, chunks) = assemble(&tile, &layout, 8);

        assert_eq!(chunks, 5);
        assert_eq!(mesh.vertices.len(), 9 * 40);
        let mut seen: Vec<(i64, i64)> = mesh
            .vertices
            .iter()
            .map(|v| ((v[0] * 1e6).round() as i64, (v[1] * 1e6).round() as i64))
            .collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), mesh.vertices.len());
        assert_eq!(mesh.faces.len(), layout.face_count());
    }

    #[test]
    fn test_append_chunk_without_retained_rows() {
        let tile = ramp_tile(8, 8);
        let layout = GridLayout::new(&tile, 2).unwrap();
        assert_eq!(layout.stride, 4);

        let mut mesh = TerrainMesh::default();
        let samples = vec![0u16; 8 * 3];
        let chunk = MeshChunk {
            first_row: 1,
            row_count: 3,
            samples: &samples,
        };
        let prev = Some(BoundaryRow {
            row: 0,
            vertex_base: 0,
        });
        assert_eq!(append_chunk(&mut mesh, &layout, &chunk, prev), prev);
        assert!(mesh.vertices.is_empty());
    }
}
