//! Raster tile parsing and sample access.
//!
//! This module provides the [`Tile`] struct for reading binary PGM (`P5`)
//! heightmaps. Files are memory-mapped, so callers that walk the raster in
//! row chunks (see [`Tile::read_rows`]) only touch the pages they need.
//!
//! # Raster Format
//!
//! ```text
//! P5
//! # km_per_sample 0.1
//! # elevation_km_per_unit 0.01
//! <width> <height>
//! <maxval>
//! <binary samples>
//! ```
//!
//! - `maxval` below 256: one byte per sample
//! - `maxval` 256..=65535: two bytes per sample, big-endian
//!
//! The two comment keys are optional and override the configured
//! [`TileGeometry`] for that file.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{RegolithError, Result};

/// Default horizontal resolution: 100 m per sample.
pub const DEFAULT_KM_PER_SAMPLE: f64 = 0.1;

/// Default vertical scale: 10 m per sample unit.
pub const DEFAULT_ELEVATION_KM_PER_UNIT: f64 = 0.01;

/// Largest sample value a 16-bit raster can declare.
pub const MAX_SAMPLE_VALUE: u32 = 65_535;

const KEY_KM_PER_SAMPLE: &str = "km_per_sample";
const KEY_ELEVATION_KM_PER_UNIT: &str = "elevation_km_per_unit";

/// Physical conversion factors of a tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGeometry {
    /// Ground distance between adjacent samples, in kilometers.
    pub km_per_sample: f64,
    /// Elevation represented by one sample unit, in kilometers.
    pub elevation_km_per_unit: f64,
}

impl Default for TileGeometry {
    fn default() -> Self {
        Self {
            km_per_sample: DEFAULT_KM_PER_SAMPLE,
            elevation_km_per_unit: DEFAULT_ELEVATION_KM_PER_UNIT,
        }
    }
}

impl TileGeometry {
    /// Create a geometry from explicit factors.
    pub fn new(km_per_sample: f64, elevation_km_per_unit: f64) -> Self {
        Self {
            km_per_sample,
            elevation_km_per_unit,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.km_per_sample.is_finite() && self.km_per_sample > 0.0) {
            return Err(RegolithError::malformed(format!(
                "km_per_sample must be positive, got {}",
                self.km_per_sample
            )));
        }
        if !(self.elevation_km_per_unit.is_finite() && self.elevation_km_per_unit >= 0.0) {
            return Err(RegolithError::malformed(format!(
                "elevation_km_per_unit must be non-negative, got {}",
                self.elevation_km_per_unit
            )));
        }
        Ok(())
    }
}

/// Storage width of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    /// One byte per sample (maxval < 256)
    Eight,
    /// Two big-endian bytes per sample (maxval 256..=65535)
    Sixteen,
}

impl BitDepth {
    /// Bit depth implied by a declared maximum value.
    pub fn from_max_value(max_value: u32) -> Result<Self> {
        match max_value {
            0 => Err(RegolithError::malformed("maxval must be at least 1")),
            1..=255 => Ok(BitDepth::Eight),
            256..=MAX_SAMPLE_VALUE => Ok(BitDepth::Sixteen),
            _ => Err(RegolithError::malformed(format!(
                "maxval {} exceeds 16-bit depth",
                max_value
            ))),
        }
    }

    /// Returns the number of bytes per sample.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            BitDepth::Eight => 1,
            BitDepth::Sixteen => 2,
        }
    }
}

/// Parsed PGM header.
#[derive(Debug, Clone, PartialEq)]
pub struct PgmHeader {
    /// Samples per row
    pub width: usize,
    /// Number of rows
    pub height: usize,
    /// Declared maximum sample value
    pub max_value: u16,
    /// Byte offset of the first sample
    pub data_offset: usize,
    /// Horizontal resolution from the header comments, if present
    pub km_per_sample: Option<f64>,
    /// Vertical scale from the header comments, if present
    pub elevation_km_per_unit: Option<f64>,
}

impl PgmHeader {
    /// Parse the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = HeaderCursor {
            bytes,
            pos: 0,
            km_per_sample: None,
            elevation_km_per_unit: None,
        };

        let magic = cursor.next_token().unwrap_or("");
        if magic != "P5" {
            return Err(RegolithError::malformed(format!(
                "expected binary PGM magic 'P5', found '{}'",
                magic
            )));
        }

        let width = cursor.next_number("width")?;
        let height = cursor.next_number("height")?;
        let max_value = cursor.next_number("maxval")?;

        // Exactly one whitespace byte separates maxval from the samples
        match bytes.get(cursor.pos) {
            Some(b) if b.is_ascii_whitespace() => {}
            _ => return Err(RegolithError::malformed("missing separator after maxval")),
        }

        if width == 0 || height == 0 {
            return Err(RegolithError::malformed(format!(
                "zero-sized raster: {}x{}",
                width, height
            )));
        }
        let max_value = u16::try_from(max_value).map_err(|_| {
            RegolithError::malformed(format!("maxval {} exceeds 16-bit depth", max_value))
        })?;
        BitDepth::from_max_value(u32::from(max_value))?;

        Ok(Self {
            width,
            height,
            max_value,
            data_offset: cursor.pos + 1,
            km_per_sample: cursor.km_per_sample,
            elevation_km_per_unit: cursor.elevation_km_per_unit,
        })
    }

    /// Sample bytes the header declares, `None` if the size overflows.
    pub fn sample_bytes(&self) -> Option<usize> {
        let per_sample = if self.max_value > 255 { 2 } else { 1 };
        self.width.checked_mul(self.height)?.checked_mul(per_sample)
    }
}

struct HeaderCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    km_per_sample: Option<f64>,
    elevation_km_per_unit: Option<f64>,
}

impl<'a> HeaderCursor<'a> {
    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            if self.pos < self.bytes.len() && self.bytes[self.pos] == b'#' {
                let start = self.pos + 1;
                while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
                self.read_comment(start, self.pos);
            } else {
                return;
            }
        }
    }

    fn read_comment(&mut self, start: usize, end: usize) {
        let Ok(text) = std::str::from_utf8(&self.bytes[start..end]) else {
            return;
        };
        let mut parts = text.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            return;
        };
        let Ok(value) = value.parse::<f64>() else {
            return;
        };
        match key {
            KEY_KM_PER_SAMPLE => self.km_per_sample = Some(value),
            KEY_ELEVATION_KM_PER_UNIT => self.elevation_km_per_unit = Some(value),
            _ => {}
        }
    }

    fn next_token(&mut self) -> Option<&'a str> {
        self.skip_whitespace_and_comments();
        let start = self.pos;
        while self.pos < self.bytes.len()
            && !self.bytes[self.pos].is_ascii_whitespace()
            && self.bytes[self.pos] != b'#'
        {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        std::str::from_utf8(&self.bytes[start..self.pos]).ok()
    }

    fn next_number(&mut self, what: &str) -> Result<usize> {
        let token = self
            .next_token()
            .ok_or_else(|| RegolithError::malformed(format!("header ends before {}", what)))?;
        token
            .parse()
            .map_err(|_| RegolithError::malformed(format!("invalid {} '{}'", what, token)))
    }
}

enum TileData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl TileData {
    fn bytes(&self) -> &[u8] {
        match self {
            TileData::Mapped(mmap) => mmap,
            TileData::Owned(data) => data,
        }
    }
}

/// A read-only heightmap raster.
///
/// Tiles are immutable after loading and are shared between consumers as
/// `Arc<Tile>` without locking.
///
/// # Example
///
/// ```ignore
/// use regolith::Tile;
///
/// let tile = Tile::from_file("lat-30_lon000.pgm")?;
/// println!("{}x{} samples, {:.1} km wide", tile.width(), tile.height(), tile.width_km());
/// ```
pub struct Tile {
    /// Memory-mapped file or owned buffer holding header and samples
    data: TileData,
    header: PgmHeader,
    bit_depth: BitDepth,
    geometry: TileGeometry,
    /// Grid cell the tile was loaded for, if known
    cell: Option<(i32, i32)>,
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("width", &self.header.width)
            .field("height", &self.header.height)
            .field("max_value", &self.header.max_value)
            .field("geometry", &self.geometry)
            .field("cell", &self.cell)
            .finish()
    }
}

impl Tile {
    /// Load a tile from a `.pgm` file with the default geometry.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened or memory-mapped
    /// - The header is not a valid binary PGM header
    /// - The declared dimensions don't match the payload size
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file_with_geometry(path, TileGeometry::default())
    }

    /// Load a tile with explicit conversion factors.
    ///
    /// Header comments still take precedence over `geometry`.
    pub fn from_file_with_geometry<P: AsRef<Path>>(path: P, geometry: TileGeometry) -> Result<Self> {
        let file = File::open(&path)?;

        // SAFETY: Memory mapping is safe as long as the file is not modified
        // while mapped. We open the file read-only and don't expose the mapping.
        let mmap = unsafe { Mmap::map(&file)? };

        Self::from_data(TileData::Mapped(mmap), geometry)
    }

    /// Parse a complete PGM file held in memory.
    pub fn from_bytes(bytes: Vec<u8>, geometry: TileGeometry) -> Result<Self> {
        Self::from_data(TileData::Owned(bytes), geometry)
    }

    /// Build a tile from row-major samples.
    ///
    /// # Errors
    ///
    /// Returns [`RegolithError::MalformedTile`] if the sample count doesn't
    /// match `width × height` or a sample exceeds `max_value`.
    pub fn from_samples(
        width: usize,
        height: usize,
        max_value: u16,
        samples: &[u16],
        geometry: TileGeometry,
    ) -> Result<Self> {
        let bytes = encode_pgm(width, height, max_value, samples, None)?;
        Self::from_bytes(bytes, geometry)
    }

    fn from_data(data: TileData, geometry: TileGeometry) -> Result<Self> {
        let bytes = data.bytes();
        let header = PgmHeader::parse(bytes)?;
        let bit_depth = BitDepth::from_max_value(header.max_value as u32)?;

        let expected = header
            .sample_bytes()
            .ok_or_else(|| RegolithError::malformed("declared dimensions overflow"))?;
        let found = bytes.len() - header.data_offset.min(bytes.len());
        if found != expected {
            return Err(RegolithError::malformed(format!(
                "declared {}x{} at {} byte(s)/sample needs {} bytes, found {}",
                header.width,
                header.height,
                bit_depth.bytes_per_sample(),
                expected,
                found
            )));
        }

        let geometry = TileGeometry {
            km_per_sample: header.km_per_sample.unwrap_or(geometry.km_per_sample),
            elevation_km_per_unit: header
                .elevation_km_per_unit
                .unwrap_or(geometry.elevation_km_per_unit),
        };
        geometry.validate()?;

        Ok(Self {
            data,
            header,
            bit_depth,
            geometry,
            cell: None,
        })
    }

    /// Attach the grid cell this tile covers.
    pub fn with_cell(mut self, lat: i32, lon: i32) -> Self {
        self.cell = Some((lat, lon));
        self
    }

    /// Samples per row.
    pub fn width(&self) -> usize {
        self.header.width
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        self.header.height
    }

    /// Declared maximum sample value.
    pub fn max_value(&self) -> u16 {
        self.header.max_value
    }

    /// Storage width of one sample.
    pub fn bit_depth(&self) -> BitDepth {
        self.bit_depth
    }

    /// Physical conversion factors.
    pub fn geometry(&self) -> TileGeometry {
        self.geometry
    }

    /// Grid cell the tile was loaded for, if known.
    pub fn cell(&self) -> Option<(i32, i32)> {
        self.cell
    }

    /// Physical width in kilometers.
    pub fn width_km(&self) -> f64 {
        self.header.width as f64 * self.geometry.km_per_sample
    }

    /// Physical height in kilometers.
    pub fn height_km(&self) -> f64 {
        self.header.height as f64 * self.geometry.km_per_sample
    }

    /// Covered surface area in square kilometers.
    pub fn area_km2(&self) -> f64 {
        self.width_km() * self.height_km()
    }

    /// Convert a raw sample value to kilometers of elevation.
    pub fn elevation_km(&self, value: u16) -> f64 {
        value as f64 * self.geometry.elevation_km_per_unit
    }

    /// Get the sample at a row/column index.
    ///
    /// # Panics
    ///
    /// Panics if the index is outside the raster.
    pub fn sample(&self, row: usize, col: usize) -> u16 {
        assert!(row < self.header.height && col < self.header.width);
        let idx = row * self.header.width + col;
        self.decode(idx)
    }

    #[inline]
    fn decode(&self, idx: usize) -> u16 {
        let bytes = self.data.bytes();
        let offset = self.header.data_offset;
        match self.bit_depth {
            BitDepth::Eight => bytes[offset + idx] as u16,
            BitDepth::Sixteen => {
                let at = offset + idx * 2;
                u16::from_be_bytes([bytes[at], bytes[at + 1]])
            }
        }
    }

    /// Decode up to `count` rows starting at `start` into `out`.
    ///
    /// `out` is cleared first and its allocation reused, so a caller walking
    /// the tile in chunks holds one chunk of decoded samples at a time.
    /// Returns the number of rows decoded (fewer at the bottom edge).
    pub fn read_rows(&self, start: usize, count: usize, out: &mut Vec<u16>) -> usize {
        out.clear();
        let end = (start + count).min(self.header.height);
        if start >= end {
            return 0;
        }
        let first = start * self.header.width;
        let last = end * self.header.width;
        out.reserve(last - first);
        let bytes = &self.data.bytes()[self.header.data_offset..];
        match self.bit_depth {
            BitDepth::Eight => out.extend(bytes[first..last].iter().map(|&b| b as u16)),
            BitDepth::Sixteen => out.extend(
                bytes[first * 2..last * 2]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]])),
            ),
        }
        end - start
    }

    /// Minimum and maximum sample values, scanned row by row.
    pub fn sample_range(&self) -> (u16, u16) {
        let mut buffer = Vec::with_capacity(self.header.width);
        let (mut min, mut max) = (u16::MAX, u16::MIN);
        for row in 0..self.header.height {
            self.read_rows(row, 1, &mut buffer);
            for &v in &buffer {
                min = min.min(v);
                max = max.max(v);
            }
        }
        (min, max)
    }
}

/// Encode samples as a binary PGM file.
///
/// When `geometry` is given, its factors are written as header comments so
/// the file is self-describing.
pub fn encode_pgm(
    width: usize,
    height: usize,
    max_value: u16,
    samples: &[u16],
    geometry: Option<&TileGeometry>,
) -> Result<Vec<u8>> {
    let bit_depth = BitDepth::from_max_value(max_value as u32)?;
    if samples.len() != width * height {
        return Err(RegolithError::malformed(format!(
            "{} samples given for a {}x{} raster",
            samples.len(),
            width,
            height
        )));
    }
    if let Some(v) = samples.iter().find(|&&v| v > max_value) {
        return Err(RegolithError::malformed(format!(
            "sample {} exceeds maxval {}",
            v, max_value
        )));
    }

    let mut out = b"P5\n".to_vec();
    if let Some(g) = geometry {
        out.extend(format!("# {} {}\n", KEY_KM_PER_SAMPLE, g.km_per_sample).bytes());
        out.extend(
            format!("# {} {}\n", KEY_ELEVATION_KM_PER_UNIT, g.elevation_km_per_unit).bytes(),
        );
    }
    out.extend(format!("{} {}\n{}\n", width, height, max_value).bytes());
    out.reserve(samples.len() * bit_depth.bytes_per_sample());
    match bit_depth {
        BitDepth::Eight => out.extend(samples.iter().map(|&v| v as u8)),
        BitDepth::Sixteen => {
            for &v in samples {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Create a 16-bit test file with known values at the corners and center
    fn create_test_pgm_file() -> NamedTempFile {
        let (w, h) = (64, 48);
        let mut samples = vec![0u16; w * h];
        samples[0] = 1000;
        samples[24 * w + 32] = 500;
        samples[w * h - 1] = 65_000;

        let geometry = TileGeometry::new(0.25, 0.002);
        let data = encode_pgm(w, h, 65_535, &samples, Some(&geometry)).unwrap();

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file
    }

    #[test]
    fn test_load_pgm_file() {
        let file = create_test_pgm_file();
        let tile = Tile::from_file(file.path()).unwrap();

        assert_eq!(tile.width(), 64);
        assert_eq!(tile.height(), 48);
        assert_eq!(tile.bit_depth(), BitDepth::Sixteen);
        assert_eq!(tile.sample(0, 0), 1000);
        assert_eq!(tile.sample(24, 32), 500);
        assert_eq!(tile.sample(47, 63), 65_000);
    }

    #[test]
    fn test_header_comments_override_geometry() {
        let file = create_test_pgm_file();
        let tile = Tile::from_file_with_geometry(file.path(), TileGeometry::new(1.0, 1.0)).unwrap();

        assert_eq!(tile.geometry(), TileGeometry::new(0.25, 0.002));
        assert!((tile.width_km() - 16.0).abs() < 1e-9);
        assert!((tile.height_km() - 12.0).abs() < 1e-9);
        assert!((tile.elevation_km(500) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_eight_bit_tile() {
        let samples: Vec<u16> = (0..12).collect();
        let tile = Tile::from_samples(4, 3, 255, &samples, TileGeometry::default()).unwrap();

        assert_eq!(tile.bit_depth(), BitDepth::Eight);
        assert_eq!(tile.sample(2, 3), 11);
        assert_eq!(tile.sample_range(), (0, 11));
    }

    #[test]
    fn test_read_rows_reuses_buffer() {
        let samples: Vec<u16> = (0..20).map(|v| v * 1000).collect();
        let tile = Tile::from_samples(5, 4, 65_535, &samples, TileGeometry::default()).unwrap();

        let mut buffer = Vec::new();
        assert_eq!(tile.read_rows(1, 2, &mut buffer), 2);
        assert_eq!(buffer, (5..15).map(|v| v * 1000).collect::<Vec<u16>>());

        // Reading past the bottom edge returns the rows that exist
        assert_eq!(tile.read_rows(3, 10, &mut buffer), 1);
        assert_eq!(buffer.len(), 5);
        assert_eq!(tile.read_rows(4, 1, &mut buffer), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_payload_size_mismatch() {
        let mut data = encode_pgm(4, 4, 255, &[0; 16], None).unwrap();
        data.pop();

        let result = Tile::from_bytes(data, TileGeometry::default());
        match result {
            Err(RegolithError::MalformedTile { reason }) => {
                assert!(reason.contains("needs 16 bytes, found 15"), "{}", reason)
            }
            other => panic!("Expected MalformedTile error, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_sized_tile() {
        let data = b"P5\n0 10\n255\n".to_vec();
        assert!(matches!(
            Tile::from_bytes(data, TileGeometry::default()),
            Err(RegolithError::MalformedTile { .. })
        ));
    }

    #[test]
    fn test_wrong_bit_depth() {
        let data = b"P5\n1 1\n70000\n\0\0\0".to_vec();
        assert!(matches!(
            Tile::from_bytes(data, TileGeometry::default()),
            Err(RegolithError::MalformedTile { .. })
        ));

        let data = b"P5\n1 1\n0\n\0".to_vec();
        assert!(matches!(
            Tile::from_bytes(data, TileGeometry::default()),
            Err(RegolithError::MalformedTile { .. })
        ));
    }

    #[test]
    fn test_oversized_maxval_is_rejected() {
        // 2^32 + 1 would wrap to 1 if narrowed
        let data = b"P5\n1 1\n4294967297\n\0".to_vec();
        let err = Tile::from_bytes(data, TileGeometry::default()).unwrap_err();
        assert!(matches!(err, RegolithError::MalformedTile { .. }));
        assert!(err.to_string().contains("4294967297"));

        assert!(PgmHeader::parse(b"P5\n1 1\n65536\n\0\0").is_err());
        assert_eq!(
            PgmHeader::parse(b"P5\n1 1\n65535\n\0\0").unwrap().max_value,
            65535
        );
    }

    #[test]
    fn test_wrong_magic() {
        let data = b"P2\n1 1\n255\n0".to_vec();
        let err = Tile::from_bytes(data, TileGeometry::default()).unwrap_err();
        assert!(err.to_string().contains("P5"));
    }

    #[test]
    fn test_header_with_interleaved_comments() {
        let mut data = b"P5 # binary\n# made by hand\n3 # width\n2\n255\n".to_vec();
        data.extend_from_slice(&[1, 2, 3, 4, 5, 6]);

        let tile = Tile::from_bytes(data, TileGeometry::default()).unwrap();
        assert_eq!((tile.width(), tile.height()), (3, 2));
        assert_eq!(tile.sample(1, 2), 6);
        assert_eq!(tile.geometry(), TileGeometry::default());
    }

    #[test]
    fn test_encode_rejects_out_of_range_sample() {
        assert!(encode_pgm(2, 1, 100, &[5, 101], None).is_err());
        assert!(encode_pgm(2, 2, 100, &[5, 10], None).is_err());
    }

    #[test]
    fn test_with_cell() {
        let tile = Tile::from_samples(1, 1, 255, &[7], TileGeometry::default())
            .unwrap()
            .with_cell(-30, 60);
        assert_eq!(tile.cell(), Some((-30, 60)));
    }
}
