//! Tile filename utilities.
//!
//! This module provides functions for converting between grid cells and
//! tile filenames.
//!
//! # Filename Format
//!
//! Tiles follow the naming convention: `lat{lat}_lon{lon}.pgm`
//!
//! - Latitude: signed integer without padding (e.g., `lat-30`, `lat0`, `lat30`)
//! - Longitude: 3 digits, east-positive in 0°..360° (e.g., `lon000`, `lon300`)
//!
//! The cell name identifies the corner of the tile as published by the
//! source archive; no assumption is made about the cell size.

/// Extension used for raster tiles.
pub const TILE_EXTENSION: &str = "pgm";

/// Convert a grid cell to a tile filename.
///
/// Longitudes are wrapped into 0°..360°.
///
/// # Examples
///
/// ```
/// use regolith::filename::cell_to_filename;
///
/// assert_eq!(cell_to_filename(-30, 0), "lat-30_lon000.pgm");
/// assert_eq!(cell_to_filename(30, 300), "lat30_lon300.pgm");
/// assert_eq!(cell_to_filename(0, -60), "lat0_lon300.pgm");
/// ```
pub fn cell_to_filename(lat: i32, lon: i32) -> String {
    format!("{}.{}", cell_stem(lat, lon), TILE_EXTENSION)
}

/// The filename without extension, also used as the base name of outputs.
pub fn cell_stem(lat: i32, lon: i32) -> String {
    format!("lat{}_lon{:03}", lat, lon.rem_euclid(360))
}

/// Parse a tile filename to extract its grid cell.
///
/// Accepts names with or without a directory prefix and with or without
/// the `.pgm` extension.
///
/// # Examples
///
/// ```
/// use regolith::filename::filename_to_cell;
///
/// assert_eq!(filename_to_cell("lat-30_lon000.pgm"), Some((-30, 0)));
/// assert_eq!(filename_to_cell("/data/themis/lat30_lon300.pgm"), Some((30, 300)));
/// assert_eq!(filename_to_cell("invalid"), None);
/// ```
pub fn filename_to_cell(filename: &str) -> Option<(i32, i32)> {
    // Extract just the filename if a path is given
    let lower = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .to_ascii_lowercase();

    let name = lower.strip_suffix(".zip").unwrap_or(&lower);
    let name = name.strip_suffix(".pgm").unwrap_or(name);

    let rest = name.strip_prefix("lat")?;
    let (lat_str, lon_part) = rest.split_once('_')?;
    let lon_str = lon_part.strip_prefix("lon")?;

    if lon_str.len() != 3 || !lon_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let lat: i32 = lat_str.parse().ok()?;
    let lon: i32 = lon_str.parse().ok()?;

    is_valid_cell(lat, lon).then_some((lat, lon))
}

/// Validate that a cell lies on the planetary grid.
pub fn is_valid_cell(lat: i32, lon: i32) -> bool {
    (-90..=90).contains(&lat) && (0..360).contains(&lon)
}
