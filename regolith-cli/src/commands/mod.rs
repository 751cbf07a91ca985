pub mod batch;
pub mod compare;
pub mod convert;
pub mod detect;
pub mod info;
pub mod list;
pub mod stats;

use anyhow::{bail, Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use regolith::download::DownloadConfig;
use regolith::filename::{cell_stem, filename_to_cell};
use regolith::{
    DepthModel, DetectionConfig, ExportConfig, MeshConfig, Tile, TileGeometry, TileStore,
    TileStoreBuilder,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Global tile store settings.
pub struct StoreOptions {
    pub data_dir: Option<PathBuf>,
    pub cache_size: u64,
    pub auto_download: bool,
    pub geometry: TileGeometry,
}

impl StoreOptions {
    pub fn open(&self) -> Result<TileStore> {
        let mut builder = match &self.data_dir {
            Some(dir) => TileStoreBuilder::new(dir),
            None => TileStoreBuilder::from_env().context(
                "REGOLITH_DATA_DIR environment variable not set. Use --data-dir or set REGOLITH_DATA_DIR",
            )?,
        };

        builder = builder.cache_size(self.cache_size).geometry(self.geometry);

        if self.auto_download {
            builder = builder.auto_download(DownloadConfig::themis());
        }

        builder.build().context("Failed to open tile store")
    }
}

/// A tile named on the command line.
#[derive(Debug, Clone, PartialEq)]
pub enum TileRef {
    /// A `.pgm` file anywhere on disk.
    File(PathBuf),
    /// A cell served by the tile store.
    Cell(i32, i32),
}

pub fn tile_ref(tile: Option<String>, lat: Option<i32>, lon: Option<i32>) -> Result<TileRef> {
    if let (Some(lat), Some(lon)) = (lat, lon) {
        return Ok(TileRef::Cell(lat, lon));
    }
    let Some(tile) = tile else {
        bail!("Specify a tile path, a tile name, or --lat and --lon");
    };

    if tile.to_ascii_lowercase().ends_with(".pgm") || Path::new(&tile).is_file() {
        return Ok(TileRef::File(PathBuf::from(tile)));
    }
    match filename_to_cell(&tile) {
        Some((lat, lon)) => Ok(TileRef::Cell(lat, lon)),
        None => bail!("'{}' is neither a .pgm file nor a tile name like lat-30_lon000", tile),
    }
}

/// Load the tile and the base name for its outputs.
pub fn load_tile(options: &StoreOptions, tile: &TileRef) -> Result<(Arc<Tile>, String)> {
    match tile {
        TileRef::File(path) => {
            let mut loaded = Tile::from_file_with_geometry(path, options.geometry)
                .with_context(|| format!("Failed to load tile {}", path.display()))?;
            if let Some((lat, lon)) = filename_to_cell(&path.to_string_lossy()) {
                loaded = loaded.with_cell(lat, lon);
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "tile".to_string());
            Ok((Arc::new(loaded), stem))
        }
        TileRef::Cell(lat, lon) => {
            let store = options.open()?;
            let loaded = store
                .get_tile(*lat, *lon)
                .with_context(|| format!("Failed to get tile {}", cell_stem(*lat, *lon)))?;
            Ok((loaded, cell_stem(*lat, *lon)))
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DetectionArgs {
    /// Smallest crater diameter to keep
    #[arg(long, default_value_t = 1.0)]
    pub min_diameter_km: f64,

    /// Gaussian blur sigma in samples
    #[arg(long, default_value_t = 1.0)]
    pub sigma: f64,

    /// Weak edge threshold as a fraction of the strongest gradient
    #[arg(long, default_value_t = 0.1)]
    pub low_threshold: f64,

    /// Strong edge threshold as a fraction of the strongest gradient
    #[arg(long, default_value_t = 0.3)]
    pub high_threshold: f64,

    /// Lowest accepted circularity
    #[arg(long, default_value_t = 0.5)]
    pub min_circularity: f64,

    /// Depth as a fraction of diameter
    #[arg(long, default_value_t = 0.2)]
    pub depth_ratio: f64,

    /// Use depth = COEFFICIENT × diameter^EXPONENT instead of a fixed ratio
    #[arg(long, num_args = 2, value_names = ["COEFFICIENT", "EXPONENT"])]
    pub depth_power_law: Option<Vec<f64>>,

    /// Upper bound on estimated depth
    #[arg(long, default_value_t = 8.0)]
    pub max_depth_km: f64,

    /// Longest side of the overlay image in pixels
    #[arg(long, default_value_t = 1000)]
    pub overlay_max_dim: u32,
}

impl DetectionArgs {
    pub fn to_config(&self) -> Result<DetectionConfig> {
        let depth_model = match self.depth_power_law.as_deref() {
            Some(&[coefficient, exponent]) => DepthModel::PowerLaw {
                coefficient,
                exponent,
            },
            Some(_) => bail!("--depth-power-law takes a coefficient and an exponent"),
            None => DepthModel::Proportional {
                ratio: self.depth_ratio,
            },
        };
        let config = DetectionConfig::default()
            .with_min_diameter_km(self.min_diameter_km)
            .with_sigma(self.sigma)
            .with_thresholds(self.low_threshold, self.high_threshold)
            .with_min_circularity(self.min_circularity)
            .with_depth_model(depth_model)
            .with_max_depth_km(self.max_depth_km)
            .with_overlay_max_dim(self.overlay_max_dim);
        config.validate().context("Invalid detection settings")?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct MeshArgs {
    /// Raw rows decoded per chunk
    #[arg(long, default_value_t = 1024)]
    pub chunk_rows: usize,

    /// Maximum retained samples per mesh row
    #[arg(long, default_value_t = 1024)]
    pub target_width: usize,

    /// Maximum triangles after decimation
    #[arg(long, default_value_t = 500_000)]
    pub target_faces: usize,
}

impl MeshArgs {
    pub fn to_config(&self) -> Result<MeshConfig> {
        let config = MeshConfig::default()
            .with_chunk_rows(self.chunk_rows)
            .with_target_width(self.target_width)
            .with_target_face_count(self.target_faces);
        config.validate().context("Invalid mesh settings")?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Seconds each external export step may run
    #[arg(long, env = "REGOLITH_EXPORT_TIMEOUT", default_value_t = 300)]
    pub export_timeout: u64,

    /// OBJ to glTF converter
    #[arg(long, env = "REGOLITH_OBJ2GLTF", default_value = "obj2gltf")]
    pub obj2gltf: String,

    /// glTF to Draco GLB converter
    #[arg(long, env = "REGOLITH_GLTF_PIPELINE", default_value = "gltf-pipeline")]
    pub gltf_pipeline: String,

    /// Draco compression level (0-10)
    #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub draco_level: u8,
}

impl ExportArgs {
    pub fn to_config(&self) -> ExportConfig {
        ExportConfig::default()
            .with_timeout(self.export_timeout)
            .with_programs(&self.obj2gltf, &self.gltf_pipeline)
            .with_draco_compression_level(self.draco_level)
    }
}

pub fn progress_bar(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_ref_forms() {
        assert_eq!(
            tile_ref(None, Some(-30), Some(0)).unwrap(),
            TileRef::Cell(-30, 0)
        );
        assert_eq!(
            tile_ref(Some("lat-30_lon060".to_string()), None, None).unwrap(),
            TileRef::Cell(-30, 60)
        );
        assert_eq!(
            tile_ref(Some("/tmp/scene.PGM".to_string()), None, None).unwrap(),
            TileRef::File(PathBuf::from("/tmp/scene.PGM"))
        );
        assert!(tile_ref(Some("N35E138".to_string()), None, None).is_err());
        assert!(tile_ref(None, None, None).is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }
}
