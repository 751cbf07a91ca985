//! # regolith - planetary heightmap analysis
//!
//! Crater detection and terrain mesh conversion for planetary surface
//! heightmap tiles stored as binary PGM rasters.
//!
//! ## Features
//!
//! - **Memory-mapped tiles**: raw samples are paged in on demand
//! - **Crater detection**: edge-based contour extraction with size,
//!   circularity and depth estimates
//! - **Bounded meshes**: chunked grid assembly and quadric decimation to a
//!   fixed width and triangle budget, exported as Draco-compressed GLB
//! - **Tile store**: LRU-cached local directory with optional download
//!
//! ## Quick Start
//!
//! ```ignore
//! use regolith::{convert, detect, DetectionConfig, MeshConfig, TileStore};
//!
//! let store = TileStore::open("/data/themis", 4)?;
//! let tile = store.get_tile(-30, 0)?;
//!
//! let found = detect(&tile, &DetectionConfig::default())?;
//! println!("{} craters", found.stats.count);
//!
//! let mesh = convert(&tile, &MeshConfig::default())?;
//! println!("{} triangles", mesh.report.faces_after);
//! ```
//!
//! ## Tile Format
//!
//! Tiles are binary PGM (`P5`) files named `lat{lat}_lon{lon:03}.pgm`.
//! Samples are 8-bit below maxval 256, otherwise 16-bit big-endian.
//! Header comments `# km_per_sample <value>` and
//! `# elevation_km_per_unit <value>` override the store's default geometry.
//!
//! ## Depth Estimates
//!
//! Crater depth is derived from diameter through an assumed
//! depth/diameter relationship. It is never measured from the raster.

pub mod batch;
pub mod detect;
#[cfg(feature = "download")]
pub mod download;
pub mod error;
pub mod export;
pub mod filename;
pub mod mesh;
pub mod report;
pub mod stats;
pub mod store;
pub mod tile;

// Re-export main types at crate root for convenience
pub use batch::{BatchOptions, BatchRunner, BatchSummary, MeshOutput, TileFailure, TileReport};
pub use detect::{detect, CraterCandidate, DepthModel, DetectionConfig, DetectionResult};
pub use error::{RegolithError, Result};
pub use export::{validate_glb, write_obj, CommandStep, ExportConfig, ExportStep, SceneExporter};
pub use mesh::{convert, ConversionOutput, ConversionReport, MeshConfig, TerrainMesh};
pub use report::{CraterRecord, OutputPaths};
pub use stats::{DetectionStatistics, StatsComparison, StatsSummary};
pub use store::{PrefetchStats, StoreStats, TileStore, TileStoreBuilder, DEFAULT_CACHE_SIZE};
pub use tile::{BitDepth, Tile, TileGeometry};
