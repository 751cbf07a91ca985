//! Tile store with LRU caching over a local directory.
//!
//! This module provides [`TileStore`], the tile source used by the
//! detection and conversion pipelines. A store is opened at the start of a
//! batch, handed to whoever needs tiles, and closed at the end.
//!
//! # Auto-Download Feature
//!
//! When compiled with the `download` feature, `TileStore` can automatically
//! download missing tiles from a configured data source.
//!
//! ```ignore
//! use regolith::{TileStore, download::DownloadConfig};
//!
//! let store = TileStore::builder("/data/themis")
//!     .cache_size(4)
//!     .auto_download(DownloadConfig::themis())
//!     .build()?;
//!
//! // Downloads lat-30_lon000.pgm if not present locally
//! let tile = store.get_tile(-30, 0)?;
//! ```

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use moka::sync::Cache;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{RegolithError, Result};
use crate::filename::{cell_to_filename, filename_to_cell, is_valid_cell, TILE_EXTENSION};
use crate::tile::{Tile, TileGeometry};

#[cfg(feature = "download")]
use crate::download::{DownloadConfig, Downloader};

/// Default number of tiles kept in memory.
pub const DEFAULT_CACHE_SIZE: u64 = 8;

/// How a store has served its tiles so far.
///
/// `memory_hits + mapped` is the number of successful
/// [`TileStore::get_tile`] calls. `extracted` and `downloaded` count tile
/// files that had to be produced first, by `get_tile` or by
/// [`TileStore::prefetch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Tiles currently held in memory.
    pub resident: u64,
    /// Requests answered from memory.
    pub memory_hits: u64,
    /// Tiles mapped from the data directory.
    pub mapped: u64,
    /// `.pgm.zip` archives unpacked into the data directory.
    pub extracted: u64,
    /// Tiles fetched from the remote archive.
    pub downloaded: u64,
}

impl StoreStats {
    /// Successful `get_tile` calls.
    pub fn requests(&self) -> u64 {
        self.memory_hits + self.mapped
    }

    /// Share of requests answered without mapping a file, 0.0 before any.
    pub fn hit_rate(&self) -> f64 {
        match self.requests() {
            0 => 0.0,
            n => self.memory_hits as f64 / n as f64,
        }
    }
}

/// Where a tile file came from when it was not yet in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    OnDisk,
    Extracted,
    #[cfg(feature = "download")]
    Downloaded,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    mapped: AtomicU64,
    extracted: AtomicU64,
    downloaded: AtomicU64,
}

impl Counters {
    fn record(&self, origin: Origin) {
        let counter = match origin {
            Origin::OnDisk => return,
            Origin::Extracted => &self.extracted,
            #[cfg(feature = "download")]
            Origin::Downloaded => &self.downloaded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Statistics from a prefetch operation.
#[derive(Debug, Clone, Default)]
pub struct PrefetchStats {
    /// Number of cells requested.
    pub tiles_requested: u64,
    /// Number of tiles now present on disk.
    pub tiles_ready: u64,
    /// Number of tiles that could not be fetched.
    pub tiles_failed: u64,
    /// Total elapsed time in milliseconds.
    pub elapsed_ms: u64,
}

/// Tile source with an in-memory LRU over an on-disk cache directory.
///
/// # Example
///
/// ```ignore
/// use regolith::TileStore;
///
/// let store = TileStore::open("/data/themis", 4)?;
///
/// let tile = store.get_tile(-30, 0)?; // loaded from disk
/// let again = store.get_tile(-30, 0)?; // served from memory
///
/// let stats = store.close();
/// assert_eq!((stats.mapped, stats.memory_hits), (1, 1));
/// ```
pub struct TileStore {
    /// Directory holding cached `.pgm` files.
    data_dir: PathBuf,
    /// Conversion factors applied to tiles without header metadata.
    geometry: TileGeometry,
    /// LRU cache of loaded tiles, keyed by (lat, lon).
    tile_cache: Cache<(i32, i32), Arc<Tile>>,
    counters: Counters,
    /// Optional downloader for fetching missing tiles.
    #[cfg(feature = "download")]
    downloader: Option<Downloader>,
}

impl TileStore {
    /// Open a store over `data_dir`, creating the directory if needed.
    ///
    /// # Arguments
    ///
    /// * `data_dir` - Directory holding `.pgm` files
    /// * `cache_size` - Maximum number of tiles to keep in memory
    pub fn open<P: AsRef<Path>>(data_dir: P, cache_size: u64) -> Result<Self> {
        TileStoreBuilder::new(data_dir).cache_size(cache_size).build()
    }

    /// Create a builder for more configuration options.
    pub fn builder<P: AsRef<Path>>(data_dir: P) -> TileStoreBuilder {
        TileStoreBuilder::new(data_dir)
    }

    /// Get the tile for a grid cell.
    ///
    /// The tile is served from memory when cached, otherwise from the data
    /// directory (extracting a local `.pgm.zip` or downloading if enabled).
    ///
    /// # Errors
    ///
    /// - [`RegolithError::OutOfBounds`] if the cell is not on the grid
    /// - [`RegolithError::MalformedTile`] if the cached file is corrupt
    /// - [`RegolithError::TileUnavailable`] for any fetch or disk failure
    pub fn get_tile(&self, lat: i32, lon: i32) -> Result<Arc<Tile>> {
        if !is_valid_cell(lat, lon) {
            return Err(RegolithError::OutOfBounds { lat, lon });
        }

        self.load_tile((lat, lon)).map_err(|e| match e {
            e @ RegolithError::MalformedTile { .. } => e,
            other => RegolithError::TileUnavailable {
                lat,
                lon,
                reason: other.to_string(),
            },
        })
    }

    /// Load a tile from cache or disk.
    fn load_tile(&self, key: (i32, i32)) -> Result<Arc<Tile>> {
        if let Some(tile) = self.tile_cache.get(&key) {
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(tile);
        }

        let path = self.ensure_on_disk(key)?;
        debug!(path = %path.display(), "mapping tile");
        let tile = Arc::new(Tile::from_file_with_geometry(&path, self.geometry)?.with_cell(key.0, key.1));

        self.counters.mapped.fetch_add(1, Ordering::Relaxed);
        self.tile_cache.insert(key, tile.clone());

        Ok(tile)
    }

    /// Make sure the tile file for `key` exists locally and return its path.
    fn ensure_on_disk(&self, key: (i32, i32)) -> Result<PathBuf> {
        let (path, origin) = self.locate(key)?;
        self.counters.record(origin);
        Ok(path)
    }

    fn locate(&self, key: (i32, i32)) -> Result<(PathBuf, Origin)> {
        let filename = cell_to_filename(key.0, key.1);
        let path = self.data_dir.join(&filename);

        if path.exists() {
            return Ok((path, Origin::OnDisk));
        }

        // Check for a local .pgm.zip archive
        let zip_path = self.data_dir.join(format!("{}.zip", filename));
        if zip_path.exists() {
            self.extract_pgm_from_zip(&zip_path, &filename)?;
            return Ok((path, Origin::Extracted));
        }

        #[cfg(feature = "download")]
        {
            if let Some(ref downloader) = self.downloader {
                let path = downloader.download_tile(key.0, key.1, &self.data_dir)?;
                return Ok((path, Origin::Downloaded));
            }
        }

        Err(RegolithError::FileNotFound { path })
    }

    /// Extract a .pgm file from a local .pgm.zip archive.
    fn extract_pgm_from_zip(&self, zip_path: &Path, filename: &str) -> Result<()> {
        let file = File::open(zip_path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| RegolithError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| {
                RegolithError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;

            let entry_name = entry.name().to_lowercase();
            if entry_name.ends_with(".pgm") {
                info!(archive = %zip_path.display(), "extracting tile from archive");
                let mut out = tempfile::NamedTempFile::new_in(&self.data_dir)?;
                std::io::copy(&mut entry, &mut out)?;
                out.flush()?;
                out.persist(self.data_dir.join(filename))
                    .map_err(|e| e.error)?;
                return Ok(());
            }
        }

        Err(RegolithError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("No .pgm file found in {}", zip_path.display()),
        )))
    }

    /// Fetch tiles for many cells onto disk using a pool of worker threads.
    ///
    /// Tiles are not mapped into memory; this only fills the on-disk cache
    /// so later [`get_tile`](Self::get_tile) calls are local. Failures are
    /// counted, never propagated.
    pub fn prefetch(&self, cells: &[(i32, i32)], workers: usize) -> PrefetchStats {
        let start = Instant::now();
        let next = AtomicUsize::new(0);
        let ready = AtomicU64::new(0);
        let failed = AtomicU64::new(0);
        let workers = workers.clamp(1, cells.len().max(1));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(&(lat, lon)) = cells.get(i) else {
                        break;
                    };
                    let result = if is_valid_cell(lat, lon) {
                        self.ensure_on_disk((lat, lon))
                    } else {
                        Err(RegolithError::OutOfBounds { lat, lon })
                    };
                    match result {
                        Ok(_) => {
                            ready.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(lat, lon, error = %e, "prefetch failed");
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        PrefetchStats {
            tiles_requested: cells.len() as u64,
            tiles_ready: ready.into_inner(),
            tiles_failed: failed.into_inner(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Check if auto-download is enabled.
    #[cfg(feature = "download")]
    pub fn has_auto_download(&self) -> bool {
        self.downloader.is_some()
    }

    /// Counters since the store was opened.
    pub fn stats(&self) -> StoreStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StoreStats {
            resident: self.tile_cache.entry_count(),
            memory_hits: load(&self.counters.memory_hits),
            mapped: load(&self.counters.mapped),
            extracted: load(&self.counters.extracted),
            downloaded: load(&self.counters.downloaded),
        }
    }

    /// Get the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Conversion factors applied to tiles without header metadata.
    pub fn geometry(&self) -> TileGeometry {
        self.geometry
    }

    /// Get the maximum cache size.
    pub fn cache_capacity(&self) -> u64 {
        self.tile_cache.policy().max_capacity().unwrap_or(0)
    }

    /// Invalidate (remove) a specific tile from the cache.
    ///
    /// Accepts a filename (e.g., "lat-30_lon000.pgm").
    pub fn invalidate_tile(&self, filename: &str) {
        if let Some(key) = filename_to_cell(filename) {
            self.tile_cache.invalidate(&key);
        }
    }

    /// Clear all tiles from the cache.
    pub fn clear_cache(&self) {
        self.tile_cache.invalidate_all();
    }

    /// Scan the data directory for `.pgm` and `.pgm.zip` files.
    ///
    /// Returns a sorted, deduplicated list of tile filenames
    /// (e.g., `["lat-30_lon000.pgm"]`).
    pub fn scan_tile_files(&self) -> Vec<String> {
        let mut filenames = HashSet::new();
        let suffix = format!(".{}", TILE_EXTENSION);
        let zip_suffix = format!(".{}.zip", TILE_EXTENSION);

        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();

            let canonical = if name.ends_with(&zip_suffix) {
                name.strip_suffix(".zip")
            } else if name.ends_with(&suffix) {
                Some(name.as_ref())
            } else {
                None
            };

            if let Some(canonical) = canonical {
                if filename_to_cell(canonical).is_some() {
                    filenames.insert(canonical.to_string());
                }
            }
        }

        let mut result: Vec<String> = filenames.into_iter().collect();
        result.sort();
        result
    }

    /// Close the store, releasing all cached tiles.
    ///
    /// Returns the final counters.
    pub fn close(self) -> StoreStats {
        self.tile_cache.invalidate_all();
        self.tile_cache.run_pending_tasks();
        let stats = self.stats();
        info!(
            memory_hits = stats.memory_hits,
            mapped = stats.mapped,
            extracted = stats.extracted,
            downloaded = stats.downloaded,
            "tile store closed"
        );
        stats
    }
}

/// Builder for creating [`TileStore`] with custom configuration.
///
/// # Example
///
/// ```ignore
/// use regolith::{TileGeometry, TileStoreBuilder};
///
/// let store = TileStoreBuilder::new("/data/themis")
///     .cache_size(4)
///     .geometry(TileGeometry::new(0.1, 0.01))
///     .build()?;
/// ```
pub struct TileStoreBuilder {
    data_dir: PathBuf,
    cache_size: u64,
    geometry: TileGeometry,
    #[cfg(feature = "download")]
    download_config: Option<DownloadConfig>,
}

impl TileStoreBuilder {
    /// Create a new builder with the specified data directory.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            cache_size: DEFAULT_CACHE_SIZE,
            geometry: TileGeometry::default(),
            #[cfg(feature = "download")]
            download_config: None,
        }
    }

    /// Create a builder configured from environment variables.
    ///
    /// # Environment Variables
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `REGOLITH_DATA_DIR` | Directory holding .pgm files | Required |
    /// | `REGOLITH_CACHE_SIZE` | Maximum tiles in memory | 8 |
    /// | `REGOLITH_DOWNLOAD_SOURCE` | Named source: "themis"* | None |
    /// | `REGOLITH_DOWNLOAD_URL` | URL template for custom downloads* | None |
    ///
    /// *Only used when `download` feature is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if `REGOLITH_DATA_DIR` is not set.
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("REGOLITH_DATA_DIR").map_err(|_| {
            RegolithError::invalid_config("REGOLITH_DATA_DIR", "environment variable not set")
        })?;

        let cache_size: u64 = std::env::var("REGOLITH_CACHE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CACHE_SIZE);

        #[cfg(feature = "download")]
        let download_config = match std::env::var("REGOLITH_DOWNLOAD_SOURCE") {
            Ok(source) if source.eq_ignore_ascii_case("themis") => Some(DownloadConfig::themis()),
            _ => std::env::var("REGOLITH_DOWNLOAD_URL")
                .ok()
                .map(DownloadConfig::mirror),
        };

        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            cache_size,
            geometry: TileGeometry::default(),
            #[cfg(feature = "download")]
            download_config,
        })
    }

    /// Set the data directory.
    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.data_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set the maximum number of tiles to keep in memory.
    pub fn cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    /// Set the conversion factors for tiles without header metadata.
    pub fn geometry(mut self, geometry: TileGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Enable auto-download with the specified configuration.
    #[cfg(feature = "download")]
    pub fn auto_download(mut self, config: DownloadConfig) -> Self {
        self.download_config = Some(config);
        self
    }

    /// Build the [`TileStore`], creating the data directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or, with
    /// auto-download enabled, the HTTP client cannot be initialized.
    pub fn build(self) -> Result<TileStore> {
        fs::create_dir_all(&self.data_dir)?;

        #[cfg(feature = "download")]
        let downloader = match self.download_config {
            Some(config) => Some(Downloader::new(config)?),
            None => None,
        };

        Ok(TileStore {
            data_dir: self.data_dir,
            geometry: self.geometry,
            tile_cache: Cache::builder().max_capacity(self.cache_size).build(),
            counters: Counters::default(),
            #[cfg(feature = "download")]
            downloader,
        })
    }
}
