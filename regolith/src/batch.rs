//! Detection and conversion over many tiles.
//!
//! [`BatchRunner`] borrows an open [`TileStore`]. For each cell it loads the
//! tile once, then runs detection and mesh conversion side by side on the
//! shared tile. A failing tile is logged and recorded; the rest of the batch
//! carries on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::detect::{detect, DetectionConfig};
use crate::error::Result;
use crate::export::{write_obj, ExportConfig, SceneExporter};
use crate::filename::cell_stem;
use crate::mesh::{convert, MeshConfig};
use crate::report::{
    write_candidates_csv, write_overlay_png, write_stats_json, CraterRecord, OutputPaths,
};
use crate::stats::DetectionStatistics;
use crate::store::TileStore;
use crate::tile::Tile;

/// What to do with the converted mesh.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MeshOutput {
    /// Skip conversion entirely.
    Skip,
    /// Write the OBJ interchange file only.
    Obj,
    /// Run the full export chain to GLB.
    #[default]
    Glb,
}

/// Settings shared by every tile in a batch.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub output_dir: PathBuf,
    pub detection: DetectionConfig,
    pub mesh: MeshConfig,
    pub export: ExportConfig,
    pub mesh_output: MeshOutput,
    /// Write the detection overlay PNG.
    pub write_overlay: bool,
}

impl BatchOptions {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            detection: DetectionConfig::default(),
            mesh: MeshConfig::default(),
            export: ExportConfig::default(),
            mesh_output: MeshOutput::default(),
            write_overlay: true,
        }
    }

    pub fn with_detection(mut self, detection: DetectionConfig) -> Self {
        self.detection = detection;
        self
    }

    pub fn with_mesh(mut self, mesh: MeshConfig) -> Self {
        self.mesh = mesh;
        self
    }

    pub fn with_export(mut self, export: ExportConfig) -> Self {
        self.export = export;
        self
    }

    pub fn with_mesh_output(mut self, mesh_output: MeshOutput) -> Self {
        self.mesh_output = mesh_output;
        self
    }

    pub fn with_overlay(mut self, write_overlay: bool) -> Self {
        self.write_overlay = write_overlay;
        self
    }
}

/// Result of one successfully processed tile.
#[derive(Debug, Clone, Serialize)]
pub struct TileReport {
    pub lat: i32,
    pub lon: i32,
    pub stats: DetectionStatistics,
    /// Faces in the written mesh, `None` when conversion was skipped.
    pub faces: Option<usize>,
    pub elapsed_ms: u64,
}

/// A tile that could not be processed.
#[derive(Debug, Clone, Serialize)]
pub struct TileFailure {
    pub lat: i32,
    pub lon: i32,
    pub error: String,
    pub retryable: bool,
}

/// Outcome of a whole batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub succeeded: Vec<TileReport>,
    pub failed: Vec<TileFailure>,
    pub elapsed_ms: u64,
}

impl BatchSummary {
    pub fn total_craters(&self) -> usize {
        self.succeeded.iter().map(|r| r.stats.count).sum()
    }
}

/// Runs the pipeline over cells served by a [`TileStore`].
pub struct BatchRunner<'a> {
    store: &'a TileStore,
    options: BatchOptions,
    exporter: SceneExporter,
}

impl<'a> BatchRunner<'a> {
    pub fn new(store: &'a TileStore, options: BatchOptions) -> Self {
        let exporter = SceneExporter::new(&options.export);
        Self {
            store,
            options,
            exporter,
        }
    }

    /// Replace the export chain used for [`MeshOutput::Glb`].
    pub fn with_exporter(mut self, exporter: SceneExporter) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Output paths for a cell.
    pub fn output_paths(&self, lat: i32, lon: i32) -> OutputPaths {
        OutputPaths::new(&self.options.output_dir, &cell_stem(lat, lon))
    }

    /// Process every cell in order, calling `on_tile` after each one.
    pub fn run<F>(&self, cells: &[(i32, i32)], mut on_tile: F) -> BatchSummary
    where
        F: FnMut(i32, i32, &Result<TileReport>),
    {
        let start = Instant::now();
        let mut summary = BatchSummary::default();

        for &(lat, lon) in cells {
            let result = self.process_tile(lat, lon);
            on_tile(lat, lon, &result);
            match result {
                Ok(report) => summary.succeeded.push(report),
                Err(e) => {
                    warn!(lat, lon, error = %e, "tile failed");
                    summary.failed.push(TileFailure {
                        lat,
                        lon,
                        retryable: e.is_retryable(),
                        error: e.to_string(),
                    });
                }
            }
        }

        summary.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            craters = summary.total_craters(),
            elapsed_ms = summary.elapsed_ms,
            "batch finished"
        );
        summary
    }

    /// Load one tile and run detection and conversion on it concurrently.
    ///
    /// Detection outputs are written even if conversion fails afterwards;
    /// the tile still counts as failed.
    pub fn process_tile(&self, lat: i32, lon: i32) -> Result<TileReport> {
        let start = Instant::now();
        let tile = self.store.get_tile(lat, lon)?;
        let paths = self.output_paths(lat, lon);

        let (stats, faces) = std::thread::scope(|s| {
            let mesh_tile = Arc::clone(&tile);
            let mesh_paths = &paths;
            let conversion = s.spawn(move || self.convert_tile(&mesh_tile, mesh_paths));
            let stats = self.detect_tile(&tile, &paths);
            let faces = match conversion.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            (stats, faces)
        });

        let report = TileReport {
            lat,
            lon,
            stats: stats?,
            faces: faces?,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            lat,
            lon,
            craters = report.stats.count,
            faces = report.faces,
            elapsed_ms = report.elapsed_ms,
            "tile processed"
        );
        Ok(report)
    }

    fn detect_tile(&self, tile: &Tile, paths: &OutputPaths) -> Result<DetectionStatistics> {
        let result = detect(tile, &self.options.detection)?;
        let records: Vec<CraterRecord> = result.candidates.iter().map(CraterRecord::from).collect();
        write_candidates_csv(&paths.candidates_csv, &records)?;
        write_stats_json(&paths.stats_json, &result.stats)?;
        if self.options.write_overlay {
            write_overlay_png(&paths.overlay_png, &result.overlay)?;
        }
        Ok(result.stats)
    }

    fn convert_tile(&self, tile: &Tile, paths: &OutputPaths) -> Result<Option<usize>> {
        if self.options.mesh_output == MeshOutput::Skip {
            return Ok(None);
        }
        let output = convert(tile, &self.options.mesh)?;
        match self.options.mesh_output {
            MeshOutput::Obj => write_obj(&output.mesh, &paths.mesh_obj)?,
            MeshOutput::Glb => self.exporter.export(&output.mesh, &paths.mesh_glb)?,
            MeshOutput::Skip => {}
        }
        Ok(Some(output.mesh.face_count()))
    }
}
