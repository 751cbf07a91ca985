use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use regolith::filename::{cell_stem, filename_to_cell};
use regolith::{BatchOptions, BatchRunner, MeshOutput, TileStore};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use super::{progress_bar, DetectionArgs, ExportArgs, MeshArgs, StoreOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MeshMode {
    /// No mesh
    Skip,
    /// OBJ interchange file only
    Obj,
    /// Draco-compressed GLB
    Glb,
}

impl From<MeshMode> for MeshOutput {
    fn from(mode: MeshMode) -> Self {
        match mode {
            MeshMode::Skip => MeshOutput::Skip,
            MeshMode::Obj => MeshOutput::Obj,
            MeshMode::Glb => MeshOutput::Glb,
        }
    }
}

/// Where the list of cells comes from.
pub enum CellSource {
    Csv {
        path: PathBuf,
        lat_col: String,
        lon_col: String,
    },
    DataDir,
}

impl CellSource {
    pub fn from_args(input: Option<PathBuf>, all: bool, lat_col: String, lon_col: String) -> Self {
        match input {
            Some(path) if !all => CellSource::Csv {
                path,
                lat_col,
                lon_col,
            },
            _ => CellSource::DataDir,
        }
    }

    fn cells(&self, store: &TileStore) -> Result<Vec<(i32, i32)>> {
        match self {
            CellSource::Csv {
                path,
                lat_col,
                lon_col,
            } => read_cells(path, lat_col, lon_col),
            CellSource::DataDir => Ok(store
                .scan_tile_files()
                .iter()
                .filter_map(|name| filename_to_cell(name))
                .collect()),
        }
    }
}

pub struct BatchArgs {
    pub output_dir: PathBuf,
    pub mesh_mode: MeshMode,
    pub workers: usize,
    pub write_overlay: bool,
    pub json: bool,
}

pub fn run(
    store_options: &StoreOptions,
    source: CellSource,
    args: BatchArgs,
    detection: &DetectionArgs,
    mesh: &MeshArgs,
    export: &ExportArgs,
) -> Result<()> {
    let options = BatchOptions::new(&args.output_dir)
        .with_detection(detection.to_config()?)
        .with_mesh(mesh.to_config()?)
        .with_export(export.to_config())
        .with_mesh_output(args.mesh_mode.into())
        .with_overlay(args.write_overlay);

    let store = store_options.open()?;
    let cells = source.cells(&store)?;
    if cells.is_empty() {
        println!("No tiles to process");
        return Ok(());
    }

    tracing::info!(
        data_dir = %store.data_dir().display(),
        cache_capacity = store.cache_capacity(),
        auto_download = store.has_auto_download(),
        tiles = cells.len(),
        "Starting batch"
    );

    if store.has_auto_download() {
        let prefetch = store.prefetch(&cells, args.workers);
        tracing::info!(
            tiles_ready = prefetch.tiles_ready,
            tiles_failed = prefetch.tiles_failed,
            elapsed_ms = prefetch.elapsed_ms,
            "Prefetch complete"
        );
    }

    let runner = BatchRunner::new(&store, options);
    let pb = progress_bar(cells.len() as u64)?;
    let summary = runner.run(&cells, |lat, lon, result| {
        if let Err(e) = result {
            pb.println(format!("{}: {}", cell_stem(lat, lon), e));
        }
        pb.set_message(cell_stem(lat, lon));
        pb.inc(1);
    });
    pb.finish_with_message("done");
    drop(runner);

    let store_stats = store.close();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!();
        println!("Summary:");
        println!("  Tiles processed: {}", summary.succeeded.len());
        println!("  Tiles failed: {}", summary.failed.len());
        println!("  Craters found: {}", summary.total_craters());
        println!("  Cache hit rate: {:.1}%", store_stats.hit_rate() * 100.0);
        if store_stats.extracted + store_stats.downloaded > 0 {
            println!(
                "  Tiles fetched: {} extracted, {} downloaded",
                store_stats.extracted, store_stats.downloaded
            );
        }
        println!("  Output directory: {}", args.output_dir.display());
    }

    if summary.succeeded.is_empty() {
        bail!("All {} tiles failed", summary.failed.len());
    }
    Ok(())
}

/// Read integer cells from the named columns of a CSV file.
fn read_cells(input: &Path, lat_col: &str, lon_col: &str) -> Result<Vec<(i32, i32)>> {
    let file = File::open(input).context("Failed to open input file")?;
    let mut reader = csv::Reader::from_reader(BufReader::new(file));

    // Find column indices
    let headers = reader.headers()?.clone();
    let lat_idx = headers
        .iter()
        .position(|h| h == lat_col)
        .with_context(|| format!("Column '{}' not found in CSV", lat_col))?;
    let lon_idx = headers
        .iter()
        .position(|h| h == lon_col)
        .with_context(|| format!("Column '{}' not found in CSV", lon_col))?;

    let mut cells = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let lat: i32 = record
            .get(lat_idx)
            .context("Missing latitude")?
            .trim()
            .parse()
            .with_context(|| format!("Invalid latitude on row {}", line + 1))?;
        let lon: i32 = record
            .get(lon_idx)
            .context("Missing longitude")?
            .trim()
            .parse()
            .with_context(|| format!("Invalid longitude on row {}", line + 1))?;
        if !cells.contains(&(lat, lon)) {
            cells.push((lat, lon));
        }
    }
    Ok(cells)
}
