use anyhow::{Context, Result};
use regolith::{convert, write_obj, SceneExporter};
use std::path::PathBuf;

use super::{load_tile, ExportArgs, MeshArgs, StoreOptions, TileRef};

pub fn run(
    store: &StoreOptions,
    tile: TileRef,
    output: Option<PathBuf>,
    obj_only: bool,
    json: bool,
    mesh: &MeshArgs,
    export: &ExportArgs,
) -> Result<()> {
    let config = mesh.to_config()?;
    let (tile, stem) = load_tile(store, &tile)?;

    let converted = convert(&tile, &config).context("Mesh conversion failed")?;

    let extension = if obj_only { "obj" } else { "glb" };
    let output_path = output.unwrap_or_else(|| PathBuf::from(format!("{}.{}", stem, extension)));

    if obj_only {
        write_obj(&converted.mesh, &output_path).context("Failed to write OBJ file")?;
    } else {
        SceneExporter::new(&export.to_config())
            .export(&converted.mesh, &output_path)
            .context("Mesh export failed")?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&converted.report)?);
        return Ok(());
    }

    let report = &converted.report;
    println!("Tile: {}", stem);
    println!(
        "Source: {}x{} samples, stride {} → {}x{} grid",
        report.source_width,
        report.source_height,
        report.stride,
        report.retained_width,
        report.retained_height
    );
    println!(
        "Triangles: {} → {} ({} vertices)",
        report.faces_before, report.faces_after, report.vertices
    );
    println!("Chunks: {}", report.chunks);
    println!("Elapsed: {} ms", report.elapsed_ms);
    println!("Output written to: {}", output_path.display());
    Ok(())
}
