use anyhow::{Context, Result};
use regolith::report::{write_candidates_csv, write_overlay_png, write_stats_json};
use regolith::{detect, CraterRecord, DetectionStatistics, OutputPaths};
use std::path::PathBuf;

use super::{load_tile, DetectionArgs, StoreOptions, TileRef};

pub fn run(
    store: &StoreOptions,
    tile: TileRef,
    output_dir: PathBuf,
    write_overlay: bool,
    json: bool,
    args: &DetectionArgs,
) -> Result<()> {
    let config = args.to_config()?;
    let (tile, stem) = load_tile(store, &tile)?;

    let result = detect(&tile, &config).context("Crater detection failed")?;

    let paths = OutputPaths::new(&output_dir, &stem);
    let records: Vec<CraterRecord> = result.candidates.iter().map(CraterRecord::from).collect();
    write_candidates_csv(&paths.candidates_csv, &records)
        .context("Failed to write candidate table")?;
    write_stats_json(&paths.stats_json, &result.stats).context("Failed to write statistics")?;
    if write_overlay {
        write_overlay_png(&paths.overlay_png, &result.overlay)
            .context("Failed to write overlay image")?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&result.stats)?);
        return Ok(());
    }

    println!("Tile: {}", stem);
    print_statistics(&result.stats);
    println!();
    println!("Candidates: {}", paths.candidates_csv.display());
    println!("Statistics: {}", paths.stats_json.display());
    if write_overlay {
        println!("Overlay:    {}", paths.overlay_png.display());
    }
    Ok(())
}

pub fn print_statistics(stats: &DetectionStatistics) {
    println!("Craters: {}", stats.count);
    if stats.is_empty() {
        return;
    }
    println!(
        "Diameter: {:.3} / {:.3} / {:.3} / {:.3} km (min / mean / median / max)",
        stats.min_diameter_km, stats.mean_diameter_km, stats.median_diameter_km, stats.max_diameter_km
    );
    println!(
        "Depth:    {:.3} / {:.3} / {:.3} / {:.3} km (estimated)",
        stats.min_depth_km, stats.mean_depth_km, stats.median_depth_km, stats.max_depth_km
    );
    println!("Mean circularity: {:.3}", stats.mean_circularity);
    if let Some(density) = stats.density_per_km2 {
        println!("Density: {:.6} craters/km²", density);
    }
}
