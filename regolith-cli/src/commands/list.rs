use anyhow::{bail, Result};
use regolith::filename::filename_to_cell;
use regolith::Tile;
use std::fs;

use super::{format_size, StoreOptions};

pub fn run(options: &StoreOptions) -> Result<()> {
    let store = options.open()?;
    let dir = store.data_dir().to_path_buf();

    if !dir.exists() {
        bail!("Data directory does not exist: {}", dir.display());
    }

    let tiles = store.scan_tile_files();
    if tiles.is_empty() {
        println!("No .pgm files found in: {}", dir.display());
        return Ok(());
    }

    let mut archived_count = 0;
    let mut unreadable_count = 0;
    let mut total_size: u64 = 0;

    println!(
        "{:<22} {:>12} {:>6} {:>14}",
        "TILE", "SAMPLES", "BYTES", "CELL"
    );
    println!("{}", "-".repeat(57));

    for filename in &tiles {
        let path = dir.join(filename);
        let cell = filename_to_cell(filename)
            .map(|(lat, lon)| format!("{}, {}", lat, lon))
            .unwrap_or_else(|| "Unknown".to_string());

        if !path.exists() {
            // Only the .pgm.zip archive is present
            archived_count += 1;
            let size = fs::metadata(dir.join(format!("{}.zip", filename)))
                .map(|m| m.len())
                .unwrap_or(0);
            total_size += size;
            println!("{:<22} {:>12} {:>6} {:>14}", filename, "(zip)", "-", cell);
            continue;
        }

        total_size += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match Tile::from_file_with_geometry(&path, store.geometry()) {
            Ok(tile) => println!(
                "{:<22} {:>12} {:>6} {:>14}",
                filename,
                format!("{}x{}", tile.width(), tile.height()),
                tile.bit_depth().bytes_per_sample(),
                cell
            ),
            Err(_) => {
                unreadable_count += 1;
                println!("{:<22} {:>12} {:>6} {:>14}", filename, "???", "-", cell);
            }
        }
    }

    // Summary
    println!();
    println!("Summary:");
    println!("  Total tiles: {}", tiles.len());
    if archived_count > 0 {
        println!("  Zipped only: {}", archived_count);
    }
    if unreadable_count > 0 {
        println!("  Unreadable: {}", unreadable_count);
    }
    println!("  Total size: {}", format_size(total_size));
    println!("  Data directory: {}", dir.display());

    Ok(())
}
