use anyhow::Result;
use regolith::filename::cell_stem;

use super::{format_size, load_tile, StoreOptions, TileRef};

pub fn run(store: &StoreOptions, tile: TileRef) -> Result<()> {
    let file_size = match &tile {
        TileRef::File(path) => std::fs::metadata(path).ok().map(|m| m.len()),
        TileRef::Cell(..) => None,
    };
    let (loaded, stem) = load_tile(store, &tile)?;

    let geometry = loaded.geometry();
    let (min, max) = loaded.sample_range();

    println!("Tile: {}", stem);
    if let Some((lat, lon)) = loaded.cell() {
        println!("Cell: {} (lat {}, lon {})", cell_stem(lat, lon), lat, lon);
    }
    if let Some(size) = file_size {
        println!("File size: {}", format_size(size));
    }
    println!("Dimensions: {}x{}", loaded.width(), loaded.height());
    println!(
        "Bit depth: {} bytes/sample (maxval {})",
        loaded.bit_depth().bytes_per_sample(),
        loaded.max_value()
    );
    println!("Resolution: {} km/sample", geometry.km_per_sample);
    println!(
        "Extent: {:.2} x {:.2} km ({:.1} km²)",
        loaded.width_km(),
        loaded.height_km(),
        loaded.area_km2()
    );
    println!("Sample range: {} to {}", min, max);
    println!(
        "Elevation range: {:.3} to {:.3} km",
        loaded.elevation_km(min),
        loaded.elevation_km(max)
    );
    if min == max {
        println!("Note: tile is flat, detection will find nothing");
    }

    Ok(())
}
