use anyhow::{bail, Context, Result};
use regolith::report::write_summary_csv;
use regolith::stats::summarize_files;
use std::path::PathBuf;

use super::detect::print_statistics;

pub fn run(
    inputs: &[PathBuf],
    area_km2: Option<f64>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let summary = summarize_files(inputs, area_km2);
    if summary.files.is_empty() {
        bail!("None of the {} input tables could be read", inputs.len());
    }

    if let Some(path) = &output {
        write_summary_csv(path, &summary).context("Failed to write summary table")?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summary.combined)?);
    } else {
        println!(
            "{:<32} {:>8} {:>12} {:>12}",
            "TABLE", "CRATERS", "MEAN D (km)", "MEAN d (km)"
        );
        println!("{}", "-".repeat(67));
        for file in &summary.files {
            let name = file
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.path.display().to_string());
            println!(
                "{:<32} {:>8} {:>12.3} {:>12.3}",
                name, file.stats.count, file.stats.mean_diameter_km, file.stats.mean_depth_km
            );
        }
        println!();
        println!("Combined:");
        print_statistics(&summary.combined);
    }

    for skipped in &summary.skipped {
        eprintln!("Skipped unreadable table: {}", skipped.display());
    }
    if let Some(path) = output {
        println!("Summary written to: {}", path.display());
    }
    Ok(())
}
