use anyhow::{Context, Result};
use regolith::report::write_comparison_csv;
use regolith::stats::summarize_file;
use regolith::StatsComparison;
use std::path::{Path, PathBuf};

pub fn run(
    baseline: &Path,
    reference: &Path,
    baseline_area_km2: Option<f64>,
    reference_area_km2: Option<f64>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let base = summarize_file(baseline, baseline_area_km2)
        .with_context(|| format!("Failed to read {}", baseline.display()))?;
    let refr = summarize_file(reference, reference_area_km2)
        .with_context(|| format!("Failed to read {}", reference.display()))?;

    let comparison = StatsComparison::between(&base, &refr);

    if let Some(path) = &output {
        write_comparison_csv(path, &comparison).context("Failed to write comparison table")?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&comparison)?);
        return Ok(());
    }

    println!("Baseline:  {}", baseline.display());
    println!("Reference: {}", reference.display());
    println!();
    println!(
        "{:<20} {:>12} {:>12} {:>12} {:>8}",
        "METRIC", "BASELINE", "REFERENCE", "DIFFERENCE", "RATIO"
    );
    println!("{}", "-".repeat(68));
    for m in &comparison.metrics {
        let ratio = m
            .ratio
            .map(|r| format!("{:.3}", r))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:>12.4} {:>12.4} {:>12.4} {:>8}",
            m.metric, m.baseline, m.reference, m.difference, ratio
        );
    }

    if let Some(path) = output {
        println!();
        println!("Comparison written to: {}", path.display());
    }
    Ok(())
}
