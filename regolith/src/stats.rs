//! Aggregate crater statistics and dataset comparison.
//!
//! [`DetectionStatistics`] summarizes one set of craters. [`summarize_files`]
//! reads candidate tables back from disk and summarizes each file and the
//! union of all files. [`StatsComparison`] contrasts two datasets, such as a
//! coarse survey against a high-resolution reference.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::detect::CraterCandidate;
use crate::error::Result;
use crate::filename::filename_to_cell;
use crate::report::{read_candidates_csv, CraterRecord};

/// Count, range and central values of one crater population.
///
/// All fields are zero when the population is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionStatistics {
    pub count: usize,
    pub min_diameter_km: f64,
    pub mean_diameter_km: f64,
    pub median_diameter_km: f64,
    pub max_diameter_km: f64,
    pub min_depth_km: f64,
    pub mean_depth_km: f64,
    pub median_depth_km: f64,
    pub max_depth_km: f64,
    pub mean_circularity: f64,
    /// Surveyed area, when known.
    pub area_km2: Option<f64>,
    /// Craters per km², when the area is known and positive.
    pub density_per_km2: Option<f64>,
}

#[derive(Default)]
struct Spread {
    min: f64,
    mean: f64,
    median: f64,
    max: f64,
}

fn spread(mut values: Vec<f64>) -> Spread {
    if values.is_empty() {
        return Spread::default();
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    let median = if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    };
    Spread {
        min: values[0],
        mean: values.iter().sum::<f64>() / n as f64,
        median,
        max: values[n - 1],
    }
}

impl DetectionStatistics {
    /// Summarize accepted candidates over a surveyed area.
    pub fn from_candidates(candidates: &[CraterCandidate], area_km2: Option<f64>) -> Self {
        Self::from_values(
            candidates.iter().map(|c| (c.diameter_km, c.depth_km, c.circularity)),
            area_km2,
        )
    }

    /// Summarize rows read back from a candidate table.
    pub fn from_records(records: &[CraterRecord], area_km2: Option<f64>) -> Self {
        Self::from_values(
            records.iter().map(|r| (r.diameter_km, r.depth_km, r.circularity)),
            area_km2,
        )
    }

    fn from_values(
        values: impl Iterator<Item = (f64, f64, f64)>,
        area_km2: Option<f64>,
    ) -> Self {
        let mut diameters = Vec::new();
        let mut depths = Vec::new();
        let mut circularity_sum = 0.0;
        for (diameter, depth, circularity) in values {
            diameters.push(diameter);
            depths.push(depth);
            circularity_sum += circularity;
        }

        let count = diameters.len();
        let mean_circularity = if count == 0 {
            0.0
        } else {
            circularity_sum / count as f64
        };
        let density_per_km2 = area_km2
            .filter(|&a| a > 0.0)
            .map(|a| count as f64 / a);

        let d = spread(diameters);
        let z = spread(depths);

        Self {
            count,
            min_diameter_km: d.min,
            mean_diameter_km: d.mean,
            median_diameter_km: d.median,
            max_diameter_km: d.max,
            min_depth_km: z.min,
            mean_depth_km: z.mean,
            median_depth_km: z.median,
            max_depth_km: z.max,
            mean_circularity,
            area_km2,
            density_per_km2,
        }
    }

    /// `true` when no craters were counted.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Statistics of one candidate table.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSummary {
    pub path: PathBuf,
    /// Grid cell parsed from the file name, if it follows tile naming.
    pub cell: Option<(i32, i32)>,
    pub stats: DetectionStatistics,
}

/// Per-file and combined statistics over several candidate tables.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSummary {
    pub files: Vec<FileSummary>,
    /// Paths that could not be read.
    pub skipped: Vec<PathBuf>,
    pub combined: DetectionStatistics,
}

/// Parse the grid cell out of names like `lat-30_lon060_craters.csv`.
pub fn cell_from_table_name(path: &Path) -> Option<(i32, i32)> {
    let name = path.file_name()?.to_str()?;
    let start = name.find("lat")?;
    let rest = &name[start..];
    let lon_at = rest.find("_lon")?;
    let stem_len = lon_at + "_lon".len() + 3;
    filename_to_cell(rest.get(..stem_len)?)
}

/// Summarize candidate tables read from disk.
///
/// Unreadable files are logged and listed in [`StatsSummary::skipped`]
/// instead of failing the whole run. When `area_per_file_km2` is given,
/// densities use it per file and its multiple for the combined set.
pub fn summarize_files(paths: &[PathBuf], area_per_file_km2: Option<f64>) -> StatsSummary {
    let mut files = Vec::new();
    let mut skipped = Vec::new();
    let mut all = Vec::new();

    for path in paths {
        match read_candidates_csv(path) {
            Ok(records) => {
                info!(path = %path.display(), craters = records.len(), "loaded candidate table");
                files.push(FileSummary {
                    path: path.clone(),
                    cell: cell_from_table_name(path),
                    stats: DetectionStatistics::from_records(&records, area_per_file_km2),
                });
                all.extend(records);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping candidate table");
                skipped.push(path.clone());
            }
        }
    }

    let combined_area = area_per_file_km2.map(|a| a * files.len() as f64);
    StatsSummary {
        combined: DetectionStatistics::from_records(&all, combined_area),
        files,
        skipped,
    }
}

/// Summarize a single candidate table, failing if it cannot be read.
pub fn summarize_file(path: &Path, area_km2: Option<f64>) -> Result<DetectionStatistics> {
    let records = read_candidates_csv(path)?;
    Ok(DetectionStatistics::from_records(&records, area_km2))
}

/// One metric compared across two datasets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricComparison {
    pub metric: String,
    pub baseline: f64,
    pub reference: f64,
    /// `reference - baseline`
    pub difference: f64,
    /// `reference / baseline`, absent when the baseline is zero.
    pub ratio: Option<f64>,
}

impl MetricComparison {
    fn new(metric: &str, baseline: f64, reference: f64) -> Self {
        Self {
            metric: metric.to_string(),
            baseline,
            reference,
            difference: reference - baseline,
            ratio: (baseline != 0.0).then(|| reference / baseline),
        }
    }
}

/// Side-by-side comparison of two crater populations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsComparison {
    pub metrics: Vec<MetricComparison>,
}

impl StatsComparison {
    /// Compare `reference` against `baseline`.
    ///
    /// Density is included only when both sides know their area.
    pub fn between(baseline: &DetectionStatistics, reference: &DetectionStatistics) -> Self {
        let mut metrics = vec![
            MetricComparison::new(
                "total_craters",
                baseline.count as f64,
                reference.count as f64,
            ),
            MetricComparison::new(
                "mean_diameter_km",
                baseline.mean_diameter_km,
                reference.mean_diameter_km,
            ),
            MetricComparison::new(
                "median_diameter_km",
                baseline.median_diameter_km,
                reference.median_diameter_km,
            ),
            MetricComparison::new(
                "mean_depth_km",
                baseline.mean_depth_km,
                reference.mean_depth_km,
            ),
        ];
        if let (Some(b), Some(r)) = (baseline.density_per_km2, reference.density_per_km2) {
            metrics.push(MetricComparison::new("density_per_km2", b, r));
        }
        Self { metrics }
    }

    /// Look up a metric by name.
    pub fn metric(&self, name: &str) -> Option<&MetricComparison> {
        self.metrics.iter().find(|m| m.metric == name)
    }
}
