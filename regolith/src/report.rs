//! Flat-file outputs: candidate tables, statistics records and overlays.
//!
//! Every writer goes through a temporary file in the destination directory
//! and renames it into place, so a reader never sees a partial file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::detect::CraterCandidate;
use crate::error::Result;
use crate::stats::{DetectionStatistics, StatsComparison, StatsSummary};

/// One row of a candidate table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CraterRecord {
    pub diameter_km: f64,
    pub circularity: f64,
    pub depth_km: f64,
    pub row: f64,
    pub column: f64,
}

impl From<&CraterCandidate> for CraterRecord {
    fn from(c: &CraterCandidate) -> Self {
        Self {
            diameter_km: c.diameter_km,
            circularity: c.circularity,
            depth_km: c.depth_km,
            row: c.row,
            column: c.column,
        }
    }
}

/// Conventional output names for one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub candidates_csv: PathBuf,
    pub stats_json: PathBuf,
    pub overlay_png: PathBuf,
    pub mesh_obj: PathBuf,
    pub mesh_glb: PathBuf,
}

impl OutputPaths {
    /// Paths under `dir` named after `stem` (e.g. `lat-30_lon000`).
    pub fn new(dir: &Path, stem: &str) -> Self {
        Self {
            candidates_csv: dir.join(format!("{}_craters.csv", stem)),
            stats_json: dir.join(format!("{}_stats.json", stem)),
            overlay_png: dir.join(format!("{}_detection.png", stem)),
            mesh_obj: dir.join(format!("{}.obj", stem)),
            mesh_glb: dir.join(format!("{}.glb", stem)),
        }
    }
}

/// Write through a temporary sibling of `path`, then rename into place.
pub(crate) fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> Result<()>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        write(&mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Write one row per candidate with a header line.
pub fn write_candidates_csv(path: &Path, records: &[CraterRecord]) -> Result<()> {
    write_atomic(path, |w| {
        let mut csv = csv::Writer::from_writer(w);
        if records.is_empty() {
            csv.write_record(["diameter_km", "circularity", "depth_km", "row", "column"])?;
        }
        for record in records {
            csv.serialize(record)?;
        }
        csv.flush()?;
        Ok(())
    })
}

/// Read a candidate table written by [`write_candidates_csv`].
pub fn read_candidates_csv(path: &Path) -> Result<Vec<CraterRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

/// Write statistics as pretty-printed JSON.
pub fn write_stats_json(path: &Path, stats: &DetectionStatistics) -> Result<()> {
    write_atomic(path, |w| {
        serde_json::to_writer_pretty(&mut *w, stats)?;
        writeln!(w)?;
        Ok(())
    })
}

/// Read statistics written by [`write_stats_json`].
pub fn read_stats_json(path: &Path) -> Result<DetectionStatistics> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

/// Encode the overlay as PNG.
pub fn write_overlay_png(path: &Path, overlay: &RgbImage) -> Result<()> {
    write_atomic(path, |w| {
        overlay.write_to(w, ImageFormat::Png)?;
        Ok(())
    })
}

#[derive(Serialize)]
struct SummaryRow<'a> {
    source: &'a str,
    latitude: Option<i32>,
    longitude: Option<i32>,
    total_craters: usize,
    mean_diameter_km: f64,
    median_diameter_km: f64,
    min_diameter_km: f64,
    max_diameter_km: f64,
    mean_depth_km: f64,
    median_depth_km: f64,
    min_depth_km: f64,
    max_depth_km: f64,
    mean_circularity: f64,
    density_per_km2: Option<f64>,
}

impl<'a> SummaryRow<'a> {
    fn new(source: &'a str, cell: Option<(i32, i32)>, s: &DetectionStatistics) -> Self {
        Self {
            source,
            latitude: cell.map(|c| c.0),
            longitude: cell.map(|c| c.1),
            total_craters: s.count,
            mean_diameter_km: s.mean_diameter_km,
            median_diameter_km: s.median_diameter_km,
            min_diameter_km: s.min_diameter_km,
            max_diameter_km: s.max_diameter_km,
            mean_depth_km: s.mean_depth_km,
            median_depth_km: s.median_depth_km,
            min_depth_km: s.min_depth_km,
            max_depth_km: s.max_depth_km,
            mean_circularity: s.mean_circularity,
            density_per_km2: s.density_per_km2,
        }
    }
}

/// Write one row per file plus a final `combined` row.
pub fn write_summary_csv(path: &Path, summary: &StatsSummary) -> Result<()> {
    let sources: Vec<String> = summary
        .files
        .iter()
        .map(|f| f.path.display().to_string())
        .collect();
    write_atomic(path, |w| {
        let mut csv = csv::Writer::from_writer(w);
        for (file, source) in summary.files.iter().zip(&sources) {
            csv.serialize(SummaryRow::new(source, file.cell, &file.stats))?;
        }
        csv.serialize(SummaryRow::new("combined", None, &summary.combined))?;
        csv.flush()?;
        Ok(())
    })
}

/// Write one row per compared metric.
pub fn write_comparison_csv(path: &Path, comparison: &StatsComparison) -> Result<()> {
    write_atomic(path, |w| {
        let mut csv = csv::Writer::from_writer(w);
        for metric in &comparison.metrics {
            csv.serialize(metric)?;
        }
        csv.flush()?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::summarize_files;
    use tempfile::TempDir;

    fn records() -> Vec<CraterRecord> {
        vec![
            CraterRecord {
                diameter_km: 1.5,
                circularity: 0.82,
                depth_km: 0.3,
                row: 120.5,
                column: 88.0,
            },
            CraterRecord {
                diameter_km: 4.25,
                circularity: 0.91,
                depth_km: 0.85,
                row: 300.0,
                column: 42.25,
            },
        ]
    }

    #[test]
    fn test_candidates_csv_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lat-30_lon000_craters.csv");
        write_candidates_csv(&path, &records()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(header, "diameter_km,circularity,depth_km,row,column");
        assert_eq!(text.lines().count(), 3);

        assert_eq!(read_candidates_csv(&path).unwrap(), records());
    }

    #[test]
    fn test_empty_candidates_csv_has_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.csv");
        write_candidates_csv(&path, &[]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim(), "diameter_km,circularity,depth_km,row,column");
        assert!(read_candidates_csv(&path).unwrap().is_empty());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("stats.json");
        let stats = DetectionStatistics::from_records(&records(), Some(50.0));
        write_stats_json(&path, &stats).unwrap();

        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(read_stats_json(&path).unwrap(), stats);
    }

    #[test]
    fn test_failed_write_keeps_previous_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keep.csv");
        std::fs::write(&path, "previous").unwrap();

        let result = write_atomic(&path, |w| {
            w.write_all(b"partial")?;
            Err(crate::error::RegolithError::malformed("interrupted"))
        });

        assert!(result.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "previous");
    }

    #[test]
    fn test_overlay_png() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("overlay.png");
        let img = RgbImage::from_pixel(8, 4, image::Rgb([255, 0, 0]));
        write_overlay_png(&path, &img).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_summary_csv() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("lat-30_lon060_craters.csv");
        write_candidates_csv(&table, &records()).unwrap();
        let summary = summarize_files(&[table], None);

        let out = dir.path().join("summary.csv");
        write_summary_csv(&out, &summary).unwrap();
        let text = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("source,latitude,longitude,total_craters"));
        assert!(lines[1].contains(",-30,60,2,"));
        assert!(lines[2].starts_with("combined,,,2,"));
    }

    #[test]
    fn test_output_paths() {
        let paths = OutputPaths::new(Path::new("/out"), "lat-30_lon000");
        assert_eq!(paths.candidates_csv, Path::new("/out/lat-30_lon000_craters.csv"));
        assert_eq!(paths.overlay_png, Path::new("/out/lat-30_lon000_detection.png"));
        assert_eq!(paths.mesh_glb, Path::new("/out/lat-30_lon000.glb"));
    }
}
