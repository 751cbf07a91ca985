//! Fetching missing tiles from a remote archive (`download` feature).
//!
//! The THEMIS day-IR 100 m mosaic serves one uncompressed `.pgm` per grid
//! cell under a fixed base URL. Mirrors can serve the same cells from any
//! URL template, optionally gzip- or zip-wrapped.
//!
//! A response only reaches the data directory after it unpacks to a binary
//! PGM whose payload matches its header. Cells the archive does not cover
//! (HTTP 404 and other client errors) fail on the first attempt; server
//! errors, throttling and transport failures are retried with a doubling
//! backoff.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::error::{RegolithError, Result};
use crate::filename::{cell_stem, cell_to_filename};
use crate::report::write_atomic;
use crate::tile::PgmHeader;

/// Base URL of the THEMIS day-IR 100 m mosaic tiles.
pub const THEMIS_100M_BASE_URL: &str = "https://www.mars.asu.edu/data/thm_dir_100m/large/";

/// Mosaic tiles run to hundreds of megabytes.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// How a served tile is packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// The `.pgm` bytes themselves.
    #[default]
    Raw,
    /// A gzip stream (`.pgm.gz`).
    Gzip,
    /// A zip archive holding one `.pgm` entry (`.pgm.zip`).
    Zip,
}

impl Encoding {
    /// Infer the packing from the final extension of a URL or file name.
    pub fn from_suffix(name: &str) -> Self {
        let name = name.rsplit('/').next().unwrap_or(name);
        match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
            Some(ext) if ext == "gz" => Encoding::Gzip,
            Some(ext) if ext == "zip" => Encoding::Zip,
            _ => Encoding::Raw,
        }
    }

    fn unpack(self, payload: &[u8]) -> std::result::Result<Vec<u8>, String> {
        match self {
            Encoding::Raw => Ok(payload.to_vec()),
            Encoding::Gzip => {
                let mut tile = Vec::new();
                GzDecoder::new(payload)
                    .read_to_end(&mut tile)
                    .map_err(|e| format!("corrupt gzip stream: {}", e))?;
                Ok(tile)
            }
            Encoding::Zip => unzip_pgm(payload),
        }
    }
}

/// Where missing cells are fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Archive {
    /// `THEMIS_100M_BASE_URL` followed by the tile file name.
    #[default]
    Themis100m,
    /// Any host laid out by a URL template.
    ///
    /// Placeholders: `{filename}` (`lat-30_lon000.pgm`), `{stem}`
    /// (`lat-30_lon000`), `{lat}` (`-30`) and `{lon}` (`000`).
    Mirror {
        url_template: String,
        encoding: Encoding,
    },
}

impl Archive {
    /// URL serving a cell, `None` when a mirror has no template.
    pub fn url_for(&self, lat: i32, lon: i32) -> Option<String> {
        match self {
            Archive::Themis100m => Some(format!(
                "{}{}",
                THEMIS_100M_BASE_URL,
                cell_to_filename(lat, lon)
            )),
            Archive::Mirror { url_template, .. } if url_template.is_empty() => None,
            Archive::Mirror { url_template, .. } => Some(
                url_template
                    .replace("{filename}", &cell_to_filename(lat, lon))
                    .replace("{stem}", &cell_stem(lat, lon))
                    .replace("{lat}", &lat.to_string())
                    .replace("{lon}", &format!("{:03}", lon)),
            ),
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            Archive::Themis100m => Encoding::Raw,
            Archive::Mirror { encoding, .. } => *encoding,
        }
    }
}

/// When and how often to try a cell again after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Requests per cell, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Wait before the first retry; doubled for every later one.
    pub initial_backoff_ms: u64,
    /// Ceiling on any single wait.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Wait before retry number `retry` (1 for the first retry).
    pub fn backoff(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << doublings)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Settings for fetching missing tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    pub archive: Archive,
    /// Whole-request timeout in seconds.
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            archive: Archive::default(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
        }
    }
}

impl DownloadConfig {
    /// Fetch from the THEMIS 100 m mosaic.
    pub fn themis() -> Self {
        Self::default()
    }

    /// Fetch from a mirror, inferring the packing from the template suffix.
    pub fn mirror(url_template: impl Into<String>) -> Self {
        let url_template = url_template.into();
        let encoding = Encoding::from_suffix(&url_template);
        Self::mirror_with_encoding(url_template, encoding)
    }

    /// Fetch from a mirror whose URLs don't reveal the packing.
    pub fn mirror_with_encoding(url_template: impl Into<String>, encoding: Encoding) -> Self {
        Self {
            archive: Archive::Mirror {
                url_template: url_template.into(),
                encoding,
            },
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Outcome of a single request.
enum Attempt {
    /// Tile stored; bytes written.
    Stored(usize),
    /// Worth another request after a backoff.
    Transient(RegolithError),
    /// Another request would fail the same way.
    Permanent(RegolithError),
}

/// Blocking HTTP fetcher that writes validated tiles into a directory.
pub struct Downloader {
    client: Client,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| failure("", format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Make sure `dest_dir` holds the tile for a cell and return its path.
    ///
    /// A tile already on disk is returned without any request.
    ///
    /// # Errors
    ///
    /// [`RegolithError::DownloadFailed`] when the archive lacks the cell,
    /// the payload is not a valid tile, or every attempt failed.
    pub fn download_tile(&self, lat: i32, lon: i32, dest_dir: &Path) -> Result<PathBuf> {
        let filename = cell_to_filename(lat, lon);
        let dest = dest_dir.join(&filename);
        if dest.exists() {
            debug!(tile = %filename, "tile already on disk");
            return Ok(dest);
        }

        let url = self
            .config
            .archive
            .url_for(lat, lon)
            .ok_or_else(|| failure(&filename, "mirror has no URL template"))?;

        let policy = self.config.retry;
        let mut retry = 0;
        loop {
            info!(tile = %filename, %url, retry, "fetching tile");
            match self.attempt(&url, &filename, &dest) {
                Attempt::Stored(bytes) => {
                    info!(tile = %filename, bytes, "tile stored");
                    return Ok(dest);
                }
                Attempt::Permanent(e) => return Err(e),
                Attempt::Transient(e) => {
                    retry += 1;
                    if retry >= policy.max_attempts.max(1) {
                        return Err(e);
                    }
                    let wait = policy.backoff(retry);
                    warn!(
                        tile = %filename,
                        error = %e,
                        wait_ms = wait.as_millis() as u64,
                        "transient fetch failure, retrying"
                    );
                    std::thread::sleep(wait);
                }
            }
        }
    }

    fn attempt(&self, url: &str, filename: &str, dest: &Path) -> Attempt {
        let response = match self.client.get(url).send() {
            Ok(response) => response,
            Err(e) => return Attempt::Transient(e.into()),
        };

        let status = response.status();
        if !status.is_success() {
            let reason = if status == StatusCode::NOT_FOUND {
                "archive has no tile for this cell (HTTP 404)".to_string()
            } else {
                format!("HTTP {}", status)
            };
            let e = failure(filename, reason);
            return if is_transient(status) {
                Attempt::Transient(e)
            } else {
                Attempt::Permanent(e)
            };
        }

        let payload = match response.bytes() {
            Ok(payload) => payload,
            Err(e) => return Attempt::Transient(e.into()),
        };
        let tile = match checked_tile(self.config.archive.encoding(), &payload) {
            Ok(tile) => tile,
            Err(reason) => return Attempt::Permanent(failure(filename, reason)),
        };

        match write_atomic(dest, |w| Ok(w.write_all(&tile)?)) {
            Ok(()) => Attempt::Stored(tile.len()),
            Err(e) => Attempt::Permanent(e),
        }
    }
}

fn failure(filename: &str, reason: impl Into<String>) -> RegolithError {
    RegolithError::DownloadFailed {
        filename: filename.to_string(),
        reason: reason.into(),
    }
}

/// Statuses a later request can plausibly get past.
fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Unpack a response body and confirm it is a complete binary PGM.
fn checked_tile(encoding: Encoding, payload: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let tile = encoding.unpack(payload)?;
    let header = PgmHeader::parse(&tile).map_err(|e| format!("not a PGM tile: {}", e))?;
    let expected = header
        .sample_bytes()
        .ok_or_else(|| "declared dimensions overflow".to_string())?;
    let found = tile.len().saturating_sub(header.data_offset);
    if found != expected {
        return Err(format!(
            "truncated tile: {}x{} needs {} sample bytes, got {}",
            header.width, header.height, expected, found
        ));
    }
    Ok(tile)
}

/// The first `.pgm` entry of an in-memory zip archive.
fn unzip_pgm(payload: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let mut archive =
        ZipArchive::new(Cursor::new(payload)).map_err(|e| format!("corrupt zip archive: {}", e))?;
    let name = archive
        .file_names()
        .find(|name| name.to_ascii_lowercase().ends_with(".pgm"))
        .map(str::to_owned)
        .ok_or_else(|| "zip archive holds no .pgm entry".to_string())?;

    let mut entry = archive
        .by_name(&name)
        .map_err(|e| format!("unreadable zip entry {}: {}", name, e))?;
    let mut tile = Vec::new();
    entry
        .read_to_end(&mut tile)
        .map_err(|e| format!("unreadable zip entry {}: {}", name, e))?;
    Ok(tile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::encode_pgm;
    use flate2::write::GzEncoder;
    use std::fs;
    use tempfile::TempDir;

    fn small_pgm() -> Vec<u8> {
        encode_pgm(4, 3, 255, &[7; 12], None).unwrap()
    }

    fn zipped(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buffer));
            let options = zip::write::SimpleFileOptions::default();
            for (name, data) in entries {
                zip.start_file(*name, options).unwrap();
                zip.write_all(data).unwrap();
            }
            zip.finish().unwrap();
        }
        buffer
    }

    #[test]
    fn test_themis_url() {
        assert_eq!(
            Archive::Themis100m.url_for(-30, 0).unwrap(),
            "https://www.mars.asu.edu/data/thm_dir_100m/large/lat-30_lon000.pgm"
        );
    }

    #[test]
    fn test_mirror_url_placeholders() {
        let config = DownloadConfig::mirror("https://mirror.test/{lat}/{lon}/{stem}.pgm.gz");
        assert_eq!(config.archive.encoding(), Encoding::Gzip);
        assert_eq!(
            config.archive.url_for(30, 60).unwrap(),
            "https://mirror.test/30/060/lat30_lon060.pgm.gz"
        );

        let config = DownloadConfig::mirror("https://mirror.test/{filename}");
        assert_eq!(config.archive.encoding(), Encoding::Raw);
        assert_eq!(
            config.archive.url_for(-60, 300).unwrap(),
            "https://mirror.test/lat-60_lon300.pgm"
        );
    }

    #[test]
    fn test_encoding_from_suffix() {
        assert_eq!(Encoding::from_suffix("lat0_lon000.pgm"), Encoding::Raw);
        assert_eq!(Encoding::from_suffix("lat0_lon000.PGM.GZ"), Encoding::Gzip);
        assert_eq!(Encoding::from_suffix("https://m.test/x.pgm.zip"), Encoding::Zip);
        // Dots in the host don't count as a suffix
        assert_eq!(Encoding::from_suffix("https://files.gz.test/tile"), Encoding::Raw);
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 250,
            max_backoff_ms: 1_500,
        };
        let waits: Vec<u64> = (1..=5).map(|r| policy.backoff(r).as_millis() as u64).collect();
        assert_eq!(waits, vec![250, 500, 1_000, 1_500, 1_500]);
        assert_eq!(policy.backoff(u32::MAX).as_millis(), 1_500);
    }

    #[test]
    fn test_missing_cell_is_not_retried() {
        assert!(!is_transient(StatusCode::NOT_FOUND));
        assert!(!is_transient(StatusCode::FORBIDDEN));
        assert!(is_transient(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient(StatusCode::REQUEST_TIMEOUT));
    }

    #[test]
    fn test_error_page_is_rejected() {
        let page = b"<html><body>Not Found</body></html>";
        let reason = checked_tile(Encoding::Raw, page).unwrap_err();
        assert!(reason.contains("not a PGM tile"), "{}", reason);
    }

    #[test]
    fn test_truncated_tile_is_rejected() {
        let mut tile = small_pgm();
        tile.truncate(tile.len() - 2);
        let reason = checked_tile(Encoding::Raw, &tile).unwrap_err();
        assert!(reason.contains("needs 12 sample bytes, got 10"), "{}", reason);
    }

    #[test]
    fn test_gzip_tile_is_unpacked() {
        let mut gz = GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&small_pgm()).unwrap();
        let payload = gz.finish().unwrap();

        assert_eq!(checked_tile(Encoding::Gzip, &payload).unwrap(), small_pgm());
        assert!(checked_tile(Encoding::Gzip, &small_pgm()).is_err());
    }

    #[test]
    fn test_zip_tile_entry_is_found() {
        let pgm = small_pgm();
        let readme: &[u8] = b"THEMIS mosaic";
        let payload = zipped(&[("README.txt", readme), ("lat0_lon000.PGM", &pgm[..])]);
        assert_eq!(checked_tile(Encoding::Zip, &payload).unwrap(), pgm);

        let payload = zipped(&[("README.txt", readme)]);
        let reason = checked_tile(Encoding::Zip, &payload).unwrap_err();
        assert!(reason.contains("no .pgm entry"), "{}", reason);
    }

    #[test]
    fn test_existing_file_is_not_downloaded() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("lat-30_lon000.pgm");
        fs::write(&path, b"cached").unwrap();

        // No template, so any request would fail
        let config = DownloadConfig::mirror("").with_retry(RetryPolicy::once());
        let downloader = Downloader::new(config).unwrap();
        assert_eq!(downloader.download_tile(-30, 0, temp_dir.path()).unwrap(), path);
        assert_eq!(fs::read(&path).unwrap(), b"cached");
    }

    #[test]
    fn test_mirror_without_template_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let downloader = Downloader::new(DownloadConfig::mirror("")).unwrap();

        match downloader.download_tile(0, 60, temp_dir.path()) {
            Err(RegolithError::DownloadFailed { filename, reason }) => {
                assert_eq!(filename, "lat0_lon060.pgm");
                assert!(reason.contains("no URL template"));
            }
            other => panic!("Expected DownloadFailed, got {:?}", other),
        }
        assert!(!temp_dir.path().join("lat0_lon060.pgm").exists());
    }

    #[test]
    fn test_config_builder() {
        let config = DownloadConfig::themis()
            .with_timeout(60)
            .with_retry(RetryPolicy::once());
        assert_eq!(config.archive, Archive::Themis100m);
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.retry.max_attempts, 1);
    }
}
