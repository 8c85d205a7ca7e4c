#![forbid(unsafe_code)]

//! The extractor seam. Everything site-specific (page parsing, signature
//! deciphering, muxing) lives in yt-dlp; this module only knows how to ask it
//! for a format listing and for one download.

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    error::FetchError,
    formats::{MediaInfo, RawInfo},
    video_url::VideoUrl,
};

pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";

/// Output template for downloads. Titles are truncated to 200 bytes so long
/// names stay under common filesystem limits.
const OUTPUT_TEMPLATE: &str = "%(title).200B.%(ext)s";

/// Leftovers yt-dlp may write next to the real output.
const NON_MEDIA_SUFFIXES: &[&str] = &[".part", ".ytdl", ".json", ".temp", ".aria2"];

/// The two capabilities the server consumes from a video extractor.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Reads page metadata and the available formats. Performs network I/O
    /// but writes nothing to disk.
    async fn list_formats(
        &self,
        url: &VideoUrl,
        cookies: Option<&Path>,
    ) -> Result<MediaInfo, FetchError>;

    /// Fetches `format_id` into `destination` and returns the path of the
    /// finished file.
    async fn download(
        &self,
        url: &VideoUrl,
        format_id: &str,
        destination: &Path,
        cookies: Option<&Path>,
    ) -> Result<PathBuf, FetchError>;
}

/// Drives the `yt-dlp` command-line program as a child process. Each call is
/// bounded by a wall-clock timeout and the child is killed if the calling
/// future is dropped (client disconnect, timeout).
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    socket_timeout: Duration,
    probe_timeout: Duration,
    download_timeout: Duration,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            socket_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(120),
            download_timeout: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Runs `yt-dlp --version` so a missing install fails at startup instead
    /// of on the first request.
    pub async fn ensure_available(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| {
                format!("{} is not installed or not in PATH", self.binary.display())
            })?;
        if !output.status.success() {
            bail!(
                "{} is installed but returned {}",
                self.binary.display(),
                output.status
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn command(&self, cookies: Option<&Path>) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--socket-timeout")
            .arg(self.socket_timeout.as_secs().max(1).to_string());
        if let Some(cookies) = cookies {
            command.arg("--cookies").arg(cookies);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run(
        &self,
        mut command: Command,
        limit: Duration,
        label: &str,
    ) -> Result<Output, FetchError> {
        let output = tokio::time::timeout(limit, command.output())
            .await
            .map_err(|_| FetchError::extraction(format!("{label} timed out after {limit:?}")))?
            .map_err(|err| {
                FetchError::extraction(format!(
                    "could not launch {}: {err}",
                    self.binary.display()
                ))
            })?;

        if !output.status.success() {
            let message = extractor_error_message(&output.stderr)
                .unwrap_or_else(|| format!("yt-dlp exited with {}", output.status));
            warn!(label, status = %output.status, "{message}");
            return Err(FetchError::extraction(message));
        }
        Ok(output)
    }
}

impl Default for YtDlp {
    fn default() -> Self {
        Self::new(DEFAULT_YTDLP_BIN)
    }
}

#[async_trait]
impl Extractor for YtDlp {
    async fn list_formats(
        &self,
        url: &VideoUrl,
        cookies: Option<&Path>,
    ) -> Result<MediaInfo, FetchError> {
        let mut command = self.command(cookies);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--")
            .arg(url.as_str());

        let output = self.run(command, self.probe_timeout, "format listing").await?;
        let raw: RawInfo = serde_json::from_slice(&output.stdout).map_err(|err| {
            FetchError::extraction(format!("could not parse yt-dlp metadata: {err}"))
        })?;
        Ok(MediaInfo::from_raw(raw))
    }

    async fn download(
        &self,
        url: &VideoUrl,
        format_id: &str,
        destination: &Path,
        cookies: Option<&Path>,
    ) -> Result<PathBuf, FetchError> {
        let mut command = self.command(cookies);
        command
            .arg("--format")
            .arg(format_id)
            .arg("--output")
            .arg(destination.join(OUTPUT_TEMPLATE))
            .arg("--no-mtime")
            .arg("--print")
            .arg("after_move:filepath")
            .arg("--no-simulate")
            .arg("--")
            .arg(url.as_str());

        let output = self.run(command, self.download_timeout, "download").await?;
        let reported = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(PathBuf::from);

        if let Some(path) = reported
            && path.starts_with(destination)
            && path.is_file()
        {
            return Ok(path);
        }

        debug!(
            destination = %destination.display(),
            "yt-dlp did not report a usable path; scanning destination"
        );
        find_output_file(destination)?
            .ok_or_else(|| FetchError::extraction("yt-dlp finished without producing a file"))
    }
}

/// Picks the largest finished file in `dir`, skipping partial downloads and
/// sidecar files.
pub fn find_output_file(dir: &Path) -> Result<Option<PathBuf>, FetchError> {
    let entries = fs::read_dir(dir)
        .map_err(|err| FetchError::storage(format!("reading {}", dir.display()), err))?;

    let mut best: Option<(u64, PathBuf)> = None;
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if NON_MEDIA_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            continue;
        }
        let size = metadata.len();
        match best {
            Some((best_size, _)) if best_size >= size => {}
            _ => best = Some((size, entry.path())),
        }
    }
    Ok(best.map(|(_, path)| path))
}

/// Prefers yt-dlp's own `ERROR:` line over whatever else ended up on stderr.
fn extractor_error_message(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|line| line.to_string())
}
