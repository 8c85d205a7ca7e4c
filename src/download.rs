#![forbid(unsafe_code)]

//! Download orchestration: one scratch directory per request, one extractor
//! run, one finished file handed to the HTTP layer together with the guard
//! that deletes it.

use std::path::{Path, PathBuf};

use mime_guess::{MimeGuess, mime::Mime};
use tokio::fs::File;
use tracing::{info, warn};

use crate::{
    error::FetchError,
    extractor::Extractor,
    video_url::VideoUrl,
    workspace::{ScratchDir, Workspace},
};

const MAX_FORMAT_ID_LEN: usize = 256;

/// A finished download waiting to be served. Dropping it (or the stream built
/// from it) removes the file and its directory.
#[derive(Debug)]
pub struct FetchedMedia {
    path: PathBuf,
    size: u64,
    scratch: ScratchDir,
}

impl FetchedMedia {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// File name offered to the browser.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "download".to_string())
    }

    pub fn content_type(&self) -> Mime {
        MimeGuess::from_path(&self.path).first_or_octet_stream()
    }

    /// Opens the file for streaming. The returned guard must be kept alive
    /// until the last byte is sent.
    pub async fn open(self) -> Result<(File, ScratchDir), FetchError> {
        let file = File::open(&self.path)
            .await
            .map_err(|err| FetchError::storage("opening downloaded file", err))?;
        Ok((file, self.scratch))
    }
}

/// Rejects format selectors that cannot be a yt-dlp format id.
pub fn validate_format_id(format_id: &str) -> Result<&str, FetchError> {
    let trimmed = format_id.trim();
    if trimmed.is_empty() {
        return Err(FetchError::invalid("Missing format_id"));
    }
    if trimmed.len() > MAX_FORMAT_ID_LEN || trimmed.chars().any(char::is_control) {
        return Err(FetchError::invalid("invalid format_id"));
    }
    Ok(trimmed)
}

/// Fetches `format_id` of `url` into a fresh scratch directory. On every error
/// path the directory is already gone by the time this returns.
pub async fn fetch(
    extractor: &dyn Extractor,
    workspace: &Workspace,
    url: &VideoUrl,
    format_id: &str,
    cookies: Option<&Path>,
) -> Result<FetchedMedia, FetchError> {
    let format_id = validate_format_id(format_id)?;
    let scratch = workspace.acquire("dl")?;

    let path = match extractor
        .download(url, format_id, scratch.path(), cookies)
        .await
    {
        Ok(path) => path,
        Err(err) => {
            warn!(%url, format_id, kind = err.kind(), "download failed: {err}");
            return Err(err);
        }
    };

    if !path.starts_with(scratch.path()) {
        return Err(FetchError::extraction(
            "extractor reported a file outside its scratch directory",
        ));
    }
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|err| FetchError::storage("reading downloaded file", err))?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(FetchError::extraction("extractor produced an empty file"));
    }

    info!(%url, format_id, bytes = metadata.len(), "download ready");
    Ok(FetchedMedia {
        path,
        size: metadata.len(),
        scratch,
    })
}
