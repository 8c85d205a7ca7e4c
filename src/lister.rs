#![forbid(unsafe_code)]

//! Format listing: validate the URL locally, then ask the extractor once.

use std::path::Path;

use tracing::info;

use crate::{error::FetchError, extractor::Extractor, formats::MediaInfo, video_url::VideoUrl};

/// Lists the servable formats for `raw_url`. Invalid input never reaches the
/// extractor; extractor failures are returned as-is, without retrying.
pub async fn list_formats(
    extractor: &dyn Extractor,
    raw_url: &str,
    cookies: Option<&Path>,
) -> Result<MediaInfo, FetchError> {
    let url = VideoUrl::parse(raw_url)?;
    list_formats_for(extractor, &url, cookies).await
}

/// Same as [`list_formats`] for an already validated URL.
pub async fn list_formats_for(
    extractor: &dyn Extractor,
    url: &VideoUrl,
    cookies: Option<&Path>,
) -> Result<MediaInfo, FetchError> {
    let info = extractor.list_formats(url, cookies).await?;
    if info.formats.is_empty() {
        return Err(FetchError::extraction("no downloadable formats found"));
    }
    info!(%url, formats = info.formats.len(), "listed formats");
    Ok(info)
}
