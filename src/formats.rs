#![forbid(unsafe_code)]

//! Format listing types, plus the subset of yt-dlp's `--dump-single-json`
//! payload needed to build them.

use serde::{Deserialize, Serialize};

/// Containers a browser can save and play without remuxing. Everything else
/// (storyboards, HLS manifests, 3gp) is left out of listings.
pub const SERVABLE_EXTENSIONS: &[&str] = &["mp4", "webm", "m4a", "mp3"];

/// One downloadable encoding of a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub id: String,
    pub label: String,
    pub ext: String,
    /// Exact size when the extractor knows it, otherwise its estimate.
    pub filesize_approx: Option<u64>,
    pub has_video: bool,
    pub has_audio: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tbr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_note: Option<String>,
}

/// Listing response: a little page metadata for the UI plus the formats in
/// the extractor's own order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub formats: Vec<FormatDescriptor>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    format_note: Option<String>,
    width: Option<f64>,
    height: Option<f64>,
    tbr: Option<f64>,
    abr: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    dynamic_range: Option<String>,
}

impl MediaInfo {
    pub(crate) fn from_raw(raw: RawInfo) -> Self {
        Self {
            title: non_blank(raw.title),
            thumbnail: non_blank(raw.thumbnail),
            duration: raw.duration,
            formats: raw
                .formats
                .into_iter()
                .filter_map(FormatDescriptor::from_raw)
                .collect(),
        }
    }
}

impl FormatDescriptor {
    fn from_raw(raw: RawFormat) -> Option<Self> {
        let id = raw.format_id.as_deref().map(str::trim).unwrap_or("");
        if id.is_empty() {
            return None;
        }
        let ext = raw.ext.as_deref()?.trim().to_ascii_lowercase();
        if !SERVABLE_EXTENSIONS.contains(&ext.as_str()) {
            return None;
        }

        let width = raw.width.and_then(to_dimension);
        let height = raw.height.and_then(to_dimension);
        let audio_container = matches!(ext.as_str(), "m4a" | "mp3");
        let has_video = codec_present(raw.vcodec.as_deref())
            .unwrap_or(height.is_some() || !audio_container);
        let has_audio = codec_present(raw.acodec.as_deref()).unwrap_or(true);
        let format_note = non_blank(raw.format_note);
        let label = quality_label(
            height,
            raw.dynamic_range.as_deref(),
            has_video,
            has_audio,
            raw.abr.or(raw.tbr),
        )
        .or_else(|| format_note.clone())
        .unwrap_or_else(|| format!("format {id}"));

        Some(Self {
            id: id.to_string(),
            label,
            ext,
            filesize_approx: raw.filesize.or(raw.filesize_approx).and_then(to_size),
            has_video,
            has_audio,
            width,
            height,
            tbr: raw.tbr,
            vcodec: non_blank(raw.vcodec),
            acodec: non_blank(raw.acodec),
            format_note,
        })
    }
}

/// yt-dlp reports an absent stream as the literal codec `none`; a missing
/// field means it does not know, in which case the caller assumes a muxed
/// file (audio-only for audio containers).
fn codec_present(codec: Option<&str>) -> Option<bool> {
    codec
        .map(str::trim)
        .filter(|codec| !codec.is_empty())
        .map(|codec| !codec.eq_ignore_ascii_case("none"))
}

/// Builds labels such as `1080p HDR`, `720p video only`, or
/// `audio only 130k`.
fn quality_label(
    height: Option<u32>,
    dynamic_range: Option<&str>,
    has_video: bool,
    has_audio: bool,
    bitrate: Option<f64>,
) -> Option<String> {
    let mut parts = Vec::new();
    if has_video {
        if let Some(height) = height {
            parts.push(format!("{height}p"));
        }
        if let Some(range) = dynamic_range
            && !range.is_empty()
            && !range.eq_ignore_ascii_case("sdr")
        {
            parts.push(range.to_string());
        }
        if !has_audio && !parts.is_empty() {
            parts.push("video only".to_string());
        }
    } else if has_audio {
        parts.push("audio only".to_string());
        if let Some(kbps) = bitrate.filter(|kbps| *kbps > 0.0) {
            parts.push(format!("{}k", kbps.round() as u64));
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn to_dimension(value: f64) -> Option<u32> {
    (value.is_finite() && value > 0.0 && value <= u32::MAX as f64).then(|| value.round() as u32)
}

fn to_size(value: f64) -> Option<u64> {
    (value.is_finite() && value > 0.0).then(|| value.round() as u64)
}
