#![forbid(unsafe_code)]

//! In-process extractor used by the library's unit tests.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    error::FetchError,
    extractor::Extractor,
    formats::{FormatDescriptor, MediaInfo},
    video_url::VideoUrl,
};

pub(crate) struct FakeExtractor {
    pub info: MediaInfo,
    pub fail_with: Option<String>,
    pub payload: Vec<u8>,
    pub calls: AtomicUsize,
    pub seen_cookies: Mutex<Vec<Option<PathBuf>>>,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self {
            info: sample_info(),
            fail_with: None,
            payload: b"fake-video".to_vec(),
            calls: AtomicUsize::new(0),
            seen_cookies: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self, cookies: Option<&Path>) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_cookies
            .lock()
            .push(cookies.map(Path::to_path_buf));
        match &self.fail_with {
            Some(message) => Err(FetchError::extraction(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn list_formats(
        &self,
        _url: &VideoUrl,
        cookies: Option<&Path>,
    ) -> Result<MediaInfo, FetchError> {
        self.record(cookies)?;
        Ok(self.info.clone())
    }

    async fn download(
        &self,
        _url: &VideoUrl,
        format_id: &str,
        destination: &Path,
        cookies: Option<&Path>,
    ) -> Result<PathBuf, FetchError> {
        // Leave a partial file behind first so cleanup is exercised on
        // failures too.
        fs::write(destination.join("clip.mp4.part"), b"partial").unwrap();
        self.record(cookies)?;
        let path = destination.join(format!("clip-{format_id}.mp4"));
        fs::write(&path, &self.payload).unwrap();
        Ok(path)
    }
}

pub(crate) fn sample_format(id: &str, ext: &str) -> FormatDescriptor {
    FormatDescriptor {
        id: id.to_string(),
        label: "360p".to_string(),
        ext: ext.to_string(),
        filesize_approx: Some(1024),
        has_video: true,
        has_audio: true,
        width: Some(640),
        height: Some(360),
        tbr: None,
        vcodec: Some("avc1".to_string()),
        acodec: Some("mp4a".to_string()),
        format_note: None,
    }
}

pub(crate) fn sample_info() -> MediaInfo {
    MediaInfo {
        title: Some("Sample".to_string()),
        thumbnail: None,
        duration: Some(10.0),
        formats: vec![sample_format("18", "mp4"), sample_format("43", "webm")],
    }
}

pub(crate) fn sample_url() -> VideoUrl {
    VideoUrl::parse("https://www.youtube.com/watch?v=sample").unwrap()
}
