#![forbid(unsafe_code)]

//! Library side of tubegrab: URL validation, the extractor seam, scratch
//! directory bookkeeping, and the two request flows (listing and download)
//! that the `tubegrab` server binary wires into HTTP routes.

pub mod config;
pub mod download;
pub mod error;
pub mod extractor;
pub mod formats;
pub mod jobs;
pub mod lister;
pub mod security;
pub mod video_url;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use error::FetchError;
pub use extractor::{Extractor, YtDlp};
pub use formats::{FormatDescriptor, MediaInfo};
pub use video_url::VideoUrl;
pub use workspace::{ScratchDir, Workspace};
