#![forbid(unsafe_code)]

use std::{fmt, str::FromStr};

use url::Url;

use crate::error::FetchError;

/// Hosts the extractor is allowed to be pointed at. Subdomains are accepted
/// (`www.`, `m.`, `music.`).
const SUPPORTED_HOSTS: &[&str] = &["youtube.com", "youtu.be"];

/// A video page URL that passed local validation. Constructing one never
/// touches the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoUrl(Url);

impl VideoUrl {
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FetchError::invalid("Missing url"));
        }

        // Links pasted without a scheme (`youtu.be/abc`) are common.
        let candidate = if has_scheme(trimmed) {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };

        let url = Url::parse(&candidate).map_err(|_| FetchError::invalid("not a valid URL"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::invalid("not a valid URL"));
        }

        let host = url
            .host_str()
            .map(|host| host.to_ascii_lowercase())
            .ok_or_else(|| FetchError::invalid("not a valid URL"))?;
        if !is_supported_host(&host) || url.path().len() <= 1 {
            return Err(FetchError::invalid("Only YouTube URLs are supported"));
        }

        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// True when `raw` starts with `scheme://`. A `://` further in (a URL inside
/// the query string) does not count.
fn has_scheme(raw: &str) -> bool {
    raw.split_once("://").is_some_and(|(scheme, _)| {
        scheme.starts_with(|ch: char| ch.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
    })
}

fn is_supported_host(host: &str) -> bool {
    SUPPORTED_HOSTS.iter().any(|supported| {
        host == *supported
            || host
                .strip_suffix(supported)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

impl FromStr for VideoUrl {
    type Err = FetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl fmt::Display for VideoUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invalid(raw: &str, expected: &str) {
        match VideoUrl::parse(raw) {
            Err(FetchError::InvalidInput(message)) => assert_eq!(message, expected, "{raw}"),
            other => panic!("expected InvalidInput for {raw:?}, got {other:?}"),
        }
    }

    #[test]
    fn accepts_watch_and_short_links() {
        let url = VideoUrl::parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
        assert_eq!(url.as_str(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert!(VideoUrl::parse("https://youtu.be/dQw4w9WgXcQ").is_ok());
        assert!(VideoUrl::parse("http://m.youtube.com/shorts/abc").is_ok());
        assert!(VideoUrl::parse("https://music.youtube.com/watch?v=x").is_ok());
    }

    #[test]
    fn adds_missing_scheme() {
        let url = VideoUrl::parse("  youtu.be/dQw4w9WgXcQ ").unwrap();
        assert_eq!(url.as_str(), "https://youtu.be/dQw4w9WgXcQ");
    }

    #[test]
    fn adds_missing_scheme_when_query_embeds_a_url() {
        let url =
            VideoUrl::parse("youtube.com/watch?v=abc&feature=share&u=https://x.test").unwrap();
        assert_eq!(
            url.as_str(),
            "https://youtube.com/watch?v=abc&feature=share&u=https://x.test"
        );
        assert!(VideoUrl::parse("www.youtube.com/watch?v=abc&next=http://a.b/c").is_ok());
    }

    #[test]
    fn scheme_detection_only_looks_at_the_prefix() {
        assert!(has_scheme("https://youtu.be/x"));
        assert!(has_scheme("HTTP://youtu.be/x"));
        assert!(!has_scheme("youtu.be/x?u=https://a.b"));
        assert!(!has_scheme("://youtu.be/x"));
        assert!(!has_scheme("youtu.be/x"));
    }

    #[test]
    fn rejects_empty_input() {
        assert_invalid("", "Missing url");
        assert_invalid("   ", "Missing url");
    }

    #[test]
    fn rejects_garbage() {
        assert_invalid("not a url", "not a valid URL");
        assert_invalid("ftp://youtube.com/watch?v=x", "not a valid URL");
    }

    #[test]
    fn rejects_other_hosts() {
        assert_invalid("https://vimeo.com/12345", "Only YouTube URLs are supported");
        assert_invalid(
            "https://notyoutube.com/watch?v=x",
            "Only YouTube URLs are supported",
        );
        assert_invalid(
            "https://youtube.com.evil.test/watch?v=x",
            "Only YouTube URLs are supported",
        );
    }

    #[test]
    fn rejects_bare_host() {
        assert_invalid("https://www.youtube.com/", "Only YouTube URLs are supported");
    }

    #[test]
    fn parses_through_from_str() {
        let url: VideoUrl = "youtube.com/watch?v=abc".parse().unwrap();
        assert_eq!(url.to_string(), "https://youtube.com/watch?v=abc");
    }
}
