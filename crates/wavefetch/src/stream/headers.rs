//! Response header interpretation
//!
//! Turns a status code and header map into what the source needs to know:
//! total length, whether byte ranges work, the ICY metadata interval and a
//! hint about the audio container. Shoutcast v1 servers answer `ICY 200 OK`
//! which HTTP clients do not recognise; for those the header block arrives
//! inside the body and is recovered with [`sniff_icy_response`].

use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE,
};
use serde::Serialize;

/// Container/codec guess from `Content-Type` or the URL extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioTypeHint {
    Mp3,
    Aac,
    Mp4,
    Ogg,
    Opus,
    Flac,
    Wav,
    #[default]
    Unknown,
}

impl AudioTypeHint {
    /// Hint from a MIME type; parameters such as `charset` are ignored.
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "audio/mpeg" | "audio/mp3" | "audio/mpeg3" | "audio/x-mp3" => Self::Mp3,
            "audio/aac" | "audio/aacp" | "audio/x-aac" => Self::Aac,
            "audio/mp4" | "audio/x-m4a" | "audio/m4a" | "video/mp4" | "audio/x-mp4" => Self::Mp4,
            "audio/ogg" | "application/ogg" | "audio/vorbis" => Self::Ogg,
            "audio/opus" => Self::Opus,
            "audio/flac" | "audio/x-flac" => Self::Flac,
            "audio/wav" | "audio/x-wav" | "audio/wave" => Self::Wav,
            _ => Self::Unknown,
        }
    }

    /// Hint from the path extension, ignoring query and fragment.
    pub fn from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        let path = lower
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        let Some((rest, ext)) = path.rsplit_once('.') else {
            return Self::Unknown;
        };
        // "http://host.mp3" has no path; the dot belongs to the host.
        if rest.ends_with('/') || ext.contains('/') {
            return Self::Unknown;
        }
        match ext {
            "mp3" => Self::Mp3,
            "aac" | "adts" => Self::Aac,
            "m4a" | "mp4" | "m4b" => Self::Mp4,
            "ogg" | "oga" => Self::Ogg,
            "opus" => Self::Opus,
            "flac" => Self::Flac,
            "wav" => Self::Wav,
            _ => Self::Unknown,
        }
    }

    /// Content type first, URL extension as fallback.
    pub fn detect(url: &str, content_type: Option<&str>) -> Self {
        match content_type.map(Self::from_content_type) {
            Some(hint) if hint != Self::Unknown => hint,
            _ => Self::from_url(url),
        }
    }

    pub fn is_mp4(self) -> bool {
        self == Self::Mp4
    }
}

/// Classification of one HTTP response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedHeaderOutput {
    pub file_length: Option<u64>,
    pub audio_type_hint: AudioTypeHint,
    /// `icy-metaint`, 0 when absent
    pub metadata_step: u32,
    pub supports_range_requests: bool,
    pub content_type: Option<String>,
    /// `icy-name`
    pub station_name: Option<String>,
    /// `icy-br` in kbit/s
    pub bitrate: Option<u32>,
}

/// Reads response headers. Lookups are case-insensitive (`HeaderMap`).
pub struct ResponseHeaderInterpreter;

impl ResponseHeaderInterpreter {
    /// `None` when there are no headers at all, which means the real header
    /// block (if any) is still inside the body.
    pub fn parse(status: u16, headers: &HeaderMap) -> Option<ParsedHeaderOutput> {
        if headers.is_empty() {
            return None;
        }

        let file_length = match status {
            206 | 416 => header_str(headers, CONTENT_RANGE.as_str()).and_then(content_range_total),
            _ => header_str(headers, CONTENT_LENGTH.as_str()).and_then(|v| v.trim().parse().ok()),
        };

        let supports_range_requests = status == 206
            || header_str(headers, ACCEPT_RANGES.as_str())
                .is_some_and(|v| !v.trim().eq_ignore_ascii_case("none"));

        let metadata_step = header_str(headers, "icy-metaint")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        let content_type = header_str(headers, CONTENT_TYPE.as_str()).map(str::to_string);
        let audio_type_hint = content_type
            .as_deref()
            .map(AudioTypeHint::from_content_type)
            .unwrap_or_default();

        let station_name = header_str(headers, "icy-name")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let bitrate = header_str(headers, "icy-br").and_then(|v| v.trim().parse().ok());

        Some(ParsedHeaderOutput {
            file_length,
            audio_type_hint,
            metadata_step,
            supports_range_requests,
            content_type,
            station_name,
            bitrate,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Total from `[bytes ]<start>-<end>/<total>` or `bytes */<total>`.
fn content_range_total(value: &str) -> Option<u64> {
    let value = value.trim();
    let value = value.strip_prefix("bytes").unwrap_or(value);
    let (_, total) = value.rsplit_once('/')?;
    match total.trim() {
        "*" => None,
        total => total.parse().ok(),
    }
}

/// A header block found at the start of a response body
#[derive(Debug, Clone)]
pub struct SniffedHeaders {
    pub status: u16,
    pub headers: HeaderMap,
    /// Bytes to drop from the body, terminator included
    pub header_len: usize,
}

/// Recognise an `ICY 200 OK` / `HTTP/1.x` header block at the start of
/// `body`.
///
/// Returns `None` when the body does not start with a status line or the
/// block is not terminated within `body`.
pub fn sniff_icy_response(body: &[u8]) -> Option<SniffedHeaders> {
    if !(body.starts_with(b"ICY ") || body.starts_with(b"HTTP/")) {
        return None;
    }

    let crlf = find(body, b"\r\n\r\n").map(|p| p + 4);
    let lf = find(body, b"\n\n").map(|p| p + 2);
    let header_len = match (crlf, lf) {
        (Some(a), Some(b)) => a.min(b),
        (a, b) => a.or(b)?,
    };

    let text = String::from_utf8_lossy(&body[..header_len]);
    let mut lines = text.lines();
    let status = lines
        .next()?
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())?;

    let mut headers = HeaderMap::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) else {
            continue;
        };
        headers.append(name, value);
    }

    Some(SniffedHeaders {
        status,
        headers,
        header_len,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
