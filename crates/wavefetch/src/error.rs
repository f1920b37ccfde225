//! Error types for wavefetch
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::mp4::Mp4Error;

/// Main error type for remote audio sources
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("{}", friendly_network_error(.0))]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Server answered with a status the stream cannot continue from.
    #[error("Server error: HTTP {0}")]
    Status(u16),

    /// The MP4 container could not be restructured for streaming.
    #[error("Cannot prepare stream: {0}")]
    Prepare(#[from] Mp4Error),

    #[error("Source is not seekable")]
    NotSeekable,

    #[error("Source closed")]
    Closed,

    #[error("Stream error: {0}")]
    Stream(String),
}

impl SourceError {
    /// Whether the failure is worth retrying once the network cooperates again.
    ///
    /// Connection resets, read timeouts and dropped bodies are transient;
    /// server status codes and container problems are not.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Network(e) => !e.is_builder() && !e.is_status(),
            SourceError::Io(_) | SourceError::Timeout(_) => true,
            SourceError::Status(_)
            | SourceError::Prepare(_)
            | SourceError::NotSeekable
            | SourceError::Closed
            | SourceError::Stream(_) => false,
        }
    }
}

/// Result type alias for wavefetch
pub type Result<T> = std::result::Result<T, SourceError>;

fn friendly_network_error(e: &reqwest::Error) -> String {
    if e.is_builder() {
        if let Some(url) = e.url() {
            return format!("Invalid URL: {url}");
        }
        return "Invalid URL".to_string();
    }
    if e.is_connect() {
        if let Some(url) = e.url() {
            return format!("Could not connect to {}", url.host_str().unwrap_or("server"));
        }
        return "Could not connect to server".to_string();
    }
    if e.is_timeout() {
        return "Connection timed out".to_string();
    }
    if e.is_body() {
        return "Connection dropped while reading response".to_string();
    }
    format!("Network error: {e}")
}
