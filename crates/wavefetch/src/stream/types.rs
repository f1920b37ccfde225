//! Stream types
//!
//! Types shared between the source worker and its handle.

use std::time::Duration;

use serde::Serialize;

use crate::error::SourceError;
use crate::stream::headers::AudioTypeHint;
use crate::stream::metadata::MetadataBlock;

/// Byte budget of the current response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedContentLength {
    /// Live broadcast or missing length: a clean end is end of stream
    #[default]
    Undefined,
    /// Total length of the (virtual) stream
    Known(u64),
}

impl ExpectedContentLength {
    pub fn known(self) -> Option<u64> {
        match self {
            Self::Known(n) => Some(n),
            Self::Undefined => None,
        }
    }
}

/// Read position as seen by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamPosition {
    /// Offset of the last seek
    pub seek_offset: u64,
    /// Audio bytes delivered since then (after metadata removal)
    pub relative_position: u64,
}

impl StreamPosition {
    pub fn absolute(&self) -> u64 {
        self.seek_offset + self.relative_position
    }

    pub fn reset(&mut self, offset: u64) {
        self.seek_offset = offset;
        self.relative_position = 0;
    }

    pub fn advance(&mut self, bytes: u64) {
        self.relative_position += bytes;
    }
}

/// What the consumer learns once a response is classified
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamDescriptor {
    /// Total stream length; for restructured MP4 this is the virtual length
    pub length: Option<u64>,
    pub seekable: bool,
    pub audio_type: AudioTypeHint,
    /// ICY metadata interval in bytes (0 when absent)
    pub metadata_interval: u32,
    pub content_type: Option<String>,
    pub station_name: Option<String>,
    pub bitrate: Option<u32>,
    /// `moov` was relocated in front of `mdat`
    pub restructured: bool,
}

/// Notifications from a remote source
#[derive(Debug)]
pub enum SourceEvent {
    /// Response classified (sent again if a later response changes it)
    Ready(StreamDescriptor),
    /// ICY metadata block, in stream order
    Metadata(MetadataBlock),
    /// Transient failure while offline; resumes on reconnect
    WaitingForNetwork,
    /// Transient failure; the request is reissued after `delay`
    Retrying { attempt: u32, delay: Duration },
    EndOfStream,
    /// Terminal failure
    Error(SourceError),
}

/// Lifecycle of a remote source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum SourceState {
    Idle = 0,
    Probing = 1,
    Restructuring = 2,
    Streaming = 3,
    /// Request issued at a new offset, waiting for its response
    Seeking = 4,
    Retrying = 5,
    WaitingForNetwork = 6,
    Finished = 7,
    Failed = 8,
    Closed = 9,
}

impl SourceState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Probing,
            2 => Self::Restructuring,
            3 => Self::Streaming,
            4 => Self::Seeking,
            5 => Self::Retrying,
            6 => Self::WaitingForNetwork,
            7 => Self::Finished,
            8 => Self::Failed,
            9 => Self::Closed,
            _ => Self::Idle,
        }
    }

    /// No more data will be produced without a new seek.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Closed)
    }
}
