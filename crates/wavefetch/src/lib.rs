//! wavefetch — progressive remote audio sources
//!
//! Streams compressed audio over HTTP into a bounded buffer a pull-based
//! decoder reads from, stripping ICY metadata on the way and relocating a
//! trailing MP4 `moov` atom so non-fast-start files play progressively.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::io::Read;
//! use wavefetch::{RemoteAudioSource, SourceConfig};
//!
//! let source = RemoteAudioSource::new("https://example.com/show.m4a", SourceConfig::new())?;
//! source.play()?;
//! let mut head = [0u8; 4096];
//! let n = source.reader().read(&mut head)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod mp4;
pub mod stream;

#[cfg(test)]
mod testing;

pub use config::SourceConfig;
pub use error::{Result, SourceError};
pub use mp4::{ContainerRestructurer, Mp4Error};
pub use stream::{
    reachability_target, RemoteAudioSource, SourceEvent, SourceReader, SourceState,
};
