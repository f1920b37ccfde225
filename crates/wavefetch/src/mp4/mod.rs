//! MP4 fast-start restructuring
//!
//! A streaming decoder needs the `moov` atom (sample tables) before it can
//! use any of `mdat`. Files written with `moov` at the end are made playable
//! progressively by fetching `moov` with a range request, moving it in
//! front of the media data and shifting every chunk offset by its size.
//!
//! Virtual stream layout after relocation:
//!
//! ```text
//! [file[0..ftyp_end]][patched moov][file[ftyp_end..]]
//! ```

mod atom;
mod restructure;

use thiserror::Error;

pub use atom::{FourCc, Mp4Atom};
pub use restructure::{
    ContainerRestructurer, MoovLocation, ProbeOutcome, RestructuredMoov, VirtualOffset,
};

/// Why a container could not be prepared for streaming
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Mp4Error {
    #[error("missing `{0}` atom")]
    MissingAtom(FourCc),

    #[error("`{0}` atom is truncated")]
    Truncated(FourCc),

    #[error("compressed movie headers (cmov) are not supported")]
    CompressedMovie,

    #[error("chunk offset does not fit after relocation")]
    OffsetOverflow,

    #[error("server does not support range requests")]
    RangeNotSupported,

    #[error("no media data within the first {0} bytes")]
    ProbeLimitExceeded(u64),

    #[error("moov atom of {0} bytes exceeds the limit")]
    MoovTooLarge(u64),

    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),
}
