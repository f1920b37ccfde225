//! MP4 atom headers

use std::fmt;
use std::io::{self, Read};

use bytes::Bytes;

use super::Mp4Error;
use crate::error::Result;

/// Four-character atom type code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const MOOV: Self = Self(*b"moov");
    pub const MDAT: Self = Self(*b"mdat");
    pub const FREE: Self = Self(*b"free");
    pub const SKIP: Self = Self(*b"skip");
    pub const WIDE: Self = Self(*b"wide");
    pub const CMOV: Self = Self(*b"cmov");
    pub const TRAK: Self = Self(*b"trak");
    pub const MDIA: Self = Self(*b"mdia");
    pub const MINF: Self = Self(*b"minf");
    pub const STBL: Self = Self(*b"stbl");
    pub const STCO: Self = Self(*b"stco");
    pub const CO64: Self = Self(*b"co64");

    /// Padding atoms that carry no data.
    pub fn is_free_space(self) -> bool {
        matches!(self, Self::FREE | Self::SKIP | Self::WIDE)
    }

    /// Containers on the path from `moov` to the chunk offset tables.
    pub fn leads_to_chunk_offsets(self) -> bool {
        matches!(self, Self::TRAK | Self::MDIA | Self::MINF | Self::STBL)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

/// One atom header, optionally with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mp4Atom {
    pub four_cc: FourCc,
    /// Total size including the header; 0 means "to end of file"
    pub size: u64,
    /// Offset of the header in the file
    pub byte_offset: u64,
    /// 8, or 16 with a 64-bit extended size
    pub header_len: u8,
    pub payload: Option<Bytes>,
}

impl Mp4Atom {
    /// Decode a header from the start of `buf`.
    ///
    /// `Ok(None)` means `buf` is too short to hold the whole header.
    pub fn parse_header(
        buf: &[u8],
        byte_offset: u64,
    ) -> std::result::Result<Option<Self>, Mp4Error> {
        if buf.len() < 8 {
            return Ok(None);
        }
        let size32 = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let four_cc = FourCc([buf[4], buf[5], buf[6], buf[7]]);

        let (size, header_len) = if size32 == 1 {
            if buf.len() < 16 {
                return Ok(None);
            }
            let mut ext = [0u8; 8];
            ext.copy_from_slice(&buf[8..16]);
            (u64::from_be_bytes(ext), 16u8)
        } else {
            (size32 as u64, 8u8)
        };

        if size != 0 && size < header_len as u64 {
            return Err(Mp4Error::Truncated(four_cc));
        }

        Ok(Some(Self {
            four_cc,
            size,
            byte_offset,
            header_len,
            payload: None,
        }))
    }

    /// Read a header from a stream positioned at `byte_offset`.
    ///
    /// Returns `Ok(None)` at a clean end of stream. A stream that ends
    /// inside a header is a malformed file, reported as `Truncated`; read
    /// errors pass through unchanged.
    pub fn read_header<R: Read>(reader: &mut R, byte_offset: u64) -> Result<Option<Self>> {
        let mut buf = [0u8; 16];
        let got = read_full(reader, &mut buf[..8])?;
        if got == 0 {
            return Ok(None);
        }
        // Unread type bytes stay zero and display as `?`.
        let four_cc = FourCc([buf[4], buf[5], buf[6], buf[7]]);
        if got < 8 {
            return Err(Mp4Error::Truncated(four_cc).into());
        }
        if buf[..4] == [0, 0, 0, 1] && read_full(reader, &mut buf[8..16])? < 8 {
            return Err(Mp4Error::Truncated(four_cc).into());
        }
        Ok(Self::parse_header(&buf, byte_offset)?)
    }

    /// Offset one past the atom; `None` for atoms running to end of file.
    pub fn end(&self) -> Option<u64> {
        (self.size != 0).then(|| self.byte_offset + self.size)
    }

    pub fn payload_len(&self) -> Option<u64> {
        (self.size != 0).then(|| self.size - self.header_len as u64)
    }

    /// Header bytes as they appear in the file
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len as usize);
        if self.header_len == 16 {
            out.extend_from_slice(&1u32.to_be_bytes());
            out.extend_from_slice(&self.four_cc.0);
            out.extend_from_slice(&self.size.to_be_bytes());
        } else {
            out.extend_from_slice(&(self.size as u32).to_be_bytes());
            out.extend_from_slice(&self.four_cc.0);
        }
        out
    }
}

/// Fill `buf` unless the stream ends first; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
