//! `moov` relocation
//!
//! Two range requests: one from the start of the file to find where `mdat`
//! ends (the candidate `moov` offset), one from there to fetch `moov`.
//! The patched `moov` is then served in front of the media data.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, Span};

use super::atom::{FourCc, Mp4Atom};
use super::Mp4Error;
use crate::config::SourceConfig;
use crate::error::{Result, SourceError};
use crate::stream::headers::ResponseHeaderInterpreter;
use crate::stream::http::{HttpResponse, HttpTransport, StreamRequest};

type Mp4Result<T> = std::result::Result<T, Mp4Error>;

/// Where the trailing `moov` should be and what precedes `mdat`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoovLocation {
    /// Candidate offset: the end of `mdat`
    pub moov_offset: u64,
    pub mdat_offset: u64,
    pub mdat_size: u64,
    /// End of the first `ftyp`, if there is one
    pub ftyp_end: Option<u64>,
    /// `file[0..ftyp_end]`; empty without `ftyp`
    pub prefix: Bytes,
    /// Bytes of `free`/`skip`/`wide` atoms before `mdat`
    pub free_space_bytes: u64,
    /// Real file length, when the server reported it
    pub file_length: Option<u64>,
}

impl MoovLocation {
    /// Real offset at which streaming resumes behind the relocated `moov`.
    ///
    /// Without `ftyp` only padding may precede `mdat`, so the stream resumes
    /// at the start of the file.
    pub fn resume_offset(&self) -> Mp4Result<u64> {
        match self.ftyp_end {
            Some(end) => Ok(end),
            None => match self.mdat_offset.saturating_sub(self.free_space_bytes) {
                0 => Ok(0),
                other => Err(Mp4Error::UnsupportedLayout(format!(
                    "{other} bytes of non-padding atoms before mdat and no ftyp"
                ))),
            },
        }
    }
}

/// Result of scanning the start of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// `moov` precedes `mdat`; stream the file as is
    NotNeeded,
    Relocate(MoovLocation),
}

/// Where a virtual offset lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualOffset {
    /// Inside `initial_bytes`
    Prefix(usize),
    /// Past `initial_bytes`, at this real file offset
    Real(u64),
}

/// A relocated `moov` and the mapping between virtual and real offsets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestructuredMoov {
    /// `file[0..ftyp_end]` followed by the patched `moov`
    pub initial_bytes: Bytes,
    /// Real offset where the main request resumes
    pub mdat_byte_offset: u64,
    pub moov_size: u64,
    pub original_mdat_offset: u64,
}

impl RestructuredMoov {
    /// Patch `moov` for its new position and join it with the prefix.
    pub fn assemble(location: &MoovLocation, mut moov: Vec<u8>) -> Mp4Result<Self> {
        let mdat_byte_offset = location.resume_offset()?;
        let moov_size = moov.len() as u64;
        patch_moov(&mut moov, moov_size)?;

        let mut initial = Vec::with_capacity(location.prefix.len() + moov.len());
        initial.extend_from_slice(&location.prefix);
        initial.extend_from_slice(&moov);

        Ok(Self {
            initial_bytes: Bytes::from(initial),
            mdat_byte_offset,
            moov_size,
            original_mdat_offset: location.mdat_offset,
        })
    }

    /// Translate a virtual seek target.
    ///
    /// Offsets inside `initial_bytes` (the `ftyp` prefix or the relocated
    /// `moov`) are served from memory, and the request resumes at
    /// `mdat_byte_offset` behind them. Anything later is the real file
    /// shifted by the size of `moov`.
    pub fn seek_adjusted(&self, offset: u64) -> VirtualOffset {
        match usize::try_from(offset) {
            Ok(i) if i < self.initial_bytes.len() => VirtualOffset::Prefix(i),
            _ => VirtualOffset::Real(offset - self.moov_size),
        }
    }

    pub fn virtual_length(&self, real_length: u64) -> u64 {
        real_length + self.moov_size
    }
}

/// Relocates a trailing `moov` for one URL.
///
/// Runs on a helper thread; `cancel()` makes the next body read or request
/// fail so an abandoned job stops downloading.
pub struct ContainerRestructurer {
    transport: Arc<dyn HttpTransport>,
    url: String,
    config: SourceConfig,
    span: Span,
    cancelled: AtomicBool,
}

impl ContainerRestructurer {
    pub fn new(
        url: impl Into<String>,
        config: &SourceConfig,
        transport: Arc<dyn HttpTransport>,
        span: Span,
    ) -> Self {
        Self {
            transport,
            url: url.into(),
            config: config.clone(),
            span,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn open(&self, range_start: u64) -> Result<HttpResponse> {
        if self.is_cancelled() {
            return Err(SourceError::Closed);
        }
        let request = StreamRequest::from_config(&self.url, &self.config, Some(range_start));
        self.transport.open(&request)
    }

    /// Scan the start of the file; report where `moov` has to come from.
    pub fn optimize_if_needed(&self) -> Result<ProbeOutcome> {
        let _entered = self.span.enter();
        let response = self.open(0)?;
        if !matches!(response.status, 200 | 206) {
            return Err(SourceError::Status(response.status));
        }

        let mut body = CancellableBody {
            inner: response.body,
            cancelled: &self.cancelled,
        };
        let mut outcome = scan_prefix(&mut body, self.config.max_probe_bytes)?;
        if let ProbeOutcome::Relocate(ref mut location) = outcome {
            if response.status != 206 {
                return Err(Mp4Error::RangeNotSupported.into());
            }
            location.file_length = ResponseHeaderInterpreter::parse(response.status, &response.headers)
                .and_then(|parsed| parsed.file_length);
            if location
                .file_length
                .is_some_and(|len| location.moov_offset >= len)
            {
                return Err(Mp4Error::MissingAtom(FourCc::MOOV).into());
            }
            info!(
                mdat_offset = location.mdat_offset,
                moov_offset = location.moov_offset,
                "moov follows mdat, relocating"
            );
        } else {
            debug!("moov precedes mdat");
        }
        Ok(outcome)
    }

    /// Fetch `moov` from `location` and build the relocated prefix.
    pub fn restructure(&self, location: &MoovLocation) -> Result<RestructuredMoov> {
        let _entered = self.span.enter();
        let response = self.open(location.moov_offset)?;
        match response.status {
            206 => {}
            200 => return Err(Mp4Error::RangeNotSupported.into()),
            416 => return Err(Mp4Error::MissingAtom(FourCc::MOOV).into()),
            status => return Err(SourceError::Status(status)),
        }

        let mut body = CancellableBody {
            inner: response.body,
            cancelled: &self.cancelled,
        };
        let (moov_offset, moov) =
            read_moov(&mut body, location.moov_offset, self.config.max_moov_bytes)?;
        let restructured = RestructuredMoov::assemble(location, moov)?;
        info!(
            moov_offset,
            moov_size = restructured.moov_size,
            resume = restructured.mdat_byte_offset,
            "moov relocated"
        );
        Ok(restructured)
    }
}

/// Body that fails every read once its job is cancelled
struct CancellableBody<'a> {
    inner: Box<dyn Read + Send>,
    cancelled: &'a AtomicBool,
}

impl Read for CancellableBody<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(io::Error::other("restructuring cancelled"));
        }
        self.inner.read(buf)
    }
}

/// Walk top-level atoms from offset 0 until `moov` or `mdat` shows up.
///
/// Atoms before `mdat` are buffered so the `ftyp` prefix can be replayed.
pub(crate) fn scan_prefix<R: Read>(body: &mut R, limit: u64) -> Result<ProbeOutcome> {
    let mut head = Vec::new();
    let mut pos = 0u64;
    let mut ftyp_end = None;
    let mut free_space_bytes = 0u64;

    loop {
        let Some(atom) = Mp4Atom::read_header(body, pos)? else {
            return Err(Mp4Error::MissingAtom(FourCc::MDAT).into());
        };

        match atom.four_cc {
            FourCc::MOOV => return Ok(ProbeOutcome::NotNeeded),
            FourCc::MDAT => {
                // An mdat running to end of file leaves no room for moov.
                let Some(moov_offset) = atom.end() else {
                    return Err(Mp4Error::MissingAtom(FourCc::MOOV).into());
                };
                head.truncate(ftyp_end.unwrap_or(0) as usize);
                return Ok(ProbeOutcome::Relocate(MoovLocation {
                    moov_offset,
                    mdat_offset: pos,
                    mdat_size: atom.size,
                    ftyp_end,
                    prefix: Bytes::from(head),
                    free_space_bytes,
                    file_length: None,
                }));
            }
            four_cc => {
                let (Some(end), Some(len)) = (atom.end(), atom.payload_len()) else {
                    return Err(Mp4Error::MissingAtom(FourCc::MDAT).into());
                };
                if end > limit {
                    return Err(Mp4Error::ProbeLimitExceeded(limit).into());
                }

                head.extend_from_slice(&atom.header_bytes());
                let start = head.len();
                body.by_ref().take(len).read_to_end(&mut head)?;
                if ((head.len() - start) as u64) < len {
                    return Err(Mp4Error::Truncated(four_cc).into());
                }

                if four_cc == FourCc::FTYP && ftyp_end.is_none() {
                    ftyp_end = Some(end);
                }
                if four_cc.is_free_space() {
                    free_space_bytes += atom.size;
                }
                pos = end;
            }
        }
    }
}

/// Read the first `moov` at or after `start`; returns its offset and bytes.
pub(crate) fn read_moov<R: Read>(body: &mut R, start: u64, limit: u64) -> Result<(u64, Vec<u8>)> {
    let mut pos = start;
    loop {
        let Some(atom) = Mp4Atom::read_header(body, pos)? else {
            return Err(Mp4Error::MissingAtom(FourCc::MOOV).into());
        };

        if atom.four_cc == FourCc::MOOV {
            let mut moov = atom.header_bytes();
            match atom.payload_len() {
                Some(len) => {
                    if atom.size > limit {
                        return Err(Mp4Error::MoovTooLarge(atom.size).into());
                    }
                    body.by_ref().take(len).read_to_end(&mut moov)?;
                    if (moov.len() as u64) < atom.size {
                        return Err(Mp4Error::Truncated(FourCc::MOOV).into());
                    }
                }
                None => {
                    // Runs to end of file: read it and give it a real size.
                    body.by_ref().take(limit + 1).read_to_end(&mut moov)?;
                    let size = moov.len() as u64;
                    if size > limit {
                        return Err(Mp4Error::MoovTooLarge(size).into());
                    }
                    let size = u32::try_from(size).map_err(|_| Mp4Error::MoovTooLarge(size))?;
                    moov[..4].copy_from_slice(&size.to_be_bytes());
                }
            }
            return Ok((pos, moov));
        }

        let (Some(end), Some(len)) = (atom.end(), atom.payload_len()) else {
            return Err(Mp4Error::MissingAtom(FourCc::MOOV).into());
        };
        debug!(atom = %atom.four_cc, offset = pos, "skipping atom before moov");
        let skipped = io::copy(&mut body.by_ref().take(len), &mut io::sink())?;
        if skipped < len {
            return Err(Mp4Error::Truncated(atom.four_cc).into());
        }
        pos = end;
    }
}

/// Add `delta` to every chunk offset in a complete `moov` atom.
pub(crate) fn patch_moov(moov: &mut [u8], delta: u64) -> Mp4Result<()> {
    let Some(header) = Mp4Atom::parse_header(moov, 0)? else {
        return Err(Mp4Error::Truncated(FourCc::MOOV));
    };
    if header.four_cc != FourCc::MOOV {
        return Err(Mp4Error::MissingAtom(FourCc::MOOV));
    }

    let start = header.header_len as usize;
    if let Ok(Some(first)) = Mp4Atom::parse_header(&moov[start..], 0) {
        if first.four_cc == FourCc::CMOV {
            return Err(Mp4Error::CompressedMovie);
        }
    }

    let end = moov.len();
    patch_children(moov, start, end, delta)
}

fn patch_children(buf: &mut [u8], start: usize, end: usize, delta: u64) -> Mp4Result<()> {
    let mut pos = start;
    // Fewer than 8 trailing bytes are padding (e.g. a 32-bit zero terminator).
    while end - pos >= 8 {
        let Some(child) = Mp4Atom::parse_header(&buf[pos..end], pos as u64)? else {
            return Err(Mp4Error::Truncated(FourCc([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]])));
        };
        let size = match child.size {
            0 => end - pos,
            size => usize::try_from(size).map_err(|_| Mp4Error::Truncated(child.four_cc))?,
        };
        if size > end - pos {
            return Err(Mp4Error::Truncated(child.four_cc));
        }

        let body = pos + child.header_len as usize..pos + size;
        match child.four_cc {
            FourCc::STCO => patch_stco(&mut buf[body], delta)?,
            FourCc::CO64 => patch_co64(&mut buf[body], delta)?,
            cc if cc.leads_to_chunk_offsets() => patch_children(buf, body.start, body.end, delta)?,
            _ => {}
        }
        pos += size;
    }
    Ok(())
}

/// Entries of a chunk offset table: version/flags, count, then the entries.
fn table_entries(table: &mut [u8], entry_len: usize, four_cc: FourCc) -> Mp4Result<&mut [u8]> {
    if table.len() < 8 {
        return Err(Mp4Error::Truncated(four_cc));
    }
    let count = u32::from_be_bytes([table[4], table[5], table[6], table[7]]) as usize;
    let needed = count
        .checked_mul(entry_len)
        .and_then(|n| n.checked_add(8))
        .ok_or(Mp4Error::Truncated(four_cc))?;
    if needed > table.len() {
        return Err(Mp4Error::Truncated(four_cc));
    }
    Ok(&mut table[8..needed])
}

fn patch_stco(table: &mut [u8], delta: u64) -> Mp4Result<()> {
    for entry in table_entries(table, 4, FourCc::STCO)?.chunks_exact_mut(4) {
        let old = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
        let new = u64::from(old)
            .checked_add(delta)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(Mp4Error::OffsetOverflow)?;
        entry.copy_from_slice(&new.to_be_bytes());
    }
    Ok(())
}

fn patch_co64(table: &mut [u8], delta: u64) -> Mp4Result<()> {
    for entry in table_entries(table, 8, FourCc::CO64)?.chunks_exact_mut(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(entry);
        let new = u64::from_be_bytes(raw)
            .checked_add(delta)
            .ok_or(Mp4Error::OffsetOverflow)?;
        entry.copy_from_slice(&new.to_be_bytes());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        atom, chunk_offsets, co64, container, moov, stco, track, trailing_moov_file, MemoryServer,
        TrickleServer,
    };
    use std::io::Cursor;
    use std::thread;
    use std::time::{Duration, Instant};

    fn mdat_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn relocate(file: &[u8]) -> (MoovLocation, RestructuredMoov) {
        let ProbeOutcome::Relocate(location) = scan_prefix(&mut Cursor::new(file), 1 << 20).unwrap()
        else {
            panic!("expected relocation");
        };
        let start = location.moov_offset as usize;
        let (_, moov) =
            read_moov(&mut Cursor::new(&file[start..]), location.moov_offset, 1 << 20).unwrap();
        let restructured = RestructuredMoov::assemble(&location, moov).unwrap();
        (location, restructured)
    }

    fn virtual_stream(file: &[u8], r: &RestructuredMoov) -> Vec<u8> {
        let mut out = r.initial_bytes.to_vec();
        out.extend_from_slice(&file[r.mdat_byte_offset as usize..]);
        out
    }

    #[test]
    fn fast_start_needs_nothing() {
        let file = [
            atom(b"ftyp", b"isom"),
            moov(vec![track(stco(&[100]))]),
            atom(b"mdat", &[0; 64]),
        ]
        .concat();
        assert_eq!(
            scan_prefix(&mut Cursor::new(file), 1 << 20).unwrap(),
            ProbeOutcome::NotNeeded
        );
    }

    #[test]
    fn scan_finds_trailing_moov() {
        let (file, _) = trailing_moov_file();
        let ProbeOutcome::Relocate(loc) = scan_prefix(&mut Cursor::new(&file), 1 << 20).unwrap() else {
            panic!("expected relocation");
        };
        assert_eq!(loc.ftyp_end, Some(24));
        assert_eq!(&loc.prefix[..], &file[..24]);
        assert_eq!(loc.free_space_bytes, 16);
        assert_eq!(loc.mdat_offset, 40);
        assert_eq!(loc.mdat_size, 2008);
        assert_eq!(loc.moov_offset, 2048);
        assert_eq!(&file[2052..2056], b"moov");
    }

    #[test]
    fn patched_offsets_point_at_same_bytes() {
        let (file, original) = trailing_moov_file();
        let (_, r) = relocate(&file);
        let virtual_bytes = virtual_stream(&file, &r);

        assert_eq!(r.mdat_byte_offset, 24);
        assert_eq!(r.initial_bytes.len() as u64, 24 + r.moov_size);
        assert_eq!(virtual_bytes.len() as u64, r.virtual_length(file.len() as u64));

        let patched = chunk_offsets(&r.initial_bytes[24..]);
        assert_eq!(patched.len(), original.len());
        for (&new, &old) in patched.iter().zip(&original) {
            assert_eq!(new, old + r.moov_size);
            let (new, old) = (new as usize, old as usize);
            assert_eq!(virtual_bytes[new..new + 8], file[old..old + 8]);
        }
        // Virtual stream starts with ftyp then the relocated moov.
        assert_eq!(&virtual_bytes[28..32], b"moov");
    }

    #[test]
    fn without_ftyp_stream_resumes_at_zero() {
        let payload = mdat_payload(500);
        let free = atom(b"skip", &[0; 4]);
        let payload_start = (free.len() + 8) as u64;
        let offsets = [payload_start, payload_start + 250];
        let file = [
            free,
            atom(b"mdat", &payload),
            moov(vec![track(stco(&[offsets[0] as u32, offsets[1] as u32]))]),
        ]
        .concat();

        let (loc, r) = relocate(&file);
        assert_eq!(loc.ftyp_end, None);
        assert!(loc.prefix.is_empty());
        assert_eq!(r.mdat_byte_offset, 0);

        let virtual_bytes = virtual_stream(&file, &r);
        for (new, old) in chunk_offsets(&r.initial_bytes).into_iter().zip(offsets) {
            let (new, old) = (new as usize, old as usize);
            assert_eq!(virtual_bytes[new..new + 8], file[old..old + 8]);
        }
    }

    #[test]
    fn without_ftyp_other_atoms_are_unsupported() {
        let file = [
            atom(b"uuid", &[1; 16]),
            atom(b"mdat", &[0; 32]),
            moov(vec![track(stco(&[30]))]),
        ]
        .concat();
        let ProbeOutcome::Relocate(loc) = scan_prefix(&mut Cursor::new(&file), 1 << 20).unwrap() else {
            panic!("expected relocation");
        };
        let moov = file[loc.moov_offset as usize..].to_vec();
        assert!(matches!(
            RestructuredMoov::assemble(&loc, moov),
            Err(Mp4Error::UnsupportedLayout(_))
        ));
    }

    #[test]
    fn extended_size_mdat() {
        let mut mdat = vec![0, 0, 0, 1];
        mdat.extend_from_slice(b"mdat");
        mdat.extend_from_slice(&(16u64 + 40).to_be_bytes());
        mdat.extend_from_slice(&[9; 40]);
        let file = [atom(b"ftyp", b"isom"), mdat, moov(vec![track(stco(&[28]))])].concat();
        let (loc, r) = relocate(&file);
        assert_eq!(loc.moov_offset, 12 + 56);
        assert_eq!(chunk_offsets(&r.initial_bytes[12..]), vec![28 + r.moov_size]);
    }

    #[test]
    fn compressed_movie_is_rejected() {
        let mut m = container(b"moov", &[atom(b"cmov", &[0; 32])]);
        assert_eq!(patch_moov(&mut m, 100), Err(Mp4Error::CompressedMovie));
    }

    #[test]
    fn stco_overflow_fails() {
        let mut m = moov(vec![track(stco(&[u32::MAX - 10]))]);
        assert_eq!(patch_moov(&mut m, 11), Err(Mp4Error::OffsetOverflow));

        let mut m = moov(vec![track(stco(&[u32::MAX - 10]))]);
        assert_eq!(patch_moov(&mut m, 10), Ok(()));
        assert_eq!(chunk_offsets(&m), vec![u32::MAX as u64]);
    }

    #[test]
    fn co64_takes_large_offsets() {
        let mut m = moov(vec![track(co64(&[u32::MAX as u64]))]);
        patch_moov(&mut m, 1000).unwrap();
        assert_eq!(chunk_offsets(&m), vec![u32::MAX as u64 + 1000]);
    }

    #[test]
    fn short_table_is_truncated() {
        let mut table = stco(&[1, 2]);
        // Claim five entries.
        table[15] = 5;
        let mut m = moov(vec![track(table)]);
        assert_eq!(patch_moov(&mut m, 8), Err(Mp4Error::Truncated(FourCc::STCO)));
    }

    #[test]
    fn child_past_parent_is_truncated() {
        let mut m = moov(vec![track(stco(&[1]))]);
        // Inflate the trak size beyond the moov.
        let trak = 8 + 108;
        m[trak..trak + 4].copy_from_slice(&10_000u32.to_be_bytes());
        assert_eq!(patch_moov(&mut m, 8), Err(Mp4Error::Truncated(FourCc::TRAK)));
    }

    #[test]
    fn seek_adjustment_is_consistent() {
        let (file, _) = trailing_moov_file();
        let (loc, r) = relocate(&file);
        let virtual_mdat = loc.mdat_offset + r.moov_size;
        for d in [0, 1, 8, 100, 1999] {
            assert_eq!(
                r.seek_adjusted(virtual_mdat + d),
                VirtualOffset::Real(loc.mdat_offset + d)
            );
        }
        // ftyp prefix and relocated moov come from memory
        assert_eq!(r.seek_adjusted(10), VirtualOffset::Prefix(10));
        let moov_end = 24 + r.moov_size;
        assert_eq!(
            r.seek_adjusted(moov_end - 1),
            VirtualOffset::Prefix(moov_end as usize - 1)
        );
        // First byte after the prefix is the resume point
        assert_eq!(r.seek_adjusted(moov_end), VirtualOffset::Real(r.mdat_byte_offset));
    }

    #[test]
    fn scan_limit_is_enforced() {
        let file = [atom(b"ftyp", b"isom"), atom(b"free", &[0; 4096]), atom(b"mdat", &[0; 8])].concat();
        assert!(matches!(
            scan_prefix(&mut Cursor::new(file), 1024),
            Err(SourceError::Prepare(Mp4Error::ProbeLimitExceeded(1024)))
        ));
    }

    #[test]
    fn mdat_to_end_of_file_has_no_moov() {
        let file = [atom(b"ftyp", b"isom"), b"\x00\x00\x00\x00mdat".to_vec(), vec![0; 32]].concat();
        assert!(matches!(
            scan_prefix(&mut Cursor::new(file), 1 << 20),
            Err(SourceError::Prepare(Mp4Error::MissingAtom(FourCc::MOOV)))
        ));
    }

    #[test]
    fn oversized_moov_is_refused() {
        let m = moov(vec![track(stco(&[1, 2, 3]))]);
        let size = m.len() as u64;
        assert!(matches!(
            read_moov(&mut Cursor::new(m), 0, 64),
            Err(SourceError::Prepare(Mp4Error::MoovTooLarge(s))) if s == size
        ));
    }

    #[test]
    fn read_moov_skips_trailing_atoms() {
        let m = moov(vec![track(stco(&[1]))]);
        let data = [atom(b"free", &[0; 12]), m.clone()].concat();
        let (offset, got) = read_moov(&mut Cursor::new(data), 1000, 1 << 20).unwrap();
        assert_eq!(offset, 1020);
        assert_eq!(got, m);
    }

    #[test]
    fn restructurer_over_transport() {
        let (file, _) = trailing_moov_file();
        let server = Arc::new(MemoryServer::new(file.clone()));
        let r = ContainerRestructurer::new(
            "http://test/a.m4a",
            &SourceConfig::default(),
            server.clone(),
            Span::none(),
        );
        let ProbeOutcome::Relocate(loc) = r.optimize_if_needed().unwrap() else {
            panic!("expected relocation");
        };
        assert_eq!(loc.file_length, Some(file.len() as u64));
        let restructured = r.restructure(&loc).unwrap();
        assert_eq!(restructured.moov_size, (file.len() as u64) - loc.moov_offset);
        assert_eq!(server.requested_ranges(), vec![Some(0), Some(loc.moov_offset)]);
    }

    #[test]
    fn restructurer_needs_range_support() {
        let (file, _) = trailing_moov_file();
        let server = Arc::new(MemoryServer::new(file).without_ranges());
        let r = ContainerRestructurer::new(
            "http://test/a.m4a",
            &SourceConfig::default(),
            server,
            Span::none(),
        );
        assert!(matches!(
            r.optimize_if_needed(),
            Err(SourceError::Prepare(Mp4Error::RangeNotSupported))
        ));
    }

    #[test]
    fn cancel_stops_a_running_job() {
        let transport = Arc::new(TrickleServer::default());
        let config = SourceConfig::default().with_mp4_limits(1 << 26, 1 << 26);
        let r = Arc::new(ContainerRestructurer::new(
            "http://test/a.m4a",
            &config,
            transport.clone(),
            Span::none(),
        ));

        let job = {
            let r = r.clone();
            thread::spawn(move || r.optimize_if_needed())
        };
        thread::sleep(Duration::from_millis(50));
        let cancelled_at = Instant::now();
        r.cancel();

        assert!(job.join().unwrap().is_err());
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        let after_cancel = transport.served();
        assert!(after_cancel < 1 << 24);

        // A cancelled job opens nothing more.
        let loc = MoovLocation {
            moov_offset: 1 << 24,
            mdat_offset: 8,
            mdat_size: 1 << 24,
            ftyp_end: None,
            prefix: Bytes::new(),
            free_space_bytes: 0,
            file_length: None,
        };
        assert!(matches!(r.restructure(&loc), Err(SourceError::Closed)));
        assert_eq!(transport.served(), after_cancel);
        assert_eq!(transport.opened(), 1);
    }
}
