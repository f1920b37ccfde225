//! In-memory HTTP server for tests

use std::collections::VecDeque;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{Result, SourceError};
use crate::stream::http::{HttpResponse, HttpTransport, StreamRequest};

/// Scripted misbehaviour for the next request
#[derive(Debug, Clone)]
pub enum Failure {
    /// Connection refused before any response
    Refuse,
    /// Answer with this status and an empty body
    Status(u16),
    /// Answer with this status, no headers at all, and this body
    Bare(u16, Vec<u8>),
    /// Serve this many body bytes, then reset the connection
    DropAfter(usize),
    /// Serve this many body bytes, then end the body cleanly
    CloseAfter(usize),
}

/// Serves one resource from memory, honouring `Range: bytes=N-`.
pub struct MemoryServer {
    data: Vec<u8>,
    content_type: Option<String>,
    ranges: bool,
    content_length: bool,
    extra_headers: Vec<(String, String)>,
    /// Send the header block inside the body, Shoutcast v1 style
    raw_headers: bool,
    failures: Mutex<VecDeque<Failure>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl MemoryServer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            content_type: None,
            ranges: true,
            content_length: true,
            extra_headers: Vec::new(),
            raw_headers: false,
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    /// Live-broadcast style: no `Content-Length`
    pub fn without_length(mut self) -> Self {
        self.content_length = false;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.extra_headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn raw_headers(mut self) -> Self {
        self.raw_headers = true;
        self
    }

    pub fn fail_next(&self, failure: Failure) {
        self.failures.lock().unwrap().push_back(failure);
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requested_ranges(&self) -> Vec<Option<u64>> {
        self.requests().iter().map(|r| r.range_start).collect()
    }

    fn respond(&self, request: &StreamRequest) -> (u16, Vec<(String, String)>, Vec<u8>) {
        let len = self.data.len() as u64;
        let mut headers = Vec::new();
        if let Some(ref ct) = self.content_type {
            headers.push(("content-type".to_string(), ct.clone()));
        }
        headers.extend(self.extra_headers.iter().cloned());

        match request.range_start {
            Some(start) if self.ranges => {
                if start >= len {
                    headers.push(("content-range".to_string(), format!("bytes */{len}")));
                    return (416, headers, Vec::new());
                }
                headers.push((
                    "content-range".to_string(),
                    format!("bytes {start}-{}/{len}", len - 1),
                ));
                headers.push(("content-length".to_string(), (len - start).to_string()));
                headers.push(("accept-ranges".to_string(), "bytes".to_string()));
                (206, headers, self.data[start as usize..].to_vec())
            }
            _ => {
                if self.content_length {
                    headers.push(("content-length".to_string(), len.to_string()));
                }
                if self.ranges {
                    headers.push(("accept-ranges".to_string(), "bytes".to_string()));
                }
                (200, headers, self.data.clone())
            }
        }
    }
}

impl HttpTransport for MemoryServer {
    fn open(&self, request: &StreamRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let failure = self.failures.lock().unwrap().pop_front();

        let cut = match failure {
            Some(Failure::Refuse) => {
                return Err(SourceError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )))
            }
            Some(Failure::Status(status)) => {
                let mut headers = HeaderMap::new();
                headers.insert("content-length", HeaderValue::from_static("0"));
                return Ok(HttpResponse {
                    status,
                    headers,
                    body: Box::new(io::empty()),
                });
            }
            Some(Failure::Bare(status, body)) => {
                return Ok(HttpResponse {
                    status,
                    headers: HeaderMap::new(),
                    body: Box::new(Cursor::new(body)),
                });
            }
            Some(Failure::DropAfter(n)) => Some((n, true)),
            Some(Failure::CloseAfter(n)) => Some((n, false)),
            None => None,
        };

        let (status, pairs, mut body) = self.respond(request);
        let mut headers = HeaderMap::new();
        if self.raw_headers {
            let mut block = format!("ICY {status} OK\r\n");
            for (name, value) in &pairs {
                block.push_str(&format!("{name}:{value}\r\n"));
            }
            block.push_str("\r\n");
            body.splice(0..0, block.into_bytes());
        } else {
            for (name, value) in pairs {
                headers.append(
                    HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    HeaderValue::from_str(&value).unwrap(),
                );
            }
        }

        let body: Box<dyn Read + Send> = match cut {
            Some((n, true)) => {
                body.truncate(n);
                Box::new(FailingBody {
                    good: Cursor::new(body),
                })
            }
            Some((n, false)) => {
                body.truncate(n);
                Box::new(Cursor::new(body))
            }
            None => Box::new(Cursor::new(body)),
        };
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Body that errors once its bytes run out
struct FailingBody {
    good: Cursor<Vec<u8>>,
}

impl Read for FailingBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.good.read(buf)? {
            0 => Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset",
            )),
            n => Ok(n),
        }
    }
}

/// Serves an MP4 that opens with a 16 MiB `free` atom whose payload
/// trickles in at 1 KiB per millisecond.
#[derive(Default)]
pub struct TrickleServer {
    opened: AtomicUsize,
    served: Arc<AtomicUsize>,
}

impl TrickleServer {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Payload bytes handed out so far
    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl HttpTransport for TrickleServer {
    fn open(&self, _request: &StreamRequest) -> Result<HttpResponse> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let mut header = 0x0100_0000u32.to_be_bytes().to_vec();
        header.extend_from_slice(b"free");
        Ok(HttpResponse {
            status: 206,
            headers: HeaderMap::new(),
            body: Box::new(TrickleBody {
                header: Cursor::new(header),
                served: self.served.clone(),
            }),
        })
    }
}

struct TrickleBody {
    header: Cursor<Vec<u8>>,
    served: Arc<AtomicUsize>,
}

impl Read for TrickleBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.header.read(buf)?;
        if n > 0 {
            return Ok(n);
        }
        thread::sleep(Duration::from_millis(1));
        let n = buf.len().min(1024);
        buf[..n].fill(0);
        self.served.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }
}

/// Deterministic test audio
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

// --- MP4 fixtures ---

pub fn atom(four_cc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(four_cc);
    out.extend_from_slice(payload);
    out
}

pub fn container(four_cc: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
    atom(four_cc, &children.concat())
}

pub fn stco(entries: &[u32]) -> Vec<u8> {
    let mut payload = vec![0, 0, 0, 0];
    payload.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for e in entries {
        payload.extend_from_slice(&e.to_be_bytes());
    }
    atom(b"stco", &payload)
}

pub fn co64(entries: &[u64]) -> Vec<u8> {
    let mut payload = vec![0, 0, 0, 0];
    payload.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for e in entries {
        payload.extend_from_slice(&e.to_be_bytes());
    }
    atom(b"co64", &payload)
}

/// `trak` wrapping one chunk offset table
pub fn track(table: Vec<u8>) -> Vec<u8> {
    let stbl = container(b"stbl", &[atom(b"stsd", &[0; 16]), table]);
    let minf = container(b"minf", &[atom(b"smhd", &[0; 8]), stbl]);
    let mdia = container(b"mdia", &[atom(b"mdhd", &[0; 24]), minf]);
    container(b"trak", &[atom(b"tkhd", &[0; 84]), mdia])
}

pub fn moov(tracks: Vec<Vec<u8>>) -> Vec<u8> {
    let mut children = vec![atom(b"mvhd", &[0; 100])];
    children.extend(tracks);
    container(b"moov", &children)
}

/// Every chunk offset in a buffer of atoms, in tree order.
pub fn chunk_offsets(buf: &[u8]) -> Vec<u64> {
    fn walk(buf: &[u8], out: &mut Vec<u64>) {
        let mut pos = 0;
        while pos + 8 <= buf.len() {
            let size = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            let body = &buf[pos + 8..pos + size];
            match &buf[pos + 4..pos + 8] {
                b"stco" => out.extend(
                    body[8..]
                        .chunks_exact(4)
                        .map(|c| u32::from_be_bytes(c.try_into().unwrap()) as u64),
                ),
                b"co64" => out.extend(
                    body[8..]
                        .chunks_exact(8)
                        .map(|c| u64::from_be_bytes(c.try_into().unwrap())),
                ),
                b"moov" | b"trak" | b"mdia" | b"minf" | b"stbl" => walk(body, out),
                _ => {}
            }
            pos += size;
        }
    }
    let mut out = Vec::new();
    walk(buf, &mut out);
    out
}

/// `ftyp, free, mdat, moov` with chunk offsets into the mdat payload.
///
/// Returns the file and the original offsets; `ftyp` ends at 24.
pub fn trailing_moov_file() -> (Vec<u8>, Vec<u64>) {
    let ftyp = atom(b"ftyp", b"M4A \x00\x00\x02\x00isomiso2");
    let free = atom(b"free", &[0; 8]);
    let payload: Vec<u8> = (0..2000).map(|i| (i * 31 % 251) as u8).collect();
    let payload_start = (ftyp.len() + free.len() + 8) as u64;
    let offsets = vec![
        payload_start,
        payload_start + 100,
        payload_start + 1500,
        payload_start + 1990,
    ];
    let file = [ftyp, free, atom(b"mdat", &payload), trailing_moov(&offsets)].concat();
    (file, offsets)
}

/// The `moov` of `trailing_moov_file` with the given four chunk offsets
pub fn trailing_moov(offsets: &[u64]) -> Vec<u8> {
    moov(vec![
        track(stco(&[offsets[0] as u32, offsets[1] as u32])),
        track(co64(&offsets[2..])),
    ])
}
