//! HTTP request tasks
//!
//! Each request runs on its own thread and reports through a bounded event
//! channel: at most one `Header`, any number of `Chunk`s, then exactly one
//! `Completed`. A full channel blocks the reading thread, so a slow consumer
//! slows the socket down instead of buffering without limit.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, RANGE, USER_AGENT,
};
use tracing::{debug, warn, Span};

use crate::config::network::TASK_EVENT_BOUND;
use crate::config::SourceConfig;
use crate::error::{Result, SourceError};

/// One GET request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub url: String,
    /// Sends `Range: bytes=<start>-` when set
    pub range_start: Option<u64>,
    pub headers: Vec<(String, String)>,
    pub user_agent: String,
}

impl StreamRequest {
    pub fn from_config(url: &str, config: &SourceConfig, range_start: Option<u64>) -> Self {
        Self {
            url: url.to_string(),
            range_start,
            headers: config.headers.clone(),
            user_agent: config.user_agent.clone(),
        }
    }

    /// Full header set for this request.
    ///
    /// Custom headers come last and replace defaults of the same name;
    /// ones that are not valid HTTP are skipped.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(ACCEPT, HeaderValue::from_static("*/*"));
        map.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        map.insert("icy-metadata", HeaderValue::from_static("1"));
        if let Ok(agent) = HeaderValue::from_str(&self.user_agent) {
            map.insert(USER_AGENT, agent);
        }
        if let Some(start) = self.range_start {
            if let Ok(range) = HeaderValue::from_str(&format!("bytes={start}-")) {
                map.insert(RANGE, range);
            }
        }
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => warn!(header = %name, "skipping invalid request header"),
            }
        }
        map
    }
}

/// Status, headers and a body still to be read
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Box<dyn Read + Send>,
}

/// Opens requests; the body is read by the calling task thread.
pub trait HttpTransport: Send + Sync {
    fn open(&self, request: &StreamRequest) -> Result<HttpResponse>;
}

/// Transport backed by a blocking `reqwest` client.
///
/// The client timeout bounds each wait on the socket, not the whole body,
/// so a live stream can run for as long as data keeps arriving.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn open(&self, request: &StreamRequest) -> Result<HttpResponse> {
        let response = self
            .client
            .get(&request.url)
            .headers(request.header_map())
            .send()?;
        Ok(HttpResponse {
            status: response.status().as_u16(),
            headers: response.headers().clone(),
            body: Box::new(response),
        })
    }
}

pub type TaskId = u64;

/// Progress of one request
#[derive(Debug)]
pub enum TaskEvent {
    Header { status: u16, headers: HeaderMap },
    Chunk(Bytes),
    /// `None` is a clean end of body
    Completed(Option<SourceError>),
}

/// Handle to a request running on its own thread.
///
/// Dropping the handle cancels the request without waiting for the thread.
pub struct HttpStreamTask {
    id: TaskId,
    cancelled: Arc<AtomicBool>,
    events: Receiver<TaskEvent>,
    _handle: Option<JoinHandle<()>>,
}

impl HttpStreamTask {
    pub fn spawn(
        id: TaskId,
        request: StreamRequest,
        transport: Arc<dyn HttpTransport>,
        chunk_size: usize,
        span: Span,
    ) -> Self {
        let (tx, events) = bounded(TASK_EVENT_BOUND);
        let cancelled = Arc::new(AtomicBool::new(false));

        let thread_cancelled = cancelled.clone();
        let thread_tx = tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("http-task-{id}"))
            .spawn(move || {
                let _entered = span.enter();
                run_task(
                    id,
                    &request,
                    transport.as_ref(),
                    chunk_size.max(1),
                    &thread_cancelled,
                    &thread_tx,
                );
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                let _ = tx.send(TaskEvent::Completed(Some(SourceError::Io(e))));
                None
            }
        };

        Self {
            id,
            cancelled,
            events,
            _handle: handle,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn events(&self) -> &Receiver<TaskEvent> {
        &self.events
    }

    /// Stop delivering events. The thread exits at its next send or read.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Drop for HttpStreamTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run_task(
    id: TaskId,
    request: &StreamRequest,
    transport: &dyn HttpTransport,
    chunk_size: usize,
    cancelled: &AtomicBool,
    tx: &Sender<TaskEvent>,
) {
    let send = |event: TaskEvent| -> bool {
        !cancelled.load(Ordering::SeqCst) && tx.send(event).is_ok()
    };

    debug!(task = id, url = %request.url, range = ?request.range_start, "opening request");
    let response = match transport.open(request) {
        Ok(response) => response,
        Err(e) => {
            send(TaskEvent::Completed(Some(e)));
            return;
        }
    };

    let HttpResponse {
        status,
        headers,
        mut body,
    } = response;
    if !send(TaskEvent::Header { status, headers }) {
        return;
    }

    let mut buf = vec![0u8; chunk_size];
    let mut total: u64 = 0;
    loop {
        if cancelled.load(Ordering::SeqCst) {
            debug!(task = id, total, "request cancelled");
            return;
        }
        match body.read(&mut buf) {
            Ok(0) => {
                debug!(task = id, total, "body complete");
                send(TaskEvent::Completed(None));
                return;
            }
            Ok(n) => {
                total += n as u64;
                if !send(TaskEvent::Chunk(Bytes::copy_from_slice(&buf[..n]))) {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(task = id, total, error = %e, "body read failed");
                send(TaskEvent::Completed(Some(read_error(e))));
                return;
            }
        }
    }
}

fn read_error(e: io::Error) -> SourceError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            SourceError::Timeout(format!("body read: {e}"))
        }
        _ => SourceError::Io(e),
    }
}
