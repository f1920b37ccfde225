//! Remote audio source
//!
//! Runs one remote stream on a dedicated worker thread, accepting commands
//! from the handle over a crossbeam channel and emitting `SourceEvent`s back.
//! The worker owns every piece of stream state (position, retry backoff,
//! deinterleaver, current request) and is the only writer of the byte
//! channel and of the atomic snapshots the handle reads.
//!
//! Pipeline:
//!   HttpStreamTask → header classification / ICY sniff
//!                  → MetadataDeinterleaver → BoundedByteChannel → decoder
//!
//! MP4 files requested from offset 0 first go through the
//! `ContainerRestructurer` on a helper thread; when `moov` trails `mdat` the
//! relocated prefix is written first and the main request resumes behind it.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender, TryRecvError};
use reqwest::header::HeaderMap;
use tracing::{debug, info, info_span, warn, Span};

use crate::config::network::{COMMAND_BOUND, MAX_SNIFF_BYTES};
use crate::config::SourceConfig;
use crate::error::{Result, SourceError};
use crate::mp4::{ContainerRestructurer, ProbeOutcome, RestructuredMoov, VirtualOffset};
use crate::stream::channel::{BoundedByteChannel, ChannelStatus, Pull};
use crate::stream::connectivity::{monitor_for, ConnectivityMonitor, NetworkStatus};
use crate::stream::headers::{
    sniff_icy_response, AudioTypeHint, ParsedHeaderOutput, ResponseHeaderInterpreter,
};
use crate::stream::http::{
    HttpStreamTask, HttpTransport, ReqwestTransport, StreamRequest, TaskEvent, TaskId,
};
use crate::stream::icy::MetadataDeinterleaver;
use crate::stream::retry::RetryScheduler;
use crate::stream::types::{
    ExpectedContentLength, SourceEvent, SourceState, StreamDescriptor, StreamPosition,
};

const UNKNOWN_LENGTH: u64 = u64::MAX;

const SEEKABLE_UNKNOWN: u8 = 0;
const SEEKABLE_NO: u8 = 1;
const SEEKABLE_YES: u8 = 2;

/// Snapshots published by the worker for the handle
struct Shared {
    position: AtomicU64,
    length: AtomicU64,
    seekable: AtomicU8,
    state: AtomicU8,
    closed: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            position: AtomicU64::new(0),
            length: AtomicU64::new(UNKNOWN_LENGTH),
            seekable: AtomicU8::new(SEEKABLE_UNKNOWN),
            state: AtomicU8::new(SourceState::Idle as u8),
            closed: AtomicBool::new(false),
        }
    }
}

enum Command {
    /// The handle already reset the channel to `epoch`
    Seek { offset: u64, epoch: u64 },
    Close,
}

/// The parts of the handle a `SourceReader` needs too
#[derive(Clone)]
struct SourceControl {
    cmd_tx: Sender<Command>,
    channel: Arc<BoundedByteChannel>,
    shared: Arc<Shared>,
}

impl SourceControl {
    fn seek(&self, offset: u64) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Closed);
        }
        if offset != 0 && self.shared.seekable.load(Ordering::SeqCst) == SEEKABLE_NO {
            return Err(SourceError::NotSeekable);
        }
        // Resetting here, not on the worker, makes cancellation synchronous:
        // from now on writes of the old request are refused.
        let epoch = self.channel.reset(offset);
        self.shared.position.store(offset, Ordering::SeqCst);
        self.cmd_tx
            .send(Command::Seek { offset, epoch })
            .map_err(|_| SourceError::Closed)
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.channel.close();
        let _ = self.cmd_tx.send(Command::Close);
    }

    fn length(&self) -> Option<u64> {
        match self.shared.length.load(Ordering::SeqCst) {
            UNKNOWN_LENGTH => None,
            len => Some(len),
        }
    }
}

/// A remote audio stream shaped for a pull-based decoder.
///
/// Nothing is requested until `play()` or `seek()`. Bytes are pulled with
/// `try_read`, or through `reader()` for decoders that want `Read + Seek`.
pub struct RemoteAudioSource {
    url: String,
    control: SourceControl,
    event_rx: Receiver<SourceEvent>,
    thread: Option<JoinHandle<()>>,
}

impl RemoteAudioSource {
    /// Source backed by `reqwest`.
    ///
    /// Reachability is watched when `config.connectivity_target` is set;
    /// otherwise the network is assumed to be up.
    pub fn new(url: impl Into<String>, config: SourceConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        let connectivity = monitor_for(&config);
        Self::with_parts(url, config, transport, connectivity)
    }

    /// Source with an explicit transport and connectivity monitor.
    pub fn with_parts(
        url: impl Into<String>,
        config: SourceConfig,
        transport: Arc<dyn HttpTransport>,
        connectivity: Arc<dyn ConnectivityMonitor>,
    ) -> Result<Self> {
        let url = url.into();
        let (cmd_tx, cmd_rx) = bounded::<Command>(COMMAND_BOUND);
        let (event_tx, event_rx) = unbounded::<SourceEvent>();
        let channel = BoundedByteChannel::new(config.channel_capacity);
        let shared = Arc::new(Shared::new());

        let worker = Worker::new(
            url.clone(),
            config,
            transport,
            connectivity,
            channel.clone(),
            shared.clone(),
            event_tx,
        );
        let thread = thread::Builder::new()
            .name("remote-source".to_string())
            .spawn(move || worker.run(cmd_rx))?;

        Ok(Self {
            url,
            control: SourceControl {
                cmd_tx,
                channel,
                shared,
            },
            event_rx,
            thread: Some(thread),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Start from the beginning (`seek(0)`).
    pub fn play(&self) -> Result<()> {
        self.seek(0)
    }

    /// Restart delivery at `offset` of the (virtual) stream.
    ///
    /// Queued bytes are discarded immediately. Fails with `NotSeekable` if
    /// the server is known not to honour ranges and `offset` is not 0.
    pub fn seek(&self, offset: u64) -> Result<()> {
        self.control.seek(offset)
    }

    /// Stop the stream. Readers drain what is queued and then see EOF.
    pub fn close(&self) {
        self.control.close();
    }

    /// Offset of the next byte the worker will deliver
    pub fn position(&self) -> u64 {
        self.control.shared.position.load(Ordering::SeqCst)
    }

    /// Total stream length, 0 while unknown
    pub fn length(&self) -> u64 {
        self.control.length().unwrap_or(0)
    }

    /// `None` until the first response is classified
    pub fn is_seekable(&self) -> Option<bool> {
        match self.control.shared.seekable.load(Ordering::SeqCst) {
            SEEKABLE_YES => Some(true),
            SEEKABLE_NO => Some(false),
            _ => None,
        }
    }

    pub fn state(&self) -> SourceState {
        SourceState::from_u8(self.control.shared.state.load(Ordering::SeqCst))
    }

    /// Take up to `max` bytes without blocking.
    pub fn try_read(&self, max: usize) -> Pull {
        self.control.channel.try_read(max)
    }

    /// Blocking `Read + Seek` view. Its position is the offset of the next
    /// byte it will return, shared with `try_read` and updated by `seek`.
    pub fn reader(&self) -> SourceReader {
        SourceReader {
            control: self.control.clone(),
        }
    }

    /// Event receiver for use with `select!`
    pub fn events(&self) -> &Receiver<SourceEvent> {
        &self.event_rx
    }

    pub fn try_recv_event(&self) -> Option<SourceEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn channel_status(&self) -> ChannelStatus {
        self.control.channel.status()
    }
}

impl Drop for RemoteAudioSource {
    fn drop(&mut self) {
        self.control.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Blocking reader over a source; seeking re-requests from the new offset.
pub struct SourceReader {
    control: SourceControl,
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.control.channel.read_blocking(buf)
    }
}

impl Seek for SourceReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let current = self.control.channel.read_position();
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => current.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let len = self.control.length().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "stream length is unknown")
                })?;
                len.checked_add_signed(delta)
            }
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek out of range"))?;

        if target == current {
            return Ok(target);
        }
        self.control.seek(target).map_err(|e| match e {
            SourceError::NotSeekable => io::Error::new(io::ErrorKind::Unsupported, e),
            other => io::Error::other(other),
        })?;
        Ok(target)
    }
}

/// Whether the restructurer has looked at this URL yet
enum Mp4State {
    Unchecked,
    NotNeeded,
    Restructured(RestructuredMoov),
}

enum PrepareMsg {
    Probed(Result<ProbeOutcome>),
    Restructured(Result<RestructuredMoov>),
}

/// Restructuring running on a helper thread; dropping it cancels the job.
struct PrepareJob {
    restructurer: Arc<ContainerRestructurer>,
    messages: Receiver<PrepareMsg>,
}

impl Drop for PrepareJob {
    fn drop(&mut self) {
        self.restructurer.cancel();
    }
}

/// Bookkeeping for the request currently streaming
#[derive(Default)]
struct ActiveRequest {
    /// Real offset asked for; 0 sends no `Range` header
    range_start: u64,
    /// Audio bytes to drop before delivering (range ignored by the server)
    skip: u64,
    /// Body bytes held back while looking for an in-band header block
    sniff: Option<Vec<u8>>,
    /// Transport status, used when no header block turns up in the body
    status: u16,
}

struct Worker {
    url: String,
    url_hint: AudioTypeHint,
    config: SourceConfig,
    transport: Arc<dyn HttpTransport>,
    _connectivity: Arc<dyn ConnectivityMonitor>,
    channel: Arc<BoundedByteChannel>,
    shared: Arc<Shared>,
    events: Sender<SourceEvent>,
    span: Span,

    epoch: u64,
    position: StreamPosition,
    expected: ExpectedContentLength,
    descriptor: Option<StreamDescriptor>,
    deinterleaver: MetadataDeinterleaver,
    task: Option<HttpStreamTask>,
    next_task_id: TaskId,
    request: ActiveRequest,
    prepare: Option<PrepareJob>,
    mp4: Mp4State,
    retry: RetryScheduler<u64>,
    network: NetworkStatus,
    net_rx: Receiver<NetworkStatus>,
    /// Offset to resume from once the network comes back
    waiting_resume: Option<u64>,
}

impl Worker {
    fn new(
        url: String,
        config: SourceConfig,
        transport: Arc<dyn HttpTransport>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        channel: Arc<BoundedByteChannel>,
        shared: Arc<Shared>,
        events: Sender<SourceEvent>,
    ) -> Self {
        let span = info_span!("remote_source", url = %url);
        let net_rx = connectivity.subscribe();
        let network = connectivity.current();
        let mp4 = if config.optimize_mp4 {
            Mp4State::Unchecked
        } else {
            Mp4State::NotNeeded
        };
        Self {
            url_hint: AudioTypeHint::from_url(&url),
            url,
            retry: RetryScheduler::new(config.retry_base, config.retry_max),
            config,
            transport,
            _connectivity: connectivity,
            epoch: channel.epoch(),
            channel,
            shared,
            events,
            span,
            position: StreamPosition::default(),
            expected: ExpectedContentLength::Undefined,
            descriptor: None,
            deinterleaver: MetadataDeinterleaver::inert(),
            task: None,
            next_task_id: 0,
            request: ActiveRequest::default(),
            prepare: None,
            mp4,
            network,
            net_rx,
            waiting_resume: None,
        }
    }

    fn run(mut self, commands: Receiver<Command>) {
        let span = self.span.clone();
        let _entered = span.enter();
        debug!("source worker started");

        loop {
            // Commands first: a seek must not wait behind events of the
            // request it supersedes.
            loop {
                match commands.try_recv() {
                    Ok(cmd) => {
                        if !self.on_command(cmd) {
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            let task_rx = self
                .task
                .as_ref()
                .map(|task| task.events().clone())
                .unwrap_or_else(never);
            let prepare_rx = self
                .prepare
                .as_ref()
                .map(|job| job.messages.clone())
                .unwrap_or_else(never);
            let timer = self.retry.timer().clone();
            let net_rx = self.net_rx.clone();

            select! {
                recv(commands) -> cmd => match cmd {
                    Ok(cmd) => {
                        if !self.on_command(cmd) {
                            return;
                        }
                    }
                    Err(_) => return,
                },
                recv(task_rx) -> event => match event {
                    Ok(event) => self.on_task_event(event),
                    Err(_) => {
                        self.task = None;
                        self.handle_failure(SourceError::Io(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "request thread exited",
                        )));
                    }
                },
                recv(prepare_rx) -> msg => match msg {
                    Ok(msg) => self.on_prepare(msg),
                    Err(_) => {
                        self.prepare = None;
                        self.fail(SourceError::Stream("restructuring job exited".to_string()));
                    }
                },
                recv(timer) -> _ => {
                    if let Some(offset) = self.retry.fire() {
                        info!(offset, attempt = self.retry.attempts(), "retrying");
                        self.resume(offset);
                    }
                },
                recv(net_rx) -> status => match status {
                    Ok(status) => self.on_network(status),
                    Err(_) => self.net_rx = never(),
                },
            }
        }
    }

    /// Returns false once the worker should exit.
    fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Seek { offset, epoch } => {
                debug!(offset, epoch, "seek");
                self.epoch = epoch;
                self.retry.reset();
                self.start_at(offset);
                true
            }
            Command::Close => {
                debug!("closing");
                self.cancel_inflight();
                self.set_state(SourceState::Closed);
                false
            }
        }
    }

    fn on_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Header { status, headers } => self.on_header(status, headers),
            TaskEvent::Chunk(chunk) => self.on_chunk(chunk),
            TaskEvent::Completed(error) => self.on_completed(error),
        }
    }

    // --- Request lifecycle ---

    fn cancel_inflight(&mut self) {
        self.task = None;
        self.prepare = None;
        self.retry.cancel();
        self.waiting_resume = None;
    }

    /// Deliver from virtual `offset`, translating through a relocated `moov`.
    fn start_at(&mut self, offset: u64) {
        self.cancel_inflight();
        self.position.reset(offset);
        self.publish_position();

        let (prefix, real) = match self.mp4 {
            Mp4State::Unchecked if offset == 0 && self.url_hint.is_mp4() => {
                self.start_prepare();
                return;
            }
            Mp4State::Restructured(ref moov) => match moov.seek_adjusted(offset) {
                VirtualOffset::Prefix(i) => (
                    Some(moov.initial_bytes.slice(i..)),
                    moov.mdat_byte_offset,
                ),
                VirtualOffset::Real(real) => (None, real),
            },
            _ => (None, offset),
        };

        self.set_state(if offset == 0 {
            SourceState::Probing
        } else {
            SourceState::Seeking
        });
        if let Some(prefix) = prefix {
            if !self.deliver(&prefix) {
                return;
            }
        }
        self.open_request(real, 0);
    }

    /// Pick up after a failure at `offset`.
    fn resume(&mut self, offset: u64) {
        if self.shared.seekable.load(Ordering::SeqCst) != SEEKABLE_NO {
            self.start_at(offset);
            return;
        }
        // No ranges: refetch from the start. A finite file skips what the
        // decoder already has; a live stream just carries on.
        let skip = match self.expected {
            ExpectedContentLength::Known(_) => offset,
            ExpectedContentLength::Undefined => 0,
        };
        info!(offset, skip, "source not seekable, restarting request");
        self.cancel_inflight();
        self.set_state(SourceState::Seeking);
        self.open_request(0, skip);
    }

    fn open_request(&mut self, range_start: u64, skip: u64) {
        let id = self.next_task_id;
        self.next_task_id += 1;
        let request =
            StreamRequest::from_config(&self.url, &self.config, (range_start > 0).then_some(range_start));
        debug!(task = id, range_start, skip, "opening stream request");

        self.request = ActiveRequest {
            range_start,
            skip,
            ..ActiveRequest::default()
        };
        self.task = Some(HttpStreamTask::spawn(
            id,
            request,
            self.transport.clone(),
            self.config.chunk_size,
            self.span.clone(),
        ));
    }

    fn on_header(&mut self, status: u16, headers: HeaderMap) {
        match ResponseHeaderInterpreter::parse(status, &headers) {
            Some(parsed) => {
                self.on_response(status, parsed);
            }
            None => {
                debug!(status, "no response headers, looking for them in the body");
                self.request.status = status;
                self.request.sniff = Some(Vec::new());
            }
        }
    }

    /// Classify a response. Returns false when its body must not be used.
    fn on_response(&mut self, status: u16, parsed: ParsedHeaderOutput) -> bool {
        if status == 416 {
            let length = parsed
                .file_length
                .map(|len| self.virtual_length(len))
                .or(self.expected.known());
            debug!(?length, "range not satisfiable, at end of stream");
            if let Some(length) = length {
                self.position.reset(length);
                self.publish_position();
            }
            self.finish();
            return false;
        }
        if status >= 300 {
            self.fail(SourceError::Status(status));
            return false;
        }

        let audio_type = AudioTypeHint::detect(&self.url, parsed.content_type.as_deref());
        let at_start = self.request.range_start == 0 && self.position.absolute() == 0;
        if at_start && matches!(self.mp4, Mp4State::Unchecked) {
            if audio_type.is_mp4() {
                info!(content_type = ?parsed.content_type, "MP4 content, checking moov placement");
                self.start_prepare();
                return false;
            }
            self.mp4 = Mp4State::NotNeeded;
        }

        if status == 200 && self.request.range_start > 0 {
            warn!(
                range_start = self.request.range_start,
                "server ignored range request, skipping forward"
            );
            self.request.skip = self.request.range_start;
        }

        let seekable = parsed.supports_range_requests;
        self.shared.seekable.store(
            if seekable { SEEKABLE_YES } else { SEEKABLE_NO },
            Ordering::SeqCst,
        );

        // An ICY Content-Length counts metadata bytes too; treat as live.
        self.expected = if parsed.metadata_step > 0 {
            ExpectedContentLength::Undefined
        } else {
            match parsed.file_length {
                Some(len) => ExpectedContentLength::Known(self.virtual_length(len)),
                None => self.expected,
            }
        };
        self.shared.length.store(
            self.expected.known().unwrap_or(UNKNOWN_LENGTH),
            Ordering::SeqCst,
        );

        self.deinterleaver = MetadataDeinterleaver::new(parsed.metadata_step);

        let descriptor = StreamDescriptor {
            length: self.expected.known(),
            seekable,
            audio_type,
            metadata_interval: parsed.metadata_step,
            content_type: parsed.content_type,
            station_name: parsed.station_name,
            bitrate: parsed.bitrate,
            restructured: matches!(self.mp4, Mp4State::Restructured(_)),
        };
        if self.descriptor.as_ref() != Some(&descriptor) {
            info!(
                status,
                length = ?descriptor.length,
                seekable,
                audio_type = ?descriptor.audio_type,
                metaint = descriptor.metadata_interval,
                "stream ready"
            );
            self.descriptor = Some(descriptor.clone());
            self.emit(SourceEvent::Ready(descriptor));
        }
        self.set_state(SourceState::Streaming);
        true
    }

    fn on_chunk(&mut self, chunk: Bytes) {
        let body = match self.request.sniff.take() {
            None => chunk,
            Some(mut pending) => {
                pending.extend_from_slice(&chunk);
                let sniffed = sniff_icy_response(&pending);
                match sniffed {
                    Some(sniffed) => {
                        debug!(
                            status = sniffed.status,
                            header_len = sniffed.header_len,
                            "header block found in body"
                        );
                        let parsed =
                            ResponseHeaderInterpreter::parse(sniffed.status, &sniffed.headers)
                                .unwrap_or_default();
                        if !self.on_response(sniffed.status, parsed) {
                            return;
                        }
                        Bytes::from(pending).slice(sniffed.header_len..)
                    }
                    None if pending.len() < MAX_SNIFF_BYTES && could_be_status_line(&pending) => {
                        self.request.sniff = Some(pending);
                        return;
                    }
                    None => {
                        let status = self.request.status;
                        debug!(status, "no header block in body, using transport status");
                        if !self.on_response(status, ParsedHeaderOutput::default()) {
                            return;
                        }
                        Bytes::from(pending)
                    }
                }
            }
        };
        self.deliver_body(body);
    }

    /// Strip metadata, honour a pending skip and hand audio to the channel.
    fn deliver_body(&mut self, body: Bytes) {
        let out = self.deinterleaver.process(body);
        for block in out.metadata {
            debug!(title = ?block.stream_title(), "metadata block");
            self.emit(SourceEvent::Metadata(block));
        }

        let mut audio = out.audio;
        if self.request.skip > 0 {
            let n = usize::try_from(self.request.skip).map_or(audio.len(), |skip| skip.min(audio.len()));
            audio = audio.slice(n..);
            self.request.skip -= n as u64;
        }
        if !audio.is_empty() {
            self.deliver(&audio);
        }
    }

    /// Returns false when the channel refused part of `bytes` (reset/closed).
    fn deliver(&mut self, bytes: &[u8]) -> bool {
        let written = self.channel.write(self.epoch, bytes);
        self.position.advance(written as u64);
        self.publish_position();
        written == bytes.len()
    }

    fn on_completed(&mut self, error: Option<SourceError>) {
        self.task = None;
        match error {
            None => {
                if let Some(pending) = self.request.sniff.take() {
                    if !self.on_response(self.request.status, ParsedHeaderOutput::default()) {
                        return;
                    }
                    if !pending.is_empty() {
                        self.deliver_body(Bytes::from(pending));
                    }
                }
                if let Some(length) = self.expected.known() {
                    let position = self.position.absolute();
                    if position < length {
                        warn!(position, length, "body ended early");
                        self.handle_failure(SourceError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("body ended at {position} of {length} bytes"),
                        )));
                        return;
                    }
                }
                self.finish();
            }
            Some(e) if e.is_transient() => self.handle_failure(e),
            Some(e) => self.fail(e),
        }
    }

    /// Route a transient failure: wait for the network or back off and retry.
    fn handle_failure(&mut self, error: SourceError) {
        let offset = self.position.absolute();
        if !self.network.connected {
            info!(offset, %error, "offline, waiting for network");
            self.waiting_resume = Some(offset);
            self.set_state(SourceState::WaitingForNetwork);
            self.emit(SourceEvent::WaitingForNetwork);
            return;
        }
        match self.retry.retry(offset) {
            Some(delay) => {
                let attempt = self.retry.attempts() + 1;
                warn!(offset, attempt, ?delay, %error, "stream failed, retrying");
                self.set_state(SourceState::Retrying);
                self.emit(SourceEvent::Retrying { attempt, delay });
            }
            None => debug!(%error, "retry already pending"),
        }
    }

    fn on_network(&mut self, status: NetworkStatus) {
        if status == self.network {
            return;
        }
        let was_connected = self.network.connected;
        self.network = status;
        info!(kind = ?status.kind, connected = status.connected, "network changed");

        if was_connected && !status.connected {
            if self.retry.is_pending() {
                let offset = self.position.absolute();
                self.retry.cancel();
                self.waiting_resume = Some(offset);
                self.set_state(SourceState::WaitingForNetwork);
                self.emit(SourceEvent::WaitingForNetwork);
            }
        } else if !was_connected && status.connected {
            if let Some(offset) = self.waiting_resume.take() {
                info!(offset, "network back, resuming");
                self.resume(offset);
            }
        }
    }

    // --- MP4 preparation ---

    fn start_prepare(&mut self) {
        self.cancel_inflight();
        self.set_state(SourceState::Probing);

        let restructurer = Arc::new(ContainerRestructurer::new(
            self.url.as_str(),
            &self.config,
            self.transport.clone(),
            self.span.clone(),
        ));
        let (tx, rx) = bounded(2);
        let job = restructurer.clone();
        let spawned = thread::Builder::new()
            .name("mp4-prepare".to_string())
            .spawn(move || {
                let outcome = job.optimize_if_needed();
                let location = match outcome {
                    Ok(ProbeOutcome::Relocate(ref location)) => Some(location.clone()),
                    _ => None,
                };
                if tx.send(PrepareMsg::Probed(outcome)).is_err() {
                    return;
                }
                if let Some(location) = location {
                    let _ = tx.send(PrepareMsg::Restructured(job.restructure(&location)));
                }
            });

        match spawned {
            Ok(_) => {
                self.prepare = Some(PrepareJob {
                    restructurer,
                    messages: rx,
                })
            }
            Err(e) => self.fail(SourceError::Io(e)),
        }
    }

    fn on_prepare(&mut self, msg: PrepareMsg) {
        match msg {
            PrepareMsg::Probed(Ok(ProbeOutcome::NotNeeded)) => {
                self.prepare = None;
                self.mp4 = Mp4State::NotNeeded;
                self.open_request(0, 0);
            }
            PrepareMsg::Probed(Ok(ProbeOutcome::Relocate(_))) => {
                self.set_state(SourceState::Restructuring);
            }
            PrepareMsg::Restructured(Ok(moov)) => {
                self.prepare = None;
                info!(
                    moov_size = moov.moov_size,
                    resume_offset = moov.mdat_byte_offset,
                    "moov relocated"
                );
                self.mp4 = Mp4State::Restructured(moov);
                self.start_at(0);
            }
            PrepareMsg::Probed(Err(e)) | PrepareMsg::Restructured(Err(e)) => {
                self.prepare = None;
                if e.is_transient() {
                    self.handle_failure(e);
                } else {
                    self.fail(e);
                }
            }
        }
    }

    fn virtual_length(&self, real_length: u64) -> u64 {
        match self.mp4 {
            Mp4State::Restructured(ref moov) => moov.virtual_length(real_length),
            _ => real_length,
        }
    }

    // --- Terminal states ---

    fn finish(&mut self) {
        self.task = None;
        if self.channel.finish(self.epoch) {
            info!(position = self.position.absolute(), "end of stream");
            self.set_state(SourceState::Finished);
            self.emit(SourceEvent::EndOfStream);
        }
    }

    fn fail(&mut self, error: SourceError) {
        self.task = None;
        self.prepare = None;
        if self.channel.fail(self.epoch, error.to_string()) {
            warn!(%error, "stream failed");
            self.set_state(SourceState::Failed);
            self.emit(SourceEvent::Error(error));
        }
    }

    // --- Publishing ---

    fn set_state(&self, state: SourceState) {
        let previous = self.shared.state.swap(state as u8, Ordering::SeqCst);
        if previous != state as u8 {
            debug!(from = ?SourceState::from_u8(previous), to = ?state, "state");
        }
    }

    fn publish_position(&self) {
        // A seek the worker has not picked up yet owns the published position.
        if self.channel.epoch() == self.epoch {
            self.shared
                .position
                .store(self.position.absolute(), Ordering::SeqCst);
        }
    }

    fn emit(&self, event: SourceEvent) {
        let _ = self.events.send(event);
    }
}

/// Whether `prefix` may still turn out to start with a status line.
fn could_be_status_line(prefix: &[u8]) -> bool {
    [&b"ICY "[..], &b"HTTP/"[..]].iter().any(|tag| {
        let n = prefix.len().min(tag.len());
        prefix[..n] == tag[..n]
    })
}
