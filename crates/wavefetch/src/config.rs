//! Configuration for wavefetch sources
//!
//! Compile-time defaults live in the constant modules; `SourceConfig` carries
//! the per-source runtime settings built from them.

use std::time::Duration;

/// Network-related configuration
pub mod network {
    /// User agent for HTTP requests
    pub const USER_AGENT: &str = concat!("wavefetch/", env!("CARGO_PKG_VERSION"));

    /// Connection timeout in seconds
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;

    /// Longest wait for response headers or for the next body read (seconds)
    pub const READ_TIMEOUT_SECS: u64 = 60;

    /// Size of a single body read on the task thread (bytes)
    pub const CHUNK_SIZE: usize = 16 * 1024;

    /// Chunks a task may queue ahead of the source worker before it blocks
    pub const TASK_EVENT_BOUND: usize = 8;

    /// Body bytes searched for an in-band `ICY 200 OK` header block
    pub const MAX_SNIFF_BYTES: usize = 8 * 1024;

    /// Commands queued from the handle to the source worker
    pub const COMMAND_BOUND: usize = 16;

    /// Interval between TCP reachability checks (seconds)
    pub const CONNECTIVITY_INTERVAL_SECS: u64 = 5;
}

/// Retry backoff configuration
pub mod retry {
    /// Delay of the first retry in seconds; each firing adds one more second
    pub const BASE_INTERVAL_SECS: u64 = 1;

    /// Maximum retry delay in seconds
    pub const MAX_INTERVAL_SECS: u64 = 5;
}

/// Byte channel configuration (producer-consumer hand-off)
pub mod buffer {
    /// Channel capacity (bytes); writers block beyond this
    pub const CHANNEL_CAPACITY: usize = 1024 * 1024;

    /// Maximum time a blocking reader waits before re-checking state (milliseconds)
    pub const CONSUMER_WAIT_TIMEOUT_MS: u64 = 500;

    /// EMA smoothing factor for throughput (0.0–1.0)
    pub const EMA_ALPHA_THROUGHPUT: f64 = 0.3;

    /// Minimum interval between throughput samples (milliseconds)
    pub const MIN_THROUGHPUT_INTERVAL_MS: f64 = 100.0;
}

/// MP4 restructuring limits
pub mod mp4 {
    /// Bytes the probe may read from the start of the file before giving up
    pub const MAX_PROBE_BYTES: u64 = 4 * 1024 * 1024;

    /// Largest `moov` atom the restructurer will buffer (bytes)
    pub const MAX_MOOV_BYTES: u64 = 64 * 1024 * 1024;
}

/// Runtime settings for a `RemoteAudioSource`.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Extra request headers sent with every request.
    pub headers: Vec<(String, String)>,
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Idle timeout: longest wait for headers or for any single body read.
    /// A body that keeps delivering is never cut off.
    pub read_timeout: Duration,
    pub chunk_size: usize,
    pub channel_capacity: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Relocate a trailing `moov` atom of MP4/M4A files before streaming.
    pub optimize_mp4: bool,
    pub max_probe_bytes: u64,
    pub max_moov_bytes: u64,
    /// `host:port` to check reachability against. `None` assumes the
    /// network is always up.
    pub connectivity_target: Option<String>,
    pub connectivity_interval: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            user_agent: network::USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(network::CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(network::READ_TIMEOUT_SECS),
            chunk_size: network::CHUNK_SIZE,
            channel_capacity: buffer::CHANNEL_CAPACITY,
            retry_base: Duration::from_secs(retry::BASE_INTERVAL_SECS),
            retry_max: Duration::from_secs(retry::MAX_INTERVAL_SECS),
            optimize_mp4: true,
            max_probe_bytes: mp4::MAX_PROBE_BYTES,
            max_moov_bytes: mp4::MAX_MOOV_BYTES,
            connectivity_target: None,
            connectivity_interval: Duration::from_secs(network::CONNECTIVITY_INTERVAL_SECS),
        }
    }
}

impl SourceConfig {
    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a custom request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the idle read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the size of body reads.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Set the byte channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Set retry backoff: first delay (also the increment) and the cap.
    pub fn with_retry(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base = base;
        self.retry_max = max.max(base);
        self
    }

    /// Enable or disable MP4 `moov` relocation.
    pub fn with_mp4_optimization(mut self, enabled: bool) -> Self {
        self.optimize_mp4 = enabled;
        self
    }

    /// Set the restructuring size limits.
    pub fn with_mp4_limits(mut self, max_probe_bytes: u64, max_moov_bytes: u64) -> Self {
        self.max_probe_bytes = max_probe_bytes;
        self.max_moov_bytes = max_moov_bytes;
        self
    }

    /// Watch reachability of `target` (`host:port`) every `interval`.
    pub fn with_connectivity_check(mut self, target: impl Into<String>, interval: Duration) -> Self {
        self.connectivity_target = Some(target.into());
        self.connectivity_interval = interval;
        self
    }
}
