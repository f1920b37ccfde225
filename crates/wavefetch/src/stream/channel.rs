//! Bounded byte channel between the network and the decoder
//!
//! The source worker writes shaped audio bytes into the channel; the decoder
//! pulls them out. Writers block once `capacity` bytes are queued, so a slow
//! decoder throttles the network instead of growing memory.
//!
//! Architecture:
//!   HttpStreamTask → source worker (ICY strip, MP4 prefix)
//!                  ↓ write(epoch, bytes), blocks when full
//!            BoundedByteChannel (`VecDeque<u8>` + Mutex + Condvar)
//!                  ↓ try_read / read_blocking
//!            decoder
//!
//! Every write is stamped with an epoch. `reset(offset)` (a seek) discards
//! queued bytes and moves to the next epoch, so writes belonging to the
//! superseded request, including one currently blocked, return without
//! delivering. The channel also tracks the stream offset of the next byte a
//! reader will take; reads advance it under the same lock that drains.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::buffer::{
    CONSUMER_WAIT_TIMEOUT_MS, EMA_ALPHA_THROUGHPUT, MIN_THROUGHPUT_INTERVAL_MS,
};

/// Network throughput metrics (EMA-smoothed)
struct NetworkMetrics {
    throughput_ema: f64,
    last_sample: Instant,
    total_bytes: u64,
    underrun_count: u32,
    /// Bytes accumulated since last EMA update (filters burst writes)
    pending_bytes: usize,
}

impl NetworkMetrics {
    fn new() -> Self {
        Self {
            throughput_ema: 0.0,
            last_sample: Instant::now(),
            total_bytes: 0,
            underrun_count: 0,
            pending_bytes: 0,
        }
    }

    fn record_write(&mut self, bytes: usize) {
        self.total_bytes += bytes as u64;
        self.pending_bytes += bytes;

        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_sample).as_secs_f64() * 1000.0;
        if elapsed_ms >= MIN_THROUGHPUT_INTERVAL_MS {
            let throughput = (self.pending_bytes as f64 / elapsed_ms) * 1000.0; // bytes/sec
            if self.throughput_ema == 0.0 {
                self.throughput_ema = throughput;
            } else {
                self.throughput_ema = EMA_ALPHA_THROUGHPUT * throughput
                    + (1.0 - EMA_ALPHA_THROUGHPUT) * self.throughput_ema;
            }
            self.pending_bytes = 0;
            self.last_sample = now;
        }
    }

    fn throughput_kbps(&self) -> f64 {
        (self.throughput_ema * 8.0) / 1000.0
    }
}

/// Snapshot of channel state for diagnostics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStatus {
    pub level_bytes: usize,
    pub capacity_bytes: usize,
    pub total_bytes: u64,
    pub throughput_kbps: f64,
    pub underrun_count: u32,
    pub closed: bool,
}

/// Result of a non-blocking pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pull {
    /// Bytes that were immediately available (never empty)
    Data(Bytes),
    /// Nothing queued yet; the producer is still running
    Empty,
    /// Finished and fully drained
    End,
    /// Failed and fully drained; carries the producer's message
    Failed(String),
}

struct ChannelInner {
    data: VecDeque<u8>,
    capacity: usize,
    epoch: u64,
    /// Stream offset of the next byte handed to a reader
    read_offset: u64,
    closed: bool,
    /// Terminal error handed to blocking readers after the queue drains
    error: Option<String>,
    metrics: NetworkMetrics,
}

/// Fixed-capacity byte conduit with blocking writes.
pub struct BoundedByteChannel {
    inner: Mutex<ChannelInner>,
    data_available: Condvar,
    space_available: Condvar,
}

impl BoundedByteChannel {
    /// Create a channel holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            inner: Mutex::new(ChannelInner {
                data: VecDeque::with_capacity(capacity.min(64 * 1024)),
                capacity,
                epoch: 0,
                read_offset: 0,
                closed: false,
                error: None,
                metrics: NetworkMetrics::new(),
            }),
            data_available: Condvar::new(),
            space_available: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current epoch; writes must carry it to be accepted.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Write all of `bytes`, blocking while the channel is full.
    ///
    /// Returns the number of bytes accepted. The count is short only when the
    /// channel was closed or reset to a newer epoch while writing; after
    /// `close()` it is 0.
    pub fn write(&self, epoch: u64, bytes: &[u8]) -> usize {
        let mut inner = self.lock();
        let mut written = 0;

        while written < bytes.len() {
            if inner.closed || inner.epoch != epoch {
                break;
            }

            let space = inner.capacity.saturating_sub(inner.data.len());
            if space == 0 {
                inner = self
                    .space_available
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            let n = space.min(bytes.len() - written);
            inner.data.extend(&bytes[written..written + n]);
            inner.metrics.record_write(n);
            written += n;
            self.data_available.notify_all();
        }

        written
    }

    /// Take up to `max` bytes without blocking.
    pub fn try_read(&self, max: usize) -> Pull {
        let mut inner = self.lock();
        if inner.data.is_empty() {
            if inner.closed {
                return match inner.error {
                    Some(ref msg) => Pull::Failed(msg.clone()),
                    None => Pull::End,
                };
            }
            if max > 0 {
                inner.metrics.underrun_count += 1;
            }
            return Pull::Empty;
        }
        if max == 0 {
            return Pull::Data(Bytes::new());
        }

        let n = max.min(inner.data.len());
        let out: Vec<u8> = inner.data.drain(..n).collect();
        inner.read_offset += n as u64;
        self.space_available.notify_all();
        Pull::Data(Bytes::from(out))
    }

    /// Copy queued bytes into `buf`, waiting until at least one is available.
    ///
    /// Returns `Ok(0)` only once the channel is closed and drained; a channel
    /// closed with an error yields that error instead.
    pub fn read_blocking(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let timeout = Duration::from_millis(CONSUMER_WAIT_TIMEOUT_MS);
        let mut inner = self.lock();
        let mut counted_underrun = false;

        loop {
            if !inner.data.is_empty() {
                let n = buf.len().min(inner.data.len());
                for (slot, byte) in buf.iter_mut().zip(inner.data.drain(..n)) {
                    *slot = byte;
                }
                inner.read_offset += n as u64;
                self.space_available.notify_all();
                return Ok(n);
            }

            if inner.closed {
                return match inner.error {
                    Some(ref msg) => Err(io::Error::other(msg.clone())),
                    None => Ok(0),
                };
            }

            if !counted_underrun {
                inner.metrics.underrun_count += 1;
                counted_underrun = true;
            }

            // Loop on timeout; returning 0 here would read as end-of-stream.
            let (guard, _) = self
                .data_available
                .wait_timeout(inner, timeout)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    /// Mark end-of-stream. Idempotent; wakes blocked readers and writers.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        drop(inner);
        self.data_available.notify_all();
        self.space_available.notify_all();
    }

    /// Producer end-of-stream for `epoch`: readers drain what is queued,
    /// then see EOF. Ignored (returns false) once a reset superseded `epoch`.
    pub fn finish(&self, epoch: u64) -> bool {
        self.close_epoch(epoch, None)
    }

    /// Terminal producer failure for `epoch`, reported to blocking readers
    /// after the queue drains.
    pub fn fail(&self, epoch: u64, message: impl Into<String>) -> bool {
        self.close_epoch(epoch, Some(message.into()))
    }

    fn close_epoch(&self, epoch: u64, error: Option<String>) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        if !inner.closed {
            inner.error = error;
            inner.closed = true;
        }
        drop(inner);
        self.data_available.notify_all();
        self.space_available.notify_all();
        true
    }

    /// Discard queued bytes, reopen, and advance to a new epoch whose first
    /// byte sits at stream `offset`.
    pub fn reset(&self, offset: u64) -> u64 {
        let mut inner = self.lock();
        inner.data.clear();
        inner.read_offset = offset;
        inner.closed = false;
        inner.error = None;
        inner.epoch += 1;
        let epoch = inner.epoch;
        drop(inner);
        self.data_available.notify_all();
        self.space_available.notify_all();
        epoch
    }

    /// Stream offset of the next byte a reader will receive
    pub fn read_position(&self) -> u64 {
        self.lock().read_offset
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Bytes currently queued
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> ChannelStatus {
        let inner = self.lock();
        ChannelStatus {
            level_bytes: inner.data.len(),
            capacity_bytes: inner.capacity,
            total_bytes: inner.metrics.total_bytes,
            throughput_kbps: inner.metrics.throughput_kbps(),
            underrun_count: inner.metrics.underrun_count,
            closed: inner.closed,
        }
    }
}
