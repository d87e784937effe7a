//! Adaptive Pipelined Writer
//!
//! Streams a source into a backend in chunks, keeping a bounded number of
//! asynchronous chunk writes in flight. The chunk ("window") size adapts to
//! how quickly the source delivers data: a fast source doubles the window up
//! to the maximum, a persistently slow one halves it down to the minimum.
//!
//! ```text
//! source ──fill(window)──▶ [chunk] ──spawn──▶ pending (≤ AIO_CONCURRENT)
//!                              │                    │
//!                        observe(elapsed)     reap finished front
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::BodyReader;
use crate::error::{Error, Result};
use crate::metrics;

/// Maximum chunk writes in flight.
pub const AIO_CONCURRENT: usize = 4;

/// Lower window bound.
pub const MIN_CHUNK_SIZE: u64 = 512 << 10;

/// Upper window bound.
pub const MAX_CHUNK_SIZE: u64 = 8 << 20;

/// Consecutive slow fills tolerated before shrinking.
const SLOW_FILLS_BEFORE_SHRINK: u32 = 2;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the pipelined writer
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Smallest window
    pub min_chunk: u64,

    /// Largest window
    pub max_chunk: u64,

    /// Chunk writes allowed in flight
    pub concurrency: usize,

    /// Timeout for a single source read
    pub read_timeout: Duration,

    /// Timeout for a single chunk write
    pub write_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            min_chunk: MIN_CHUNK_SIZE,
            max_chunk: MAX_CHUNK_SIZE,
            concurrency: AIO_CONCURRENT,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Window Controller
// =============================================================================

/// Outcome of one window observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowChange {
    Grew,
    Shrank,
    Unchanged,
}

/// Tracks the adaptive window size.
#[derive(Debug, Clone)]
pub struct WindowController {
    window: u64,
    min: u64,
    max: u64,
    slow_count: u32,
}

impl WindowController {
    /// Start at the minimum window.
    pub fn new(min: u64, max: u64) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self {
            window: min,
            min,
            max,
            slow_count: 0,
        }
    }

    /// Current window size.
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Feed one fill measurement: `bytes_filled` arrived in `elapsed`.
    ///
    /// The expected fill time is `bytes_filled / window` seconds. A fill
    /// taking more than twice that counts as slow; three slow fills in a row
    /// halve the window. A fill beating the expectation doubles it.
    pub fn observe(&mut self, bytes_filled: u64, elapsed: Duration) -> WindowChange {
        let elapsed_ns = elapsed.as_nanos();
        let expected_ns = (bytes_filled as u128).saturating_mul(1_000_000_000) / self.window as u128;

        if elapsed_ns > expected_ns.saturating_mul(2) {
            let mut change = WindowChange::Unchanged;
            if self.slow_count > SLOW_FILLS_BEFORE_SHRINK && self.window > self.min {
                self.window = (self.window / 2).max(self.min);
                self.slow_count = 0;
                change = WindowChange::Shrank;
            }
            self.slow_count = self.slow_count.saturating_add(1);
            change
        } else if expected_ns > elapsed_ns {
            self.slow_count = 0;
            if self.window < self.max {
                self.window = self.window.saturating_mul(2).min(self.max);
                return WindowChange::Grew;
            }
            WindowChange::Unchanged
        } else {
            WindowChange::Unchanged
        }
    }
}

// =============================================================================
// Chunk Sink
// =============================================================================

/// Destination of chunk writes.
#[async_trait]
pub trait ChunkSink: Send + Sync + 'static {
    /// Write `data` at logical `offset`.
    async fn write_chunk(&self, offset: u64, data: Bytes) -> Result<()>;
}

// =============================================================================
// Writer
// =============================================================================

/// Summary of a completed pipelined write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes consumed from the source and written.
    pub bytes: u64,
    /// Chunks submitted.
    pub chunks: u64,
    /// Window size at completion.
    pub final_window: u64,
}

/// Streams a source into a [`ChunkSink`].
pub struct PipelinedWriter {
    config: WriterConfig,
    sink: Arc<dyn ChunkSink>,
    cancel: Option<CancellationToken>,
}

impl PipelinedWriter {
    pub fn new(config: WriterConfig, sink: Arc<dyn ChunkSink>) -> Self {
        Self {
            config,
            sink,
            cancel: None,
        }
    }

    /// Abort the write when `token` fires. Outstanding chunks are drained first.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Copy `body` into the sink starting at `start_offset`.
    pub async fn write_all(&self, body: &mut BodyReader<'_>, start_offset: u64) -> Result<WriteOutcome> {
        let concurrency = self.config.concurrency.max(1);
        let mut window = WindowController::new(self.config.min_chunk, self.config.max_chunk);
        let mut pending: VecDeque<JoinHandle<Result<()>>> = VecDeque::with_capacity(concurrency);
        let mut offset = start_offset;
        let mut chunks = 0u64;

        loop {
            let target = window.window() as usize;
            let started = Instant::now();
            let (buf, eof) = match self.fill(body, target).await {
                Ok(filled) => filled,
                Err(e) => {
                    drain(&mut pending).await;
                    return Err(e);
                }
            };
            let elapsed = started.elapsed();
            let filled = buf.len() as u64;

            if filled > 0 {
                if let Err(e) = reap(&mut pending, concurrency).await {
                    drain(&mut pending).await;
                    return Err(e);
                }
                pending.push_back(self.submit(offset, buf));
                offset += filled;
                chunks += 1;
            }

            if eof {
                break;
            }

            match window.observe(filled, elapsed) {
                WindowChange::Grew => {
                    metrics::window_resize("grow");
                    debug!("Upload window grew to {}", window.window());
                }
                WindowChange::Shrank => {
                    metrics::window_resize("shrink");
                    debug!("Upload window shrank to {}", window.window());
                }
                WindowChange::Unchanged => {}
            }
        }

        let mut first_err = None;
        while let Some(handle) = pending.pop_front() {
            if let Err(e) = join(handle).await {
                first_err.get_or_insert(e);
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        Ok(WriteOutcome {
            bytes: offset - start_offset,
            chunks,
            final_window: window.window(),
        })
    }

    fn submit(&self, offset: u64, data: Bytes) -> JoinHandle<Result<()>> {
        let sink = self.sink.clone();
        let write_timeout = self.config.write_timeout;
        tokio::spawn(async move {
            let len = data.len();
            match tokio::time::timeout(write_timeout, sink.write_chunk(offset, data)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation: format!("chunk write of {} bytes at {}", len, offset),
                    duration: write_timeout,
                }),
            }
        })
    }

    /// Read until `target` bytes are buffered or the source ends.
    async fn fill(&self, body: &mut BodyReader<'_>, target: usize) -> Result<(Bytes, bool)> {
        let mut buf = BytesMut::zeroed(target);
        let mut filled = 0;
        while filled < target {
            let n = self.read_once(body, &mut buf[filled..]).await?;
            if n == 0 {
                buf.truncate(filled);
                return Ok((buf.freeze(), true));
            }
            filled += n;
        }
        Ok((buf.freeze(), false))
    }

    async fn read_once(&self, body: &mut BodyReader<'_>, buf: &mut [u8]) -> Result<usize> {
        let read_timeout = self.config.read_timeout;
        let read = tokio::time::timeout(read_timeout, body.read(buf));
        let result = match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled("upload".to_string())),
                r = read => r,
            },
            None => read.await,
        };
        match result {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Timeout {
                operation: "source read".to_string(),
                duration: read_timeout,
            }),
        }
    }
}

/// Pop finished completions, then wait until there is room for one more.
async fn reap(pending: &mut VecDeque<JoinHandle<Result<()>>>, concurrency: usize) -> Result<()> {
    while pending.front().map(|h| h.is_finished()).unwrap_or(false) {
        if let Some(handle) = pending.pop_front() {
            join(handle).await?;
        }
    }
    while pending.len() >= concurrency {
        if let Some(handle) = pending.pop_front() {
            join(handle).await?;
        }
    }
    Ok(())
}

/// Wait for every outstanding completion, discarding results.
async fn drain(pending: &mut VecDeque<JoinHandle<Result<()>>>) {
    while let Some(handle) = pending.pop_front() {
        if let Err(e) = join(handle).await {
            warn!("Chunk write failed while draining: {}", e);
        }
    }
}

async fn join(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .await
        .map_err(|e| Error::Internal(format!("chunk write task failed: {}", e)))?
}
