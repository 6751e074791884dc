//! Bounded, concurrent transcript buffer with chunk reassembly.
//!
//! The buffer accepts whole lines ([`TranscriptBuffer::add`]) and streaming
//! fragments ([`TranscriptBuffer::add_chunk`]) and flushes them in batches
//! to a [`TranscriptSink`]. Three triggers cause a flush: the buffer
//! reaching `max_buffer` lines, the periodic background task, and a manual
//! `flush`/`close`.
//!
//! On a persister error the in-memory batch is dropped rather than
//! re-queued; retrying would grow the buffer without bound while the sink
//! is down, so liveness wins over durability here. The error is returned
//! to `flush`/`close` callers only; `add` never fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::warn;

use super::{Role, TranscriptLine, TranscriptSink};

struct Inner {
    lines: Vec<TranscriptLine>,
    /// Pending chunk accumulator keyed by (phase, iteration)
    chunks: HashMap<(String, u32), String>,
}

/// Per-task transcript buffer. All operations are thread-safe; the inner
/// mutex is never held across an await.
pub struct TranscriptBuffer {
    task_id: String,
    sink: Option<Arc<dyn TranscriptSink>>,
    max_buffer: usize,
    inner: Arc<Mutex<Inner>>,
    closed: Arc<AtomicBool>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TranscriptBuffer {
    /// Create a buffer. `sink` may be `None` when persistence is disabled;
    /// flushes then silently discard buffered lines. A `flush_interval` of
    /// `None` disables the periodic background flush.
    pub fn new(
        task_id: &str,
        sink: Option<Arc<dyn TranscriptSink>>,
        max_buffer: usize,
        flush_interval: Option<Duration>,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            lines: Vec::new(),
            chunks: HashMap::new(),
        }));
        let closed = Arc::new(AtomicBool::new(false));

        let flush_handle = flush_interval.map(|interval| {
            let inner = Arc::clone(&inner);
            let sink = sink.clone();
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(e) = drain_to_sink(&inner, sink.as_deref()).await {
                        warn!(error = %e, "periodic transcript flush failed; batch dropped");
                    }
                }
            })
        });

        Self {
            task_id: task_id.to_string(),
            sink,
            max_buffer,
            inner,
            closed,
            flush_handle: Mutex::new(flush_handle),
        }
    }

    /// Append a complete line. Never fails: a triggered auto-flush that
    /// errors is logged and the batch dropped.
    pub async fn add(&self, phase: &str, iteration: u32, role: Role, content: &str) {
        let line = TranscriptLine::new(&self.task_id, phase, iteration, role, content);
        let should_flush = {
            let mut inner = self.inner.lock().unwrap();
            inner.lines.push(line);
            inner.lines.len() >= self.max_buffer
        };
        if should_flush {
            self.auto_flush().await;
        }
    }

    /// Append a streaming fragment for `(phase, iteration)`.
    ///
    /// Each `\n` inside the accumulated text emits a completed `chunk`
    /// line whose content is the accumulation up to and including the
    /// newline. Characters after the last newline stay pending.
    pub async fn add_chunk(&self, phase: &str, iteration: u32, chunk: &str) {
        let should_flush = {
            let mut inner = self.inner.lock().unwrap();
            let key = (phase.to_string(), iteration);
            let acc = inner.chunks.entry(key).or_default();
            acc.push_str(chunk);

            let mut completed = Vec::new();
            while let Some(pos) = acc.find('\n') {
                let line: String = acc.drain(..=pos).collect();
                completed.push(line);
            }
            if acc.is_empty() {
                inner.chunks.remove(&(phase.to_string(), iteration));
            }
            for content in completed {
                inner.lines.push(TranscriptLine::new(
                    &self.task_id,
                    phase,
                    iteration,
                    Role::Chunk,
                    &content,
                ));
            }
            inner.lines.len() >= self.max_buffer
        };
        if should_flush {
            self.auto_flush().await;
        }
    }

    /// Emit the pending accumulator for `(phase, iteration)` as a single
    /// `chunk` line (no trailing newline is appended) and clear the key.
    pub async fn flush_chunks(&self, phase: &str, iteration: u32) {
        let should_flush = {
            let mut inner = self.inner.lock().unwrap();
            let key = (phase.to_string(), iteration);
            match inner.chunks.remove(&key) {
                Some(pending) if !pending.is_empty() => {
                    inner.lines.push(TranscriptLine::new(
                        &self.task_id,
                        phase,
                        iteration,
                        Role::Chunk,
                        &pending,
                    ));
                    inner.lines.len() >= self.max_buffer
                }
                _ => false,
            }
        };
        if should_flush {
            self.auto_flush().await;
        }
    }

    /// Flush all buffered lines to the sink. The buffer is cleared even
    /// when the sink reports an error; the error is returned to the caller.
    pub async fn flush(&self) -> Result<()> {
        drain_to_sink(&self.inner, self.sink.as_deref()).await
    }

    /// Flush every outstanding chunk accumulator, perform a final flush and
    /// stop the periodic task. Idempotent: second and later calls return
    /// `Ok` without flushing.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let keys: Vec<(String, u32)> = {
            let inner = self.inner.lock().unwrap();
            inner.chunks.keys().cloned().collect()
        };
        for (phase, iteration) in keys {
            self.flush_chunks(&phase, iteration).await;
        }

        let result = self.flush().await;

        if let Some(handle) = self.flush_handle.lock().unwrap().take() {
            handle.abort();
        }

        result
    }

    /// Number of buffered (not yet flushed) lines. Pending chunk
    /// accumulators are not counted until a newline completes them.
    pub fn line_count(&self) -> usize {
        self.inner.lock().unwrap().lines.len()
    }

    async fn auto_flush(&self) {
        if let Err(e) = self.flush().await {
            warn!(task = %self.task_id, error = %e, "transcript auto-flush failed; batch dropped");
        }
    }
}

/// Copy out buffered lines under the lock, release it, then write the
/// batch. The lines are removed from the buffer before the write so a
/// failing sink cannot cause unbounded growth.
async fn drain_to_sink(inner: &Mutex<Inner>, sink: Option<&dyn TranscriptSink>) -> Result<()> {
    let batch = {
        let mut inner = inner.lock().unwrap();
        std::mem::take(&mut inner.lines)
    };
    if batch.is_empty() {
        return Ok(());
    }
    match sink {
        Some(sink) => sink.add_batch(batch).await,
        // Persistence disabled: discard
        None => Ok(()),
    }
}
