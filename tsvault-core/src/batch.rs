//! Write batching
//!
//! `BatchWriter` logs each request to the WAL, buffers it, and periodically
//! hands the buffer to the wrapped storage as one request per tenant.

use crate::context::Context;
use crate::scheduler::PeriodicTask;
use crate::storage::Storage;
use crate::wal::Wal;
use crate::{QueryRequest, QueryResult, Result, TsError, WriteRequest};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Batch writer configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Buffered requests that trigger an immediate flush
    pub buffer_size: usize,
    /// Interval of the background flush
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            buffer_size: crate::config::BATCH_SIZE,
            flush_interval: crate::config::BATCH_FLUSH_INTERVAL,
        }
    }
}

struct BatchState {
    inner: Arc<dyn Storage>,
    buffer: Mutex<Vec<WriteRequest>>,
    buffer_size: usize,
    /// Serializes flushes so batches reach `inner` in buffer order. Held
    /// across the wrapped write; size-triggered flushes skip instead of
    /// waiting on it, and the holder drains a buffer that filled meanwhile.
    flush_lock: Mutex<()>,
}

impl BatchState {
    fn flush(&self) -> Result<()> {
        let _flushing = self.flush_lock.lock();
        self.drain()
    }

    /// Flush unless another flush is running
    fn flush_if_idle(&self) -> Result<()> {
        match self.flush_lock.try_lock() {
            Some(_flushing) => self.drain(),
            None => Ok(()),
        }
    }

    fn drain(&self) -> Result<()> {
        loop {
            self.write_pending()?;
            if self.buffer.lock().len() < self.buffer_size {
                return Ok(());
            }
        }
    }

    /// Write the buffer to `inner`. A retryable failure requeues the batches
    /// not yet written; any other failure drops that tenant's batch, which
    /// the WAL still holds, and the rest are written.
    fn write_pending(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.buffer.lock());
        if pending.is_empty() {
            return Ok(());
        }
        let requests = pending.len();
        let batches = group_by_tenant(pending);
        let tenants = batches.len();

        let ctx = Context::background();
        let mut first_error = None;
        let mut remaining = batches.into_iter();
        while let Some(batch) = remaining.next() {
            match self.inner.write(&ctx, batch.clone()) {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    let mut unwritten = vec![batch];
                    unwritten.extend(remaining);
                    self.requeue(unwritten);
                    return Err(first_error.unwrap_or(e));
                }
                Err(e) => {
                    error!(
                        tenant = %batch.tenant_id,
                        series = batch.series.len(),
                        "Dropping batch that cannot be written: {}",
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        debug!("Flushed {} requests for {} tenants", requests, tenants);
        Ok(())
    }

    /// Put unwritten batches back ahead of anything buffered since
    fn requeue(&self, mut unwritten: Vec<WriteRequest>) {
        let mut buffer = self.buffer.lock();
        warn!("Requeued {} unwritten batches", unwritten.len());
        unwritten.append(&mut buffer);
        *buffer = unwritten;
    }
}

/// Merge requests into one per tenant, tenants in first-seen order and each
/// tenant's series in buffer order
fn group_by_tenant(requests: Vec<WriteRequest>) -> Vec<WriteRequest> {
    let mut batches: Vec<WriteRequest> = Vec::new();
    for req in requests {
        match batches.iter_mut().find(|b| b.tenant_id == req.tenant_id) {
            Some(batch) => batch.series.extend(req.series),
            None => batches.push(req),
        }
    }
    batches
}

/// `Storage` decorator that makes writes durable in the WAL and applies them
/// to the wrapped storage in batches.
///
/// Buffered writes are not visible to queries until flushed.
pub struct BatchWriter {
    state: Arc<BatchState>,
    wal: Option<Arc<Wal>>,
    timer: Mutex<Option<PeriodicTask>>,
    closed: AtomicBool,
}

impl BatchWriter {
    pub fn new(inner: Arc<dyn Storage>, wal: Option<Arc<Wal>>, config: BatchConfig) -> Result<Self> {
        if config.buffer_size == 0 {
            return Err(TsError::Config("batch buffer size must be positive".into()));
        }

        let state = Arc::new(BatchState {
            inner,
            buffer: Mutex::new(Vec::with_capacity(config.buffer_size)),
            buffer_size: config.buffer_size,
            flush_lock: Mutex::new(()),
        });

        let weak: Weak<BatchState> = Arc::downgrade(&state);
        let timer = PeriodicTask::spawn("batch-flush", config.flush_interval, move || {
            match weak.upgrade() {
                Some(state) => state.flush(),
                None => Ok(()),
            }
        })?;

        Ok(Self {
            state,
            wal,
            timer: Mutex::new(Some(timer)),
            closed: AtomicBool::new(false),
        })
    }

    /// Apply everything buffered to the wrapped storage
    pub fn flush(&self) -> Result<()> {
        self.state.flush()
    }

    /// Requests waiting for the next flush
    pub fn pending(&self) -> usize {
        self.state.buffer.lock().len()
    }

    pub fn wal(&self) -> Option<&Arc<Wal>> {
        self.wal.as_ref()
    }
}

impl Storage for BatchWriter {
    fn write(&self, ctx: &Context, req: WriteRequest) -> Result<()> {
        ctx.check()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(TsError::Closed("batch writer"));
        }

        if let Some(wal) = &self.wal {
            wal.append(&req)?;
        }

        let full = {
            let mut buffer = self.state.buffer.lock();
            buffer.push(req);
            buffer.len() >= self.state.buffer_size
        };

        if full {
            self.state.flush_if_idle()?;
        }
        Ok(())
    }

    fn query(&self, ctx: &Context, req: &QueryRequest) -> Result<QueryResult> {
        ctx.check()?;
        self.state.inner.query(ctx, req)
    }

    /// Stop the timer, flush once more, then close the WAL and the wrapped
    /// storage. Anything left unflushed stays recoverable from the WAL.
    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut timer) = self.timer.lock().take() {
            timer.stop();
        }

        let flushed = self.state.flush();
        if let Err(e) = &flushed {
            warn!("Final batch flush failed, {} requests left in WAL: {}", self.pending(), e);
        }
        if let Some(wal) = &self.wal {
            wal.close()?;
        }
        self.state.inner.close()?;
        flushed?;

        info!("Batch writer closed");
        Ok(())
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        if let Some(mut timer) = self.timer.lock().take() {
            timer.stop();
        }
    }
}
