//! Stoppable periodic background tasks
//!
//! The WAL sync and the batch flush each own one of these. A task runs on its
//! own named thread, fires on a fixed interval and is stopped and joined by its
//! owner, so once `stop` returns no further tick can run.

use crate::Result;
use crossbeam_channel::{bounded, select, tick, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// A named background loop calling a closure on every tick
pub struct PeriodicTask {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Start calling `on_tick` every `interval`.
    ///
    /// Errors returned by `on_tick` are logged and the loop keeps going.
    pub fn spawn<F>(name: &str, interval: Duration, mut on_tick: F) -> Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let ticker = tick(interval);
        let task_name = name.to_string();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if let Err(e) = on_tick() {
                                warn!(task = %task_name, "Periodic task failed: {}", e);
                            }
                        }
                    }
                }
                debug!(task = %task_name, "Periodic task stopped");
            })?;

        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Signal the loop to exit and wait for it; idempotent
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the stop channel
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(task = %self.name, "Periodic task panicked");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
