//! Asynchronous events processor
//!
//! The sampling producer only enqueues; a tokio task applies code events
//! and tick samples to the generator in arrival order. Code events go
//! through the same queue so that a sample always resolves against the
//! code layout that was current when it was taken.

use aperture_shared::types::events::{CodeEvent, TickSample};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collector::generator::ProfileGenerator;
use crate::error::{ProfilerError, Result};

/// Work item for the processor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorEvent {
    Code(CodeEvent),
    Tick(TickSample),
}

#[derive(Debug)]
enum Command {
    Event(ProcessorEvent),
    /// Answered once everything queued before it has been applied
    Flush(oneshot::Sender<()>),
    Stop,
}

/// What a processor run handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub ticks: u64,
    pub code_events: u64,
}

/// Handle to a running processor task
#[derive(Debug)]
pub struct ProcessorHandle {
    tx: mpsc::UnboundedSender<Command>,
    backlog: Arc<AtomicUsize>,
    queue_warn: usize,
    task: JoinHandle<ProcessorStats>,
}

impl ProcessorHandle {
    /// Spawn the processor on `runtime`.
    pub fn spawn(runtime: &Handle, generator: Arc<ProfileGenerator>, queue_warn: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));

        let task = {
            let backlog = backlog.clone();
            runtime.spawn(async move {
                let mut stats = ProcessorStats::default();
                while let Some(command) = rx.recv().await {
                    match command {
                        Command::Event(ProcessorEvent::Code(event)) => {
                            generator.process_code_event(&event);
                            stats.code_events += 1;
                        }
                        Command::Event(ProcessorEvent::Tick(sample)) => {
                            generator.record_tick_sample(&sample);
                            stats.ticks += 1;
                        }
                        Command::Flush(done) => {
                            // The waiter may have given up
                            let _ = done.send(());
                            continue;
                        }
                        Command::Stop => break,
                    }
                    backlog.fetch_sub(1, Ordering::Relaxed);
                }
                debug!(
                    "Events processor finished: {} ticks, {} code events",
                    stats.ticks, stats.code_events
                );
                stats
            })
        };

        info!("Events processor started");
        Self {
            tx,
            backlog,
            queue_warn,
            task,
        }
    }

    /// Queue an event. Never blocks.
    pub fn enqueue(&self, event: ProcessorEvent) -> Result<()> {
        let queued = self.backlog.fetch_add(1, Ordering::Relaxed) + 1;
        if queued == self.queue_warn {
            warn!("Events processor backlog reached {} events", queued);
        }
        self.tx.send(Command::Event(event)).map_err(|_| {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
            ProfilerError::ProcessorStopped
        })
    }

    /// Queue a barrier now; the returned future resolves once every event
    /// queued before this call has been applied.
    ///
    /// The barrier is placed synchronously, so callers can queue it while
    /// holding a lock and await it after releasing the lock.
    pub fn flush_barrier(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let (done_tx, done_rx) = oneshot::channel();
        // If the task is gone the sender is dropped and the wait fails.
        let _ = self.tx.send(Command::Flush(done_tx));
        async move { done_rx.await.map_err(|_| ProfilerError::ProcessorStopped) }
    }

    /// Wait until every event queued so far has been applied.
    pub async fn flush(&self) -> Result<()> {
        self.flush_barrier().await
    }

    /// Events queued but not yet applied
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn abort(&self) {
        self.task.abort();
    }

    /// Apply everything queued so far, then end the task.
    pub async fn stop(self) -> Result<ProcessorStats> {
        // A send failure means the task already ended; joining reports why.
        let _ = self.tx.send(Command::Stop);
        let stats = self
            .task
            .await
            .map_err(|e| ProfilerError::ProcessorFailed(e.to_string()))?;
        info!(
            "Events processor stopped after {} ticks and {} code events",
            stats.ticks, stats.code_events
        );
        Ok(stats)
    }
}
