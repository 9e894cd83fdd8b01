//! Paced, bounded-concurrency request queue.
//!
//! ## Dispatch model
//!
//! Submitted tasks wait in a FIFO sequence. A dispatch step runs whenever
//! fewer than `max_concurrent` tasks are active and work is pending: it pops
//! the head, runs it to completion, records the outcome, and then, only if
//! more work is still queued, waits `delay` before trying the next step.
//! The wait throttles the description service independently of the
//! concurrency width, so a freed slot never turns a backlog into a burst.
//!
//! A slot that is waiting out the delay still holds its place against the
//! ceiling, so work submitted during the wait cannot jump in early.
//!
//! Dispatch *start* is FIFO; completion order is whatever the tasks' latencies
//! make it. A failing or panicking task only fails its own caller.
//!
//! ```text
//! submit ─▶ [T4 T3 T2] ─▶ slot 1: T1 ──done──▶ wait D ─▶ pop T2 …
//!                          slot 2: …
//! ```

use crate::error::{TaskDiscarded, TaskPanicked};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A deferred unit of work; resolves to whether it succeeded.
type Job = Box<dyn FnOnce() -> BoxFuture<'static, bool> + Send>;

/// Aggregate queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub queued: usize,
    pub active: usize,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    active: usize,
    /// Slots waiting out the pacing delay before their next dispatch.
    pacing: usize,
    total: u64,
    success: u64,
    failed: u64,
}

struct Inner {
    max_concurrent: usize,
    delay: Duration,
    state: Mutex<QueueState>,
    shutdown: CancellationToken,
}

/// Cheaply cloneable handle; clones share one queue.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("delay", &self.inner.delay)
            .field("stats", &self.get_stats())
            .finish()
    }
}

impl RequestQueue {
    pub fn new(max_concurrent: usize, delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_concurrent: max_concurrent.max(1),
                delay,
                state: Mutex::new(QueueState::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Queue `task` and wait for its outcome.
    ///
    /// The task is not started until it reaches the head of the queue and a
    /// slot is free. If the queue is cleared first, the caller gets
    /// `E::from(TaskDiscarded)`; if the task panics, `E::from(TaskPanicked)`
    /// and the slot is returned to the queue.
    pub async fn submit<F, Fut, T, E>(&self, task: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<TaskDiscarded> + From<TaskPanicked> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(E::from(TaskDiscarded));
        }

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let result = match AssertUnwindSafe(async move { task().await })
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => {
                        let detail = panic_message(&*panic);
                        warn!("Queued task panicked: {}", detail);
                        Err(E::from(TaskPanicked { detail }))
                    }
                };
                let ok = result.is_ok();
                // The caller may have stopped waiting; the outcome still counts.
                let _ = tx.send(result);
                ok
            })
        });

        {
            let mut state = self.inner.lock();
            state.pending.push_back(job);
            state.total += 1;
            trace!(
                "Queued task (pending={}, active={})",
                state.pending.len(),
                state.active
            );
        }
        self.dispatch();

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(E::from(TaskDiscarded)),
        }
    }

    pub fn get_stats(&self) -> QueueStats {
        let state = self.inner.lock();
        QueueStats {
            total: state.total,
            success: state.success,
            failed: state.failed,
            queued: state.pending.len(),
            active: state.active,
        }
    }

    /// Drop every task that has not been dispatched yet.
    ///
    /// Running tasks finish normally. Discarded callers observe
    /// [`TaskDiscarded`]. Intended for teardown.
    pub fn clear(&self) -> usize {
        let dropped: Vec<Job> = self.inner.lock().pending.drain(..).collect();
        if !dropped.is_empty() {
            debug!("Discarded {} pending task(s)", dropped.len());
        }
        dropped.len()
    }

    /// Stop dispatching: discard pending work and cut pacing waits short.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Start a dispatch loop if a slot is free.
    fn dispatch(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_slot().await });
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the head task if a slot is free.
    ///
    /// `paced` is set when the caller is a slot returning from its delay and
    /// hands back its reservation.
    fn next_job(&self, paced: bool) -> Option<Job> {
        let mut state = self.lock();
        if paced {
            state.pacing -= 1;
        }
        if self.shutdown.is_cancelled() || state.active + state.pacing >= self.max_concurrent {
            return None;
        }
        let job = state.pending.pop_front()?;
        state.active += 1;
        Some(job)
    }

    async fn run_slot(self: Arc<Self>) {
        let mut paced = false;
        while let Some(job) = self.next_job(paced) {
            let ok = job().await;

            let more = {
                let mut state = self.lock();
                state.active -= 1;
                if ok {
                    state.success += 1;
                } else {
                    state.failed += 1;
                }
                let more = !state.pending.is_empty();
                if more {
                    state.pacing += 1;
                }
                more
            };
            if !more {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = self.shutdown.cancelled() => {}
            }
            paced = true;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
