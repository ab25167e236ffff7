//! Worker pool shared by the indexes, codecs and hybrid search.
//!
//! Wraps an owned `rayon::ThreadPool`. Detached tasks go through
//! [`TaskPool::submit`], which hands back a [`TaskHandle`] fed by a one-shot
//! channel; a small tracker counts queued and running tasks so
//! [`TaskPool::wait_all`] can act as a barrier.
//!
//! The pool is constructed explicitly and injected (as `Arc<TaskPool>`) into
//! each component. [`TaskPool::shutdown`] stops intake and drains every task
//! already accepted; dropping the pool runs the same sequence and then
//! releases the workers.
//!
//! Fan-out (`parallel_for`, `parallel_map`, `map_chunks`) splits `[0, count)`
//! into one contiguous chunk per worker and runs them inside the pool, so chunk
//! closures may borrow from the caller's stack. Fan-out issued from a worker
//! nests through rayon's work stealing instead of blocking the worker.

use crate::error::{Result, VdbError};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Default)]
struct Counters {
    queued: usize,
    running: usize,
    shutdown: bool,
}

/// Bookkeeping for submitted tasks, kept apart from rayon's own queues.
#[derive(Default)]
struct Tracker {
    state: Mutex<Counters>,
    idle: Condvar,
}

impl Tracker {
    fn start(&self) {
        let mut state = self.state.lock();
        state.queued -= 1;
        state.running += 1;
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        state.running -= 1;
        if state.running == 0 && state.queued == 0 {
            self.idle.notify_all();
        }
    }
}

/// Handle to the result of a task scheduled with [`TaskPool::submit`].
pub struct TaskHandle<T> {
    rx: Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task completes and return its value or error.
    /// A panicking task is reported as [`VdbError::TaskFailed`].
    pub fn wait(self) -> Result<T> {
        match self.rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(VdbError::TaskFailed(
                "task was dropped before completion".to_string(),
            )),
        }
    }
}

/// Fixed-size pool of worker threads.
pub struct TaskPool {
    pool: rayon::ThreadPool,
    tracker: Arc<Tracker>,
    threads: usize,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("threads", &self.threads)
            .field("pending", &self.pending())
            .finish()
    }
}

impl TaskPool {
    /// Spawn a pool with `threads` workers. `0` selects the available hardware
    /// parallelism (minimum 1).
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("vdb-worker-{i}"))
            .build()
            .map_err(|e| VdbError::Io(io::Error::other(e.to_string())))?;
        let threads = pool.current_num_threads().max(1);
        tracing::debug!("task pool started with {} workers", threads);

        Ok(Self {
            pool,
            tracker: Arc::new(Tracker::default()),
            threads,
        })
    }

    /// Convenience constructor returning a shareable handle.
    pub fn shared(threads: usize) -> Result<Arc<Self>> {
        Self::new(threads).map(Arc::new)
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Number of submitted tasks not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.tracker.state.lock().queued
    }

    /// Returns true once [`TaskPool::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.tracker.state.lock().shutdown
    }

    /// Returns true when the calling thread is one of this pool's workers.
    pub fn on_worker(&self) -> bool {
        self.pool.current_thread_index().is_some()
    }

    /// Schedule one unit of work and return a handle to its result.
    ///
    /// Fails with [`VdbError::PoolShutdown`] after shutdown; work is never
    /// silently dropped.
    pub fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        {
            let mut state = self.tracker.state.lock();
            if state.shutdown {
                return Err(VdbError::PoolShutdown);
            }
            state.queued += 1;
        }

        let (tx, rx) = bounded(1);
        let tracker = Arc::clone(&self.tracker);
        self.pool.spawn(move || {
            tracker.start();
            let outcome = panic::catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|payload| Err(VdbError::TaskFailed(panic_message(payload))));
            let _ = tx.send(outcome);
            tracker.finish();
        });
        Ok(TaskHandle { rx })
    }

    /// Run `a` and `b`, potentially in parallel, and return both results.
    /// Safe to call from inside a worker.
    pub fn join<A, B, RA, RB>(&self, a: A, b: B) -> (RA, RB)
    where
        A: FnOnce() -> RA + Send,
        B: FnOnce() -> RB + Send,
        RA: Send,
        RB: Send,
    {
        if self.is_shutdown() {
            return (a(), b());
        }
        self.pool.join(a, b)
    }

    /// Run `f(i)` for every `i` in `[0, count)` across the workers and block
    /// until all chunks complete. Returns the error of the lowest-indexed
    /// failing chunk, if any.
    pub fn parallel_for<F>(&self, count: usize, f: F) -> Result<()>
    where
        F: Fn(usize) -> Result<()> + Sync,
    {
        self.map_chunks(count, |start, end| {
            for i in start..end {
                f(i)?;
            }
            Ok(())
        })
        .map(|_| ())
    }

    /// Compute `f(i)` for every `i` in `[0, count)` in parallel. The output is
    /// ordered by index regardless of which worker finishes first.
    pub fn parallel_map<T, F>(&self, count: usize, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync,
    {
        let parts = self.map_chunks(count, |start, end| {
            let mut out = Vec::with_capacity(end - start);
            for i in start..end {
                out.push(f(i)?);
            }
            Ok(out)
        })?;
        let mut result = Vec::with_capacity(count);
        for part in parts {
            result.extend(part);
        }
        Ok(result)
    }

    /// Split `[0, count)` into one contiguous range per worker, run
    /// `f(start, end)` on each, and return the per-chunk results in chunk order.
    /// After shutdown the chunks run on the calling thread.
    pub fn map_chunks<T, F>(&self, count: usize, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize, usize) -> Result<T> + Sync,
    {
        let ranges = chunk_ranges(count, self.threads);
        if ranges.len() <= 1 || self.is_shutdown() {
            return ranges.iter().map(|&(s, e)| f(s, e)).collect();
        }

        let outcomes: Vec<Result<T>> = self.pool.install(|| {
            ranges
                .par_iter()
                .map(|&(start, end)| {
                    panic::catch_unwind(AssertUnwindSafe(|| f(start, end)))
                        .unwrap_or_else(|payload| Err(VdbError::TaskFailed(panic_message(payload))))
                })
                .collect()
        });
        // Collecting in chunk order surfaces the lowest-indexed failure.
        outcomes.into_iter().collect()
    }

    /// Block until every submitted task has finished.
    ///
    /// Called from inside a worker this returns immediately, since waiting for
    /// the calling task itself would never finish.
    pub fn wait_all(&self) {
        if self.on_worker() {
            tracing::warn!("wait_all called from a pool worker; skipping barrier");
            return;
        }
        let mut state = self.tracker.state.lock();
        while state.queued > 0 || state.running > 0 {
            self.tracker.idle.wait(&mut state);
        }
    }

    /// Stop accepting work and drain tasks already submitted. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.tracker.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.wait_all();
        tracing::debug!("task pool shut down");
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Contiguous `(start, end)` ranges covering `[0, count)`, at most `parts` of them.
fn chunk_ranges(count: usize, parts: usize) -> Vec<(usize, usize)> {
    if count == 0 {
        return Vec::new();
    }
    let parts = parts.clamp(1, count);
    let chunk = count.div_ceil(parts);
    (0..count)
        .step_by(chunk)
        .map(|start| (start, (start + chunk).min(count)))
        .collect()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
