//! Fixed-size job pool, cancellation and progress reporting
//!
//! Workers pull item indexes from a shared queue and keep their results
//! locally; the caller merges them back into input order on one thread.

use crate::error::{Error, Result};
use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Polled cancellation flag shared between a caller and an operation
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the operation to stop at its next check
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Error::Cancelled)` once [`cancel`](Self::cancel) was called
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Progress sink receiving `(total, done)` units of work
pub trait Progress: Send + Sync {
    fn on_progress(&self, total: u64, done: u64);
}

impl<F> Progress for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn on_progress(&self, total: u64, done: u64) {
        self(total, done)
    }
}

/// Thread-safe counter that reports to an optional [`Progress`] sink
///
/// Reports are serialized so `done` never goes backwards on the sink side.
pub struct ProgressTracker<'a> {
    sink: Option<&'a dyn Progress>,
    total: u64,
    done: AtomicU64,
    report: Mutex<u64>,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: Option<&'a dyn Progress>, total: u64) -> Self {
        let tracker = Self {
            sink,
            total,
            done: AtomicU64::new(0),
            report: Mutex::new(0),
        };
        tracker.emit(0);
        tracker
    }

    pub fn advance(&self, units: u64) {
        let done = self.done.fetch_add(units, Ordering::SeqCst) + units;
        self.emit(done.min(self.total));
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::SeqCst)
    }

    fn emit(&self, done: u64) {
        let Some(sink) = self.sink else { return };
        let mut last = self.report.lock();
        if done >= *last {
            *last = done;
            sink.on_progress(self.total, done);
        }
    }
}

/// Wrap `work` so it logs to the caller's tracing dispatcher on whichever
/// thread ends up running it
pub fn with_current_dispatch<T>(work: impl FnOnce() -> T) -> impl FnOnce() -> T {
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    move || tracing::dispatcher::with_default(&dispatch, work)
}

/// Fixed-size worker pool
#[derive(Debug, Clone)]
pub struct JobPool {
    worker_count: usize,
}

impl JobPool {
    /// Create a pool with an explicit worker count
    pub fn new(worker_count: usize) -> Result<Self> {
        if worker_count == 0 {
            return Err(Error::invalid("worker count must be non-zero"));
        }
        Ok(Self { worker_count })
    }

    /// Pool sized to the number of logical CPUs
    pub fn with_available_parallelism() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { worker_count }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Run `job` for every item and return the results in input order
    ///
    /// The first failing job stops new work from being scheduled and its
    /// error is returned; partial results are dropped. Cancellation is
    /// checked before each job starts.
    pub fn run<T, R, F>(&self, items: &[T], cancel: Option<&CancelToken>, job: F) -> Result<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(usize, &T) -> Result<R> + Sync,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let (tx, rx) = unbounded::<usize>();
        for i in 0..items.len() {
            // Receiver lives until the end of this function
            let _ = tx.send(i);
        }
        drop(tx);

        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);
        let workers = self.worker_count.min(items.len());
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());

        let shards: Vec<Vec<(usize, R)>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let rx = rx.clone();
                    let job = &job;
                    let failed = &failed;
                    let first_error = &first_error;
                    let dispatch = &dispatch;
                    scope.spawn(move || tracing::dispatcher::with_default(dispatch, || {
                        let mut local = Vec::new();
                        while let Ok(i) = rx.recv() {
                            if failed.load(Ordering::SeqCst) {
                                break;
                            }
                            let outcome = match cancel {
                                Some(token) => token.check().and_then(|_| job(i, &items[i])),
                                None => job(i, &items[i]),
                            };
                            match outcome {
                                Ok(value) => local.push((i, value)),
                                Err(e) => {
                                    let mut slot = first_error.lock();
                                    if slot.is_none() {
                                        *slot = Some(e);
                                    }
                                    failed.store(true, Ordering::SeqCst);
                                    break;
                                }
                            }
                        }
                        local
                    }))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_default())
                .collect()
        });

        if let Some(e) = first_error.into_inner() {
            return Err(e);
        }

        let mut merged: Vec<(usize, R)> = shards.into_iter().flatten().collect();
        if merged.len() != items.len() {
            return Err(Error::io("worker exited before completing its jobs"));
        }
        merged.sort_unstable_by_key(|(i, _)| *i);
        Ok(merged.into_iter().map(|(_, r)| r).collect())
    }
}
