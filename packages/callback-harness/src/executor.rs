//! Execution contexts for callback delivery.
//!
//! The client under test never calls a callback directly; it hands a task to
//! the [`CallbackExecutor`] it was given. Choosing the executor is how a test
//! chooses its threading model:
//!
//! | Executor | Runs tasks on | Use for |
//! |----------|---------------|---------|
//! | [`ControllableExecutor`] | the thread calling `drain_all()` | deterministic, step-by-step tests |
//! | [`DirectExecutor`] | the delivering thread, inline | "thread-provided" mode |
//! | [`SingleThreadExecutor`] | one dedicated worker thread | realistic async delivery |
//!
//! # Example
//!
//! ```ignore
//! use callback_harness::ControllableExecutor;
//!
//! let executor = ControllableExecutor::new();
//! executor.submit(|| println!("first"))?;
//! executor.submit(|| println!("second"))?;
//!
//! // Nothing has run yet
//! assert_eq!(executor.pending_count(), 2);
//!
//! executor.drain_all()?;
//! assert!(executor.is_empty());
//! ```

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::gate::CompletionGate;

/// A unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Box an infallible closure as a [`Task`].
pub fn task<F>(f: F) -> Task
where
    F: FnOnce() + Send + 'static,
{
    Box::new(move || {
        f();
        Ok(())
    })
}

/// The execution context a client uses to deliver callbacks.
pub trait CallbackExecutor: Send + Sync {
    /// Accept a task for execution.
    ///
    /// Returns [`HarnessError::ExecutorShutDown`] if the executor no longer
    /// accepts work.
    fn execute(&self, task: Task) -> Result<()>;
}

impl<E: CallbackExecutor + ?Sized> CallbackExecutor for Arc<E> {
    fn execute(&self, task: Task) -> Result<()> {
        (**self).execute(task)
    }
}

// =============================================================================
// Controllable Executor
// =============================================================================

/// FIFO task queue that runs nothing until explicitly drained.
///
/// Cloning shares the same queue.
///
/// # Guarantees
///
/// - Tasks run strictly in submission order
/// - Tasks submitted while draining join the same drain (re-checked, not
///   snapshotted)
/// - Tasks run on the draining thread; the queue lock is never held while a
///   task runs
/// - A failing task stops the drain; the remaining tasks stay queued
///
/// Concurrent `drain_all()` calls from two threads are not supported.
#[derive(Clone, Default)]
pub struct ControllableExecutor {
    inner: Arc<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    queue: Mutex<VecDeque<Task>>,
    shut_down: AtomicBool,
    executed: AtomicUsize,
}

impl ControllableExecutor {
    /// Create an empty executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an infallible task to the tail of the queue.
    pub fn submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_task(task(f))
    }

    /// Append a fallible task to the tail of the queue.
    ///
    /// An error returned by the task surfaces from the drain that runs it.
    pub fn submit_fallible<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.submit_task(Box::new(f))
    }

    /// Append an already-boxed task.
    pub fn submit_task(&self, task: Task) -> Result<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(HarnessError::ExecutorShutDown);
        }
        self.inner.queue.lock().push_back(task);
        Ok(())
    }

    /// Run the task at the head of the queue, if any.
    ///
    /// Returns `Ok(true)` if a task ran, `Ok(false)` if the queue was empty.
    pub fn run_next(&self) -> anyhow::Result<bool> {
        // Pop under the lock, run outside it so the task may submit more work
        let next = self.inner.queue.lock().pop_front();
        let Some(task) = next else {
            return Ok(false);
        };

        self.inner.executed.fetch_add(1, Ordering::AcqRel);
        task()?;
        Ok(true)
    }

    /// Run queued tasks on this thread until the queue is empty.
    ///
    /// Returns the number of tasks executed by this drain.
    pub fn drain_all(&self) -> anyhow::Result<usize> {
        let mut ran = 0;
        loop {
            match self.run_next() {
                Ok(true) => ran += 1,
                Ok(false) => break,
                Err(e) => {
                    warn!(
                        executed = ran + 1,
                        remaining = self.pending_count(),
                        error = %e,
                        "task failed, stopping drain"
                    );
                    return Err(e);
                }
            }
        }
        debug!(executed = ran, "executor drained");
        Ok(ran)
    }

    /// Number of tasks waiting to run.
    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Returns true if no tasks are waiting.
    pub fn is_empty(&self) -> bool {
        self.pending_count() == 0
    }

    /// Total tasks started across all drains.
    pub fn executed_count(&self) -> usize {
        self.inner.executed.load(Ordering::Acquire)
    }

    /// Reject all future submissions. Already-queued tasks may still drain.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

impl CallbackExecutor for ControllableExecutor {
    fn execute(&self, task: Task) -> Result<()> {
        self.submit_task(task)
    }
}

impl std::fmt::Debug for ControllableExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllableExecutor")
            .field("pending", &self.pending_count())
            .field("executed", &self.executed_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

// =============================================================================
// Direct Executor
// =============================================================================

/// Runs every task inline on the thread that delivers it.
///
/// Task errors are logged, not returned: in this mode nobody is draining.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecutor;

impl CallbackExecutor for DirectExecutor {
    fn execute(&self, task: Task) -> Result<()> {
        if let Err(e) = task() {
            warn!(error = %e, "task failed on direct executor");
        }
        Ok(())
    }
}

// =============================================================================
// Single Thread Executor
// =============================================================================

/// Runs tasks one at a time on a dedicated, named worker thread.
///
/// A panicking task is caught and logged so the worker keeps serving.
pub struct SingleThreadExecutor {
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    finished: Arc<CompletionGate>,
    thread_id: ThreadId,
    name: String,
}

impl SingleThreadExecutor {
    /// Spawn the worker thread.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let finished = Arc::new(CompletionGate::new());

        let worker_finished = finished.clone();
        let worker_name = name.clone();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Some(task) = receiver.blocking_recv() {
                    match catch_unwind(AssertUnwindSafe(task)) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(executor = %worker_name, error = %e, "task failed");
                        }
                        Err(panic_info) => {
                            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                                (*s).to_string()
                            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                                s.clone()
                            } else {
                                "unknown panic".to_string()
                            };
                            error!(executor = %worker_name, panic = %panic_msg, "task panicked");
                        }
                    }
                }
                worker_finished.open();
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
            finished,
            name,
        })
    }

    /// Returns true if called from the worker thread.
    pub fn is_executor_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// The worker's thread id.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Stop accepting tasks. Already-queued tasks still run.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    /// Stop accepting tasks and wait for the worker to finish the backlog.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> Result<()> {
        self.shutdown();
        self.finished.wait_or_deadline(timeout)?;
        if let Some(worker) = self.worker.lock().take() {
            // The loop has exited, so this join cannot block for long
            let _ = worker.join();
        }
        debug!(executor = %self.name, "executor shut down");
        Ok(())
    }

    /// [`shutdown_and_wait`](Self::shutdown_and_wait) with the configured
    /// shutdown timeout.
    pub fn shutdown_and_wait_default(&self) -> Result<()> {
        self.shutdown_and_wait(HarnessConfig::from_env()?.shutdown_timeout())
    }
}

impl CallbackExecutor for SingleThreadExecutor {
    fn execute(&self, task: Task) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(HarnessError::ExecutorShutDown)?;
        sender
            .send(task)
            .map_err(|_| HarnessError::ExecutorShutDown)
    }
}

impl Drop for SingleThreadExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SingleThreadExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleThreadExecutor")
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}
