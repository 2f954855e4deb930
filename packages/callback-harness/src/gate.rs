//! Completion gate: a resettable one-shot blocking primitive.
//!
//! Every "block until X happened" operation in the harness routes through a
//! [`CompletionGate`]. A producer thread calls [`open`](CompletionGate::open);
//! any number of waiters, blocking or async, observe it.
//!
//! # Guarantees
//!
//! - **No lost wake-up**: a waiter arriving after `open()` returns immediately
//! - **Idempotent**: `open()` and `close()` may be called repeatedly
//! - **Bounded**: every wait takes a timeout and reports which one happened
//!
//! # Example
//!
//! ```ignore
//! use callback_harness::CompletionGate;
//!
//! let gate = Arc::new(CompletionGate::new());
//!
//! let producer = gate.clone();
//! std::thread::spawn(move || producer.open());
//!
//! assert!(gate.wait(Duration::from_secs(1)));
//! ```

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::error::{HarnessError, Result};

/// Open/closed boolean with blocking and async wait-with-timeout.
#[derive(Debug, Default)]
pub struct CompletionGate {
    open: Mutex<bool>,
    condvar: Condvar,
    notify: Notify,
}

impl CompletionGate {
    /// Create a closed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a gate that starts open.
    pub fn new_open() -> Self {
        let gate = Self::new();
        *gate.open.lock() = true;
        gate
    }

    /// Open the gate, waking all current and future waiters.
    pub fn open(&self) {
        *self.open.lock() = true;
        self.condvar.notify_all();
        self.notify.notify_waiters();
    }

    /// Reset the gate to closed for the next cycle.
    ///
    /// Must not race an in-flight wait of the previous cycle.
    pub fn close(&self) {
        *self.open.lock() = false;
    }

    /// Returns true if the gate is currently open.
    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Block until the gate opens or `timeout` elapses.
    ///
    /// Returns `true` if the gate is open, `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut open = self.open.lock();
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            while !*open {
                self.condvar.wait(&mut open);
            }
            return true;
        };

        while !*open {
            if self.condvar.wait_until(&mut open, deadline).timed_out() {
                return *open;
            }
        }
        true
    }

    /// Like [`wait`](Self::wait), but reports a timeout as
    /// [`HarnessError::DeadlineExceeded`].
    pub fn wait_or_deadline(&self, timeout: Duration) -> Result<()> {
        if self.wait(timeout) {
            Ok(())
        } else {
            Err(HarnessError::DeadlineExceeded { duration: timeout })
        }
    }

    /// Wait asynchronously until the gate opens.
    ///
    /// Returns immediately if the gate is already open.
    pub async fn opened(&self) {
        loop {
            // Register for notification BEFORE checking the flag
            let notified = self.notify.notified();

            if self.is_open() {
                return;
            }

            notified.await;
        }
    }

    /// Async counterpart of [`wait`](Self::wait).
    pub async fn wait_async(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.opened()).await.is_ok()
    }
}
