//! Single-fire event listener.
//!
//! Captures exactly one payload (typically a request-finished summary) and lets
//! the test block until it arrived. A second delivery is a protocol violation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::gate::CompletionGate;

#[derive(Debug)]
struct Captured<T> {
    payload: T,
    at: DateTime<Utc>,
}

/// Listener that accepts at most one event per cycle.
///
/// # Example
///
/// ```ignore
/// let listener = Arc::new(FinishedListener::<RequestSummary>::new());
/// engine.add_finished_listener(listener.clone());
///
/// listener.block_until_done(Duration::from_secs(5))?;
/// let summary = listener.captured()?;
/// ```
#[derive(Debug)]
pub struct FinishedListener<T> {
    captured: Mutex<Option<Captured<T>>>,
    duplicates: AtomicUsize,
    done: CompletionGate,
    release: CompletionGate,
    fail_on_event: AtomicBool,
}

impl<T> FinishedListener<T>
where
    T: Clone + Send,
{
    /// Create an empty listener.
    pub fn new() -> Self {
        Self {
            captured: Mutex::new(None),
            duplicates: AtomicUsize::new(0),
            done: CompletionGate::new(),
            release: CompletionGate::new_open(),
            fail_on_event: AtomicBool::new(false),
        }
    }

    /// Deliver the event.
    ///
    /// # Panics
    ///
    /// If an event was already captured this cycle.
    pub fn on_event(&self, payload: T) -> Result<()> {
        {
            let mut captured = self.captured.lock();
            if captured.is_some() {
                drop(captured);
                let seen = self.duplicates.fetch_add(1, Ordering::AcqRel) + 1;
                error!(duplicates = seen, "listener received more than one event");
                // Wake the test thread so it reports the violation
                self.done.open();
                panic!("FinishedListener received a second event");
            }
            *captured = Some(Captured {
                payload,
                at: Utc::now(),
            });
        }

        debug!("listener captured event");
        self.done.open();

        if !self.release.is_open() {
            debug!("listener blocked until unblock_listener()");
            self.release.wait(Duration::MAX);
        }

        if self.fail_on_event.load(Ordering::Acquire) {
            return Err(HarnessError::InjectedFault);
        }
        Ok(())
    }

    /// Block until an event was captured.
    pub fn block_until_done(&self, timeout: Duration) -> Result<()> {
        self.done.wait_or_deadline(timeout)?;
        self.check_duplicates()
    }

    /// Same as [`block_until_done`](Self::block_until_done), bounded by the
    /// configured callback timeout.
    pub fn block_until_done_default(&self) -> Result<()> {
        self.block_until_done(HarnessConfig::from_env()?.callback_timeout())
    }

    /// Async counterpart of [`block_until_done`](Self::block_until_done).
    pub async fn block_until_done_async(&self, timeout: Duration) -> Result<()> {
        if !self.done.wait_async(timeout).await {
            return Err(HarnessError::DeadlineExceeded { duration: timeout });
        }
        self.check_duplicates()
    }

    fn check_duplicates(&self) -> Result<()> {
        match self.duplicates.load(Ordering::Acquire) {
            0 => Ok(()),
            n => Err(HarnessError::violation(format!(
                "listener received {} events, expected 1",
                n + 1
            ))),
        }
    }

    /// The captured payload. [`HarnessError::NotReady`] before the event.
    pub fn captured(&self) -> Result<T> {
        self.captured
            .lock()
            .as_ref()
            .map(|c| c.payload.clone())
            .ok_or(HarnessError::NotReady)
    }

    /// When the payload was captured.
    pub fn captured_at(&self) -> Result<DateTime<Utc>> {
        self.captured
            .lock()
            .as_ref()
            .map(|c| c.at)
            .ok_or(HarnessError::NotReady)
    }

    /// Returns true once an event was captured this cycle.
    pub fn is_done(&self) -> bool {
        self.captured.lock().is_some()
    }

    /// Clear the payload and close the gate for the next cycle.
    pub fn reset(&self) {
        *self.captured.lock() = None;
        self.duplicates.store(0, Ordering::Release);
        self.done.close();
    }

    /// Make the next `on_event` park (after capturing and opening the gate)
    /// until [`unblock_listener`](Self::unblock_listener).
    pub fn block_listener(&self) {
        self.release.close();
    }

    /// Release a parked `on_event`.
    pub fn unblock_listener(&self) {
        self.release.open();
    }

    /// Make `on_event` return [`HarnessError::InjectedFault`] after capturing.
    pub fn fail_on_event(&self) {
        self.fail_on_event.store(true, Ordering::Release);
    }
}

impl<T> Default for FinishedListener<T>
where
    T: Clone + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_single_event_then_immediate_block() {
        let listener = FinishedListener::new();
        listener.on_event("finished".to_string()).unwrap();

        let start = Instant::now();
        listener.block_until_done(Duration::ZERO).unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(listener.captured().unwrap(), "finished");
        assert!(listener.captured_at().unwrap() <= Utc::now());
    }

    #[test]
    fn test_captured_before_event_is_not_ready() {
        let listener = FinishedListener::<u32>::new();
        assert!(matches!(listener.captured(), Err(HarnessError::NotReady)));
        assert!(matches!(listener.captured_at(), Err(HarnessError::NotReady)));
        assert!(!listener.is_done());
    }

    #[test]
    fn test_second_event_panics_and_keeps_first() {
        let listener = FinishedListener::new();
        listener.on_event(1u32).unwrap();

        let second = catch_unwind(AssertUnwindSafe(|| listener.on_event(2u32)));
        assert!(second.is_err());

        assert_eq!(listener.captured().unwrap(), 1);
        assert!(matches!(
            listener.block_until_done(Duration::ZERO),
            Err(HarnessError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_block_times_out_against_late_event() {
        let listener = Arc::new(FinishedListener::new());

        let producer = listener.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_secs(1));
            producer.on_event(7u8).unwrap();
        });

        let start = Instant::now();
        let err = listener
            .block_until_done(Duration::from_millis(10))
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(matches!(listener.captured(), Err(HarnessError::NotReady)));

        handle.join().unwrap();
    }

    #[test]
    fn test_reset_allows_next_cycle() {
        let listener = FinishedListener::new();
        listener.on_event('a').unwrap();
        listener.reset();

        assert!(listener.block_until_done(Duration::from_millis(1)).is_err());
        listener.on_event('b').unwrap();
        assert_eq!(listener.captured().unwrap(), 'b');
    }

    #[test]
    fn test_fail_on_event_still_captures() {
        let listener = FinishedListener::new();
        listener.fail_on_event();

        assert!(matches!(
            listener.on_event(42i64),
            Err(HarnessError::InjectedFault)
        ));
        listener.block_until_done(Duration::ZERO).unwrap();
        assert_eq!(listener.captured().unwrap(), 42);
    }

    #[test]
    fn test_blocked_listener_opens_gate_before_parking() {
        let listener = Arc::new(FinishedListener::new());
        listener.block_listener();

        let producer = listener.clone();
        let returned = Arc::new(CompletionGate::new());
        let r = returned.clone();
        let handle = thread::spawn(move || {
            producer.on_event(()).unwrap();
            r.open();
        });

        listener.block_until_done(Duration::from_secs(5)).unwrap();
        assert!(!returned.wait(Duration::from_millis(20)));

        listener.unblock_listener();
        assert!(returned.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_block_until_done_async() {
        let listener = Arc::new(FinishedListener::new());

        let producer = listener.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.on_event("async").unwrap();
        });

        listener
            .block_until_done_async(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(listener.captured().unwrap(), "async");
    }
}
