//! # Callback Harness
//!
//! Deterministic test harness for asynchronous, callback-driven network
//! clients. It turns "eventually, on some other thread, a callback fires" into
//! "block here until it has fired, then inspect the result safely".
//!
//! ## Architecture
//!
//! ```text
//! test thread                         client under test
//!     │                                      │
//!     │ start()                              │
//!     ├─────────────────────────────────────►│
//!     │                                      ▼ execute(task)
//!     │                            CallbackExecutor
//!     │                     (Controllable | Direct | SingleThread)
//!     │                                      │
//!     │                                      ▼ on_event(CallbackEvent)
//!     │                            RecordingCallback ──► NextAction ──► client
//!     │                                      │
//!     │                                      ▼ terminal
//!     │◄──────── CompletionGate::open() ─────┘
//!     ▼
//! block_for_done() ─► result() / error()
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One terminal per request** - a callback after `Succeeded`, `Failed`
//!    or `Canceled` is a protocol violation, and the first terminal stands
//! 2. **Every wait is bounded** - timeouts are reported as
//!    [`HarnessError::DeadlineExceeded`], never confused with request errors
//! 3. **No lost wake-ups** - a waiter arriving after the gate opened returns
//!    immediately
//! 4. **Execution is injectable** - the executor decides which thread runs a
//!    callback and when
//! 5. **Captured errors are data** - a failed request's [`RequestError`] is
//!    stored, never raised
//!
//! ## Example
//!
//! ```ignore
//! use callback_harness::{ControllableExecutor, RecordingCallback, Script, ScriptedRequest};
//!
//! let executor = ControllableExecutor::new();
//! let callback = Arc::new(RecordingCallback::new());
//! let request = ScriptedRequest::new(
//!     Script::new("https://example.test/")
//!         .respond(ResponseInfo::new("", 200))
//!         .chunk("ab")
//!         .chunk("cd")
//!         .succeed(),
//!     callback.clone(),
//!     executor.clone(),
//! )?;
//!
//! request.start()?;
//! assert_eq!(executor.pending_count(), 1);
//!
//! executor.drain_all()?;
//! callback.block_for_done(Duration::from_secs(5))?;
//! assert_eq!(callback.result()?.body_as_string(), "abcd");
//! ```
//!
//! ## Subprocess Output
//!
//! [`OutputMonitor`] follows a log-streaming subprocess and only hands back
//! lines written after a freshly generated start marker, see [`marker`].

// Core modules
pub mod callback;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod gate;
pub mod listener;
pub mod logging;
pub mod marker;
pub mod scoped;
pub mod scripted;


// Re-export error types
pub use crate::error::{ErrorKind, HarnessError, RequestError, Result};

// Re-export the primitives
pub use crate::callback::{DecisionHook, FailureMode, Outcome, RecordingCallback};
pub use crate::config::HarnessConfig;
pub use crate::event::{
    CallbackEvent, NextAction, RequestCallback, RequestHandle, ResponseInfo, ResponseStep,
};
pub use crate::executor::{
    task, CallbackExecutor, ControllableExecutor, DirectExecutor, SingleThreadExecutor, Task,
};
pub use crate::gate::CompletionGate;
pub use crate::listener::FinishedListener;
pub use crate::marker::{FileSink, MarkerSink, OutputMonitor, TracingSink};
pub use crate::scoped::ScopedEnvVar;
pub use crate::scripted::{Script, ScriptedRequest};
