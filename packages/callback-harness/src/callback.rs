//! Recording callback: the per-request lifecycle state machine.
//!
//! A [`RecordingCallback`] is handed to the client under test as its
//! [`RequestCallback`]. It records every event, enforces the lifecycle
//! ordering, relays a [`NextAction`] for each intermediate step, and opens a
//! [`CompletionGate`] exactly once when a terminal event arrives.
//!
//! # Key Properties
//!
//! - **Exactly one terminal**: any callback after `Succeeded`, `Failed` or
//!   `Canceled` panics and is recorded as a protocol violation
//! - **Ordered body**: chunks are concatenated in arrival order
//! - **Overridable decisions**: a [`DecisionHook`] or a [`FailureMode`] picks
//!   the next action without subclassing the whole machine
//! - **Read after done**: [`result`](RecordingCallback::result) and
//!   [`error`](RecordingCallback::error) refuse to answer before a terminal
//!   callback arrived
//!
//! # Example
//!
//! ```ignore
//! let callback = Arc::new(RecordingCallback::new());
//! let request = client.new_request(url, callback.clone(), executor);
//! request.start();
//!
//! callback.block_for_done(Duration::from_secs(5))?;
//! let outcome = callback.result()?;
//! assert_eq!(outcome.step, ResponseStep::Succeeded);
//! assert_eq!(outcome.body_as_string(), "hello");
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, RequestError, Result};
use crate::event::{CallbackEvent, NextAction, RequestCallback, RequestHandle, ResponseInfo, ResponseStep};
use crate::gate::CompletionGate;

// =============================================================================
// Decision Hook
// =============================================================================

/// Decides the next action for an intermediate callback.
///
/// Returning `None` means "no opinion": the callback falls back to its
/// default (proceed when auto-advancing, pause otherwise).
///
/// # Guarantees
///
/// - Called synchronously on the delivering thread
/// - Called serially (never concurrently for one callback)
/// - Never called for terminal events
///
/// A panicking hook is caught and turned into [`NextAction::Fault`], which is
/// what a raising callback looks like to the client.
pub trait DecisionHook: Send + 'static {
    /// Pick the next action for `event`.
    fn decide(&mut self, event: &CallbackEvent) -> Option<NextAction>;
}

impl<F> DecisionHook for F
where
    F: FnMut(&CallbackEvent) -> Option<NextAction> + Send + 'static,
{
    fn decide(&mut self, event: &CallbackEvent) -> Option<NextAction> {
        self(event)
    }
}

/// Canned misbehaviour injected at a chosen step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Return [`NextAction::Cancel`] from the callback.
    CancelSync,
    /// Cancel the request from another thread and pause.
    CancelAsync,
    /// Cancel the request from another thread but still proceed, racing the
    /// cancel against the next step.
    CancelAsyncWithoutPause,
    /// Raise from the callback ([`NextAction::Fault`]).
    ThrowSync,
}

#[derive(Debug, Clone, Copy)]
struct FailureInjection {
    mode: FailureMode,
    step: ResponseStep,
}

// =============================================================================
// Recorded Outcome
// =============================================================================

/// Everything recorded for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    /// The last step executed; terminal once the request is done.
    pub step: ResponseStep,
    /// The last response metadata received, if any.
    pub response_info: Option<ResponseInfo>,
    /// Concatenated body chunks.
    pub body: Vec<u8>,
    /// The captured error, for `Failed`.
    pub error: Option<RequestError>,
    /// Redirect locations in the order received.
    pub redirect_urls: Vec<String>,
}

impl Outcome {
    /// The body decoded as UTF-8 (lossy).
    pub fn body_as_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// HTTP status of the final response, if one was received.
    pub fn http_status_code(&self) -> Option<u16> {
        self.response_info.as_ref().map(|i| i.http_status_code)
    }
}

#[derive(Debug)]
struct Recorded {
    step: ResponseStep,
    response_info: Option<ResponseInfo>,
    redirect_infos: Vec<ResponseInfo>,
    redirect_urls: Vec<String>,
    body: Vec<u8>,
    read_count: usize,
    error: Option<RequestError>,
    violations: Vec<String>,
}

impl Default for Recorded {
    fn default() -> Self {
        Self {
            step: ResponseStep::Started,
            response_info: None,
            redirect_infos: Vec::new(),
            redirect_urls: Vec::new(),
            body: Vec::new(),
            read_count: 0,
            error: None,
            violations: Vec::new(),
        }
    }
}

impl Recorded {
    fn apply(&mut self, event: CallbackEvent) {
        self.step = event.step();
        match event {
            CallbackEvent::RedirectReceived { info, new_location } => {
                self.redirect_infos.push(info);
                self.redirect_urls.push(new_location);
            }
            CallbackEvent::ResponseStarted { info } | CallbackEvent::Succeeded { info } => {
                self.response_info = Some(info);
            }
            CallbackEvent::ReadCompleted { info, chunk } => {
                self.body.extend_from_slice(&chunk);
                self.read_count += 1;
                self.response_info = Some(info);
            }
            CallbackEvent::Failed { info, error } => {
                self.error = Some(error);
                if info.is_some() {
                    self.response_info = info;
                }
            }
            CallbackEvent::Canceled { info } => {
                if info.is_some() {
                    self.response_info = info;
                }
            }
        }
    }
}

/// Returns true if `to` may follow `from` in a request lifecycle.
fn is_valid_transition(from: ResponseStep, to: ResponseStep) -> bool {
    use ResponseStep::*;

    if from.is_terminal() {
        return false;
    }
    match to {
        Started => false,
        Failed | Canceled => true,
        ReceivedRedirect => matches!(from, Started | ReceivedRedirect),
        ResponseStarted => matches!(from, Started | ReceivedRedirect),
        ReadCompleted | Succeeded => matches!(from, ResponseStarted | ReadCompleted),
    }
}

struct Settings {
    auto_advance: bool,
    failure: Option<FailureInjection>,
    hook: Option<Box<dyn DecisionHook>>,
}

// =============================================================================
// Recording Callback
// =============================================================================

/// Records one request's callbacks and blocks the test until it finishes.
///
/// Owned by the test that created it; not meant to be shared across requests.
pub struct RecordingCallback {
    state: Mutex<Recorded>,
    settings: Mutex<Settings>,
    done: CompletionGate,
    step_gate: CompletionGate,
    terminal_release: CompletionGate,
}

impl RecordingCallback {
    /// Create a callback that auto-advances through every step.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Recorded::default()),
            settings: Mutex::new(Settings {
                auto_advance: true,
                failure: None,
                hook: None,
            }),
            done: CompletionGate::new(),
            step_gate: CompletionGate::new(),
            terminal_release: CompletionGate::new_open(),
        }
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// When false, every intermediate step returns [`NextAction::Pause`] and
    /// the test drives the request with [`wait_for_next_step`](Self::wait_for_next_step).
    pub fn set_auto_advance(&self, auto_advance: bool) {
        self.settings.lock().auto_advance = auto_advance;
    }

    /// Inject a failure when `step` is reached.
    pub fn set_failure(&self, mode: FailureMode, step: ResponseStep) {
        self.settings.lock().failure = Some(FailureInjection { mode, step });
    }

    /// Install a decision hook, replacing any previous one.
    pub fn set_decision_hook(&self, hook: impl DecisionHook) {
        self.settings.lock().hook = Some(Box::new(hook));
    }

    /// When true, the terminal callback blocks (after opening the done gate)
    /// until [`release_terminal_callback`](Self::release_terminal_callback).
    pub fn set_block_on_terminal_state(&self, block: bool) {
        if block {
            self.terminal_release.close();
        } else {
            self.terminal_release.open();
        }
    }

    /// Let a terminal callback blocked by
    /// [`set_block_on_terminal_state`](Self::set_block_on_terminal_state) return.
    pub fn release_terminal_callback(&self) {
        self.terminal_release.open();
    }

    // -------------------------------------------------------------------------
    // Callback Methods
    // -------------------------------------------------------------------------

    /// Redirect callback.
    pub fn on_redirect_received(
        &self,
        request: &Arc<dyn RequestHandle>,
        info: ResponseInfo,
        new_location: impl Into<String>,
    ) -> NextAction {
        self.on_event(
            request,
            CallbackEvent::RedirectReceived {
                info,
                new_location: new_location.into(),
            },
        )
    }

    /// Response-headers callback.
    pub fn on_response_started(
        &self,
        request: &Arc<dyn RequestHandle>,
        info: ResponseInfo,
    ) -> NextAction {
        self.on_event(request, CallbackEvent::ResponseStarted { info })
    }

    /// Body-chunk callback.
    pub fn on_read_completed(
        &self,
        request: &Arc<dyn RequestHandle>,
        info: ResponseInfo,
        chunk: impl Into<Vec<u8>>,
    ) -> NextAction {
        self.on_event(
            request,
            CallbackEvent::ReadCompleted {
                info,
                chunk: chunk.into(),
            },
        )
    }

    /// Success callback.
    pub fn on_succeeded(&self, request: &Arc<dyn RequestHandle>, info: ResponseInfo) {
        self.on_event(request, CallbackEvent::Succeeded { info });
    }

    /// Failure callback.
    pub fn on_failed(
        &self,
        request: &Arc<dyn RequestHandle>,
        info: Option<ResponseInfo>,
        error: RequestError,
    ) {
        self.on_event(request, CallbackEvent::Failed { info, error });
    }

    /// Cancellation callback.
    pub fn on_canceled(&self, request: &Arc<dyn RequestHandle>, info: Option<ResponseInfo>) {
        self.on_event(request, CallbackEvent::Canceled { info });
    }

    // -------------------------------------------------------------------------
    // Waiting
    // -------------------------------------------------------------------------

    /// Block until a terminal callback arrived.
    ///
    /// Returns [`HarnessError::DeadlineExceeded`] on timeout and
    /// [`HarnessError::ProtocolViolation`] if a violation was recorded, even
    /// if the panic it raised was swallowed on the client's thread.
    pub fn block_for_done(&self, timeout: Duration) -> Result<()> {
        self.done.wait_or_deadline(timeout)?;
        self.check_violations()
    }

    /// [`block_for_done`](Self::block_for_done) with the configured
    /// callback timeout ([`HarnessConfig::from_env`]).
    pub fn block_for_done_default(&self) -> Result<()> {
        self.block_for_done(HarnessConfig::from_env()?.callback_timeout())
    }

    /// Async counterpart of [`block_for_done`](Self::block_for_done).
    pub async fn block_for_done_async(&self, timeout: Duration) -> Result<()> {
        if !self.done.wait_async(timeout).await {
            return Err(HarnessError::DeadlineExceeded { duration: timeout });
        }
        self.check_violations()
    }

    /// Wait for the next callback (any step) and return the step it moved to.
    ///
    /// Used with auto-advance off. Resets the step gate for the next call.
    pub fn wait_for_next_step(&self, timeout: Duration) -> Result<ResponseStep> {
        self.step_gate.wait_or_deadline(timeout)?;
        self.step_gate.close();
        self.check_violations()?;
        Ok(self.response_step())
    }

    /// Returns true once a terminal callback arrived.
    ///
    /// A violation wakes waiters but does not make the request done.
    pub fn is_done(&self) -> bool {
        self.done.is_open() && self.state.lock().step.is_terminal()
    }

    fn check_violations(&self) -> Result<()> {
        match self.state.lock().violations.first() {
            Some(v) => Err(HarnessError::violation(v.clone())),
            None => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Results
    // -------------------------------------------------------------------------

    /// The terminal outcome. [`HarnessError::NotReady`] before done.
    pub fn result(&self) -> Result<Outcome> {
        if !self.is_done() {
            return Err(HarnessError::NotReady);
        }
        Ok(self.outcome())
    }

    /// Snapshot of everything recorded so far, whether or not the request
    /// finished. Use between steps when auto-advance is off.
    pub fn outcome(&self) -> Outcome {
        let state = self.state.lock();
        Outcome {
            step: state.step,
            response_info: state.response_info.clone(),
            body: state.body.clone(),
            error: state.error.clone(),
            redirect_urls: state.redirect_urls.clone(),
        }
    }

    /// The captured error, `None` unless the request failed.
    /// [`HarnessError::NotReady`] before done.
    pub fn error(&self) -> Result<Option<RequestError>> {
        if !self.is_done() {
            return Err(HarnessError::NotReady);
        }
        Ok(self.state.lock().error.clone())
    }

    /// The step most recently executed.
    pub fn response_step(&self) -> ResponseStep {
        self.state.lock().step
    }

    /// The last response metadata received (not updated by redirects).
    pub fn response_info(&self) -> Option<ResponseInfo> {
        self.state.lock().response_info.clone()
    }

    /// Metadata of every redirect response, in order.
    pub fn redirect_response_infos(&self) -> Vec<ResponseInfo> {
        self.state.lock().redirect_infos.clone()
    }

    /// Redirect locations, in order.
    pub fn redirect_urls(&self) -> Vec<String> {
        self.state.lock().redirect_urls.clone()
    }

    /// Number of redirects received.
    pub fn redirect_count(&self) -> usize {
        self.state.lock().redirect_urls.len()
    }

    /// Body received so far, decoded as UTF-8 (lossy).
    pub fn response_as_string(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().body).into_owned()
    }

    /// Number of body bytes received so far.
    pub fn response_data_length(&self) -> usize {
        self.state.lock().body.len()
    }

    /// Number of read callbacks received.
    pub fn read_count(&self) -> usize {
        self.state.lock().read_count
    }

    /// Protocol violations recorded so far.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    // No settings lock is held while the hook runs, so a hook may reconfigure
    // this callback.
    fn decide(&self, request: &Arc<dyn RequestHandle>, event: &CallbackEvent) -> NextAction {
        let step = event.step();
        let failure = self.settings.lock().failure;

        let mut proceed_anyway = false;
        if let Some(failure) = failure.filter(|f| f.step == step) {
            warn!(step = %step, mode = ?failure.mode, "injecting callback failure");
            match failure.mode {
                FailureMode::CancelSync => return NextAction::Cancel,
                FailureMode::ThrowSync => {
                    return NextAction::Fault(format!("Callback throwing an exception at {step}"));
                }
                FailureMode::CancelAsync | FailureMode::CancelAsyncWithoutPause => {
                    let handle = request.clone();
                    thread::spawn(move || handle.cancel());
                    if failure.mode == FailureMode::CancelAsync {
                        return NextAction::Pause;
                    }
                    proceed_anyway = true;
                }
            }
        }

        let hook = self.settings.lock().hook.take();
        if let Some(mut hook) = hook {
            let decided = catch_unwind(AssertUnwindSafe(|| hook.decide(event)));
            {
                let mut settings = self.settings.lock();
                // Keep a replacement installed by the hook itself
                if settings.hook.is_none() {
                    settings.hook = Some(hook);
                }
            }
            match decided {
                Ok(Some(action)) => return action,
                Ok(None) => {}
                Err(panic_info) => {
                    let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                        (*s).to_string()
                    } else if let Some(s) = panic_info.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    warn!(step = %step, panic = %panic_msg, "decision hook panicked");
                    return NextAction::Fault(panic_msg);
                }
            }
        }

        if self.settings.lock().auto_advance || proceed_anyway {
            NextAction::Proceed
        } else {
            NextAction::Pause
        }
    }
}

impl Default for RecordingCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCallback for RecordingCallback {
    fn on_event(&self, request: &Arc<dyn RequestHandle>, event: CallbackEvent) -> NextAction {
        let step = event.step();
        let terminal = step.is_terminal();

        {
            let mut state = self.state.lock();
            if !is_valid_transition(state.step, step) {
                let message = format!("{} callback received in state {}", step, state.step);
                state.violations.push(message.clone());
                drop(state);

                error!(from = %self.response_step(), to = %step, "callback protocol violation");
                // Wake waiters so the test thread sees the violation instead of a timeout
                self.step_gate.open();
                self.done.open();
                panic!("protocol violation: {message}");
            }
            debug!(from = %state.step, to = %step, "callback received");
            state.apply(event.clone());
        }

        if terminal {
            self.done.open();
            self.step_gate.open();
            if !self.terminal_release.is_open() {
                debug!(step = %step, "blocking terminal callback until released");
                self.terminal_release.wait(Duration::MAX);
            }
            return NextAction::Proceed;
        }

        let action = self.decide(request, &event);
        self.step_gate.open();
        action
    }
}

impl std::fmt::Debug for RecordingCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingCallback")
            .field("step", &self.response_step())
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandle {
        cancels: AtomicUsize,
    }

    impl RequestHandle for CountingHandle {
        fn follow_redirect(&self) -> Result<()> {
            Ok(())
        }
        fn read(&self) -> Result<()> {
            Ok(())
        }
        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
        fn is_done(&self) -> bool {
            false
        }
    }

    fn handle() -> Arc<dyn RequestHandle> {
        Arc::new(CountingHandle::default())
    }

    fn info() -> ResponseInfo {
        ResponseInfo::new("https://example.test/", 200).with_protocol("h2")
    }

    #[test]
    fn test_happy_path_records_everything() {
        let cb = RecordingCallback::new();
        let req = handle();

        let redirect = ResponseInfo::new("https://example.test/old", 302);
        assert_eq!(
            cb.on_redirect_received(&req, redirect, "https://example.test/"),
            NextAction::Proceed
        );
        assert_eq!(cb.on_response_started(&req, info()), NextAction::Proceed);
        assert_eq!(cb.on_read_completed(&req, info(), "ab"), NextAction::Proceed);
        assert_eq!(cb.on_read_completed(&req, info(), ""), NextAction::Proceed);
        assert_eq!(cb.on_read_completed(&req, info(), "cd"), NextAction::Proceed);
        cb.on_succeeded(&req, info());

        cb.block_for_done(Duration::ZERO).unwrap();
        let outcome = cb.result().unwrap();
        assert_eq!(outcome.step, ResponseStep::Succeeded);
        assert_eq!(outcome.body_as_string(), "abcd");
        assert_eq!(outcome.http_status_code(), Some(200));
        assert_eq!(outcome.redirect_urls, vec!["https://example.test/"]);
        assert_eq!(cb.redirect_count(), 1);
        assert_eq!(cb.read_count(), 3);
        assert_eq!(cb.response_data_length(), 4);
        assert_eq!(cb.error().unwrap(), None);
    }

    #[test]
    fn test_outcome_serializes_for_reports() {
        let cb = RecordingCallback::new();
        let req = handle();
        cb.on_response_started(&req, info().with_header("Content-Type", "text/plain"));
        cb.on_read_completed(&req, info(), "hi");
        cb.on_failed(&req, None, RequestError::new(ErrorKind::ConnectionReset, "reset"));

        let json = serde_json::to_value(cb.result().unwrap()).unwrap();
        assert_eq!(json["step"], "failed");
        assert_eq!(json["body"], serde_json::json!([104, 105]));
        assert_eq!(json["response_info"]["negotiated_protocol"], "h2");
        assert_eq!(json["error"]["kind"], "connection_reset");
        assert_eq!(json["redirect_urls"], serde_json::json!([]));
    }

    #[test]
    fn test_result_before_done_is_not_ready() {
        let cb = RecordingCallback::new();
        assert!(matches!(cb.result(), Err(HarnessError::NotReady)));
        assert!(matches!(cb.error(), Err(HarnessError::NotReady)));

        cb.on_response_started(&handle(), info());
        assert!(matches!(cb.result(), Err(HarnessError::NotReady)));
    }

    #[test]
    fn test_block_for_done_times_out_distinctly() {
        let cb = RecordingCallback::new();
        let err = cb.block_for_done(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_deadline_exceeded());
    }

    #[test]
    fn test_failed_error_is_captured_not_raised() {
        let cb = RecordingCallback::new();
        let error = RequestError::new(ErrorKind::ConnectionRefused, "refused").with_code(-102);
        cb.on_failed(&handle(), None, error.clone());

        cb.block_for_done(Duration::ZERO).unwrap();
        assert_eq!(cb.error().unwrap(), Some(error));
        assert_eq!(cb.result().unwrap().step, ResponseStep::Failed);
        assert!(cb.result().unwrap().response_info.is_none());
    }

    #[test]
    fn test_second_terminal_is_violation_and_first_is_kept() {
        let cb = RecordingCallback::new();
        let req = handle();
        cb.on_response_started(&req, info());
        cb.on_succeeded(&req, info());

        let second = catch_unwind(AssertUnwindSafe(|| {
            cb.on_failed(&req, None, RequestError::new(ErrorKind::Other, "late"));
        }));
        assert!(second.is_err(), "second terminal callback must panic");

        assert_eq!(cb.response_step(), ResponseStep::Succeeded);
        assert_eq!(cb.violations().len(), 1);
        assert!(matches!(
            cb.block_for_done(Duration::ZERO),
            Err(HarnessError::ProtocolViolation { .. })
        ));
        // The first terminal state is still what was recorded
        assert_eq!(cb.result().unwrap().error, None);
    }

    #[test]
    fn test_read_before_response_started_is_violation() {
        let cb = RecordingCallback::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            cb.on_read_completed(&handle(), info(), "x");
        }));
        assert!(result.is_err());
        assert!(cb.violations()[0].contains("read_completed callback received in state started"));
    }

    #[test]
    fn test_violation_before_terminal_is_not_done() {
        let cb = RecordingCallback::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            cb.on_read_completed(&handle(), info(), "x");
        }));
        assert!(result.is_err());

        // Waiters wake up with the violation, but nothing finished
        assert!(matches!(
            cb.block_for_done(Duration::ZERO),
            Err(HarnessError::ProtocolViolation { .. })
        ));
        assert!(!cb.is_done());
        assert!(matches!(cb.result(), Err(HarnessError::NotReady)));
        assert!(matches!(cb.error(), Err(HarnessError::NotReady)));
    }

    #[test]
    fn test_redirect_after_response_started_is_violation() {
        let cb = RecordingCallback::new();
        let req = handle();
        cb.on_response_started(&req, info());
        let result = catch_unwind(AssertUnwindSafe(|| {
            cb.on_redirect_received(&req, info(), "https://elsewhere.test/");
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_auto_advance_off_pauses_and_opens_step_gate() {
        let cb = RecordingCallback::new();
        cb.set_auto_advance(false);

        assert_eq!(cb.on_response_started(&handle(), info()), NextAction::Pause);
        assert_eq!(
            cb.wait_for_next_step(Duration::ZERO).unwrap(),
            ResponseStep::ResponseStarted
        );
        assert!(cb.outcome().response_info.is_some());
        // Gate was reset
        assert!(cb.wait_for_next_step(Duration::from_millis(5)).is_err());
    }

    #[test]
    fn test_failure_injection_cancel_sync() {
        let cb = RecordingCallback::new();
        cb.set_failure(FailureMode::CancelSync, ResponseStep::ReadCompleted);

        let req = handle();
        assert_eq!(cb.on_response_started(&req, info()), NextAction::Proceed);
        assert_eq!(cb.on_read_completed(&req, info(), "x"), NextAction::Cancel);
    }

    #[test]
    fn test_failure_injection_throw_sync() {
        let cb = RecordingCallback::new();
        cb.set_failure(FailureMode::ThrowSync, ResponseStep::ResponseStarted);

        match cb.on_response_started(&handle(), info()) {
            NextAction::Fault(msg) => assert!(msg.contains("response_started")),
            other => panic!("Expected Fault, got {:?}", other),
        }
    }

    #[test]
    fn test_failure_injection_cancel_async_cancels_from_other_thread() {
        let cb = RecordingCallback::new();
        cb.set_failure(FailureMode::CancelAsync, ResponseStep::ResponseStarted);

        let counting = Arc::new(CountingHandle::default());
        let req: Arc<dyn RequestHandle> = counting.clone();
        assert_eq!(cb.on_response_started(&req, info()), NextAction::Pause);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counting.cancels.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "cancel never arrived");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_cancel_async_without_pause_still_proceeds() {
        let cb = RecordingCallback::new();
        cb.set_auto_advance(false);
        cb.set_failure(
            FailureMode::CancelAsyncWithoutPause,
            ResponseStep::ResponseStarted,
        );
        assert_eq!(cb.on_response_started(&handle(), info()), NextAction::Proceed);
    }

    #[test]
    fn test_decision_hook_overrides_default() {
        let cb = RecordingCallback::new();
        cb.set_decision_hook(|event: &CallbackEvent| match event {
            CallbackEvent::RedirectReceived { .. } => Some(NextAction::Cancel),
            _ => None,
        });

        let req = handle();
        assert_eq!(
            cb.on_redirect_received(&req, info(), "https://next.test/"),
            NextAction::Cancel
        );
        cb.on_canceled(&req, None);

        cb.block_for_done(Duration::ZERO).unwrap();
        assert_eq!(cb.result().unwrap().step, ResponseStep::Canceled);
        assert!(cb.violations().is_empty());
    }

    #[test]
    fn test_hook_may_reconfigure_its_callback() {
        let cb = Arc::new(RecordingCallback::new());
        let weak = Arc::downgrade(&cb);
        cb.set_decision_hook(move |event: &CallbackEvent| -> Option<NextAction> {
            let cb = weak.upgrade()?;
            match event {
                CallbackEvent::RedirectReceived { .. } => cb.set_auto_advance(false),
                CallbackEvent::ResponseStarted { .. } => {
                    cb.set_decision_hook(|_: &CallbackEvent| -> Option<NextAction> {
                        Some(NextAction::Cancel)
                    });
                }
                _ => {}
            }
            None
        });

        let req = handle();
        // Switched to manual stepping from inside the hook
        assert_eq!(
            cb.on_redirect_received(&req, info(), "https://next.test/"),
            NextAction::Pause
        );
        assert_eq!(cb.on_response_started(&req, info()), NextAction::Pause);
        // The replacement hook is the one that stays installed
        assert_eq!(cb.on_read_completed(&req, info(), "x"), NextAction::Cancel);
    }

    #[test]
    fn test_panicking_hook_becomes_fault() {
        let cb = RecordingCallback::new();
        cb.set_decision_hook(|_: &CallbackEvent| -> Option<NextAction> {
            panic!("hook exploded")
        });

        match cb.on_response_started(&handle(), info()) {
            NextAction::Fault(msg) => assert!(msg.contains("hook exploded")),
            other => panic!("Expected Fault, got {:?}", other),
        }
    }

    #[test]
    fn test_block_on_terminal_state() {
        let cb = Arc::new(RecordingCallback::new());
        cb.set_block_on_terminal_state(true);

        let delivering = cb.clone();
        let returned = Arc::new(CompletionGate::new());
        let r = returned.clone();
        let worker = thread::spawn(move || {
            let req = handle();
            delivering.on_canceled(&req, None);
            r.open();
        });

        cb.block_for_done(Duration::from_secs(5)).unwrap();
        assert!(!returned.wait(Duration::from_millis(20)));

        cb.release_terminal_callback();
        assert!(returned.wait(Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[tokio::test]
    async fn test_block_for_done_async() {
        let cb = Arc::new(RecordingCallback::new());

        let delivering = cb.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            delivering.on_canceled(&handle(), None);
        });

        cb.block_for_done_async(Duration::from_secs(5)).await.unwrap();
        assert!(cb.is_done());
    }

    #[test]
    fn test_valid_transitions() {
        use ResponseStep::*;
        assert!(is_valid_transition(Started, Canceled));
        assert!(is_valid_transition(ReceivedRedirect, ReceivedRedirect));
        assert!(is_valid_transition(ResponseStarted, Succeeded));
        assert!(!is_valid_transition(Started, Succeeded));
        assert!(!is_valid_transition(Canceled, Canceled));
        assert!(!is_valid_transition(ReadCompleted, Started));
    }
}
