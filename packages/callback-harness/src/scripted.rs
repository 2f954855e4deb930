//! Scripted request: an in-process stand-in for the network client.
//!
//! A [`ScriptedRequest`] plays a fixed [`Script`] of lifecycle events into a
//! [`RequestCallback`] through whichever [`CallbackExecutor`] it was given,
//! and honours every [`NextAction`] the callback returns exactly the way a
//! well-behaved client must:
//!
//! | Action | Effect |
//! |--------|--------|
//! | `Proceed` | deliver the next scripted step |
//! | `Pause` | wait for `follow_redirect()` / `read()` on the handle |
//! | `Cancel` | deliver `Canceled` |
//! | `Fault` | deliver `Failed` with a callback exception |
//!
//! Exactly one terminal event is delivered no matter how `cancel()` races
//! the script. Handle calls made out of sequence are rejected with
//! [`HarnessError::ProtocolViolation`].

use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{HarnessError, RequestError, Result};
use crate::event::{CallbackEvent, NextAction, RequestCallback, RequestHandle, ResponseInfo, ResponseStep};
use crate::executor::{task, CallbackExecutor};
use crate::gate::CompletionGate;

// =============================================================================
// Script
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScriptStep {
    Redirect { location: String, status: u16 },
    Respond(ResponseInfo),
    Chunk(Vec<u8>),
    Succeed,
    Fail(RequestError),
}

impl ScriptStep {
    fn is_terminal(&self) -> bool {
        matches!(self, ScriptStep::Succeed | ScriptStep::Fail(_))
    }
}

/// The events a [`ScriptedRequest`] will produce, in order.
///
/// ```ignore
/// let script = Script::new("https://example.test/old")
///     .redirect("https://example.test/new", 302)
///     .respond(ResponseInfo::new("", 200).with_header("Content-Type", "text/plain"))
///     .chunk("hello ")
///     .chunk("world")
///     .succeed();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    url: String,
    steps: Vec<ScriptStep>,
}

impl Script {
    /// Start a script for a request to `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            steps: Vec::new(),
        }
    }

    /// The server redirects to `location`.
    pub fn redirect(mut self, location: impl Into<String>, status: u16) -> Self {
        self.steps.push(ScriptStep::Redirect {
            location: location.into(),
            status,
        });
        self
    }

    /// Final response headers. The URL and URL chain are filled in when played.
    pub fn respond(mut self, info: ResponseInfo) -> Self {
        self.steps.push(ScriptStep::Respond(info));
        self
    }

    /// One body chunk. May be empty.
    pub fn chunk(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.steps.push(ScriptStep::Chunk(bytes.into()));
        self
    }

    /// Terminal: success.
    pub fn succeed(mut self) -> Self {
        self.steps.push(ScriptStep::Succeed);
        self
    }

    /// Terminal: failure with `error`.
    pub fn fail(mut self, error: RequestError) -> Self {
        self.steps.push(ScriptStep::Fail(error));
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |message: &str| -> Result<()> {
            Err(HarnessError::Config {
                message: format!("invalid script: {message}"),
            })
        };

        match self.steps.last() {
            Some(last) if last.is_terminal() => {}
            _ => return invalid("must end with succeed() or fail()"),
        }
        if self.steps[..self.steps.len() - 1].iter().any(ScriptStep::is_terminal) {
            return invalid("only the last step may be terminal");
        }

        let mut responded = false;
        for step in &self.steps {
            match step {
                ScriptStep::Redirect { .. } if responded => {
                    return invalid("redirect after the response started");
                }
                ScriptStep::Respond(_) if responded => {
                    return invalid("response started twice");
                }
                ScriptStep::Respond(_) => responded = true,
                ScriptStep::Chunk(_) | ScriptStep::Succeed if !responded => {
                    return invalid("body or success before the response started");
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// =============================================================================
// Scripted Request
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Delivering,
    AwaitingFollow,
    AwaitingRead,
    Done,
}

// Every event is produced under the state lock, which also moves the phase to
// Delivering, so two handle calls can never resume the same pause.
struct PlayState {
    phase: Phase,
    steps: VecDeque<ScriptStep>,
    url: String,
    url_chain: Vec<String>,
    info: Option<ResponseInfo>,
    cancel_requested: bool,
    terminal_scheduled: bool,
}

impl PlayState {
    fn next_event(&mut self) -> CallbackEvent {
        self.phase = Phase::Delivering;
        let Some(step) = self.steps.pop_front() else {
            self.terminal_scheduled = true;
            return CallbackEvent::Failed {
                info: self.info.clone(),
                error: RequestError::new(crate::error::ErrorKind::Other, "script exhausted"),
            };
        };

        match step {
            ScriptStep::Redirect { location, status } => {
                let info = ResponseInfo::new(self.url.clone(), status)
                    .with_url_chain(self.url_chain.clone())
                    .with_header("Location", location.clone());
                self.url = location.clone();
                self.url_chain.push(location.clone());
                CallbackEvent::RedirectReceived {
                    info,
                    new_location: location,
                }
            }
            ScriptStep::Respond(mut info) => {
                info.url = self.url.clone();
                info.url_chain = self.url_chain.clone();
                self.info = Some(info.clone());
                CallbackEvent::ResponseStarted { info }
            }
            ScriptStep::Chunk(chunk) => {
                let info = self.current_info();
                let info = ResponseInfo {
                    received_byte_count: info.received_byte_count + chunk.len() as u64,
                    ..info
                };
                self.info = Some(info.clone());
                CallbackEvent::ReadCompleted { info, chunk }
            }
            ScriptStep::Succeed => {
                self.terminal_scheduled = true;
                CallbackEvent::Succeeded {
                    info: self.current_info(),
                }
            }
            ScriptStep::Fail(error) => {
                self.terminal_scheduled = true;
                CallbackEvent::Failed {
                    info: self.info.clone(),
                    error,
                }
            }
        }
    }

    fn current_info(&self) -> ResponseInfo {
        self.info
            .clone()
            .unwrap_or_else(|| ResponseInfo::new(self.url.clone(), 200))
    }

    fn canceled(&mut self) -> CallbackEvent {
        self.phase = Phase::Delivering;
        self.terminal_scheduled = true;
        CallbackEvent::Canceled {
            info: self.info.clone(),
        }
    }

    fn failed(&mut self, error: RequestError) -> CallbackEvent {
        self.phase = Phase::Delivering;
        self.terminal_scheduled = true;
        CallbackEvent::Failed {
            info: self.info.clone(),
            error,
        }
    }
}

// An executor that runs tasks inline would otherwise nest one delivery inside
// the previous one for every proceeded step. Deliveries scheduled while one is
// running are queued and run by the outermost delivery instead.
#[derive(Default)]
struct Pump {
    running: bool,
    queued: VecDeque<CallbackEvent>,
}

struct Inner {
    me: Weak<Inner>,
    state: Mutex<PlayState>,
    pump: Mutex<Pump>,
    callback: Arc<dyn RequestCallback>,
    executor: Arc<dyn CallbackExecutor>,
    finished: CompletionGate,
}

impl Inner {
    fn schedule(&self, event: CallbackEvent) -> Result<()> {
        let Some(me) = self.me.upgrade() else {
            return Err(HarnessError::Closed);
        };

        let step = event.step();
        let result = self
            .executor
            .execute(task(move || me.pump(event)));
        if let Err(e) = &result {
            error!(step = %step, error = %e, "executor rejected callback delivery");
            self.state.lock().phase = Phase::Done;
            self.finished.open();
        }
        result
    }

    fn pump(self: Arc<Self>, event: CallbackEvent) {
        {
            let mut pump = self.pump.lock();
            if pump.running {
                pump.queued.push_back(event);
                return;
            }
            pump.running = true;
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut next = Some(event);
            while let Some(event) = next {
                self.clone().deliver(event);
                let mut pump = self.pump.lock();
                next = pump.queued.pop_front();
                if next.is_none() {
                    pump.running = false;
                }
            }
        }));

        if let Err(panic) = result {
            // The callback panicked; nothing queued behind it can be delivered
            let mut pump = self.pump.lock();
            pump.running = false;
            pump.queued.clear();
            drop(pump);
            resume_unwind(panic);
        }
    }

    fn deliver(self: Arc<Self>, event: CallbackEvent) {
        let step = event.step();
        let handle: Arc<dyn RequestHandle> = self.clone();
        let action = self.callback.on_event(&handle, event);
        debug!(step = %step, action = ?action, "scripted event delivered");

        if step.is_terminal() {
            self.state.lock().phase = Phase::Done;
            self.finished.open();
            return;
        }

        let next = {
            let mut state = self.state.lock();
            if state.cancel_requested {
                Some(state.canceled())
            } else {
                match action {
                    NextAction::Proceed => Some(state.next_event()),
                    NextAction::Pause => {
                        state.phase = if step == ResponseStep::ReceivedRedirect {
                            Phase::AwaitingFollow
                        } else {
                            Phase::AwaitingRead
                        };
                        None
                    }
                    NextAction::Cancel => Some(state.canceled()),
                    NextAction::Fault(message) => {
                        warn!(step = %step, message = %message, "callback raised, failing request");
                        Some(state.failed(RequestError::callback_exception(message)))
                    }
                }
            }
        };

        if let Some(event) = next {
            // Rejection is already logged and marks the request done
            let _ = self.schedule(event);
        }
    }

    fn resume(&self, expected: Phase, call: &str) -> Result<()> {
        let event = {
            let mut state = self.state.lock();
            if state.phase != expected {
                return Err(HarnessError::violation(format!(
                    "{call}() called while request is {:?}",
                    state.phase
                )));
            }
            state.next_event()
        };
        self.schedule(event)
    }
}

impl RequestHandle for Inner {
    fn follow_redirect(&self) -> Result<()> {
        self.resume(Phase::AwaitingFollow, "follow_redirect")
    }

    fn read(&self) -> Result<()> {
        self.resume(Phase::AwaitingRead, "read")
    }

    fn cancel(&self) {
        let event = {
            let mut state = self.state.lock();
            if state.terminal_scheduled {
                return;
            }
            if state.phase == Phase::Delivering {
                // Delivered once the in-flight callback returns
                state.cancel_requested = true;
                return;
            }
            state.canceled()
        };
        let _ = self.schedule(event);
    }

    fn is_done(&self) -> bool {
        self.finished.is_open()
    }
}

/// A fake request that replays a [`Script`].
///
/// Cloning shares the same request.
#[derive(Clone)]
pub struct ScriptedRequest {
    inner: Arc<Inner>,
}

impl ScriptedRequest {
    /// Prepare a request. Nothing is delivered until [`start`](Self::start).
    ///
    /// Returns [`HarnessError::Config`] for a script that no well-behaved
    /// client could produce.
    pub fn new<C, E>(script: Script, callback: Arc<C>, executor: E) -> Result<Self>
    where
        C: RequestCallback + 'static,
        E: CallbackExecutor + 'static,
    {
        script.validate()?;

        let callback: Arc<dyn RequestCallback> = callback;
        let executor: Arc<dyn CallbackExecutor> = Arc::new(executor);
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            state: Mutex::new(PlayState {
                phase: Phase::Idle,
                steps: script.steps.into(),
                url_chain: vec![script.url.clone()],
                url: script.url,
                info: None,
                cancel_requested: false,
                terminal_scheduled: false,
            }),
            pump: Mutex::new(Pump::default()),
            callback,
            executor,
            finished: CompletionGate::new(),
        });
        Ok(Self { inner })
    }

    /// Deliver the first scripted event.
    pub fn start(&self) -> Result<()> {
        self.inner.resume(Phase::Idle, "start")
    }

    /// This request as the handle a callback receives.
    pub fn handle(&self) -> Arc<dyn RequestHandle> {
        self.inner.clone()
    }
}

impl RequestHandle for ScriptedRequest {
    fn follow_redirect(&self) -> Result<()> {
        self.inner.follow_redirect()
    }

    fn read(&self) -> Result<()> {
        self.inner.read()
    }

    fn cancel(&self) {
        self.inner.cancel()
    }

    fn is_done(&self) -> bool {
        self.inner.is_done()
    }
}

impl std::fmt::Debug for ScriptedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ScriptedRequest")
            .field("url", &state.url)
            .field("phase", &state.phase)
            .field("remaining", &state.steps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::RecordingCallback;
    use crate::error::ErrorKind;
    use crate::executor::{ControllableExecutor, DirectExecutor};
    use std::time::Duration;

    fn simple_script() -> Script {
        Script::new("https://example.test/")
            .respond(ResponseInfo::new("", 200))
            .chunk("ab")
            .chunk("")
            .chunk("cd")
            .succeed()
    }

    #[test]
    fn test_script_validation() {
        let callback = Arc::new(RecordingCallback::new());

        let cases = vec![
            Script::new("u").respond(ResponseInfo::new("", 200)),
            Script::new("u").succeed().succeed(),
            Script::new("u").chunk("x").succeed(),
            Script::new("u")
                .respond(ResponseInfo::new("", 200))
                .redirect("v", 302)
                .succeed(),
        ];
        for script in cases {
            let result = ScriptedRequest::new(script, callback.clone(), DirectExecutor);
            assert!(matches!(result, Err(HarnessError::Config { .. })));
        }

        // Failing before any response is fine
        let script = Script::new("u").fail(RequestError::new(ErrorKind::TimedOut, "slow"));
        assert!(ScriptedRequest::new(script, callback, DirectExecutor).is_ok());
    }

    #[test]
    fn test_direct_executor_runs_to_completion() {
        let callback = Arc::new(RecordingCallback::new());
        let request = ScriptedRequest::new(simple_script(), callback.clone(), DirectExecutor).unwrap();

        request.start().unwrap();

        callback.block_for_done(Duration::ZERO).unwrap();
        assert_eq!(callback.response_as_string(), "abcd");
        assert!(request.is_done());
        assert_eq!(
            callback.response_info().unwrap().received_byte_count,
            4
        );
    }

    #[test]
    fn test_nothing_happens_until_drained() {
        let executor = ControllableExecutor::new();
        let callback = Arc::new(RecordingCallback::new());
        let request =
            ScriptedRequest::new(simple_script(), callback.clone(), executor.clone()).unwrap();

        request.start().unwrap();
        assert_eq!(executor.pending_count(), 1);
        assert_eq!(callback.response_step(), ResponseStep::Started);

        assert_eq!(executor.drain_all().unwrap(), 5);
        callback.block_for_done(Duration::ZERO).unwrap();
        assert_eq!(callback.result().unwrap().step, ResponseStep::Succeeded);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let callback = Arc::new(RecordingCallback::new());
        let request = ScriptedRequest::new(simple_script(), callback, ControllableExecutor::new()).unwrap();

        request.start().unwrap();
        assert!(matches!(
            request.start(),
            Err(HarnessError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_cancel_while_paused_delivers_one_canceled() {
        let executor = ControllableExecutor::new();
        let callback = Arc::new(RecordingCallback::new());
        callback.set_auto_advance(false);
        let request =
            ScriptedRequest::new(simple_script(), callback.clone(), executor.clone()).unwrap();

        request.start().unwrap();
        executor.drain_all().unwrap();
        assert_eq!(callback.response_step(), ResponseStep::ResponseStarted);

        request.cancel();
        request.cancel();
        executor.drain_all().unwrap();

        callback.block_for_done(Duration::ZERO).unwrap();
        assert_eq!(callback.result().unwrap().step, ResponseStep::Canceled);
        assert!(callback.violations().is_empty());

        // Nothing left to resume
        assert!(request.read().is_err());
    }

    #[test]
    fn test_fault_becomes_callback_exception() {
        let callback = Arc::new(RecordingCallback::new());
        callback.set_failure(crate::callback::FailureMode::ThrowSync, ResponseStep::ReadCompleted);
        let request = ScriptedRequest::new(simple_script(), callback.clone(), DirectExecutor).unwrap();

        request.start().unwrap();

        callback.block_for_done(Duration::ZERO).unwrap();
        let error = callback.error().unwrap().expect("request failed");
        assert_eq!(error.kind, ErrorKind::CallbackException);
        // Only the first chunk was recorded
        assert_eq!(callback.response_as_string(), "ab");
    }

    #[test]
    fn test_long_body_through_direct_executor() {
        let mut script = Script::new("https://example.test/").respond(ResponseInfo::new("", 200));
        for _ in 0..10_000 {
            script = script.chunk("a");
        }
        let callback = Arc::new(RecordingCallback::new());
        let request = ScriptedRequest::new(script.succeed(), callback.clone(), DirectExecutor).unwrap();

        request.start().unwrap();

        callback.block_for_done(Duration::ZERO).unwrap();
        assert_eq!(callback.read_count(), 10_000);
        assert_eq!(callback.response_data_length(), 10_000);
        assert_eq!(callback.result().unwrap().step, ResponseStep::Succeeded);
        assert!(request.is_done());
    }

    #[test]
    fn test_executor_shutdown_rejects_start() {
        let executor = ControllableExecutor::new();
        executor.shutdown();
        let callback = Arc::new(RecordingCallback::new());
        let request = ScriptedRequest::new(simple_script(), callback, executor).unwrap();

        assert!(matches!(
            request.start(),
            Err(HarnessError::ExecutorShutDown)
        ));
        assert!(request.is_done());
    }
}
