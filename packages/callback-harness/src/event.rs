//! Callback event model and the collaborator interfaces.
//!
//! The client under test reports progress as a [`CallbackEvent`], a tagged
//! variant over the fixed set of lifecycle callbacks. The callback answers
//! with a [`NextAction`], which the client relays back as its next step.
//!
//! ```text
//! RequestHandle.start()
//!     │
//!     ▼
//! RedirectReceived ──► NextAction::Proceed ──► follow_redirect()
//!     │ (repeatable)
//!     ▼
//! ResponseStarted ───► NextAction::Proceed ──► read()
//!     │
//!     ▼
//! ReadCompleted ─────► NextAction::Proceed ──► read()
//!     │ (repeatable)
//!     ▼
//! Succeeded | Failed | Canceled   (exactly one)
//! ```

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{RequestError, Result};

// =============================================================================
// Response Metadata
// =============================================================================

/// Response metadata as reported by the client at each step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResponseInfo {
    /// URL the response is for (after redirects).
    pub url: String,
    /// Every URL visited, in order, ending with `url`.
    pub url_chain: Vec<String>,
    /// HTTP status code.
    pub http_status_code: u16,
    /// HTTP status text.
    pub http_status_text: String,
    /// Response headers in wire order. Names may repeat.
    pub headers: Vec<(String, String)>,
    /// ALPN protocol, e.g. `h2`, `http/1.1`, `unknown`.
    pub negotiated_protocol: String,
    /// Whether the response came from cache.
    pub was_cached: bool,
    /// Bytes received so far, including headers.
    pub received_byte_count: u64,
}

impl ResponseInfo {
    /// Create metadata for a single-hop response.
    pub fn new(url: impl Into<String>, http_status_code: u16) -> Self {
        let url = url.into();
        Self {
            url_chain: vec![url.clone()],
            url,
            http_status_code,
            http_status_text: default_status_text(http_status_code).to_string(),
            negotiated_protocol: "unknown".to_string(),
            ..Default::default()
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the negotiated protocol.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.negotiated_protocol = protocol.into();
        self
    }

    /// Set the full URL chain; `url` becomes its last entry.
    pub fn with_url_chain<I, S>(mut self, chain: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.url_chain = chain.into_iter().map(Into::into).collect();
        if let Some(last) = self.url_chain.last() {
            self.url = last.clone();
        }
        self
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header, case-insensitive, in wire order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn default_status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "",
    }
}

// =============================================================================
// Lifecycle Steps and Events
// =============================================================================

/// The step a request lifecycle last executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStep {
    /// Created; no callback received yet.
    Started,
    /// A redirect was received.
    ReceivedRedirect,
    /// Response headers were received.
    ResponseStarted,
    /// A body chunk was received.
    ReadCompleted,
    /// Terminal: the request completed.
    Succeeded,
    /// Terminal: the request failed.
    Failed,
    /// Terminal: the request was canceled.
    Canceled,
}

impl ResponseStep {
    /// Returns true for `Succeeded`, `Failed` and `Canceled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResponseStep::Succeeded | ResponseStep::Failed | ResponseStep::Canceled
        )
    }
}

impl fmt::Display for ResponseStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStep::Started => write!(f, "started"),
            ResponseStep::ReceivedRedirect => write!(f, "received_redirect"),
            ResponseStep::ResponseStarted => write!(f, "response_started"),
            ResponseStep::ReadCompleted => write!(f, "read_completed"),
            ResponseStep::Succeeded => write!(f, "succeeded"),
            ResponseStep::Failed => write!(f, "failed"),
            ResponseStep::Canceled => write!(f, "canceled"),
        }
    }
}

/// One lifecycle callback, with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    /// The server answered with a redirect.
    RedirectReceived {
        /// Metadata of the redirect response.
        info: ResponseInfo,
        /// Where the redirect points.
        new_location: String,
    },
    /// Final response headers arrived.
    ResponseStarted {
        /// Response metadata.
        info: ResponseInfo,
    },
    /// A body chunk arrived. May be empty.
    ReadCompleted {
        /// Response metadata.
        info: ResponseInfo,
        /// Bytes read by this step.
        chunk: Vec<u8>,
    },
    /// The request completed.
    Succeeded {
        /// Final response metadata.
        info: ResponseInfo,
    },
    /// The request failed.
    Failed {
        /// Response metadata, if headers were received.
        info: Option<ResponseInfo>,
        /// The captured error.
        error: RequestError,
    },
    /// The request was canceled.
    Canceled {
        /// Response metadata, if headers were received.
        info: Option<ResponseInfo>,
    },
}

impl CallbackEvent {
    /// The lifecycle step this event moves to.
    pub fn step(&self) -> ResponseStep {
        match self {
            CallbackEvent::RedirectReceived { .. } => ResponseStep::ReceivedRedirect,
            CallbackEvent::ResponseStarted { .. } => ResponseStep::ResponseStarted,
            CallbackEvent::ReadCompleted { .. } => ResponseStep::ReadCompleted,
            CallbackEvent::Succeeded { .. } => ResponseStep::Succeeded,
            CallbackEvent::Failed { .. } => ResponseStep::Failed,
            CallbackEvent::Canceled { .. } => ResponseStep::Canceled,
        }
    }

    /// Returns true if this event ends the lifecycle.
    pub fn is_terminal(&self) -> bool {
        self.step().is_terminal()
    }

    /// Response metadata carried by the event, if any.
    pub fn info(&self) -> Option<&ResponseInfo> {
        match self {
            CallbackEvent::RedirectReceived { info, .. }
            | CallbackEvent::ResponseStarted { info }
            | CallbackEvent::ReadCompleted { info, .. }
            | CallbackEvent::Succeeded { info } => Some(info),
            CallbackEvent::Failed { info, .. } | CallbackEvent::Canceled { info } => info.as_ref(),
        }
    }
}

/// What the callback asks the client to do next.
///
/// Ignored by the client for terminal events.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NextAction {
    /// Follow the redirect, or read the next chunk.
    #[default]
    Proceed,
    /// Do nothing now; the test will drive the request through its handle.
    Pause,
    /// Cancel the request.
    Cancel,
    /// The callback raised; the client must fail the request with a
    /// callback exception carrying this message.
    Fault(String),
}

// =============================================================================
// Collaborator Interfaces
// =============================================================================

/// The callback slot set a client invokes.
///
/// Implemented by [`RecordingCallback`](crate::RecordingCallback).
pub trait RequestCallback: Send + Sync {
    /// Deliver one lifecycle event and obtain the next action.
    fn on_event(&self, request: &Arc<dyn RequestHandle>, event: CallbackEvent) -> NextAction;
}

/// Control surface of an in-flight request, implemented by the client.
pub trait RequestHandle: Send + Sync {
    /// Continue past a received redirect.
    fn follow_redirect(&self) -> Result<()>;

    /// Request the next body chunk.
    fn read(&self) -> Result<()>;

    /// Cancel the request. Safe to call at any time, any number of times.
    fn cancel(&self);

    /// Returns true once the request reached a terminal state.
    fn is_done(&self) -> bool;
}
