//! Marker-windowed capture of a subprocess's line output.
//!
//! An [`OutputMonitor`] follows the stdout of a log-streaming subprocess (a
//! `tail -f`, a device log reader, ...). The harness writes a unique marker
//! line through a [`MarkerSink`] that the subprocess is observing, and throws
//! away every line up to and including the marker. Whatever the caller reads
//! afterwards was produced after capture started.
//!
//! ```text
//!   harness ──emit("…start-<uuid>")──► sink ──► log ──► subprocess stdout
//!                                                           │
//!   discard: "noise", "…start-<uuid>"  ◄────────────────────┘
//!   read_line(): "payload-line"
//! ```
//!
//! Shutdown mirrors this with an end marker so no output is left half-read.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};

// =============================================================================
// Marker Sinks
// =============================================================================

/// Line-oriented log emission primitive the subprocess can observe.
pub trait MarkerSink: Send + Sync {
    /// Emit one line. The line must not contain a newline.
    fn emit(&self, line: &str) -> Result<()>;
}

impl<F> MarkerSink for F
where
    F: Fn(&str) -> Result<()> + Send + Sync,
{
    fn emit(&self, line: &str) -> Result<()> {
        self(line)
    }
}

/// Appends marker lines to a log file.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    /// Sink appending to `path`. The file is created on first emit.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The log file written to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MarkerSink for FileSink {
    fn emit(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

/// Emits marker lines as `tracing` events.
///
/// Only useful when the installed subscriber writes somewhere the subprocess
/// reads from.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MarkerSink for TracingSink {
    fn emit(&self, line: &str) -> Result<()> {
        info!(target: "callback_harness::marker", "{}", line);
        Ok(())
    }
}

fn new_token(kind: &str) -> String {
    format!("callback-harness-{kind}-{}", Uuid::new_v4())
}

// =============================================================================
// Line Reader
// =============================================================================

/// Splits a byte stream into lines, replacing invalid UTF-8 instead of
/// failing on it.
///
/// A read interrupted by a timeout keeps its partial line, so the next call
/// picks up where it left off.
struct LineReader<R> {
    reader: BufReader<R>,
    partial: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            partial: Vec::new(),
        }
    }

    /// Next line without its `\n` or `\r\n`. `None` at end of output.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.partial).await?;
        if read == 0 && self.partial.is_empty() {
            return Ok(None);
        }

        let mut bytes = std::mem::take(&mut self.partial);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

// =============================================================================
// Output Monitor
// =============================================================================

/// Consume lines until one contains `token`.
async fn scan_for(
    lines: &mut LineReader<ChildStdout>,
    token: &str,
) -> std::io::Result<Discard> {
    while let Some(line) = lines.next_line().await? {
        if line.contains(token) {
            return Ok(Discard::Found);
        }
        trace!(line = %line, "discarding line before marker");
    }
    Ok(Discard::Eof)
}

/// How a discard-until-token pass ended.
enum Discard {
    Found,
    Eof,
}

/// Reads a subprocess's output from a marker onward.
///
/// The subprocess is killed when the monitor is closed or dropped.
pub struct OutputMonitor {
    child: Child,
    lines: LineReader<ChildStdout>,
    sink: Arc<dyn MarkerSink>,
    marker_timeout: Duration,
    pid: Option<u32>,
    closed: bool,
}

impl OutputMonitor {
    /// Spawn `args` and perform the start-marker handshake, with the marker
    /// timeout taken from [`HarnessConfig::from_env`].
    pub async fn start<I, S>(args: I, sink: impl MarkerSink + 'static) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let config = HarnessConfig::from_env()?;
        Self::start_with_config(args, sink, &config).await
    }

    /// Spawn `args` and perform the start-marker handshake.
    ///
    /// stdin and stderr of the subprocess are closed. Fails with
    /// [`HarnessError::SubprocessExited`] if the output ends before the marker
    /// is seen, and [`HarnessError::DeadlineExceeded`] if the marker does not
    /// show up within `config.marker_timeout`. Either way the subprocess is
    /// killed and reaped first.
    pub async fn start_with_config<I, S>(
        args: I,
        sink: impl MarkerSink + 'static,
        config: &HarnessConfig,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let Some((program, rest)) = args.split_first() else {
            return Err(HarnessError::Config {
                message: "output monitor needs a program to run".to_string(),
            });
        };

        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HarnessError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            HarnessError::Io(std::io::Error::other("subprocess stdout was not captured"))
        })?;
        let pid = child.id();
        debug!(program = %program, pid = ?pid, "output monitor spawned");

        let mut monitor = Self {
            child,
            lines: LineReader::new(stdout),
            sink: Arc::new(sink),
            marker_timeout: config.marker_timeout(),
            pid,
            closed: false,
        };

        if let Err(e) = monitor.handshake().await {
            monitor.closed = true;
            monitor.terminate().await;
            return Err(e);
        }
        Ok(monitor)
    }

    async fn handshake(&mut self) -> Result<()> {
        let token = new_token("start");
        self.sink.emit(&token)?;

        match self.discard_until(&token).await? {
            Discard::Found => {
                debug!(pid = ?self.pid, "start marker observed");
                Ok(())
            }
            Discard::Eof => {
                error!(pid = ?self.pid, "subprocess output ended before the start marker");
                let status = self.child.try_wait().ok().flatten();
                Err(HarnessError::SubprocessExited { status })
            }
        }
    }

    async fn discard_until(&mut self, token: &str) -> Result<Discard> {
        match tokio::time::timeout(self.marker_timeout, scan_for(&mut self.lines, token)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(HarnessError::DeadlineExceeded {
                duration: self.marker_timeout,
            }),
        }
    }

    /// Next line of output.
    ///
    /// End of output means the subprocess died: it is killed and reaped and
    /// [`HarnessError::SubprocessExited`] is returned. Only call this when a
    /// line is expected; "nothing yet" is reported as
    /// [`HarnessError::DeadlineExceeded`].
    pub async fn read_line(&mut self, timeout: Duration) -> Result<String> {
        if self.closed {
            return Err(HarnessError::Closed);
        }

        match tokio::time::timeout(timeout, self.lines.next_line()).await {
            Err(_) => Err(HarnessError::DeadlineExceeded { duration: timeout }),
            Ok(Err(e)) => {
                self.closed = true;
                let status = self.terminate().await;
                error!(pid = ?self.pid, status = ?status, error = %e, "reading subprocess output failed");
                Err(e.into())
            }
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => {
                self.closed = true;
                let status = self.terminate().await;
                error!(pid = ?self.pid, status = ?status, "subprocess output ended unexpectedly");
                Err(HarnessError::SubprocessExited { status })
            }
        }
    }

    /// Emit the end marker, discard output up to it (or end of output), then
    /// kill and reap the subprocess. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let token = new_token("end");
        let drained = match self.sink.emit(&token) {
            Ok(()) => self.discard_until(&token).await,
            Err(e) => Err(e),
        };

        match &drained {
            Ok(Discard::Found) => debug!(pid = ?self.pid, "end marker observed"),
            Ok(Discard::Eof) => debug!(pid = ?self.pid, "output ended before end marker"),
            Err(e) => warn!(pid = ?self.pid, error = %e, "end marker handshake failed"),
        }

        self.terminate().await;
        drained.map(|_| ())
    }

    /// The subprocess id, if it was still running when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns true after `close()` or after output ended.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn terminate(&mut self) -> Option<ExitStatus> {
        if let Err(e) = self.child.start_kill() {
            // Already exited
            trace!(error = %e, "kill failed");
        }
        match self.child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "failed to reap subprocess");
                None
            }
        }
    }
}

impl std::fmt::Debug for OutputMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputMonitor")
            .field("pid", &self.pid)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
