// Common test utilities
#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use callback_harness::{FileSink, ResponseInfo, Script};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A redirect, headers and a three-chunk body.
pub fn redirect_then_body() -> Script {
    Script::new("https://example.test/old")
        .redirect("https://example.test/new", 302)
        .respond(
            ResponseInfo::new("", 200)
                .with_header("Content-Type", "text/plain")
                .with_protocol("h2"),
        )
        .chunk("ab")
        .chunk("")
        .chunk("cd")
        .succeed()
}

/// Command line that streams a log file, from its first line, as it grows.
pub fn follow_log(path: &Path) -> Vec<String> {
    vec![
        "tail".to_string(),
        "-n".to_string(),
        "+1".to_string(),
        "-f".to_string(),
        path.display().to_string(),
    ]
}

/// A sink writing to `dir/name`, created empty so the follower can open it.
pub fn log_sink(dir: &Path, name: &str) -> FileSink {
    let path = dir.join(name);
    std::fs::write(&path, "").expect("create log file");
    FileSink::new(path)
}
