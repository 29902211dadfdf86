//! Child output streaming.
//!
//! Every line a child writes is echoed to stdout prefixed with its toolchain
//! name, so interleaved output from concurrent processes stays attributable.
//! Lines are also emitted as `trace` events under the [`OUTPUT_TARGET`]
//! target, which the persistent output log records.

use std::collections::VecDeque;
use std::io::Write;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub const OUTPUT_TARGET: &str = "devctl::output";

/// Bounded buffer of the most recent output lines.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

pub fn emit_line(label: &str, line: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "[{label}] {line}");
    drop(stdout);
    trace!(target: OUTPUT_TARGET, toolchain = label, "{line}");
}

/// Read `reader` line by line until EOF, handing each line to `on_line`.
///
/// Invalid UTF-8 is replaced rather than ending the stream. The pump stops
/// early once `on_line` returns `false`.
pub fn pump_lines<R, F>(label: String, reader: R, mut on_line: F) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(String) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(&['\r', '\n'][..])
                        .to_string();
                    if !on_line(line) {
                        break;
                    }
                }
                Err(err) => {
                    debug!(toolchain = label.as_str(), "output stream error: {err}");
                    break;
                }
            }
        }
    })
}

// How long to wait for buffered output once a child has exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Wait for the pumps of an exited child to reach EOF.
///
/// Grandchildren may hold the pipes open; those pumps are left running.
pub async fn drain(pumps: Vec<JoinHandle<()>>) {
    for pump in pumps {
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, pump).await;
    }
}
