//! Readiness detection for freshly started containers.
//!
//! Reader threads turn each log source into lines and push them onto one
//! channel. [`await_ready`] is the single consumer and races the channel
//! against a wall-clock deadline.

use std::io::{BufRead, BufReader, Read};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info};

use crate::error::ConfigError;

/// Markers and deadline for one task mode.
#[derive(Debug, Clone)]
pub struct ReadinessProfile {
    pub markers: Vec<Regex>,
    /// `None` waits until a marker appears or the stream closes.
    pub timeout: Option<Duration>,
}

impl ReadinessProfile {
    pub fn new<S: AsRef<str>>(
        patterns: &[S],
        timeout: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        let markers = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|source| ConfigError::InvalidMarker {
                    pattern: p.as_ref().to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { markers, timeout })
    }

    /// Profile that never waits: the caller detaches immediately.
    pub fn detached() -> Self {
        Self {
            markers: Vec::new(),
            timeout: Some(Duration::ZERO),
        }
    }

    pub fn matches(&self, line: &str) -> bool {
        self.markers.iter().any(|m| m.is_match(line))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyVia {
    /// A marker matched this (ANSI-stripped) line.
    Marker { line: String },
    /// Deadline passed first. The container keeps running.
    Timeout,
    /// Every log source ended before a marker appeared.
    StreamClosed,
}

#[derive(Debug, Clone)]
pub struct ReadinessOutcome {
    pub ready_via: ReadyVia,
    pub elapsed: Duration,
}

impl ReadinessOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self.ready_via, ReadyVia::Marker { .. })
    }
}

fn spawn_line_reader(source: Box<dyn Read + Send>, tx: mpsc::Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(line).is_err() {
                        // Monitor is gone.
                        break;
                    }
                }
            }
        }
    });
}

/// Watch `sources` until a marker line, the deadline, or end of stream.
///
/// Every line seen is passed to `sink` after ANSI stripping. Reader threads
/// outlive this call until their source closes; callers end that by
/// dropping the log follower.
pub fn await_ready(
    sources: Vec<Box<dyn Read + Send>>,
    profile: &ReadinessProfile,
    sink: &mut dyn FnMut(&str),
) -> ReadinessOutcome {
    let started = Instant::now();

    if profile.markers.is_empty() {
        debug!("readiness: no markers, detaching");
        return ReadinessOutcome {
            ready_via: ReadyVia::Timeout,
            elapsed: Duration::ZERO,
        };
    }

    let (tx, rx) = mpsc::channel();
    for source in sources {
        spawn_line_reader(source, tx.clone());
    }
    drop(tx);

    let deadline = profile.timeout.map(|t| started + t);
    let ready_via = loop {
        let received = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break ReadyVia::Timeout;
                }
                rx.recv_timeout(deadline - now)
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(raw) => {
                let line = strip_ansi_escapes::strip_str(&raw);
                sink(&line);
                if profile.matches(&line) {
                    break ReadyVia::Marker { line };
                }
            }
            Err(RecvTimeoutError::Timeout) => break ReadyVia::Timeout,
            Err(RecvTimeoutError::Disconnected) => break ReadyVia::StreamClosed,
        }
    };

    let elapsed = started.elapsed();
    info!(?ready_via, elapsed_ms = elapsed.as_millis() as u64, "readiness: done");
    ReadinessOutcome { ready_via, elapsed }
}
