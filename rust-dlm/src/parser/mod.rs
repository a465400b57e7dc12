//! Decoders for the downloader's unstructured text output.
//!
//! Two modes, matching how the tool is invoked:
//!
//! - **Streaming progress**: stdout arrives in arbitrary-sized chunks and
//!   progress lines are terminated with bare carriage returns, so a
//!   [`LineSplitter`] carries partial lines across chunks and splits on
//!   `\r`, `\n`, and `\r\n`. Every line starting with a bracketed tag
//!   becomes a [`LineEvent`]; lines matching the progress pattern also
//!   carry a decoded [`ProgressInfo`].
//! - **Single document**: metadata lookups suppress all human-readable
//!   output in favor of exactly one JSON document, buffered by
//!   [`JsonDocBuffer`] until the process closes.

use std::sync::OnceLock;

use regex::Regex;

use crate::{Error, Result};

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[([^\]\s]+)\]\s*(.*)$").unwrap())
}

fn progress_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // e.g. "[download]  42.0% of ~10.00MiB at 1.00MiB/s ETA 00:07"
        Regex::new(r"^\s*([\d.]+)%\s+of\s+~?\s*(\S+)\s+at\s+(\S+)\s+ETA\s+(\S+)").unwrap()
    })
}

/// Decoded fields of a progress line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressInfo {
    /// Percent complete, 0-100.
    pub percent: f64,
    /// Approximate total size as reported, e.g. "10.00MiB".
    pub total_size: String,
    /// Current speed as reported, e.g. "1.00MiB/s".
    pub current_speed: String,
    /// Estimated time remaining, e.g. "00:07".
    pub eta: String,
}

/// One bracketed output line.
///
/// The generic `(tag, rest)` shape is emitted for every bracketed line so
/// future event types can be consumed without touching the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct LineEvent {
    pub tag: String,
    pub rest: String,
    /// Present when `rest` matched the progress pattern.
    pub progress: Option<ProgressInfo>,
}

/// Decode one complete output line. Non-bracketed lines yield `None`.
pub fn parse_line(line: &str) -> Option<LineEvent> {
    let caps = tag_regex().captures(line.trim_end())?;
    let tag = caps[1].to_string();
    let rest = caps[2].to_string();

    let progress = progress_regex().captures(&rest).and_then(|p| {
        Some(ProgressInfo {
            percent: p[1].parse().ok()?,
            total_size: p[2].to_string(),
            current_speed: p[3].to_string(),
            eta: p[4].to_string(),
        })
    });

    Some(LineEvent {
        tag,
        rest,
        progress,
    })
}

/// Extract the destination path from a `Destination: <path>` line body.
pub fn parse_destination(rest: &str) -> Option<&str> {
    rest.strip_prefix("Destination:").map(str::trim)
}

/// Splits an arbitrary-chunked byte stream into complete lines.
///
/// Progress updates are terminated with bare `\r` (the tool redraws the
/// same terminal line), so waiting for `\n` would withhold every update
/// until the download finished.
#[derive(Debug, Default)]
pub struct LineSplitter {
    carry: String,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the complete lines it closed off.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.push_str(&String::from_utf8_lossy(chunk));

        let mut lines = Vec::new();
        while let Some(pos) = self.carry.find(['\r', '\n']) {
            let terminator = self.carry.as_bytes()[pos];
            let mut line: String = self.carry.drain(..=pos).collect();
            line.pop();
            // Treat \r\n as a single terminator.
            if terminator == b'\r' && self.carry.starts_with('\n') {
                self.carry.remove(0);
            }
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Drain whatever is left after EOF as a final line.
    pub fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.carry))
        }
    }
}

/// Accumulates stdout for single-document mode and decodes it on close.
#[derive(Debug, Default)]
pub struct JsonDocBuffer {
    buf: Vec<u8>,
}

impl JsonDocBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Decode the buffered output as one JSON document.
    ///
    /// An empty or non-parseable buffer is an error: the invocation contract
    /// guarantees exactly one document on success.
    pub fn finish(self) -> Result<serde_json::Value> {
        if self.buf.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(Error::Other(
                "downloader produced no metadata output".to_string(),
            ));
        }
        Ok(serde_json::from_slice(&self.buf)?)
    }
}
