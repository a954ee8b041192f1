//! Line scanning over streamed log bodies.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::gzip;
use crate::LogError;

/// Upper bound for a buffered compressed body.
pub const MAX_COMPRESSED_BYTES: usize = 32 * 1024 * 1024;
/// Upper bound for decompressed output when no byte limit is requested.
pub const MAX_DECODED_BYTES: usize = 64 * 1024 * 1024;

/// Which lines to keep.
#[derive(Debug, Clone)]
pub enum LineMatcher {
    All,
    /// Case-insensitive substrings, stored lowercased.
    Substrings(Vec<String>),
    Regex(Regex),
}

impl LineMatcher {
    /// Regex mode joins the patterns with `|`.
    pub fn new(patterns: &[String], is_regex: bool) -> Result<Self, regex::Error> {
        if patterns.is_empty() {
            return Ok(LineMatcher::All);
        }
        if is_regex {
            return Ok(LineMatcher::Regex(Regex::new(&patterns.join("|"))?));
        }
        Ok(LineMatcher::Substrings(patterns.iter().map(|p| p.to_lowercase()).collect()))
    }

    pub fn matches(&self, line: &str) -> bool {
        match self {
            LineMatcher::All => true,
            LineMatcher::Substrings(subs) => {
                let lower = line.to_lowercase();
                subs.iter().any(|s| lower.contains(s.as_str()))
            }
            LineMatcher::Regex(re) => re.is_match(line),
        }
    }
}

/// Lines kept from one body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Retained {
    pub lines: Vec<String>,
    /// Joined size, separators included.
    pub bytes: usize,
    /// A matching line did not fit the cap.
    pub truncated: bool,
}

impl Retained {
    pub fn text(&self) -> String { self.lines.join("\n") }
    pub fn is_blank(&self) -> bool { self.lines.iter().all(|l| l.trim().is_empty()) }
}

struct LineSink<'a> {
    matcher: &'a LineMatcher,
    cap: usize,
    out: Retained,
}

impl<'a> LineSink<'a> {
    fn new(matcher: &'a LineMatcher, cap: Option<usize>) -> Self {
        Self { matcher, cap: cap.unwrap_or(usize::MAX), out: Retained::default() }
    }

    /// False once the cap is reached.
    fn push(&mut self, raw: &[u8]) -> bool {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        if !self.matcher.matches(line) {
            return true;
        }
        let sep = usize::from(!self.out.lines.is_empty());
        let next = self.out.bytes.saturating_add(sep + line.len());
        if next > self.cap {
            self.out.truncated = true;
            return false;
        }
        self.out.bytes = next;
        self.out.lines.push(line.to_string());
        true
    }

    /// Feed a complete buffer; returns false once full.
    fn feed_all(&mut self, data: &[u8]) -> bool {
        for line in data.split(|b| *b == b'\n') {
            if !self.push(line) {
                return false;
            }
        }
        true
    }
}

enum Mode {
    Sniffing,
    Plain,
    Gzip(Vec<u8>),
}

/// Scan a body line by line and keep the matching lines, at most `cap` bytes.
///
/// A body starting with the gzip magic is buffered and decompressed first.
pub async fn scan_stream<S, E>(
    stream: S,
    matcher: &LineMatcher,
    cap: Option<usize>,
    cancel: &CancellationToken,
) -> Result<Retained, LogError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut sink = LineSink::new(matcher, cap);
    let mut buf = BytesMut::new();
    let mut mode = Mode::Sniffing;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LogError::Cancelled),
            next = stream.next() => next,
        };
        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return Err(LogError::Stream(e.to_string())),
            None => break,
        };
        if let Mode::Gzip(compressed) = &mut mode {
            if compressed.len() + chunk.len() > MAX_COMPRESSED_BYTES {
                return Err(LogError::TooLarge(MAX_COMPRESSED_BYTES));
            }
            compressed.extend_from_slice(&chunk);
            continue;
        }
        buf.extend_from_slice(&chunk);
        if matches!(mode, Mode::Sniffing) {
            if buf.len() < gzip::GZIP_MAGIC.len() {
                continue;
            }
            if gzip::is_gzip_magic(&buf) {
                mode = Mode::Gzip(buf.split().to_vec());
                continue;
            }
            mode = Mode::Plain;
        }
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos);
            let _ = buf.split_to(1);
            if !sink.push(&line) {
                debug!(bytes = sink.out.bytes, "log scan: cap reached");
                return Ok(sink.out);
            }
        }
    }
    if let Mode::Gzip(compressed) = mode {
        let (decoded, _) =
            gzip::maybe_gunzip(&compressed, MAX_DECODED_BYTES).map_err(|e| LogError::Gzip(e.to_string()))?;
        let body = decoded.strip_suffix(b"\n").unwrap_or(&decoded[..]);
        sink.feed_all(body);
        return Ok(sink.out);
    }
    if !buf.is_empty() {
        sink.push(&buf);
    }
    Ok(sink.out)
}
