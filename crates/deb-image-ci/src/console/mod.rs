use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};
use crate::log_sanitize::sanitized_tail;

pub mod scripted;
pub mod sink;

pub use sink::{ConsoleSink, FileSink, TracingSink};

const READ_CHUNK: usize = 8192;
const TAIL_LINES: usize = 12;
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Shared interrupt flag. Once set, every pending and future `expect*` fails with
/// `ErrorKind::Interrupted`; safe to set from a signal handler thread.
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything the console has emitted, plus how far the interaction script has consumed.
#[derive(Debug, Default)]
pub struct Transcript {
    data: Vec<u8>,
    cursor: usize,
}

impl Transcript {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn unread(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    fn append(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    // `n` is relative to the unread window.
    fn consume(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.data.len());
    }
}

/// Expect/send driver over a VM serial console (or anything else that is a byte stream).
///
/// A reader thread forwards output chunks over a channel; `expect*` waits on that channel
/// with the remaining per-call deadline.
pub struct Console {
    rx: mpsc::Receiver<Vec<u8>>,
    writer: Box<dyn Write + Send>,
    transcript: Transcript,
    eof: bool,
    cancel: Cancel,
    _reader: JoinHandle<()>,
}

impl Console {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::with_sinks(reader, writer, Vec::new())
    }

    pub fn with_sinks<R, W>(reader: R, writer: W, sinks: Vec<Box<dyn ConsoleSink>>) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let reader = std::thread::spawn(move || pump_output(reader, tx, sinks));
        Self {
            rx,
            writer: Box::new(writer),
            transcript: Transcript::default(),
            eof: false,
            cancel: Cancel::new(),
            _reader: reader,
        }
    }

    /// Share an interrupt flag with whoever handles signals.
    pub fn with_cancel(mut self, cancel: Cancel) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> Cancel {
        self.cancel.clone()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Wait for `pattern` to appear literally in unread output.
    pub fn expect(&mut self, pattern: &str, timeout: Duration) -> Result<String> {
        self.expect_any(&[pattern], timeout)?;
        Ok(pattern.to_string())
    }

    /// Wait for whichever of `patterns` shows up first in the stream and return its index.
    ///
    /// "First" is by position in the output, not by position in `patterns`; two
    /// candidates starting at the same byte resolve to the earlier-listed one. All
    /// output up to the end of the match is consumed and never searched again.
    pub fn expect_any<P: AsRef<str>>(&mut self, patterns: &[P], timeout: Duration) -> Result<usize> {
        let needles: Vec<&[u8]> = patterns.iter().map(|p| p.as_ref().as_bytes()).collect();
        if needles.is_empty() || needles.iter().any(|n| n.is_empty()) {
            return Err(Error::msg("expect called with an empty pattern"));
        }
        let longest = needles.iter().map(|n| n.len()).max().unwrap_or(1);

        let deadline = Instant::now() + timeout;
        let mut scan_from = 0usize;
        loop {
            let unread = self.transcript.unread();
            if let Some((idx, end)) = find_earliest(unread, scan_from, &needles) {
                self.transcript.consume(end);
                debug!(pattern = patterns[idx].as_ref(), "console matched");
                return Ok(idx);
            }
            // Anything that could still start a match lies in the last `longest - 1` bytes.
            scan_from = unread.len().saturating_sub(longest - 1);

            if self.eof {
                return Err(Error::console_closed(format!(
                    "console closed while waiting for {}{}",
                    describe(patterns),
                    self.describe_unread()
                )));
            }
            if self.cancel.is_cancelled() {
                return Err(Error::interrupted(format!(
                    "interrupted while waiting for {}",
                    describe(patterns)
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::expect_timeout(format!(
                    "timed out after {}s waiting for {}{}",
                    timeout.as_secs_f32(),
                    describe(patterns),
                    self.describe_unread()
                )));
            }
            match self.rx.recv_timeout((deadline - now).min(CANCEL_POLL)) {
                Ok(chunk) => self.transcript.append(&chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.eof = true,
            }
        }
    }

    /// Write `text` verbatim; include `\r\n` yourself.
    pub fn send(&mut self, text: &str) -> Result<()> {
        debug!(bytes = text.len(), "console send");
        self.writer
            .write_all(text.as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(|e| Error::msg(format!("console write failed: {e}")))
    }

    fn describe_unread(&self) -> String {
        let tail = sanitized_tail(self.transcript.unread(), TAIL_LINES);
        if tail.is_empty() {
            return "; no unread console output".into();
        }
        let mut out = String::from("; last console output:");
        for line in tail {
            out.push_str("\n    ");
            out.push_str(&line);
        }
        out
    }
}

fn describe<P: AsRef<str>>(patterns: &[P]) -> String {
    let quoted: Vec<String> = patterns
        .iter()
        .map(|p| format!("{:?}", p.as_ref()))
        .collect();
    if quoted.len() == 1 {
        quoted[0].clone()
    } else {
        format!("any of [{}]", quoted.join(", "))
    }
}

// Returns (pattern index, end offset) of the match with the smallest start offset.
fn find_earliest(haystack: &[u8], from: usize, needles: &[&[u8]]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize, usize)> = None;
    for (idx, needle) in needles.iter().enumerate() {
        let Some(start) = find_bytes(&haystack[from.min(haystack.len())..], needle) else {
            continue;
        };
        let start = start + from;
        if best.is_none_or(|(best_start, _, _)| start < best_start) {
            best = Some((start, idx, start + needle.len()));
        }
    }
    best.map(|(_, idx, end)| (idx, end))
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn pump_output<R: Read>(mut reader: R, tx: mpsc::Sender<Vec<u8>>, mut sinks: Vec<Box<dyn ConsoleSink>>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("console read ended: {e}");
                break;
            }
        };
        for s in sinks.iter_mut() {
            s.output(&buf[..n]);
        }
        // Keep draining after the console is dropped so sinks see everything until EOF.
        let _ = tx.send(buf[..n].to_vec());
    }
    for s in sinks.iter_mut() {
        s.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedGuest;
    use super::*;
    use crate::error::ErrorKind;

    const SHORT: Duration = Duration::from_secs(5);

    #[test]
    fn patterns_match_in_issue_order() {
        // "second" appears before "first" in the stream, but the script asks for "first" first.
        let (mut console, _guest) = ScriptedGuest::new()
            .emit("second ... first ... third ... second")
            .spawn_console();

        assert_eq!(console.expect("first", SHORT).expect("first"), "first");
        assert_eq!(console.expect("second", SHORT).expect("second"), "second");
        let err = console
            .expect("third", Duration::from_millis(200))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExpectTimeout);
    }

    #[test]
    fn earliest_alternative_wins_regardless_of_list_order() {
        let (mut console, _guest) = ScriptedGuest::new()
            .emit("booting\r\nFAIL here\r\nPASS there\r\n")
            .spawn_console();
        assert_eq!(console.expect_any(&["PASS", "FAIL"], SHORT).expect("match"), 1);
        assert_eq!(console.expect_any(&["PASS", "FAIL"], SHORT).expect("match"), 0);
    }

    #[test]
    fn cancel_interrupts_a_long_wait() {
        let (console, _guest) = ScriptedGuest::new().emit("booting\r\n").spawn_console();
        let cancel = Cancel::new();
        let mut console = console.with_cancel(cancel.clone());

        let started = Instant::now();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        });
        let err = console
            .expect("login:", Duration::from_secs(60))
            .unwrap_err();
        canceller.join().expect("join");

        assert_eq!(err.kind(), ErrorKind::Interrupted);
        assert!(err.to_string().contains("\"login:\""), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(console.cancel_handle().is_cancelled());
    }

    #[test]
    fn output_already_buffered_still_matches_before_cancel_is_seen() {
        let (mut console, _guest) = ScriptedGuest::new().emit("debian login: ").spawn_console();
        assert!(console.expect("login:", SHORT).is_ok());
        console.cancel_handle().cancel();
        let err = console.expect("Password:", SHORT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Interrupted);
    }

    #[test]
    fn earliest_alternative_across_chunks() {
        let (mut console, _guest) = ScriptedGuest::new()
            .emit("B")
            .delay(Duration::from_millis(50))
            .emit("A")
            .spawn_console();
        assert_eq!(console.expect_any(&["A", "B"], SHORT).expect("match"), 1);
    }

    #[test]
    fn match_split_over_chunks_is_found() {
        let (mut console, _guest) = ScriptedGuest::new()
            .emit("debian lo")
            .delay(Duration::from_millis(20))
            .emit("gin: ")
            .spawn_console();
        console.expect("debian login:", SHORT).expect("login prompt");
    }

    #[test]
    fn timeout_is_bounded_and_reports_tail() {
        let (mut console, _guest) = ScriptedGuest::new()
            .emit("\x1b[0;32mOK\x1b[0m started\r\n")
            .spawn_console();
        let start = Instant::now();
        let err = console
            .expect("never", Duration::from_secs(1))
            .unwrap_err();
        let elapsed = start.elapsed();
        assert_eq!(err.kind(), ErrorKind::ExpectTimeout);
        assert!(elapsed >= Duration::from_secs(1), "returned early: {elapsed:?}");
        assert!(
            elapsed < Duration::from_secs(2),
            "overran timeout: {elapsed:?}"
        );
        let msg = err.to_string();
        assert!(msg.contains("\"never\""), "{msg}");
        assert!(msg.contains("OK started"), "{msg}");
    }

    #[test]
    fn eof_reports_console_closed() {
        let (mut console, _guest) = ScriptedGuest::new()
            .emit("kernel panic")
            .close()
            .spawn_console();
        let err = console.expect("login:", SHORT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConsoleClosed);
    }

    #[test]
    fn empty_pattern_rejected() {
        let (mut console, _guest) = ScriptedGuest::new().spawn_console();
        let err = console.expect("", SHORT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[test]
    fn send_is_verbatim() {
        let (mut console, guest) = ScriptedGuest::new()
            .await_input("debian\r\n")
            .emit("Password:")
            .spawn_console();
        console.send("debian\r\n").expect("send");
        console.expect("Password:", SHORT).expect("password prompt");
        assert_eq!(guest.received(), "debian\r\n");
    }

    #[test]
    fn find_earliest_prefers_listed_order_on_tie() {
        let hay: &[u8] = b"xxabcxx";
        let abc: &[u8] = b"abc";
        let ab: &[u8] = b"ab";
        let bc: &[u8] = b"bc";
        assert_eq!(find_earliest(hay, 0, &[abc, ab]), Some((0, 5)));
        assert_eq!(find_earliest(hay, 0, &[bc, abc]), Some((1, 5)));
        assert_eq!(find_earliest(hay, 4, &[abc]), None);
    }
}
