/// Port handshake parsing
///
/// The backend announces where it listens by writing `port=<digits>` somewhere
/// on its standard output. `parse_port` handles a complete piece of text;
/// `HandshakeScanner` handles the raw stream, where the announcement may be
/// split across reads.
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tracing::debug;

use crate::error::{ShellError, ShellResult};

pub const PORT_MARKER: &str = "port=";

/// Default cap for the trailing partial line kept between chunks
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// How long a digit run at the end of the output may wait for more digits
/// before it is taken as the whole port
pub const HANDSHAKE_SETTLE: Duration = Duration::from_millis(150);

static PORT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"port=([0-9]+)").expect("port pattern compiles"));

enum PortSearch {
    Found(u16),
    /// A digit run reaches the end of the buffer and may continue in the next chunk
    Partial,
    Missing,
}

fn port_from_digits(digits: &[u8]) -> Option<u16> {
    std::str::from_utf8(digits)
        .ok()?
        .parse::<u16>()
        .ok()
        .filter(|port| *port > 0)
}

fn search(buf: &[u8], complete: bool) -> PortSearch {
    for caps in PORT_PATTERN.captures_iter(buf) {
        let Some(digits) = caps.get(1) else {
            continue;
        };
        if !complete && digits.end() == buf.len() {
            return PortSearch::Partial;
        }
        match port_from_digits(digits.as_bytes()) {
            Some(port) => return PortSearch::Found(port),
            None => debug!(
                "Ignoring invalid port announcement: {}",
                String::from_utf8_lossy(caps.get(0).map_or(&[][..], |m| m.as_bytes()))
            ),
        }
    }
    PortSearch::Missing
}

/// Extracts the first valid port announced in `text`.
/// Zero and values above 65535 are not ports and are skipped.
pub fn parse_port(text: &str) -> Option<u16> {
    match search(text.as_bytes(), true) {
        PortSearch::Found(port) => Some(port),
        PortSearch::Partial | PortSearch::Missing => None,
    }
}

/// Incremental handshake detection over raw output chunks.
///
/// Yields a port at most once. Complete lines without an announcement are
/// dropped since a marker never spans a newline, so only the trailing partial
/// line is retained.
#[derive(Debug)]
pub struct HandshakeScanner {
    pending: Vec<u8>,
    max_line: usize,
    found: Option<u16>,
    /// The pending bytes end in `port=<digits>` that may still grow
    partial: bool,
}

impl HandshakeScanner {
    pub fn new(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line: max_line.max(PORT_MARKER.len() + 5),
            found: None,
            partial: false,
        }
    }

    /// Feeds one chunk. Returns `Some(port)` on the chunk that completes the
    /// first announcement and `None` for every other chunk, before or after.
    pub fn feed(&mut self, chunk: &[u8]) -> ShellResult<Option<u16>> {
        if self.found.is_some() {
            return Ok(None);
        }

        self.pending.extend_from_slice(chunk);
        match search(&self.pending, false) {
            PortSearch::Found(port) => return Ok(Some(self.accept(port))),
            PortSearch::Partial => self.partial = true,
            PortSearch::Missing => self.partial = false,
        }

        if let Some(newline) = self.pending.iter().rposition(|b| *b == b'\n') {
            self.pending.drain(..=newline);
        }

        if self.pending.len() > self.max_line {
            self.pending = Vec::new();
            self.partial = false;
            return Err(ShellError::HandshakeOverflow {
                limit: self.max_line,
            });
        }

        Ok(None)
    }

    /// Takes the held digit run as complete. Used once output has gone quiet
    /// or the stream has ended.
    pub fn settle(&mut self) -> Option<u16> {
        if self.found.is_some() {
            return None;
        }
        self.partial = false;
        match search(&self.pending, true) {
            PortSearch::Found(port) => Some(self.accept(port)),
            PortSearch::Partial | PortSearch::Missing => None,
        }
    }

    /// Whether the output so far ends in an announcement that may continue
    pub fn awaiting_digits(&self) -> bool {
        self.partial
    }

    fn accept(&mut self, port: u16) -> u16 {
        self.found = Some(port);
        self.pending = Vec::new();
        self.partial = false;
        port
    }

    /// The port found so far, if any
    pub fn port(&self) -> Option<u16> {
        self.found
    }

    /// Bytes currently held back waiting for the rest of a line
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forgets everything, ready for a new process instance
    pub fn reset(&mut self) {
        self.pending.clear();
        self.found = None;
        self.partial = false;
    }
}

impl Default for HandshakeScanner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_plain_line() {
        assert_eq!(parse_port("port=9921\n"), Some(9921));
        assert_eq!(parse_port("listening port=8081 on ::1"), Some(8081));
    }

    #[test]
    fn test_parse_port_ignores_noise() {
        assert_eq!(parse_port("starting...\n"), None);
        assert_eq!(parse_port("port="), None);
        assert_eq!(parse_port("port=abc"), None);
        assert_eq!(parse_port(""), None);
    }

    #[test]
    fn test_parse_port_rejects_zero_and_out_of_range() {
        assert_eq!(parse_port("port=0\n"), None);
        assert_eq!(parse_port("port=70000\n"), None);
        assert_eq!(parse_port("port=0 then port=4000\n"), Some(4000));
    }

    #[test]
    fn test_parse_port_first_match_wins() {
        assert_eq!(parse_port("port=1000\nport=2000\n"), Some(1000));
    }

    #[test]
    fn test_scanner_single_announcement() {
        let mut scanner = HandshakeScanner::default();
        assert_eq!(scanner.feed(b"starting...\n").unwrap(), None);
        assert_eq!(scanner.feed(b"port=9921\n").unwrap(), Some(9921));
        assert_eq!(scanner.port(), Some(9921));
    }

    #[test]
    fn test_scanner_yields_once() {
        let mut scanner = HandshakeScanner::default();
        assert_eq!(scanner.feed(b"port=1000\n").unwrap(), Some(1000));
        assert_eq!(scanner.feed(b"port=2000\n").unwrap(), None);
        assert_eq!(scanner.port(), Some(1000));
    }

    #[test]
    fn test_scanner_marker_split_across_chunks() {
        let mut scanner = HandshakeScanner::default();
        assert_eq!(scanner.feed(b"boot ok\npo").unwrap(), None);
        assert_eq!(scanner.feed(b"rt=99").unwrap(), None);
        assert_eq!(scanner.feed(b"21\n").unwrap(), Some(9921));
    }

    #[test]
    fn test_scanner_waits_for_digit_terminator() {
        let mut scanner = HandshakeScanner::default();
        assert_eq!(scanner.feed(b"port=80").unwrap(), None);
        assert_eq!(scanner.feed(b"81 ready").unwrap(), Some(8081));
    }

    #[test]
    fn test_scanner_settles_unterminated_port() {
        let mut scanner = HandshakeScanner::default();
        assert_eq!(scanner.feed(b"booting\nport=9921").unwrap(), None);
        assert!(scanner.awaiting_digits());
        assert_eq!(scanner.settle(), Some(9921));
        assert!(!scanner.awaiting_digits());
        assert_eq!(scanner.port(), Some(9921));
        assert_eq!(scanner.settle(), None);
        assert_eq!(scanner.feed(b"port=1\n").unwrap(), None);
    }

    #[test]
    fn test_scanner_settle_without_digits() {
        let mut scanner = HandshakeScanner::default();
        scanner.feed(b"port=").unwrap();
        assert!(!scanner.awaiting_digits());
        assert_eq!(scanner.settle(), None);
        scanner.feed(b"0").unwrap();
        assert!(scanner.awaiting_digits());
        assert_eq!(scanner.settle(), None);
        assert_eq!(scanner.port(), None);
    }

    #[test]
    fn test_scanner_drops_complete_lines() {
        let mut scanner = HandshakeScanner::default();
        scanner.feed(b"line one\nline two\npartial").unwrap();
        assert_eq!(scanner.pending_len(), "partial".len());
    }

    #[test]
    fn test_scanner_overflow_on_long_line() {
        let mut scanner = HandshakeScanner::new(64);
        let noise = vec![b'x'; 65];
        let err = scanner.feed(&noise).unwrap_err();
        assert!(matches!(err, ShellError::HandshakeOverflow { limit: 64 }));
    }

    #[test]
    fn test_scanner_long_output_in_lines_is_fine() {
        let mut scanner = HandshakeScanner::new(64);
        for _ in 0..100 {
            assert_eq!(scanner.feed(b"some diagnostic output line\n").unwrap(), None);
        }
        assert_eq!(scanner.feed(b"port=7000\n").unwrap(), Some(7000));
    }

    #[test]
    fn test_scanner_reset() {
        let mut scanner = HandshakeScanner::default();
        scanner.feed(b"port=1234\n").unwrap();
        scanner.reset();
        assert_eq!(scanner.port(), None);
        assert_eq!(scanner.feed(b"port=4321\n").unwrap(), Some(4321));
    }
}
