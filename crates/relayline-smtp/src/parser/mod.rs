//! Incremental SMTP reply parser.
//!
//! Bytes arrive in whatever chunks the transport delivers; the parser
//! buffers them and yields complete replies:
//! - Single: `250 OK\r\n`
//! - Multi: `250-First line\r\n250-Second line\r\n250 Last line\r\n`
//!
//! The line terminator is detected from the first line received (`\r\n` or
//! a bare `\n`) and kept for the rest of the connection.

use std::collections::VecDeque;

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::types::{Reply, ReplyCode};

/// Maximum accepted length of one reply line.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Line terminator in use on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    /// `\r\n`, as RFC 5321 requires.
    Crlf,
    /// Bare `\n`.
    Lf,
}

/// Buffers raw bytes and reassembles complete replies.
#[derive(Debug, Default)]
pub struct ReplyParser {
    buffer: BytesMut,
    mode: Option<LineMode>,
    /// Lines split out of a record but not yet consumed.
    pending: VecDeque<String>,
    code: Option<ReplyCode>,
    lines: Vec<String>,
}

impl ReplyParser {
    /// Creates an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the detected line terminator, once a line has been seen.
    #[must_use]
    pub const fn mode(&self) -> Option<LineMode> {
        self.mode
    }

    /// Number of buffered bytes not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops buffered bytes and any partial reply.
    ///
    /// Used after STARTTLS: plaintext that arrived behind the `220` must not
    /// be read as if it came over TLS. The detected line mode is kept.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending.clear();
        self.code = None;
        self.lines.clear();
    }

    /// Returns the next complete reply, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] for a malformed line, a code change inside a
    /// multi-line reply, or a line longer than the limit. The partial reply
    /// is discarded.
    pub fn next_reply(&mut self) -> Result<Option<Reply>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                if let Some(reply) = self.push_line(&line)? {
                    return Ok(Some(reply));
                }
                continue;
            }
            let Some(record) = self.next_record()? else {
                return Ok(None);
            };
            // A CRLF record may still hide bare LFs; treat each as a line.
            self.pending.extend(record.split('\n').map(str::to_string));
        }
    }

    fn next_record(&mut self) -> Result<Option<String>> {
        let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') else {
            if self.buffer.len() > MAX_LINE_LENGTH {
                return Err(self.fail("line too long".to_string()));
            }
            return Ok(None);
        };

        let mode = match self.mode {
            Some(mode) => mode,
            None => {
                let mode = if newline > 0 && self.buffer[newline - 1] == b'\r' {
                    LineMode::Crlf
                } else {
                    LineMode::Lf
                };
                tracing::trace!(?mode, "detected reply line terminator");
                self.mode = Some(mode);
                mode
            }
        };

        let (end, consumed) = match mode {
            LineMode::Lf => (newline, newline + 1),
            LineMode::Crlf => match find_crlf(&self.buffer) {
                Some(pos) => (pos, pos + 2),
                None if self.buffer.len() > MAX_LINE_LENGTH => {
                    return Err(self.fail("line too long".to_string()));
                }
                None => return Ok(None),
            },
        };
        if end > MAX_LINE_LENGTH {
            return Err(self.fail("line too long".to_string()));
        }

        let raw = self.buffer.split_to(consumed);
        let line = &raw[..end];
        let line = match mode {
            LineMode::Lf => line.strip_suffix(b"\r").unwrap_or(line),
            LineMode::Crlf => line,
        };
        Ok(Some(String::from_utf8_lossy(line).into_owned()))
    }

    fn push_line(&mut self, line: &str) -> Result<Option<Reply>> {
        let (code, last, text) = match parse_line(line) {
            Ok(parsed) => parsed,
            Err(Error::Format(message)) => return Err(self.fail(message)),
            Err(err) => return Err(err),
        };

        if let Some(expected) = self.code
            && expected != code
        {
            return Err(self.fail(format!(
                "reply code changed from {expected} to {code} inside a multi-line reply"
            )));
        }

        self.code = Some(code);
        self.lines.push(text.to_string());

        if !last {
            return Ok(None);
        }

        self.code = None;
        let lines = std::mem::take(&mut self.lines);
        Ok(Some(Reply::new(code, lines)))
    }

    fn fail(&mut self, message: String) -> Error {
        self.reset();
        Error::Format(message)
    }
}

/// Splits one reply line into code, "is final line" and text.
///
/// # Errors
///
/// Returns [`Error::Format`] unless the line starts with three digits
/// followed by a space, a hyphen, or nothing.
pub fn parse_line(line: &str) -> Result<(ReplyCode, bool, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(Error::Format(format!("invalid reply line: {line:?}")));
    }

    let code = line[..3]
        .parse()
        .map(ReplyCode::new)
        .map_err(|_| Error::Format(format!("invalid reply code: {line:?}")))?;

    match bytes.get(3) {
        None => Ok((code, true, "")),
        Some(b' ') => Ok((code, true, &line[4..])),
        Some(b'-') => Ok((code, false, &line[4..])),
        Some(_) => Err(Error::Format(format!("invalid reply separator: {line:?}"))),
    }
}

/// Checks if a line is the last line of a multi-line reply.
///
/// Multi-line replies use `-` separator for continuation and ` ` for the last line.
#[must_use]
pub fn is_last_reply_line(line: &str) -> bool {
    matches!(parse_line(line), Ok((_, true, _)))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parse_all(data: &[u8]) -> Vec<Reply> {
        let mut parser = ReplyParser::new();
        parser.feed(data);
        let mut replies = Vec::new();
        while let Some(reply) = parser.next_reply().unwrap() {
            replies.push(reply);
        }
        replies
    }

    #[test]
    fn test_parse_single_line_reply() {
        let replies = parse_all(b"250 OK\r\n");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].code.as_u16(), 250);
        assert_eq!(replies[0].message, vec!["OK"]);
        assert!(replies[0].is_success());
    }

    #[test]
    fn test_parse_multi_line_reply() {
        let replies = parse_all(b"250-First line\r\n250-Second line\r\n250 Last line\r\n");
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0].message,
            vec!["First line", "Second line", "Last line"]
        );
        assert_eq!(
            replies[0].message_text(),
            "First line\nSecond line\nLast line"
        );
    }

    #[test]
    fn test_parse_greeting() {
        let replies = parse_all(b"220 smtp.example.com ESMTP ready\r\n");
        assert_eq!(replies[0].code.as_u16(), 220);
        assert_eq!(replies[0].message, vec!["smtp.example.com ESMTP ready"]);
    }

    #[test]
    fn test_bare_code_line() {
        let replies = parse_all(b"250\r\n");
        assert_eq!(replies[0].code, ReplyCode::new(250));
        assert_eq!(replies[0].message, vec![""]);
    }

    #[test]
    fn test_lf_mode_detected() {
        let mut parser = ReplyParser::new();
        parser.feed(b"220 hi\n250-a\n250 b\n");
        assert_eq!(parser.next_reply().unwrap().unwrap().code.as_u16(), 220);
        assert_eq!(parser.mode(), Some(LineMode::Lf));
        assert_eq!(parser.next_reply().unwrap().unwrap().message, vec!["a", "b"]);
    }

    #[test]
    fn test_crlf_mode_splits_embedded_lf() {
        let mut parser = ReplyParser::new();
        parser.feed(b"220 hi\r\n250-a\n250 b\r\n");
        parser.next_reply().unwrap().unwrap();
        assert_eq!(parser.mode(), Some(LineMode::Crlf));
        assert_eq!(parser.next_reply().unwrap().unwrap().message, vec!["a", "b"]);
    }

    #[test]
    fn test_embedded_lf_can_end_a_reply() {
        let replies = parse_all(b"220 hi\r\n250 a\n221 b\r\n");
        let codes: Vec<u16> = replies.iter().map(|r| r.code.as_u16()).collect();
        assert_eq!(codes, vec![220, 250, 221]);
    }

    #[test]
    fn test_incomplete_waits_for_more() {
        let mut parser = ReplyParser::new();
        parser.feed(b"250-First\r\n250 La");
        assert!(parser.next_reply().unwrap().is_none());
        parser.feed(b"st\r\n");
        let reply = parser.next_reply().unwrap().unwrap();
        assert_eq!(reply.message, vec!["First", "Last"]);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_several_replies_in_one_chunk() {
        let replies = parse_all(b"250 2.1.0 Ok\r\n250 2.1.5 Ok\r\n354 End data with <CR><LF>.<CR><LF>\r\n");
        let codes: Vec<u16> = replies.iter().map(|r| r.code.as_u16()).collect();
        assert_eq!(codes, vec![250, 250, 354]);
    }

    #[test]
    fn test_invalid_code_is_format_error() {
        let mut parser = ReplyParser::new();
        parser.feed(b"ABC OK\r\n");
        assert!(matches!(parser.next_reply(), Err(Error::Format(_))));
    }

    #[test]
    fn test_invalid_separator_is_format_error() {
        let mut parser = ReplyParser::new();
        parser.feed(b"250xOK\r\n");
        assert!(matches!(parser.next_reply(), Err(Error::Format(_))));
    }

    #[test]
    fn test_code_mismatch_is_format_error() {
        let mut parser = ReplyParser::new();
        parser.feed(b"250-a\r\n251 b\r\n");
        assert!(matches!(parser.next_reply(), Err(Error::Format(_))));
    }

    #[test]
    fn test_line_too_long() {
        let mut parser = ReplyParser::new();
        parser.feed(&vec![b'2'; MAX_LINE_LENGTH + 1]);
        assert!(matches!(parser.next_reply(), Err(Error::Format(_))));
    }

    #[test]
    fn test_reset_drops_buffered_bytes() {
        let mut parser = ReplyParser::new();
        parser.feed(b"220 go ahead\r\n250 injected\r\n");
        assert_eq!(parser.next_reply().unwrap().unwrap().code.as_u16(), 220);
        parser.reset();
        assert_eq!(parser.buffered(), 0);
        assert!(parser.next_reply().unwrap().is_none());
    }

    #[test]
    fn test_is_last_reply_line() {
        assert!(is_last_reply_line("250 OK"));
        assert!(is_last_reply_line("250"));
        assert!(!is_last_reply_line("250-Continuing"));
        assert!(!is_last_reply_line("25"));
    }

    const TRANSCRIPT: &[u8] = b"220 mx ESMTP\r\n250-mx\r\n250-PIPELINING\r\n250 SIZE 100\r\n\
250 ok\r\n550 5.1.1 no such user\r\n354 go\r\n";

    proptest! {
        #[test]
        fn chunking_does_not_change_replies(splits in proptest::collection::vec(0..TRANSCRIPT.len(), 0..8)) {
            let expected = parse_all(TRANSCRIPT);

            let mut cuts = splits;
            cuts.push(TRANSCRIPT.len());
            cuts.sort_unstable();

            let mut parser = ReplyParser::new();
            let mut replies = Vec::new();
            let mut start = 0;
            for cut in cuts {
                parser.feed(&TRANSCRIPT[start..cut]);
                start = cut;
                while let Some(reply) = parser.next_reply().unwrap() {
                    replies.push(reply);
                }
            }
            prop_assert_eq!(replies, expected);
        }
    }
}
