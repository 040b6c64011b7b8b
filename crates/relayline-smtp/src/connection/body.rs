//! DATA body encoding: line splitting, dot-stuffing, CRLF normalization.

use bytes::BytesMut;

/// Splits a message into lines without their terminators.
///
/// Both `\r\n` and a bare `\n` end a line. A trailing terminator does not
/// produce an extra empty line.
pub fn lines(message: &[u8]) -> impl Iterator<Item = &[u8]> {
    let body = message.strip_suffix(b"\n").unwrap_or(message);
    let empty = message.is_empty();
    body.split(|&b| b == b'\n')
        .filter(move |_| !empty)
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

/// Returns true if `message` contains a `\n` not preceded by `\r`.
#[must_use]
pub fn has_bare_lf(message: &[u8]) -> bool {
    message
        .iter()
        .enumerate()
        .any(|(i, &b)| b == b'\n' && (i == 0 || message[i - 1] != b'\r'))
}

/// Appends one body line to `out`, dot-stuffed and CRLF-terminated.
pub fn encode_line(line: &[u8], out: &mut BytesMut) {
    if line.first() == Some(&b'.') {
        out.extend_from_slice(b".");
    }
    out.extend_from_slice(line);
    out.extend_from_slice(b"\r\n");
}

/// End-of-data marker.
pub const TERMINATOR: &[u8] = b".\r\n";

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

    fn encode(message: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        for line in lines(message) {
            encode_line(line, &mut out);
        }
        out.to_vec()
    }

    /// What a receiving server does: strip one leading dot.
    fn unstuff(wire: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for line in lines(wire) {
            out.extend_from_slice(line.strip_prefix(b".").unwrap_or(line));
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    #[test]
    fn test_dot_stuffing() {
        assert_eq!(encode(b".hidden\r\nok\r\n..two\r\n"), b"..hidden\r\nok\r\n...two\r\n");
    }

    #[test]
    fn test_lone_dot_line_is_escaped() {
        assert_eq!(encode(b"a\r\n.\r\nb\r\n"), b"a\r\n..\r\nb\r\n");
    }

    #[test]
    fn test_bare_lf_normalized() {
        assert_eq!(encode(b"a\nb\r\nc"), b"a\r\nb\r\nc\r\n");
    }

    #[test]
    fn test_empty_message() {
        assert!(encode(b"").is_empty());
    }

    #[test]
    fn test_blank_lines_kept() {
        assert_eq!(encode(b"Subject: x\r\n\r\nbody\r\n"), b"Subject: x\r\n\r\nbody\r\n");
    }

    #[test]
    fn test_has_bare_lf() {
        assert!(!has_bare_lf(b"a\r\nb\r\n"));
        assert!(has_bare_lf(b"a\nb"));
        assert!(has_bare_lf(b"\n"));
        assert!(!has_bare_lf(b"no newline"));
    }

    proptest! {
        #[test]
        fn dot_stuffing_round_trip(raw in proptest::collection::vec("[.a-z ]{0,6}", 0..10)) {
            let mut message = Vec::new();
            for line in &raw {
                message.extend_from_slice(line.as_bytes());
                message.extend_from_slice(b"\r\n");
            }
            let wire = encode(&message);
            for line in lines(&wire) {
                prop_assert!(line != b".");
            }
            prop_assert_eq!(unstuff(&wire), message);
        }
    }
}
