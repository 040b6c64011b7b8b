//! EHLO keywords and the capability set built from them.

use std::collections::BTreeSet;

use super::Reply;

/// A single EHLO keyword line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extension {
    /// STARTTLS - TLS upgrade (RFC 3207)
    StartTls,
    /// AUTH - Authentication (RFC 4954), mechanism names as advertised
    Auth(Vec<String>),
    /// SIZE - Maximum message size, 0 when absent or unparsable
    Size(u64),
    /// 8BITMIME - 8-bit MIME transport
    EightBitMime,
    /// PIPELINING - Command pipelining (RFC 2920)
    Pipelining,
    /// ENHANCEDSTATUSCODES - RFC 2034 status codes in reply text
    EnhancedStatusCodes,
    /// SMTPUTF8 - UTF-8 email addresses
    SmtpUtf8,
    /// Unknown extension
    Unknown(String),
}

impl Extension {
    /// Parses an extension line from EHLO response.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let Some(first) = parts.next() else {
            return Self::Unknown(line.to_string());
        };

        // Some older servers advertise `AUTH=LOGIN PLAIN`.
        let (keyword, inline_arg) = match first.split_once('=') {
            Some((k, v)) => (k.to_uppercase(), Some(v)),
            None => (first.to_uppercase(), None),
        };

        match keyword.as_str() {
            "STARTTLS" => Self::StartTls,
            "AUTH" => {
                let mechanisms = inline_arg
                    .filter(|v| !v.is_empty())
                    .into_iter()
                    .chain(parts)
                    .map(str::to_string)
                    .collect();
                Self::Auth(mechanisms)
            }
            "SIZE" => {
                let size = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                Self::Size(size)
            }
            "8BITMIME" => Self::EightBitMime,
            "PIPELINING" => Self::Pipelining,
            "ENHANCEDSTATUSCODES" => Self::EnhancedStatusCodes,
            "SMTPUTF8" => Self::SmtpUtf8,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

/// Server capabilities negotiated by one EHLO.
///
/// Rebuilt on every successful EHLO, so the set seen after STARTTLS replaces
/// the plaintext one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Advertised AUTH mechanisms, case preserved.
    pub auth_mechanisms: BTreeSet<String>,
    /// Maximum message size; 0 means unbounded.
    pub max_message_size: u64,
    /// STARTTLS advertised.
    pub starttls: bool,
    /// PIPELINING advertised.
    pub pipelining: bool,
    /// ENHANCEDSTATUSCODES advertised.
    pub enhanced_status_codes: bool,
    /// 8BITMIME advertised.
    pub eight_bit_mime: bool,
    /// SMTPUTF8 advertised.
    pub smtputf8: bool,
}

impl Capabilities {
    /// Builds the capability set from a successful EHLO reply.
    ///
    /// The first line is the server's greeting domain and is skipped.
    #[must_use]
    pub fn from_ehlo(reply: &Reply) -> Self {
        Self::from_lines(reply.message.iter().skip(1).map(String::as_str))
    }

    /// Builds the capability set from keyword lines with the reply code
    /// already stripped. Unrecognized lines are ignored.
    #[must_use]
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut caps = Self::default();
        for line in lines {
            match Extension::parse(line) {
                Extension::StartTls => caps.starttls = true,
                Extension::Auth(mechanisms) => caps.auth_mechanisms.extend(mechanisms),
                Extension::Size(size) => caps.max_message_size = size,
                Extension::EightBitMime => caps.eight_bit_mime = true,
                Extension::Pipelining => caps.pipelining = true,
                Extension::EnhancedStatusCodes => caps.enhanced_status_codes = true,
                Extension::SmtpUtf8 => caps.smtputf8 = true,
                Extension::Unknown(_) => {}
            }
        }
        caps
    }

    /// Returns the advertised spelling of `mechanism`, compared without case.
    #[must_use]
    pub fn auth_mechanism(&self, mechanism: &str) -> Option<&str> {
        self.auth_mechanisms
            .iter()
            .find(|m| m.eq_ignore_ascii_case(mechanism))
            .map(String::as_str)
    }

    /// Returns true if `mechanism` was advertised.
    #[must_use]
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.auth_mechanism(mechanism).is_some()
    }
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
    use crate::types::ReplyCode;

    mod extension_parse_tests {
        use super::*;

        #[test]
        fn parse_starttls() {
            assert_eq!(Extension::parse("STARTTLS"), Extension::StartTls);
        }

        #[test]
        fn parse_starttls_lowercase() {
            assert_eq!(Extension::parse("starttls"), Extension::StartTls);
        }

        #[test]
        fn parse_auth_preserves_case() {
            assert_eq!(
                Extension::parse("AUTH PLAIN login"),
                Extension::Auth(vec!["PLAIN".into(), "login".into()])
            );
        }

        #[test]
        fn parse_auth_equals_form() {
            assert_eq!(
                Extension::parse("AUTH=LOGIN PLAIN"),
                Extension::Auth(vec!["LOGIN".into(), "PLAIN".into()])
            );
        }

        #[test]
        fn parse_size_with_value() {
            assert_eq!(Extension::parse("SIZE 52428800"), Extension::Size(52_428_800));
        }

        #[test]
        fn parse_size_without_value() {
            assert_eq!(Extension::parse("SIZE"), Extension::Size(0));
        }

        #[test]
        fn parse_size_garbage_is_unbounded() {
            assert_eq!(Extension::parse("SIZE lots"), Extension::Size(0));
        }

        #[test]
        fn parse_flags() {
            assert_eq!(Extension::parse("8BITMIME"), Extension::EightBitMime);
            assert_eq!(Extension::parse("PIPELINING"), Extension::Pipelining);
            assert_eq!(Extension::parse("SMTPUTF8"), Extension::SmtpUtf8);
            assert_eq!(
                Extension::parse("ENHANCEDSTATUSCODES"),
                Extension::EnhancedStatusCodes
            );
        }

        #[test]
        fn parse_unknown() {
            let ext = Extension::parse("SOMECUSTOMEXT");
            assert_eq!(ext, Extension::Unknown("SOMECUSTOMEXT".into()));
        }

        #[test]
        fn parse_empty() {
            assert!(matches!(Extension::parse(""), Extension::Unknown(_)));
        }
    }

    mod capabilities_tests {
        use super::*;

        fn ehlo(lines: &[&str]) -> Reply {
            Reply::new(
                ReplyCode::new(250),
                lines.iter().map(|l| (*l).to_string()).collect(),
            )
        }

        #[test]
        fn from_ehlo_full() {
            let caps = Capabilities::from_ehlo(&ehlo(&[
                "mx.example.com Hello",
                "PIPELINING",
                "SIZE 1000",
                "STARTTLS",
                "AUTH LOGIN PLAIN",
                "ENHANCEDSTATUSCODES",
                "8BITMIME",
                "X-FANCY stuff",
            ]));
            assert!(caps.pipelining);
            assert!(caps.starttls);
            assert!(caps.enhanced_status_codes);
            assert!(caps.eight_bit_mime);
            assert!(!caps.smtputf8);
            assert_eq!(caps.max_message_size, 1000);
            assert_eq!(caps.auth_mechanisms.len(), 2);
            assert!(caps.supports_auth("login"));
            assert_eq!(caps.auth_mechanism("plain"), Some("PLAIN"));
        }

        #[test]
        fn greeting_line_is_not_a_keyword() {
            let caps = Capabilities::from_ehlo(&ehlo(&["STARTTLS"]));
            assert!(!caps.starttls);
        }

        #[test]
        fn no_auth_line() {
            let caps = Capabilities::from_ehlo(&ehlo(&["mx", "SIZE 10"]));
            assert!(caps.auth_mechanisms.is_empty());
            assert!(!caps.supports_auth("PLAIN"));
        }
    }
}
