//! SMTP reply types.

/// SMTP reply from server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code (e.g., 250).
    pub code: ReplyCode,
    /// Reply message lines.
    pub message: Vec<String>,
}

impl Reply {
    /// Creates a new reply.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec is not const-compatible
    pub fn new(code: ReplyCode, message: Vec<String>) -> Self {
        Self { code, message }
    }

    /// Returns true if this is a success reply (2xx).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient_error(&self) -> bool {
        self.code.is_transient()
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code.is_permanent()
    }

    /// Returns true if the server wants more input (3xx).
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code.is_intermediate()
    }

    /// Returns true for positive completion or intermediate replies (2xx/3xx).
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code.is_success() || self.code.is_intermediate()
    }

    /// Returns the full message as a single string.
    #[must_use]
    pub fn message_text(&self) -> String {
        self.message.join("\n")
    }

    /// Returns the first message line, or an empty string.
    #[must_use]
    pub fn first_line(&self) -> &str {
        self.message.first().map_or("", String::as_str)
    }
}

/// SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// Creates a new reply code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true if this is a success code (2xx).
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }

    /// Returns true if this is an intermediate reply (3xx).
    #[must_use]
    pub const fn is_intermediate(self) -> bool {
        self.0 >= 300 && self.0 < 400
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// RFC 3463 enhanced status code (`class.subject.detail`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// 2 (success), 4 (persistent transient) or 5 (permanent).
    pub class: u8,
    /// Subject sub-code.
    pub subject: u16,
    /// Detail sub-code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Parses the leading `x.y.z` token of a reply line.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let token = line.split_whitespace().next()?;
        let mut parts = token.splitn(3, '.');
        let class: u8 = parts.next()?.parse().ok()?;
        if !matches!(class, 2 | 4 | 5) {
            return None;
        }
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        Some(Self {
            class,
            subject,
            detail,
        })
    }
}

impl std::fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
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

    mod reply_code_tests {
        use super::*;

        #[test]
        fn success_codes() {
            assert!(ReplyCode::new(250).is_success());
            assert!(ReplyCode::new(220).is_success());
            assert!(ReplyCode::new(221).is_success());
            assert!(ReplyCode::new(251).is_success());
        }

        #[test]
        fn not_success_codes() {
            assert!(!ReplyCode::new(250).is_transient());
            assert!(!ReplyCode::new(250).is_permanent());
            assert!(!ReplyCode::new(250).is_intermediate());
        }

        #[test]
        fn intermediate_codes() {
            assert!(ReplyCode::new(334).is_intermediate());
            assert!(ReplyCode::new(354).is_intermediate());
        }

        #[test]
        fn transient_errors() {
            assert!(ReplyCode::new(450).is_transient());
            assert!(ReplyCode::new(421).is_transient());
            assert!(ReplyCode::new(451).is_transient());
            assert!(ReplyCode::new(452).is_transient());
        }

        #[test]
        fn permanent_errors() {
            assert!(ReplyCode::new(550).is_permanent());
            assert!(ReplyCode::new(500).is_permanent());
            assert!(ReplyCode::new(501).is_permanent());
            assert!(ReplyCode::new(502).is_permanent());
            assert!(ReplyCode::new(503).is_permanent());
            assert!(ReplyCode::new(535).is_permanent());
        }

        #[test]
        fn as_u16() {
            assert_eq!(ReplyCode::new(250).as_u16(), 250);
            assert_eq!(ReplyCode::new(220).as_u16(), 220);
            assert_eq!(ReplyCode::new(535).as_u16(), 535);
        }

        #[test]
        fn new() {
            let code = ReplyCode::new(200);
            assert!(code.is_success());
            assert_eq!(code.as_u16(), 200);
        }

        #[test]
        fn display() {
            assert_eq!(format!("{}", ReplyCode::new(250)), "250");
            assert_eq!(format!("{}", ReplyCode::new(500)), "500");
        }

        #[test]
        fn ordering() {
            assert!(ReplyCode::new(250) < ReplyCode::new(450));
            assert!(ReplyCode::new(450) < ReplyCode::new(550));
        }
    }

    mod reply_tests {
        use super::*;

        #[test]
        fn new() {
            let reply = Reply::new(ReplyCode::new(250), vec!["OK".to_string()]);
            assert_eq!(reply.code, ReplyCode::new(250));
            assert_eq!(reply.message.len(), 1);
        }

        #[test]
        fn is_success() {
            let reply = Reply::new(ReplyCode::new(250), vec!["OK".to_string()]);
            assert!(reply.is_success());
            assert!(!reply.is_transient_error());
            assert!(!reply.is_permanent_error());
        }

        #[test]
        fn is_transient_error() {
            let reply = Reply::new(ReplyCode::new(450), vec!["Busy".to_string()]);
            assert!(!reply.is_success());
            assert!(reply.is_transient_error());
            assert!(!reply.is_permanent_error());
        }

        #[test]
        fn is_permanent_error() {
            let reply = Reply::new(
                ReplyCode::new(550),
                vec!["Not found".to_string()],
            );
            assert!(!reply.is_success());
            assert!(!reply.is_transient_error());
            assert!(reply.is_permanent_error());
        }

        #[test]
        fn message_text_single_line() {
            let reply = Reply::new(ReplyCode::new(250), vec!["Message sent".to_string()]);
            assert_eq!(reply.message_text(), "Message sent");
        }

        #[test]
        fn message_text_multiple_lines() {
            let reply = Reply::new(
                ReplyCode::new(220),
                vec![
                    "smtp.example.com ESMTP".to_string(),
                    "Ready to serve".to_string(),
                ],
            );
            assert_eq!(
                reply.message_text(),
                "smtp.example.com ESMTP\nReady to serve"
            );
        }

        #[test]
        fn message_text_empty() {
            let reply = Reply::new(ReplyCode::new(250), vec![]);
            assert_eq!(reply.message_text(), "");
            assert_eq!(reply.first_line(), "");
        }

        #[test]
        fn positive_covers_intermediate() {
            let greeting = Reply::new(ReplyCode::new(354), vec![]);
            assert!(greeting.is_positive());
            assert!(greeting.is_intermediate());
            let busy = Reply::new(ReplyCode::new(421), vec![]);
            assert!(!busy.is_positive());
        }
    }

    mod enhanced_tests {
        use super::*;

        #[test]
        fn parse_valid() {
            let code = EnhancedStatusCode::parse("2.1.0 Sender OK").unwrap();
            assert_eq!(code.class, 2);
            assert_eq!(code.subject, 1);
            assert_eq!(code.detail, 0);
            assert_eq!(code.to_string(), "2.1.0");
        }

        #[test]
        fn parse_rejects_bad_class() {
            assert_eq!(EnhancedStatusCode::parse("3.0.0 nope"), None);
        }

        #[test]
        fn parse_rejects_plain_text() {
            assert_eq!(EnhancedStatusCode::parse("OK"), None);
            assert_eq!(EnhancedStatusCode::parse("5.7"), None);
            assert_eq!(EnhancedStatusCode::parse(""), None);
        }
    }
}
