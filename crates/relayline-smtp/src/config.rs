//! Client configuration.

use std::time::Duration;

use relayline_sasl::Credentials;
use serde::Deserialize;

/// STARTTLS policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Never send STARTTLS.
    Disabled,
    /// Upgrade when the server advertises STARTTLS.
    #[default]
    Optional,
    /// Fail unless the connection ends up encrypted.
    Required,
}

/// AUTH policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginMode {
    /// Never authenticate.
    Disabled,
    /// Authenticate when possible; continue unauthenticated otherwise.
    #[default]
    None,
    /// Fail unless authentication succeeds.
    Required,
}

/// Handling of line feeds without a preceding carriage return in the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BareLfPolicy {
    /// Emit every body line with CRLF.
    #[default]
    Normalize,
    /// Fail the transaction before any I/O.
    Reject,
}

/// Default SASL trial order after the remembered mechanism.
pub const DEFAULT_AUTH_PREFERENCE: &[&str] = &[
    "XOAUTH2",
    "LOGIN",
    "PLAIN",
    "CRAM-SHA256",
    "CRAM-SHA1",
    "CRAM-MD5",
    "OAUTHBEARER",
];

/// SMTP client and pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server hostname.
    pub host: String,
    /// Server port. `None` follows the TLS settings, see [`Config::port()`].
    pub port: Option<u16>,
    /// TLS from the first byte (port 465).
    pub implicit_tls: bool,
    /// STARTTLS policy.
    pub starttls: TlsMode,
    /// AUTH policy.
    pub login: LoginMode,
    /// Username and password (or access token).
    pub credentials: Option<Credentials>,
    /// Mechanisms the client is willing to use; `None` allows every supported one.
    pub auth_methods: Option<Vec<String>>,
    /// Order in which mechanisms are tried.
    pub auth_preference: Vec<String>,
    /// Maximum number of open connections.
    pub max_pool_size: usize,
    /// Idle connections older than this are closed instead of reused.
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
    /// Deliver to the accepted recipients when some `RCPT TO` fail.
    pub allow_partial_recipients: bool,
    /// Return connections to the pool after a transaction.
    pub keep_alive: bool,
    /// Use PIPELINING when the server advertises it.
    pub pipelining: bool,
    /// Always greet with HELO.
    pub disable_esmtp: bool,
    /// Name sent in EHLO/HELO.
    pub client_hostname: String,
    /// Close a connection after this many transactions.
    pub max_mails_per_connection: Option<u32>,
    /// Bare line feed handling.
    pub bare_lf: BareLfPolicy,
    /// TCP connect timeout.
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            implicit_tls: false,
            starttls: TlsMode::Optional,
            login: LoginMode::None,
            credentials: None,
            auth_methods: None,
            auth_preference: DEFAULT_AUTH_PREFERENCE
                .iter()
                .map(|m| (*m).to_string())
                .collect(),
            max_pool_size: 10,
            idle_timeout: Duration::from_secs(300),
            allow_partial_recipients: false,
            keep_alive: true,
            pipelining: true,
            disable_esmtp: false,
            client_hostname: "localhost".to_string(),
            max_mails_per_connection: None,
            bare_lf: BareLfPolicy::Normalize,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Creates a configuration for `host` with all defaults.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(host)
    }

    /// Returns the port to connect to: the explicit one, else 465 with
    /// implicit TLS, 587 when STARTTLS is required, and 25 otherwise.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.implicit_tls {
            465
        } else if matches!(self.starttls, TlsMode::Required) {
            587
        } else {
            25
        })
    }

    /// Returns true if `mechanism` passes the client allow-list.
    #[must_use]
    pub fn allows_mechanism(&self, mechanism: &str) -> bool {
        self.auth_methods.as_ref().map_or_else(
            || relayline_sasl::is_supported(mechanism),
            |allowed| {
                relayline_sasl::is_supported(mechanism)
                    && allowed.iter().any(|m| m.eq_ignore_ascii_case(mechanism))
            },
        )
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new builder with the given hostname.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            config: Config::new(host),
        }
    }

    /// Sets the port. Without it the port follows the TLS settings.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    /// Enables TLS from the first byte.
    #[must_use]
    pub const fn implicit_tls(mut self, enabled: bool) -> Self {
        self.config.implicit_tls = enabled;
        self
    }

    /// Sets the STARTTLS policy.
    #[must_use]
    pub const fn starttls(mut self, mode: TlsMode) -> Self {
        self.config.starttls = mode;
        self
    }

    /// Sets the AUTH policy.
    #[must_use]
    pub const fn login(mut self, mode: LoginMode) -> Self {
        self.config.login = mode;
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some(Credentials::new(username, password));
        self
    }

    /// Restricts the mechanisms the client will use.
    #[must_use]
    pub fn auth_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.auth_methods = Some(methods.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the mechanism trial order.
    #[must_use]
    pub fn auth_preference<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.auth_preference = order.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the maximum number of open connections.
    #[must_use]
    pub const fn max_pool_size(mut self, size: usize) -> Self {
        self.config.max_pool_size = size;
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Allows delivery when only some recipients are accepted.
    #[must_use]
    pub const fn allow_partial_recipients(mut self, allow: bool) -> Self {
        self.config.allow_partial_recipients = allow;
        self
    }

    /// Enables or disables connection reuse.
    #[must_use]
    pub const fn keep_alive(mut self, enabled: bool) -> Self {
        self.config.keep_alive = enabled;
        self
    }

    /// Enables or disables PIPELINING.
    #[must_use]
    pub const fn pipelining(mut self, enabled: bool) -> Self {
        self.config.pipelining = enabled;
        self
    }

    /// Forces HELO instead of EHLO.
    #[must_use]
    pub const fn disable_esmtp(mut self, disabled: bool) -> Self {
        self.config.disable_esmtp = disabled;
        self
    }

    /// Sets the name sent in EHLO/HELO.
    #[must_use]
    pub fn client_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.client_hostname = hostname.into();
        self
    }

    /// Closes connections after `count` transactions.
    #[must_use]
    pub const fn max_mails_per_connection(mut self, count: u32) -> Self {
        self.config.max_mails_per_connection = Some(count);
        self
    }

    /// Sets the bare line feed policy.
    #[must_use]
    pub const fn bare_lf(mut self, policy: BareLfPolicy) -> Self {
        self.config.bare_lf = policy;
        self
    }

    /// Sets the TCP connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        self.config
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
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

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, None);
        assert_eq!(config.port(), 25);
        assert_eq!(config.starttls, TlsMode::Optional);
        assert_eq!(config.login, LoginMode::None);
        assert_eq!(config.max_pool_size, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert!(config.keep_alive);
        assert!(config.pipelining);
        assert!(!config.allow_partial_recipients);
        assert_eq!(config.bare_lf, BareLfPolicy::Normalize);
        assert_eq!(config.auth_preference[0], "XOAUTH2");
    }

    #[test]
    fn test_builder_default_ports() {
        assert_eq!(Config::builder("mx").build().port(), 25);
        assert_eq!(Config::builder("mx").implicit_tls(true).build().port(), 465);
        assert_eq!(
            Config::builder("mx").starttls(TlsMode::Required).build().port(),
            587
        );
        assert_eq!(
            Config::builder("mx").implicit_tls(true).port(2465).build().port(),
            2465
        );
    }

    #[test]
    fn test_builder_chain() {
        let config = Config::builder("smtp.example.com")
            .login(LoginMode::Required)
            .credentials("user", "pass")
            .auth_methods(["plain", "LOGIN"])
            .max_pool_size(2)
            .max_mails_per_connection(5)
            .build();
        assert_eq!(config.host, "smtp.example.com");
        assert_eq!(config.login, LoginMode::Required);
        assert_eq!(config.credentials.unwrap().username, "user");
        assert_eq!(config.max_pool_size, 2);
        assert_eq!(config.max_mails_per_connection, Some(5));
    }

    #[test]
    fn test_allows_mechanism() {
        let open = Config::default();
        assert!(open.allows_mechanism("cram-md5"));
        assert!(!open.allows_mechanism("GSSAPI"));

        let restricted = Config::builder("mx").auth_methods(["plain"]).build();
        assert!(restricted.allows_mechanism("PLAIN"));
        assert!(!restricted.allows_mechanism("LOGIN"));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: Config = serde_json::from_str(
            r#"{"host":"mx.example.com","starttls":"required","idle_timeout":60,
                "credentials":{"username":"u","password":"p"}}"#,
        )
        .unwrap();
        assert_eq!(config.host, "mx.example.com");
        assert_eq!(config.starttls, TlsMode::Required);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.max_pool_size, 10);
        assert!(config.credentials.is_some());
        assert_eq!(config.port(), 587);
    }

    #[test]
    fn test_deserialize_derives_port_from_tls() {
        let implicit: Config =
            serde_json::from_str(r#"{"host":"mx.example.com","implicit_tls":true}"#).unwrap();
        assert_eq!(implicit.port(), 465);

        let submission: Config =
            serde_json::from_str(r#"{"host":"mx.example.com","starttls":"required"}"#).unwrap();
        assert_eq!(submission.port(), 587);

        let plain: Config = serde_json::from_str(r#"{"host":"mx.example.com"}"#).unwrap();
        assert_eq!(plain.port(), 25);
    }

    #[test]
    fn test_deserialize_explicit_port_wins() {
        let config: Config =
            serde_json::from_str(r#"{"host":"mx.example.com","implicit_tls":true,"port":2465}"#)
                .unwrap();
        assert_eq!(config.port, Some(2465));
        assert_eq!(config.port(), 2465);
    }
}
