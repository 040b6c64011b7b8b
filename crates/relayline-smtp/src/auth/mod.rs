//! AUTH negotiation: picks candidate mechanisms and falls back among them.

use relayline_sasl::{Credentials, Mechanism, crypt};

use crate::command::Command;
use crate::config::{Config, LoginMode};
use crate::connection::{Connection, Transport};
use crate::error::{Error, Result, SmtpError};
use crate::types::{Capabilities, Reply};

/// Result of running the mechanism chain.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Nothing was attempted (login disabled, or optional with nothing to try).
    Skipped,
    /// The named mechanism succeeded.
    Authenticated(String),
    /// Every candidate was rejected; carries the last failure.
    Failed(Error),
}

/// Outcome of one mechanism's exchange.
enum Attempt {
    Accepted,
    Rejected(Error),
}

/// Mechanisms that are both advertised and allowed, in trial order.
///
/// `preferred` goes first when it is still a candidate; the rest follow
/// `config.auth_preference`, then any candidate the preference list leaves
/// out.
#[must_use]
pub fn candidates(capabilities: &Capabilities, config: &Config, preferred: Option<&str>) -> Vec<String> {
    let mut available: Vec<String> = capabilities
        .auth_mechanisms
        .iter()
        .filter(|m| config.allows_mechanism(m))
        .map(|m| m.to_ascii_uppercase())
        .collect();
    available.sort();
    available.dedup();

    let mut ordered = Vec::with_capacity(available.len());
    let mut take = |name: &str, ordered: &mut Vec<String>| {
        if let Some(pos) = available.iter().position(|m| m.eq_ignore_ascii_case(name)) {
            ordered.push(available.remove(pos));
        }
    };

    if let Some(preferred) = preferred {
        take(preferred, &mut ordered);
    }
    for name in &config.auth_preference {
        take(name, &mut ordered);
    }
    ordered.append(&mut available);
    ordered
}

/// Runs the mechanism chain on an established connection.
///
/// # Errors
///
/// Returns [`Error::NoAuthMechanism`] or [`Error::NoCredentials`] when login
/// is required but impossible, and transport errors from the exchange.
/// Rejections by the server are reported as [`AuthOutcome::Failed`].
pub async fn authenticate<S: Transport>(
    conn: &mut Connection<S>,
    config: &Config,
    preferred: Option<&str>,
) -> Result<AuthOutcome> {
    if config.login == LoginMode::Disabled {
        return Ok(AuthOutcome::Skipped);
    }

    let required = config.login == LoginMode::Required;
    let trial = candidates(conn.capabilities(), config, preferred);
    if trial.is_empty() {
        return if required {
            Err(Error::NoAuthMechanism)
        } else {
            Ok(AuthOutcome::Skipped)
        };
    }
    let Some(credentials) = config.credentials.as_ref() else {
        return if required {
            Err(Error::NoCredentials)
        } else {
            Ok(AuthOutcome::Skipped)
        };
    };

    let mut last_error = Error::NoAuthMechanism;
    for name in trial {
        tracing::debug!(connection = conn.id(), mechanism = %name, "trying AUTH mechanism");
        match run_mechanism(conn, &name, credentials).await? {
            Attempt::Accepted => {
                tracing::debug!(connection = conn.id(), mechanism = %name, "authenticated");
                return Ok(AuthOutcome::Authenticated(name));
            }
            Attempt::Rejected(err) => {
                tracing::debug!(connection = conn.id(), mechanism = %name, error = %err, "AUTH mechanism rejected");
                last_error = err;
            }
        }
    }

    Ok(AuthOutcome::Failed(last_error))
}

async fn run_mechanism<S: Transport>(
    conn: &mut Connection<S>,
    name: &str,
    credentials: &Credentials,
) -> Result<Attempt> {
    let mut mechanism = relayline_sasl::mechanism(name, credentials)?;
    let initial = mechanism.next_step(None)?;
    let initial_response = initial.filter(|r| !r.is_empty()).map(|r| crypt::encode(&r));

    let mut reply = conn
        .write(&Command::Auth {
            mechanism: mechanism.name().to_string(),
            initial_response,
        })
        .await?;

    loop {
        if reply.is_success() {
            return Ok(Attempt::Accepted);
        }
        if !reply.is_intermediate() {
            return Ok(Attempt::Rejected(rejection(conn, &reply)));
        }

        let step = crypt::decode(reply.first_line())
            .and_then(|challenge| mechanism.next_step(Some(&challenge)));
        match step {
            Ok(Some(response)) => {
                reply = conn
                    .write(&Command::AuthResponse(crypt::encode(&response)))
                    .await?;
            }
            Ok(None) => {
                let cancelled = conn.write(&Command::AuthCancel).await?;
                return Ok(Attempt::Rejected(rejection(conn, &cancelled)));
            }
            Err(err) => {
                conn.write(&Command::AuthCancel).await?;
                return Ok(Attempt::Rejected(err.into()));
            }
        }
    }
}

fn rejection<S: Transport>(conn: &Connection<S>, reply: &Reply) -> Error {
    SmtpError::from_reply("AUTH", reply, conn.capabilities().enhanced_status_codes).into()
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
    use tokio_test::io::Builder;

    fn caps(mechanisms: &[&str]) -> Capabilities {
        Capabilities {
            auth_mechanisms: mechanisms.iter().map(|m| (*m).to_string()).collect(),
            ..Capabilities::default()
        }
    }

    fn config(login: LoginMode) -> Config {
        Config::builder("mx")
            .login(login)
            .credentials("user", "pass")
            .build()
    }

    #[test]
    fn test_candidates_follow_preference() {
        let order = candidates(&caps(&["PLAIN", "LOGIN", "CRAM-MD5"]), &Config::default(), None);
        assert_eq!(order, vec!["LOGIN", "PLAIN", "CRAM-MD5"]);
    }

    #[test]
    fn test_candidates_preferred_first() {
        let order = candidates(
            &caps(&["PLAIN", "LOGIN"]),
            &Config::default(),
            Some("PLAIN"),
        );
        assert_eq!(order, vec!["PLAIN", "LOGIN"]);
    }

    #[test]
    fn test_candidates_preferred_not_advertised() {
        let order = candidates(&caps(&["LOGIN"]), &Config::default(), Some("XOAUTH2"));
        assert_eq!(order, vec!["LOGIN"]);
    }

    #[test]
    fn test_candidates_allow_list_and_unknown() {
        let config = Config::builder("mx").auth_methods(["plain"]).build();
        let order = candidates(&caps(&["login", "plain", "GSSAPI"]), &config, None);
        assert_eq!(order, vec!["PLAIN"]);
    }

    #[test]
    fn test_candidates_outside_preference_list_go_last() {
        let config = Config::builder("mx").auth_preference(["PLAIN"]).build();
        let order = candidates(&caps(&["CRAM-MD5", "PLAIN"]), &config, None);
        assert_eq!(order, vec!["PLAIN", "CRAM-MD5"]);
    }

    #[tokio::test]
    async fn test_disabled_skips() {
        let mut conn = Connection::new(1, Builder::new().build());
        conn.set_capabilities(caps(&["PLAIN"]));
        let outcome = authenticate(&mut conn, &config(LoginMode::Disabled), None)
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_required_without_mechanism() {
        let mut conn = Connection::new(1, Builder::new().build());
        let err = authenticate(&mut conn, &config(LoginMode::Required), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAuthMechanism));
    }

    #[tokio::test]
    async fn test_required_without_credentials() {
        let mut conn = Connection::new(1, Builder::new().build());
        conn.set_capabilities(caps(&["PLAIN"]));
        let config = Config::builder("mx").login(LoginMode::Required).build();
        let err = authenticate(&mut conn, &config, None).await.unwrap_err();
        assert!(matches!(err, Error::NoCredentials));
    }

    #[tokio::test]
    async fn test_optional_without_credentials_skips() {
        let mut conn = Connection::new(1, Builder::new().build());
        conn.set_capabilities(caps(&["PLAIN"]));
        let outcome = authenticate(&mut conn, &Config::default(), None)
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_login_exchange() {
        let mock = Builder::new()
            .write(b"AUTH LOGIN\r\n")
            .read(b"334 VXNlcm5hbWU6\r\n")
            .write(b"dXNlcg==\r\n")
            .read(b"334 UGFzc3dvcmQ6\r\n")
            .write(b"cGFzcw==\r\n")
            .read(b"235 2.7.0 Authentication successful\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        conn.set_capabilities(caps(&["LOGIN"]));
        let outcome = authenticate(&mut conn, &config(LoginMode::Required), None)
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Authenticated(ref m) if m == "LOGIN"));
    }

    #[tokio::test]
    async fn test_fallback_to_next_mechanism() {
        let mock = Builder::new()
            .write(b"AUTH LOGIN\r\n")
            .read(b"535 5.7.8 nope\r\n")
            .write(b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n")
            .read(b"235 ok\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        conn.set_capabilities(caps(&["LOGIN", "PLAIN"]));
        let outcome = authenticate(&mut conn, &config(LoginMode::Required), None)
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Authenticated(ref m) if m == "PLAIN"));
    }

    #[tokio::test]
    async fn test_all_rejected() {
        let mock = Builder::new()
            .write(b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n")
            .read(b"535 bad\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        conn.set_capabilities(caps(&["PLAIN"]));
        let outcome = authenticate(&mut conn, &config(LoginMode::Required), None)
            .await
            .unwrap();
        match outcome {
            AuthOutcome::Failed(err) => assert_eq!(err.reply_code(), Some(535)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_on_extra_challenge() {
        let mock = Builder::new()
            .write(b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n")
            .read(b"334 \r\n")
            .write(b"*\r\n")
            .read(b"501 cancelled\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        conn.set_capabilities(caps(&["PLAIN"]));
        let outcome = authenticate(&mut conn, &config(LoginMode::None), None)
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_cancel_on_bad_base64() {
        let mock = Builder::new()
            .write(b"AUTH CRAM-MD5\r\n")
            .read(b"334 !!!\r\n")
            .write(b"*\r\n")
            .read(b"501 cancelled\r\n")
            .build();
        let mut conn = Connection::new(1, mock);
        conn.set_capabilities(caps(&["CRAM-MD5"]));
        let outcome = authenticate(&mut conn, &config(LoginMode::None), None)
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Failed(Error::Sasl(_))));
    }
}
