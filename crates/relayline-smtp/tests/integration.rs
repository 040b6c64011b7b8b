//! Integration tests for the pool and session engine.
//!
//! Every connection talks to a scripted in-process server over
//! `tokio::io::duplex`, so no network access is needed.

#![allow(clippy::unwrap_used, clippy::similar_names)]

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadBuf,
};

use relayline_smtp::{
    BareLfPolicy, Config, Connector, Error, LoginMode, Pool, Transaction, Transport,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// One step of a server script.
#[derive(Debug, Clone, Copy)]
enum Step {
    /// Write a reply; CRLF is appended.
    Reply(&'static str),
    /// Read one command line; hang up if it differs.
    Expect(&'static str),
    /// Read message lines up to the lone dot.
    Body,
}

const GREETING: Step = Step::Reply("220 mx.example.com ESMTP ready");
const EHLO: Step = Step::Expect("EHLO localhost");

/// Client half of a duplex pipe.
struct TestStream {
    inner: DuplexStream,
    encrypted: bool,
}

impl AsyncRead for TestStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TestStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Transport for TestStream {
    fn is_encrypted(&self) -> bool {
        self.encrypted
    }
}

#[derive(Default)]
struct ServerState {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    received: Mutex<Vec<String>>,
    bodies: Mutex<Vec<Vec<String>>>,
    connects: AtomicUsize,
    shutdowns: AtomicUsize,
}

/// Hands out one scripted server per connection; an empty script refuses
/// the connection.
#[derive(Clone, Default)]
struct ScriptedConnector {
    state: Arc<ServerState>,
}

impl ScriptedConnector {
    fn new(scripts: Vec<Vec<Step>>) -> Self {
        let connector = Self::default();
        connector.state.scripts.lock().unwrap().extend(scripts);
        connector
    }

    fn received(&self) -> Vec<String> {
        self.state.received.lock().unwrap().clone()
    }

    fn bodies(&self) -> Vec<Vec<String>> {
        self.state.bodies.lock().unwrap().clone()
    }

    fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    fn shutdowns(&self) -> usize {
        self.state.shutdowns.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    type Stream = TestStream;

    async fn connect(&self) -> relayline_smtp::Result<TestStream> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.state.scripts.lock().unwrap().pop_front().unwrap_or_default();
        if script.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(server, script, Arc::clone(&self.state)));
        Ok(TestStream {
            inner: client,
            encrypted: false,
        })
    }

    async fn upgrade_to_tls(&self, mut stream: TestStream) -> relayline_smtp::Result<TestStream> {
        stream.encrypted = true;
        Ok(stream)
    }

    fn shutdown(&self) {
        self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

async fn read_line(stream: &mut BufReader<DuplexStream>) -> Option<String> {
    let mut line = String::new();
    match stream.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

async fn serve(stream: DuplexStream, script: Vec<Step>, state: Arc<ServerState>) {
    let mut stream = BufReader::new(stream);
    for step in script {
        match step {
            Step::Reply(text) => {
                let reply = format!("{text}\r\n");
                if stream.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
            Step::Expect(expected) => {
                let Some(line) = read_line(&mut stream).await else {
                    return;
                };
                state.received.lock().unwrap().push(line.clone());
                if line != expected {
                    return;
                }
            }
            Step::Body => {
                let mut body = Vec::new();
                loop {
                    let Some(line) = read_line(&mut stream).await else {
                        return;
                    };
                    if line == "." {
                        break;
                    }
                    body.push(line);
                }
                state.bodies.lock().unwrap().push(body);
            }
        }
    }

    // Past the script: acknowledge QUIT, refuse anything else.
    while let Some(line) = read_line(&mut stream).await {
        state.received.lock().unwrap().push(line.clone());
        let quit = line == "QUIT";
        let reply: &[u8] = if quit {
            b"221 2.0.0 bye\r\n"
        } else {
            b"502 5.5.1 unexpected command\r\n"
        };
        if stream.write_all(reply).await.is_err() || quit {
            return;
        }
    }
}

/// Envelope and body exchange for one accepted message.
fn transaction_steps() -> Vec<Step> {
    vec![
        Step::Expect("MAIL FROM:<sender@example.com>"),
        Step::Reply("250 2.1.0 ok"),
        Step::Expect("RCPT TO:<rcpt@example.com>"),
        Step::Reply("250 2.1.5 ok"),
        Step::Expect("DATA"),
        Step::Reply("354 go ahead"),
        Step::Body,
        Step::Reply("250 2.0.0 queued"),
    ]
}

fn plain_session(extra: Vec<Step>) -> Vec<Step> {
    let mut script = vec![GREETING, EHLO, Step::Reply("250 mx.example.com")];
    script.extend(extra);
    script
}

fn message() -> Transaction {
    Transaction::builder()
        .from("sender@example.com")
        .to("rcpt@example.com")
        .message("Subject: hi\r\n\r\nbody\r\n")
        .build()
        .unwrap()
}

/// Routes engine logs to the test harness; set `RUST_LOG` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> relayline_smtp::ConfigBuilder {
    init_tracing();
    Config::builder("mx.example.com")
}

async fn with_timeout<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, future).await.unwrap()
}

#[tokio::test]
async fn test_required_login_without_auth_extension() {
    let connector = ScriptedConnector::new(vec![vec![
        GREETING,
        EHLO,
        Step::Reply("250-mx.example.com\r\n250 SIZE 1000000"),
    ]]);
    let config = config()
        .login(LoginMode::Required)
        .credentials("user", "pass")
        .build();
    let pool = Pool::new(config, connector.clone());

    let err = with_timeout(pool.send(&message())).await.unwrap_err();
    assert!(matches!(err, Error::NoAuthMechanism));
    assert_eq!(connector.received(), vec!["EHLO localhost", "QUIT"]);
    assert!(connector.bodies().is_empty());
    assert_eq!(pool.connection_count(), 0);
}

#[tokio::test]
async fn test_auth_falls_through_and_remembers_mechanism() {
    let ehlo_reply = Step::Reply("250-mx.example.com\r\n250 AUTH LOGIN PLAIN");
    let mut first = vec![
        GREETING,
        EHLO,
        ehlo_reply,
        Step::Expect("AUTH LOGIN"),
        Step::Reply("334 VXNlcm5hbWU6"),
        Step::Expect("dXNlcg=="),
        Step::Reply("334 UGFzc3dvcmQ6"),
        Step::Expect("cGFzcw=="),
        Step::Reply("535 5.7.8 authentication failed"),
        Step::Expect("AUTH PLAIN AHVzZXIAcGFzcw=="),
        Step::Reply("235 2.7.0 accepted"),
    ];
    first.extend(transaction_steps());
    let mut second = vec![
        GREETING,
        EHLO,
        ehlo_reply,
        Step::Expect("AUTH PLAIN AHVzZXIAcGFzcw=="),
        Step::Reply("235 2.7.0 accepted"),
    ];
    second.extend(transaction_steps());

    let connector = ScriptedConnector::new(vec![first, second]);
    let config = config()
        .login(LoginMode::Required)
        .credentials("user", "pass")
        .keep_alive(false)
        .build();
    let pool = Pool::new(config, connector.clone());

    with_timeout(pool.send(&message())).await.unwrap();
    assert_eq!(pool.preferred_mechanism().as_deref(), Some("PLAIN"));

    with_timeout(pool.send(&message())).await.unwrap();
    assert_eq!(connector.connects(), 2);
    let login_attempts = connector
        .received()
        .iter()
        .filter(|line| *line == "AUTH LOGIN")
        .count();
    assert_eq!(login_attempts, 1);
    assert_eq!(connector.bodies().len(), 2);
}

#[tokio::test]
async fn test_partial_recipient_rejection() {
    let connector = ScriptedConnector::new(vec![plain_session(vec![
        Step::Expect("MAIL FROM:<sender@example.com>"),
        Step::Reply("250 2.1.0 ok"),
        Step::Expect("RCPT TO:<good@example.com>"),
        Step::Reply("250 2.1.5 ok"),
        Step::Expect("RCPT TO:<bad@example.com>"),
        Step::Reply("550 5.1.1 no such user"),
        Step::Expect("DATA"),
        Step::Reply("354 go ahead"),
        Step::Body,
        Step::Reply("250 2.0.0 queued"),
    ])]);
    let pool = Pool::new(
        config().allow_partial_recipients(true).build(),
        connector.clone(),
    );

    let tx = Transaction::builder()
        .from("sender@example.com")
        .to("good@example.com")
        .to("bad@example.com")
        .message("Subject: hi\r\n\r\nbody\r\n")
        .message_id("<1@example.com>")
        .build()
        .unwrap();
    let result = with_timeout(pool.send(&tx)).await.unwrap();

    let accepted: Vec<_> = result
        .accepted_recipients
        .iter()
        .map(|a| a.as_str())
        .collect();
    assert_eq!(accepted, vec!["good@example.com"]);
    assert_eq!(result.message_id.as_deref(), Some("<1@example.com>"));
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn test_rejected_recipient_discards_connection() {
    let connector = ScriptedConnector::new(vec![plain_session(vec![
        Step::Expect("MAIL FROM:<sender@example.com>"),
        Step::Reply("250 2.1.0 ok"),
        Step::Expect("RCPT TO:<rcpt@example.com>"),
        Step::Reply("550 5.1.1 no such user"),
    ])]);
    let pool = Pool::new(config().build(), connector.clone());

    let err = with_timeout(pool.send(&message())).await.unwrap_err();
    assert!(err.is_permanent());
    assert_eq!(err.reply_code(), Some(550));
    assert_eq!(pool.connection_count(), 0);
    assert!(connector.bodies().is_empty());
}

#[tokio::test]
async fn test_pipelined_envelope() {
    let connector = ScriptedConnector::new(vec![vec![
        GREETING,
        EHLO,
        Step::Reply("250-mx.example.com\r\n250-PIPELINING\r\n250 SIZE 10485760"),
        Step::Expect("MAIL FROM:<sender@example.com> SIZE=21"),
        Step::Expect("RCPT TO:<rcpt@example.com>"),
        Step::Expect("DATA"),
        Step::Reply("250 2.1.0 ok\r\n250 2.1.5 ok\r\n354 go ahead"),
        Step::Body,
        Step::Reply("250 2.0.0 queued"),
    ]]);
    let pool = Pool::new(config().build(), connector.clone());

    let result = with_timeout(pool.send(&message())).await.unwrap();
    assert_eq!(result.accepted_recipients.len(), 1);
    assert_eq!(connector.bodies(), vec![vec!["Subject: hi", "", "body"]]);
}

#[tokio::test]
async fn test_transient_ehlo_failure_falls_back_to_helo() {
    let mut script = vec![
        GREETING,
        EHLO,
        Step::Reply("402 4.3.0 try again later"),
        Step::Expect("HELO localhost"),
        Step::Reply("250 mx.example.com"),
    ];
    script.extend(transaction_steps());
    let connector = ScriptedConnector::new(vec![script]);
    let pool = Pool::new(
        config().credentials("user", "pass").build(),
        connector.clone(),
    );

    with_timeout(pool.send(&message())).await.unwrap();
    assert!(!connector.received().iter().any(|line| line.starts_with("AUTH")));
    assert_eq!(connector.bodies().len(), 1);
}

#[tokio::test]
async fn test_body_is_dot_stuffed_and_normalized() {
    let connector = ScriptedConnector::new(vec![plain_session(transaction_steps())]);
    let pool = Pool::new(config().build(), connector.clone());

    let tx = Transaction::builder()
        .from("sender@example.com")
        .to("rcpt@example.com")
        .message("line one\n.hidden\r\n..\n")
        .build()
        .unwrap();
    with_timeout(pool.send(&tx)).await.unwrap();

    assert_eq!(
        connector.bodies(),
        vec![vec!["line one", "..hidden", "..."]]
    );
}

#[tokio::test]
async fn test_bare_lf_rejected_before_connecting() {
    let connector = ScriptedConnector::new(vec![]);
    let pool = Pool::new(
        config().bare_lf(BareLfPolicy::Reject).build(),
        connector.clone(),
    );

    let tx = Transaction::builder()
        .from("sender@example.com")
        .to("rcpt@example.com")
        .message("a\nb\n")
        .build()
        .unwrap();
    let err = with_timeout(pool.send(&tx)).await.unwrap_err();
    assert!(matches!(err, Error::BareLineFeed));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn test_oversized_message_keeps_connection() {
    let connector = ScriptedConnector::new(vec![vec![
        GREETING,
        EHLO,
        Step::Reply("250-mx.example.com\r\n250 SIZE 10"),
    ]]);
    let pool = Pool::new(config().build(), connector.clone());

    let err = with_timeout(pool.send(&message())).await.unwrap_err();
    assert!(matches!(err, Error::MessageTooLarge { size: 21, limit: 10 }));
    assert_eq!(connector.received(), vec!["EHLO localhost"]);
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn test_idle_connection_revalidated_with_rset() {
    let mut steps = transaction_steps();
    steps.push(Step::Expect("RSET"));
    steps.push(Step::Reply("250 2.0.0 reset"));
    steps.extend(transaction_steps());
    let connector = ScriptedConnector::new(vec![plain_session(steps)]);
    let pool = Pool::new(config().build(), connector.clone());

    with_timeout(pool.send(&message())).await.unwrap();
    with_timeout(pool.send(&message())).await.unwrap();

    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.bodies().len(), 2);
    assert_eq!(pool.connection_count(), 1);
}

#[tokio::test]
async fn test_failed_rset_replaces_connection() {
    let mut stale = transaction_steps();
    stale.push(Step::Expect("RSET"));
    stale.push(Step::Reply("421 4.4.2 idle too long"));
    let connector = ScriptedConnector::new(vec![
        plain_session(stale),
        plain_session(transaction_steps()),
    ]);
    let pool = Pool::new(config().max_pool_size(1).build(), connector.clone());

    with_timeout(pool.send(&message())).await.unwrap();
    with_timeout(pool.send(&message())).await.unwrap();

    assert_eq!(connector.connects(), 2);
    assert_eq!(pool.connection_count(), 1);
}

#[tokio::test]
async fn test_failed_establishment_frees_capacity() {
    let connector = ScriptedConnector::new(vec![
        vec![],
        vec![Step::Reply("554 5.3.2 not accepting mail")],
        plain_session(vec![]),
    ]);
    let pool = Pool::new(config().max_pool_size(1).build(), connector.clone());

    let err = with_timeout(pool.acquire()).await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(pool.connection_count(), 0);

    let err = with_timeout(pool.acquire()).await.unwrap_err();
    assert_eq!(err.reply_code(), Some(554));
    assert_eq!(pool.connection_count(), 0);

    let conn = with_timeout(pool.acquire()).await.unwrap();
    assert_eq!(pool.connection_count(), 1);
    conn.release().await;
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(connector.connects(), 3);
}

#[tokio::test]
async fn test_waiters_served_in_order() {
    let connector = ScriptedConnector::new(vec![plain_session(vec![])]);
    let pool = Pool::new(config().max_pool_size(1).build(), connector.clone());
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = with_timeout(pool.acquire()).await.unwrap();

    let mut tasks = Vec::new();
    for name in ["first", "second"] {
        let pool = pool.clone();
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            order.lock().unwrap().push(name);
            conn.release().await;
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    held.release().await;
    for task in tasks {
        with_timeout(task).await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(connector.connects(), 1);
    assert!(!connector.received().iter().any(|line| line == "RSET"));
}

#[tokio::test]
async fn test_dropped_connection_frees_slot_for_waiter() {
    let connector = ScriptedConnector::new(vec![plain_session(vec![]), plain_session(vec![])]);
    let pool = Pool::new(config().max_pool_size(1).build(), connector.clone());

    let held = with_timeout(pool.acquire()).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let first_id = held.id();
    drop(held);

    let replacement = with_timeout(waiter).await.unwrap().unwrap();
    assert_ne!(replacement.id(), first_id);
    assert_eq!(connector.connects(), 2);
    assert_eq!(pool.connection_count(), 1);

    replacement.release().await;
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn test_mail_limit_closes_connection() {
    let connector = ScriptedConnector::new(vec![plain_session(transaction_steps())]);
    let pool = Pool::new(
        config().max_mails_per_connection(1).build(),
        connector.clone(),
    );

    with_timeout(pool.send(&message())).await.unwrap();
    assert_eq!(pool.connection_count(), 0);
    assert_eq!(connector.received().last().map(String::as_str), Some("QUIT"));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let connector = ScriptedConnector::new(vec![plain_session(transaction_steps())]);
    let pool = Pool::new(config().build(), connector.clone());

    with_timeout(pool.send(&message())).await.unwrap();
    assert_eq!(pool.idle_count(), 1);

    with_timeout(pool.stop()).await;
    with_timeout(pool.stop()).await;
    with_timeout(pool.closed()).await;

    assert!(pool.is_stopped());
    assert_eq!(pool.connection_count(), 0);
    assert_eq!(connector.shutdowns(), 1);
    assert_eq!(connector.received().last().map(String::as_str), Some("QUIT"));

    let err = with_timeout(pool.acquire()).await.unwrap_err();
    assert!(matches!(err, Error::PoolStopped));
}

#[tokio::test]
async fn test_stop_rejects_waiters_and_drains_active() {
    let connector = ScriptedConnector::new(vec![plain_session(vec![])]);
    let pool = Pool::new(config().max_pool_size(1).build(), connector.clone());

    let held = with_timeout(pool.acquire()).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|conn| conn.id()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    with_timeout(pool.stop()).await;
    let err = with_timeout(waiter).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::PoolStopped));
    assert_eq!(connector.shutdowns(), 0);

    held.release().await;
    with_timeout(pool.closed()).await;
    assert_eq!(connector.shutdowns(), 1);
    assert_eq!(pool.connection_count(), 0);
}

#[tokio::test]
async fn test_pipelined_no_accepted_recipients_sends_lone_dot() {
    let connector = ScriptedConnector::new(vec![
        vec![
            GREETING,
            EHLO,
            Step::Reply("250-mx.example.com\r\n250 PIPELINING"),
            Step::Expect("MAIL FROM:<sender@example.com>"),
            Step::Expect("RCPT TO:<rcpt@example.com>"),
            Step::Expect("DATA"),
            Step::Reply("250 2.1.0 ok\r\n550 5.1.1 no such user\r\n354 go ahead"),
            Step::Body,
            Step::Reply("554 5.5.1 no valid recipients"),
        ],
        plain_session(transaction_steps()),
    ]);
    let pool = Pool::new(
        config().allow_partial_recipients(true).build(),
        connector.clone(),
    );

    let err = with_timeout(pool.send(&message())).await.unwrap_err();
    assert!(matches!(err, Error::NoRecipientsAccepted));
    assert_eq!(connector.bodies(), vec![Vec::<String>::new()]);
    assert_eq!(
        connector.received(),
        vec![
            "EHLO localhost",
            "MAIL FROM:<sender@example.com>",
            "RCPT TO:<rcpt@example.com>",
            "DATA",
            "QUIT",
        ]
    );
    assert_eq!(pool.connection_count(), 0);

    with_timeout(pool.send(&message())).await.unwrap();
    assert_eq!(connector.connects(), 2);
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn test_sequential_no_accepted_recipients_skips_data() {
    let connector = ScriptedConnector::new(vec![
        plain_session(vec![
            Step::Expect("MAIL FROM:<sender@example.com>"),
            Step::Reply("250 2.1.0 ok"),
            Step::Expect("RCPT TO:<rcpt@example.com>"),
            Step::Reply("550 5.1.1 no such user"),
        ]),
        plain_session(transaction_steps()),
    ]);
    let pool = Pool::new(
        config().allow_partial_recipients(true).build(),
        connector.clone(),
    );

    let err = with_timeout(pool.send(&message())).await.unwrap_err();
    assert!(matches!(err, Error::NoRecipientsAccepted));
    assert!(connector.bodies().is_empty());
    assert_eq!(
        connector.received(),
        vec![
            "EHLO localhost",
            "MAIL FROM:<sender@example.com>",
            "RCPT TO:<rcpt@example.com>",
            "QUIT",
        ]
    );
    assert_eq!(pool.connection_count(), 0);

    with_timeout(pool.send(&message())).await.unwrap();
    assert_eq!(connector.connects(), 2);
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn test_evict_idle_closes_expired_connections() {
    let connector = ScriptedConnector::new(vec![plain_session(transaction_steps())]);
    let pool = Pool::new(
        config().idle_timeout(Duration::ZERO).build(),
        connector.clone(),
    );

    with_timeout(pool.send(&message())).await.unwrap();
    assert_eq!(pool.idle_count(), 1);

    assert_eq!(with_timeout(pool.evict_idle()).await, 1);
    assert_eq!(pool.connection_count(), 0);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(connector.received().last().map(String::as_str), Some("QUIT"));
    assert_eq!(with_timeout(pool.evict_idle()).await, 0);
}

#[tokio::test]
async fn test_expired_idle_connection_replaced_without_rset() {
    let connector = ScriptedConnector::new(vec![
        plain_session(transaction_steps()),
        plain_session(transaction_steps()),
    ]);
    let pool = Pool::new(
        config().idle_timeout(Duration::ZERO).build(),
        connector.clone(),
    );

    with_timeout(pool.send(&message())).await.unwrap();
    with_timeout(pool.send(&message())).await.unwrap();

    let received = connector.received();
    assert!(!received.iter().any(|line| line == "RSET"));
    assert_eq!(received.iter().filter(|line| *line == "QUIT").count(), 1);
    assert_eq!(connector.connects(), 2);
    assert_eq!(connector.bodies().len(), 2);
    assert_eq!(pool.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_background_reaper_evicts_idle_connections() {
    let connector = ScriptedConnector::new(vec![plain_session(transaction_steps())]);
    let pool = Pool::new(
        config().idle_timeout(Duration::from_secs(10)).build(),
        connector.clone(),
    );

    with_timeout(pool.send(&message())).await.unwrap();
    assert_eq!(pool.idle_count(), 1);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(pool.idle_count(), 1);

    tokio::time::sleep(Duration::from_secs(12)).await;
    for _ in 0..100 {
        if pool.connection_count() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(pool.connection_count(), 0);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(connector.received().last().map(String::as_str), Some("QUIT"));
}

#[tokio::test]
async fn test_broken_connection_slot_passes_down_the_queue() {
    let connector = ScriptedConnector::new(vec![
        plain_session(vec![]),
        vec![],
        plain_session(vec![]),
    ]);
    let pool = Pool::new(config().max_pool_size(1).build(), connector.clone());

    let held = with_timeout(pool.acquire()).await.unwrap();
    let mut waiters = VecDeque::new();
    for _ in 0..2 {
        let pool = pool.clone();
        waiters.push_back(tokio::spawn(async move { pool.acquire().await }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    pool.mark_broken(held);

    let first = with_timeout(waiters.pop_front().unwrap()).await.unwrap();
    assert!(
        matches!(first, Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::ConnectionRefused)
    );
    let second = with_timeout(waiters.pop_front().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connector.connects(), 3);
    assert_eq!(pool.connection_count(), 1);
    assert!(!connector.received().iter().any(|line| line == "QUIT"));

    second.release().await;
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn test_cancelled_waiter_does_not_leak_capacity() {
    let connector = ScriptedConnector::new(vec![plain_session(vec![]), plain_session(vec![])]);
    let pool = Pool::new(config().max_pool_size(1).build(), connector.clone());

    let held = with_timeout(pool.acquire()).await.unwrap();
    let cancelled = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    cancelled.abort();
    assert!(with_timeout(cancelled).await.unwrap_err().is_cancelled());

    pool.mark_broken(held);
    let replacement = with_timeout(waiter).await.unwrap().unwrap();
    assert_eq!(connector.connects(), 2);
    assert_eq!(pool.connection_count(), 1);

    replacement.release().await;
    assert_eq!(pool.idle_count(), 1);
}
