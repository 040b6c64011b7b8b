//! Connection pool.
//!
//! Admission control over [`Connection`]s: reuse of idle connections after
//! an `RSET` probe, creation up to `max_pool_size`, a FIFO queue of waiting
//! callers, idle eviction, and draining on [`Pool::stop`].
//!
//! All bookkeeping lives behind one mutex that is never held across an
//! `.await`. Every counted connection is owned by exactly one guard (a
//! [`PooledConnection`] or an internal slot reservation) whose `Drop`
//! returns the capacity, so cancelling a future cannot leak a slot.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, watch};

use crate::auth::AuthOutcome;
use crate::command::Command;
use crate::config::{BareLfPolicy, Config};
use crate::connection::{Connection, ConnectionEvent, Connector, body};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::types::{Capabilities, MailResult, Transaction};

static NO_CAPABILITIES: Capabilities = Capabilities {
    auth_mechanisms: BTreeSet::new(),
    max_message_size: 0,
    starttls: false,
    pipelining: false,
    enhanced_status_codes: false,
    eight_bit_mime: false,
    smtputf8: false,
};

/// A pool of SMTP connections to one server.
///
/// Cloning is cheap; clones share the same connections.
pub struct Pool<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Pool")
            .field("host", &self.shared.config.host)
            .field("connections", &inner.count)
            .field("idle", &inner.idle.len())
            .field("waiters", &inner.waiters.len())
            .field("stopped", &inner.stopped)
            .finish()
    }
}

struct Shared<C: Connector> {
    config: Config,
    connector: C,
    state: Mutex<Inner<C>>,
    next_id: AtomicU64,
    drained: watch::Sender<bool>,
}

struct Inner<C: Connector> {
    /// Connections open or being opened.
    count: usize,
    /// Ids of handshaken connections still counted.
    known: HashSet<u64>,
    /// Parked connections, most recently used last.
    idle: VecDeque<Connection<C::Stream>>,
    waiters: VecDeque<oneshot::Sender<Handoff<C>>>,
    stopped: bool,
    /// Last mechanism that authenticated successfully.
    preferred: Option<String>,
    connector_released: bool,
}

impl<C: Connector> Inner<C> {
    /// Returns true exactly once: when a stopped pool has no connections left.
    const fn take_drained(&mut self) -> bool {
        if self.stopped && self.count == 0 && !self.connector_released {
            self.connector_released = true;
            true
        } else {
            false
        }
    }
}

/// What a queued caller receives.
enum Handoff<C: Connector> {
    /// A released connection, skipping the RSET probe.
    Ready(PooledConnection<C>),
    /// Capacity to open a new connection.
    Create(Slot<C>),
    /// The pool was stopped.
    Stopped,
}

/// One unit of reserved capacity, not yet backed by a connection.
struct Slot<C: Connector> {
    shared: Arc<Shared<C>>,
    armed: bool,
}

impl<C: Connector> Slot<C> {
    const fn new(shared: Arc<Shared<C>>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn into_connection(mut self, conn: Connection<C::Stream>) -> PooledConnection<C> {
        self.shared.lock().known.insert(conn.id());
        self.armed = false;
        PooledConnection::new(conn, Arc::clone(&self.shared))
    }
}

impl<C: Connector> Drop for Slot<C> {
    fn drop(&mut self) {
        if self.armed {
            let drained = {
                let mut inner = self.shared.lock();
                self.shared.free_slot(&mut inner)
            };
            if drained {
                self.shared.finish_drain();
            }
        }
    }
}

impl<C: Connector> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, Inner<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gives `handoff` to the oldest waiter still listening, or returns it.
    fn dispatch(inner: &mut Inner<C>, mut handoff: Handoff<C>) -> Option<Handoff<C>> {
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(handoff) {
                Ok(()) => return None,
                Err(back) => handoff = back,
            }
        }
        Some(handoff)
    }

    /// Releases one unit of capacity: the next waiter may create a
    /// connection with it, otherwise the count drops.
    ///
    /// Returns true if the pool just drained.
    fn free_slot(self: &Arc<Self>, inner: &mut Inner<C>) -> bool {
        if !inner.stopped {
            let slot = Slot::new(Arc::clone(self));
            match Self::dispatch(inner, Handoff::Create(slot)) {
                None => return false,
                Some(Handoff::Create(mut slot)) => slot.armed = false,
                Some(_) => {}
            }
        }
        inner.count = inner.count.saturating_sub(1);
        tracing::trace!(connections = inner.count, "slot released");
        inner.take_drained()
    }

    /// Forgets a handshaken connection. Repeated calls for the same id
    /// have no effect.
    fn discard(self: &Arc<Self>, id: u64) {
        let drained = {
            let mut inner = self.lock();
            if inner.known.remove(&id) {
                tracing::debug!(connection = id, "connection discarded");
                self.free_slot(&mut inner)
            } else {
                false
            }
        };
        if drained {
            self.finish_drain();
        }
    }

    fn finish_drain(&self) {
        tracing::debug!(host = %self.config.host, "pool drained, releasing connector");
        self.connector.shutdown();
        self.drained.send_replace(true);
    }

    fn remember(&self, outcome: &AuthOutcome) {
        let mut inner = self.lock();
        match outcome {
            AuthOutcome::Authenticated(mechanism) => inner.preferred = Some(mechanism.clone()),
            AuthOutcome::Failed(_) => inner.preferred = None,
            AuthOutcome::Skipped => {}
        }
    }

    /// Opens and handshakes a new connection on reserved capacity.
    async fn establish(self: &Arc<Self>, slot: Slot<C>) -> Result<PooledConnection<C>> {
        if self.lock().stopped {
            return Err(Error::PoolStopped);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection = id, host = %self.config.host, "opening connection");
        let stream = self.connector.connect().await?;
        let mut conn = Connection::new(id, stream);

        let preferred = self.lock().preferred.clone();
        let handshake = Session::connecting(&mut conn, &self.config)
            .handshake(&self.connector, preferred.as_deref())
            .await;

        match handshake {
            Ok(handshake) => {
                self.remember(&handshake.auth);
                Ok(slot.into_connection(conn))
            }
            Err(err) => {
                if matches!(err, Error::AuthenticationFailed(_)) {
                    self.lock().preferred = None;
                }
                conn.quit().await;
                drop(slot);
                Err(err)
            }
        }
    }

    /// Probes an idle connection with RSET.
    async fn revalidate(self: &Arc<Self>, mut pooled: PooledConnection<C>) -> Option<PooledConnection<C>> {
        let conn = pooled.conn.as_mut()?;
        let id = conn.id();

        if conn.idle_for() >= self.config.idle_timeout {
            tracing::debug!(connection = id, "idle connection expired");
            pooled.close().await;
            return None;
        }

        conn.transition(ConnectionEvent::Acquired);
        match conn.write(&Command::Rset).await {
            Ok(reply) if reply.is_success() => {
                tracing::debug!(connection = id, "reusing idle connection");
                Some(pooled)
            }
            Ok(reply) => {
                tracing::debug!(connection = id, code = reply.code.as_u16(), "RSET rejected");
                conn.mark_broken();
                pooled.close().await;
                None
            }
            Err(err) => {
                tracing::debug!(connection = id, error = %err, "RSET failed");
                pooled.close().await;
                None
            }
        }
    }
}

enum Step<C: Connector> {
    Reuse(PooledConnection<C>),
    Create(Slot<C>),
    Wait(oneshot::Receiver<Handoff<C>>),
}

impl<C: Connector> Pool<C> {
    /// Creates a pool. Nothing is opened until the first acquisition.
    ///
    /// When called inside a tokio runtime, a background task evicts idle
    /// connections every half `idle_timeout`.
    #[must_use]
    pub fn new(config: Config, connector: C) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(Inner {
                count: 0,
                known: HashSet::new(),
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                stopped: false,
                preferred: None,
                connector_released: false,
            }),
            next_id: AtomicU64::new(1),
            drained: watch::Sender::new(false),
            config,
            connector,
        });

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let period = (shared.config.idle_timeout / 2).max(Duration::from_secs(1));
            runtime.spawn(reap_idle(Arc::downgrade(&shared), period));
        }

        Self { shared }
    }

    /// Configuration the pool was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Returns a ready connection, reusing, creating, or waiting as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolStopped`] after [`Pool::stop`], or the connect
    /// and handshake error of a new connection.
    pub async fn acquire(&self) -> Result<PooledConnection<C>> {
        let max = self.shared.config.max_pool_size.max(1);
        loop {
            let step = {
                let mut inner = self.shared.lock();
                if inner.stopped {
                    return Err(Error::PoolStopped);
                }
                if let Some(conn) = inner.idle.pop_back() {
                    Step::Reuse(PooledConnection::new(conn, Arc::clone(&self.shared)))
                } else if inner.count < max {
                    inner.count += 1;
                    tracing::trace!(connections = inner.count, "reserved slot");
                    Step::Create(Slot::new(Arc::clone(&self.shared)))
                } else {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.retain(|w| !w.is_closed());
                    inner.waiters.push_back(tx);
                    tracing::debug!(waiters = inner.waiters.len(), "pool exhausted, queueing");
                    Step::Wait(rx)
                }
            };

            match step {
                Step::Reuse(pooled) => {
                    if let Some(pooled) = self.shared.revalidate(pooled).await {
                        return Ok(pooled);
                    }
                }
                Step::Create(slot) => return self.shared.establish(slot).await,
                Step::Wait(rx) => {
                    return match rx.await {
                        Ok(Handoff::Ready(pooled)) => Ok(pooled),
                        Ok(Handoff::Create(slot)) => self.shared.establish(slot).await,
                        Ok(Handoff::Stopped) | Err(_) => Err(Error::PoolStopped),
                    };
                }
            }
        }
    }

    /// Acquires a connection, runs one transaction, and returns the
    /// connection to the pool or discards it.
    ///
    /// # Errors
    ///
    /// Returns local validation, acquisition, protocol or transport errors.
    /// Only the connection that failed is discarded.
    pub async fn send(&self, tx: &Transaction) -> Result<MailResult> {
        if self.shared.config.bare_lf == BareLfPolicy::Reject && body::has_bare_lf(tx.message()) {
            return Err(Error::BareLineFeed);
        }

        let mut pooled = self.acquire().await?;
        let result = pooled.send(tx).await;
        self.release(pooled).await;
        result
    }

    /// Returns a connection after use.
    ///
    /// A waiting caller receives it directly; otherwise it is parked idle.
    /// It is closed instead when it is broken or its last transaction
    /// failed, when keep-alive is off or the per-connection mail limit is
    /// reached, and when the pool is stopped.
    pub async fn release(&self, mut pooled: PooledConnection<C>) {
        let Some(conn) = pooled.conn.as_mut() else {
            return;
        };

        let close_reason = if !conn.is_reusable() {
            Some("broken")
        } else if pooled.failed {
            Some("transaction failed")
        } else if !self.shared.config.keep_alive {
            Some("keep-alive disabled")
        } else if self
            .shared
            .config
            .max_mails_per_connection
            .is_some_and(|max| conn.mails_sent() >= max)
        {
            Some("mail limit reached")
        } else {
            None
        };
        if let Some(reason) = close_reason {
            tracing::debug!(connection = conn.id(), reason, "closing released connection");
            pooled.close().await;
            return;
        }

        let leftover = {
            let mut inner = self.shared.lock();
            if inner.stopped {
                Some(pooled)
            } else {
                match Shared::dispatch(&mut inner, Handoff::Ready(pooled)) {
                    None => {
                        tracing::debug!("handed connection to waiter");
                        None
                    }
                    Some(Handoff::Ready(mut pooled)) => {
                        if let Some(mut conn) = pooled.conn.take() {
                            conn.mark_idle();
                            tracing::trace!(connection = conn.id(), "connection parked");
                            inner.idle.push_back(conn);
                        }
                        None
                    }
                    Some(_) => None,
                }
            }
        };

        if let Some(pooled) = leftover {
            tracing::debug!("pool stopped, closing released connection");
            pooled.close().await;
        }
    }

    /// Discards a connection without QUIT.
    pub fn mark_broken(&self, mut pooled: PooledConnection<C>) {
        if let Some(conn) = pooled.conn.as_mut() {
            tracing::debug!(host = %self.shared.config.host, connection = conn.id(), "connection marked broken");
            conn.mark_broken();
        }
        drop(pooled);
    }

    /// Stops the pool.
    ///
    /// Further acquisitions fail with [`Error::PoolStopped`], queued callers
    /// are rejected, and idle connections are closed now. Connections in
    /// use are closed when released. Calling it again has no effect.
    pub async fn stop(&self) {
        let (idle, waiters, drained) = {
            let mut inner = self.shared.lock();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            let idle: Vec<_> = inner
                .idle
                .drain(..)
                .map(|conn| PooledConnection::new(conn, Arc::clone(&self.shared)))
                .collect();
            let waiters: Vec<_> = inner.waiters.drain(..).collect();
            (idle, waiters, inner.take_drained())
        };

        tracing::debug!(
            host = %self.shared.config.host,
            idle = idle.len(),
            waiters = waiters.len(),
            "stopping pool"
        );
        for waiter in waiters {
            let _ = waiter.send(Handoff::Stopped);
        }
        if drained {
            self.shared.finish_drain();
        }
        for pooled in idle {
            pooled.close().await;
        }
    }

    /// Resolves once a stopped pool has closed every connection and shut
    /// down its connector.
    pub async fn closed(&self) {
        let mut drained = self.shared.drained.subscribe();
        let _ = drained.wait_for(|done| *done).await;
    }

    /// Closes idle connections unused for longer than `idle_timeout`.
    ///
    /// Returns how many were closed.
    pub async fn evict_idle(&self) -> usize {
        let expired: Vec<_> = {
            let mut inner = self.shared.lock();
            let timeout = self.shared.config.idle_timeout;
            let (expired, keep): (VecDeque<_>, VecDeque<_>) = inner
                .idle
                .drain(..)
                .partition(|conn| conn.idle_for() >= timeout);
            inner.idle = keep;
            expired
                .into_iter()
                .map(|conn| PooledConnection::new(conn, Arc::clone(&self.shared)))
                .collect()
        };

        let evicted = expired.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicting idle connections");
        }
        for pooled in expired {
            pooled.close().await;
        }
        evicted
    }

    /// Connections currently open or being opened.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.lock().count
    }

    /// Connections parked idle.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.shared.lock().idle.len()
    }

    /// Mechanism that will be tried first on the next new connection.
    #[must_use]
    pub fn preferred_mechanism(&self) -> Option<String> {
        self.shared.lock().preferred.clone()
    }

    /// Returns true after [`Pool::stop`].
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }
}

async fn reap_idle<C: Connector>(shared: Weak<Shared<C>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.lock().stopped {
            break;
        }
        Pool { shared }.evict_idle().await;
    }
}

/// A connection lent out by the pool.
///
/// Give it back with [`PooledConnection::release`] (or [`Pool::release`]).
/// Dropping it discards the connection and frees its capacity.
pub struct PooledConnection<C: Connector> {
    conn: Option<Connection<C::Stream>>,
    shared: Arc<Shared<C>>,
    /// Set when a transaction ended in a non-local error.
    failed: bool,
}

impl<C: Connector> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.conn.as_ref().map(Connection::id))
            .field("state", &self.conn.as_ref().map(Connection::state))
            .finish()
    }
}

impl<C: Connector> PooledConnection<C> {
    const fn new(conn: Connection<C::Stream>, shared: Arc<Shared<C>>) -> Self {
        Self {
            conn: Some(conn),
            shared,
            failed: false,
        }
    }

    /// Pool-assigned connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, Connection::id)
    }

    /// Capabilities negotiated on this connection.
    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        self.conn
            .as_ref()
            .map_or(&NO_CAPABILITIES, Connection::capabilities)
    }

    /// Runs one transaction on this connection.
    ///
    /// # Errors
    ///
    /// Returns local validation, protocol or transport errors. After a
    /// non-local error, releasing the connection closes it.
    pub async fn send(&mut self, tx: &Transaction) -> Result<MailResult> {
        let conn = self.conn.as_mut().ok_or(Error::ConnectionClosed)?;
        let result = Session::ready(conn, &self.shared.config).send(tx).await;
        if let Err(err) = &result
            && !err.is_local()
        {
            self.failed = true;
        }
        result
    }

    /// Returns the connection to its pool.
    pub async fn release(self) {
        let pool = Pool {
            shared: Arc::clone(&self.shared),
        };
        pool.release(self).await;
    }

    /// Sends QUIT and discards the connection.
    pub async fn close(mut self) {
        if let Some(conn) = self.conn.as_mut() {
            Session::ready(conn, &self.shared.config).close().await;
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if conn.is_reusable() {
                tracing::debug!(connection = conn.id(), "pooled connection dropped without release");
            }
            self.shared.discard(conn.id());
        }
    }
}
