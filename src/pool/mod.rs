//! Bounded pool of SMTP sessions.
//!
//! A fixed arena of `max_connections` slots guarded by one mutex. Sessions
//! are dialed lazily, lent to exactly one send as a [`PooledConnection`], and
//! recycled on release. Waiters park on a [`Notify`] until a slot frees up.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::{PoolConfig, TransportConfig};
use crate::context::{Interrupted, SendContext};
use crate::errors::{codes, MailError, MailResult};
use crate::transport::{Connector, MailSession};
use crate::types::PoolStatus;

struct IdleConnection {
    id: u64,
    session: Box<dyn MailSession>,
    created_at: Instant,
    idle_since: Instant,
}

enum Slot {
    Empty,
    Idle(IdleConnection),
    InUse,
}

struct PoolState {
    slots: Vec<Slot>,
    pending: usize,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    transport: TransportConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    notify: Notify,
    next_id: AtomicU64,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Frees a slot without returning a session to it.
    fn vacate(&self, slot: usize) {
        self.lock().slots[slot] = Slot::Empty;
        self.notify.notify_one();
    }
}

/// Counts one parked `acquire` until dropped.
struct PendingGuard<'a> {
    pool: &'a PoolInner,
}

impl<'a> PendingGuard<'a> {
    /// Takes over the `pending` increment made by `claim`.
    fn adopt(pool: &'a PoolInner) -> Self {
        Self { pool }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        state.pending = state.pending.saturating_sub(1);
    }
}

/// Frees its slot on drop unless disarmed.
struct SlotLease {
    slot: usize,
    pool: Weak<PoolInner>,
    armed: bool,
}

impl SlotLease {
    fn disarm(mut self) -> usize {
        self.armed = false;
        self.slot
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            tracing::debug!(slot = self.slot, "Pooled connection dropped without release");
            pool.vacate(self.slot);
        }
    }
}

/// A session lent to one send.
///
/// Return it with [`ConnectionPool::release`] or [`ConnectionPool::discard`].
/// Dropping it closes the socket and frees the slot.
pub struct PooledConnection {
    id: u64,
    created_at: Instant,
    session: Box<dyn MailSession>,
    lease: SlotLease,
}

impl PooledConnection {
    fn new(id: u64, slot: usize, created_at: Instant, session: Box<dyn MailSession>, pool: &Arc<PoolInner>) -> Self {
        Self {
            id,
            created_at,
            session,
            lease: SlotLease {
                slot,
                pool: Arc::downgrade(pool),
                armed: true,
            },
        }
    }

    /// The underlying session.
    pub fn session(&mut self) -> &mut dyn MailSession {
        self.session.as_mut()
    }

    /// Connection identifier, unique within the pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the session was dialed.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn into_parts(self) -> (usize, Box<dyn MailSession>) {
        let PooledConnection { session, lease, .. } = self;
        (lease.disarm(), session)
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("slot", &self.lease.slot)
            .field("session", &self.session)
            .finish()
    }
}

enum Claim {
    Reuse(PooledConnection),
    Dial(usize),
    Wait,
}

/// Pool of SMTP sessions.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("host", &self.inner.transport.host)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    /// Creates an empty pool. Zero config values fall back to the defaults.
    pub fn new(config: PoolConfig, transport: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        let config = config.normalized();
        let slots = (0..config.max_connections).map(|_| Slot::Empty).collect();
        Self {
            inner: Arc::new(PoolInner {
                config,
                transport,
                connector,
                state: Mutex::new(PoolState {
                    slots,
                    pending: 0,
                    closed: false,
                }),
                notify: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Effective pool settings.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrows a session: an idle one if available, a new one if a slot is
    /// free, otherwise waits for a release.
    ///
    /// Waiting is bounded by the acquire timeout and the context. A closed
    /// pool fails immediately with `POOL_CLOSED`; an exhausted wait fails
    /// with a connection error coded `POOL_ACQUIRE_TIMEOUT`.
    pub async fn acquire(&self, ctx: &SendContext, request_id: &str) -> MailResult<PooledConnection> {
        self.acquire_as(ctx, None, request_id).await
    }

    /// Like [`acquire`](Self::acquire), but never lends a session that
    /// authenticated as someone other than `identity`.
    ///
    /// Idle sessions that are unauthenticated or authenticated as `identity`
    /// are reused. When only mismatched idle sessions remain and no slot is
    /// free, one of them is closed and its slot redialed.
    pub async fn acquire_as(
        &self,
        ctx: &SendContext,
        identity: Option<&str>,
        request_id: &str,
    ) -> MailResult<PooledConnection> {
        let wait_ctx = ctx.with_timeout(self.inner.config.timeout);

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (claim, stale) = self.claim(identity, request_id)?;
            let _pending = matches!(claim, Claim::Wait).then(|| PendingGuard::adopt(&self.inner));
            self.shutdown_all(stale).await;

            match claim {
                Claim::Reuse(conn) => {
                    tracing::trace!(request_id, connection_id = conn.id(), "Reusing pooled connection");
                    return Ok(conn);
                }
                Claim::Dial(slot) => return self.dial(ctx, slot, request_id).await,
                Claim::Wait => {
                    tracing::debug!(request_id, "Waiting for a pooled connection");
                    if let Err(interrupted) = wait_ctx.run(None, notified).await {
                        return Err(acquire_error(ctx, interrupted).with_request_id(request_id));
                    }
                }
            }
        }
    }

    fn claim(&self, identity: Option<&str>, request_id: &str) -> MailResult<(Claim, Vec<Box<dyn MailSession>>)> {
        let max_idle = self.inner.config.max_idle;
        let mut state = self.inner.lock();
        if state.closed {
            return Err(MailError::connection(codes::POOL_CLOSED, "connection pool is closed")
                .with_request_id(request_id));
        }

        let mut stale = Vec::new();
        let mut mismatched = None;
        for index in 0..state.slots.len() {
            let Slot::Idle(idle) = &state.slots[index] else {
                continue;
            };
            if idle.idle_since.elapsed() >= max_idle {
                tracing::debug!(connection_id = idle.id, "Discarding idle connection");
                if let Slot::Idle(idle) = std::mem::replace(&mut state.slots[index], Slot::Empty) {
                    stale.push(idle.session);
                }
                continue;
            }
            if !serves(idle.session.as_ref(), identity) {
                mismatched.get_or_insert(index);
                continue;
            }
            if let Slot::Idle(idle) = std::mem::replace(&mut state.slots[index], Slot::InUse) {
                let conn = PooledConnection::new(idle.id, index, idle.created_at, idle.session, &self.inner);
                return Ok((Claim::Reuse(conn), stale));
            }
        }

        if let Some(index) = state.slots.iter().position(|s| matches!(s, Slot::Empty)) {
            state.slots[index] = Slot::InUse;
            return Ok((Claim::Dial(index), stale));
        }

        if let Some(index) = mismatched {
            if let Slot::Idle(idle) = std::mem::replace(&mut state.slots[index], Slot::InUse) {
                tracing::debug!(
                    request_id,
                    connection_id = idle.id,
                    "Replacing idle connection authenticated as another identity"
                );
                stale.push(idle.session);
                return Ok((Claim::Dial(index), stale));
            }
        }

        state.pending += 1;
        Ok((Claim::Wait, stale))
    }

    async fn dial(&self, ctx: &SendContext, slot: usize, request_id: &str) -> MailResult<PooledConnection> {
        let transport = &self.inner.transport;
        let dialed = ctx
            .run(Some(transport.timeout), self.inner.connector.connect(transport))
            .await;

        let session = match dialed {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.inner.vacate(slot);
                return Err(MailError::connection(
                    codes::DIAL_FAILED,
                    format!("failed to connect to {}:{}", transport.host, transport.port),
                )
                .with_request_id(request_id)
                .with_cause(e));
            }
            Err(interrupted) => {
                self.inner.vacate(slot);
                let err = match interrupted {
                    Interrupted::Cancelled => MailError::from(interrupted),
                    Interrupted::DeadlineExceeded => MailError::connection(
                        codes::DIAL_FAILED,
                        format!("timed out connecting to {}:{}", transport.host, transport.port),
                    ),
                };
                return Err(err.with_request_id(request_id));
            }
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(request_id, connection_id = id, host = %transport.host, "Dialed new connection");

        let conn = PooledConnection::new(id, slot, Instant::now(), session, &self.inner);

        // close() may have run while dialing.
        if self.inner.lock().closed {
            self.discard(conn, request_id).await;
            return Err(MailError::connection(codes::POOL_CLOSED, "connection pool is closed")
                .with_request_id(request_id));
        }
        Ok(conn)
    }

    /// Returns a session for reuse. Sessions older than `max_idle`, and all
    /// sessions once the pool is closed, are shut down instead.
    pub async fn release(&self, conn: PooledConnection, request_id: &str) {
        let (id, created_at) = (conn.id, conn.created_at);
        let (slot, session) = conn.into_parts();

        let retired = {
            let mut state = self.inner.lock();
            if state.closed || created_at.elapsed() >= self.inner.config.max_idle {
                state.slots[slot] = Slot::Empty;
                Some(session)
            } else {
                let now = Instant::now();
                state.slots[slot] = Slot::Idle(IdleConnection {
                    id,
                    session,
                    created_at,
                    idle_since: now,
                });
                None
            }
        };
        self.inner.notify.notify_one();

        if let Some(session) = retired {
            tracing::debug!(request_id, connection_id = id, "Retiring connection on release");
            self.shutdown(session).await;
        }
    }

    /// Drops a session after a transport failure and frees its slot.
    pub async fn discard(&self, conn: PooledConnection, request_id: &str) {
        let id = conn.id;
        let (slot, session) = conn.into_parts();
        self.inner.vacate(slot);
        tracing::debug!(request_id, connection_id = id, "Discarding connection");
        self.shutdown(session).await;
    }

    /// Acquires a session, checks it with `NOOP`, and returns it, all within
    /// the acquire timeout.
    pub async fn health_check(&self, ctx: &SendContext, request_id: &str) -> MailResult<()> {
        let ctx = ctx.with_timeout(self.inner.config.timeout);
        let mut conn = self.acquire(&ctx, request_id).await?;

        match ctx.run(None, conn.session().noop()).await {
            Ok(Ok(())) => {
                self.release(conn, request_id).await;
                Ok(())
            }
            Ok(Err(e)) => {
                self.discard(conn, request_id).await;
                Err(MailError::connection(codes::HEALTH_CHECK_FAILED, "connection health check failed")
                    .with_request_id(request_id)
                    .with_cause(e))
            }
            Err(interrupted) => {
                self.discard(conn, request_id).await;
                Err(MailError::from(interrupted).with_request_id(request_id))
            }
        }
    }

    /// Closes the pool: idle sessions now, borrowed ones when returned.
    /// Waiters are woken and fail with `POOL_CLOSED`.
    pub async fn close(&self) {
        let idle: Vec<_> = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state
                .slots
                .iter_mut()
                .filter(|slot| matches!(slot, Slot::Idle(_)))
                .filter_map(|slot| match std::mem::replace(slot, Slot::Empty) {
                    Slot::Idle(idle) => Some(idle.session),
                    _ => None,
                })
                .collect()
        };
        self.inner.notify.notify_waiters();

        tracing::info!(closed = idle.len(), "Connection pool closed");
        self.shutdown_all(idle).await;
    }

    /// Snapshot of slot usage.
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        let idle = state.slots.iter().filter(|s| matches!(s, Slot::Idle(_))).count();
        let in_use = state.slots.iter().filter(|s| matches!(s, Slot::InUse)).count();
        PoolStatus {
            total: idle + in_use,
            idle,
            in_use,
            pending: state.pending,
            max_size: state.slots.len(),
            closed: state.closed,
        }
    }

    async fn shutdown(&self, mut session: Box<dyn MailSession>) {
        let quit = tokio::time::timeout(self.inner.transport.timeout, session.quit()).await;
        if let Ok(Err(e)) = quit {
            tracing::trace!(error = %e, "QUIT failed while closing connection");
        }
    }

    async fn shutdown_all(&self, sessions: Vec<Box<dyn MailSession>>) {
        for session in sessions {
            self.shutdown(session).await;
        }
    }
}

/// An idle session serves `identity` if it never authenticated or
/// authenticated as that identity.
fn serves(session: &dyn MailSession, identity: Option<&str>) -> bool {
    match (identity, session.authenticated_as()) {
        (Some(wanted), Some(current)) => wanted.eq_ignore_ascii_case(current),
        _ => true,
    }
}

fn acquire_error(ctx: &SendContext, interrupted: Interrupted) -> MailError {
    match ctx.err() {
        Some(caller) => MailError::from(caller),
        None if interrupted == Interrupted::Cancelled => MailError::from(interrupted),
        None => MailError::connection(codes::POOL_ACQUIRE_TIMEOUT, "timed out waiting for a pooled connection"),
    }
}
