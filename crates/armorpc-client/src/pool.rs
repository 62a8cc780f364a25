use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use armorpc_common::{Result, RpcError};

use crate::connection::{Connection, Timeouts};
use crate::endpoint::Endpoint;
use crate::tls::TlsPolicy;

/// Connection pool configuration.
///
/// `enabled = false` selects the degenerate mode: every checkout opens a
/// fresh connection and every checkin closes it. RPC behavior is identical,
/// there is simply no reuse.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Whether connections are kept alive and reused across calls.
    pub enabled: bool,
    /// Maximum simultaneous connections per scheme+host+port.
    pub max_per_endpoint: usize,
    /// How long a checkout may wait for a free slot before failing.
    pub checkout_timeout: Duration,
    /// Idle connections older than this are evicted instead of reused.
    pub max_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            enabled: false,
            max_per_endpoint: 10,
            checkout_timeout: Duration::from_secs(30),
            max_idle: Duration::from_secs(90),
        }
    }
}

/// Manages a bounded set of connections per endpoint.
///
/// # Checkout strategy
///
/// 1. Pop idle connections LIFO; evict any past `max_idle` or failing the
///    liveness probe. This scan is the only transparent retry; the caller
///    never sees a dead candidate.
/// 2. Below the per-endpoint maximum, reserve a slot and open a new
///    connection with the pool lock released.
/// 3. At the maximum, wait on the endpoint's notifier until a checkin frees
///    something or the checkout deadline passes.
///
/// Bookkeeping lives behind a synchronous mutex so the RAII guard can check
/// in from `Drop`; critical sections never span an await point. Waiting
/// happens on a per-endpoint `Notify`, so endpoints never wake each other.
pub struct ConnectionPool {
    config: PoolConfig,
    tls: Option<TlsPolicy>,
    timeouts: Timeouts,
    shared: Arc<PoolShared>,
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    opened: AtomicUsize,
    next_conn_id: AtomicU64,
}

struct PoolInner {
    shut_down: bool,
    endpoints: HashMap<String, EndpointSlots>,
}

#[derive(Default)]
struct EndpointSlots {
    idle: Vec<Connection>,
    /// Idle + checked out + reserved-for-open.
    total: usize,
    notify: Arc<Notify>,
}

enum CheckoutPlan {
    Reuse(Connection),
    Open,
    Wait(Arc<Notify>),
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkin(&self, key: &str, mut conn: Connection, healthy: bool, pooled: bool) {
        if !pooled {
            tracing::debug!(endpoint = key, id = conn.id(), "closing unpooled connection");
            return;
        }

        let mut inner = self.lock();
        let shut_down = inner.shut_down;
        let Some(slots) = inner.endpoints.get_mut(key) else {
            return;
        };

        if shut_down || !healthy {
            slots.total -= 1;
            let notify = slots.notify.clone();
            drop(inner);
            tracing::debug!(endpoint = key, id = conn.id(), "closing connection on checkin");
            drop(conn);
            notify.notify_one();
        } else {
            conn.touch();
            slots.idle.push(conn);
            let notify = slots.notify.clone();
            drop(inner);
            notify.notify_one();
        }
    }

    /// Undo a slot reservation after a failed open.
    fn release_slot(&self, key: &str) {
        let mut inner = self.lock();
        let Some(slots) = inner.endpoints.get_mut(key) else {
            return;
        };
        slots.total -= 1;
        let notify = slots.notify.clone();
        drop(inner);
        notify.notify_one();
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, tls: Option<TlsPolicy>, timeouts: Timeouts) -> Self {
        ConnectionPool {
            config,
            tls,
            timeouts,
            shared: Arc::new(PoolShared {
                inner: Mutex::new(PoolInner {
                    shut_down: false,
                    endpoints: HashMap::new(),
                }),
                opened: AtomicUsize::new(0),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_pooling(&self) -> bool {
        self.config.enabled
    }

    /// Total connections this pool has ever opened.
    pub fn connections_opened(&self) -> usize {
        self.shared.opened.load(Ordering::Relaxed)
    }

    /// Idle connections currently parked for the endpoint.
    pub fn idle_count(&self, endpoint: &Endpoint) -> usize {
        let inner = self.shared.lock();
        inner
            .endpoints
            .get(&endpoint.pool_key())
            .map(|slots| slots.idle.len())
            .unwrap_or(0)
    }

    /// Connections currently checked out (or being opened) for the endpoint.
    pub fn in_use_count(&self, endpoint: &Endpoint) -> usize {
        let inner = self.shared.lock();
        inner
            .endpoints
            .get(&endpoint.pool_key())
            .map(|slots| slots.total - slots.idle.len())
            .unwrap_or(0)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().shut_down
    }

    /// Borrow a connection for one request/response cycle.
    ///
    /// The returned guard must be released through
    /// [`PooledConnection::checkin`]; dropping it without an explicit checkin
    /// counts as unhealthy, so abandoned calls can never leak a broken
    /// connection back into circulation.
    pub async fn checkout(&self, endpoint: &Endpoint) -> Result<PooledConnection> {
        let key = endpoint.pool_key();

        if !self.config.enabled {
            if self.shared.lock().shut_down {
                return Err(RpcError::PoolClosed);
            }
            let conn = self.open_connection(endpoint).await?;
            return Ok(PooledConnection::new(conn, key, self.shared.clone(), false));
        }

        let deadline = Instant::now() + self.config.checkout_timeout;
        loop {
            let plan = {
                let mut inner = self.shared.lock();
                if inner.shut_down {
                    return Err(RpcError::PoolClosed);
                }
                let slots = inner.endpoints.entry(key.clone()).or_default();

                let mut reuse = None;
                while let Some(conn) = slots.idle.pop() {
                    if conn.idle_for() > self.config.max_idle {
                        tracing::debug!(
                            endpoint = %key,
                            id = conn.id(),
                            "evicting idle connection past max_idle"
                        );
                        slots.total -= 1;
                        continue;
                    }
                    if !conn.is_alive() {
                        tracing::debug!(
                            endpoint = %key,
                            id = conn.id(),
                            "discarding dead idle connection"
                        );
                        slots.total -= 1;
                        continue;
                    }
                    reuse = Some(conn);
                    break;
                }

                match reuse {
                    Some(conn) => CheckoutPlan::Reuse(conn),
                    None if slots.total < self.config.max_per_endpoint => {
                        slots.total += 1;
                        CheckoutPlan::Open
                    }
                    None => CheckoutPlan::Wait(slots.notify.clone()),
                }
            };

            match plan {
                CheckoutPlan::Reuse(conn) => {
                    tracing::debug!(endpoint = %key, id = conn.id(), "reusing pooled connection");
                    return Ok(PooledConnection::new(conn, key, self.shared.clone(), true));
                }
                CheckoutPlan::Open => {
                    tracing::debug!(endpoint = %key, "no idle connection, opening new");
                    match self.open_connection(endpoint).await {
                        Ok(conn) => {
                            return Ok(PooledConnection::new(
                                conn,
                                key,
                                self.shared.clone(),
                                true,
                            ))
                        }
                        Err(e) => {
                            self.shared.release_slot(&key);
                            return Err(e);
                        }
                    }
                }
                CheckoutPlan::Wait(notify) => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(RpcError::PoolExhausted(
                                self.config.checkout_timeout.as_millis() as u64,
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn open_connection(&self, endpoint: &Endpoint) -> Result<Connection> {
        let mut conn = Connection::open(endpoint, self.tls.as_ref(), self.timeouts).await?;
        conn.set_id(self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed));
        self.shared.opened.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(endpoint = %endpoint.pool_key(), id = conn.id(), "opened connection");
        Ok(conn)
    }

    /// Close every idle connection and fail all further checkouts.
    ///
    /// Connections currently checked out stay valid until their holder
    /// checks them in, at which point they are closed regardless of health.
    pub fn shutdown(&self) {
        let notifies: Vec<Arc<Notify>> = {
            let mut inner = self.shared.lock();
            inner.shut_down = true;
            inner
                .endpoints
                .values_mut()
                .map(|slots| {
                    slots.total -= slots.idle.len();
                    slots.idle.clear();
                    slots.notify.clone()
                })
                .collect()
        };
        for notify in notifies {
            notify.notify_waiters();
        }
        tracing::debug!("connection pool shut down");
    }
}

/// RAII checkout handle.
///
/// Derefs to the underlying [`Connection`] for the duration of the loan.
/// Release it with [`checkin`](Self::checkin); if the guard is dropped
/// instead (error path, caller timeout, panic unwind), the connection is
/// checked in as unhealthy and closed.
pub struct PooledConnection {
    conn: Option<Connection>,
    key: String,
    shared: Arc<PoolShared>,
    pooled: bool,
}

impl PooledConnection {
    fn new(conn: Connection, key: String, shared: Arc<PoolShared>, pooled: bool) -> Self {
        PooledConnection {
            conn: Some(conn),
            key,
            shared,
            pooled,
        }
    }

    /// Return the connection to the pool, reporting whether the request
    /// cycle ended cleanly. Unhealthy connections are closed and their slot
    /// freed immediately.
    pub fn checkin(mut self, healthy: bool) {
        if let Some(conn) = self.conn.take() {
            self.shared.checkin(&self.key, conn, healthy, self.pooled);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.key)
            .field("pooled", &self.pooled)
            .field("checked_in", &self.conn.is_none())
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
            .as_ref()
            .expect("pooled connection accessed after checkin")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
            .as_mut()
            .expect("pooled connection accessed after checkin")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.checkin(&self.key, conn, false, self.pooled);
        }
    }
}
