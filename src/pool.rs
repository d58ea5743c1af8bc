//! A connection pool for ldap connections, isolated per bind identity.
//!
//! Every pooled connection is tagged with the [`Credentials`] it was bound with and is
//! only ever handed to callers presenting exactly the same credentials. Connections are
//! dialed on demand up to `max_connections`, expire after `max_lifetime` or
//! `max_idle_time`, and are swept by a periodic maintenance task that also keeps
//! `min_connections` service-identity connections warm.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::PoolConfig;
use crate::directory::{Credentials, Directory};
use crate::error::{Error, Result};

/// A connection leased from the pool. Hand it back with [`ConnectionPool::release`].
#[derive(Debug)]
pub struct PooledConnection<C> {
    id: u64,
    conn: C,
    credentials: Credentials,
    healthy: bool,
}

impl<C> PooledConnection<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conn_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Flags the connection as broken; the pool closes it on release instead of reusing it.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }
}

/// Point-in-time pool statistics, read from atomics without taking the pool lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    /// Outstanding leases.
    pub active: usize,
    /// Connections with no outstanding lease.
    pub available: usize,
    pub acquired: u64,
    pub failed: u64,
    pub max: usize,
}

#[derive(Debug)]
struct Slot<C> {
    id: u64,
    conn: C,
    credentials: Credentials,
    created_at: Instant,
    last_used_at: Instant,
    healthy: bool,
    leases: usize,
}

impl<C> Slot<C> {
    fn in_use(&self) -> bool {
        self.leases > 0
    }

    /// Healthy and within its lifetime.
    fn is_valid(&self, config: &PoolConfig, now: Instant) -> bool {
        self.healthy && now.duration_since(self.created_at) < config.max_lifetime
    }

    fn is_idle_expired(&self, config: &PoolConfig, now: Instant) -> bool {
        now.duration_since(self.last_used_at) >= config.max_idle_time
    }

    fn can_reuse(&self, credentials: &Credentials, config: &PoolConfig, now: Instant) -> bool {
        !self.in_use()
            && self.credentials == *credentials
            && self.is_valid(config, now)
            && !self.is_idle_expired(config, now)
    }
}

#[derive(Debug)]
struct State<C> {
    slots: Vec<Slot<C>>,
    // Dials in flight. They count against `max_connections`.
    pending: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicUsize,
    active: AtomicUsize,
    busy: AtomicUsize,
    acquired: AtomicU64,
    failed: AtomicU64,
}

enum Checkout<C> {
    Leased(PooledConnection<C>),
    Dial(Option<C>),
    Full,
}

pub struct ConnectionPool<D: Directory> {
    directory: Arc<D>,
    config: PoolConfig,
    state: Mutex<State<D::Conn>>,
    released: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
    counters: Counters,
    shutdown: watch::Sender<bool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Releases a reserved dial slot unless the dial completed.
struct Reservation<'p, D: Directory> {
    pool: &'p ConnectionPool<D>,
    armed: bool,
}

impl<D: Directory> Drop for Reservation<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.lock().pending -= 1;
            self.pool.released.notify_waiters();
        }
    }
}

impl<D: Directory> ConnectionPool<D> {
    /// Creates an empty pool. `config` is normalized first, see [`PoolConfig::normalize`].
    pub fn new(directory: Arc<D>, config: PoolConfig) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            directory,
            config: config.normalize(),
            state: Mutex::new(State {
                slots: Vec::new(),
                pending: 0,
            }),
            released: Notify::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            counters: Counters::default(),
            shutdown,
            maintenance: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<D> {
        &self.directory
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, State<D::Conn>> {
        self.state.lock().unwrap_or_else(|e| {
            warn!("Connection pool mutex was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Acquires a connection bound with `credentials`, waiting at most `acquire_timeout`.
    pub async fn acquire(&self, credentials: &Credentials) -> Result<PooledConnection<D::Conn>> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        self.acquire_until(credentials, deadline).await
    }

    /// Acquires a connection bound with `credentials`, waiting until the earlier of
    /// `deadline` and `acquire_timeout`.
    pub async fn acquire_until(
        &self,
        credentials: &Credentials,
        deadline: Instant,
    ) -> Result<PooledConnection<D::Conn>> {
        let started = Instant::now();
        let deadline = deadline.min(started + self.config.acquire_timeout);

        loop {
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }

            // Register interest before looking at the pool so a release between the
            // scan and the wait is not lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.checkout(credentials) {
                Checkout::Leased(conn) => {
                    debug!("Reusing pooled connection {} for {credentials}", conn.id);
                    return Ok(conn);
                }
                Checkout::Dial(evicted) => {
                    if let Some(conn) = evicted {
                        self.spawn_close(conn);
                    }
                    return self.dial(credentials, deadline).await;
                }
                Checkout::Full => {}
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                debug!("Timed out waiting for a connection for {credentials}");
                return Err(Error::AcquireTimeout(
                    deadline.saturating_duration_since(started),
                ));
            }
        }
    }

    fn checkout(&self, credentials: &Credentials) -> Checkout<D::Conn> {
        let now = Instant::now();
        let mut state = self.lock();

        if let Some(slot) = state
            .slots
            .iter_mut()
            .find(|s| s.can_reuse(credentials, &self.config, now))
        {
            return Checkout::Leased(self.lease(slot, now));
        }

        if state.slots.len() + state.pending < self.config.max_connections {
            state.pending += 1;
            return Checkout::Dial(None);
        }

        // At capacity. ldap connections multiplex, so a busy connection of the very same
        // identity may carry another operation.
        if let Some(slot) = state.slots.iter_mut().find(|s| {
            s.in_use() && s.credentials == *credentials && s.is_valid(&self.config, now)
        }) {
            return Checkout::Leased(self.lease(slot, now));
        }

        // Make room by evicting an idle connection bound to somebody else (or expired).
        if let Some(i) = state.slots.iter().position(|s| !s.in_use()) {
            let slot = state.slots.swap_remove(i);
            self.counters.total.fetch_sub(1, Ordering::SeqCst);
            state.pending += 1;
            debug!("Evicting idle connection {} bound as {}", slot.id, slot.credentials);
            return Checkout::Dial(Some(slot.conn));
        }

        Checkout::Full
    }

    fn lease(&self, slot: &mut Slot<D::Conn>, now: Instant) -> PooledConnection<D::Conn> {
        if slot.leases == 0 {
            self.counters.busy.fetch_add(1, Ordering::SeqCst);
        }
        slot.leases += 1;
        slot.last_used_at = now;
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);

        PooledConnection {
            id: slot.id,
            conn: slot.conn.clone(),
            credentials: slot.credentials.clone(),
            healthy: true,
        }
    }

    /// Dials into a slot already reserved by `checkout`.
    async fn dial(
        &self,
        credentials: &Credentials,
        deadline: Instant,
    ) -> Result<PooledConnection<D::Conn>> {
        let reservation = Reservation {
            pool: self,
            armed: true,
        };
        let budget = self
            .config
            .connection_timeout
            .min(deadline.saturating_duration_since(Instant::now()));

        let conn = match self.connect(credentials, budget).await {
            Ok(conn) => conn,
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                return Err(e);
            }
        };

        let leased = self.insert(reservation, conn, credentials, true)?;
        info!("Opened pooled connection {} for {credentials}", leased.id);
        Ok(leased)
    }

    async fn connect(&self, credentials: &Credentials, budget: Duration) -> Result<D::Conn> {
        match time::timeout(budget, self.directory.bind(credentials)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => {
                warn!("Failed to bind as {credentials}: {e}");
                Err(e)
            }
            Err(_) => {
                warn!("Timed out binding as {credentials} after {budget:?}");
                Err(Error::ConnectTimeout(budget))
            }
        }
    }

    /// Turns a reservation into a live slot, optionally leased to the caller.
    fn insert(
        &self,
        mut reservation: Reservation<'_, D>,
        conn: D::Conn,
        credentials: &Credentials,
        leased: bool,
    ) -> Result<PooledConnection<D::Conn>> {
        let now = Instant::now();
        let mut state = self.lock();
        state.pending -= 1;
        reservation.armed = false;

        if self.is_closed() {
            drop(state);
            self.spawn_close(conn);
            return Err(Error::PoolClosed);
        }

        let mut slot = Slot {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            conn,
            credentials: credentials.clone(),
            created_at: now,
            last_used_at: now,
            healthy: true,
            leases: 0,
        };
        self.counters.total.fetch_add(1, Ordering::SeqCst);

        let conn = if leased {
            self.lease(&mut slot, now)
        } else {
            PooledConnection {
                id: slot.id,
                conn: slot.conn.clone(),
                credentials: slot.credentials.clone(),
                healthy: true,
            }
        };
        state.slots.push(slot);

        Ok(conn)
    }

    /// Hands a leased connection back. Connections that turned unhealthy or outlived
    /// `max_lifetime` are closed instead of going back to the idle set.
    pub fn release(&self, conn: PooledConnection<D::Conn>) {
        let now = Instant::now();
        let evicted = {
            let mut state = self.lock();
            let Some(i) = state.slots.iter().position(|s| s.id == conn.id) else {
                // The pool was closed while the lease was out.
                debug!("Released connection {} is no longer pooled", conn.id);
                return;
            };

            let slot = &mut state.slots[i];
            slot.leases = slot.leases.saturating_sub(1);
            slot.last_used_at = now;
            if !conn.healthy {
                slot.healthy = false;
            }
            self.counters.active.fetch_sub(1, Ordering::SeqCst);

            if slot.in_use() {
                None
            } else {
                self.counters.busy.fetch_sub(1, Ordering::SeqCst);
                if slot.is_valid(&self.config, now) {
                    None
                } else {
                    let slot = state.slots.swap_remove(i);
                    self.counters.total.fetch_sub(1, Ordering::SeqCst);
                    debug!("Closing expired or unhealthy connection {}", slot.id);
                    Some(slot.conn)
                }
            }
        };

        drop(conn);
        if let Some(conn) = evicted {
            self.spawn_close(conn);
        }
        self.released.notify_waiters();
    }

    fn spawn_close(&self, conn: D::Conn) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let directory = Arc::clone(&self.directory);
                handle.spawn(async move { directory.close(conn).await });
            }
            Err(_) => drop(conn),
        }
    }

    /// Dials service-identity connections until `min_connections` of them are pooled.
    /// Returns the number of connections opened.
    pub async fn warm_up(&self) -> Result<usize> {
        let mut opened = 0;

        loop {
            if self.is_closed() {
                return Ok(opened);
            }

            let reservation = {
                let now = Instant::now();
                let mut state = self.lock();
                let warm = state
                    .slots
                    .iter()
                    .filter(|s| s.credentials.is_service() && s.is_valid(&self.config, now))
                    .count();

                if warm >= self.config.min_connections
                    || state.slots.len() + state.pending >= self.config.max_connections
                {
                    None
                } else {
                    state.pending += 1;
                    Some(Reservation {
                        pool: self,
                        armed: true,
                    })
                }
            };
            let Some(reservation) = reservation else {
                return Ok(opened);
            };

            let conn = self
                .connect(&Credentials::Service, self.config.connection_timeout)
                .await?;
            self.insert(reservation, conn, &Credentials::Service, false)?;
            opened += 1;
            self.released.notify_waiters();
        }
    }

    /// Closes idle connections that are unhealthy, past `max_lifetime` or idle past
    /// `max_idle_time`, then tops the pool back up to `min_connections`. Leased
    /// connections are never touched.
    pub async fn perform_maintenance(&self) {
        if self.is_closed() {
            return;
        }

        let now = Instant::now();
        let expired: Vec<Slot<D::Conn>> = {
            let mut state = self.lock();
            let (expired, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut state.slots)
                .into_iter()
                .partition(|s| {
                    !s.in_use()
                        && (!s.is_valid(&self.config, now) || s.is_idle_expired(&self.config, now))
                });
            state.slots = keep;
            expired
        };

        if !expired.is_empty() {
            debug!("Maintenance closing {} connections", expired.len());
            self.counters
                .total
                .fetch_sub(expired.len(), Ordering::SeqCst);
            for slot in expired {
                self.directory.close(slot.conn).await;
            }
            self.released.notify_waiters();
        }

        match self.warm_up().await {
            Ok(0) => (),
            Ok(n) => debug!("Maintenance opened {n} warm connections"),
            Err(e) => warn!("Failed to keep minimum connections warm: {e}"),
        }
    }

    /// Spawns the periodic maintenance task. It runs until [`ConnectionPool::close`].
    pub fn start_maintenance(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }

        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(pool.config.health_check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => pool.perform_maintenance().await,
                    _ = shutdown.changed() => break,
                }
            }

            debug!("Pool maintenance task stopped");
        });

        let previous = self
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Shuts the pool down: stops maintenance, waits for a running pass to finish, closes
    /// every connection and fails all waiting and future acquisitions with
    /// [`Error::PoolClosed`]. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing connection pool");

        self.shutdown.send_replace(true);
        let handle = self
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Pool maintenance task failed: {e}");
            }
        }

        let slots = std::mem::take(&mut self.lock().slots);
        self.counters.total.store(0, Ordering::SeqCst);
        self.counters.active.store(0, Ordering::SeqCst);
        self.counters.busy.store(0, Ordering::SeqCst);
        self.released.notify_waiters();

        for mut slot in slots {
            slot.healthy = false;
            self.directory.close(slot.conn).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.counters.total.load(Ordering::SeqCst);
        let busy = self.counters.busy.load(Ordering::SeqCst);

        PoolStats {
            total,
            active: self.counters.active.load(Ordering::SeqCst),
            available: total.saturating_sub(busy),
            acquired: self.counters.acquired.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            max: self.config.max_connections,
        }
    }

    #[cfg(test)]
    fn slot_in_use(&self, id: u64) -> Option<bool> {
        self.lock()
            .slots
            .iter()
            .find(|s| s.id == id)
            .map(Slot::in_use)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::directory::mock::MockDirectory;

    fn config(max: usize) -> PoolConfig {
        PoolConfig {
            max_connections: max,
            acquire_timeout: Duration::from_millis(200),
            ..PoolConfig::default()
        }
    }

    fn pool(max: usize) -> (Arc<MockDirectory>, Arc<ConnectionPool<MockDirectory>>) {
        let directory = Arc::new(MockDirectory::new());
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&directory), config(max)));
        (directory, pool)
    }

    fn alice() -> Credentials {
        Credentials::new("uid=alice,ou=people,dc=example,dc=org", "alice-pw")
    }

    fn bob() -> Credentials {
        Credentials::new("uid=bob,ou=people,dc=example,dc=org", "bob-pw")
    }

    #[tokio::test]
    async fn reuses_connection_for_same_credentials() {
        let (directory, pool) = pool(10);

        let first = pool.acquire(&alice()).await.unwrap();
        let id = first.id();
        pool.release(first);

        let second = pool.acquire(&alice()).await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(directory.binds.load(Ordering::SeqCst), 1);
        pool.release(second);
    }

    #[tokio::test]
    async fn never_shares_across_credentials() {
        let (_directory, pool) = pool(10);
        let pairs = [
            (alice(), bob()),
            (Credentials::Service, alice()),
            (alice(), Credentials::new("uid=alice,ou=people,dc=example,dc=org", "wrong")),
        ];

        for (a, b) in pairs {
            let conn = pool.acquire(&a).await.unwrap();
            let id = conn.id();
            pool.release(conn);

            let other = pool.acquire(&b).await.unwrap();
            assert_ne!(other.id(), id);
            assert_eq!(other.credentials(), &b);
            pool.release(other);
        }
    }

    #[tokio::test]
    async fn service_sentinel_matches_itself() {
        let (directory, pool) = pool(10);

        let conn = pool.acquire(&Credentials::new("", "")).await.unwrap();
        pool.release(conn);
        let conn = pool.acquire(&Credentials::Service).await.unwrap();
        pool.release(conn);

        assert_eq!(directory.binds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_shares_same_identity_and_times_out_others() {
        let (directory, pool) = pool(1);

        let first = pool.acquire(&alice()).await.unwrap();
        let second = pool.acquire(&alice()).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(directory.binds.load(Ordering::SeqCst), 1);

        let err = pool.acquire(&bob()).await.unwrap_err();
        assert!(matches!(err, Error::AcquireTimeout(_)));
        assert_eq!(pool.stats().failed, 1);

        pool.release(first);
        pool.release(second);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_capacity_after_release() {
        let (_directory, pool) = pool(1);
        let held = pool.acquire(&alice()).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&bob()).await })
        };
        time::sleep(Duration::from_millis(50)).await;
        pool.release(held);

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(conn.credentials(), &bob());
        assert_eq!(pool.stats().total, 1);
        pool.release(conn);
    }

    #[tokio::test]
    async fn release_decrements_active_and_clears_in_use() {
        let (_directory, pool) = pool(10);

        let conn = pool.acquire(&alice()).await.unwrap();
        let id = conn.id();
        assert_eq!(pool.stats().active, 1);
        assert_eq!(pool.slot_in_use(id), Some(true));

        pool.release(conn);
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.available, 1);
        assert_eq!(pool.slot_in_use(id), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_connection_is_never_reused() {
        let (_directory, pool) = pool(10);

        let conn = pool.acquire(&alice()).await.unwrap();
        let id = conn.id();
        pool.release(conn);

        time::advance(pool.config().max_lifetime + Duration::from_secs(1)).await;

        let conn = pool.acquire(&alice()).await.unwrap();
        assert_ne!(conn.id(), id);
        pool.release(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_past_lifetime_is_closed_on_release() {
        let (_directory, pool) = pool(10);

        let conn = pool.acquire(&alice()).await.unwrap();
        let id = conn.id();
        time::advance(pool.config().max_lifetime + Duration::from_secs(1)).await;
        pool.release(conn);

        assert_eq!(pool.slot_in_use(id), None);
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn unhealthy_connection_is_closed_on_release() {
        let (_directory, pool) = pool(10);

        let mut conn = pool.acquire(&alice()).await.unwrap();
        let id = conn.id();
        conn.mark_unhealthy();
        pool.release(conn);

        assert_eq!(pool.slot_in_use(id), None);
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_evicts_idle_but_not_leased_connections() {
        let (directory, pool) = pool(10);

        let held = pool.acquire(&alice()).await.unwrap();
        let idle = pool.acquire(&bob()).await.unwrap();
        pool.release(idle);

        time::advance(pool.config().max_lifetime + Duration::from_secs(1)).await;
        pool.perform_maintenance().await;

        assert_eq!(pool.stats().total, 1);
        assert_eq!(pool.slot_in_use(held.id()), Some(true));
        assert_eq!(directory.closes.load(Ordering::SeqCst), 1);
        pool.release(held);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_expired_connection_is_replaced_then_swept() {
        let (directory, pool) = pool(10);

        let conn = pool.acquire(&alice()).await.unwrap();
        let stale = conn.id();
        pool.release(conn);
        let conn = pool.acquire(&bob()).await.unwrap();
        let idle = conn.id();
        pool.release(conn);

        time::advance(pool.config().max_idle_time + Duration::from_secs(1)).await;

        let fresh = pool.acquire(&alice()).await.unwrap();
        assert_ne!(fresh.id(), stale);
        assert_eq!(pool.stats().total, 3);

        pool.perform_maintenance().await;
        assert_eq!(pool.slot_in_use(stale), None);
        assert_eq!(pool.slot_in_use(idle), None);
        assert_eq!(pool.slot_in_use(fresh.id()), Some(true));
        assert_eq!(pool.stats().total, 1);
        assert_eq!(directory.closes.load(Ordering::SeqCst), 2);
        pool.release(fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_deadline_cuts_the_wait_short() {
        let (_directory, pool) = pool(1);
        let held = pool.acquire(&alice()).await.unwrap();

        let started = Instant::now();
        let err = pool
            .acquire_until(&bob(), started + Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AcquireTimeout(waited) if waited == Duration::from_millis(50)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < pool.config().acquire_timeout);
        pool.release(held);
    }

    #[tokio::test]
    async fn dial_failure_is_counted_and_frees_the_slot() {
        let (directory, pool) = pool(1);

        directory.fail_binds.store(true, Ordering::SeqCst);
        let err = pool.acquire(&alice()).await.unwrap_err();
        assert!(matches!(err, Error::Dial(_)));
        assert_eq!(pool.stats().failed, 1);

        directory.fail_binds.store(false, Ordering::SeqCst);
        let conn = pool.acquire(&alice()).await.unwrap();
        pool.release(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_bind_fails_with_connect_timeout() {
        let (directory, pool) = pool(1);
        *directory.bind_delay.lock().unwrap() = Some(Duration::from_secs(60));

        let err = pool.acquire(&alice()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout(_)));
        assert_eq!(pool.stats().total, 0);
        assert_eq!(pool.lock().pending, 0);
    }

    #[tokio::test]
    async fn warm_up_opens_min_service_connections() {
        let directory = Arc::new(MockDirectory::new());
        let pool = ConnectionPool::new(
            Arc::clone(&directory),
            PoolConfig {
                max_connections: 4,
                min_connections: 2,
                ..PoolConfig::default()
            },
        );

        assert_eq!(pool.warm_up().await.unwrap(), 2);
        assert_eq!(pool.warm_up().await.unwrap(), 0);
        assert_eq!(pool.stats().available, 2);

        let conn = pool.acquire(&Credentials::Service).await.unwrap();
        assert_eq!(directory.binds.load(Ordering::SeqCst), 2);
        pool.release(conn);
    }

    #[tokio::test]
    async fn acquire_after_close_fails_and_close_is_idempotent() {
        let (directory, pool) = pool(10);

        let conn = pool.acquire(&alice()).await.unwrap();
        pool.release(conn);

        pool.close().await;
        pool.close().await;
        pool.close().await;

        assert!(matches!(
            pool.acquire(&alice()).await.unwrap_err(),
            Error::PoolClosed
        ));
        assert_eq!(directory.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_wakes_waiters_with_pool_closed() {
        let (_directory, pool) = pool(1);
        let held = pool.acquire(&alice()).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&bob()).await })
        };
        time::sleep(Duration::from_millis(10)).await;
        pool.close().await;

        assert!(matches!(waiter.await.unwrap(), Err(Error::PoolClosed)));
        // releasing a lease after close is harmless
        pool.release(held);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_task_stops_on_close() {
        let directory = Arc::new(MockDirectory::new());
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&directory),
            PoolConfig {
                min_connections: 1,
                ..PoolConfig::default()
            },
        ));

        pool.start_maintenance();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().total, 1);

        pool.close().await;
        assert!(pool.maintenance.lock().unwrap().is_none());
        assert_eq!(directory.closes.load(Ordering::SeqCst), 1);
    }
}
