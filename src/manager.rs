//! Scoped access to the connection pool.
//!
//! Most call sites should go through [`PoolManager::with_client`], which guarantees the
//! connection is returned to the pool on every exit path.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::time::{self, Instant};

use crate::config::PoolConfig;
use crate::directory::{Credentials, Directory, Entry, MembershipChange};
use crate::entries::{Computer, DirectoryEntity, EntityKind, Group, User};
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PoolStats, PooledConnection};

/// Future returned by the operation passed to [`PoolManager::with_client`].
pub type ClientFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>;

/// Callers act as themselves only. The service identity is reserved for
/// [`PoolManager::service_client`], and an empty DN or password would bind anonymously.
fn require_user(credentials: &Credentials) -> Result<()> {
    match credentials {
        Credentials::Service => Err(Error::InvalidCredentials(credentials.to_string())),
        Credentials::Bind { dn, password } if dn.is_empty() || password.is_empty() => {
            Err(Error::InvalidCredentials(dn.clone()))
        }
        Credentials::Bind { .. } => Ok(()),
    }
}

pub struct PoolManager<D: Directory> {
    pool: Arc<ConnectionPool<D>>,
}

impl<D: Directory> Clone for PoolManager<D> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<D: Directory> PoolManager<D> {
    pub fn new(directory: D, config: PoolConfig) -> Self {
        Self::from_pool(Arc::new(ConnectionPool::new(Arc::new(directory), config)))
    }

    pub fn from_pool(pool: Arc<ConnectionPool<D>>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<D>> {
        &self.pool
    }

    /// Warms the pool up and starts its maintenance task. A failing warm-up is logged,
    /// maintenance keeps retrying.
    pub async fn start(&self) {
        if let Err(e) = self.pool.warm_up().await {
            warn!("Initial pool warm-up failed: {e}");
        }
        self.pool.start_maintenance();
    }

    async fn checkout(
        &self,
        credentials: Credentials,
        deadline: Option<Instant>,
    ) -> Result<ScopedClient<D>> {
        let conn = match deadline {
            Some(deadline) => self.pool.acquire_until(&credentials, deadline).await?,
            None => self.pool.acquire(&credentials).await?,
        };

        Ok(ScopedClient {
            pool: Some(Arc::clone(&self.pool)),
            conn: Some(conn),
            deadline,
        })
    }

    /// A client bound as the given user. Empty DNs or passwords are rejected.
    pub async fn with_credentials(&self, dn: &str, password: &str) -> Result<ScopedClient<D>> {
        self.client(Credentials::new(dn, password)).await
    }

    /// Like [`PoolManager::with_credentials`]; acquiring and every operation on the
    /// client give up at `deadline`.
    pub async fn with_credentials_until(
        &self,
        dn: &str,
        password: &str,
        deadline: Instant,
    ) -> Result<ScopedClient<D>> {
        self.client_until(Credentials::new(dn, password), deadline)
            .await
    }

    /// A client bound as the service identity.
    pub async fn service_client(&self) -> Result<ScopedClient<D>> {
        self.checkout(Credentials::Service, None).await
    }

    pub async fn client(&self, credentials: Credentials) -> Result<ScopedClient<D>> {
        require_user(&credentials)?;
        self.checkout(credentials, None).await
    }

    pub async fn client_until(
        &self,
        credentials: Credentials,
        deadline: Instant,
    ) -> Result<ScopedClient<D>> {
        require_user(&credentials)?;
        self.checkout(credentials, Some(deadline)).await
    }

    /// Acquires a client for `credentials`, runs `op` with it and releases the connection
    /// afterwards, whether `op` succeeded, failed or panicked.
    pub async fn with_client<T, F>(&self, credentials: Credentials, op: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut ScopedClient<D>) -> ClientFuture<'c, T>,
    {
        let client = self.client(credentials).await?;
        Self::run(client, op).await
    }

    pub async fn with_client_until<T, F>(
        &self,
        credentials: Credentials,
        deadline: Instant,
        op: F,
    ) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut ScopedClient<D>) -> ClientFuture<'c, T>,
    {
        let client = self.client_until(credentials, deadline).await?;
        Self::run(client, op).await
    }

    async fn run<T, F>(mut client: ScopedClient<D>, op: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut ScopedClient<D>) -> ClientFuture<'c, T>,
    {
        let result = op(&mut client).await;
        client.close();

        result
    }

    /// Verifies a password by binding with it through the pool.
    pub async fn check_password(&self, dn: &str, password: &str) -> Result<()> {
        let mut client = self.with_credentials(dn, password).await?;
        client.close();
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// A client bound to exactly one pooled connection.
///
/// The connection goes back to the pool on [`ScopedClient::close`] or on drop. Any
/// operation after close fails with [`Error::ClientClosed`]. Each operation is bounded by
/// the pool's `connection_timeout` and, if one was given, the caller's deadline.
pub struct ScopedClient<D: Directory> {
    pool: Option<Arc<ConnectionPool<D>>>,
    conn: Option<PooledConnection<D::Conn>>,
    deadline: Option<Instant>,
}

impl<D: Directory> ScopedClient<D> {
    /// `None` once closed.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.conn.as_ref().map(PooledConnection::credentials)
    }

    /// Releases the connection. Calling it again does nothing.
    pub fn close(&mut self) {
        if let (Some(pool), Some(conn)) = (self.pool.take(), self.conn.take()) {
            pool.release(conn);
        }
    }

    pub async fn search(&mut self, kind: EntityKind) -> Result<Vec<Entry>> {
        let deadline = self.operation_deadline();
        let (pool, conn) = self.parts()?;
        let directory = Arc::clone(pool.directory());
        let result = bounded(deadline, directory.search(conn.conn_mut(), kind)).await;

        self.observe(result)
    }

    async fn search_entities<T: DirectoryEntity>(&mut self) -> Result<Vec<T>> {
        let entries = self.search(T::KIND).await?;

        Ok(entries.iter().map(T::from_entry).collect())
    }

    pub async fn search_users(&mut self) -> Result<Vec<User>> {
        self.search_entities().await
    }

    pub async fn search_groups(&mut self) -> Result<Vec<Group>> {
        self.search_entities().await
    }

    pub async fn search_computers(&mut self) -> Result<Vec<Computer>> {
        self.search_entities().await
    }

    pub async fn modify_group_membership(
        &mut self,
        user_dn: &str,
        group_dn: &str,
        change: MembershipChange,
    ) -> Result<()> {
        let deadline = self.operation_deadline();
        let (pool, conn) = self.parts()?;
        let directory = Arc::clone(pool.directory());
        let result = bounded(
            deadline,
            directory.modify_group_membership(conn.conn_mut(), user_dn, group_dn, change),
        )
        .await;

        self.observe(result)
    }

    pub async fn add_user_to_group(&mut self, user_dn: &str, group_dn: &str) -> Result<()> {
        self.modify_group_membership(user_dn, group_dn, MembershipChange::Add)
            .await
    }

    pub async fn remove_user_from_group(&mut self, user_dn: &str, group_dn: &str) -> Result<()> {
        self.modify_group_membership(user_dn, group_dn, MembershipChange::Remove)
            .await
    }

    fn operation_deadline(&self) -> Instant {
        let timeout = self
            .pool
            .as_ref()
            .map(|pool| pool.config().connection_timeout)
            .unwrap_or_default();
        let deadline = Instant::now() + timeout;

        self.deadline.map_or(deadline, |d| d.min(deadline))
    }

    fn parts(&mut self) -> Result<(&Arc<ConnectionPool<D>>, &mut PooledConnection<D::Conn>)> {
        match (self.pool.as_ref(), self.conn.as_mut()) {
            (Some(pool), Some(conn)) => Ok((pool, conn)),
            _ => Err(Error::ClientClosed),
        }
    }

    // A connection-level failure poisons the connection for everybody else.
    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_connection_error() {
                if let Some(conn) = self.conn.as_mut() {
                    warn!("Marking connection {} unhealthy: {e}", conn.id());
                    conn.mark_unhealthy();
                }
            }
        }

        result
    }
}

async fn bounded<T>(deadline: Instant, op: impl Future<Output = Result<T>>) -> Result<T> {
    let started = Instant::now();

    match time::timeout_at(deadline, op).await {
        Ok(result) => result,
        Err(_) => Err(Error::OperationTimeout(
            deadline.saturating_duration_since(started),
        )),
    }
}

impl<D: Directory> Drop for ScopedClient<D> {
    fn drop(&mut self) {
        self.close();
    }
}
