//! Background-refreshed caches of users, groups and computers.
//!
//! The [`CacheManager`] owns one [`DirectoryCache`] per entity type and keeps them fresh
//! from a single background task that searches the directory as the service identity.
//! Reads never touch the directory. A failed refresh keeps the last good snapshot
//! and only shows up in the health status.
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::cache::DirectoryCache;
use crate::config::CacheConfig;
use crate::directory::{Credentials, Directory};
use crate::entries::{
    normalize_dn, same_dn, Computer, DirectoryEntity, EntityKind, FullComputer, FullGroup,
    FullUser, Group, User,
};
use crate::error::{Error, Result};
use crate::manager::PoolManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

/// One value per entity type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PerKind<T> {
    pub users: T,
    pub groups: T,
    pub computers: T,
}

impl<T: Copy> PerKind<T> {
    fn from_fn(f: impl Fn(EntityKind) -> T) -> Self {
        Self {
            users: f(EntityKind::User),
            groups: f(EntityKind::Group),
            computers: f(EntityKind::Computer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub warmed_up: bool,
    /// Consecutive refresh failures.
    pub failures: PerKind<u32>,
    pub entities: PerKind<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub uptime: Duration,
    pub refresh_count: u64,
    pub failed_refreshes: u64,
    pub last_refresh_duration: PerKind<Option<Duration>>,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entities: PerKind<usize>,
}

pub struct CacheManager<D: Directory> {
    pool: PoolManager<D>,
    config: CacheConfig,
    users: DirectoryCache<User>,
    groups: DirectoryCache<Group>,
    computers: DirectoryCache<Computer>,
    warmed_up: AtomicBool,
    refreshed: [AtomicBool; 3],
    failures: [AtomicU32; 3],
    refresh_count: AtomicU64,
    failed_refreshes: AtomicU64,
    last_refresh: Mutex<[Option<Duration>; 3]>,
    started_at: Instant,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Directory> CacheManager<D> {
    pub fn new(pool: PoolManager<D>, config: CacheConfig) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            pool,
            config: config.normalize(),
            users: DirectoryCache::new(),
            groups: DirectoryCache::new(),
            computers: DirectoryCache::new(),
            warmed_up: AtomicBool::new(false),
            refreshed: Default::default(),
            failures: Default::default(),
            refresh_count: AtomicU64::new(0),
            failed_refreshes: AtomicU64::new(0),
            last_refresh: Mutex::new([None; 3]),
            started_at: Instant::now(),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &PoolManager<D> {
        &self.pool
    }

    /// Reloads one entity type from the directory. On failure the cached snapshot is
    /// left untouched and the failure is counted.
    pub async fn refresh(&self, kind: EntityKind) -> Result<()> {
        let started = Instant::now();
        let result = match kind {
            EntityKind::User => self.reload(&self.users).await,
            EntityKind::Group => self.reload(&self.groups).await,
            EntityKind::Computer => self.reload(&self.computers).await,
        };
        let elapsed = started.elapsed();
        let i = kind.index();

        match result {
            Ok(count) => {
                self.refresh_count.fetch_add(1, Ordering::Relaxed);
                self.last_refresh.lock().unwrap_or_else(|e| e.into_inner())[i] = Some(elapsed);
                let previous = self.failures[i].swap(0, Ordering::SeqCst);
                if previous > 0 {
                    info!("{kind} cache recovered after {previous} failed refreshes");
                }
                debug!("Refreshed {count} {kind} entries in {}ms", elapsed.as_millis());

                self.refreshed[i].store(true, Ordering::SeqCst);
                if self.refreshed.iter().all(|r| r.load(Ordering::SeqCst))
                    && !self.warmed_up.swap(true, Ordering::SeqCst)
                {
                    info!("Directory cache warmed up");
                }
                Ok(())
            }
            Err(e) => {
                self.failed_refreshes.fetch_add(1, Ordering::Relaxed);
                let failures = self.failures[i].fetch_add(1, Ordering::SeqCst) + 1;
                warn!("Refreshing {kind} cache failed ({failures} in a row): {e}");
                Err(Error::Refresh {
                    kind,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn reload<T: DirectoryEntity>(&self, cache: &DirectoryCache<T>) -> Result<usize> {
        let mut client = self.pool.service_client().await?;
        let entries = client.search(T::KIND).await;
        client.close();

        let entities: Vec<T> = entries?.iter().map(T::from_entry).collect();
        let count = entities.len();
        cache.replace(entities);

        Ok(count)
    }

    pub async fn refresh_users(&self) -> Result<()> {
        self.refresh(EntityKind::User).await
    }

    pub async fn refresh_groups(&self) -> Result<()> {
        self.refresh(EntityKind::Group).await
    }

    pub async fn refresh_computers(&self) -> Result<()> {
        self.refresh(EntityKind::Computer).await
    }

    /// Refreshes users, groups and computers in that order. Every type is attempted; the
    /// first failure is returned.
    pub async fn refresh_all(&self) -> Result<()> {
        let mut first_error = None;

        for kind in EntityKind::ALL {
            if let Err(e) = self.refresh(kind).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Spawns the refresh loop: one pass immediately, then one every `refresh_interval`
    /// until [`CacheManager::close`].
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(manager.config.refresh_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "Starting directory cache refresh every {}s",
                manager.config.refresh_interval.as_secs()
            );

            loop {
                if *shutdown.borrow() {
                    break;
                }
                // A pass in flight is abandoned on shutdown; its leases go back on drop.
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = async {
                        interval.tick().await;
                        // failures are already logged and counted per type
                        let _ = manager.refresh_all().await;
                    } => {}
                }
            }

            debug!("Directory cache refresh task stopped");
        });

        let previous = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stops the refresh loop, cancelling a running pass. The pool is left open since
    /// other callers may share it; close it afterwards.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Directory cache refresh task failed: {e}");
            }
        }
    }

    pub fn find_user_by_dn(&self, dn: &str) -> Result<Arc<User>> {
        self.users.find_by_dn(dn)
    }

    pub fn find_user_by_sam_account_name(&self, name: &str) -> Result<Arc<User>> {
        self.users.find_by_account_name(name)
    }

    /// All users in directory order; disabled accounts only when `show_disabled`.
    pub fn find_users(&self, show_disabled: bool) -> Vec<Arc<User>> {
        self.users.find_all(|u| show_disabled || u.enabled)
    }

    pub fn find_group_by_dn(&self, dn: &str) -> Result<Arc<Group>> {
        self.groups.find_by_dn(dn)
    }

    pub fn find_group_by_sam_account_name(&self, name: &str) -> Result<Arc<Group>> {
        self.groups.find_by_account_name(name)
    }

    pub fn find_groups(&self) -> Vec<Arc<Group>> {
        self.groups.all()
    }

    pub fn find_computer_by_dn(&self, dn: &str) -> Result<Arc<Computer>> {
        self.computers.find_by_dn(dn)
    }

    pub fn find_computer_by_sam_account_name(&self, name: &str) -> Result<Arc<Computer>> {
        self.computers.find_by_account_name(name)
    }

    pub fn find_computers(&self, show_disabled: bool) -> Vec<Arc<Computer>> {
        self.computers.find_all(|c| show_disabled || c.enabled)
    }

    /// Groups that list `dn` as a member or that `member_of` points at, in cache order.
    fn groups_of(&self, dn: &str, member_of: &[String]) -> Vec<Group> {
        self.groups
            .snapshot()
            .entities()
            .iter()
            .filter(|g| g.has_member(dn) || member_of.iter().any(|m| same_dn(m, &g.dn)))
            .map(|g| Group::clone(g))
            .collect()
    }

    pub fn populate_groups_for_user(&self, user: &User) -> FullUser {
        FullUser {
            user: user.clone(),
            groups: self.groups_of(&user.dn, &user.member_of),
        }
    }

    pub fn populate_groups_for_computer(&self, computer: &Computer) -> FullComputer {
        FullComputer {
            computer: computer.clone(),
            groups: self.groups_of(&computer.dn, &computer.member_of),
        }
    }

    /// Resolves a group's members against the user and computer caches. Users and
    /// computers whose `memberOf` names the group count as members too.
    pub fn populate_members_for_group(&self, group: &Group) -> FullGroup {
        let users = self.users.snapshot();
        let computers = self.computers.snapshot();
        let mut seen = HashSet::new();
        let mut full = FullGroup {
            group: group.clone(),
            users: Vec::new(),
            computers: Vec::new(),
            unresolved: Vec::new(),
        };

        for member in &group.members {
            if !seen.insert(normalize_dn(member)) {
                continue;
            }
            if let Some(user) = users.get_by_dn(member) {
                full.users.push(User::clone(user));
            } else if let Some(computer) = computers.get_by_dn(member) {
                full.computers.push(Computer::clone(computer));
            } else {
                full.unresolved.push(member.clone());
            }
        }

        let points_here = |member_of: &[String]| member_of.iter().any(|m| same_dn(m, &group.dn));
        for user in users.entities() {
            if points_here(&user.member_of) && seen.insert(normalize_dn(&user.dn)) {
                full.users.push(User::clone(user));
            }
        }
        for computer in computers.entities() {
            if points_here(&computer.member_of) && seen.insert(normalize_dn(&computer.dn)) {
                full.computers.push(Computer::clone(computer));
            }
        }

        full
    }

    /// Mirrors a membership addition that already succeeded against the directory.
    pub fn on_add_user_to_group(&self, user_dn: &str, group_dn: &str) {
        let group_found = self.groups.update(group_dn, |g| {
            if !g.has_member(user_dn) {
                g.members.push(user_dn.to_owned());
            }
        });

        let add_back_link = |member_of: &mut Vec<String>| {
            if !member_of.iter().any(|m| same_dn(m, group_dn)) {
                member_of.push(group_dn.to_owned());
            }
        };
        let member_found = self.users.update(user_dn, |u| add_back_link(&mut u.member_of))
            || self
                .computers
                .update(user_dn, |c| add_back_link(&mut c.member_of));

        if !group_found || !member_found {
            debug!("Optimistic add of {user_dn} to {group_dn} only partly applied, next refresh will catch up");
        }
    }

    /// Mirrors a membership removal that already succeeded against the directory.
    pub fn on_remove_user_from_group(&self, user_dn: &str, group_dn: &str) {
        let group_found = self
            .groups
            .update(group_dn, |g| g.members.retain(|m| !same_dn(m, user_dn)));

        let drop_back_link =
            |member_of: &mut Vec<String>| member_of.retain(|m| !same_dn(m, group_dn));
        let member_found = self.users.update(user_dn, |u| drop_back_link(&mut u.member_of))
            || self
                .computers
                .update(user_dn, |c| drop_back_link(&mut c.member_of));

        if !group_found || !member_found {
            debug!("Optimistic removal of {user_dn} from {group_dn} only partly applied, next refresh will catch up");
        }
    }

    /// Adds `user_dn` to `group_dn` in the directory, bound as `acting`, and mirrors the
    /// change into the cache.
    pub async fn add_user_to_group(
        &self,
        acting: Credentials,
        user_dn: &str,
        group_dn: &str,
    ) -> Result<()> {
        let (user, group) = (user_dn.to_owned(), group_dn.to_owned());
        self.pool
            .with_client(acting, |client| {
                Box::pin(async move { client.add_user_to_group(&user, &group).await })
            })
            .await?;

        info!("Added {user_dn} to {group_dn}");
        self.on_add_user_to_group(user_dn, group_dn);
        Ok(())
    }

    pub async fn remove_user_from_group(
        &self,
        acting: Credentials,
        user_dn: &str,
        group_dn: &str,
    ) -> Result<()> {
        let (user, group) = (user_dn.to_owned(), group_dn.to_owned());
        self.pool
            .with_client(acting, |client| {
                Box::pin(async move { client.remove_user_from_group(&user, &group).await })
            })
            .await?;

        info!("Removed {user_dn} from {group_dn}");
        self.on_remove_user_from_group(user_dn, group_dn);
        Ok(())
    }

    pub fn is_warmed_up(&self) -> bool {
        self.warmed_up.load(Ordering::SeqCst)
    }

    pub fn health_status(&self) -> HealthStatus {
        let worst = self
            .failures
            .iter()
            .map(|f| f.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0);

        if worst == 0 {
            HealthStatus::Healthy
        } else if worst >= self.config.unhealthy_threshold {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health_status() == HealthStatus::Healthy
    }

    fn entity_counts(&self) -> PerKind<usize> {
        PerKind {
            users: self.users.snapshot().len(),
            groups: self.groups.snapshot().len(),
            computers: self.computers.snapshot().len(),
        }
    }

    pub fn health_check(&self) -> HealthCheck {
        HealthCheck {
            status: self.health_status(),
            warmed_up: self.is_warmed_up(),
            failures: PerKind::from_fn(|k| self.failures[k.index()].load(Ordering::SeqCst)),
            entities: self.entity_counts(),
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        let last_refresh = *self.last_refresh.lock().unwrap_or_else(|e| e.into_inner());
        let hits = self.users.hits() + self.groups.hits() + self.computers.hits();
        let misses = self.users.misses() + self.groups.misses() + self.computers.misses();
        let lookups = hits + misses;

        CacheMetrics {
            uptime: self.started_at.elapsed(),
            refresh_count: self.refresh_count.load(Ordering::Relaxed),
            failed_refreshes: self.failed_refreshes.load(Ordering::Relaxed),
            last_refresh_duration: PerKind::from_fn(|k| last_refresh[k.index()]),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            entities: self.entity_counts(),
        }
    }
}
