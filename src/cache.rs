//! Read-optimized snapshot of one entity type.
//!
//! A [`DirectoryCache`] holds an immutable [`Snapshot`] behind a read/write lock. A refresh
//! builds the complete replacement (entity list and both indexes) without holding the
//! lock and then swaps one pointer under a short write lock, so readers see either the
//! old or the new generation in full, never a mix.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::entries::{normalize_dn, DirectoryEntity};
use crate::error::{Error, Result};

/// One generation of cache contents. Indexes map normalized keys to positions in
/// `entities`.
#[derive(Debug)]
pub struct Snapshot<T> {
    entities: Vec<Arc<T>>,
    by_dn: Arc<HashMap<String, usize>>,
    by_account: Arc<HashMap<String, usize>>,
}

impl<T: DirectoryEntity> Snapshot<T> {
    fn empty() -> Self {
        Self {
            entities: Vec::new(),
            by_dn: Arc::default(),
            by_account: Arc::default(),
        }
    }

    fn build(entities: Vec<T>) -> Self {
        let mut kept = Vec::with_capacity(entities.len());
        let mut by_dn = HashMap::with_capacity(entities.len());
        let mut by_account = HashMap::with_capacity(entities.len());

        for entity in entities {
            let dn = normalize_dn(entity.dn());
            if by_dn.contains_key(&dn) {
                warn!("Skipping duplicate {} {}", T::KIND, entity.dn());
                continue;
            }

            let index = kept.len();
            if let Some(name) = entity.account_name() {
                let name = name.to_lowercase();
                if by_account.contains_key(&name) {
                    warn!("Duplicate {} account name {name}, keeping the first", T::KIND);
                } else {
                    by_account.insert(name, index);
                }
            }
            by_dn.insert(dn, index);
            kept.push(Arc::new(entity));
        }

        Self {
            entities: kept,
            by_dn: Arc::new(by_dn),
            by_account: Arc::new(by_account),
        }
    }

    pub fn entities(&self) -> &[Arc<T>] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get_by_dn(&self, dn: &str) -> Option<&Arc<T>> {
        self.by_dn
            .get(&normalize_dn(dn))
            .map(|&i| &self.entities[i])
    }

    pub fn get_by_account_name(&self, name: &str) -> Option<&Arc<T>> {
        self.by_account
            .get(&name.trim().to_lowercase())
            .map(|&i| &self.entities[i])
    }

    /// A copy of this generation with the entity at `index` edited by `f`. The index maps
    /// are shared unless the edit changed a key.
    fn with_edited(&self, index: usize, f: impl Fn(&mut T)) -> Self {
        let previous = &self.entities[index];
        let mut entity = T::clone(previous);
        f(&mut entity);

        let unchanged_keys = normalize_dn(entity.dn()) == normalize_dn(previous.dn())
            && entity.account_name().map(str::to_lowercase)
                == previous.account_name().map(str::to_lowercase);

        let mut entities = self.entities.clone();
        entities[index] = Arc::new(entity);

        if unchanged_keys {
            Snapshot {
                entities,
                by_dn: Arc::clone(&self.by_dn),
                by_account: Arc::clone(&self.by_account),
            }
        } else {
            Snapshot::build(entities.iter().map(|e| T::clone(e)).collect())
        }
    }
}

pub struct DirectoryCache<T> {
    snapshot: RwLock<Arc<Snapshot<T>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T: DirectoryEntity> Default for DirectoryCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DirectoryEntity> DirectoryCache<T> {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::empty())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Arc<Snapshot<T>>> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<Snapshot<T>>> {
        self.snapshot.write().unwrap_or_else(|e| e.into_inner())
    }

    /// The current generation. Holding it does not block refreshes.
    pub fn snapshot(&self) -> Arc<Snapshot<T>> {
        Arc::clone(&self.read())
    }

    /// Replaces the whole contents. Indexes are built before the write lock is taken.
    pub fn replace(&self, entities: Vec<T>) {
        let snapshot = Arc::new(Snapshot::build(entities));
        *self.write() = snapshot;
    }

    fn record<'a>(&self, found: Option<&'a Arc<T>>) -> Option<&'a Arc<T>> {
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn find_by_dn(&self, dn: &str) -> Result<Arc<T>> {
        let snapshot = self.snapshot();
        self.record(snapshot.get_by_dn(dn))
            .cloned()
            .ok_or_else(|| Error::not_found(T::KIND, dn))
    }

    pub fn find_by_account_name(&self, name: &str) -> Result<Arc<T>> {
        let snapshot = self.snapshot();
        self.record(snapshot.get_by_account_name(name))
            .cloned()
            .ok_or_else(|| Error::not_found(T::KIND, name))
    }

    /// Entities matching `predicate`, in directory order.
    pub fn find_all<P>(&self, predicate: P) -> Vec<Arc<T>>
    where
        P: Fn(&T) -> bool,
    {
        self.snapshot()
            .entities()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<T>> {
        self.snapshot().entities().to_vec()
    }

    /// Applies `f` to a copy of the entity with `dn` and publishes a new generation
    /// containing it. Returns `false` if no such entity is cached.
    ///
    /// This is the optimistic-update path. The next generation is built from a snapshot
    /// without holding the lock; if a refresh swapped in meanwhile, the edit is redone
    /// against the newer generation. The next refresh replaces whatever it wrote.
    pub fn update<F>(&self, dn: &str, f: F) -> bool
    where
        F: Fn(&mut T),
    {
        let key = normalize_dn(dn);

        loop {
            let current = self.snapshot();
            let Some(&index) = current.by_dn.get(&key) else {
                return false;
            };
            let next = Arc::new(current.with_edited(index, &f));

            let mut guard = self.write();
            if Arc::ptr_eq(&*guard, &current) {
                *guard = next;
                return true;
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;
    use std::thread;

    use super::*;
    use crate::directory::Entry;
    use crate::entries::User;

    fn user(dn: &str, name: &str, enabled: bool) -> User {
        let uac = if enabled { "512" } else { "514" };
        User::from_entry(
            &Entry::new(dn)
                .with("sAMAccountName", &[name])
                .with("userAccountControl", &[uac]),
        )
    }

    #[test]
    fn indexes_follow_replace() {
        let cache = DirectoryCache::new();
        cache.replace(vec![
            user("CN=Alice,DC=example,DC=org", "alice", true),
            user("CN=Bob,DC=example,DC=org", "bob", true),
        ]);

        assert_eq!(cache.snapshot().len(), 2);
        assert_eq!(cache.find_by_dn("cn=alice,dc=example,dc=org").unwrap().dn, "CN=Alice,DC=example,DC=org");
        assert_eq!(cache.find_by_account_name("BOB").unwrap().dn, "CN=Bob,DC=example,DC=org");

        cache.replace(vec![user("CN=Bob,DC=example,DC=org", "bob", true)]);
        assert!(cache.find_by_dn("CN=Alice,DC=example,DC=org").unwrap_err().is_not_found());
        assert!(cache.find_by_account_name("alice").is_err());
        assert_eq!(cache.snapshot().len(), 1);
    }

    #[test]
    fn lookups_count_hits_and_misses() {
        let cache = DirectoryCache::new();
        cache.replace(vec![user("cn=a", "a", true)]);

        cache.find_by_dn("cn=a").unwrap();
        cache.find_by_account_name("a").unwrap();
        cache.find_by_dn("cn=missing").unwrap_err();

        assert_eq!(cache.hits(), 2);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn duplicates_keep_first_occurrence() {
        let cache = DirectoryCache::new();
        cache.replace(vec![
            user("cn=a", "first", true),
            user("CN=A", "second", true),
        ]);

        assert_eq!(cache.snapshot().len(), 1);
        assert_eq!(cache.find_by_dn("cn=a").unwrap().account_name(), Some("first"));
    }

    #[test]
    fn find_all_filters_in_order_and_never_returns_none() {
        let cache: DirectoryCache<User> = DirectoryCache::new();
        assert!(cache.find_all(|_| true).is_empty());

        cache.replace(vec![
            user("cn=a", "a", true),
            user("cn=b", "b", false),
            user("cn=c", "c", true),
        ]);
        let enabled: Vec<_> = cache
            .find_all(|u| u.enabled)
            .iter()
            .map(|u| u.dn.clone())
            .collect();
        assert_eq!(enabled, vec!["cn=a", "cn=c"]);
    }

    #[test]
    fn update_publishes_new_generation() {
        let cache = DirectoryCache::new();
        cache.replace(vec![user("cn=a", "a", true)]);
        let before = cache.snapshot();

        assert!(cache.update("CN=A", |u| u.member_of.push("cn=admins".into())));
        assert!(!cache.update("cn=missing", |_| unreachable!()));

        assert!(before.get_by_dn("cn=a").unwrap().member_of.is_empty());
        assert_eq!(cache.find_by_dn("cn=a").unwrap().member_of, vec!["cn=admins"]);
        assert_eq!(cache.find_by_account_name("a").unwrap().member_of.len(), 1);
    }

    #[test]
    fn update_reindexes_when_account_name_changes() {
        let cache = DirectoryCache::new();
        cache.replace(vec![user("cn=a", "old", true)]);

        cache.update("cn=a", |u| u.account_name = Some("new".into()));

        assert!(cache.find_by_account_name("old").is_err());
        assert!(cache.find_by_account_name("new").is_ok());
    }

    #[test]
    fn update_redoes_edit_when_a_refresh_lands_first() {
        let cache = Arc::new(DirectoryCache::new());
        cache.replace(vec![user("cn=a", "a", true)]);
        let refreshed = AtomicBool::new(false);

        let updated = cache.update("cn=a", |u| {
            // the first attempt races with a refresh that swaps in a new generation
            if !refreshed.swap(true, Ordering::SeqCst) {
                cache.replace(vec![user("cn=a", "a", false), user("cn=b", "b", true)]);
            }
            u.member_of.push("cn=admins".into());
        });

        assert!(updated);
        let a = cache.find_by_dn("cn=a").unwrap();
        assert!(!a.enabled);
        assert_eq!(a.member_of, vec!["cn=admins"]);
        assert_eq!(cache.snapshot().len(), 2);
    }

    #[test]
    fn readers_never_see_a_torn_snapshot() {
        let cache = Arc::new(DirectoryCache::new());
        let generation = |g: usize| -> Vec<User> {
            (0..50)
                .map(|i| user(&format!("cn=u{i},ou=g{g}"), &format!("g{g}u{i}"), true))
                .collect()
        };
        cache.replace(generation(0));

        let writer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for g in 1..200 {
                    cache.replace(generation(g));
                }
            })
        };

        for _ in 0..2000 {
            let snapshot = cache.snapshot();
            let entities = snapshot.entities();
            assert_eq!(entities.len(), 50);
            for entity in entities {
                let by_dn = snapshot.get_by_dn(&entity.dn).unwrap();
                let by_name = snapshot
                    .get_by_account_name(entity.account_name().unwrap())
                    .unwrap();
                assert!(Arc::ptr_eq(by_dn, entity));
                assert!(Arc::ptr_eq(by_name, entity));
            }
        }

        writer.join().unwrap();
    }
}
