//! Pooled LDAP connections and in-memory caches of directory users, groups and computers.
//!
//! [`pool::ConnectionPool`] keeps bound connections keyed by credentials,
//! [`manager::PoolManager`] hands them out as scoped clients, and
//! [`cache_manager::CacheManager`] keeps the caches fresh from a background task.
#[macro_use]
extern crate log;

pub mod cache;
pub mod cache_manager;
pub mod cli;
pub mod config;
pub mod directory;
pub mod entries;
pub mod error;
pub mod ldap;
pub mod manager;
pub mod pool;

pub use cache::DirectoryCache;
pub use cache_manager::{CacheManager, HealthStatus};
pub use directory::{Credentials, Directory};
pub use entries::{Computer, EntityKind, Group, User};
pub use error::{Error, Result};
pub use ldap::LdapDirectory;
pub use manager::{PoolManager, ScopedClient};
pub use pool::ConnectionPool;
