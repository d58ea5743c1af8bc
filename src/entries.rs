//! Directory entities held by the cache, and the derived "full" views produced by
//! relationship population.
use std::fmt;

use serde::Serialize;

use crate::directory::Entry;

/// `userAccountControl` flag marking a disabled account.
const ACCOUNTDISABLE: u32 = 0x0002;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Group,
    Computer,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::User, EntityKind::Group, EntityKind::Computer];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Group => "group",
            EntityKind::Computer => "computer",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            EntityKind::User => 0,
            EntityKind::Group => 1,
            EntityKind::Computer => 2,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common surface of everything a [`crate::cache::DirectoryCache`] can hold.
pub trait DirectoryEntity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn from_entry(entry: &Entry) -> Self;

    fn dn(&self) -> &str;

    /// The short account name, if the entity has one.
    fn account_name(&self) -> Option<&str>;

    fn enabled(&self) -> bool {
        true
    }
}

/// Lowercased, trimmed DN used as index key and for membership comparisons.
pub fn normalize_dn(dn: &str) -> String {
    dn.trim().to_lowercase()
}

pub(crate) fn same_dn(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn account_name(entry: &Entry) -> Option<String> {
    entry
        .first("sAMAccountName")
        .or_else(|| entry.first("uid"))
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn account_enabled(entry: &Entry) -> bool {
    entry
        .first("userAccountControl")
        .and_then(|v| v.parse::<u32>().ok())
        .map(|uac| uac & ACCOUNTDISABLE == 0)
        .unwrap_or(true)
}

fn optional(entry: &Entry, attribute: &str) -> Option<String> {
    entry.first(attribute).map(str::to_owned)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub dn: String,
    pub account_name: Option<String>,
    pub display_name: Option<String>,
    pub mail: Option<String>,
    pub enabled: bool,
    /// `memberOf` back-links as reported by the directory.
    pub member_of: Vec<String>,
}

impl DirectoryEntity for User {
    const KIND: EntityKind = EntityKind::User;

    fn from_entry(entry: &Entry) -> Self {
        Self {
            dn: entry.dn.clone(),
            account_name: account_name(entry),
            display_name: optional(entry, "displayName").or_else(|| optional(entry, "cn")),
            mail: optional(entry, "mail"),
            enabled: account_enabled(entry),
            member_of: entry.values("memberOf").to_vec(),
        }
    }

    fn dn(&self) -> &str {
        &self.dn
    }

    fn account_name(&self) -> Option<&str> {
        self.account_name.as_deref()
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub dn: String,
    pub account_name: Option<String>,
    pub name: String,
    pub description: Option<String>,
    /// Member DNs, users and computers (and nested groups) alike.
    pub members: Vec<String>,
}

impl Group {
    pub fn has_member(&self, dn: &str) -> bool {
        self.members.iter().any(|m| same_dn(m, dn))
    }
}

impl DirectoryEntity for Group {
    const KIND: EntityKind = EntityKind::Group;

    fn from_entry(entry: &Entry) -> Self {
        let mut members = entry.values("member").to_vec();
        members.extend(entry.values("uniqueMember").iter().cloned());

        Self {
            dn: entry.dn.clone(),
            account_name: account_name(entry),
            name: entry
                .first("cn")
                .map(str::to_owned)
                .unwrap_or_else(|| entry.dn.clone()),
            description: optional(entry, "description"),
            members,
        }
    }

    fn dn(&self) -> &str {
        &self.dn
    }

    fn account_name(&self) -> Option<&str> {
        self.account_name.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Computer {
    pub dn: String,
    pub account_name: Option<String>,
    pub dns_host_name: Option<String>,
    pub operating_system: Option<String>,
    pub enabled: bool,
    pub member_of: Vec<String>,
}

impl DirectoryEntity for Computer {
    const KIND: EntityKind = EntityKind::Computer;

    fn from_entry(entry: &Entry) -> Self {
        Self {
            dn: entry.dn.clone(),
            account_name: account_name(entry),
            dns_host_name: optional(entry, "dNSHostName"),
            operating_system: optional(entry, "operatingSystem"),
            enabled: account_enabled(entry),
            member_of: entry.values("memberOf").to_vec(),
        }
    }

    fn dn(&self) -> &str {
        &self.dn
    }

    fn account_name(&self) -> Option<&str> {
        self.account_name.as_deref()
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}

/// A user together with its resolved groups. Derived, never stored in a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FullUser {
    #[serde(flatten)]
    pub user: User,
    pub groups: Vec<Group>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FullComputer {
    #[serde(flatten)]
    pub computer: Computer,
    pub groups: Vec<Group>,
}

/// A group with its member DNs resolved against the user and computer caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FullGroup {
    #[serde(flatten)]
    pub group: Group,
    pub users: Vec<User>,
    pub computers: Vec<Computer>,
    /// Member DNs found in neither cache (nested groups, foreign principals).
    pub unresolved: Vec<String>,
}
