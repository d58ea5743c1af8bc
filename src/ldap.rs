//! [`Directory`] backed by a real LDAP server through `ldap3`.
use std::collections::HashSet;
use std::time::Duration;

use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Mod, Scope, SearchEntry};

use crate::config::LdapConfig;
use crate::directory::{Credentials, Directory, Entry, MembershipChange};
use crate::entries::EntityKind;
use crate::error::{Error, Result};

/// LDAP result code for a rejected simple bind.
const INVALID_CREDENTIALS: u32 = 49;

const USER_ATTRIBUTES: &[&str] = &[
    "sAMAccountName",
    "uid",
    "cn",
    "displayName",
    "mail",
    "userAccountControl",
    "memberOf",
];
const GROUP_ATTRIBUTES: &[&str] = &[
    "sAMAccountName",
    "cn",
    "description",
    "member",
    "uniqueMember",
];
const COMPUTER_ATTRIBUTES: &[&str] = &[
    "sAMAccountName",
    "cn",
    "dNSHostName",
    "operatingSystem",
    "userAccountControl",
    "memberOf",
];

#[derive(Debug, Clone)]
pub struct LdapDirectory {
    config: LdapConfig,
    /// Bounds connecting and every single protocol exchange.
    timeout: Duration,
}

impl LdapDirectory {
    pub fn new(config: LdapConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    fn settings(&self) -> LdapConnSettings {
        LdapConnSettings::new()
            .set_conn_timeout(self.timeout)
            .set_starttls(self.config.starttls())
            .set_no_tls_verify(self.config.no_tls_verify())
    }

    fn filter(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::User => self.config.user_filter(),
            EntityKind::Group => self.config.group_filter(),
            EntityKind::Computer => self.config.computer_filter(),
        }
    }
}

fn attributes(kind: EntityKind) -> Vec<&'static str> {
    match kind {
        EntityKind::User => USER_ATTRIBUTES.to_vec(),
        EntityKind::Group => GROUP_ATTRIBUTES.to_vec(),
        EntityKind::Computer => COMPUTER_ATTRIBUTES.to_vec(),
    }
}

fn bind_error(dn: &str, e: LdapError) -> Error {
    match e {
        LdapError::LdapResult { result } if result.rc == INVALID_CREDENTIALS => {
            Error::InvalidCredentials(dn.to_owned())
        }
        e => Error::Dial(e.to_string()),
    }
}

impl From<SearchEntry> for Entry {
    fn from(entry: SearchEntry) -> Self {
        Self {
            dn: entry.dn,
            attrs: entry.attrs,
        }
    }
}

impl Directory for LdapDirectory {
    type Conn = Ldap;

    async fn bind(&self, credentials: &Credentials) -> Result<Ldap> {
        let (conn, mut ldap) =
            LdapConnAsync::from_url_with_settings(self.settings(), self.config.server())
                .await
                .map_err(|e| Error::Dial(e.to_string()))?;
        ldap3::drive!(conn);

        let (dn, password) = match credentials {
            Credentials::Service => (self.config.user().unwrap_or(""), self.config.password()),
            Credentials::Bind { dn, password } => (dn.as_str(), password.as_str()),
        };

        // An empty password would silently turn into an anonymous bind.
        if !dn.is_empty() && password.is_empty() {
            return Err(Error::InvalidCredentials(dn.to_owned()));
        }

        ldap.simple_bind(dn, password)
            .await
            .and_then(|r| r.success())
            .map_err(|e| bind_error(dn, e))?;

        debug!("Bound to {} as {credentials}", self.config.server());
        Ok(ldap)
    }

    async fn search(&self, conn: &mut Ldap, kind: EntityKind) -> Result<Vec<Entry>> {
        let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResults::new(self.config.page_size())),
        ];

        let mut search = conn
            .with_timeout(self.timeout)
            .streaming_search_with(
                adapters,
                self.config.base_dn(),
                Scope::Subtree,
                self.filter(kind),
                attributes(kind),
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(entry) = search.next().await? {
            entries.push(Entry::from(SearchEntry::construct(entry)));
        }
        search.finish().await.success()?;

        debug!("Found {} {kind} entries", entries.len());
        Ok(entries)
    }

    async fn modify_group_membership(
        &self,
        conn: &mut Ldap,
        user_dn: &str,
        group_dn: &str,
        change: MembershipChange,
    ) -> Result<()> {
        let values = HashSet::from([user_dn]);
        let modification = match change {
            MembershipChange::Add => Mod::Add("member", values),
            MembershipChange::Remove => Mod::Delete("member", values),
        };

        conn.with_timeout(self.timeout)
            .modify(group_dn, vec![modification])
            .await?
            .success()?;

        Ok(())
    }

    async fn close(&self, mut conn: Ldap) {
        if let Err(e) = conn.unbind().await {
            debug!("Unbind failed: {e}");
        }
    }
}
