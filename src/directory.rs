//! The seam between the pool and whatever speaks to the directory server.
//!
//! [`Directory`] is implemented for real servers by [`crate::ldap::LdapDirectory`] and,
//! in tests, by an in-memory mock. The pool only ever calls `bind` and `close`; the
//! scoped clients handed out by [`crate::manager::PoolManager`] use the rest.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use crate::entries::EntityKind;
use crate::error::Result;

/// The identity a connection is bound with.
///
/// Two credential sets are equal only if both the DN and the password match exactly, or
/// both are the service sentinel. Connections are never shared across unequal credentials.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Credentials {
    /// The configured service account (or an anonymous bind when none is configured).
    Service,
    Bind { dn: String, password: String },
}

impl Credentials {
    /// Empty DN and password map to the service sentinel.
    pub fn new(dn: impl Into<String>, password: impl Into<String>) -> Self {
        let dn = dn.into();
        let password = password.into();

        if dn.is_empty() && password.is_empty() {
            Credentials::Service
        } else {
            Credentials::Bind { dn, password }
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, Credentials::Service)
    }

    pub fn dn(&self) -> Option<&str> {
        match self {
            Credentials::Service => None,
            Credentials::Bind { dn, .. } => Some(dn.as_str()),
        }
    }
}

// Never print the password, not even in debug output.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Service => f.write_str("Service"),
            Credentials::Bind { dn, .. } => f
                .debug_struct("Bind")
                .field("dn", dn)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Service => f.write_str("<service>"),
            Credentials::Bind { dn, .. } => f.write_str(dn),
        }
    }
}

/// A raw search result: the DN and all requested attribute values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    pub attrs: HashMap<String, Vec<String>>,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: HashMap::new(),
        }
    }

    pub fn with(mut self, attribute: &str, values: &[&str]) -> Self {
        self.attrs.insert(
            attribute.to_owned(),
            values.iter().map(|v| (*v).to_owned()).collect(),
        );
        self
    }

    /// The first value of `attribute`. Attribute names are matched case-insensitively.
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.values(attribute).first().map(String::as_str)
    }

    pub fn values(&self, attribute: &str) -> &[String] {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(attribute))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Add,
    Remove,
}

/// Directory client collaborator.
pub trait Directory: Send + Sync + 'static {
    /// A live, bound connection. Cloning must yield a handle to the same connection.
    type Conn: Clone + Send + 'static;

    /// Opens a connection and binds it with `credentials`.
    fn bind(&self, credentials: &Credentials) -> impl Future<Output = Result<Self::Conn>> + Send;

    /// Returns every entry of `kind` visible to the connection's identity.
    fn search(
        &self,
        conn: &mut Self::Conn,
        kind: EntityKind,
    ) -> impl Future<Output = Result<Vec<Entry>>> + Send;

    fn modify_group_membership(
        &self,
        conn: &mut Self::Conn,
        user_dn: &str,
        group_dn: &str,
        change: MembershipChange,
    ) -> impl Future<Output = Result<()>> + Send;

    fn close(&self, conn: Self::Conn) -> impl Future<Output = ()> + Send;
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_credentials_are_the_service_identity() {
        assert_eq!(Credentials::new("", ""), Credentials::Service);
        assert!(Credentials::new("", "").is_service());
        assert_ne!(Credentials::new("cn=a", ""), Credentials::Service);
    }

    #[test]
    fn credentials_compare_both_fields() {
        let a = Credentials::new("cn=a,dc=example", "secret");
        assert_eq!(a, Credentials::new("cn=a,dc=example", "secret"));
        assert_ne!(a, Credentials::new("cn=a,dc=example", "other"));
        assert_ne!(a, Credentials::new("cn=b,dc=example", "secret"));
    }

    #[test]
    fn debug_output_hides_password() {
        let a = Credentials::new("cn=a", "hunter2");
        let printed = format!("{a:?} {a}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("cn=a"));
    }

    #[test]
    fn entry_attributes_are_case_insensitive() {
        let e = Entry::new("cn=x").with("sAMAccountName", &["x"]);
        assert_eq!(e.first("samaccountname"), Some("x"));
        assert!(e.values("member").is_empty());
    }
}
