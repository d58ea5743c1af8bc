use std::time::Duration;

use thiserror::Error;

use crate::entries::EntityKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The pool has been shut down. Terminal, callers should stop issuing requests.
    #[error("connection pool is closed")]
    PoolClosed,

    #[error("timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    #[error("timed out after {0:?} connecting to the directory")]
    ConnectTimeout(Duration),

    /// A search or modify did not finish in time. The connection is not reused.
    #[error("directory operation timed out after {0:?}")]
    OperationTimeout(Duration),

    #[error("failed to connect to directory: {0}")]
    Dial(String),

    #[error("invalid credentials for {0}")]
    InvalidCredentials(String),

    #[error("LDAP error: {0}")]
    Ldap(#[from] #[source] ldap3::LdapError),

    #[error("directory operation failed: {0}")]
    Directory(String),

    /// The scoped client was used after its connection went back to the pool.
    #[error("client has already been closed")]
    ClientClosed,

    #[error("{kind} not found: {key}")]
    NotFound { kind: EntityKind, key: String },

    #[error("refreshing {kind} cache failed: {source}")]
    Refresh {
        kind: EntityKind,
        #[source]
        source: Box<Error>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] #[source] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] #[source] toml::de::Error),
}

impl Error {
    pub fn not_found(kind: EntityKind, key: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Errors after which the connection that produced them must not be handed out again.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Ldap(e) => !matches!(e, ldap3::LdapError::LdapResult { .. }),
            Error::ConnectTimeout(_) | Error::OperationTimeout(_) | Error::Dial(_) => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classifies_connection_errors() {
        assert!(Error::OperationTimeout(Duration::from_secs(5)).is_connection_error());
        assert!(Error::Dial("refused".into()).is_connection_error());
        assert!(!Error::AcquireTimeout(Duration::from_secs(1)).is_connection_error());
        assert!(!Error::InvalidCredentials("cn=x".into()).is_connection_error());
        assert!(!Error::Directory("no such object".into()).is_connection_error());
    }

    #[test]
    fn not_found_message_names_kind_and_key() {
        let e = Error::not_found(EntityKind::User, "alice");
        assert!(e.is_not_found());
        assert_eq!(e.to_string(), "user not found: alice");
    }
}
