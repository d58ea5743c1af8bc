use std::path::Path;
use std::time::Duration;

use log::LevelFilter;
use serde::Deserialize;
use url::Url;

use crate::cli::CliArgs;
use crate::error::{Error, Result};

const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(15 * 60);
const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

/// Contents of the configuration file.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_log")]
    log: LevelFilter,

    ldap: Option<LdapConfig>,

    #[serde(default)]
    pool: PoolSection,

    #[serde(default)]
    cache: CacheSection,
}

fn default_log() -> LevelFilter {
    LevelFilter::Info
}

impl Config {
    pub fn load_from_file<A: AsRef<Path>>(path: A) -> Result<Config> {
        let string = std::fs::read_to_string(path)?;
        Self::parse(string.as_str())
    }

    pub fn parse(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s)?;

        Ok(config)
    }

    pub fn log(&self) -> LevelFilter {
        self.log
    }

    pub fn ldap(&self) -> Option<&LdapConfig> {
        self.ldap.as_ref()
    }

    pub fn pool(&self) -> PoolConfig {
        self.pool.to_pool_config()
    }

    pub fn cache(&self) -> CacheConfig {
        CacheConfig {
            refresh_interval: Duration::from_secs(self.cache.refresh_interval_secs),
            unhealthy_threshold: self.cache.unhealthy_threshold,
        }
        .normalize()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LdapConfig {
    // The server to connect to
    server: Url,
    // Search base for users, groups and computers
    base_dn: String,
    // The service account; anonymous bind when absent
    user: Option<String>,
    password: Option<String>,
    #[serde(default = "default_user_filter")]
    user_filter: String,
    #[serde(default = "default_group_filter")]
    group_filter: String,
    #[serde(default = "default_computer_filter")]
    computer_filter: String,
    #[serde(default = "default_page_size")]
    page_size: i32,
    #[serde(default)]
    starttls: bool,
    #[serde(default)]
    no_tls_verify: bool,
}

fn default_user_filter() -> String {
    String::from("(&(objectClass=user)(!(objectClass=computer)))")
}

fn default_group_filter() -> String {
    String::from("(objectClass=group)")
}

fn default_computer_filter() -> String {
    String::from("(objectClass=computer)")
}

fn default_page_size() -> i32 {
    500
}

impl LdapConfig {
    fn new(server: Url, base_dn: impl Into<String>) -> Self {
        Self {
            server,
            base_dn: base_dn.into(),
            user: None,
            password: None,
            user_filter: default_user_filter(),
            group_filter: default_group_filter(),
            computer_filter: default_computer_filter(),
            page_size: default_page_size(),
            starttls: false,
            no_tls_verify: false,
        }
    }

    /// Builds a config purely from command line arguments, if enough were given.
    pub fn from_args(args: &CliArgs) -> Option<Self> {
        let server = args.server.as_deref()?;
        let base = args.base.as_deref()?;
        let server = match Url::parse(server) {
            Ok(url) => url,
            Err(e) => {
                warn!("Ignoring invalid server url {server}: {e}");
                return None;
            }
        };

        let mut config = Self::new(server, base);
        config.user = args.user.clone();
        Some(config)
    }

    /// Command line values take precedence over the file.
    pub fn merge_args(&mut self, args: &CliArgs) -> Result<()> {
        if let Some(server) = args.server.as_deref() {
            self.server = Url::parse(server)
                .map_err(|e| Error::Config(format!("invalid server url {server}: {e}")))?;
        }
        if let Some(base) = args.base.as_deref() {
            self.base_dn = base.to_owned();
        }
        if let Some(user) = args.user.as_deref() {
            self.user = Some(user.to_owned());
        }

        Ok(())
    }

    pub fn set_password(&mut self, password: String) {
        self.password = Some(password);
    }

    pub fn server(&self) -> &Url {
        &self.server
    }

    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }

    pub fn user_filter(&self) -> &str {
        &self.user_filter
    }

    pub fn group_filter(&self) -> &str {
        &self.group_filter
    }

    pub fn computer_filter(&self) -> &str {
        &self.computer_filter
    }

    pub fn page_size(&self) -> i32 {
        self.page_size
    }

    pub fn starttls(&self) -> bool {
        self.starttls
    }

    pub fn no_tls_verify(&self) -> bool {
        self.no_tls_verify
    }
}

/// `[pool]` section. Durations are given in seconds; zero means "use the default".
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PoolSection {
    max_connections: usize,
    min_connections: usize,
    max_idle_secs: u64,
    max_lifetime_secs: u64,
    health_check_interval_secs: u64,
    connection_timeout_secs: u64,
    acquire_timeout_secs: u64,
}

impl PoolSection {
    fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            max_idle_time: Duration::from_secs(self.max_idle_secs),
            max_lifetime: Duration::from_secs(self.max_lifetime_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
        }
        .normalize()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CacheSection {
    refresh_interval_secs: u64,
    unhealthy_threshold: u32,
}

/// Limits of a [`crate::pool::ConnectionPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// Service-identity connections kept warm by maintenance.
    pub min_connections: usize,
    pub max_idle_time: Duration,
    pub max_lifetime: Duration,
    pub health_check_interval: Duration,
    pub connection_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 0,
            max_idle_time: DEFAULT_MAX_IDLE,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

fn or_default(d: Duration, default: Duration) -> Duration {
    if d.is_zero() {
        default
    } else {
        d
    }
}

impl PoolConfig {
    /// Replaces out-of-range values: zero max → 10, min clamped to max, zero durations
    /// → defaults.
    pub fn normalize(mut self) -> Self {
        if self.max_connections == 0 {
            self.max_connections = DEFAULT_MAX_CONNECTIONS;
        }
        self.min_connections = self.min_connections.min(self.max_connections);
        self.max_idle_time = or_default(self.max_idle_time, DEFAULT_MAX_IDLE);
        self.max_lifetime = or_default(self.max_lifetime, DEFAULT_MAX_LIFETIME);
        self.health_check_interval =
            or_default(self.health_check_interval, DEFAULT_HEALTH_CHECK_INTERVAL);
        self.connection_timeout = or_default(self.connection_timeout, DEFAULT_CONNECTION_TIMEOUT);
        self.acquire_timeout = or_default(self.acquire_timeout, DEFAULT_ACQUIRE_TIMEOUT);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub refresh_interval: Duration,
    /// Consecutive failures of one entity type after which the cache reports unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
        }
    }
}

impl CacheConfig {
    pub fn normalize(mut self) -> Self {
        self.refresh_interval = or_default(self.refresh_interval, DEFAULT_REFRESH_INTERVAL);
        if self.unhealthy_threshold == 0 {
            self.unhealthy_threshold = DEFAULT_UNHEALTHY_THRESHOLD;
        }
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pool_config_normalizes_invalid_values() {
        let config = PoolConfig {
            max_connections: 0,
            min_connections: 50,
            max_idle_time: Duration::ZERO,
            max_lifetime: Duration::ZERO,
            health_check_interval: Duration::ZERO,
            connection_timeout: Duration::ZERO,
            acquire_timeout: Duration::from_secs(2),
        }
        .normalize();

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 10);
        assert_eq!(config.max_idle_time, DEFAULT_MAX_IDLE);
        assert_eq!(config.max_lifetime, DEFAULT_MAX_LIFETIME);
        assert_eq!(config.acquire_timeout, Duration::from_secs(2));
    }

    #[test]
    fn parse_full_config() {
        let config = Config::parse(
            r#"
            log = "debug"

            [ldap]
            server = "ldaps://dc1.example.org"
            base_dn = "dc=example,dc=org"
            user = "cn=svc,dc=example,dc=org"
            password = "secret"
            user_filter = "(objectClass=inetOrgPerson)"

            [pool]
            max_connections = 4
            min_connections = 1
            acquire_timeout_secs = 3

            [cache]
            refresh_interval_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.log(), LevelFilter::Debug);
        let ldap = config.ldap().unwrap();
        assert_eq!(ldap.server().as_str(), "ldaps://dc1.example.org");
        assert_eq!(ldap.user(), Some("cn=svc,dc=example,dc=org"));
        assert_eq!(ldap.user_filter(), "(objectClass=inetOrgPerson)");
        assert_eq!(ldap.group_filter(), "(objectClass=group)");

        let pool = config.pool();
        assert_eq!(pool.max_connections, 4);
        assert_eq!(pool.min_connections, 1);
        assert_eq!(pool.acquire_timeout, Duration::from_secs(3));
        assert_eq!(pool.max_lifetime, DEFAULT_MAX_LIFETIME);

        let cache = config.cache();
        assert_eq!(cache.refresh_interval, Duration::from_secs(60));
        assert_eq!(cache.unhealthy_threshold, DEFAULT_UNHEALTHY_THRESHOLD);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.log(), LevelFilter::Info);
        assert!(config.ldap().is_none());
        assert_eq!(config.pool(), PoolConfig::default());
        assert_eq!(config.cache(), CacheConfig::default());
    }
}
