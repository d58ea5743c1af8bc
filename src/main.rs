#[macro_use]
extern crate log;

use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use tokio::time::{self, MissedTickBehavior};

use ldapcache::cache_manager::CacheManager;
use ldapcache::cli::CliArgs;
use ldapcache::config::{Config, LdapConfig};
use ldapcache::ldap::LdapDirectory;
use ldapcache::manager::PoolManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config = Config::load_from_file(args.config_file.as_str())?;

    env_logger::builder()
        .filter_level(config.log())
        .parse_default_env()
        .init();

    let Some(mut ldap_config) = config.ldap().cloned().or_else(|| LdapConfig::from_args(&args)) else {
        error!("Missing required parameters to connect to server. Check config or provide via cli (--help for more info)");
        bail!("Missing required server information");
    };
    ldap_config.merge_args(&args)?;

    if args.password {
        let password = rpassword::prompt_password("Service account password: ")?;
        ldap_config.set_password(password);
    }

    let pool_config = config.pool();
    let cache_config = config.cache();

    info!(
        "Connecting to {} with up to {} connections",
        ldap_config.server(),
        pool_config.max_connections
    );
    let directory = LdapDirectory::new(ldap_config, pool_config.connection_timeout);
    let pool = PoolManager::new(directory, pool_config);
    pool.start().await;

    let cache = Arc::new(CacheManager::new(pool.clone(), cache_config.clone()));

    if args.once {
        let result = cache.refresh_all().await;
        let health = cache.health_check();
        println!(
            "users: {}, groups: {}, computers: {} ({})",
            health.entities.users, health.entities.groups, health.entities.computers, health.status
        );
        pool.close().await;
        result?;
        return Ok(());
    }

    cache.start();

    let mut report = time::interval(cache_config.refresh_interval);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately, before anything was refreshed
    report.tick().await;

    loop {
        tokio::select! {
            _ = report.tick() => {
                let health = cache.health_check();
                let metrics = cache.metrics();
                let stats = pool.stats();
                if health.status == ldapcache::HealthStatus::Healthy {
                    info!("Cache {}: {:?}", health.status, health.entities);
                } else {
                    warn!("Cache {}: consecutive failures {:?}", health.status, health.failures);
                }
                debug!("{metrics:?}");
                debug!("{stats:?}");
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {e}");
                }
                break;
            }
        }
    }

    info!("Shutting down");
    cache.close().await;
    pool.close().await;

    Ok(())
}
