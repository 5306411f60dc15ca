//! Concrete sources: the probe bundles, their decoders, and the assembly of
//! the whole fleet from configuration.

pub mod disk;
pub mod host;
pub mod network;
pub mod usage;

use std::sync::Arc;

use crate::cache::StatusCache;
use crate::config::AppConfig;
use crate::database::{DbPool, WritePool};
use crate::poll::{PollWork, SourceSpec, SshTransport};

/// Cache key for the local disk source.
pub const DISK_KEY: &str = "disk";
/// Cache key for the usage aggregation source.
pub const USAGE_KEY: &str = "usage";

/// Cache key for a host's bandwidth source.
pub fn network_key(host: &str, interface: &str) -> String {
    format!("{host}:{interface}")
}

/// Translate the configuration into the declarative source list.
///
/// Remote keys are primed with a `connecting` failure record so readers
/// show progress before the first poll lands; local and function sources
/// produce a payload quickly enough not to need it.
pub fn build_fleet(
    config: &AppConfig,
    cache: &Arc<StatusCache>,
    read_pool: DbPool,
    write_pool: WritePool,
) -> Vec<SourceSpec> {
    let fleet = &config.fleet;
    let mut specs = Vec::new();

    for host_config in &fleet.hosts {
        let transport = Arc::new(SshTransport::new(
            host_config.endpoint(),
            fleet.ssh.connect_timeout(),
        ));

        cache.update_failure(&host_config.name, "connecting");
        specs.push(SourceSpec::new(
            host_config.name.clone(),
            PollWork::Remote {
                transport: transport.clone(),
                bundle: host::bundle(&fleet.bundles),
                decoder: Arc::new(host::HostDecoder),
            },
            fleet.ssh.interval(),
            fleet.ssh.timeout(),
        ));

        if let Some(interface) = &host_config.interface {
            let key = network_key(&host_config.name, interface);
            cache.update_failure(&key, "connecting");
            specs.push(SourceSpec::new(
                key,
                PollWork::Remote {
                    transport,
                    bundle: network::bundle(&fleet.bundles.network, interface, fleet.network.sample_secs),
                    decoder: Arc::new(network::NetworkDecoder),
                },
                fleet.network.interval(),
                fleet.ssh.timeout(),
            ));
        }
    }

    specs.push(SourceSpec::new(
        DISK_KEY,
        PollWork::Local {
            bundle: disk::bundle(&fleet.bundles),
            decoder: Arc::new(disk::DiskDecoder),
        },
        fleet.local.interval(),
        fleet.local.timeout(),
    ));

    let host_keys: Vec<String> = fleet.hosts.iter().map(|h| h.name.clone()).collect();
    specs.push(SourceSpec::new(
        USAGE_KEY,
        PollWork::Function {
            task: Arc::new(usage::UsageAggregator::new(
                cache.clone(),
                read_pool,
                write_pool,
                host_keys,
                fleet.usage.staleness(),
            )),
        },
        fleet.usage.interval(),
        fleet.usage.timeout(),
    ));

    specs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::path::PathBuf;
    use std::time::Duration;

    async fn memory_pool() -> DbPool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn app_config(fleet: FleetConfig) -> AppConfig {
        AppConfig {
            database_url: "sqlite::memory:".to_owned(),
            log_dir: PathBuf::from("logs"),
            fleet,
        }
    }

    #[tokio::test]
    async fn fleet_covers_hosts_network_disk_and_usage() {
        let fleet = FleetConfig::from_json(
            r#"{"hosts": [
                {"name": "db15", "interface": "eth0"},
                {"name": "gpu7"}
            ]}"#,
        )
        .unwrap();
        let cache = Arc::new(StatusCache::new());
        let pool = memory_pool().await;

        let specs = build_fleet(&app_config(fleet), &cache, pool.clone(), pool);

        let keys: Vec<&str> = specs.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, ["db15", "db15:eth0", "gpu7", "disk", "usage"]);
    }

    #[tokio::test]
    async fn remote_sources_are_primed_as_connecting() {
        let fleet = FleetConfig::from_json(
            r#"{"hosts": [{"name": "db15", "interface": "eth0"}]}"#,
        )
        .unwrap();
        let cache = Arc::new(StatusCache::new());
        let pool = memory_pool().await;

        build_fleet(&app_config(fleet), &cache, pool.clone(), pool);

        for key in ["db15", "db15:eth0"] {
            let record = cache.get(key);
            assert!(!record.is_success);
            assert_eq!(record.comment, "connecting");
        }
        // Local and function sources are not primed.
        assert!(cache.get(DISK_KEY).observed_at.is_none());
        assert!(cache.get(USAGE_KEY).observed_at.is_none());
    }

    #[tokio::test]
    async fn cadences_follow_the_configuration() {
        let fleet = FleetConfig::from_json(
            r#"{"hosts": [{"name": "db15"}], "ssh": {"interval_secs": 4, "timeout_secs": 40}}"#,
        )
        .unwrap();
        let cache = Arc::new(StatusCache::new());
        let pool = memory_pool().await;

        let specs = build_fleet(&app_config(fleet), &cache, pool.clone(), pool);

        let host_spec = specs.iter().find(|s| s.key == "db15").unwrap();
        assert_eq!(host_spec.interval, Duration::from_secs(4));
        assert_eq!(host_spec.timeout, Duration::from_secs(40));
        assert!(host_spec.work.is_transport());

        let disk_spec = specs.iter().find(|s| s.key == DISK_KEY).unwrap();
        assert_eq!(disk_spec.interval, Duration::from_secs(20));
        assert!(!disk_spec.work.is_transport());
    }
}
