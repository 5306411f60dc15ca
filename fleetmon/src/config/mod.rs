//! Configuration: environment variables for infrastructure, a JSON fleet
//! file for the sources.
//!
//! The fleet file is declarative. Hosts, cadences, and the probe commands
//! all live there; adding a host to the fleet is an edit plus a restart,
//! never a code change.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::poll::RemoteEndpoint;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:fleetmon.db?mode=rwc";
const DEFAULT_FLEET_FILE: &str = "fleet.json";
const DEFAULT_LOG_DIR: &str = "logs";

/// Process-level configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub fleet: FleetConfig,
}

impl AppConfig {
    /// Resolve from `DATABASE_URL`, `FLEETMON_LOG_DIR`, and the fleet file
    /// named by `FLEETMON_CONFIG`.
    ///
    /// A missing default fleet file yields an empty fleet (local sources
    /// only); a missing explicitly-named one is an error.
    pub fn load() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_owned());
        let log_dir = PathBuf::from(
            std::env::var("FLEETMON_LOG_DIR").unwrap_or_else(|_| DEFAULT_LOG_DIR.to_owned()),
        );
        let (fleet_path, explicit) = match std::env::var("FLEETMON_CONFIG") {
            Ok(path) => (PathBuf::from(path), true),
            Err(_) => (PathBuf::from(DEFAULT_FLEET_FILE), false),
        };

        let fleet = match std::fs::read_to_string(&fleet_path) {
            Ok(raw) => FleetConfig::from_json(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::warn!(
                    "fleet file '{}' not found; running with local sources only",
                    fleet_path.display()
                );
                FleetConfig::default()
            }
            Err(err) => {
                return Err(Error::config(format!(
                    "cannot read fleet file '{}': {err}",
                    fleet_path.display()
                )));
            }
        };

        Ok(Self {
            database_url,
            log_dir,
            fleet,
        })
    }
}

fn default_ssh_port() -> u16 {
    22
}

/// One remote host in the fleet.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Display name and cache key. Also the ssh destination unless `addr`
    /// overrides it.
    pub name: String,
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user; `None` defers to ssh configuration.
    #[serde(default)]
    pub user: Option<String>,
    /// Interface to sample bandwidth on. No interface, no network source.
    #[serde(default)]
    pub interface: Option<String>,
}

impl HostConfig {
    pub fn endpoint(&self) -> RemoteEndpoint {
        RemoteEndpoint {
            host: self.addr.clone().unwrap_or_else(|| self.name.clone()),
            port: self.port,
            user: self.user.clone(),
        }
    }
}

/// Cadence and timeouts for the ssh host probes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshTimingConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SshTimingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 8,
            timeout_secs: 80,
            connect_timeout_secs: 15,
        }
    }
}

impl SshTimingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Cadence and timeout for the local disk probe.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalTimingConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for LocalTimingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 20,
            timeout_secs: 80,
        }
    }
}

impl LocalTimingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Cadence and sampling duration for the bandwidth probes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkTimingConfig {
    pub interval_secs: u64,
    /// How long `sar` samples the interface each cycle.
    pub sample_secs: u64,
}

impl Default for NetworkTimingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 20,
            sample_secs: 5,
        }
    }
}

impl NetworkTimingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Cadence and freshness rules for the usage aggregation source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UsageTimingConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Host records older than this do not contribute samples.
    pub staleness_secs: u64,
}

impl Default for UsageTimingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            timeout_secs: 30,
            staleness_secs: 100,
        }
    }
}

impl UsageTimingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }
}

/// The probe commands. All of them run through a shell, remote or local,
/// and print plain text; the decoders own the parsing.
///
/// Both `sar` pipelines keep the `(Average|平均)` alternation: sar labels
/// its summary row in the locale of the sampled host.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BundleConfig {
    pub cpu: String,
    pub mem: String,
    pub cuda: String,
    pub gpustat: String,
    /// All-interface `sar` sample feeding the host header's io figure.
    pub io: String,
    pub disk: String,
    /// `sar` pipeline template; `{interface}` and `{duration}` are
    /// substituted per host.
    pub network: String,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            cpu: "echo `iostat -c 1 2`".to_owned(),
            mem: "free -h".to_owned(),
            cuda: "ls /usr/local".to_owned(),
            gpustat: "gpustat -P --color --gpuname-width 16".to_owned(),
            io: "sar -n DEV 1 2 | grep -E '(Average|平均)' | grep -vw lo \
                 | grep -v rxkB/s | awk '{print $5, $6}'"
                .to_owned(),
            disk: "df -h".to_owned(),
            network: "sar -n DEV 1 {duration} | grep -E '(Average|平均)' | grep -vw lo \
                      | grep -v rxkB/s | grep -w {interface} | awk '{print $5, $6}'"
                .to_owned(),
        }
    }
}

/// The declarative source list plus shared timings and commands.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    pub hosts: Vec<HostConfig>,
    pub ssh: SshTimingConfig,
    pub local: LocalTimingConfig,
    pub network: NetworkTimingConfig,
    pub usage: UsageTimingConfig,
    pub bundles: BundleConfig,
}

impl FleetConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: FleetConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.name.is_empty() {
                return Err(Error::config("host name cannot be empty"));
            }
            // ':' is the separator in network source keys.
            if host.name.contains(':') {
                return Err(Error::config(format!(
                    "host name '{}' cannot contain ':'",
                    host.name
                )));
            }
            if !seen.insert(host.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate host name '{}'",
                    host.name
                )));
            }
        }

        let timings = [
            ("ssh.interval_secs", self.ssh.interval_secs),
            ("ssh.timeout_secs", self.ssh.timeout_secs),
            ("ssh.connect_timeout_secs", self.ssh.connect_timeout_secs),
            ("local.interval_secs", self.local.interval_secs),
            ("local.timeout_secs", self.local.timeout_secs),
            ("network.interval_secs", self.network.interval_secs),
            ("network.sample_secs", self.network.sample_secs),
            ("usage.interval_secs", self.usage.interval_secs),
            ("usage.timeout_secs", self.usage.timeout_secs),
            ("usage.staleness_secs", self.usage.staleness_secs),
        ];
        for (label, secs) in timings {
            if secs == 0 {
                return Err(Error::config(format!("{label} must be positive")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_fleet_file_parses() {
        let raw = r#"{
            "hosts": [
                {"name": "db15", "addr": "10.0.0.15", "port": 2222,
                 "user": "telemetry", "interface": "eth0"},
                {"name": "gpu7"}
            ],
            "ssh": {"interval_secs": 4, "timeout_secs": 40, "connect_timeout_secs": 10},
            "usage": {"interval_secs": 30, "timeout_secs": 15, "staleness_secs": 50}
        }"#;

        let config = FleetConfig::from_json(raw).unwrap();

        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[0].interface.as_deref(), Some("eth0"));
        assert_eq!(config.ssh.interval(), Duration::from_secs(4));
        assert_eq!(config.usage.staleness(), Duration::from_secs(50));
        // Untouched sections keep their defaults.
        assert_eq!(config.local.interval(), Duration::from_secs(20));
        assert!(config.bundles.cpu.contains("iostat"));
    }

    #[test]
    fn minimal_host_gets_defaults() {
        let config = FleetConfig::from_json(r#"{"hosts": [{"name": "db15"}]}"#).unwrap();

        let host = &config.hosts[0];
        assert_eq!(host.port, 22);
        assert!(host.user.is_none());
        assert!(host.interface.is_none());
        assert_eq!(host.endpoint().host, "db15");
    }

    #[test]
    fn endpoint_prefers_addr_over_name() {
        let config = FleetConfig::from_json(
            r#"{"hosts": [{"name": "db15", "addr": "10.0.0.15"}]}"#,
        )
        .unwrap();

        let endpoint = config.hosts[0].endpoint();
        assert_eq!(endpoint.host, "10.0.0.15");
        assert_eq!(endpoint.port, 22);
    }

    #[test]
    fn duplicate_host_names_are_rejected() {
        let raw = r#"{"hosts": [{"name": "db15"}, {"name": "db15"}]}"#;

        let err = FleetConfig::from_json(raw).unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn host_names_with_colons_are_rejected() {
        let raw = r#"{"hosts": [{"name": "db:15"}]}"#;

        assert!(FleetConfig::from_json(raw).is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let raw = r#"{"ssh": {"interval_secs": 0}}"#;

        let err = FleetConfig::from_json(raw).unwrap_err();

        assert!(err.to_string().contains("ssh.interval_secs"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"{"hosts": [{"name": "db15", "iface": "eth0"}]}"#;

        assert!(FleetConfig::from_json(raw).is_err());
    }

    #[test]
    fn empty_fleet_is_valid() {
        let config = FleetConfig::from_json("{}").unwrap();

        assert!(config.hosts.is_empty());
        assert_eq!(config.ssh.interval(), Duration::from_secs(8));
    }

    #[test]
    fn sar_defaults_match_the_summary_row_in_any_locale() {
        let bundles = BundleConfig::default();

        // CJK sar builds print 平均 instead of Average; both must match,
        // and the loopback and header rows stay filtered out.
        for pipeline in [&bundles.io, &bundles.network] {
            assert!(pipeline.contains("grep -E '(Average|平均)'"), "{pipeline}");
            assert!(pipeline.contains("grep -vw lo"), "{pipeline}");
            assert!(pipeline.contains("grep -v rxkB/s"), "{pipeline}");
        }
    }
}
