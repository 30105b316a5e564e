//! Configuration parsing and access.
//!
//! This module handles the node configuration file (TOML) that carries boot
//! options, filesystem locations, supervision timing and the per-service
//! declarations consumed by the boot sequencer and the chirality controller.
//!
//! A missing file is not an error: every key resolves to its default.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::membrane::LimitOverrides;
use crate::size::{SizeError, parse_size};
use crate::vertex::{Chirality, Vertex};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/octant/octant.toml";

/// Maximum service name length (also bounds cgroup and state file names).
pub const MAX_SERVICE_NAME_LEN: usize = 128;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct OctantConfig {
    /// Boot options.
    #[serde(default)]
    pub boot: BootConfig,

    /// Filesystem locations.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Supervision timing.
    #[serde(default)]
    pub supervision: SupervisionConfig,

    /// Service declarations.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// `[boot]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootConfig {
    /// Mode applied at boot.
    #[serde(default)]
    pub mode: Chirality,

    /// Kernel modules loaded best-effort in phase 1.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Hostname set in phase 2.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Timezone set in phase 2 (a zoneinfo name).
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Persisted entropy seed, read at boot and rewritten at shutdown.
    #[serde(default = "default_random_seed")]
    pub random_seed: PathBuf,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            mode: Chirality::default(),
            modules: Vec::new(),
            hostname: default_hostname(),
            timezone: default_timezone(),
            random_seed: default_random_seed(),
        }
    }
}

fn default_hostname() -> String {
    "octant".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_random_seed() -> PathBuf {
    PathBuf::from("/var/lib/octant/random-seed")
}

/// `[paths]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathsConfig {
    /// Runtime state directory (tmpfs; reset on reboot).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// cgroup v2 mount point.
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            cgroup_root: default_cgroup_root(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/run/octant")
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from(crate::cgroup::CGROUP_V2_MOUNT)
}

/// `[supervision]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupervisionConfig {
    /// Polling interval of the supervision loop.
    #[serde(default = "default_interval")]
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Time between SIGTERM and SIGKILL during shutdown.
    #[serde(default = "default_grace_period")]
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            grace_period: default_grace_period(),
        }
    }
}

const fn default_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_grace_period() -> Duration {
    Duration::from_secs(10)
}

/// Restart policy. Recorded for operators; the supervision loop does not
/// restart services.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    Never,
    /// Restart after a non-zero exit.
    OnFailure,
    /// Always restart.
    Always,
}

/// One `[[services]]` declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Service name (must be unique).
    pub name: String,

    /// Target vertex.
    pub vertex: Vertex,

    /// Boot phase that launches the service (3 or 4).
    #[serde(default = "default_phase")]
    pub phase: u8,

    /// Program to execute. A declaration without one launches nothing.
    #[serde(default)]
    pub command: Option<String>,

    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Dependency name. Advisory only: ordering is by phase.
    #[serde(default)]
    pub depends_on: Option<String>,

    /// Restart policy (advisory).
    #[serde(default)]
    pub restart: RestartPolicy,

    /// Capability override; `None` uses the vertex default.
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,

    /// Soft memory limit, e.g. `64M`.
    #[serde(default)]
    pub memory_soft: Option<String>,

    /// Hard memory limit, e.g. `128M`.
    #[serde(default)]
    pub memory_hard: Option<String>,

    /// CPU weight.
    #[serde(default)]
    pub cpu_weight: Option<u32>,

    /// Task limit.
    #[serde(default)]
    pub pids_max: Option<u32>,
}

const fn default_phase() -> u8 {
    4
}

impl ServiceConfig {
    /// A declaration with defaults for everything but name and vertex.
    pub fn new(name: impl Into<String>, vertex: Vertex) -> Self {
        Self {
            name: name.into(),
            vertex,
            phase: default_phase(),
            command: None,
            args: Vec::new(),
            depends_on: None,
            restart: RestartPolicy::default(),
            capabilities: None,
            memory_soft: None,
            memory_hard: None,
            cpu_weight: None,
            pids_max: None,
        }
    }

    /// Limit overrides declared for this service.
    pub fn overrides(&self) -> Result<LimitOverrides, ConfigError> {
        let size = |field: &str, value: &Option<String>| -> Result<Option<u64>, ConfigError> {
            value
                .as_deref()
                .map(parse_size)
                .transpose()
                .map_err(|source| ConfigError::Size {
                    service: self.name.clone(),
                    field: field.to_string(),
                    source,
                })
        };
        Ok(LimitOverrides {
            memory_soft: size("memory_soft", &self.memory_soft)?,
            memory_hard: size("memory_hard", &self.memory_hard)?,
            cpu_weight: self.cpu_weight,
            pids_max: self.pids_max,
            capabilities: self.capabilities.clone(),
        })
    }
}

/// Read-only access to the configuration.
///
/// Holds both the typed view and the raw table so that callers can read keys
/// this version does not model.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    raw: toml::Table,
    config: OctantConfig,
    source: Option<PathBuf>,
}

impl ConfigStore {
    /// Loads configuration from a TOML file.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or
    /// validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(
                    path = %path.display(),
                    "configuration file missing, using defaults"
                );
                return Ok(Self::default());
            },
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let mut store = Self::from_toml(&content)?;
        store.source = Some(path.to_path_buf());
        Ok(store)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The TOML is invalid
    /// - Two services share a name
    /// - A service name is unusable as a cgroup/state file name
    /// - A service phase is not 3 or 4
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let raw: toml::Table = content.parse().map_err(ConfigError::Parse)?;
        let config: OctantConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(Self {
            raw,
            config,
            source: None,
        })
    }

    /// Wraps an already-built configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn from_config(config: OctantConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let raw = toml::Table::try_from(&config).map_err(ConfigError::Serialize)?;
        Ok(Self {
            raw,
            config,
            source: None,
        })
    }

    /// The typed configuration.
    #[must_use]
    pub const fn config(&self) -> &OctantConfig {
        &self.config
    }

    /// The file this configuration came from, if any.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Raw value of `key` in `[section]`.
    #[must_use]
    pub fn get(&self, section: &str, key: &str) -> Option<&toml::Value> {
        self.raw.get(section)?.as_table()?.get(key)
    }

    /// Raw string value of `key` in `[section]`.
    #[must_use]
    pub fn get_str(&self, section: &str, key: &str) -> Option<&str> {
        self.get(section, key)?.as_str()
    }

    /// The declaration for `name`.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.config.services.iter().find(|s| s.name == name)
    }

    /// Declarations launched by boot phase `phase`.
    pub fn services_for_phase(&self, phase: u8) -> impl Iterator<Item = &ServiceConfig> {
        self.config.services.iter().filter(move |s| s.phase == phase)
    }

    /// Declarations targeting a vertex of the given polarity.
    pub fn services_of_polarity(
        &self,
        polarity: Chirality,
    ) -> impl Iterator<Item = &ServiceConfig> {
        self.config
            .services
            .iter()
            .filter(move |s| s.vertex.polarity() == polarity)
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(&self.config).map_err(ConfigError::Serialize)
    }
}

impl OctantConfig {
    /// Validates service declarations.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for service in &self.services {
            validate_service_name(&service.name).map_err(ConfigError::Validation)?;
            if !seen.insert(service.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate service name '{}'",
                    service.name
                )));
            }
            if !matches!(service.phase, 3 | 4) {
                return Err(ConfigError::Validation(format!(
                    "service '{}': phase must be 3 or 4, got {}",
                    service.name, service.phase
                )));
            }
        }
        Ok(())
    }
}

/// Validates a service name for use in cgroup and state file names.
///
/// Allowed characters: alphanumeric (a-z, A-Z, 0-9), hyphen (-), underscore
/// (_). The name must not be empty, start with '.', or exceed
/// [`MAX_SERVICE_NAME_LEN`].
pub fn validate_service_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("service name cannot be empty".to_string());
    }
    if name.len() > MAX_SERVICE_NAME_LEN {
        return Err(format!(
            "service name exceeds maximum length of {MAX_SERVICE_NAME_LEN} characters"
        ));
    }
    for (idx, ch) in name.chars().enumerate() {
        let is_safe = ch.is_ascii_alphanumeric() || ch == '-' || ch == '_';
        if !is_safe {
            return Err(format!(
                "service name contains invalid character '{}' at position {idx} \
                 (allowed: alphanumeric, hyphen, underscore)",
                ch.escape_debug()
            ));
        }
    }
    Ok(())
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A size value could not be parsed.
    #[error("service '{service}': invalid {field}: {source}")]
    Size {
        /// Service name.
        service: String,
        /// Field name.
        field: String,
        /// Parse failure.
        #[source]
        source: SizeError,
    },

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
            [[services]]
            name = "dns"
            vertex = "V100"
            command = "unbound"
        "#;

        let store = ConfigStore::from_toml(toml).unwrap();
        let config = store.config();
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].name, "dns");
        assert_eq!(config.services[0].vertex, Vertex::V100);
        assert_eq!(config.services[0].phase, 4);
        assert_eq!(config.boot.mode, Chirality::Production);
        assert_eq!(config.paths.state_dir, PathBuf::from("/run/octant"));
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [boot]
            mode = "development"
            modules = ["overlay", "br_netfilter"]
            hostname = "node-7"
            timezone = "Europe/Berlin"

            [paths]
            state_dir = "/tmp/octant"
            cgroup_root = "/tmp/cgroup"

            [supervision]
            interval = "2s"
            grace_period = "500ms"

            [[services]]
            name = "dns"
            vertex = "V100"
            phase = 3
            command = "unbound"
            args = ["-d"]
            memory_hard = "96M"

            [[services]]
            name = "web"
            vertex = "V110"
            command = "nginx"
            depends_on = "dns"
            restart = "on-failure"
            capabilities = ["CAP_NET_BIND_SERVICE"]
        "#;

        let store = ConfigStore::from_toml(toml).unwrap();
        let config = store.config();
        assert_eq!(config.boot.mode, Chirality::Development);
        assert_eq!(config.boot.modules, vec!["overlay", "br_netfilter"]);
        assert_eq!(config.boot.hostname, "node-7");
        assert_eq!(config.supervision.interval, Duration::from_secs(2));
        assert_eq!(config.supervision.grace_period, Duration::from_millis(500));
        assert_eq!(store.services_for_phase(3).count(), 1);
        assert_eq!(store.services_for_phase(4).count(), 1);

        let web = store.service("web").unwrap();
        assert_eq!(web.restart, RestartPolicy::OnFailure);
        assert_eq!(web.depends_on.as_deref(), Some("dns"));

        let dns = store.service("dns").unwrap().overrides().unwrap();
        assert_eq!(dns.memory_hard, Some(96 * 1024 * 1024));
        assert_eq!(dns.memory_soft, None);
    }

    #[test]
    fn raw_accessor_reads_unmodelled_keys() {
        let toml = r#"
            [boot]
            hostname = "node-1"
            banner = "welcome"
        "#;
        let store = ConfigStore::from_toml(toml).unwrap();
        assert_eq!(store.get_str("boot", "banner"), Some("welcome"));
        assert_eq!(store.get_str("boot", "hostname"), Some("node-1"));
        assert!(store.get("boot", "missing").is_none());
        assert!(store.get("nosuch", "hostname").is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(store.config(), &OctantConfig::default());
        assert!(store.source().is_none());
    }

    #[test]
    fn load_records_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("octant.toml");
        std::fs::write(&path, "[boot]\nhostname = \"x\"\n").unwrap();
        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.source(), Some(path.as_path()));
        assert_eq!(store.config().boot.hostname, "x");
    }

    #[test]
    fn reject_duplicate_service_names() {
        let toml = r#"
            [[services]]
            name = "dns"
            vertex = "V100"

            [[services]]
            name = "dns"
            vertex = "V110"
        "#;
        let err = ConfigStore::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn reject_invalid_phase() {
        let toml = r#"
            [[services]]
            name = "early"
            vertex = "V100"
            phase = 2
        "#;
        let err = ConfigStore::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("phase")));
    }

    #[test]
    fn reject_invalid_vertex() {
        let toml = r#"
            [[services]]
            name = "ghost"
            vertex = "V222"
        "#;
        assert!(matches!(
            ConfigStore::from_toml(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn reject_unsafe_service_names() {
        for bad in ["", "a/b", ".hidden", "x y", "../etc"] {
            assert!(validate_service_name(bad).is_err(), "{bad:?} accepted");
        }
        assert!(validate_service_name("dns_cache-2").is_ok());
        assert!(validate_service_name(&"x".repeat(MAX_SERVICE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn bad_size_is_reported_per_service() {
        let mut service = ServiceConfig::new("web", Vertex::V110);
        service.memory_hard = Some("lots".to_string());
        let err = service.overrides().unwrap_err();
        assert!(err.to_string().contains("memory_hard"));
    }

    #[test]
    fn config_round_trips_through_store() {
        let mut config = OctantConfig::default();
        config.services.push(ServiceConfig::new("dns", Vertex::V100));
        let store = ConfigStore::from_config(config.clone()).unwrap();
        let text = store.to_toml().unwrap();
        let reparsed = ConfigStore::from_toml(&text).unwrap();
        assert_eq!(reparsed.config(), &config);
        assert_eq!(reparsed.get_str("boot", "hostname"), Some("octant"));
    }
}
