//! Configuration management for cloudflare-ufw-sync.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ConfigError;
use crate::model::{IpFamily, PortSpec, Protocol};

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cloudflare-ufw-sync/config.yaml";

/// Minimum daemon interval in seconds
const MIN_INTERVAL_SECS: u64 = 60;

/// Upper bound for fetch and per-command timeouts in seconds
const MAX_TIMEOUT_SECS: u64 = 60;

const MAX_RETRIES: u32 = 5;

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Secure string type that zeroizes memory on drop
/// Used for the Cloudflare API token
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecureString(String);

impl SecureString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Parse an interval: plain seconds ("3600") or a suffixed value ("30s", "15m", "4h", "1d").
/// Requires ASCII-only input to prevent Unicode-related edge cases
pub fn parse_interval(interval: &str) -> Option<Duration> {
    let interval = interval.trim();
    if !interval.is_ascii() || interval.is_empty() {
        return None;
    }

    if let Ok(secs) = interval.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let (num_part, suffix) = interval.split_at(interval.len() - 1);
    let value = num_part.parse::<u32>().ok()? as u64;
    let multiplier = match suffix {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => return None,
    };
    Some(Duration::from_secs(value * multiplier))
}

/// Sync interval as written in the config file: seconds or a duration string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Interval {
    Seconds(u64),
    Text(String),
}

impl Interval {
    pub fn to_duration(&self) -> Option<Duration> {
        match self {
            Interval::Seconds(secs) => Some(Duration::from_secs(*secs)),
            Interval::Text(text) => parse_interval(text),
        }
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::Seconds(86_400)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the provider ranges come from
    pub cloudflare: CloudflareConfig,

    /// Rule store settings and the rules to manage
    pub ufw: UfwConfig,

    /// Daemon scheduling
    pub sync: SyncConfig,

    /// Pre-change rule backups
    pub backup: BackupConfig,

    /// Last cycle result, read by `status`
    pub state_file: PathBuf,

    /// Single-instance lock shared by sync, daemon and restore
    pub lock_file: PathBuf,

    /// Log level and optional log file
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cloudflare: CloudflareConfig::default(),
            ufw: UfwConfig::default(),
            sync: SyncConfig::default(),
            backup: BackupConfig::default(),
            state_file: PathBuf::from("/var/lib/cloudflare-ufw-sync/state.json"),
            lock_file: PathBuf::from("/run/cloudflare-ufw-sync.lock"),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let config: Config = serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        config.validate()?;

        Ok(config)
    }

    /// Load the explicit path if given, otherwise the first file found in the
    /// usual locations, otherwise validated defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }

        let candidates = search_paths();
        for path in &candidates {
            if path.exists() {
                info!("Loading configuration from {:?}", path);
                return Ok((Self::load(path)?, Some(path.clone())));
            }
        }

        warn!(
            "No configuration file found, using defaults. Searched: {:?}",
            candidates
        );
        let config = Self::default();
        config.validate()?;
        Ok((config, None))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        // Ownership marker must survive a round trip through `ufw status`
        let label = &self.ufw.label;
        if label.is_empty() {
            return invalid("ufw.label must not be empty".to_string());
        }
        if label.trim() != label {
            return invalid(format!(
                "ufw.label '{}' must not start or end with whitespace",
                label
            ));
        }
        if label.chars().any(|c| c.is_control()) || label.contains('\'') || label.contains('"') {
            return invalid(format!(
                "ufw.label '{}' contains quotes or control characters",
                label.escape_debug()
            ));
        }

        if !self.ufw.ports.is_empty() && (self.ufw.port.is_some() || self.ufw.proto.is_some()) {
            return invalid(
                "use either ufw.ports or the legacy ufw.port/ufw.proto keys, not both".to_string(),
            );
        }

        let ports = self.ufw.effective_ports();
        let mut seen = HashSet::new();
        for spec in &ports {
            if spec.port == 0 {
                return invalid("ufw.ports: port 0 is not a valid port".to_string());
            }
            if !seen.insert(*spec) {
                return invalid(format!("ufw.ports: duplicate entry {}", spec));
            }
        }

        if self.cloudflare.families.is_empty() {
            return invalid("cloudflare.families must list at least one of v4, v6".to_string());
        }

        for (name, url) in [
            ("ipv4_url", &self.cloudflare.ipv4_url),
            ("ipv6_url", &self.cloudflare.ipv6_url),
        ] {
            if !url.starts_with("https://") {
                return invalid(format!("cloudflare.{} must use HTTPS: {}", name, url));
            }
        }

        for (name, secs) in [
            ("cloudflare.fetch_timeout_secs", self.cloudflare.fetch_timeout_secs),
            ("ufw.command_timeout_secs", self.ufw.command_timeout_secs),
        ] {
            if secs == 0 || secs > MAX_TIMEOUT_SECS {
                return invalid(format!(
                    "{} must be between 1 and {} seconds, got {}",
                    name, MAX_TIMEOUT_SECS, secs
                ));
            }
        }

        if self.cloudflare.max_retries > MAX_RETRIES {
            return invalid(format!(
                "cloudflare.max_retries must be at most {}, got {}",
                MAX_RETRIES, self.cloudflare.max_retries
            ));
        }

        if self.ufw.binary.trim().is_empty() {
            return invalid("ufw.binary must not be empty".to_string());
        }

        match self.sync.interval.to_duration() {
            None => {
                return invalid(format!(
                    "Invalid sync.interval '{:?}'. Use seconds or a format like '30m', '4h', '1d'",
                    self.sync.interval
                ))
            }
            Some(d) if d.as_secs() < MIN_INTERVAL_SECS => {
                return invalid(format!(
                    "sync.interval must be at least {} seconds",
                    MIN_INTERVAL_SECS
                ))
            }
            Some(_) => {}
        }

        if self.backup.keep == 0 {
            return invalid("backup.keep must be at least 1".to_string());
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return invalid(format!(
                "Invalid logging.level '{}'. Valid values: {}",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }

        Ok(())
    }

    /// Save configuration to YAML file atomically
    ///
    /// Uses tempfile + rename pattern to prevent corruption on crash.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        use anyhow::Context;
        use std::io::Write;
        use tempfile::NamedTempFile;

        let path = path.as_ref();
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        let parent_dir = path
            .parent()
            .unwrap_or(Path::new("/etc/cloudflare-ufw-sync"));
        std::fs::create_dir_all(parent_dir)
            .with_context(|| format!("Failed to create {:?}", parent_dir))?;
        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .context("Failed to create temporary file for config")?;

        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;

        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist config file: {:?}", path))?;

        Ok(())
    }

    /// Generate default config with comments
    pub fn generate_default_yaml() -> String {
        include_str!("../templates/config.yaml").to_string()
    }

    /// Daemon interval (validated, so always present after `load`)
    pub fn interval(&self) -> Duration {
        self.sync
            .interval
            .to_duration()
            .unwrap_or(Duration::from_secs(86_400))
    }
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from(DEFAULT_CONFIG_PATH),
        PathBuf::from("/etc/cloudflare-ufw-sync/config.yml"),
    ];
    if let Some(home) = env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".config/cloudflare-ufw-sync/config.yml"));
    }
    paths.push(PathBuf::from("config.yml"));
    paths
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudflareConfig {
    pub ipv4_url: String,
    pub ipv6_url: String,
    /// Address families to manage
    #[serde(alias = "ip_types")]
    pub families: Vec<IpFamily>,
    /// Token can be set directly or via CLOUDFLARE_API_KEY env var
    /// Memory is securely zeroed when dropped
    pub api_key: SecureString,
    /// Environment variable name to read the token from (optional)
    pub api_key_env: Option<String>,
    pub fetch_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            ipv4_url: "https://www.cloudflare.com/ips-v4".to_string(),
            ipv6_url: "https://www.cloudflare.com/ips-v6".to_string(),
            families: vec![IpFamily::V4, IpFamily::V6],
            api_key: SecureString::default(),
            api_key_env: None,
            fetch_timeout_secs: 5,
            max_retries: 1,
        }
    }
}

impl CloudflareConfig {
    /// Get the effective token, checking env vars first
    /// Returns a SecureString that will be zeroed when dropped
    pub fn get_api_key(&self) -> SecureString {
        if let Some(ref env_name) = self.api_key_env {
            if let Ok(val) = env::var(env_name) {
                return SecureString::new(val);
            }
        }
        if let Ok(val) = env::var("CLOUDFLARE_API_KEY") {
            return SecureString::new(val);
        }
        self.api_key.clone()
    }

    /// Configured families, deduplicated, v4 first
    pub fn families(&self) -> Vec<IpFamily> {
        IpFamily::ALL
            .into_iter()
            .filter(|f| self.families.contains(f))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicy {
    Allow,
    Deny,
    Reject,
}

impl std::fmt::Display for DefaultPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefaultPolicy::Allow => f.write_str("allow"),
            DefaultPolicy::Deny => f.write_str("deny"),
            DefaultPolicy::Reject => f.write_str("reject"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UfwConfig {
    /// Ownership marker written as the rule comment
    #[serde(alias = "comment")]
    pub label: String,
    pub ports: Vec<PortSpec>,
    /// Legacy single-port form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proto: Option<Protocol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_policy: Option<DefaultPolicy>,
    pub ensure_enabled: bool,
    pub binary: String,
    pub command_timeout_secs: u64,
}

impl Default for UfwConfig {
    fn default() -> Self {
        Self {
            label: "Cloudflare IP".to_string(),
            ports: Vec::new(),
            port: None,
            proto: None,
            default_policy: None,
            ensure_enabled: true,
            binary: "ufw".to_string(),
            command_timeout_secs: 10,
        }
    }
}

impl UfwConfig {
    /// `ports` if set, else the legacy `port`/`proto` pair, else 443/tcp
    pub fn effective_ports(&self) -> Vec<PortSpec> {
        if !self.ports.is_empty() {
            return self.ports.clone();
        }
        if self.port.is_some() || self.proto.is_some() {
            return vec![PortSpec::new(
                self.port.unwrap_or(443),
                self.proto.unwrap_or_default(),
            )];
        }
        vec![PortSpec::new(443, Protocol::Tcp)]
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval: Interval,
    /// The daemon refuses to start when false
    pub enabled: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Interval::default(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: PathBuf,
    /// Number of backups to retain
    pub keep: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/cloudflare-ufw-sync/backups"),
            keep: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ufw.label, "Cloudflare IP");
        assert_eq!(
            config.ufw.effective_ports(),
            vec![PortSpec::new(443, Protocol::Tcp)]
        );
        assert_eq!(config.cloudflare.families(), vec![IpFamily::V4, IpFamily::V6]);
        assert_eq!(config.interval(), Duration::from_secs(86_400));
        assert_eq!(config.cloudflare.fetch_timeout_secs, 5);
        assert_eq!(config.cloudflare.max_retries, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_template_is_valid() {
        let config: Config = serde_yaml::from_str(&Config::generate_default_yaml()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.ufw.label, "Cloudflare IP");
        assert_eq!(config.backup.keep, 10);
        assert_eq!(config.cloudflare.fetch_timeout_secs, 5);
        assert_eq!(config.cloudflare.max_retries, 1);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.ufw.label, config.ufw.label);
        assert_eq!(parsed.sync.interval, config.sync.interval);
    }

    #[test]
    fn test_legacy_single_port_keys() {
        let yaml = r#"
cloudflare:
  ip_types: ["v4"]
ufw:
  port: 8443
  proto: udp
  comment: "CF edge"
sync:
  interval: 3600
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.cloudflare.families(), vec![IpFamily::V4]);
        assert_eq!(config.ufw.label, "CF edge");
        assert_eq!(
            config.ufw.effective_ports(),
            vec![PortSpec::new(8443, Protocol::Udp)]
        );
        assert_eq!(config.interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_multiple_ports() {
        let yaml = r#"
ufw:
  ports:
    - port: 443
      proto: tcp
    - port: 443
      proto: udp
    - port: 80
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        let ports = config.ufw.effective_ports();
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[2], PortSpec::new(80, Protocol::Tcp));
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("4h"), Some(Duration::from_secs(14_400)));
        assert_eq!(parse_interval("30m"), Some(Duration::from_secs(1_800)));
        assert_eq!(parse_interval("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_interval("60s"), Some(Duration::from_secs(60)));
        assert_eq!(parse_interval("3600"), Some(Duration::from_secs(3_600)));

        assert_eq!(parse_interval(""), None);
        assert_eq!(parse_interval("h"), None);
        assert_eq!(parse_interval("4x"), None);
        assert_eq!(parse_interval("abc"), None);
        // Full-width digit (non-ASCII)
        assert_eq!(parse_interval("４h"), None);
    }

    #[test]
    fn test_interval_string_in_yaml() {
        let config: Config = serde_yaml::from_str("sync:\n  interval: 6h\n").unwrap();
        assert_eq!(config.interval(), Duration::from_secs(21_600));
    }

    #[test]
    fn test_validation_interval_too_short() {
        let config = Config {
            sync: SyncConfig {
                interval: Interval::Seconds(5),
                enabled: true,
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least 60"));
    }

    #[test]
    fn test_validation_invalid_interval() {
        let config = Config {
            sync: SyncConfig {
                interval: Interval::Text("soon".to_string()),
                enabled: true,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_labels() {
        for label in ["", " padded", "trailing ", "new\nline", "it's"] {
            let mut config = Config::default();
            config.ufw.label = label.to_string();
            assert!(config.validate().is_err(), "label {:?} accepted", label);
        }
    }

    #[test]
    fn test_validation_rejects_duplicate_ports() {
        let mut config = Config::default();
        config.ufw.ports = vec![
            PortSpec::new(443, Protocol::Tcp),
            PortSpec::new(443, Protocol::Tcp),
        ];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_validation_rejects_port_zero() {
        let mut config = Config::default();
        config.ufw.ports = vec![PortSpec::new(0, Protocol::Tcp)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_mixed_port_forms() {
        let mut config = Config::default();
        config.ufw.ports = vec![PortSpec::new(443, Protocol::Tcp)];
        config.ufw.port = Some(80);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_http_url_rejected() {
        let mut config = Config::default();
        config.cloudflare.ipv6_url = "http://www.cloudflare.com/ips-v6".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("HTTPS"));
    }

    #[test]
    fn test_validation_empty_families() {
        let mut config = Config::default();
        config.cloudflare.families.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_timeouts() {
        let mut config = Config::default();
        config.ufw.command_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cloudflare.fetch_timeout_secs = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_backup_keep() {
        let mut config = Config::default();
        config.backup.keep = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/cloudflare-ufw-sync.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "ufw: [not, a, map").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.yaml");
        let mut config = Config::default();
        config.ufw.ports = vec![PortSpec::new(8443, Protocol::Tcp)];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.ufw.effective_ports(), config.ufw.effective_ports());
    }

    #[test]
    fn test_secure_string_debug_redacted() {
        let secret = SecureString::new("my-secret-token".to_string());
        let debug_str = format!("{:?}", secret);
        assert_eq!(debug_str, "[REDACTED]");
    }

    #[test]
    fn test_api_key_from_custom_env() {
        let config = CloudflareConfig {
            api_key: "from-file".into(),
            api_key_env: Some("CFUS_TEST_TOKEN_ENV".to_string()),
            ..Default::default()
        };
        env::set_var("CFUS_TEST_TOKEN_ENV", "from-env");
        assert_eq!(config.get_api_key().as_str(), "from-env");
        env::remove_var("CFUS_TEST_TOKEN_ENV");
    }
}
