use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// DNS forwarding proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Address the proxy listens on, both UDP and TCP.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Upstream resolver every query is relayed to.
    #[serde(default = "default_upstream_addr")]
    pub upstream_addr: String,

    /// Upstream exchange timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Session length in seconds; 0 runs until interrupted.
    #[serde(default)]
    pub duration_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_addr: default_upstream_addr(),
            timeout_ms: default_timeout_ms(),
            duration_secs: 0,
        }
    }
}

/// Firewall rule synchronizer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlockerConfig {
    /// Domain whose resolved IPs get blocked. The `www.` variant is
    /// recognized automatically.
    #[serde(default = "default_target_domain")]
    pub target_domain: String,

    /// Event log path to tail. Defaults to the path the proxy writes for
    /// the same run stamp and log dir.
    #[serde(default)]
    pub events_log: Option<String>,

    /// Poll interval in milliseconds.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    /// PF anchor the block rules are loaded under.
    #[serde(default = "default_anchor")]
    pub anchor: String,

    /// Label tagging the drop rule, used to read its packet counters.
    #[serde(default = "default_label")]
    pub label: String,

    /// Liveness marker; written at startup, removed at shutdown.
    #[serde(default)]
    pub pid_file: Option<String>,
}

impl Default for BlockerConfig {
    fn default() -> Self {
        Self {
            target_domain: default_target_domain(),
            events_log: None,
            poll_ms: default_poll_ms(),
            anchor: default_anchor(),
            label: default_label(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure for sitefence.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Output directory for the event log and session artifacts.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub blocker: BlockerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            proxy: ProxyConfig::default(),
            blocker: BlockerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or use defaults.
    ///
    /// Priority order:
    /// 1. Explicitly provided path
    /// 2. sitefence.toml in current directory
    /// 3. Default configuration
    pub fn load(path: Option<&str>, cli_overrides: CliOverrides) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else if std::path::Path::new("sitefence.toml").exists() {
            Self::from_file("sitefence.toml")?
        } else {
            Self::default()
        };

        config.apply_cli_overrides(cli_overrides);
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_cli_overrides(&mut self, overrides: CliOverrides) {
        if let Some(dir) = overrides.log_dir {
            self.log_dir = dir;
        }
        if let Some(listen) = overrides.listen_addr {
            self.proxy.listen_addr = listen;
        }
        if let Some(upstream) = overrides.upstream_addr {
            self.proxy.upstream_addr = upstream;
        }
        if let Some(ms) = overrides.timeout_ms {
            self.proxy.timeout_ms = ms;
        }
        if let Some(secs) = overrides.duration_secs {
            self.proxy.duration_secs = secs;
        }
        if let Some(target) = overrides.target_domain {
            self.blocker.target_domain = target;
        }
        if let Some(log) = overrides.events_log {
            self.blocker.events_log = Some(log);
        }
        if let Some(ms) = overrides.poll_ms {
            self.blocker.poll_ms = ms;
        }
        if let Some(anchor) = overrides.anchor {
            self.blocker.anchor = anchor;
        }
        if let Some(label) = overrides.label {
            self.blocker.label = label;
        }
        if let Some(pid) = overrides.pid_file {
            self.blocker.pid_file = Some(pid);
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| {
                ConfigError::Validation(format!(
                    "Invalid listen address '{}': {}",
                    self.proxy.listen_addr, e
                ))
            })?;
        self.proxy
            .upstream_addr
            .parse::<SocketAddr>()
            .map_err(|e| {
                ConfigError::Validation(format!(
                    "Invalid upstream address '{}': {}",
                    self.proxy.upstream_addr, e
                ))
            })?;
        if self.proxy.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "Upstream timeout cannot be 0".to_string(),
            ));
        }
        if self.blocker.poll_ms == 0 {
            return Err(ConfigError::Validation(
                "Poll interval cannot be 0".to_string(),
            ));
        }
        if self.blocker.target_domain.trim().trim_matches('.').is_empty() {
            return Err(ConfigError::Validation(
                "Target domain cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Command-line overrides for configuration.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub log_dir: Option<String>,
    pub listen_addr: Option<String>,
    pub upstream_addr: Option<String>,
    pub timeout_ms: Option<u64>,
    pub duration_secs: Option<u64>,
    pub target_domain: Option<String>,
    pub events_log: Option<String>,
    pub poll_ms: Option<u64>,
    pub anchor: Option<String>,
    pub label: Option<String>,
    pub pid_file: Option<String>,
    pub log_level: Option<String>,
}

fn default_listen_addr() -> String {
    "127.0.0.1:53".to_string()
}

fn default_upstream_addr() -> String {
    "1.1.1.1:53".to_string()
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_target_domain() -> String {
    "youtube.com".to_string()
}

fn default_poll_ms() -> u64 {
    1000
}

fn default_anchor() -> String {
    "sitefence/block".to_string()
}

fn default_label() -> String {
    "sitefence_block".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "log".to_string()
}
