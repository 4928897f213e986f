use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for any single tool invocation.
pub const MAX_TIMEOUT_SECS: u64 = 600;

/// Upper bound for the pause between runs.
pub const MAX_SLEEP_BETWEEN_SECS: f64 = 600.0;

/// Top-level configuration loaded from net-speedtest.toml.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub speedtest: SpeedtestConfig,
    pub network_quality: NetworkQualityConfig,
    pub ping: PingConfig,
    pub environment: EnvironmentConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Samples per tool (recommend 3-5).
    pub runs: u32,
    /// Pause between consecutive runs of the same tool.
    pub sleep_between_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SpeedtestConfig {
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
    pub server_id: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkQualityConfig {
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PingConfig {
    pub enabled: bool,
    pub command: String,
    pub targets: Vec<String>,
    pub count: u32,
    pub timeout_secs: u64,
    /// Also ping the host of the server the throughput tester selected.
    pub include_speedtest_server: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub public_ip_lookup: bool,
    pub ipinfo_url: String,
    pub http_timeout_secs: u64,
    /// Host resolved to time DNS; None disables the probe.
    pub dns_probe_host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    pub jsonl: PathBuf,
    pub log: PathBuf,
    pub quiet: bool,
    pub print_raw: bool,
}

// --- Default implementations ---

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            runs: 1,
            sleep_between_secs: 2.0,
        }
    }
}

impl Default for SpeedtestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "speedtest".to_string(),
            args: vec![
                "--accept-license".to_string(),
                "--accept-gdpr".to_string(),
                "-f".to_string(),
                "json".to_string(),
            ],
            server_id: None,
            timeout_secs: 180,
        }
    }
}

impl Default for NetworkQualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "networkQuality".to_string(),
            args: vec!["-s".to_string()],
            timeout_secs: 120,
        }
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "ping".to_string(),
            targets: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            count: 10,
            timeout_secs: 20,
            include_speedtest_server: false,
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            public_ip_lookup: true,
            ipinfo_url: "https://ipinfo.io/json".to_string(),
            http_timeout_secs: 10,
            dns_probe_host: Some("icloud.com".to_string()),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            jsonl: home.join("net_speedtest.jsonl"),
            log: home.join("net_speedtest.log"),
            quiet: false,
            print_raw: false,
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl Config {
    /// Load from `path`. A missing file yields defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check bounds that the orchestration relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.runs == 0 {
            return Err(ConfigError::Invalid("runs must be at least 1".into()));
        }
        if !(0.0..=MAX_SLEEP_BETWEEN_SECS).contains(&self.session.sleep_between_secs) {
            return Err(ConfigError::Invalid(format!(
                "sleep_between_secs must be between 0 and {MAX_SLEEP_BETWEEN_SECS} seconds, got {}",
                self.session.sleep_between_secs
            )));
        }
        if self.ping.count == 0 {
            return Err(ConfigError::Invalid("ping count must be at least 1".into()));
        }
        for (tool, secs) in [
            ("speedtest", self.speedtest.timeout_secs),
            ("network_quality", self.network_quality.timeout_secs),
            ("ping", self.ping.timeout_secs),
        ] {
            if !(1..=MAX_TIMEOUT_SECS).contains(&secs) {
                return Err(ConfigError::Invalid(format!(
                    "{tool} timeout must be between 1 and {MAX_TIMEOUT_SECS} seconds, got {secs}"
                )));
            }
        }
        Ok(())
    }

    /// Apply one timeout to every tool.
    pub fn set_all_timeouts(&mut self, secs: u64) {
        self.speedtest.timeout_secs = secs;
        self.network_quality.timeout_secs = secs;
        self.ping.timeout_secs = secs;
    }

    pub fn sleep_between(&self) -> Duration {
        let secs = self.session.sleep_between_secs;
        if secs.is_nan() {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(secs.clamp(0.0, MAX_SLEEP_BETWEEN_SECS))
    }
}
