//! # Service Configuration
//!
//! TOML-backed configuration for the capman service, with environment
//! overrides applied after load and explicit validation before the server
//! starts. The loaded `Config` is a plain value carried in `AppState`;
//! nothing reads configuration ambiently after startup.
//!
//! ## File format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 5060
//! timeout = "120s"
//!
//! [services]
//! postoffice_url = "http://postoffice:5020"
//! brain_url = "http://brain:5070"
//!
//! [auth]
//! enabled = true
//! client_secret = "change-me"
//! ```
//!
//! ## Environment overrides
//!
//! `POSTOFFICE_URL`, `BRAIN_URL`, `LIBRARIAN_URL`, `SECURITYMANAGER_URL`,
//! `MISSIONCONTROL_URL`, `ENGINEER_URL`, `CLIENT_SECRET`, `CM_VERSION`,
//! `MISSION_ID`, `CAPMAN_PLUGIN_ROOT`, `CAPMAN_CACHE_ROOT` override their
//! file counterparts, so containerized deployments need no config file at
//! all.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Serde adapter for "500ms" / "30s" / "5m" duration strings.
mod duration_str {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}s", value.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Whole-request timeout applied as a tower layer.
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5060,
            timeout: Duration::from_secs(120),
        }
    }
}

/// URLs of the collaborating services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub postoffice_url: String,
    pub brain_url: String,
    pub librarian_url: String,
    pub securitymanager_url: String,
    pub missioncontrol_url: String,
    /// Engineer service the unknown-verb workflow requests new plugins
    /// from.
    pub engineer_url: String,
    /// Optional HTTP marketplace repository; empty disables it.
    pub marketplace_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub client_secret: String,
    #[serde(with = "duration_str")]
    pub token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            client_secret: String::new(),
            token_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Inline plugin bundles live under `<plugin_root>/<verb>/`.
    pub plugin_root: PathBuf,
    /// Git bundles are cached under
    /// `<cache_root>/<plugin-id>/<commit-or-branch>/`.
    pub cache_root: PathBuf,
    /// Where the local repository persists manifests.
    pub manifest_root: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            plugin_root: PathBuf::from("plugins"),
            cache_root: PathBuf::from(".capman-cache"),
            manifest_root: PathBuf::from("manifests"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub app_name: String,
    pub version: semver::Version,
    pub mission_id: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            app_name: "capman".to_string(),
            version: semver::Version::new(1, 0, 0),
            mission_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorTimeouts {
    #[serde(with = "duration_str")]
    pub script_timeout: Duration,
    #[serde(with = "duration_str")]
    pub remote_timeout: Duration,
}

impl Default for ExecutorTimeouts {
    fn default() -> Self {
        Self {
            script_timeout: Duration::from_secs(60),
            remote_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub services: ServicesConfig,
    pub auth: AuthConfig,
    pub registry: RegistryConfig,
    pub host: HostConfig,
    pub executor: ExecutorTimeouts,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from a TOML file and apply environment overrides.
    ///
    /// A missing file is not an error; deployments that configure purely
    /// through the environment run without one.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("config file {path} does not parse: {e}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(anyhow::anyhow!("failed to read config file {path}: {e}")),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Fold environment variables over the loaded values.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        let mut take = |var: &str, slot: &mut String| {
            if let Ok(value) = std::env::var(var) {
                *slot = value;
            }
        };
        take("POSTOFFICE_URL", &mut self.services.postoffice_url);
        take("BRAIN_URL", &mut self.services.brain_url);
        take("LIBRARIAN_URL", &mut self.services.librarian_url);
        take("SECURITYMANAGER_URL", &mut self.services.securitymanager_url);
        take("MISSIONCONTROL_URL", &mut self.services.missioncontrol_url);
        take("ENGINEER_URL", &mut self.services.engineer_url);
        take("CLIENT_SECRET", &mut self.auth.client_secret);
        take("MISSION_ID", &mut self.host.mission_id);

        if let Ok(version) = std::env::var("CM_VERSION") {
            self.host.version = semver::Version::parse(&version)
                .map_err(|e| anyhow::anyhow!("CM_VERSION is not a semver version: {e}"))?;
        }
        if let Ok(root) = std::env::var("CAPMAN_PLUGIN_ROOT") {
            self.registry.plugin_root = PathBuf::from(root);
        }
        if let Ok(root) = std::env::var("CAPMAN_CACHE_ROOT") {
            self.registry.cache_root = PathBuf::from(root);
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }
        if self.server.timeout.is_zero() {
            anyhow::bail!("server.timeout must be positive");
        }
        if self.auth.enabled && self.auth.client_secret.len() < 8 {
            anyhow::bail!("auth.client_secret must be at least 8 characters when auth is enabled");
        }
        if self.executor.script_timeout.is_zero() || self.executor.remote_timeout.is_zero() {
            anyhow::bail!("executor timeouts must be positive");
        }
        Ok(())
    }
}

/// Parse "500ms", "30s", "5m", "2h" into a `Duration`.
pub fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        anyhow::bail!("empty duration");
    }
    let (digits, unit): (String, String) = raw.chars().partition(|c| c.is_ascii_digit());
    let value: u64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("unparseable duration: {raw}"))?;
    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" | "" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => anyhow::bail!("unknown duration unit: {other}"),
    }
}
