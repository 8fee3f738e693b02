use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use thiserror::Error;

const CONFIG_ENV: &str = "DNS_SYNC_CONFIG";
const CONFIG_PATHS: &[&str] = &["config.toml", "/etc/dns-sync/config.toml"];

#[cfg(feature = "aws")]
#[derive(Debug, Deserialize)]
pub struct Route53Settings {
    pub ttl: Option<i64>,
}

#[cfg(feature = "cf")]
#[derive(Debug, Deserialize)]
pub struct CloudflareSettings {
    pub token: Option<String>,
    /// File holding the API token, `~` is expanded.
    pub token_file: Option<String>,
    pub email: Option<String>,
    pub api_key: Option<String>,

    pub ttl: Option<u32>,
    pub proxied: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Provider {
    #[cfg(feature = "aws")]
    Route53(Route53Settings),
    #[cfg(feature = "cf")]
    Cloudflare(CloudflareSettings),
    InMemory,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub zone_id: String,
    pub traefik_url: String,
    pub destination: String,
    #[serde(default = "default_update_interval")]
    pub update_interval: String,
    /// TTL of the records this daemon creates.
    pub ttl: Option<u32>,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub provider: Provider,
}

fn default_update_interval() -> String {
    "1m".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Settings {
    /// Loads settings from `$DNS_SYNC_CONFIG`, or the first default path that
    /// exists.
    pub fn new() -> Result<Self, SettingsError> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => CONFIG_PATHS.iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
                .ok_or(SettingsError::NotFound)?,
        };

        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::Read(path.to_owned(), e))?;
        Self::parse(&raw)
    }

    /// Parses a TOML document after expanding `$VAR` and `${VAR}` references.
    pub fn parse(raw: &str) -> Result<Self, SettingsError> {
        let expanded = shellexpand::env(raw)?;
        Ok(toml::from_str(&expanded)?)
    }

    pub fn update_interval(&self) -> Result<Duration, SettingsError> {
        Ok(humantime::parse_duration(&self.update_interval)?)
    }

    pub fn log_level(&self) -> Result<tracing::Level, SettingsError> {
        self.log_level.parse()
            .map_err(|_| SettingsError::BadLogLevel(self.log_level.clone()))
    }
}

#[cfg(feature = "cf")]
impl CloudflareSettings {
    /// Returns the configured API token, reading `token_file` if needed.
    pub fn resolve_token(&mut self) -> Result<Option<String>, SettingsError> {
        if let Some(token) = self.token.take() {
            return Ok(Some(token));
        }
        match &self.token_file {
            Some(file) => {
                let path = PathBuf::from(shellexpand::tilde(file).as_ref());
                let token = std::fs::read_to_string(&path)
                    .map_err(|e| SettingsError::Read(path, e))?;
                Ok(Some(token.trim().to_owned()))
            }
            None => Ok(None),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("no config file found, set DNS_SYNC_CONFIG or create config.toml")]
    NotFound,
    #[error("failed to read {}: {1}", .0.display())]
    Read(PathBuf, #[source] std::io::Error),
    #[error(transparent)]
    Expand(#[from] shellexpand::LookupError<std::env::VarError>),
    #[error(transparent)]
    Parse(#[from] toml::de::Error),
    #[error("bad update interval: {0}")]
    BadInterval(#[from] humantime::DurationError),
    #[error("bad log level {0:?}")]
    BadLogLevel(String),
}
