//! TOML file configuration for the `listupdate` binary.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use listupdate_core::protocol::constants::{DEFAULT_POLL_INTERVAL, FETCH_TIMEOUT};
use listupdate_core::transport::http::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use listupdate_core::{FailureClass, ManagerOptions, ProtocolConfig};
use serde::Deserialize;

/// Contents of the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Client name sent as `client=`.
    pub client: String,
    /// Client version sent as `appver=`.
    pub version: String,
    /// Primary update server prefix.
    pub url_prefix: String,
    /// Optional API key sent as `key=`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Lists to keep current, in request order.
    pub lists: Vec<String>,
    /// Extra query appended to every request URL.
    #[serde(default)]
    pub additional_query: Option<String>,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Backup prefixes, one per failure class.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    pub connect: Option<String>,
    pub http: Option<String>,
    pub network: Option<String>,
}

/// Timing overrides, all in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout_secs(),
            read_secs: default_read_timeout_secs(),
            fetch_secs: default_fetch_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    CONNECT_TIMEOUT_SECS
}
fn default_read_timeout_secs() -> u64 {
    READ_TIMEOUT_SECS
}
fn default_fetch_timeout_secs() -> u64 {
    FETCH_TIMEOUT.as_secs()
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL.as_secs()
}

impl FileConfig {
    /// Reads and validates the config file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::parse(&raw)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))
    }

    fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates values the protocol layer does not check itself.
    pub fn validate(&self) -> Result<()> {
        if self.lists.is_empty() {
            bail!("Invalid config value for `lists`: at least one list is required");
        }
        if let Some(name) = self.lists.iter().find(|name| !is_valid_list_name(name)) {
            bail!("Invalid list name '{name}': expected non-empty name without ';', ':' or whitespace");
        }
        validate_timeout_secs("timeouts.connect_secs", self.timeouts.connect_secs)?;
        validate_timeout_secs("timeouts.read_secs", self.timeouts.read_secs)?;
        validate_timeout_secs("timeouts.fetch_secs", self.timeouts.fetch_secs)?;
        if self.timeouts.poll_interval_secs < 60 {
            bail!(
                "Invalid config value for `timeouts.poll_interval_secs`: {}. Expected at least 60",
                self.timeouts.poll_interval_secs
            );
        }
        Ok(())
    }

    /// Builds the protocol identity and endpoint set.
    pub fn protocol_config(&self) -> Result<ProtocolConfig> {
        let mut builder =
            ProtocolConfig::builder(&self.client, &self.version, &self.url_prefix);
        if let Some(key) = &self.api_key {
            builder = builder.api_key(key);
        }
        let backups = [
            (FailureClass::Connect, &self.backup.connect),
            (FailureClass::Http, &self.backup.http),
            (FailureClass::Network, &self.backup.network),
        ];
        for (class, prefix) in backups {
            if let Some(prefix) = prefix {
                builder = builder.backup_prefix(class, prefix);
            }
        }
        Ok(builder.build()?)
    }

    /// Manager tunables; fuzz is drawn at random.
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            fetch_timeout: Duration::from_secs(self.timeouts.fetch_secs),
            poll_interval: Duration::from_secs(self.timeouts.poll_interval_secs),
            ..ManagerOptions::default()
        }
    }
}

fn is_valid_list_name(name: &str) -> bool {
    !name.is_empty() && !name.contains([';', ':']) && !name.contains(char::is_whitespace)
}

fn validate_timeout_secs(field: &str, value: u64) -> Result<()> {
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}
