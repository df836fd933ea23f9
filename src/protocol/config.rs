//! Immutable per-manager protocol configuration.

use url::Url;

use super::constants::DEFAULT_PROTOCOL_VERSION;
use super::error::ConfigError;

/// Failure class of a primary update fetch; selects the backup prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Connection reset/refused/aborted, timeouts, and other socket failures.
    Connect,
    /// Non-200 status, or a 200 whose body could not be parsed.
    Http,
    /// Link down or name resolution failure.
    Network,
}

impl FailureClass {
    /// Short label for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Http => "http",
            Self::Network => "network",
        }
    }
}

/// Identity and endpoints of the list-distribution service.
///
/// Built once through [`ProtocolConfig::builder`] and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    client_name: String,
    version: String,
    protocol_version: String,
    url_prefix: String,
    backup_connect_prefix: Option<String>,
    backup_http_prefix: Option<String>,
    backup_network_prefix: Option<String>,
    api_key: Option<String>,
}

impl ProtocolConfig {
    /// Starts a builder with the required fields.
    pub fn builder(
        client_name: impl Into<String>,
        version: impl Into<String>,
        url_prefix: impl Into<String>,
    ) -> ProtocolConfigBuilder {
        ProtocolConfigBuilder {
            config: Self {
                client_name: client_name.into(),
                version: version.into(),
                protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
                url_prefix: url_prefix.into(),
                backup_connect_prefix: None,
                backup_http_prefix: None,
                backup_network_prefix: None,
                api_key: None,
            },
        }
    }

    #[must_use]
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    #[must_use]
    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Backup prefix for a failure class, if one is configured.
    #[must_use]
    pub fn backup_prefix(&self, class: FailureClass) -> Option<&str> {
        match class {
            FailureClass::Connect => self.backup_connect_prefix.as_deref(),
            FailureClass::Http => self.backup_http_prefix.as_deref(),
            FailureClass::Network => self.backup_network_prefix.as_deref(),
        }
    }
}

/// Builder for [`ProtocolConfig`].
#[derive(Debug, Clone)]
pub struct ProtocolConfigBuilder {
    config: ProtocolConfig,
}

impl ProtocolConfigBuilder {
    #[must_use]
    pub fn protocol_version(mut self, protocol_version: impl Into<String>) -> Self {
        self.config.protocol_version = protocol_version.into();
        self
    }

    #[must_use]
    pub fn backup_prefix(mut self, class: FailureClass, prefix: impl Into<String>) -> Self {
        let prefix = Some(prefix.into());
        match class {
            FailureClass::Connect => self.config.backup_connect_prefix = prefix,
            FailureClass::Http => self.config.backup_http_prefix = prefix,
            FailureClass::Network => self.config.backup_network_prefix = prefix,
        }
        self
    }

    #[must_use]
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        self.config.api_key = (!api_key.is_empty()).then_some(api_key);
        self
    }

    /// Validates and returns the configuration.
    ///
    /// Trailing slashes on prefixes are trimmed so `<prefix>/downloads` never
    /// doubles them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the client name, version, or protocol
    /// version is empty, or when any prefix is not an http(s) URL.
    pub fn build(mut self) -> Result<ProtocolConfig, ConfigError> {
        let config = &mut self.config;
        require_non_empty("client_name", &config.client_name)?;
        require_non_empty("version", &config.version)?;
        require_non_empty("protocol_version", &config.protocol_version)?;

        config.url_prefix = validate_prefix("url_prefix", &config.url_prefix)?;
        for (field, prefix) in [
            ("backup_connect_prefix", &mut config.backup_connect_prefix),
            ("backup_http_prefix", &mut config.backup_http_prefix),
            ("backup_network_prefix", &mut config.backup_network_prefix),
        ] {
            if let Some(value) = prefix.as_mut() {
                *value = validate_prefix(field, value)?;
            }
        }

        Ok(self.config)
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Empty { field });
    }
    Ok(())
}

fn validate_prefix(field: &'static str, value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim().trim_end_matches('/');
    let invalid = || ConfigError::InvalidPrefix {
        field,
        value: value.to_string(),
    };

    let parsed = Url::parse(trimmed).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.query().is_some() {
        return Err(invalid());
    }
    Ok(trimmed.to_string())
}
