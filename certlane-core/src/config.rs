//! Site configuration
//!
//! The declarative site list, loaded from YAML once at startup and read-only
//! afterwards. Each site names the DNS domains to put on one certificate,
//! the ACME contact, the DNS-01 provider, and the provider credentials as
//! `KEY=VALUE` pairs under `legoenv`.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse sites config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("duplicate site name '{0}'")]
    DuplicateSiteName(String),

    #[error("site '{0}' has no domains")]
    NoDomains(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SitesConfig {
    #[serde(default)]
    pub sites: Vec<Site>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Site {
    /// Unique, filesystem- and url-safe identifier; also the store key.
    pub name: String,

    /// DNS-01 provider to solve challenges with.
    pub provider: String,

    /// ACME account contact.
    pub email: String,

    /// Domains on the certificate; the first is the common name and the
    /// SDS resource name.
    pub domains: Vec<String>,

    /// Per-site provider credentials as `KEY=VALUE` strings.
    #[serde(rename = "legoenv", default)]
    pub lego_env: Vec<String>,
}

impl Site {
    /// The environment variable names this site touches, malformed entries
    /// included (those still get wiped between sites).
    pub fn env_keys(&self) -> impl Iterator<Item = &str> {
        self.lego_env
            .iter()
            .filter_map(|entry| entry.split_once('=').map(|(key, _)| key))
            .filter(|key| !key.is_empty())
    }
}

/// Split one `legoenv` entry into a key/value pair.
///
/// Keys must match `[A-Z0-9_]+`; anything else is rejected and the caller
/// logs and skips the entry. Only the first `=` separates key from value:
/// everything after it belongs to the value, so credentials like webhook
/// urls with query strings survive intact.
pub fn parse_env_pair(entry: &str) -> Option<(&str, &str)> {
    let (key, value) = entry.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    if !key
        .bytes()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
    {
        return None;
    }
    Some((key, value))
}

impl SitesConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: SitesConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for site in &self.sites {
            if !seen.insert(site.name.as_str()) {
                return Err(ConfigError::DuplicateSiteName(site.name.clone()));
            }
            if site.domains.is_empty() {
                return Err(ConfigError::NoDomains(site.name.clone()));
            }
        }
        Ok(())
    }
}

/// Load and validate the sites file.
pub fn load_sites_file(path: impl AsRef<Path>) -> Result<SitesConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    SitesConfig::from_yaml(&text)
}
