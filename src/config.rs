// src/config.rs
//! Service configuration.
//!
//! Settings are read from a YAML file (default `config.yaml`) and may be
//! overridden by `ONBOARD__*` environment variables. The file holds one block
//! per runtime environment; the active block is selected with `ONBOARD_ENV`.
//!
//! ```yaml
//! database_url: sqlite://data/onboarding.db?mode=rwc
//! listen_addr: 0.0.0.0:7777
//! environments:
//!   dev:
//!     private_key_file: secrets/private_key.hex
//!     machine_credential_file: secrets/machine_credential.jwt
//!     my_did_key: did:key:zDnae...
//!     verifier:
//!       url: https://verifier.example.org
//!       token_endpoint: https://verifier.example.org/oidc/token
//!     issuer:
//!       credential_issuance_path: https://issuer.example.org/issuance
//! ```

use crate::errors::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Deployment environment. Drives the registration conflict policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RuntimeEnv {
    #[serde(rename = "dev")]
    Development,
    #[serde(rename = "pre")]
    Preproduction,
    #[serde(rename = "pro")]
    Production,
}

impl RuntimeEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeEnv::Development => "dev",
            RuntimeEnv::Preproduction => "pre",
            RuntimeEnv::Production => "pro",
        }
    }
}

impl FromStr for RuntimeEnv {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(RuntimeEnv::Development),
            "pre" => Ok(RuntimeEnv::Preproduction),
            "pro" => Ok(RuntimeEnv::Production),
            other => Err(ConfigError::InvalidRuntime(other.to_string())),
        }
    }
}

impl fmt::Display for RuntimeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Directory with the pre-generated frontend, served for unmatched paths
    #[serde(default)]
    pub static_dir: Option<PathBuf>,

    /// Request timeout for calls to the Verifier and the Issuer
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    pub environments: HashMap<String, EnvConfig>,
}

/// Settings for one runtime environment.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvConfig {
    /// Raw hex P-256 scalar (optionally `0x`-prefixed)
    pub private_key_file: PathBuf,
    /// Machine credential presented to the Verifier
    pub machine_credential_file: PathBuf,
    /// did:key expected to match `private_key_file`
    pub my_did_key: String,
    pub verifier: VerifierConfig,
    pub issuer: IssuerConfig,
    #[serde(default)]
    pub mail: MailConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifierConfig {
    pub url: String,
    pub token_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssuerConfig {
    pub credential_issuance_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub onboard_team_email: Vec<String>,
    #[serde(default)]
    pub issuer_team_email: Vec<String>,
    #[serde(default)]
    pub cc_list_email: Vec<String>,
    #[serde(default)]
    pub smtp: SmtpConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

fn default_database_url() -> String {
    "sqlite://data/onboarding.db?mode=rwc".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:7777".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_smtp_port() -> u16 {
    587
}

impl AppConfig {
    /// Loads the configuration file at `path` and applies `ONBOARD__*`
    /// environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("ONBOARD").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Returns the settings block for `runtime`.
    pub fn environment(&self, runtime: RuntimeEnv) -> Result<&EnvConfig, ConfigError> {
        self.environments
            .get(runtime.as_str())
            .ok_or_else(|| ConfigError::UnknownEnvironment(runtime.to_string()))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Reads a secret file (password, credential) and trims surrounding whitespace.
pub fn read_secret_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| ConfigError::File {
            path: path.display().to_string(),
            source,
        })
}
