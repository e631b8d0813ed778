//! The host configuration.

use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{token::TokenMatcher, HostError, HostResult};

use super::{
    CONFIG_PATH_ENV_VAR, DEFAULT_BIND_ADDR, DEFAULT_CONTRACTS_DIR, DEFAULT_DATABASE_PATH,
    DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_MILLISECONDS_PER_COMPUTE_UNIT, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_PORT, DEFAULT_RUNTIME_DIR, DEFAULT_SANDBOX_STARTUP_TIMEOUT_MS, DEFAULT_TOKEN_PATTERN,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The configuration consumed by the router, the instance manager and the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct HostConfig {
    /// The public TLS port. `0` lets the OS pick one.
    #[serde(default = "default_port")]
    #[builder(default = DEFAULT_PORT)]
    port: u16,

    /// The address the public listener binds to.
    #[serde(default = "default_bind_addr")]
    #[builder(default = *DEFAULT_BIND_ADDR)]
    bind_addr: IpAddr,

    /// The TLS material served on the public port.
    #[serde(default)]
    #[builder(default)]
    tls: TlsConfig,

    /// The period of the metering tick in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    #[builder(default = DEFAULT_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,

    /// Milliseconds of wall-clock time per compute unit charged.
    #[serde(default = "default_milliseconds_per_compute_unit")]
    #[builder(default = DEFAULT_MILLISECONDS_PER_COMPUTE_UNIT)]
    milliseconds_per_compute_unit: u64,

    /// How long an instance may go without traffic before it is torn down.
    #[serde(default = "default_idle_timeout_ms")]
    #[builder(default = DEFAULT_IDLE_TIMEOUT_MS)]
    idle_timeout_ms: u64,

    /// The regex a server name label must match to be treated as a token.
    #[serde(default = "default_token_pattern")]
    #[builder(default = DEFAULT_TOKEN_PATTERN.to_string(), setter(into))]
    token_pattern: String,

    /// The path to the SQLite balance ledger.
    #[serde(default = "default_database_path")]
    #[builder(default = DEFAULT_DATABASE_PATH.clone(), setter(into))]
    database_path: PathBuf,

    /// Whether the control plane exposes the development funding route.
    #[serde(default)]
    #[builder(default)]
    dev_funding: bool,

    /// How contract sandboxes are launched.
    #[serde(default)]
    #[builder(default)]
    sandbox: SandboxConfig,
}

/// Paths to the PEM encoded TLS material.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct TlsConfig {
    /// The certificate chain.
    #[builder(setter(into))]
    cert: PathBuf,

    /// The private key.
    #[builder(setter(into))]
    key: PathBuf,

    /// Additional CA certificates appended to the served chain.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option, into))]
    ca: Option<PathBuf>,
}

/// How the process sandbox engine launches contracts.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SandboxConfig {
    /// The program that runs a staged contract.
    #[serde(default)]
    #[builder(default, setter(into))]
    command: String,

    /// Arguments passed to the program.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    args: Vec<String>,

    /// The directory holding staged contracts, one sub directory per contract hash.
    #[serde(default = "default_contracts_dir")]
    #[builder(default = DEFAULT_CONTRACTS_DIR.clone(), setter(into))]
    contracts_dir: PathBuf,

    /// The directory sandbox sockets are created in.
    #[serde(default = "default_runtime_dir")]
    #[builder(default = DEFAULT_RUNTIME_DIR.clone(), setter(into))]
    runtime_dir: PathBuf,

    /// How long a started sandbox has to accept its first stream.
    #[serde(default = "default_startup_timeout_ms")]
    #[builder(default = DEFAULT_SANDBOX_STARTUP_TIMEOUT_MS)]
    startup_timeout_ms: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HostConfig {
    /// Loads the configuration from `path`, or from the file named by `CONTRACTHOST_CONFIG`.
    ///
    /// With neither present the defaults are used.
    pub async fn load(path: Option<&Path>) -> HostResult<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os(CONFIG_PATH_ENV_VAR).map(PathBuf::from),
        };

        let config = match path {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading configuration");
                let contents = tokio::fs::read_to_string(&path).await?;
                toml::from_str::<HostConfig>(&contents)?
            }
            None => {
                tracing::warn!("no configuration file given, using defaults");
                HostConfig::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks the values that would make metering or routing meaningless.
    pub fn validate(&self) -> HostResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(HostError::InvalidConfig(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.milliseconds_per_compute_unit == 0 {
            return Err(HostError::InvalidConfig(
                "milliseconds_per_compute_unit must be greater than zero".to_string(),
            ));
        }

        if self.idle_timeout_ms == 0 {
            return Err(HostError::InvalidConfig(
                "idle_timeout_ms must be greater than zero".to_string(),
            ));
        }

        TokenMatcher::new(&self.token_pattern)
            .map_err(|e| HostError::InvalidConfig(format!("token_pattern: {}", e)))?;

        Ok(())
    }

    /// The metering tick period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The idle budget of an instance.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Returns the configuration with the public port replaced.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builds the matcher for the configured token pattern.
    pub fn token_matcher(&self) -> HostResult<TokenMatcher> {
        TokenMatcher::new(&self.token_pattern)
    }
}

impl SandboxConfig {
    /// How long a started sandbox has to accept its first stream.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for HostConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: PathBuf::from("tls/server.crt"),
            key: PathBuf::from("tls/server.key"),
            ca: None,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Serde Defaults
//--------------------------------------------------------------------------------------------------

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_addr() -> IpAddr {
    *DEFAULT_BIND_ADDR
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_milliseconds_per_compute_unit() -> u64 {
    DEFAULT_MILLISECONDS_PER_COMPUTE_UNIT
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

fn default_token_pattern() -> String {
    DEFAULT_TOKEN_PATTERN.to_string()
}

fn default_database_path() -> PathBuf {
    DEFAULT_DATABASE_PATH.clone()
}

fn default_contracts_dir() -> PathBuf {
    DEFAULT_CONTRACTS_DIR.clone()
}

fn default_runtime_dir() -> PathBuf {
    DEFAULT_RUNTIME_DIR.clone()
}

fn default_startup_timeout_ms() -> u64 {
    DEFAULT_SANDBOX_STARTUP_TIMEOUT_MS
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_config_uses_defaults() -> anyhow::Result<()> {
        let config: HostConfig = toml::from_str(
            r#"
            port = 0
            milliseconds_per_compute_unit = 250

            [tls]
            cert = "/etc/contracthost/cert.pem"
            key = "/etc/contracthost/key.pem"

            [sandbox]
            command = "node"
            args = ["run.js"]
            "#,
        )?;

        assert_eq!(*config.get_port(), 0);
        assert_eq!(*config.get_milliseconds_per_compute_unit(), 250);
        assert_eq!(*config.get_poll_interval_ms(), DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.get_token_pattern(), DEFAULT_TOKEN_PATTERN);
        assert_eq!(
            config.get_tls().get_cert(),
            &PathBuf::from("/etc/contracthost/cert.pem")
        );
        assert_eq!(config.get_tls().get_ca(), &None);
        assert_eq!(config.get_sandbox().get_command(), "node");
        assert_eq!(config.get_sandbox().get_args(), &vec!["run.js".to_string()]);
        assert!(!config.get_dev_funding());
        config.validate()?;

        Ok(())
    }

    #[test]
    fn test_validate_rejects_zero_rates() {
        let config = HostConfig::builder().poll_interval_ms(0).build();
        assert!(matches!(config.validate(), Err(HostError::InvalidConfig(_))));

        let config = HostConfig::builder().milliseconds_per_compute_unit(0).build();
        assert!(matches!(config.validate(), Err(HostError::InvalidConfig(_))));

        let config = HostConfig::builder().idle_timeout_ms(0).build();
        assert!(matches!(config.validate(), Err(HostError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_bad_token_pattern() {
        let config = HostConfig::builder().token_pattern("(unclosed").build();
        assert!(matches!(config.validate(), Err(HostError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_load_from_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("contracthost.toml");
        tokio::fs::write(&path, "port = 8443\ndev_funding = true\n").await?;

        let config = HostConfig::load(Some(path.as_path())).await?;
        assert_eq!(*config.get_port(), 8443);
        assert!(*config.get_dev_funding());

        Ok(())
    }
}
