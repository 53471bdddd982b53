//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub rpc: RpcSettings,
    /// Engine settings keyed by currency code ("BTC", "XMR", "ETH")
    #[serde(default)]
    pub wallets: BTreeMap<String, EngineSettings>,
}

/// Timeouts shared by every engine
#[derive(Debug, Clone, Deserialize)]
pub struct RpcSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Bound on short engine commands and password prompts
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl RpcSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Flat per-currency engine record
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Wallet (or node) executable
    pub wallet_bin_path: PathBuf,
    /// Separate daemon executable (XMR)
    #[serde(default)]
    pub daemon_bin_path: Option<PathBuf>,
    /// Datastore directory holding wallet files and chain data
    pub datastore_path: PathBuf,
    /// Wallet file name inside the engine's wallet directory
    pub wallet_filename: String,
    pub wallet_password: Secret,
    /// Local port for the wallet RPC server
    pub rpcport: u16,
    /// Local port for the daemon RPC server (XMR)
    #[serde(default)]
    pub daemon_port: Option<u16>,
    /// RPC credentials (BTC)
    #[serde(default)]
    pub rpcuser: Option<String>,
    #[serde(default)]
    pub rpcpassword: Option<Secret>,
    /// Override the engine version string checked at startup
    #[serde(default)]
    pub expected_version: Option<String>,
    /// Override the readiness ceiling for slow engines
    #[serde(default)]
    pub readiness_timeout_secs: Option<u64>,
    #[serde(skip)]
    pub rpc: RpcSettings,
}

/// A string that never shows up in logs or debug output
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

// Default value functions
fn default_timeout_ms() -> u64 {
    30000
}

fn default_command_timeout_secs() -> u64 {
    60
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("rpc.timeout_ms", default_timeout_ms() as i64)?
            .set_default("rpc.command_timeout_secs", default_command_timeout_secs() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix COFFER_)
            .add_source(
                config::Environment::with_prefix("COFFER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let mut config: AppConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Currency codes are matched upper-case; sources may lower-case keys
        config.wallets = std::mem::take(&mut config.wallets)
            .into_iter()
            .map(|(code, mut engine)| {
                engine.rpc = config.rpc.clone();
                (code.to_ascii_uppercase(), engine)
            })
            .collect();

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.rpc.timeout_ms == 0 {
            anyhow::bail!("rpc.timeout_ms must be positive");
        }

        if self.rpc.command_timeout_secs == 0 {
            anyhow::bail!("rpc.command_timeout_secs must be positive");
        }

        for (currency, engine) in &self.wallets {
            if engine.rpcport == 0 {
                anyhow::bail!("{}: rpcport must be a non-zero port", currency);
            }
            if engine.daemon_port == Some(0) {
                anyhow::bail!("{}: daemon_port must be a non-zero port", currency);
            }
            if engine.wallet_filename.trim().is_empty() {
                anyhow::bail!("{}: wallet_filename must not be empty", currency);
            }
            if engine.wallet_bin_path.as_os_str().is_empty() {
                anyhow::bail!("{}: wallet_bin_path must not be empty", currency);
            }
            if engine.readiness_timeout_secs == Some(0) {
                anyhow::bail!("{}: readiness_timeout_secs must be positive", currency);
            }
        }

        if self.wallets.is_empty() {
            tracing::warn!("No wallets configured");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        let mut out = String::from("Configuration:\n");
        let _ = writeln!(
            out,
            "  RPC:\n    timeout: {}ms\n    command_timeout: {}s",
            self.rpc.timeout_ms, self.rpc.command_timeout_secs
        );

        for (currency, engine) in &self.wallets {
            let _ = writeln!(out, "  {}:", currency);
            let _ = writeln!(out, "    wallet_bin: {}", engine.wallet_bin_path.display());
            if let Some(daemon) = &engine.daemon_bin_path {
                let _ = writeln!(out, "    daemon_bin: {}", daemon.display());
            }
            let _ = writeln!(out, "    datastore: {}", engine.datastore_path.display());
            let _ = writeln!(out, "    wallet_file: {}", engine.wallet_filename);
            let _ = writeln!(out, "    wallet_password: {}", mask(&engine.wallet_password));
            let _ = writeln!(out, "    rpcport: {}", engine.rpcport);
            if let Some(port) = engine.daemon_port {
                let _ = writeln!(out, "    daemon_port: {}", port);
            }
            if let Some(user) = &engine.rpcuser {
                let _ = writeln!(out, "    rpcuser: {}", user);
            }
            if let Some(password) = &engine.rpcpassword {
                let _ = writeln!(out, "    rpcpassword: {}", mask(password));
            }
        }

        out
    }
}

fn mask(secret: &Secret) -> &'static str {
    if secret.is_empty() {
        "(not set)"
    } else {
        "***"
    }
}
