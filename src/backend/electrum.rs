//! Bitcoin through Electrum 3.1.3
//!
//! Electrum runs as a detached daemon; configuration and wallet loading go
//! through short-lived `electrum` invocations, everything else over JSON-RPC.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    ensure_fee_below, ensure_fee_matches, ensure_version, readiness_policy,
    validate_payment_amounts, EngineState, WalletBackend,
};
use crate::config::{EngineSettings, Secret};
use crate::currency::Currency;
use crate::error::{Error, Result};
use crate::history::{self, btc, Transaction};
use crate::rpc::{loopback_url, JsonRpcClient, RpcTransport};
use crate::supervisor::{self, LaunchSpec};
use crate::units::{ceil_atomic, decimal_from_json, from_atomic, to_atomic, SATOSHI};

pub const DEFAULT_VERSION: &str = "3.1.3";

/// Typical transaction size used to turn a fee rate into a fee
pub const TYPICAL_TX_BYTES: u32 = 226;

/// 1 mBTC
pub fn fee_ceiling() -> Decimal {
    Decimal::new(1, 3)
}

pub struct ElectrumBackend {
    settings: EngineSettings,
    transport: Option<Arc<dyn RpcTransport>>,
    state: EngineState,
}

impl ElectrumBackend {
    pub fn new(settings: EngineSettings) -> Result<Self> {
        if settings.rpcuser.is_none() || settings.rpcpassword.is_none() {
            return Err(Error::Config(
                "BTC requires rpcuser and rpcpassword".to_string(),
            ));
        }

        Ok(Self {
            settings,
            transport: None,
            state: EngineState::NotStarted,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_transport(settings: EngineSettings, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            settings,
            transport: Some(transport),
            state: EngineState::NotStarted,
        }
    }

    fn wallet_file(&self) -> PathBuf {
        self.settings
            .datastore_path
            .join("wallets")
            .join(&self.settings.wallet_filename)
    }

    fn rpc(&mut self) -> Result<Arc<dyn RpcTransport>> {
        if let Some(transport) = &self.transport {
            return Ok(transport.clone());
        }

        let user = self.settings.rpcuser.clone().unwrap_or_default();
        let password = self
            .settings
            .rpcpassword
            .clone()
            .unwrap_or_else(|| Secret::new(""));

        let client = JsonRpcClient::new(
            loopback_url(self.settings.rpcport, "")?,
            self.settings.rpc.request_timeout(),
        )?
        .with_basic_auth(user, password);

        let transport: Arc<dyn RpcTransport> = Arc::new(client);
        self.transport = Some(transport.clone());
        Ok(transport)
    }

    /// `electrum <args> --dir <datastore> --wallet <file>`
    fn command(&self, args: &[&str]) -> LaunchSpec {
        self.with_wallet(self.base_command().args(args.iter().copied()))
    }

    fn base_command(&self) -> LaunchSpec {
        LaunchSpec::new(
            "electrum",
            &self.settings.wallet_bin_path,
            &self.settings.datastore_path,
        )
    }

    fn with_wallet(&self, spec: LaunchSpec) -> LaunchSpec {
        spec.args([
            "--dir".to_string(),
            self.settings.datastore_path.display().to_string(),
            "--wallet".to_string(),
            self.wallet_file().display().to_string(),
        ])
        .wallet_file(self.wallet_file())
    }

    async fn run(&self, spec: LaunchSpec) -> Result<String> {
        let done = supervisor::run_command(&spec, self.settings.rpc.command_timeout()).await?;
        if !done.success() {
            return Err(Error::UnexpectedProcessOutput {
                expected: format!("{} to succeed", spec.display()),
                output: done.output,
            });
        }
        Ok(done.output)
    }

    async fn configure_rpc(&self) -> Result<()> {
        let port = self.settings.rpcport.to_string();
        let user = self.settings.rpcuser.clone().unwrap_or_default();
        let password = self
            .settings
            .rpcpassword
            .as_ref()
            .map(|p| p.expose().to_string())
            .unwrap_or_default();

        self.run(self.command(&["setconfig", "rpcuser", user.as_str()])).await?;
        let set_password = self
            .base_command()
            .args(["setconfig", "rpcpassword"])
            .secret_arg(password);
        self.run(self.with_wallet(set_password)).await?;
        self.run(self.command(&["setconfig", "rpcport", port.as_str()])).await?;
        Ok(())
    }

    /// `daemon load_wallet` either asks for the password or is already done
    async fn load_wallet(&self) -> Result<()> {
        let timeout = self.settings.rpc.command_timeout();
        let mut process = supervisor::launch(&self.command(&["daemon", "load_wallet"]))?;

        let matched = process.expect_any(&["Password:", "true"], timeout).await?;
        if matched == 0 {
            info!("Sending wallet password to Electrum");
            process.send_line(self.settings.wallet_password.expose()).await?;
        }

        let done = process.finish(timeout).await?;
        if !done.success() {
            return Err(Error::UnexpectedProcessOutput {
                expected: "wallet loaded".to_string(),
                output: done.output,
            });
        }
        Ok(())
    }

    async fn check_version(&self) -> Result<()> {
        let expected = self
            .settings
            .expected_version
            .as_deref()
            .unwrap_or(DEFAULT_VERSION);
        let output = self.run(self.command(&["version"])).await?;
        ensure_version(&output, expected)
    }

    /// Fee for a typical transaction, in satoshi
    async fn quote_fee(&mut self) -> Result<u128> {
        let rpc = self.rpc()?;
        let rate = decimal_from_json(&rpc.call("getfeerate", json!([])).await?)?;
        if rate.is_sign_negative() {
            return Err(Error::MalformedResponse(format!("negative fee rate {}", rate)));
        }

        // sat/kB * bytes / 1000, rounded up to a whole satoshi
        ceil_atomic(rate * Decimal::from(TYPICAL_TX_BYTES) / Decimal::from(1000))
    }

    async fn validate_address(&mut self, address: &str) -> Result<()> {
        let rpc = self.rpc()?;
        match rpc.call("validateaddress", json!([address])).await {
            Ok(Value::Bool(true)) => Ok(()),
            Ok(_) => Err(Error::InvalidAddress(address.to_string())),
            Err(e) if e.is_connection_failure() => Err(e),
            Err(e) => Err(Error::InvalidAddress(format!("{}: {}", address, e))),
        }
    }
}

#[async_trait]
impl WalletBackend for ElectrumBackend {
    fn currency(&self) -> Currency {
        Currency::Btc
    }

    async fn is_ready(&mut self) -> bool {
        match self.rpc() {
            Ok(rpc) => rpc.call("version", json!([])).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn start_server(&mut self) -> Result<()> {
        if self.state == EngineState::Stopped {
            return Err(Error::BackendStopped);
        }

        if self.is_ready().await {
            info!("BTC daemon already running");
            return self.state.advance(Currency::Btc, EngineState::Ready);
        }

        self.state.advance(Currency::Btc, EngineState::Configuring)?;
        self.configure_rpc().await?;

        self.state.advance(Currency::Btc, EngineState::DaemonStarting)?;
        supervisor::launch(&self.command(&["daemon", "start"]).detached())?;

        let rpc = self.rpc()?;
        debug!("Waiting for BTC daemon RPC at {}", rpc.endpoint());
        supervisor::wait_until_ready(
            move || {
                let rpc = rpc.clone();
                async move { rpc.call("version", json!([])).await.is_ok() }
            },
            "BTC daemon RPC",
            readiness_policy(&self.settings),
        )
        .await?;
        self.state.advance(Currency::Btc, EngineState::DaemonReady)?;

        self.state.advance(Currency::Btc, EngineState::WalletLoading)?;
        self.load_wallet().await?;

        self.check_version().await?;
        self.state.advance(Currency::Btc, EngineState::Ready)?;
        info!("BTC wallet ready");
        Ok(())
    }

    async fn stop_server(&mut self) -> Result<()> {
        if self.state == EngineState::Stopped {
            return Ok(());
        }

        let done = supervisor::run_command(
            &self.command(&["daemon", "stop"]),
            self.settings.rpc.command_timeout(),
        )
        .await?;

        if !done.success() {
            if done.output.contains("not running") {
                warn!("BTC daemon was not running");
            } else {
                return Err(Error::ShutdownFailed(done.output));
            }
        }

        self.transport = None;
        self.state.advance(Currency::Btc, EngineState::Stopped)?;
        info!("BTC daemon stopped");
        Ok(())
    }

    async fn get_balance(&mut self) -> Result<Decimal> {
        let balance = self.rpc()?.call("getbalance", json!([])).await?;
        let confirmed = balance
            .get("confirmed")
            .ok_or_else(|| Error::MalformedResponse(format!("getbalance without confirmed: {}", balance)))?;
        decimal_from_json(confirmed)
    }

    async fn get_receive_address(&mut self) -> Result<String> {
        // Imported keystores have no unused address to hand out
        match self.rpc()?.call("getunusedaddress", json!([])).await {
            Ok(Value::String(address)) if !address.is_empty() => Ok(address),
            Ok(other) => Err(Error::NoAddressAvailable(format!(
                "getunusedaddress returned {}",
                other
            ))),
            Err(e) if e.is_connection_failure() => Err(e),
            Err(e) => Err(Error::NoAddressAvailable(e.to_string())),
        }
    }

    async fn suggest_miner_fee(&mut self) -> Result<Decimal> {
        let fee = from_atomic(self.quote_fee().await?, SATOSHI)?;
        ensure_fee_below(fee, fee_ceiling())?;
        debug!("BTC miner fee estimate: {}", fee);
        Ok(fee)
    }

    async fn transactions_since(&mut self, cutoff: i64) -> Result<Vec<Transaction>> {
        history::validate_cutoff(cutoff)?;
        let raw = self.rpc()?.call("history", json!([])).await?;
        btc::normalize(&btc::parse_history(&raw)?, cutoff)
    }

    async fn perform_transaction(
        &mut self,
        net_amount: Decimal,
        miner_fee: Decimal,
        target_address: &str,
    ) -> Result<String> {
        validate_payment_amounts(net_amount, miner_fee)?;
        self.validate_address(target_address).await?;

        to_atomic(net_amount, SATOSHI)?;
        let fee_atoms = to_atomic(miner_fee, SATOSHI)?;
        ensure_fee_matches(fee_atoms, self.quote_fee().await?, SATOSHI)?;

        debug!(
            "Executing BTC payment: {} (fee {}) to {}",
            net_amount, miner_fee, target_address
        );

        let rpc = self.rpc()?;
        let signed = rpc
            .call(
                "payto",
                json!({
                    "destination": target_address,
                    "amount": net_amount.to_string(),
                    "fee": miner_fee.to_string(),
                    "password": self.settings.wallet_password.expose(),
                }),
            )
            .await?;

        let hex = match &signed {
            Value::String(hex) => hex.clone(),
            other => other
                .get("hex")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::MalformedResponse("payto returned no transaction hex".to_string()))?,
        };

        let broadcast = rpc
            .call("broadcast", json!([hex]))
            .await
            .map_err(|e| Error::BroadcastFailed(e.to_string()))?;

        // [success, txid or reason], or a bare txid
        let txid = match broadcast {
            Value::Array(parts) => match (parts.first(), parts.get(1)) {
                (Some(Value::Bool(true)), Some(Value::String(txid))) => txid.clone(),
                (_, reason) => {
                    return Err(Error::BroadcastFailed(
                        reason.map(Value::to_string).unwrap_or_default(),
                    ))
                }
            },
            Value::String(txid) => txid,
            other => return Err(Error::BroadcastFailed(other.to_string())),
        };

        info!(
            "BTC payment complete: {} to {} (txid: {})",
            net_amount, target_address, txid
        );

        Ok(txid)
    }
}
