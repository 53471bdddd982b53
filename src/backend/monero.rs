//! Monero through monerod + monero-wallet-rpc (v0.12.2.0)

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
use crate::config::EngineSettings;
use crate::currency::Currency;
use crate::error::{Error, Result};
use crate::history::{self, xmr, Transaction};
use crate::rpc::{loopback_url, EndpointClient, JsonRpcClient, RpcTransport};
use crate::supervisor::{self, EngineProcess, LaunchSpec};
use crate::units::{atomic_from_json, from_atomic, to_atomic, PICONERO};

pub const DEFAULT_VERSION: &str = "Monero 'Lithium Luna' (v0.12.2.0-release)";

/// 0.01 XMR
pub fn fee_ceiling() -> Decimal {
    Decimal::new(1, 2)
}

pub struct MoneroBackend {
    settings: EngineSettings,
    daemon_bin_path: PathBuf,
    daemon_port: u16,
    wallet: Option<Arc<dyn RpcTransport>>,
    daemon: Option<Arc<dyn RpcTransport>>,
    /// monero-wallet-rpc dies with us
    wallet_process: Option<EngineProcess>,
    state: EngineState,
}

impl MoneroBackend {
    pub fn new(settings: EngineSettings) -> Result<Self> {
        let daemon_bin_path = settings
            .daemon_bin_path
            .clone()
            .ok_or_else(|| Error::Config("XMR requires daemon_bin_path".to_string()))?;
        let daemon_port = settings
            .daemon_port
            .ok_or_else(|| Error::Config("XMR requires daemon_port".to_string()))?;

        Ok(Self {
            settings,
            daemon_bin_path,
            daemon_port,
            wallet: None,
            daemon: None,
            wallet_process: None,
            state: EngineState::NotStarted,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_transports(
        settings: EngineSettings,
        wallet: Arc<dyn RpcTransport>,
        daemon: Arc<dyn RpcTransport>,
    ) -> Self {
        let mut backend = Self::new(settings).expect("test settings carry daemon fields");
        backend.wallet = Some(wallet);
        backend.daemon = Some(daemon);
        backend
    }

    fn wallet_file(&self) -> PathBuf {
        self.settings
            .datastore_path
            .join("wallets")
            .join(&self.settings.wallet_filename)
    }

    fn wallet_rpc(&mut self) -> Result<Arc<dyn RpcTransport>> {
        if let Some(transport) = &self.wallet {
            return Ok(transport.clone());
        }
        let client = JsonRpcClient::new(
            loopback_url(self.settings.rpcport, "json_rpc")?,
            self.settings.rpc.request_timeout(),
        )?;
        let transport: Arc<dyn RpcTransport> = Arc::new(client);
        self.wallet = Some(transport.clone());
        Ok(transport)
    }

    fn daemon_rpc(&mut self) -> Result<Arc<dyn RpcTransport>> {
        if let Some(transport) = &self.daemon {
            return Ok(transport.clone());
        }
        let client = EndpointClient::new(
            loopback_url(self.daemon_port, "")?,
            self.settings.rpc.request_timeout(),
        )?;
        let transport: Arc<dyn RpcTransport> = Arc::new(client);
        self.daemon = Some(transport.clone());
        Ok(transport)
    }

    async fn daemon_ready(&mut self) -> bool {
        match self.daemon_rpc() {
            Ok(rpc) => rpc.call("getheight", json!({})).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn start_daemon(&mut self) -> Result<()> {
        if self.daemon_ready().await {
            info!("XMR daemon already running");
            return Ok(());
        }

        let spec = LaunchSpec::new("monerod", &self.daemon_bin_path, &self.settings.datastore_path)
            .args([
                "--data-dir".to_string(),
                self.settings.datastore_path.display().to_string(),
                format!("--rpc-bind-port={}", self.daemon_port),
                "--detach".to_string(),
                "--non-interactive".to_string(),
                "--log-level".to_string(),
                "1".to_string(),
            ])
            .detached();
        supervisor::launch(&spec)?;

        let rpc = self.daemon_rpc()?;
        debug!("Waiting for XMR daemon at {}", rpc.endpoint());
        supervisor::wait_until_ready(
            move || {
                let rpc = rpc.clone();
                async move { rpc.call("getheight", json!({})).await.is_ok() }
            },
            "XMR daemon RPC",
            readiness_policy(&self.settings),
        )
        .await
    }

    async fn start_wallet(&mut self) -> Result<()> {
        let spec = LaunchSpec::new(
            "monero-wallet-rpc",
            &self.settings.wallet_bin_path,
            &self.settings.datastore_path,
        )
        .args([
            "--trusted-daemon".to_string(),
            "--daemon-address".to_string(),
            format!("127.0.0.1:{}", self.daemon_port),
            format!("--rpc-bind-port={}", self.settings.rpcport),
            "--wallet-file".to_string(),
            self.wallet_file().display().to_string(),
            "--disable-rpc-login".to_string(),
            "--prompt-for-password".to_string(),
        ])
        .wallet_file(self.wallet_file());

        let mut process = supervisor::launch(&spec)?;

        // No prompt is printed when stdin is not a terminal; the line is read as soon as it arrives
        info!("Sending wallet password to monero-wallet-rpc");
        process.send_line(self.settings.wallet_password.expose()).await?;
        process.log_output();
        self.wallet_process = Some(process);

        let rpc = self.wallet_rpc()?;
        debug!("Waiting for XMR wallet RPC at {}", rpc.endpoint());
        supervisor::wait_until_ready(
            move || {
                let rpc = rpc.clone();
                async move { rpc.call("getbalance", json!({})).await.is_ok() }
            },
            "XMR wallet RPC",
            readiness_policy(&self.settings),
        )
        .await
    }

    async fn check_version(&self) -> Result<()> {
        let expected = self
            .settings
            .expected_version
            .as_deref()
            .unwrap_or(DEFAULT_VERSION);

        let spec = LaunchSpec::new(
            "monero-wallet-rpc",
            &self.settings.wallet_bin_path,
            &self.settings.datastore_path,
        )
        .args(["--version"]);

        let done = supervisor::run_command(&spec, self.settings.rpc.command_timeout()).await?;
        ensure_version(&done.output, expected)
    }

    /// Build (but never relay) a transfer; returns the engine's response
    async fn dry_run_transfer(&mut self, address: &str, atoms: u64, with_hex: bool) -> Result<Value> {
        let mut params = json!({
            "destinations": [{"address": address, "amount": atoms}],
            "do_not_relay": true,
        });
        if with_hex {
            params["get_tx_hex"] = json!(true);
        }
        self.wallet_rpc()?.call("transfer", params).await
    }

    async fn validate_address(&mut self, address: &str) -> Result<()> {
        let rpc = self.wallet_rpc()?;
        match rpc.call("validate_address", json!({"address": address})).await {
            Ok(result) if result.get("valid").and_then(Value::as_bool) == Some(true) => Ok(()),
            Ok(_) => Err(Error::InvalidAddress(address.to_string())),
            Err(e) if e.is_connection_failure() => Err(e),
            Err(e) => Err(Error::InvalidAddress(format!("{}: {}", address, e))),
        }
    }

    async fn broadcast(&mut self, tx_blob: &str) -> Result<()> {
        let response = self
            .daemon_rpc()?
            .call(
                "send_raw_transaction",
                json!({"tx_as_hex": tx_blob, "do_not_relay": false}),
            )
            .await
            .map_err(|e| Error::BroadcastFailed(e.to_string()))?;

        debug!("send_raw_transaction: {}", response);

        let error = response.get("error").filter(|e| !e.is_null());
        let status = response.get("status").and_then(Value::as_str);

        if error.is_some() || status == Some("Failed") {
            let reason = response
                .get("reason")
                .and_then(Value::as_str)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .or_else(|| error.map(Value::to_string))
                .unwrap_or_else(|| response.to_string());
            return Err(Error::BroadcastFailed(reason));
        }
        Ok(())
    }
}

fn fee_atoms(response: &Value) -> Result<u64> {
    response
        .get("fee")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::MalformedResponse(format!("transfer without fee: {}", response)))
}

fn as_u64_atoms(atoms: u128, what: &str) -> Result<u64> {
    u64::try_from(atoms).map_err(|_| Error::InvalidAmount(format!("{} exceeds the XMR supply", what)))
}

#[async_trait]
impl WalletBackend for MoneroBackend {
    fn currency(&self) -> Currency {
        Currency::Xmr
    }

    async fn is_ready(&mut self) -> bool {
        match self.wallet_rpc() {
            Ok(rpc) => rpc.call("getbalance", json!({})).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn start_server(&mut self) -> Result<()> {
        if self.state == EngineState::Stopped {
            return Err(Error::BackendStopped);
        }

        if self.is_ready().await {
            info!("XMR wallet already running");
            return self.state.advance(Currency::Xmr, EngineState::Ready);
        }

        self.state.advance(Currency::Xmr, EngineState::DaemonStarting)?;
        self.start_daemon().await?;
        self.state.advance(Currency::Xmr, EngineState::DaemonReady)?;

        self.state.advance(Currency::Xmr, EngineState::WalletLoading)?;
        self.start_wallet().await?;

        self.check_version().await?;
        self.state.advance(Currency::Xmr, EngineState::Ready)?;
        info!("XMR wallet ready");
        Ok(())
    }

    async fn stop_server(&mut self) -> Result<()> {
        if self.state == EngineState::Stopped {
            return Ok(());
        }

        match self.wallet_rpc()?.call("stop_wallet", json!({})).await {
            // Older wallets answer with an empty result
            Ok(_) => info!("XMR wallet stopped"),
            Err(e) if e.is_connection_failure() => warn!("XMR wallet was not running"),
            Err(e) => return Err(Error::ShutdownFailed(format!("stop_wallet: {}", e))),
        }

        match self.daemon_rpc()?.call("stop_daemon", json!({})).await {
            Ok(_) => info!("XMR daemon stopped"),
            Err(e) if e.is_connection_failure() => warn!("XMR daemon was not running"),
            Err(e) => return Err(Error::ShutdownFailed(format!("stop_daemon: {}", e))),
        }

        if let Some(mut process) = self.wallet_process.take() {
            process.kill().await?;
        }

        self.wallet = None;
        self.daemon = None;
        self.state.advance(Currency::Xmr, EngineState::Stopped)
    }

    async fn get_balance(&mut self) -> Result<Decimal> {
        // Funds unlock 10 blocks after arrival
        let balance = self.wallet_rpc()?.call("getbalance", json!({})).await?;
        let unlocked = balance
            .get("unlocked_balance")
            .ok_or_else(|| Error::MalformedResponse(format!("getbalance without unlocked_balance: {}", balance)))?;
        atomic_from_json(unlocked, PICONERO)
    }

    async fn get_receive_address(&mut self) -> Result<String> {
        match self.wallet_rpc()?.call("make_integrated_address", json!({})).await {
            Ok(result) => result
                .get("integrated_address")
                .and_then(Value::as_str)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .ok_or_else(|| Error::NoAddressAvailable(format!("make_integrated_address returned {}", result))),
            Err(e) if e.is_connection_failure() => Err(e),
            Err(e) => Err(Error::NoAddressAvailable(e.to_string())),
        }
    }

    async fn suggest_miner_fee(&mut self) -> Result<Decimal> {
        // Quoting needs a spendable balance: the wallet builds a real 1-atom transfer to itself
        let own = self.get_receive_address().await?;
        let quote = self.dry_run_transfer(&own, 1, false).await?;
        let fee = from_atomic(u128::from(fee_atoms(&quote)?), PICONERO)?;

        ensure_fee_below(fee, fee_ceiling())?;
        debug!("XMR miner fee estimate: {}", fee);
        Ok(fee)
    }

    async fn transactions_since(&mut self, cutoff: i64) -> Result<Vec<Transaction>> {
        history::validate_cutoff(cutoff)?;
        let raw = self.wallet_rpc()?.call("get_transfers", json!({"in": true})).await?;
        xmr::normalize(&raw, cutoff)
    }

    async fn perform_transaction(
        &mut self,
        net_amount: Decimal,
        miner_fee: Decimal,
        target_address: &str,
    ) -> Result<String> {
        validate_payment_amounts(net_amount, miner_fee)?;
        self.validate_address(target_address).await?;

        let net_atoms = as_u64_atoms(to_atomic(net_amount, PICONERO)?, "net amount")?;
        let requested_fee = to_atomic(miner_fee, PICONERO)?;

        debug!(
            "Preparing XMR payment: {} (fee {}) to {}",
            net_amount, miner_fee, target_address
        );

        let tx = self.dry_run_transfer(target_address, net_atoms, true).await?;
        ensure_fee_matches(requested_fee, u128::from(fee_atoms(&tx)?), PICONERO)?;

        let blob = tx
            .get("tx_blob")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedResponse("transfer returned no tx_blob".to_string()))?
            .to_string();
        let tx_hash = tx
            .get("tx_hash")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedResponse("transfer returned no tx_hash".to_string()))?
            .to_string();

        self.broadcast(&blob).await?;

        info!(
            "XMR payment complete: {} to {} (tx: {})",
            net_amount, target_address, tx_hash
        );

        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{dec, settings};
    use crate::rpc::mock::MockTransport;
    use tempfile::tempdir;

    struct Harness {
        backend: MoneroBackend,
        wallet: Arc<MockTransport>,
        daemon: Arc<MockTransport>,
        _dir: tempfile::TempDir,
    }

    fn harness(wallet: MockTransport, daemon: MockTransport) -> Harness {
        let dir = tempdir().unwrap();
        let wallet = Arc::new(wallet);
        let daemon = Arc::new(daemon);
        let backend = MoneroBackend::with_transports(settings(dir.path()), wallet.clone(), daemon.clone());
        Harness {
            backend,
            wallet,
            daemon,
            _dir: dir,
        }
    }

    #[test]
    fn test_requires_daemon_port() {
        let dir = tempdir().unwrap();
        let mut incomplete = settings(dir.path());
        incomplete.daemon_port = None;
        assert!(matches!(MoneroBackend::new(incomplete), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_start_is_noop_when_wallet_answers() {
        let mut h = harness(
            MockTransport::new("wallet").respond("getbalance", json!({"balance": 0, "unlocked_balance": 0})),
            MockTransport::new("daemon"),
        );

        // Both binaries are missing, so a spawn attempt would fail
        h.backend.start_server().await.unwrap();
        h.backend.start_server().await.unwrap();
        assert_eq!(h.backend.state, EngineState::Ready);
        assert!(h.backend.wallet_process.is_none());
        assert_eq!(h.wallet.call_count("getbalance"), 2);
        assert!(h.daemon.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_with_missing_daemon_binary() {
        let mut h = harness(MockTransport::new("wallet"), MockTransport::new("daemon"));
        assert!(matches!(
            h.backend.start_server().await,
            Err(Error::MissingBinary(_))
        ));
    }

    #[tokio::test]
    async fn test_unlocked_balance() {
        let mut h = harness(
            MockTransport::new("wallet").respond(
                "getbalance",
                json!({"balance": 5_000_000_000_000u64, "unlocked_balance": 3_140_000_000_000u64}),
            ),
            MockTransport::new("daemon"),
        );
        assert_eq!(h.backend.get_balance().await.unwrap(), dec("3.14"));
    }

    #[tokio::test]
    async fn test_fee_quote_uses_dry_run_to_self() {
        let mut h = harness(
            MockTransport::new("wallet")
                .respond("make_integrated_address", json!({"integrated_address": "4Own", "payment_id": "00"}))
                .respond("transfer", json!({"fee": 22_000_000u64, "tx_hash": "h"})),
            MockTransport::new("daemon"),
        );

        assert_eq!(h.backend.suggest_miner_fee().await.unwrap(), dec("0.000022"));
        let params = h.wallet.params_of("transfer").unwrap();
        assert_eq!(params["destinations"][0], json!({"address": "4Own", "amount": 1}));
        assert_eq!(params["do_not_relay"], json!(true));
    }

    #[tokio::test]
    async fn test_fee_above_ceiling() {
        let mut h = harness(
            MockTransport::new("wallet")
                .respond("make_integrated_address", json!({"integrated_address": "4Own"}))
                .respond("transfer", json!({"fee": 20_000_000_000u64})),
            MockTransport::new("daemon"),
        );
        assert!(matches!(
            h.backend.suggest_miner_fee().await,
            Err(Error::FeeTooHigh { .. })
        ));
    }

    #[tokio::test]
    async fn test_history_without_incoming() {
        let mut h = harness(
            MockTransport::new("wallet").respond("get_transfers", json!({})),
            MockTransport::new("daemon"),
        );
        assert!(h.backend.transactions_since(0).await.unwrap().is_empty());
        assert_eq!(h.wallet.params_of("get_transfers"), Some(json!({"in": true})));
    }

    fn payable_wallet() -> MockTransport {
        MockTransport::new("wallet")
            .respond("validate_address", json!({"valid": true}))
            .respond(
                "transfer",
                json!({"fee": 22_000_000u64, "tx_blob": "0200ff", "tx_hash": "a1b2"}),
            )
    }

    #[tokio::test]
    async fn test_payment_relays_through_daemon() {
        let mut h = harness(
            payable_wallet(),
            MockTransport::new("daemon").respond("send_raw_transaction", json!({"status": "OK"})),
        );

        let tx = h
            .backend
            .perform_transaction(dec("1.5"), dec("0.000022"), "4Target")
            .await
            .unwrap();

        assert_eq!(tx, "a1b2");
        assert_eq!(
            h.daemon.params_of("send_raw_transaction"),
            Some(json!({"tx_as_hex": "0200ff", "do_not_relay": false}))
        );
        let transfer = h.wallet.params_of("transfer").unwrap();
        assert_eq!(transfer["destinations"][0]["amount"], json!(1_500_000_000_000u64));
        assert_eq!(transfer["get_tx_hex"], json!(true));
    }

    #[tokio::test]
    async fn test_one_piconero_fee_mismatch_never_relays() {
        let mut h = harness(payable_wallet(), MockTransport::new("daemon"));

        let err = h
            .backend
            .perform_transaction(dec("1.5"), dec("0.000022000001"), "4Target")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::FeeMismatch { .. }));
        assert!(h.daemon.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_relay() {
        let mut h = harness(
            payable_wallet(),
            MockTransport::new("daemon")
                .respond("send_raw_transaction", json!({"status": "Failed", "reason": "double spend"})),
        );

        let err = h
            .backend
            .perform_transaction(dec("1.5"), dec("0.000022"), "4Target")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BroadcastFailed(ref r) if r == "double spend"));
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let mut h = harness(
            payable_wallet().respond("validate_address", json!({"valid": false})),
            MockTransport::new("daemon"),
        );

        assert!(matches!(
            h.backend.perform_transaction(dec("1"), dec("0.000022"), "bogus").await,
            Err(Error::InvalidAddress(_))
        ));
        assert_eq!(h.wallet.call_count("transfer"), 0);
    }

    #[tokio::test]
    async fn test_stop_tolerates_stopped_engines_and_is_final() {
        let mut h = harness(
            MockTransport::new("wallet").respond("stop_wallet", Value::Null),
            MockTransport::new("daemon"),
        );

        h.backend.stop_server().await.unwrap();
        h.backend.stop_server().await.unwrap();
        assert!(matches!(
            h.backend.start_server().await,
            Err(Error::BackendStopped)
        ));
    }
}
