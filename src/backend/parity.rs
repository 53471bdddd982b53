//! Ether through a Parity-style node with an unlocked local account

use async_trait::async_trait;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    ensure_fee_below, ensure_fee_matches, readiness_policy, validate_payment_amounts,
    EngineState, WalletBackend,
};
use crate::config::EngineSettings;
use crate::currency::Currency;
use crate::error::{Error, Result};
use crate::history::eth::{self, EthBlock, MAX_BLOCK_LOOKUPS};
use crate::history::{self, BlockTimeCache, Transaction};
use crate::rpc::{loopback_url, JsonRpcClient, RpcTransport};
use crate::supervisor::{self, LaunchSpec};
use crate::units::{from_atomic, from_hex_atomic, parse_hex_u128, parse_hex_u64, to_atomic, to_hex, to_hex_atomic, WEI};

pub const DEFAULT_VERSION_PREFIX: &str = "Parity-Ethereum/v2";

lazy_static::lazy_static! {
    static ref ADDRESS: Regex = Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("Invalid address regex");
}

/// 0.01 ETH
pub fn fee_ceiling() -> Decimal {
    Decimal::new(1, 2)
}

pub struct ParityBackend {
    settings: EngineSettings,
    transport: Option<Arc<dyn RpcTransport>>,
    /// The single local account, lowercased
    account: Option<String>,
    block_times: BlockTimeCache,
    state: EngineState,
}

impl ParityBackend {
    pub fn new(settings: EngineSettings) -> Result<Self> {
        Ok(Self {
            settings,
            transport: None,
            account: None,
            block_times: BlockTimeCache::default(),
            state: EngineState::NotStarted,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_transport(settings: EngineSettings, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            settings,
            transport: Some(transport),
            account: None,
            block_times: BlockTimeCache::default(),
            state: EngineState::NotStarted,
        }
    }

    fn key_file(&self) -> PathBuf {
        self.settings
            .datastore_path
            .join("keys")
            .join(&self.settings.wallet_filename)
    }

    fn rpc(&mut self) -> Result<Arc<dyn RpcTransport>> {
        if let Some(transport) = &self.transport {
            return Ok(transport.clone());
        }
        let client = JsonRpcClient::new(
            loopback_url(self.settings.rpcport, "")?,
            self.settings.rpc.request_timeout(),
        )?;
        let transport: Arc<dyn RpcTransport> = Arc::new(client);
        self.transport = Some(transport.clone());
        Ok(transport)
    }

    fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec::new("parity", &self.settings.wallet_bin_path, &self.settings.datastore_path)
            .args([
                "-d".to_string(),
                self.settings.datastore_path.display().to_string(),
                "--jsonrpc-port".to_string(),
                self.settings.rpcport.to_string(),
                "--cache-size".to_string(),
                "1024".to_string(),
                "--snapshot-peers=25".to_string(),
                "--ntp-servers=pool.ntp.org:123".to_string(),
                "--db-compaction".to_string(),
                "ssd".to_string(),
                "--max-peers=150".to_string(),
                "--min-peers=100".to_string(),
            ])
            .wallet_file(self.key_file())
            .detached()
    }

    async fn check_version(&mut self) -> Result<()> {
        let expected = self
            .settings
            .expected_version
            .clone()
            .unwrap_or_else(|| DEFAULT_VERSION_PREFIX.to_string());

        let version = self.rpc()?.call("web3_clientVersion", json!([])).await?;
        let found = version.as_str().unwrap_or_default();
        if !found.starts_with(&expected) {
            return Err(Error::UnsupportedEngineVersion {
                expected,
                found: found.to_string(),
            });
        }
        Ok(())
    }

    /// Only one account per node is supported
    async fn account(&mut self) -> Result<String> {
        if let Some(account) = &self.account {
            return Ok(account.clone());
        }

        let accounts: Vec<String> = serde_json::from_value(self.rpc()?.call("eth_accounts", json!([])).await?)?;
        if accounts.len() != 1 {
            return Err(Error::NoAddressAvailable(format!(
                "expected exactly one node account, found {}",
                accounts.len()
            )));
        }

        let account = accounts[0].to_ascii_lowercase();
        self.account = Some(account.clone());
        Ok(account)
    }

    /// Gas and gas price for sending `value` to `to`
    async fn quote(&mut self, to: &str, value: &str) -> Result<(u128, u128)> {
        let from = self.account().await?;
        let rpc = self.rpc()?;

        let gas = rpc
            .call("eth_estimateGas", json!([{"from": from, "to": to, "value": value}]))
            .await?;
        let price = rpc.call("eth_gasPrice", json!([])).await?;

        let gas = parse_hex_u128(gas.as_str().unwrap_or_default())?;
        let price = parse_hex_u128(price.as_str().unwrap_or_default())?;
        Ok((gas, price))
    }

    fn fee_of(gas: u128, price: u128) -> Result<u128> {
        gas.checked_mul(price)
            .ok_or_else(|| Error::MalformedResponse(format!("gas {} at price {} overflows", gas, price)))
    }

    async fn block(&mut self, number: u64, full: bool) -> Result<Value> {
        let block = self
            .rpc()?
            .call("eth_getBlockByNumber", json!([to_hex(u128::from(number)), full]))
            .await?;
        if block.is_null() {
            return Err(Error::MalformedResponse(format!("block {} not found", number)));
        }
        Ok(block)
    }

    async fn block_time(&mut self, number: u64) -> Result<i64> {
        if let Some(time) = self.block_times.get(number) {
            return Ok(time);
        }
        let block = self.block(number, false).await?;
        let time = block_timestamp(&block)?;
        self.block_times.insert(number, time);
        Ok(time)
    }

    /// First block at or after `cutoff`; `head + 1` when every block is older
    async fn first_block_since(&mut self, cutoff: i64, head: u64) -> Result<u64> {
        if self.block_time(head).await? < cutoff {
            return Ok(head + 1);
        }

        let (mut low, mut high) = (0u64, head);
        while low < high {
            let mid = low + (high - low) / 2;
            if self.block_time(mid).await? >= cutoff {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        Ok(low)
    }

    async fn validate_address(&mut self, address: &str) -> Result<()> {
        if !ADDRESS.is_match(address) {
            return Err(Error::InvalidAddress(address.to_string()));
        }
        match self.rpc()?.call("eth_getBalance", json!([address, "latest"])).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_connection_failure() => Err(e),
            Err(e) => Err(Error::InvalidAddress(format!("{}: {}", address, e))),
        }
    }
}

fn block_timestamp(block: &Value) -> Result<i64> {
    let hex = block
        .get("timestamp")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedResponse(format!("block without timestamp: {}", block)))?;
    i64::try_from(parse_hex_u64(hex)?)
        .map_err(|_| Error::MalformedResponse(format!("timestamp {} out of range", hex)))
}

#[async_trait]
impl WalletBackend for ParityBackend {
    fn currency(&self) -> Currency {
        Currency::Eth
    }

    async fn is_ready(&mut self) -> bool {
        match self.rpc() {
            Ok(rpc) => rpc.call("eth_syncing", json!([])).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn start_server(&mut self) -> Result<()> {
        if self.state == EngineState::Stopped {
            return Err(Error::BackendStopped);
        }

        if self.is_ready().await {
            info!("ETH node already running");
            return self.state.advance(Currency::Eth, EngineState::Ready);
        }

        self.state.advance(Currency::Eth, EngineState::DaemonStarting)?;
        supervisor::launch(&self.launch_spec())?;

        let rpc = self.rpc()?;
        debug!("Waiting for ETH node RPC at {}", rpc.endpoint());
        supervisor::wait_until_ready(
            move || {
                let rpc = rpc.clone();
                async move { rpc.call("eth_syncing", json!([])).await.is_ok() }
            },
            "ETH node RPC",
            readiness_policy(&self.settings),
        )
        .await?;
        self.state.advance(Currency::Eth, EngineState::DaemonReady)?;

        self.check_version().await?;
        self.state.advance(Currency::Eth, EngineState::Ready)?;
        info!("ETH node ready");
        Ok(())
    }

    async fn stop_server(&mut self) -> Result<()> {
        if self.state == EngineState::Stopped {
            return Ok(());
        }

        if !supervisor::terminate_matching(&self.settings.wallet_bin_path).await? {
            warn!("ETH node was not running");
        }

        self.transport = None;
        self.account = None;
        self.state.advance(Currency::Eth, EngineState::Stopped)?;
        info!("ETH node stopped");
        Ok(())
    }

    async fn get_balance(&mut self) -> Result<Decimal> {
        let account = self.account().await?;
        let balance = self
            .rpc()?
            .call("eth_getBalance", json!([account, "latest"]))
            .await?;
        let hex = balance
            .as_str()
            .ok_or_else(|| Error::MalformedResponse(format!("eth_getBalance returned {}", balance)))?;
        from_hex_atomic(hex, WEI)
    }

    async fn get_receive_address(&mut self) -> Result<String> {
        self.account().await
    }

    async fn suggest_miner_fee(&mut self) -> Result<Decimal> {
        let account = self.account().await?;
        let (gas, price) = self.quote(&account, "0x1").await?;
        let fee = from_atomic(Self::fee_of(gas, price)?, WEI)?;

        ensure_fee_below(fee, fee_ceiling())?;
        debug!("ETH miner fee estimate: {} ({} gas at {} wei)", fee, gas, price);
        Ok(fee)
    }

    async fn transactions_since(&mut self, cutoff: i64) -> Result<Vec<Transaction>> {
        history::validate_cutoff(cutoff)?;
        let account = self.account().await?;

        let head = self.rpc()?.call("eth_blockNumber", json!([])).await?;
        let head = parse_hex_u64(head.as_str().unwrap_or_default())?;

        let start = self.first_block_since(cutoff, head).await?;
        if start > head {
            return Ok(Vec::new());
        }

        let span = head - start + 1;
        if span > MAX_BLOCK_LOOKUPS {
            return Err(Error::HistoryRangeTooLarge {
                requested: span,
                max: MAX_BLOCK_LOOKUPS,
            });
        }

        debug!("Scanning ETH blocks {}..={} for incoming transfers", start, head);

        let mut times = HashMap::new();
        let mut transactions = Vec::new();
        for number in start..=head {
            let block: EthBlock = serde_json::from_value(self.block(number, true).await?)?;
            let time = i64::try_from(parse_hex_u64(&block.timestamp)?)
                .map_err(|_| Error::MalformedResponse(format!("timestamp {} out of range", block.timestamp)))?;
            self.block_times.insert(number, time);
            times.insert(number, time);
            transactions.extend(block.transactions);
        }

        eth::normalize(&transactions, &account, cutoff, |number| {
            times
                .get(&number)
                .copied()
                .ok_or_else(|| Error::MalformedResponse(format!("transaction in unscanned block {}", number)))
        })
    }

    async fn perform_transaction(
        &mut self,
        net_amount: Decimal,
        miner_fee: Decimal,
        target_address: &str,
    ) -> Result<String> {
        validate_payment_amounts(net_amount, miner_fee)?;
        self.validate_address(target_address).await?;

        let value = to_hex_atomic(net_amount, WEI)?;
        let requested_fee = to_atomic(miner_fee, WEI)?;

        let (gas, price) = self.quote(target_address, &value).await?;
        ensure_fee_matches(requested_fee, Self::fee_of(gas, price)?, WEI)?;

        let from = self.account().await?;
        debug!(
            "Executing ETH payment: {} (fee {}) from {} to {}",
            net_amount, miner_fee, from, target_address
        );

        let sent = self
            .rpc()?
            .call(
                "personal_sendTransaction",
                json!([
                    {
                        "from": from,
                        "to": target_address,
                        "value": value,
                        "gas": to_hex(gas),
                        "gasPrice": to_hex(price),
                    },
                    self.settings.wallet_password.expose(),
                ]),
            )
            .await
            .map_err(|e| Error::BroadcastFailed(e.to_string()))?;

        let hash = sent
            .as_str()
            .ok_or_else(|| Error::BroadcastFailed(format!("node returned {}", sent)))?
            .to_string();

        info!(
            "ETH payment complete: {} to {} (tx: {})",
            net_amount, target_address, hash
        );

        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{dec, settings};
    use crate::rpc::mock::MockTransport;
    use tempfile::tempdir;

    const ACCOUNT: &str = "0x969e875686e0d4fa32927ca25a3f6402814276de";
    const TARGET: &str = "0x2222222222222222222222222222222222222222";

    fn backend(mock: MockTransport) -> (ParityBackend, Arc<MockTransport>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mock = Arc::new(mock);
        let backend = ParityBackend::with_transport(settings(dir.path()), mock.clone());
        (backend, mock, dir)
    }

    fn with_account(mock: MockTransport) -> MockTransport {
        mock.respond("eth_accounts", json!(["0x969E875686E0D4FA32927CA25A3F6402814276DE"]))
    }

    fn block_number(params: &Value) -> u64 {
        parse_hex_u64(params[0].as_str().unwrap()).unwrap()
    }

    /// 20 blocks, block n mined at 1000 + 15n; one transfer to us in blocks 9 and 10
    fn chain() -> MockTransport {
        with_account(MockTransport::new("parity"))
            .respond("eth_blockNumber", json!("0x14"))
            .on("eth_getBlockByNumber", |params| {
                let n = block_number(params);
                let transactions = if params[1] == json!(true) && (n == 9 || n == 10) {
                    json!([{
                        "hash": format!("0xtx{}", n),
                        "from": TARGET,
                        "to": ACCOUNT,
                        "value": "0xde0b6b3a7640000",
                        "blockNumber": to_hex(u128::from(n)),
                    }])
                } else {
                    json!([])
                };
                Ok(json!({
                    "number": to_hex(u128::from(n)),
                    "timestamp": to_hex(u128::from(1000 + 15 * n)),
                    "transactions": transactions,
                }))
            })
    }

    #[tokio::test]
    async fn test_start_is_noop_when_node_answers() {
        let (mut backend, mock, _dir) = backend(MockTransport::new("parity").respond("eth_syncing", json!(false)));
        // The node binary is missing, so a spawn attempt would fail
        backend.start_server().await.unwrap();
        backend.start_server().await.unwrap();
        assert_eq!(backend.state, EngineState::Ready);
        assert_eq!(mock.call_count("eth_syncing"), 2);
        assert_eq!(mock.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_exactly_one_account() {
        let (mut backend, _mock, _dir) =
            backend(MockTransport::new("parity").respond("eth_accounts", json!([ACCOUNT, TARGET])));
        assert!(matches!(
            backend.get_receive_address().await,
            Err(Error::NoAddressAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_account_is_lowercased_and_cached() {
        let (mut backend, mock, _dir) = backend(with_account(MockTransport::new("parity")));
        assert_eq!(backend.get_receive_address().await.unwrap(), ACCOUNT);
        assert_eq!(backend.get_receive_address().await.unwrap(), ACCOUNT);
        assert_eq!(mock.call_count("eth_accounts"), 1);
    }

    #[tokio::test]
    async fn test_balance_in_ether() {
        let (mut backend, mock, _dir) =
            backend(with_account(MockTransport::new("parity")).respond("eth_getBalance", json!("0x1bc16d674ec80000")));
        assert_eq!(backend.get_balance().await.unwrap(), dec("2"));
        assert_eq!(mock.params_of("eth_getBalance"), Some(json!([ACCOUNT, "latest"])));
    }

    #[tokio::test]
    async fn test_fee_is_gas_times_price() {
        let (mut backend, _mock, _dir) = backend(
            with_account(MockTransport::new("parity"))
                .respond("eth_estimateGas", json!("0x5208"))
                .respond("eth_gasPrice", json!("0x4a817c800")),
        );
        // 21000 gas at 20 gwei
        assert_eq!(backend.suggest_miner_fee().await.unwrap(), dec("0.00042"));
    }

    #[tokio::test]
    async fn test_fee_ceiling() {
        let priced = |gas_price: &str| {
            with_account(MockTransport::new("parity"))
                .respond("eth_estimateGas", json!("0x5208"))
                .respond("eth_gasPrice", json!(gas_price))
        };

        // 21000 gas at 160 gwei = 0.00336 ETH
        let (mut cheap, _mock, _dir) = backend(priced("0x2540be4000"));
        assert_eq!(cheap.suggest_miner_fee().await.unwrap(), dec("0.00336"));

        // 21000 gas at 1000 gwei = 0.021 ETH
        let (mut pricey, _mock, _dir) = backend(priced("0xe8d4a51000"));
        assert!(matches!(
            pricey.suggest_miner_fee().await,
            Err(Error::FeeTooHigh { .. })
        ));
    }

    #[tokio::test]
    async fn test_history_includes_block_at_cutoff() {
        let (mut backend, _mock, _dir) = backend(chain());

        // Block 10 was mined exactly at the cutoff, block 9 one interval before
        let received = backend.transactions_since(1150).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, "0xtx10");
        assert_eq!(received[0].time, 1150);
        assert_eq!(received[0].value, Decimal::ONE);

        let received = backend.transactions_since(1149).await.unwrap();
        assert_eq!(received.len(), 1);

        let received = backend.transactions_since(1135).await.unwrap();
        assert_eq!(received.len(), 2);
    }

    #[tokio::test]
    async fn test_history_after_head_is_empty() {
        let (mut backend, _mock, _dir) = backend(chain());
        assert!(backend.transactions_since(999_999).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_range_bound() {
        let (mut backend, _mock, _dir) = backend(
            with_account(MockTransport::new("parity"))
                .respond("eth_blockNumber", json!("0x100000"))
                .on("eth_getBlockByNumber", |params| {
                    let n = block_number(params);
                    Ok(json!({"number": to_hex(u128::from(n)), "timestamp": to_hex(u128::from(15 * n)), "transactions": []}))
                }),
        );

        let err = backend.transactions_since(0).await.unwrap_err();
        assert!(matches!(
            err,
            Error::HistoryRangeTooLarge { requested: 0x100001, max: MAX_BLOCK_LOOKUPS }
        ));
    }

    fn payable() -> MockTransport {
        with_account(MockTransport::new("parity"))
            .respond("eth_getBalance", json!("0x0"))
            .respond("eth_estimateGas", json!("0x5208"))
            .respond("eth_gasPrice", json!("0x4a817c800"))
            .respond("personal_sendTransaction", json!("0xfeed"))
    }

    #[tokio::test]
    async fn test_payment_sends_quoted_gas() {
        let (mut backend, mock, _dir) = backend(payable());

        let hash = backend
            .perform_transaction(dec("0.5"), dec("0.00042"), TARGET)
            .await
            .unwrap();

        assert_eq!(hash, "0xfeed");
        let params = mock.params_of("personal_sendTransaction").unwrap();
        assert_eq!(params[0]["value"], json!("0x6f05b59d3b20000"));
        assert_eq!(params[0]["gas"], json!("0x5208"));
        assert_eq!(params[0]["from"], json!(ACCOUNT));
        assert_eq!(params[1], json!("hunter2"));
    }

    #[tokio::test]
    async fn test_one_wei_fee_mismatch_sends_nothing() {
        let (mut backend, mock, _dir) = backend(payable());

        let err = backend
            .perform_transaction(dec("0.5"), dec("0.000420000000000001"), TARGET)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::FeeMismatch { .. }));
        assert_eq!(mock.call_count("personal_sendTransaction"), 0);
    }

    #[tokio::test]
    async fn test_malformed_address() {
        let (mut backend, mock, _dir) = backend(payable());
        assert!(matches!(
            backend.perform_transaction(dec("0.5"), dec("0.00042"), "0x1234").await,
            Err(Error::InvalidAddress(_))
        ));
        assert_eq!(mock.call_count("eth_getBalance"), 0);
    }

    #[tokio::test]
    async fn test_sub_wei_amount() {
        let (mut backend, mock, _dir) = backend(payable());
        assert!(matches!(
            backend
                .perform_transaction(dec("0.0000000000000000001"), dec("0.00042"), TARGET)
                .await,
            Err(Error::NonIntegerUnitConversion { .. })
        ));
        assert_eq!(mock.call_count("personal_sendTransaction"), 0);
    }
}
