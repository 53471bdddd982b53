//! One API over every configured wallet backend
//!
//! Calls are routed by currency code and run one backend at a time. Each
//! backend gets its own tracing span so log lines carry the currency.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{info, info_span, Instrument, Span};

use crate::backend::{build_backend, validate_payment_amounts, WalletBackend};
use crate::config::EngineSettings;
use crate::currency::Currency;
use crate::error::{Error, Result};
use crate::history::Transaction;

struct Managed {
    backend: Box<dyn WalletBackend>,
    span: Span,
}

/// Owns one backend per configured currency
pub struct Aggregator {
    backends: BTreeMap<Currency, Managed>,
}

impl Aggregator {
    /// Build backends for every configured currency
    ///
    /// Unsupported codes are all reported before any backend is constructed.
    pub fn configure(settings: BTreeMap<String, EngineSettings>) -> Result<Self> {
        let unsupported: Vec<String> = settings
            .keys()
            .filter(|code| code.parse::<Currency>().is_err())
            .cloned()
            .collect();
        if !unsupported.is_empty() {
            return Err(Error::UnsupportedCurrency(unsupported));
        }

        let mut seen: BTreeMap<Currency, String> = BTreeMap::new();
        for code in settings.keys() {
            let currency: Currency = code.parse()?;
            if let Some(first) = seen.insert(currency, code.clone()) {
                return Err(Error::Config(format!(
                    "{} configured more than once ({:?} and {:?})",
                    currency, first, code
                )));
            }
        }

        let mut backends = Vec::with_capacity(settings.len());
        for (code, engine) in settings {
            let currency: Currency = code.parse()?;
            let backend = build_backend(currency, engine).map_err(|e| e.for_currency(currency))?;
            backends.push(backend);
        }

        Ok(Self::from_backends(backends))
    }

    /// Wrap already-constructed backends
    pub fn from_backends(backends: Vec<Box<dyn WalletBackend>>) -> Self {
        let backends = backends
            .into_iter()
            .map(|backend| {
                let currency = backend.currency();
                let span = info_span!("backend", currency = %currency);
                (currency, Managed { backend, span })
            })
            .collect();
        Self { backends }
    }

    pub fn currencies(&self) -> Vec<Currency> {
        self.backends.keys().copied().collect()
    }

    fn route(&mut self, code: &str) -> Result<&mut Managed> {
        let currency: Currency = code
            .parse()
            .map_err(|_| Error::UnknownCurrency(code.to_string()))?;
        self.backends
            .get_mut(&currency)
            .ok_or_else(|| Error::UnknownCurrency(code.to_string()))
    }

    /// Start every engine in currency order; the first failure aborts
    pub async fn start_servers(&mut self) -> Result<()> {
        for (currency, Managed { backend, span }) in self.backends.iter_mut() {
            info!("Starting {} engine...", currency);
            backend
                .start_server()
                .instrument(span.clone())
                .await
                .map_err(|e| e.for_currency(*currency))?;
        }
        Ok(())
    }

    /// Stop every engine in currency order; the first failure aborts
    pub async fn stop_servers(&mut self) -> Result<()> {
        for (currency, Managed { backend, span }) in self.backends.iter_mut() {
            info!("Stopping {} engine...", currency);
            backend
                .stop_server()
                .instrument(span.clone())
                .await
                .map_err(|e| e.for_currency(*currency))?;
        }
        Ok(())
    }

    /// Confirmed balance of every configured currency
    pub async fn get_balances(&mut self) -> Result<BTreeMap<Currency, Decimal>> {
        let mut balances = BTreeMap::new();
        for (currency, Managed { backend, span }) in self.backends.iter_mut() {
            let balance = backend
                .get_balance()
                .instrument(span.clone())
                .await
                .map_err(|e| e.for_currency(*currency))?;
            balances.insert(*currency, balance);
        }
        Ok(balances)
    }

    pub async fn get_receive_address(&mut self, currency: &str) -> Result<String> {
        let Managed { backend, span } = self.route(currency)?;
        backend.get_receive_address().instrument(span.clone()).await
    }

    pub async fn suggest_miner_fee(&mut self, currency: &str) -> Result<Decimal> {
        let Managed { backend, span } = self.route(currency)?;
        backend.suggest_miner_fee().instrument(span.clone()).await
    }

    pub async fn transactions_since(&mut self, currency: &str, cutoff: i64) -> Result<Vec<Transaction>> {
        let Managed { backend, span } = self.route(currency)?;
        backend.transactions_since(cutoff).instrument(span.clone()).await
    }

    pub async fn perform_transaction(
        &mut self,
        currency: &str,
        net_amount: Decimal,
        miner_fee: Decimal,
        target_address: &str,
    ) -> Result<String> {
        let Managed { backend, span } = self.route(currency)?;
        validate_payment_amounts(net_amount, miner_fee)?;
        backend
            .perform_transaction(net_amount, miner_fee, target_address)
            .instrument(span.clone())
            .await
    }

    /// Readiness probe result per currency
    pub async fn health(&mut self) -> BTreeMap<Currency, bool> {
        let mut health = BTreeMap::new();
        for (currency, Managed { backend, span }) in self.backends.iter_mut() {
            health.insert(*currency, backend.is_ready().instrument(span.clone()).await);
        }
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{dec, settings};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeBackend {
        currency: Currency,
        balance: Decimal,
        fail_start: bool,
        log: Log,
    }

    impl FakeBackend {
        fn boxed(currency: Currency, log: &Log) -> Box<dyn WalletBackend> {
            Box::new(Self {
                currency,
                balance: Decimal::from(currency as u32 + 1),
                fail_start: false,
                log: log.clone(),
            })
        }

        fn record(&self, what: &str) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{} {}", what, self.currency));
        }
    }

    #[async_trait]
    impl WalletBackend for FakeBackend {
        fn currency(&self) -> Currency {
            self.currency
        }

        async fn is_ready(&mut self) -> bool {
            self.currency != Currency::Eth
        }

        async fn start_server(&mut self) -> Result<()> {
            self.record("start");
            if self.fail_start {
                return Err(Error::ReadinessTimeout("fake engine".to_string()));
            }
            Ok(())
        }

        async fn stop_server(&mut self) -> Result<()> {
            self.record("stop");
            Ok(())
        }

        async fn get_balance(&mut self) -> Result<Decimal> {
            Ok(self.balance)
        }

        async fn get_receive_address(&mut self) -> Result<String> {
            Ok(format!("{}-address", self.currency))
        }

        async fn suggest_miner_fee(&mut self) -> Result<Decimal> {
            Ok(dec("0.0001"))
        }

        async fn transactions_since(&mut self, cutoff: i64) -> Result<Vec<Transaction>> {
            Ok(vec![Transaction {
                id: "t".to_string(),
                time: cutoff,
                value: Decimal::ONE,
            }])
        }

        async fn perform_transaction(
            &mut self,
            _net_amount: Decimal,
            _miner_fee: Decimal,
            _target_address: &str,
        ) -> Result<String> {
            self.record("pay");
            Ok("txid".to_string())
        }
    }

    #[test]
    fn test_unsupported_currency_fails_before_construction() {
        let dir = tempdir().unwrap();
        let mut wallets = BTreeMap::new();
        wallets.insert("BTC".to_string(), settings(dir.path()));
        wallets.insert("DOGE".to_string(), settings(dir.path()));
        // Would fail to construct if construction ran first
        let mut broken = settings(dir.path());
        broken.daemon_port = None;
        wallets.insert("XMR".to_string(), broken);

        match Aggregator::configure(wallets) {
            Err(Error::UnsupportedCurrency(codes)) => assert_eq!(codes, vec!["DOGE".to_string()]),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("configuration should fail"),
        }
    }

    #[test]
    fn test_construction_errors_name_the_currency() {
        let dir = tempdir().unwrap();
        let mut broken = settings(dir.path());
        broken.daemon_port = None;
        let wallets = BTreeMap::from([("XMR".to_string(), broken)]);

        match Aggregator::configure(wallets) {
            Err(Error::Backend { currency, source }) => {
                assert_eq!(currency, Currency::Xmr);
                assert!(matches!(*source, Error::Config(_)));
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("configuration should fail"),
        }
    }

    #[test]
    fn test_configure_builds_one_backend_per_currency() {
        let dir = tempdir().unwrap();
        let wallets = BTreeMap::from([
            ("ETH".to_string(), settings(dir.path())),
            ("BTC".to_string(), settings(dir.path())),
        ]);

        let aggregator = Aggregator::configure(wallets).unwrap();
        assert_eq!(aggregator.currencies(), vec![Currency::Btc, Currency::Eth]);
    }

    #[test]
    fn test_duplicate_currency_is_rejected() {
        let dir = tempdir().unwrap();
        let wallets = BTreeMap::from([
            ("BTC".to_string(), settings(dir.path())),
            ("btc".to_string(), settings(dir.path())),
        ]);

        match Aggregator::configure(wallets) {
            Err(Error::Config(msg)) => assert!(msg.contains("BTC configured more than once"), "{msg}"),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("configuration should fail"),
        }
    }

    #[tokio::test]
    async fn test_start_stops_at_first_failure() {
        let log = Log::default();
        let failing = Box::new(FakeBackend {
            currency: Currency::Xmr,
            balance: Decimal::ZERO,
            fail_start: true,
            log: log.clone(),
        });
        let mut aggregator = Aggregator::from_backends(vec![
            FakeBackend::boxed(Currency::Eth, &log),
            failing,
            FakeBackend::boxed(Currency::Btc, &log),
        ]);

        let err = aggregator.start_servers().await.unwrap_err();
        assert!(matches!(err, Error::Backend { currency: Currency::Xmr, .. }));
        assert_eq!(*log.lock().unwrap(), vec!["start BTC", "start XMR"]);
    }

    #[tokio::test]
    async fn test_balances_cover_configured_currencies() {
        let log = Log::default();
        let mut aggregator = Aggregator::from_backends(vec![
            FakeBackend::boxed(Currency::Btc, &log),
            FakeBackend::boxed(Currency::Eth, &log),
        ]);

        let balances = aggregator.get_balances().await.unwrap();
        assert_eq!(balances.keys().copied().collect::<Vec<_>>(), vec![Currency::Btc, Currency::Eth]);
        assert_eq!(balances[&Currency::Eth], Decimal::from(3));
    }

    #[tokio::test]
    async fn test_routing() {
        let log = Log::default();
        let mut aggregator = Aggregator::from_backends(vec![FakeBackend::boxed(Currency::Btc, &log)]);

        assert_eq!(aggregator.get_receive_address("btc").await.unwrap(), "BTC-address");
        assert_eq!(aggregator.transactions_since("BTC", 42).await.unwrap()[0].time, 42);
        assert!(matches!(
            aggregator.suggest_miner_fee("ETH").await,
            Err(Error::UnknownCurrency(code)) if code == "ETH"
        ));
        assert!(matches!(
            aggregator.get_receive_address("DOGE").await,
            Err(Error::UnknownCurrency(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_amounts_never_reach_backend() {
        let log = Log::default();
        let mut aggregator = Aggregator::from_backends(vec![FakeBackend::boxed(Currency::Btc, &log)]);

        for (net, fee) in [("0", "0.0001"), ("-1", "0.0001"), ("1", "-0.0001")] {
            assert!(matches!(
                aggregator.perform_transaction("BTC", dec(net), dec(fee), "addr").await,
                Err(Error::InvalidAmount(_))
            ));
        }
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(
            aggregator
                .perform_transaction("BTC", dec("1"), dec("0.0001"), "addr")
                .await
                .unwrap(),
            "txid"
        );
    }

    #[tokio::test]
    async fn test_health_and_stop() {
        let log = Log::default();
        let mut aggregator = Aggregator::from_backends(vec![
            FakeBackend::boxed(Currency::Btc, &log),
            FakeBackend::boxed(Currency::Eth, &log),
        ]);

        let health = aggregator.health().await;
        assert!(health[&Currency::Btc]);
        assert!(!health[&Currency::Eth]);

        aggregator.stop_servers().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["stop BTC", "stop ETH"]);
    }
}
