//! Wallet engine backends
//!
//! One [`WalletBackend`] per supported engine. Each backend owns its engine
//! processes and RPC client; startup sequencing is engine specific.
//!
//! # Architecture
//!
//! ```text
//! Aggregator → WalletBackend ─┬→ supervisor (launch, interact, readiness)
//!                             └→ RpcTransport (JSON-RPC / daemon endpoints)
//! ```

pub mod electrum;
pub mod monero;
pub mod parity;

pub use electrum::ElectrumBackend;
pub use monero::MoneroBackend;
pub use parity::ParityBackend;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::debug;

use crate::config::EngineSettings;
use crate::currency::Currency;
use crate::error::{Error, Result};
use crate::history::Transaction;
use crate::supervisor::ReadinessPolicy;
use crate::units::{from_atomic, AtomicUnit};

/// Uniform contract over one supervised wallet engine
///
/// Methods take `&mut self`: calls on one backend never interleave.
#[async_trait]
pub trait WalletBackend: Send {
    fn currency(&self) -> Currency;

    /// Whether the engine answers its readiness probe right now
    async fn is_ready(&mut self) -> bool;

    /// Start the engine (no-op if it already answers)
    async fn start_server(&mut self) -> Result<()>;

    /// Stop the engine; an engine that is already down is not an error
    async fn stop_server(&mut self) -> Result<()>;

    /// Confirmed (spendable) balance in the human unit
    async fn get_balance(&mut self) -> Result<Decimal>;

    async fn get_receive_address(&mut self) -> Result<String>;

    /// Fee for a typical transaction in the human unit
    async fn suggest_miner_fee(&mut self) -> Result<Decimal>;

    /// Finalized incoming credits with `time >= cutoff` (unix seconds)
    async fn transactions_since(&mut self, cutoff: i64) -> Result<Vec<Transaction>>;

    /// Send `net_amount` to `target_address` paying exactly `miner_fee`
    ///
    /// Returns the engine's transaction id.
    async fn perform_transaction(
        &mut self,
        net_amount: Decimal,
        miner_fee: Decimal,
        target_address: &str,
    ) -> Result<String>;
}

/// Construct the backend for `currency`
pub fn build_backend(currency: Currency, settings: EngineSettings) -> Result<Box<dyn WalletBackend>> {
    Ok(match currency {
        Currency::Btc => Box::new(ElectrumBackend::new(settings)?),
        Currency::Xmr => Box::new(MoneroBackend::new(settings)?),
        Currency::Eth => Box::new(ParityBackend::new(settings)?),
    })
}

/// Lifecycle of one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineState {
    NotStarted,
    Configuring,
    DaemonStarting,
    DaemonReady,
    WalletLoading,
    Ready,
    Stopped,
}

impl EngineState {
    /// Move to `next`; a stopped backend never starts again
    pub(crate) fn advance(&mut self, currency: Currency, next: EngineState) -> Result<()> {
        if *self == EngineState::Stopped && next != EngineState::Stopped {
            return Err(Error::BackendStopped);
        }
        debug!("{} backend: {:?} -> {:?}", currency, self, next);
        *self = next;
        Ok(())
    }
}

/// Amounts every payment must satisfy before any engine call
pub fn validate_payment_amounts(net_amount: Decimal, miner_fee: Decimal) -> Result<()> {
    if net_amount <= Decimal::ZERO {
        return Err(Error::InvalidAmount(format!(
            "net amount must be positive, got {}",
            net_amount
        )));
    }
    if miner_fee.is_sign_negative() && !miner_fee.is_zero() {
        return Err(Error::InvalidAmount(format!(
            "miner fee must not be negative, got {}",
            miner_fee
        )));
    }
    Ok(())
}

pub(crate) fn ensure_fee_below(fee: Decimal, ceiling: Decimal) -> Result<()> {
    if fee > ceiling {
        return Err(Error::FeeTooHigh {
            fee: fee.to_string(),
            ceiling: ceiling.to_string(),
        });
    }
    Ok(())
}

/// Fees are compared in atomic units; any difference aborts the payment
pub(crate) fn ensure_fee_matches(requested: u128, quoted: u128, unit: AtomicUnit) -> Result<()> {
    if requested != quoted {
        return Err(Error::FeeMismatch {
            requested: from_atomic(requested, unit)?.to_string(),
            quoted: from_atomic(quoted, unit)?.to_string(),
        });
    }
    Ok(())
}

/// Engine version output must contain `expected`
pub(crate) fn ensure_version(output: &str, expected: &str) -> Result<()> {
    if !output.contains(expected) {
        return Err(Error::UnsupportedEngineVersion {
            expected: expected.to_string(),
            found: output.trim().lines().next().unwrap_or_default().to_string(),
        });
    }
    Ok(())
}

pub(crate) fn readiness_policy(settings: &EngineSettings) -> ReadinessPolicy {
    match settings.readiness_timeout_secs {
        Some(secs) => ReadinessPolicy::with_max_wait(Duration::from_secs(secs)),
        None => ReadinessPolicy::default(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::SATOSHI;
    use super::testing::dec;

    #[test]
    fn test_payment_amount_rules() {
        assert!(validate_payment_amounts(dec("0.1"), dec("0")).is_ok());
        assert!(matches!(
            validate_payment_amounts(dec("0"), dec("0.001")),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            validate_payment_amounts(dec("1"), dec("-0.001")),
            Err(Error::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_one_atom_fee_difference() {
        let err = ensure_fee_matches(2261, 2260, SATOSHI).unwrap_err();
        match err {
            Error::FeeMismatch { requested, quoted } => {
                assert_eq!(requested, "0.00002261");
                assert_eq!(quoted, "0.0000226");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(ensure_fee_matches(2260, 2260, SATOSHI).is_ok());
    }

    #[test]
    fn test_stopped_state_is_terminal() {
        let mut state = EngineState::NotStarted;
        state.advance(Currency::Btc, EngineState::Configuring).unwrap();
        state.advance(Currency::Btc, EngineState::Stopped).unwrap();
        assert!(matches!(
            state.advance(Currency::Btc, EngineState::Configuring),
            Err(Error::BackendStopped)
        ));
        assert!(state.advance(Currency::Btc, EngineState::Stopped).is_ok());
    }

    #[test]
    fn test_version_mismatch_reports_first_line() {
        let err = ensure_version("Electrum 4.0.1\nextra", "3.1.3").unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedEngineVersion { ref found, .. } if found == "Electrum 4.0.1"
        ));
        assert!(ensure_version("3.1.3\n", "3.1.3").is_ok());
    }
}
