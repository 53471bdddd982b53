//! coffer - multi-currency wallet engine manager
//!
//! Supervises local Bitcoin (Electrum), Monero (monerod + monero-wallet-rpc)
//! and Ethereum (Parity) wallet engines and exposes them through one API.

pub mod aggregator;
pub mod backend;
pub mod cli;
pub mod config;
pub mod currency;
pub mod error;
pub mod history;
pub mod rpc;
pub mod supervisor;
pub mod units;

// Re-export commonly used types
pub use aggregator::Aggregator;
pub use backend::WalletBackend;
pub use config::AppConfig;
pub use currency::Currency;
pub use error::{Error, ErrorCategory, Result};
pub use history::Transaction;
