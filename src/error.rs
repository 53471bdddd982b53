//! Error types for the wallet engines

use thiserror::Error;

use crate::currency::Currency;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Broad failure category, used to decide how a caller should react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Process,
    EngineCompatibility,
    Rpc,
    Validation,
    Broadcast,
}

/// Main error type for wallet backends and the aggregator
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported currencies in configuration: {}", .0.join(", "))]
    UnsupportedCurrency(Vec<String>),

    #[error("Currency not configured: {0}")]
    UnknownCurrency(String),

    #[error("Amount is not an exact decimal: {0}")]
    InvalidAmountType(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Backend was stopped and cannot be restarted")]
    BackendStopped,

    // Process supervision errors
    #[error("Engine binary missing or not executable: {0}")]
    MissingBinary(String),

    #[error("Wallet file missing: {0}")]
    MissingWalletFile(String),

    #[error("Failed to spawn engine process: {0}")]
    Spawn(String),

    #[error("Expected {expected:?} from engine process, got: {output}")]
    UnexpectedProcessOutput { expected: String, output: String },

    #[error("Timed out waiting for {0} to become ready")]
    ReadinessTimeout(String),

    #[error("Engine shutdown failed: {0}")]
    ShutdownFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    // Engine compatibility
    #[error("Unsupported engine version: expected {expected:?}, got {found:?}")]
    UnsupportedEngineVersion { expected: String, found: String },

    // RPC errors
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC connection failed: {0}")]
    RpcConnection(String),

    #[error("Malformed engine response: {0}")]
    MalformedResponse(String),

    // Validation errors
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("{amount} is not a whole number of {unit}")]
    NonIntegerUnitConversion { amount: String, unit: &'static str },

    #[error("Miner fee {fee} exceeds sanity ceiling {ceiling}")]
    FeeTooHigh { fee: String, ceiling: String },

    #[error("Miner fee no longer matches: requested {requested}, engine charges {quoted}")]
    FeeMismatch { requested: String, quoted: String },

    #[error("No receive address available: {0}")]
    NoAddressAvailable(String),

    #[error("History range too large: {requested} lookups requested, at most {max} allowed")]
    HistoryRangeTooLarge { requested: u64, max: u64 },

    // Broadcast errors
    #[error("Transaction broadcast failed: {0}")]
    BroadcastFailed(String),

    // Attribution wrapper used by the aggregator
    #[error("{currency} backend: {source}")]
    Backend {
        currency: Currency,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Category of this error (attribution wrappers report their source)
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_)
            | Error::UnsupportedCurrency(_)
            | Error::UnknownCurrency(_)
            | Error::InvalidAmountType(_)
            | Error::InvalidAmount(_)
            | Error::InvalidTimestamp(_)
            | Error::BackendStopped
            | Error::Anyhow(_) => ErrorCategory::Configuration,

            Error::MissingBinary(_)
            | Error::MissingWalletFile(_)
            | Error::Spawn(_)
            | Error::UnexpectedProcessOutput { .. }
            | Error::ReadinessTimeout(_)
            | Error::ShutdownFailed(_)
            | Error::Io(_) => ErrorCategory::Process,

            Error::UnsupportedEngineVersion { .. } => ErrorCategory::EngineCompatibility,

            Error::Rpc(_) | Error::RpcConnection(_) | Error::MalformedResponse(_) => {
                ErrorCategory::Rpc
            }

            Error::InvalidAddress(_)
            | Error::NonIntegerUnitConversion { .. }
            | Error::FeeTooHigh { .. }
            | Error::FeeMismatch { .. }
            | Error::NoAddressAvailable(_)
            | Error::HistoryRangeTooLarge { .. } => ErrorCategory::Validation,

            Error::BroadcastFailed(_) => ErrorCategory::Broadcast,

            Error::Backend { source, .. } => source.category(),
        }
    }

    /// Check if the engine could not be reached at all
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Error::RpcConnection(_) => true,
            Error::Backend { source, .. } => source.is_connection_failure(),
            _ => false,
        }
    }

    /// Wrap this error with the currency whose backend produced it
    pub fn for_currency(self, currency: Currency) -> Self {
        match self {
            already @ Error::Backend { .. } => already,
            other => Error::Backend {
                currency,
                source: Box::new(other),
            },
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::RpcConnection(e.to_string())
        } else if e.is_decode() {
            Error::MalformedResponse(e.to_string())
        } else {
            Error::Rpc(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedResponse(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
