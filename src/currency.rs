//! Supported currencies

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::Error;

/// A currency with a backend implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    /// Bitcoin, served by Electrum
    Btc,
    /// Monero, served by monerod + monero-wallet-rpc
    Xmr,
    /// Ether, served by a Parity-style node
    Eth,
}

impl Currency {
    pub const ALL: [Currency; 3] = [Currency::Btc, Currency::Xmr, Currency::Eth];

    /// Ticker code used in configuration and reports
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Btc => "BTC",
            Currency::Xmr => "XMR",
            Currency::Eth => "ETH",
        }
    }
}

impl FromStr for Currency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BTC" => Ok(Currency::Btc),
            "XMR" => Ok(Currency::Xmr),
            "ETH" => Ok(Currency::Eth),
            _ => Err(Error::UnsupportedCurrency(vec![s.to_string()])),
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("btc".parse::<Currency>().unwrap(), Currency::Btc);
        assert_eq!(" XMR ".parse::<Currency>().unwrap(), Currency::Xmr);
        assert!(matches!(
            "DOGE".parse::<Currency>(),
            Err(Error::UnsupportedCurrency(codes)) if codes == vec!["DOGE".to_string()]
        ));
    }

    #[test]
    fn test_ordering_follows_declaration() {
        let mut all = vec![Currency::Eth, Currency::Btc, Currency::Xmr];
        all.sort();
        assert_eq!(all, Currency::ALL.to_vec());
    }
}
