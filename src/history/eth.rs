//! Ethereum block-scan history

use serde::Deserialize;
use std::collections::HashMap;

use super::Transaction;
use crate::error::{Error, Result};
use crate::units::{from_hex_atomic, parse_hex_u64, WEI};

/// Widest block range scanned for history (about ten minutes of RPC at ~70ms per block)
pub const MAX_LOOKBACK_BLOCKS: u64 = 8562;

/// Distinct block timestamp lookups allowed in one normalization
pub const MAX_BLOCK_LOOKUPS: u64 = MAX_LOOKBACK_BLOCKS + 1;

/// `eth_getBlockByNumber(n, true)` result, reduced to what history needs
#[derive(Debug, Clone, Deserialize)]
pub struct EthBlock {
    pub number: String,
    pub timestamp: String,
    #[serde(default)]
    pub transactions: Vec<EthTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthTransaction {
    pub hash: String,
    #[serde(default)]
    pub from: Option<String>,
    /// `None` for contract creation
    #[serde(default)]
    pub to: Option<String>,
    /// Hex wei
    pub value: String,
    /// `None` while pending
    #[serde(default)]
    pub block_number: Option<String>,
}

/// Mined value transfers to `account` in blocks at or after `cutoff`
///
/// `block_time` resolves a block number to its timestamp; each block is
/// looked up at most once per call.
pub fn normalize<F>(
    transactions: &[EthTransaction],
    account: &str,
    cutoff: i64,
    mut block_time: F,
) -> Result<Vec<Transaction>>
where
    F: FnMut(u64) -> Result<i64>,
{
    let account = account.to_ascii_lowercase();
    let mut times: HashMap<u64, i64> = HashMap::new();
    let mut received = Vec::new();

    for tx in transactions {
        let Some(block) = tx.block_number.as_deref() else {
            continue;
        };
        let Some(to) = tx.to.as_deref() else {
            continue;
        };
        if to.to_ascii_lowercase() != account {
            continue;
        }

        let value = from_hex_atomic(&tx.value, WEI)?;
        if value.is_zero() {
            continue;
        }

        let block = parse_hex_u64(block)?;
        let time = match times.get(&block) {
            Some(&time) => time,
            None => {
                if times.len() as u64 >= MAX_BLOCK_LOOKUPS {
                    return Err(Error::HistoryRangeTooLarge {
                        requested: times.len() as u64 + 1,
                        max: MAX_BLOCK_LOOKUPS,
                    });
                }
                let time = block_time(block)?;
                times.insert(block, time);
                time
            }
        };

        if time >= cutoff {
            received.push(Transaction {
                id: tx.hash.clone(),
                time,
                value,
            });
        }
    }

    Ok(received)
}
