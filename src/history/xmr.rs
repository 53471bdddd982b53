//! monero-wallet-rpc `get_transfers` history

use serde::Deserialize;
use serde_json::Value;

use super::Transaction;
use crate::error::Result;
use crate::units::{from_atomic, PICONERO};

#[derive(Debug, Deserialize)]
struct Transfers {
    /// Missing when the wallet has never received anything
    #[serde(rename = "in", default)]
    incoming: Vec<Transfer>,
}

#[derive(Debug, Deserialize)]
struct Transfer {
    txid: String,
    timestamp: i64,
    /// Piconero
    amount: u64,
    #[serde(rename = "type", default)]
    kind: String,
}

/// Incoming transfers with `timestamp >= cutoff`
pub fn normalize(raw: &Value, cutoff: i64) -> Result<Vec<Transaction>> {
    if raw.is_null() {
        return Ok(Vec::new());
    }

    let transfers: Transfers = serde_json::from_value(raw.clone())?;

    transfers
        .incoming
        .into_iter()
        .filter(|t| t.kind == "in" && t.amount > 0 && t.timestamp >= cutoff)
        .map(|t| {
            Ok(Transaction {
                value: from_atomic(u128::from(t.amount), PICONERO)?,
                id: t.txid,
                time: t.timestamp,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_in_key_is_empty() {
        assert!(normalize(&json!({}), 0).unwrap().is_empty());
        assert!(normalize(&json!(null), 0).unwrap().is_empty());
    }

    #[test]
    fn test_filters_and_converts_piconero() {
        let raw = json!({
            "in": [
                {"txid": "keep", "timestamp": 200, "amount": 1_500_000_000_000u64, "type": "in"},
                {"txid": "boundary", "timestamp": 150, "amount": 1, "type": "in"},
                {"txid": "old", "timestamp": 149, "amount": 7, "type": "in"},
                {"txid": "empty", "timestamp": 200, "amount": 0, "type": "in"},
                {"txid": "pool", "timestamp": 200, "amount": 9, "type": "pool"}
            ]
        });

        let received = normalize(&raw, 150).unwrap();
        let ids: Vec<_> = received.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["keep", "boundary"]);
        assert_eq!(received[0].value, "1.5".parse().unwrap());
        assert_eq!(received[1].value, "0.000000000001".parse().unwrap());
    }
}
