//! Electrum history

use serde::Deserialize;
use serde_json::Value;

use super::Transaction;
use crate::error::{Error, Result};
use crate::units::parse_value_with_unit;

/// One row of Electrum's `history` output
#[derive(Debug, Clone, Deserialize)]
pub struct ElectrumHistoryEntry {
    pub txid: String,
    /// Absent or null while unconfirmed
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub confirmations: i64,
    /// "<amount> BTC", negative for debits
    pub value: String,
}

/// Decode the `history` result: a JSON document (possibly string-encoded)
/// holding `transactions`, or a bare list of rows
pub fn parse_history(raw: &Value) -> Result<Vec<ElectrumHistoryEntry>> {
    let decoded;
    let document = match raw {
        Value::String(text) => {
            decoded = serde_json::from_str::<Value>(text)?;
            &decoded
        }
        other => other,
    };

    let rows = match document {
        Value::Object(map) => map.get("transactions").cloned().unwrap_or(Value::Array(Vec::new())),
        Value::Array(_) => document.clone(),
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(Error::MalformedResponse(format!(
                "unexpected history shape: {}",
                other
            )))
        }
    };

    Ok(serde_json::from_value(rows)?)
}

/// Confirmed credits with `timestamp >= cutoff`
///
/// Every row must be denominated in BTC, even rows that are filtered out.
pub fn normalize(entries: &[ElectrumHistoryEntry], cutoff: i64) -> Result<Vec<Transaction>> {
    let mut received = Vec::new();

    for entry in entries {
        let value = parse_value_with_unit(&entry.value, "BTC")?;

        let Some(time) = entry.timestamp else {
            continue;
        };

        if time >= cutoff && entry.confirmations >= 1 && value > rust_decimal::Decimal::ZERO {
            received.push(Transaction {
                id: entry.txid.clone(),
                time,
                value,
            });
        }
    }

    Ok(received)
}
