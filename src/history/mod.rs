//! Incoming transaction history
//!
//! Each engine reports history in its own shape; the per-engine `normalize`
//! functions reduce it to finalized incoming credits at or after a cutoff.

pub mod btc;
pub mod eth;
pub mod xmr;

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use crate::error::{Error, Result};

/// A finalized incoming credit, value in the human unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub id: String,
    /// Unix seconds
    pub time: i64,
    pub value: Decimal,
}

/// Reject cutoffs before the epoch
pub fn validate_cutoff(cutoff: i64) -> Result<()> {
    if cutoff < 0 {
        return Err(Error::InvalidTimestamp(format!(
            "cutoff {} is before the unix epoch",
            cutoff
        )));
    }
    Ok(())
}

/// Block number to timestamp, bounded with first-in first-out eviction
#[derive(Debug)]
pub struct BlockTimeCache {
    capacity: usize,
    times: HashMap<u64, i64>,
    order: VecDeque<u64>,
}

impl BlockTimeCache {
    pub const DEFAULT_CAPACITY: usize = 16_384;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            times: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, block: u64) -> Option<i64> {
        self.times.get(&block).copied()
    }

    pub fn insert(&mut self, block: u64, time: i64) {
        if self.times.insert(block, time).is_some() {
            return;
        }
        self.order.push_back(block);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.times.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

impl Default for BlockTimeCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
