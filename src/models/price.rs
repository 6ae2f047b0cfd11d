use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// ETH/USD observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EthPricePoint {
    pub timestamp: NaiveDateTime,
    pub eth_price: f64,
}

impl EthPricePoint {
    pub fn new(timestamp: NaiveDateTime, eth_price: f64) -> Self {
        Self { timestamp, eth_price }
    }
}
