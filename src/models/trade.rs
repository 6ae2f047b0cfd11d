use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// One swap event as read from a trade export.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TradeRecord {
    /// `None` for every record when the dataset has no token column.
    pub token_id: Option<String>,
    pub timestamp: Option<NaiveDateTime>,
    /// Signed token quantity, negative on sells.
    pub token_change: Option<f64>,
    /// ETH moved by the swap.
    pub native_volume: Option<f64>,
    pub eth_usd_price: Option<f64>,
}

impl TradeRecord {
    pub fn new(
        token_id: Option<&str>,
        timestamp: Option<NaiveDateTime>,
        token_change: Option<f64>,
        native_volume: Option<f64>,
        eth_usd_price: Option<f64>,
    ) -> Self {
        Self {
            token_id: token_id.map(str::to_string),
            timestamp,
            token_change,
            native_volume,
            eth_usd_price,
        }
    }

    /// Builds a record from raw cells, coercing numbers and times the lenient way:
    /// anything unparseable becomes missing.
    pub fn from_cells(
        token_id: Option<&str>,
        timestamp: &str,
        token_change: &str,
        native_volume: &str,
        eth_usd_price: Option<&str>,
    ) -> Self {
        Self {
            token_id: token_id
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            timestamp: parse_timestamp(timestamp),
            token_change: parse_number(token_change),
            native_volume: parse_number(native_volume),
            eth_usd_price: eth_usd_price.and_then(parse_number),
        }
    }

    pub fn side(&self) -> Option<TradeSide> {
        self.token_change.map(TradeSide::from_token_change)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// Tokens leaving the trader mean a sell; a zero change counts as a buy.
    pub fn from_token_change(token_change: f64) -> Self {
        if token_change < 0.0 {
            TradeSide::Sell
        } else {
            TradeSide::Buy
        }
    }

    /// `buy_sell` column encoding: 1 = sell, 0 = buy.
    pub fn as_flag(self) -> u8 {
        match self {
            TradeSide::Buy => 0,
            TradeSide::Sell => 1,
        }
    }
}

/// Metrics appended to a trade row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DerivedFields {
    pub last_eth_price: Option<f64>,
    pub buy_sell: Option<TradeSide>,
    pub circulative_supply: f64,
    pub liquidity_eth: f64,
    pub liquidity_usd: Option<f64>,
    pub market_cap_usd: Option<f64>,
}

/// A trade and its metrics. `index` points back at the record's position in the input.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub index: usize,
    pub record: TradeRecord,
    pub derived: DerivedFields,
}

/// Finite float or nothing.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }

    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }

    // Epoch: 13+ digits are milliseconds
    let epoch = raw.parse::<i64>().ok()?;
    if raw.trim_start_matches('-').len() >= 13 {
        DateTime::from_timestamp_millis(epoch).map(|dt| dt.naive_utc())
    } else {
        DateTime::from_timestamp(epoch, 0).map(|dt| dt.naive_utc())
    }
}
