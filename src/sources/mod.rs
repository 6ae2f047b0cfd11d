pub mod ape;
pub mod binance;
pub mod coingecko;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use thiserror::Error;
use crate::models::EthPricePoint;

/// One JSON object from an API listing, kept schemaless.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Token-launch platform exposing token listings and per-token trade history.
#[async_trait]
pub trait LaunchpadSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Tokens on one listing page. An empty page means the listing is exhausted.
    async fn fetch_token_page(&self, page: u32) -> Result<Vec<JsonObject>, SourceError>;

    /// Every trade of the token deployed at `address`.
    async fn fetch_trades(&self, address: &str) -> Result<Vec<JsonObject>, SourceError>;
}

/// Historical ETH/USD provider.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetches every point in `[start, end)`. Points come back in time order.
    async fn fetch_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<EthPricePoint>, SourceError>;
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("Rate limited")]
    RateLimit,
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.as_u16() == 429 => SourceError::RateLimit,
            Some(status) => SourceError::Status(status.as_u16()),
            None if e.is_decode() => SourceError::Parse(e.to_string()),
            None => SourceError::Network(e.to_string()),
        }
    }
}

/// Maps a response status the way every source here does: 429 is a rate limit,
/// anything else unsuccessful is a plain status error.
pub(crate) fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.as_u16() == 429 {
        return Err(SourceError::RateLimit);
    }
    if !status.is_success() {
        return Err(SourceError::Status(status.as_u16()));
    }
    Ok(resp)
}
