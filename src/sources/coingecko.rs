use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use crate::models::EthPricePoint;
use super::{check_status, PriceSource, SourceError};

/// Longest range CoinGecko serves at fine granularity.
const MAX_WINDOW_DAYS: i64 = 90;

pub struct CoinGeckoRange {
    client: Client,
    url: String,
    window_delay: Duration,
}

#[derive(Debug, Deserialize)]
struct MarketChart {
    #[serde(default)]
    prices: Vec<(f64, f64)>,
}

impl CoinGeckoRange {
    pub fn new(url: &str, window_delay: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| SourceError::Network(e.to_string()))?,
            url: url.to_string(),
            window_delay,
        })
    }

    async fn fetch_window(&self, from: &str, to: &str) -> Result<MarketChart, SourceError> {
        let resp = self.client.get(&self.url)
            .query(&[("vs_currency", "usd"), ("from", from), ("to", to)])
            .send()
            .await?;

        check_status(resp)?
            .json()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))
    }
}

/// Splits `[start, end)` into consecutive windows of at most 90 days.
pub(crate) fn windows(start: NaiveDateTime, end: NaiveDateTime) -> Vec<(NaiveDateTime, NaiveDateTime)> {
    let step = ChronoDuration::days(MAX_WINDOW_DAYS);
    let mut out = Vec::new();
    let mut current = start;
    while current < end {
        let next = (current + step).min(end);
        out.push((current, next));
        current = next;
    }
    out
}

fn to_points(chart: MarketChart) -> Vec<EthPricePoint> {
    chart.prices.into_iter()
        .filter_map(|(ms, price)| {
            let timestamp = DateTime::from_timestamp_millis(ms as i64)?.naive_utc();
            Some(EthPricePoint::new(timestamp, price))
        })
        .collect()
}

#[async_trait]
impl PriceSource for CoinGeckoRange {
    fn name(&self) -> &'static str {
        "CoinGecko"
    }

    async fn fetch_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<EthPricePoint>, SourceError> {
        let mut points = Vec::new();

        for (from, to) in windows(start, end) {
            let from_s = from.and_utc().timestamp().to_string();
            let to_s = to.and_utc().timestamp().to_string();

            let chart = match self.fetch_window(&from_s, &to_s).await {
                Ok(chart) => chart,
                Err(e) if points.is_empty() => return Err(e),
                Err(e) => {
                    tracing::warn!("Stopping at {} after {}: keeping {} points", from, e, points.len());
                    break;
                }
            };

            let window_points = to_points(chart);
            tracing::info!("→ {} to {}: {} points", from, to, window_points.len());
            points.extend(window_points);

            tokio::time::sleep(self.window_delay).await;
        }

        Ok(points)
    }
}
