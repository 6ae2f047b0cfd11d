use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use crate::models::EthPricePoint;
use super::{check_status, PriceSource, SourceError};

const KLINE_LIMIT: usize = 1000;

/// Binance 1m ETHUSDT klines; the close of each minute is its price.
pub struct BinanceKlines {
    client: Client,
    url: String,
    symbol: String,
    page_delay: Duration,
}

impl BinanceKlines {
    pub fn new(url: &str, page_delay: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| SourceError::Network(e.to_string()))?,
            url: url.to_string(),
            symbol: "ETHUSDT".to_string(),
            page_delay,
        })
    }

    async fn fetch_page(&self, start: NaiveDateTime) -> Result<Vec<Vec<Value>>, SourceError> {
        let start_ms = start.and_utc().timestamp_millis().to_string();
        let limit = KLINE_LIMIT.to_string();

        let resp = self.client.get(&self.url)
            .query(&[
                ("symbol", self.symbol.as_str()),
                ("interval", "1m"),
                ("limit", limit.as_str()),
                ("startTime", start_ms.as_str()),
            ])
            .send()
            .await?;

        check_status(resp)?
            .json()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))
    }
}

/// `[open_time_ms, open, high, low, close, ...]` rows to close prices.
pub(crate) fn parse_klines(klines: &[Vec<Value>]) -> Result<Vec<EthPricePoint>, SourceError> {
    klines.iter()
        .map(|kline| {
            let open_ms = kline.first()
                .and_then(Value::as_i64)
                .ok_or_else(|| SourceError::Parse("kline without open time".to_string()))?;
            let close = kline.get(4)
                .and_then(|v| match v {
                    Value::String(s) => s.parse::<f64>().ok(),
                    other => other.as_f64(),
                })
                .ok_or_else(|| SourceError::Parse(format!("kline {} without close", open_ms)))?;
            let timestamp = DateTime::from_timestamp_millis(open_ms)
                .ok_or_else(|| SourceError::Parse(format!("bad open time {}", open_ms)))?
                .naive_utc();
            Ok(EthPricePoint::new(timestamp, close))
        })
        .collect()
}

#[async_trait]
impl PriceSource for BinanceKlines {
    fn name(&self) -> &'static str {
        "Binance"
    }

    async fn fetch_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<EthPricePoint>, SourceError> {
        let mut points = Vec::new();
        let mut current = start;

        while current < end {
            let klines = match self.fetch_page(current).await {
                Ok(klines) => klines,
                Err(e) if points.is_empty() => return Err(e),
                Err(e) => {
                    tracing::warn!("Stopping at {} after {}: keeping {} minutes", current, e, points.len());
                    break;
                }
            };
            if klines.is_empty() {
                tracing::info!("No more klines after {}", current);
                break;
            }

            let page = parse_klines(&klines)?;
            let Some(last) = page.last().map(|p| p.timestamp) else {
                break;
            };
            points.extend(page.into_iter().filter(|p| p.timestamp < end));
            current = last + ChronoDuration::minutes(1);

            tracing::debug!("✓ {} minutes up to {}", points.len(), current);
            tokio::time::sleep(self.page_delay).await;
        }

        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_server::serve;
    use chrono::NaiveDate;
    use serde_json::json;

    fn at(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap().and_hms_opt(10, minute, 0).unwrap()
    }

    #[test]
    fn test_parse_klines() {
        let raw: Vec<Vec<Value>> = serde_json::from_value(json!([
            [1717236000000i64, "3800.1", "3801", "3799", "3800.55", "12.3", 1717236059999i64],
            [1717236060000i64, "3800.55", "3802", "3800", "3801.00", "8.1", 1717236119999i64]
        ]))
        .unwrap();

        let points = parse_klines(&raw).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(
            points[0].timestamp,
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap().and_hms_opt(10, 0, 0).unwrap()
        );
        assert_eq!(points[0].eth_price, 3800.55);
        assert_eq!(points[1].eth_price, 3801.0);
    }

    #[test]
    fn test_parse_klines_rejects_short_rows() {
        let raw = vec![vec![json!(1717236000000i64), json!("1")]];
        assert!(matches!(parse_klines(&raw), Err(SourceError::Parse(_))));
    }

    #[tokio::test]
    async fn test_rate_limit_keeps_fetched_pages() {
        let url = serve(vec![
            (200, r#"[[1717236000000, "1", "1", "1", "3800.5", "1"], [1717236060000, "1", "1", "1", "3801", "1"]]"#),
            (429, ""),
        ])
        .await;

        let source = BinanceKlines::new(&url, Duration::ZERO).unwrap();
        let points = source.fetch_range(at(0), at(30)).await.unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[1].timestamp, at(1));
        assert_eq!(points[1].eth_price, 3801.0);
    }

    #[tokio::test]
    async fn test_error_before_any_page() {
        let url = serve(vec![(429, "")]).await;
        let source = BinanceKlines::new(&url, Duration::ZERO).unwrap();
        let result = source.fetch_range(at(0), at(30)).await;
        assert!(matches!(result, Err(SourceError::RateLimit)));
    }
}
