use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, ORIGIN, REFERER, USER_AGENT};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use crate::config::CollectorConfig;
use super::{check_status, JsonObject, LaunchpadSource, SourceError};

const BROWSER_UA: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36";

/// ape.store public API
pub struct ApeStoreClient {
    client: Client,
    base_endpoint: String,
    chain_id: u64,
}

#[derive(Debug, Deserialize)]
struct TokenPage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

impl ApeStoreClient {
    pub fn new(config: &CollectorConfig) -> Result<Self, SourceError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_UA));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("fr-FR,fr;q=0.9,en;q=0.8"));
        headers.insert(ORIGIN, HeaderValue::from_static("https://ape.store"));
        headers.insert(REFERER, HeaderValue::from_static("https://ape.store/"));

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| SourceError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_endpoint: config.base_endpoint.trim_end_matches('/').to_string(),
            chain_id: config.chain_id,
        })
    }

    fn trades_url(&self, address: &str) -> String {
        format!("{}/token/{}/{}/trades", self.base_endpoint, self.chain_id, address)
    }
}

/// Keeps the JSON objects of a listing; anything else in it is dropped.
fn objects(values: Vec<serde_json::Value>) -> Vec<JsonObject> {
    values.into_iter()
        .filter_map(|v| match v {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl LaunchpadSource for ApeStoreClient {
    fn name(&self) -> &'static str {
        "ApeStore"
    }

    async fn fetch_token_page(&self, page: u32) -> Result<Vec<JsonObject>, SourceError> {
        let url = format!("{}/tokens", self.base_endpoint);
        let page = page.to_string();

        let resp = self.client.get(&url)
            .query(&[
                ("page", page.as_str()),
                ("sort", "0"),
                ("order", "1"),
                ("filter", "0"),
                ("search", ""),
                ("chain", "0"),
            ])
            .send()
            .await?;

        let data: TokenPage = check_status(resp)?
            .json()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))?;

        Ok(objects(data.items))
    }

    async fn fetch_trades(&self, address: &str) -> Result<Vec<JsonObject>, SourceError> {
        let resp = self.client.get(self.trades_url(address))
            .send()
            .await?;

        // A token without trades answers `null`
        let trades: Option<Vec<serde_json::Value>> = check_status(resp)?
            .json()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))?;

        Ok(trades.map(objects).unwrap_or_default())
    }
}
