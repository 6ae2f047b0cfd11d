use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use crate::error::MetricsError;
use crate::services::metrics::{LiquidityConvention, SortOrder};
use crate::services::storage::InputFormat;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub prices: PriceConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Taken from the input extension when unset.
    #[serde(default)]
    pub input_format: Option<InputFormat>,
    /// Required: the trade logs disagree on how sells move liquidity.
    pub liquidity_convention: LiquidityConvention,
    /// Heuristic ETH offset for reserves the trade log never saw.
    #[serde(default)]
    pub baseline_reserve_eth: f64,
    /// Overrides every row's ETH/USD price when set.
    #[serde(default)]
    pub constant_eth_usd_price: Option<f64>,
    /// Per-minute ETH/USD series joined on the trade minute.
    #[serde(default)]
    pub eth_price_series: Option<PathBuf>,
    /// Token listing (`id`, `creator`) enabling the `creator` column.
    #[serde(default)]
    pub creators: Option<PathBuf>,
    #[serde(default = "default_output_order")]
    pub output_order: SortOrder,
    #[serde(default)]
    pub columns: ColumnNames,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ColumnNames {
    #[serde(default = "default_token_id")]
    pub token_id: String,
    #[serde(default = "default_timestamp")]
    pub timestamp: String,
    #[serde(default = "default_token_change")]
    pub token_change: String,
    #[serde(default = "default_native_volume")]
    pub native_volume: String,
    #[serde(default = "default_eth_usd_price")]
    pub eth_usd_price: String,
    #[serde(default = "default_to")]
    pub to: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PriceConfig {
    #[serde(default = "default_price_source")]
    pub source: PriceSourceKind,
    #[serde(default = "default_price_start")]
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default = "default_price_output")]
    pub output: PathBuf,
    #[serde(default = "default_binance_url")]
    pub binance_url: String,
    #[serde(default = "default_coingecko_url")]
    pub coingecko_url: String,
    #[serde(default = "default_price_delay_ms")]
    pub request_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriceSourceKind {
    Binance,
    Coingecko,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    #[serde(default = "default_base_endpoint")]
    pub base_endpoint: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_delay_secs")]
    pub page_delay_secs: u64,
    #[serde(default)]
    pub token_jobs: Vec<TokenPageJob>,
    #[serde(default)]
    pub trade_inputs: Vec<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenPageJob {
    pub start: u32,
    pub end: u32,
    pub output: PathBuf,
}

fn default_output_order() -> SortOrder { SortOrder::Descending }
fn default_token_id() -> String { "tokenID".to_string() }
fn default_timestamp() -> String { "timeStamp".to_string() }
fn default_token_change() -> String { "tokenChange".to_string() }
fn default_native_volume() -> String { "nativeVolume".to_string() }
fn default_eth_usd_price() -> String { "eth_usd_price".to_string() }
fn default_to() -> String { "to".to_string() }
fn default_price_source() -> PriceSourceKind { PriceSourceKind::Binance }
fn default_price_start() -> String { "2024-04-04T22:49:08".to_string() }
fn default_price_output() -> PathBuf { PathBuf::from("eth_price_per_minute.csv") }
fn default_binance_url() -> String { "https://api.binance.com/api/v3/klines".to_string() }
fn default_coingecko_url() -> String {
    "https://api.coingecko.com/api/v3/coins/ethereum/market_chart/range".to_string()
}
fn default_price_delay_ms() -> u64 { 500 }
fn default_base_endpoint() -> String { "https://ape.store/api".to_string() }
fn default_chain_id() -> u64 { 8453 }
fn default_max_retries() -> u32 { 10 }
fn default_retry_delay_secs() -> u64 { 3 }
fn default_timeout_secs() -> u64 { 10 }
fn default_page_delay_secs() -> u64 { 1 }

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            token_id: default_token_id(),
            timestamp: default_timestamp(),
            token_change: default_token_change(),
            native_volume: default_native_volume(),
            eth_usd_price: default_eth_usd_price(),
            to: default_to(),
        }
    }
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            source: default_price_source(),
            start: default_price_start(),
            end: None,
            output: default_price_output(),
            binance_url: default_binance_url(),
            coingecko_url: default_coingecko_url(),
            request_delay_ms: default_price_delay_ms(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_endpoint: default_base_endpoint(),
            chain_id: default_chain_id(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            timeout_secs: default_timeout_secs(),
            page_delay_secs: default_page_delay_secs(),
            token_jobs: Vec::new(),
            trade_inputs: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, MetricsError> {
        Self::load_from("config.toml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, MetricsError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, MetricsError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}
