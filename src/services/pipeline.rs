use std::time::{Duration, Instant};
use chrono::Utc;
use crate::config::{MetricsConfig, PriceConfig, PriceSourceKind};
use crate::error::MetricsError;
use crate::models::trade::parse_timestamp;
use crate::sources::binance::BinanceKlines;
use crate::sources::coingecko::CoinGeckoRange;
use crate::sources::PriceSource;
use super::metrics::{derive_metrics, sort_rows, MetricsOptions};
use super::price_series::{ConstantPrice, EthPriceLookup, EthPriceSeries};
use super::creators::CreatorIndex;
use super::storage::{InputFormat, TradeTable};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    pub trades: usize,
    pub tokens: usize,
    pub missing_last_price: usize,
    pub missing_eth_usd_price: usize,
}

/// Reads the trade export, derives the metrics and writes the enriched table.
pub fn run_metrics_job(config: &MetricsConfig) -> Result<MetricsSummary, MetricsError> {
    let start = Instant::now();

    let format = config.input_format
        .unwrap_or_else(|| InputFormat::from_path(&config.input));
    let mut table = TradeTable::read_as(&config.input, format)?;
    let records = table.records(&config.columns)?;
    tracing::info!("✓ Loaded {} trades from {} ({:?})", records.len(), config.input.display(), format);

    if let Some(path) = &config.creators {
        let creators = CreatorIndex::read_csv(path)?;
        tracing::info!("✓ Loaded {} token creators from {}", creators.len(), path.display());
        table.add_creator_flag(&creators, &config.columns)?;
    }

    // A constant price replaces any series
    let series = match (&config.constant_eth_usd_price, &config.eth_price_series) {
        (None, Some(path)) => {
            let series = EthPriceSeries::read_csv(path)?;
            tracing::info!("✓ Loaded {} ETH/USD minutes from {}", series.len(), path.display());
            Some(series)
        }
        _ => None,
    };
    let constant = config.constant_eth_usd_price.map(ConstantPrice);
    let lookup: Option<&dyn EthPriceLookup> = match (&constant, &series) {
        (Some(constant), _) => Some(constant),
        (None, Some(series)) => Some(series),
        (None, None) => None,
    };

    let options = MetricsOptions::new(config.liquidity_convention)
        .with_baseline_reserve(config.baseline_reserve_eth);
    if options.baseline_reserve != 0.0 {
        tracing::info!("Applying baseline reserve of {} ETH to every row", options.baseline_reserve);
    }

    let mut rows = derive_metrics(&records, lookup, &options);
    sort_rows(&mut rows, config.output_order);
    table.write_with_metrics(&rows, &config.output)?;

    let mut tokens: Vec<Option<&str>> = rows.iter().map(|r| r.record.token_id.as_deref()).collect();
    tokens.dedup();

    let summary = MetricsSummary {
        trades: rows.len(),
        tokens: tokens.len(),
        missing_last_price: rows.iter().filter(|r| r.derived.last_eth_price.is_none()).count(),
        missing_eth_usd_price: rows.iter().filter(|r| r.derived.liquidity_usd.is_none()).count(),
    };

    tracing::info!(
        "✓ Wrote {} ({} trades, {} tokens, {} without price) in {:.2}s",
        config.output.display(),
        summary.trades,
        summary.tokens,
        summary.missing_last_price,
        start.elapsed().as_secs_f64()
    );

    Ok(summary)
}

pub fn price_source(config: &PriceConfig) -> Result<Box<dyn PriceSource>, MetricsError> {
    let delay = Duration::from_millis(config.request_delay_ms);
    let source: Box<dyn PriceSource> = match config.source {
        PriceSourceKind::Binance => Box::new(BinanceKlines::new(&config.binance_url, delay)?),
        PriceSourceKind::Coingecko => Box::new(CoinGeckoRange::new(&config.coingecko_url, delay)?),
    };
    Ok(source)
}

/// Downloads ETH/USD minutes for the configured range and writes them as a series CSV.
pub async fn run_price_job(config: &PriceConfig) -> Result<EthPriceSeries, MetricsError> {
    let start = parse_timestamp(&config.start)
        .ok_or_else(|| MetricsError::InvalidTimestamp(config.start.clone()))?;
    let end = match &config.end {
        Some(raw) => parse_timestamp(raw).ok_or_else(|| MetricsError::InvalidTimestamp(raw.clone()))?,
        None => Utc::now().naive_utc(),
    };

    let source = price_source(config)?;
    tracing::info!("📅 Fetching ETH/USD from {} ({} → {})", source.name(), start, end);

    let points = source.fetch_range(start, end).await?;
    let series = EthPriceSeries::from_points(points);
    series.write_csv(&config.output)?;

    tracing::info!("✓ {} minutes written to {}", series.len(), config.output.display());
    Ok(series)
}
