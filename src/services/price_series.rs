use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use chrono::{NaiveDateTime, Timelike};
use crate::error::MetricsError;
use crate::models::trade::{parse_number, parse_timestamp};
use crate::models::EthPricePoint;

const MINUTE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// ETH/USD price at a trade's time.
pub trait EthPriceLookup {
    fn price_at(&self, timestamp: Option<NaiveDateTime>) -> Option<f64>;
}

/// One price for every trade, timestamp or not.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantPrice(pub f64);

impl EthPriceLookup for ConstantPrice {
    fn price_at(&self, _timestamp: Option<NaiveDateTime>) -> Option<f64> {
        Some(self.0)
    }
}

/// Per-minute ETH/USD prices keyed by the truncated minute.
#[derive(Debug, Clone, Default)]
pub struct EthPriceSeries {
    minutes: BTreeMap<NaiveDateTime, f64>,
}

/// Drops seconds and sub-seconds.
pub fn truncate_to_minute(timestamp: NaiveDateTime) -> NaiveDateTime {
    timestamp
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(timestamp)
}

impl EthPriceSeries {
    /// Buckets raw points by minute, averaging points that share one.
    pub fn from_points(points: impl IntoIterator<Item = EthPricePoint>) -> Self {
        let mut buckets: BTreeMap<NaiveDateTime, (f64, u32)> = BTreeMap::new();
        for point in points {
            if !point.eth_price.is_finite() {
                continue;
            }
            let bucket = buckets.entry(truncate_to_minute(point.timestamp)).or_insert((0.0, 0));
            bucket.0 += point.eth_price;
            bucket.1 += 1;
        }

        let minutes = buckets.into_iter()
            .map(|(minute, (sum, count))| (minute, sum / count as f64))
            .collect();
        Self { minutes }
    }

    pub fn len(&self) -> usize {
        self.minutes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.minutes.is_empty()
    }

    pub fn first_minute(&self) -> Option<NaiveDateTime> {
        self.minutes.keys().next().copied()
    }

    pub fn last_minute(&self) -> Option<NaiveDateTime> {
        self.minutes.keys().next_back().copied()
    }

    pub fn points(&self) -> impl Iterator<Item = EthPricePoint> + '_ {
        self.minutes.iter().map(|(minute, price)| EthPricePoint::new(*minute, *price))
    }

    /// Reads a `timestamp,eth_price` CSV. Rows with an unparseable time or price are skipped.
    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self, MetricsError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, MetricsError> {
        let mut csv_rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let headers = csv_rdr.headers()?.clone();
        let position = |name: &str| {
            headers.iter()
                .position(|h| h == name)
                .ok_or_else(|| MetricsError::MissingColumn(name.to_string()))
        };
        let ts_col = position("timestamp")?;
        let price_col = position("eth_price")?;

        let mut points = Vec::new();
        let mut skipped = 0usize;
        for result in csv_rdr.records() {
            let record = result?;
            let timestamp = record.get(ts_col).and_then(parse_timestamp);
            let price = record.get(price_col).and_then(parse_number);
            match (timestamp, price) {
                (Some(timestamp), Some(price)) => points.push(EthPricePoint::new(timestamp, price)),
                _ => skipped += 1,
            }
        }

        if skipped > 0 {
            tracing::debug!("Skipped {} unusable ETH price rows", skipped);
        }

        Ok(Self::from_points(points))
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), MetricsError> {
        let file = File::create(path)?;
        self.to_writer(BufWriter::new(file))
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), MetricsError> {
        let mut csv_wtr = csv::Writer::from_writer(writer);
        csv_wtr.write_record(["timestamp", "eth_price"])?;
        for (minute, price) in &self.minutes {
            csv_wtr.write_record([minute.format(MINUTE_FORMAT).to_string(), price.to_string()])?;
        }
        csv_wtr.flush()?;
        Ok(())
    }
}

impl EthPriceLookup for EthPriceSeries {
    /// Exact minute match; gaps are not interpolated.
    fn price_at(&self, timestamp: Option<NaiveDateTime>) -> Option<f64> {
        let minute = truncate_to_minute(timestamp?);
        self.minutes.get(&minute).copied()
    }
}
