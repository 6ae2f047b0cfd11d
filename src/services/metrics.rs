//! Per-token cumulative metrics over a trade log.
//!
//! Every trade gets its execution price in ETH, a buy/sell flag, and the running
//! circulating supply and ETH liquidity of its token, plus the USD figures derived
//! from those. Running sums are order dependent, so the derivation always sorts its
//! own working copy by `(token, timestamp)` first.

use std::cmp::Ordering;
use std::collections::HashMap;
use serde::Deserialize;
use crate::models::{DerivedFields, MetricRow, TradeRecord, TradeSide};
use super::price_series::EthPriceLookup;

/// How a trade's ETH volume moves the token's liquidity.
///
/// The historical exports were produced with both rules and they disagree on every
/// sell, so there is no default: callers pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidityConvention {
    /// Add the raw volume whatever the side.
    UnsignedVolume,
    /// Buys add the volume, sells remove it.
    SignedBySide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsOptions {
    pub convention: LiquidityConvention,
    /// ETH added to every emitted liquidity value.
    ///
    /// This is a calibration heuristic, not a derived quantity: the trade log misses the
    /// pool's initial reserve, and the offset is estimated by comparing computed liquidity
    /// against readings from the platform. It shifts every row of every token by the same
    /// amount and never enters the running sum.
    pub baseline_reserve: f64,
}

impl MetricsOptions {
    pub fn new(convention: LiquidityConvention) -> Self {
        Self {
            convention,
            baseline_reserve: 0.0,
        }
    }

    pub fn with_baseline_reserve(mut self, baseline_reserve: f64) -> Self {
        self.baseline_reserve = baseline_reserve;
        self
    }
}

/// Running state of one token. A token without an entry has not been seen yet.
#[derive(Debug, Default, Clone, Copy)]
struct TokenAccumulator {
    circulative_supply: f64,
    liquidity_eth: f64,
}

impl TokenAccumulator {
    fn apply(&mut self, record: &TradeRecord, convention: LiquidityConvention) {
        // Missing fields contribute nothing so later rows keep a defined total
        self.circulative_supply += record.token_change.unwrap_or(0.0);
        self.liquidity_eth += native_contribution(record, convention);
    }
}

fn native_contribution(record: &TradeRecord, convention: LiquidityConvention) -> f64 {
    let Some(volume) = record.native_volume else {
        return 0.0;
    };

    match convention {
        LiquidityConvention::UnsignedVolume => volume,
        LiquidityConvention::SignedBySide => match record.side() {
            Some(TradeSide::Buy) => volume,
            Some(TradeSide::Sell) => -volume,
            None => 0.0,
        },
    }
}

/// |native volume| / |token change|, or nothing when that is not a finite number.
pub fn last_eth_price(record: &TradeRecord) -> Option<f64> {
    let volume = record.native_volume?;
    let change = record.token_change?;
    if change == 0.0 {
        return None;
    }
    finite(volume.abs() / change.abs())
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Derives the metrics of every record.
///
/// The result is in chronological order per token (tokens ascending). Each row keeps
/// the index of its record in `records`. When `eth_price_lookup` knows the record's
/// minute, its price wins over the record's own `eth_usd_price`.
pub fn derive_metrics(
    records: &[TradeRecord],
    eth_price_lookup: Option<&dyn EthPriceLookup>,
    options: &MetricsOptions,
) -> Vec<MetricRow> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| chronological(&records[a], &records[b]).then(a.cmp(&b)));

    let mut accumulators: HashMap<Option<&str>, TokenAccumulator> = HashMap::new();
    let mut rows = Vec::with_capacity(records.len());

    for index in order {
        let record = &records[index];
        let state = accumulators.entry(record.token_id.as_deref()).or_default();
        state.apply(record, options.convention);

        let eth_usd_price = eth_price_lookup
            .and_then(|lookup| lookup.price_at(record.timestamp))
            .or(record.eth_usd_price);

        let last_price = last_eth_price(record);
        let liquidity_eth = state.liquidity_eth + options.baseline_reserve;

        let derived = DerivedFields {
            last_eth_price: last_price,
            buy_sell: record.side(),
            circulative_supply: state.circulative_supply,
            liquidity_eth,
            liquidity_usd: eth_usd_price.and_then(|p| finite(liquidity_eth * p)),
            market_cap_usd: match (last_price, eth_usd_price) {
                (Some(last), Some(p)) => finite(state.circulative_supply * last * p),
                _ => None,
            },
        };

        rows.push(MetricRow {
            index,
            record: record.clone(),
            derived,
        });
    }

    tracing::debug!(
        "Derived metrics for {} trades across {} tokens",
        rows.len(),
        accumulators.len()
    );

    rows
}

/// Re-sorts derived rows by `(token, timestamp)`.
///
/// Descending output is the exact reverse of the chronology within a token. Rows
/// without a token or timestamp stay last in both orders.
pub fn sort_rows(rows: &mut [MetricRow], order: SortOrder) {
    match order {
        SortOrder::Ascending => {
            rows.sort_by(|a, b| key_order(&a.record, &b.record, false));
        }
        SortOrder::Descending => {
            rows.reverse();
            rows.sort_by(|a, b| key_order(&a.record, &b.record, true));
        }
    }
}

/// Accumulation order. Ties on `(token, timestamp)` fall back to the remaining fields
/// so the result does not depend on input order.
fn chronological(a: &TradeRecord, b: &TradeRecord) -> Ordering {
    key_order(a, b, false)
        .then_with(|| cmp_missing_last(&a.token_change, &b.token_change, f64::total_cmp))
        .then_with(|| cmp_missing_last(&a.native_volume, &b.native_volume, f64::total_cmp))
        .then_with(|| cmp_missing_last(&a.eth_usd_price, &b.eth_usd_price, f64::total_cmp))
}

fn key_order(a: &TradeRecord, b: &TradeRecord, descending: bool) -> Ordering {
    let flip = |o: Ordering| if descending { o.reverse() } else { o };

    cmp_missing_last(&a.token_id, &b.token_id, |x, y| flip(cmp_token_ids(x, y)))
        .then_with(|| cmp_missing_last(&a.timestamp, &b.timestamp, |x, y| flip(x.cmp(y))))
}

fn cmp_missing_last<T>(a: &Option<T>, b: &Option<T>, cmp: impl Fn(&T, &T) -> Ordering) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => cmp(x, y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Numeric ids compare as numbers, before any non-numeric id.
fn cmp_token_ids(a: &str, b: &str) -> Ordering {
    let numeric = |s: &str| s.parse::<f64>().ok().filter(|v| v.is_finite());
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => x.total_cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::price_series::{ConstantPrice, EthPriceSeries};
    use crate::models::EthPricePoint;
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, minute, 0)
            .unwrap()
    }

    fn trade(token: &str, minute: u32, change: f64, volume: f64) -> TradeRecord {
        TradeRecord::new(Some(token), Some(at(minute)), Some(change), Some(volume), Some(2500.0))
    }

    fn signed() -> MetricsOptions {
        MetricsOptions::new(LiquidityConvention::SignedBySide)
    }

    fn unsigned() -> MetricsOptions {
        MetricsOptions::new(LiquidityConvention::UnsignedVolume)
    }

    fn supply_of(rows: &[MetricRow], token: &str) -> Vec<f64> {
        rows.iter()
            .filter(|r| r.record.token_id.as_deref() == Some(token))
            .map(|r| r.derived.circulative_supply)
            .collect()
    }

    fn by_index(rows: &[MetricRow]) -> Vec<MetricRow> {
        let mut sorted = rows.to_vec();
        sorted.sort_by_key(|r| r.index);
        sorted
    }

    fn interleaved() -> Vec<TradeRecord> {
        vec![
            trade("B", 3, 50.0, 4.0),
            trade("A", 2, -30.0, 2.0),
            trade("B", 1, -20.0, 1.5),
            trade("A", 5, 10.0, 1.0),
            trade("A", 0, 100.0, 5.0),
        ]
    }

    #[test]
    fn test_two_tokens_accumulate_independently() {
        let rows = derive_metrics(&interleaved(), None, &signed());

        assert_eq!(supply_of(&rows, "A"), vec![100.0, 70.0, 80.0]);
        assert_eq!(supply_of(&rows, "B"), vec![-20.0, 30.0]);

        let liquidity_a: Vec<f64> = rows.iter()
            .filter(|r| r.record.token_id.as_deref() == Some("A"))
            .map(|r| r.derived.liquidity_eth)
            .collect();
        assert_eq!(liquidity_a, vec![5.0, 3.0, 4.0]);
    }

    #[test]
    fn test_unsigned_convention_ignores_side() {
        let rows = derive_metrics(&interleaved(), None, &unsigned());

        let liquidity_a: Vec<f64> = rows.iter()
            .filter(|r| r.record.token_id.as_deref() == Some("A"))
            .map(|r| r.derived.liquidity_eth)
            .collect();
        assert_eq!(liquidity_a, vec![5.0, 7.0, 8.0]);

        let liquidity_b: Vec<f64> = rows.iter()
            .filter(|r| r.record.token_id.as_deref() == Some("B"))
            .map(|r| r.derived.liquidity_eth)
            .collect();
        assert_eq!(liquidity_b, vec![1.5, 5.5]);
    }

    #[test]
    fn test_final_supply_matches_direct_sum() {
        let records = interleaved();
        let rows = derive_metrics(&records, None, &signed());

        for token in ["A", "B"] {
            let direct: f64 = records.iter()
                .filter(|r| r.token_id.as_deref() == Some(token))
                .filter_map(|r| r.token_change)
                .sum();
            let running = supply_of(&rows, token);
            assert_eq!(*running.last().unwrap(), direct);
        }
    }

    #[test]
    fn test_input_order_does_not_change_results() {
        let records = interleaved();
        let mut shuffled = records.clone();
        shuffled.reverse();
        shuffled.swap(0, 2);

        let original = by_index(&derive_metrics(&records, None, &signed()));
        let reordered = derive_metrics(&shuffled, None, &signed());

        for row in original {
            let twin = reordered.iter().find(|r| r.record == row.record).unwrap();
            assert_eq!(twin.derived, row.derived);
        }
    }

    #[test]
    fn test_rerun_is_identical() {
        let records = interleaved();
        let first = derive_metrics(&records, None, &unsigned());
        let second = derive_metrics(&records, None, &unsigned());
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_token_change() {
        let records = vec![trade("A", 0, 0.0, 3.0)];
        let rows = derive_metrics(&records, None, &signed());
        let derived = &rows[0].derived;

        assert_eq!(derived.last_eth_price, None);
        assert_eq!(derived.market_cap_usd, None);
        assert_eq!(derived.circulative_supply, 0.0);
        assert_eq!(derived.buy_sell, Some(TradeSide::Buy));
        assert_eq!(derived.liquidity_eth, 3.0);
        assert_eq!(derived.liquidity_usd, Some(7500.0));
    }

    #[test]
    fn test_last_price_never_infinite() {
        let records = vec![
            trade("A", 0, 1e-320, 1e300),
            trade("A", 1, 0.0, 0.0),
            trade("A", 2, -4.0, 2.0),
        ];
        let rows = derive_metrics(&records, None, &signed());

        assert_eq!(rows[0].derived.last_eth_price, None);
        assert_eq!(rows[1].derived.last_eth_price, None);
        assert_eq!(rows[2].derived.last_eth_price, Some(0.5));
        assert!(rows.iter().all(|r| r.derived.last_eth_price.map_or(true, f64::is_finite)));
    }

    #[test]
    fn test_baseline_reserve_is_uniform_offset() {
        let records = interleaved();
        let plain = derive_metrics(&records, None, &signed());
        let shifted = derive_metrics(&records, None, &signed().with_baseline_reserve(0.8));

        for (a, b) in plain.iter().zip(&shifted) {
            assert_eq!(a.index, b.index);
            assert!((b.derived.liquidity_eth - a.derived.liquidity_eth - 0.8).abs() < 1e-12);
            assert_eq!(a.derived.circulative_supply, b.derived.circulative_supply);
        }
    }

    #[test]
    fn test_missing_token_change_contributes_zero() {
        let records = vec![
            trade("A", 0, 100.0, 5.0),
            TradeRecord::from_cells(Some("A"), "2024-06-01 12:01:00", "n/a", "2", Some("2500")),
            trade("A", 2, -10.0, 1.0),
        ];
        let rows = derive_metrics(&records, None, &signed());

        let broken = &rows[1].derived;
        assert_eq!(broken.circulative_supply, 100.0);
        assert_eq!(broken.buy_sell, None);
        assert_eq!(broken.last_eth_price, None);
        assert_eq!(broken.market_cap_usd, None);
        // Unknown side: nothing to sign
        assert_eq!(broken.liquidity_eth, 5.0);

        assert_eq!(rows[2].derived.circulative_supply, 90.0);
        assert_eq!(rows[2].derived.liquidity_eth, 4.0);
    }

    #[test]
    fn test_missing_native_volume() {
        let records = vec![
            trade("A", 0, 100.0, 5.0),
            TradeRecord::from_cells(Some("A"), "2024-06-01 12:01:00", "50", "", Some("2500")),
        ];
        let rows = derive_metrics(&records, None, &unsigned());

        assert_eq!(rows[1].derived.circulative_supply, 150.0);
        assert_eq!(rows[1].derived.liquidity_eth, 5.0);
        assert_eq!(rows[1].derived.last_eth_price, None);
        assert_eq!(rows[1].derived.buy_sell, Some(TradeSide::Buy));
    }

    #[test]
    fn test_no_token_column_is_one_group() {
        let records = vec![
            TradeRecord::new(None, Some(at(2)), Some(-5.0), Some(1.0), None),
            TradeRecord::new(None, Some(at(0)), Some(20.0), Some(2.0), None),
        ];
        let rows = derive_metrics(&records, None, &signed());

        assert_eq!(rows[0].index, 1);
        assert_eq!(rows[0].derived.circulative_supply, 20.0);
        assert_eq!(rows[1].derived.circulative_supply, 15.0);
        assert_eq!(rows[1].derived.liquidity_usd, None);
    }

    #[test]
    fn test_market_cap() {
        let rows = derive_metrics(&[trade("A", 0, 100.0, 5.0)], None, &signed());
        let derived = &rows[0].derived;
        assert_eq!(derived.last_eth_price, Some(0.05));
        assert!((derived.market_cap_usd.unwrap() - 100.0 * 0.05 * 2500.0).abs() < 1e-9);
    }

    #[test]
    fn test_lookup_overrides_row_price() {
        let records = vec![
            trade("A", 0, 100.0, 5.0),
            TradeRecord::new(Some("A"), None, Some(10.0), Some(1.0), None),
        ];

        let constant = ConstantPrice(2531.0);
        let rows = derive_metrics(&records, Some(&constant), &signed());
        assert_eq!(rows[0].derived.liquidity_usd, Some(5.0 * 2531.0));
        assert_eq!(rows[1].derived.liquidity_usd, Some(6.0 * 2531.0));

        // Series without the trade's minute falls back to the row price
        let series = EthPriceSeries::from_points(vec![EthPricePoint::new(at(59), 3000.0)]);
        let rows = derive_metrics(&records, Some(&series), &signed());
        assert_eq!(rows[0].derived.liquidity_usd, Some(5.0 * 2500.0));
        assert_eq!(rows[1].derived.liquidity_usd, None);
    }

    #[test]
    fn test_empty_input() {
        assert!(derive_metrics(&[], None, &signed()).is_empty());
    }

    #[test]
    fn test_numeric_token_ids_sort_numerically() {
        let records = vec![trade("10", 0, 1.0, 1.0), trade("9", 0, 1.0, 1.0), trade("x", 0, 1.0, 1.0)];
        let rows = derive_metrics(&records, None, &signed());
        let ids: Vec<&str> = rows.iter().map(|r| r.record.token_id.as_deref().unwrap()).collect();
        assert_eq!(ids, vec!["9", "10", "x"]);
    }

    #[test]
    fn test_sort_rows_descending() {
        let mut records = interleaved();
        records.push(TradeRecord::new(Some("A"), None, Some(1.0), Some(1.0), None));
        let mut rows = derive_metrics(&records, None, &signed());

        sort_rows(&mut rows, SortOrder::Descending);
        let keys: Vec<(&str, Option<NaiveDateTime>)> = rows.iter()
            .map(|r| (r.record.token_id.as_deref().unwrap(), r.record.timestamp))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("B", Some(at(3))),
                ("B", Some(at(1))),
                ("A", Some(at(5))),
                ("A", Some(at(2))),
                ("A", Some(at(0))),
                ("A", None),
            ]
        );

        sort_rows(&mut rows, SortOrder::Ascending);
        assert_eq!(rows[0].record.timestamp, Some(at(0)));
        assert_eq!(rows[5].record.token_id.as_deref(), Some("B"));
    }
}
