pub mod collector;
pub mod creators;
pub mod metrics;
pub mod pipeline;
pub mod price_series;
pub mod storage;

pub use collector::{run_token_job, run_trade_job, ApeCollector, PartitionReport};
pub use creators::CreatorIndex;
pub use metrics::{derive_metrics, sort_rows, LiquidityConvention, MetricsOptions, SortOrder};
pub use pipeline::{run_metrics_job, run_price_job, MetricsSummary};
pub use price_series::{ConstantPrice, EthPriceLookup, EthPriceSeries};
pub use storage::{InputFormat, TradeTable};
