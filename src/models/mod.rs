pub mod price;
pub mod trade;

pub use price::EthPricePoint;
pub use trade::{DerivedFields, MetricRow, TradeRecord, TradeSide};
