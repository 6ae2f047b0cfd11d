use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use serde::Deserialize;
use serde_json::Value;
use crate::config::ColumnNames;
use crate::error::MetricsError;
use crate::models::{MetricRow, TradeRecord};
use super::creators::CreatorIndex;

/// Columns written by the metrics job, in output order.
pub const METRIC_COLUMNS: [&str; 6] = [
    "last_eth_price",
    "buy_sell",
    "circulative_supply",
    "liquidity_eth",
    "liquidity_usd",
    "market_cap_usd",
];

/// Column written by the creator flag, 1 when the trade's receiver deployed the token.
pub const CREATOR_COLUMN: &str = "creator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    Csv,
    /// A JSON array of trade objects, as the trades endpoint returns it.
    Json,
}

impl InputFormat {
    /// `.json` files are JSON, anything else CSV.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => InputFormat::Json,
            _ => InputFormat::Csv,
        }
    }
}

/// JSON value as a table cell: strings unquoted, null empty.
pub(crate) fn json_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// A trade export kept as text so every column survives the round trip.
#[derive(Debug, Clone, Default)]
pub struct TradeTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TradeTable {
    pub fn read(path: impl AsRef<Path>) -> Result<Self, MetricsError> {
        let path = path.as_ref();
        Self::read_as(path, InputFormat::from_path(path))
    }

    pub fn read_as(path: impl AsRef<Path>, format: InputFormat) -> Result<Self, MetricsError> {
        let file = BufReader::with_capacity(64 * 1024, File::open(path)?);
        match format {
            InputFormat::Csv => Self::from_reader(file),
            InputFormat::Json => Self::from_json_reader(file),
        }
    }

    /// Header names are trimmed; cells are kept verbatim. Short rows are padded.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, MetricsError> {
        let mut csv_rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(reader);

        let headers: Vec<String> = csv_rdr.headers()?.iter().map(str::to_string).collect();
        let width = headers.len();

        let mut rows = Vec::new();
        for result in csv_rdr.records() {
            let record = result?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            row.resize(width.max(row.len()), String::new());
            rows.push(row);
        }

        Ok(Self { headers, rows })
    }

    /// Reads a JSON array of objects. Columns are every key in first-seen order, keys
    /// trimmed; a key an object lacks is an empty cell. Non-object entries are skipped.
    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self, MetricsError> {
        let items: Vec<Value> = serde_json::from_reader(reader)?;

        let mut headers: Vec<String> = Vec::new();
        let mut objects = Vec::with_capacity(items.len());
        let mut skipped = 0usize;
        for item in items {
            let Value::Object(map) = item else {
                skipped += 1;
                continue;
            };
            let trimmed: serde_json::Map<String, Value> = map.into_iter()
                .map(|(key, value)| (key.trim().to_string(), value))
                .collect();
            for key in trimmed.keys() {
                if !headers.contains(key) {
                    headers.push(key.clone());
                }
            }
            objects.push(trimmed);
        }
        if skipped > 0 {
            tracing::warn!("Skipped {} JSON entries that are not objects", skipped);
        }

        let rows = objects.iter()
            .map(|object| headers.iter().map(|key| json_cell(object.get(key))).collect())
            .collect();

        Ok(Self { headers, rows })
    }

    /// Sets the `creator` column: 1 when the receiver column matches the token's creator,
    /// else 0. Overwrites the column when the table already has one.
    pub fn add_creator_flag(
        &mut self,
        creators: &CreatorIndex,
        columns: &ColumnNames,
    ) -> Result<usize, MetricsError> {
        let to_col = self.required(&columns.to)?;
        let token_col = self.required(&columns.token_id)?;
        let existing = self.column(CREATOR_COLUMN);
        let slot = existing.unwrap_or(self.headers.len());
        if existing.is_none() {
            self.headers.push(CREATOR_COLUMN.to_string());
        }

        let mut flagged = 0;
        for row in &mut self.rows {
            let is_creator = creators.is_creator(&row[token_col], &row[to_col]);
            if is_creator {
                flagged += 1;
            }
            let flag = if is_creator { "1" } else { "0" }.to_string();
            match existing {
                Some(_) => row[slot] = flag,
                // Rows are at least as wide as the old header
                None => row.insert(slot, flag),
            }
        }

        tracing::info!("✓ {} trades made by their token's creator", flagged);
        Ok(flagged)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        self.rows.get(row)?.get(column).map(String::as_str)
    }

    fn required(&self, name: &str) -> Result<usize, MetricsError> {
        self.column(name)
            .ok_or_else(|| MetricsError::MissingColumn(name.to_string()))
    }

    /// Typed view of every row, in table order.
    ///
    /// The token and price columns are optional: without a token column the whole table
    /// is one group, without a price column prices must come from a lookup.
    pub fn records(&self, columns: &ColumnNames) -> Result<Vec<TradeRecord>, MetricsError> {
        let ts_col = self.required(&columns.timestamp)?;
        let change_col = self.required(&columns.token_change)?;
        let volume_col = self.required(&columns.native_volume)?;
        let token_col = self.column(&columns.token_id);
        let price_col = self.column(&columns.eth_usd_price);

        if token_col.is_none() {
            tracing::warn!("No '{}' column: treating all trades as one token", columns.token_id);
        }
        if price_col.is_none() {
            tracing::debug!("No '{}' column in trade table", columns.eth_usd_price);
        }

        let records = self.rows.iter()
            .map(|row| {
                TradeRecord::from_cells(
                    token_col.map(|c| row[c].as_str()),
                    &row[ts_col],
                    &row[change_col],
                    &row[volume_col],
                    price_col.map(|c| row[c].as_str()),
                )
            })
            .collect();

        Ok(records)
    }

    pub fn write_with_metrics(
        &self,
        rows: &[MetricRow],
        path: impl AsRef<Path>,
    ) -> Result<(), MetricsError> {
        let file = File::create(path)?;
        self.write_with_metrics_to(rows, BufWriter::new(file))
    }

    /// Writes `rows` in the given order with the metric columns filled in.
    ///
    /// A metric column already in the table is overwritten in place; the others are
    /// appended. Missing values become empty cells.
    pub fn write_with_metrics_to<W: Write>(
        &self,
        rows: &[MetricRow],
        writer: W,
    ) -> Result<(), MetricsError> {
        let mut headers = self.headers.clone();
        let slots: Vec<usize> = METRIC_COLUMNS.iter()
            .map(|name| match self.column(name) {
                Some(existing) => existing,
                None => {
                    headers.push(name.to_string());
                    headers.len() - 1
                }
            })
            .collect();

        let mut csv_wtr = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(writer);
        csv_wtr.write_record(&headers)?;

        for metric_row in rows {
            let Some(source) = self.rows.get(metric_row.index) else {
                tracing::warn!("Metric row {} has no source row, skipped", metric_row.index);
                continue;
            };

            // Cells past the header stay after the metric columns
            let known = source.len().min(self.headers.len());
            let mut out: Vec<String> = source[..known].to_vec();
            out.resize(headers.len(), String::new());
            for (slot, value) in slots.iter().zip(metric_cells(metric_row)) {
                out[*slot] = value;
            }
            out.extend_from_slice(&source[known..]);
            csv_wtr.write_record(&out)?;
        }

        csv_wtr.flush()?;
        Ok(())
    }
}

fn metric_cells(row: &MetricRow) -> [String; 6] {
    let derived = &row.derived;
    [
        format_opt(derived.last_eth_price),
        derived.buy_sell.map(|side| side.as_flag().to_string()).unwrap_or_default(),
        derived.circulative_supply.to_string(),
        derived.liquidity_eth.to_string(),
        format_opt(derived.liquidity_usd),
        format_opt(derived.market_cap_usd),
    ]
}

fn format_opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
