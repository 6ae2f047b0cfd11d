use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use crate::error::MetricsError;

/// Token id → deployer address, from a token listing (`id`, `creator` columns).
#[derive(Debug, Clone, Default)]
pub struct CreatorIndex {
    by_token: HashMap<String, String>,
}

impl CreatorIndex {
    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self, MetricsError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Addresses are compared lowercase. Rows without an id or creator are ignored.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, MetricsError> {
        let mut csv_rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let headers = csv_rdr.headers()?.clone();
        let position = |name: &str| {
            headers.iter()
                .position(|h| h == name)
                .ok_or_else(|| MetricsError::MissingColumn(name.to_string()))
        };
        let id_col = position("id")?;
        let creator_col = position("creator")?;

        let mut by_token = HashMap::new();
        for result in csv_rdr.records() {
            let record = result?;
            let id = record.get(id_col).unwrap_or_default();
            let creator = record.get(creator_col).unwrap_or_default();
            if id.is_empty() || creator.is_empty() {
                continue;
            }
            by_token.insert(id.to_string(), creator.to_lowercase());
        }

        Ok(Self { by_token })
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    pub fn is_creator(&self, token_id: &str, receiver: &str) -> bool {
        let receiver = receiver.trim();
        !receiver.is_empty()
            && self.by_token
                .get(token_id.trim())
                .is_some_and(|creator| creator.eq_ignore_ascii_case(receiver))
    }
}
