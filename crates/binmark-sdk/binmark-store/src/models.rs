use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::StoreError;

/// A fully created market. Both contract txids are always present: a
/// record is written only after the NO contract is broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub liquidity: String,
    pub end_date: String,
    pub end_time: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub yes_txid: String,
    pub no_txid: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MarketRecord {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("id", &self.id),
            ("title", &self.title),
            ("yesTxid", &self.yes_txid),
            ("noTxid", &self.no_txid),
        ] {
            if value.trim().is_empty() {
                return Err(StoreError::InvalidData(format!(
                    "market record {:?} has an empty {field}",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Liquidity as a number, ignoring currency symbols and separators.
    /// Unparseable values count as zero.
    pub fn liquidity_value(&self) -> f64 {
        let digits: String = self
            .liquidity
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        digits.parse().unwrap_or(0.0)
    }
}

/// Title reserved while its market is being created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMarket {
    pub title: String,
    pub created_at: DateTime<Utc>,
}
