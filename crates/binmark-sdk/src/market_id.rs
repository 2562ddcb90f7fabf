use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MARKET_NUMBER_MIN: u32 = 100_000;
pub const MARKET_NUMBER_MAX: u32 = 999_999;

/// Six-digit identifier shared by a market's YES and NO contracts.
///
/// Drawn fresh for every creation attempt. There is no uniqueness check
/// against existing markets: two attempts can draw the same number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MarketNumber(u32);

impl MarketNumber {
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen_range(MARKET_NUMBER_MIN..=MARKET_NUMBER_MAX))
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidInput(format!(
                "market number must be six decimal digits, got {s:?}"
            )));
        }
        let value: u32 = s
            .parse()
            .map_err(|e| Error::InvalidInput(format!("bad market number {s:?}: {e}")))?;
        Self::from_u32(value)
    }

    pub fn from_u32(value: u32) -> Result<Self> {
        if !(MARKET_NUMBER_MIN..=MARKET_NUMBER_MAX).contains(&value) {
            return Err(Error::InvalidInput(format!(
                "market number {value} outside [{MARKET_NUMBER_MIN}, {MARKET_NUMBER_MAX}]"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for MarketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for MarketNumber {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<MarketNumber> for String {
    fn from(n: MarketNumber) -> Self {
        n.to_string()
    }
}

/// String form of a freshly drawn [`MarketNumber`].
pub fn generate_random_market_number() -> String {
    MarketNumber::generate().to_string()
}
