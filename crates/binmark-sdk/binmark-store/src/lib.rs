mod error;
mod models;
mod store;
mod substrate;

pub use error::StoreError;
pub use models::{MarketRecord, PendingMarket};
pub use store::{
    CleanupReport, MARKETS_KEY, MarketSort, MarketStore, PENDING_KEY, StoreConfig, WriteOutcome,
};
pub use substrate::{FileStorage, KeyValueStorage, MemoryStorage};

pub type Result<T> = std::result::Result<T, StoreError>;
