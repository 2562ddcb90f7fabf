use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::Result;
use crate::error::StoreError;
use crate::models::{MarketRecord, PendingMarket};
use crate::substrate::KeyValueStorage;

/// Key of the market collection.
pub const MARKETS_KEY: &str = "markets";

/// Key of the in-flight title reservations.
pub const PENDING_KEY: &str = "pendingMarkets";

pub const DEFAULT_MAX_MARKETS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub max_markets: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_markets: DEFAULT_MAX_MARKETS,
        }
    }
}

/// What [`MarketStore::safe_set`] managed to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The stored markets were dropped to make room, then the write went
    /// through.
    WrittenAfterEviction,
    /// Only the newest market could be stored.
    NewestOnly,
    /// Nothing was written. The failure has been logged.
    Dropped,
}

impl WriteOutcome {
    pub fn is_durable(self) -> bool {
        !matches!(self, WriteOutcome::Dropped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub retained: usize,
    pub discarded: usize,
    /// Cleanup failed and the whole namespace was cleared.
    pub wiped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MarketSort {
    /// Storage order.
    #[default]
    None,
    /// Newest `createdAt` first.
    Recent,
    /// Highest liquidity first.
    Liquidity,
}

impl std::str::FromStr for MarketSort {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" | "default" => Ok(MarketSort::None),
            "recent" => Ok(MarketSort::Recent),
            "liquidity" => Ok(MarketSort::Liquidity),
            other => Err(format!("unknown sort: {other}")),
        }
    }
}

/// Capacity-bounded market persistence over a [`KeyValueStorage`].
///
/// Writes are best-effort: a full substrate degrades to fewer stored
/// markets rather than an error. Read-modify-write of the collection goes
/// through [`update_markets`](Self::update_markets); it is not atomic
/// against other writers of the same substrate.
pub struct MarketStore<S> {
    storage: S,
    config: StoreConfig,
}

impl<S: KeyValueStorage> MarketStore<S> {
    pub fn new(storage: S, config: StoreConfig) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    // ── Bounded writes ──────────────────────────────────────────────

    /// Serialize and store `value` under `key`, never failing.
    ///
    /// The markets collection is coerced to an array and cut to the last
    /// `max_markets` entries by position. When the substrate is over quota
    /// the stored markets are evicted and the write retried once; if that
    /// also fails, only the newest market is kept.
    pub fn safe_set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> WriteOutcome {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                log::error!("failed to serialize {key}: {e}");
                return WriteOutcome::Dropped;
            }
        };
        let value = if key == MARKETS_KEY {
            self.bound_markets(value)
        } else {
            value
        };
        let payload = value.to_string();

        match self.storage.set(key, &payload) {
            Ok(()) => return WriteOutcome::Written,
            Err(e) if e.is_quota_exceeded() => {
                log::warn!("{e}; evicting stored markets and retrying");
            }
            Err(e) => {
                log::error!("failed to save {key}: {e}");
                return WriteOutcome::Dropped;
            }
        }

        if let Err(e) = self.storage.remove(MARKETS_KEY) {
            log::error!("failed to evict {MARKETS_KEY}: {e}");
        }
        match self.storage.set(key, &payload) {
            Ok(()) => return WriteOutcome::WrittenAfterEviction,
            Err(e) => log::error!("retry saving {key} failed: {e}"),
        }

        if key == MARKETS_KEY {
            if let Some(newest) = value.as_array().and_then(|markets| markets.last()) {
                let minimal = Value::Array(vec![newest.clone()]).to_string();
                match self.storage.set(key, &minimal) {
                    Ok(()) => {
                        log::warn!("storage full; kept only the newest market");
                        return WriteOutcome::NewestOnly;
                    }
                    Err(e) => log::error!("failed to save even the newest market: {e}"),
                }
            }
        }
        WriteOutcome::Dropped
    }

    fn bound_markets(&self, value: Value) -> Value {
        let mut markets = match value {
            Value::Array(markets) => markets,
            other => {
                log::warn!("{MARKETS_KEY} value is not an array ({other}); storing an empty list");
                Vec::new()
            }
        };
        let max = self.config.max_markets;
        if markets.len() > max {
            let excess = markets.len() - max;
            log::warn!("dropping {excess} oldest market(s) to stay within {max}");
            markets.drain(..excess);
        }
        Value::Array(markets)
    }

    /// Keep only the newest `max_markets` by `createdAt`, clearing
    /// everything else in the namespace. Any failure wipes the namespace.
    pub fn cleanup_storage(&mut self) -> CleanupReport {
        match self.try_cleanup() {
            Ok(report) => {
                log::info!(
                    "storage cleanup kept {} market(s), discarded {}",
                    report.retained,
                    report.discarded
                );
                report
            }
            Err(e) => {
                log::error!("storage cleanup failed, clearing storage: {e}");
                if let Err(e) = self.storage.clear() {
                    log::error!("failed to clear storage: {e}");
                }
                CleanupReport {
                    retained: 0,
                    discarded: 0,
                    wiped: true,
                }
            }
        }
    }

    fn try_cleanup(&mut self) -> Result<CleanupReport> {
        let mut markets = self.load_markets()?;
        let total = markets.len();
        markets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        markets.truncate(self.config.max_markets);

        self.storage.clear()?;
        self.storage
            .set(MARKETS_KEY, &serde_json::to_string(&markets)?)?;
        Ok(CleanupReport {
            retained: markets.len(),
            discarded: total - markets.len(),
            wiped: false,
        })
    }

    // ── Markets ─────────────────────────────────────────────────────

    pub fn load_markets(&self) -> Result<Vec<MarketRecord>> {
        match self.storage.get(MARKETS_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn find_market(&self, id: &str) -> Result<Option<MarketRecord>> {
        Ok(self.load_markets()?.into_iter().find(|m| m.id == id))
    }

    /// Load the collection, apply `f`, and write it back through
    /// [`safe_set`](Self::safe_set).
    pub fn update_markets<F>(&mut self, f: F) -> Result<WriteOutcome>
    where
        F: FnOnce(&mut Vec<MarketRecord>),
    {
        let mut markets = self.load_markets()?;
        f(&mut markets);
        Ok(self.safe_set(MARKETS_KEY, &markets))
    }

    pub fn append_market(&mut self, record: MarketRecord) -> Result<WriteOutcome> {
        record.validate()?;
        let id = record.id.clone();
        let outcome = self.update_markets(|markets| markets.push(record))?;
        log::info!("stored market {id} ({outcome:?})");
        Ok(outcome)
    }

    /// Markets whose title contains `query` (case-insensitive), ordered by
    /// `sort`.
    pub fn search_markets(&self, query: &str, sort: MarketSort) -> Result<Vec<MarketRecord>> {
        let needle = query.trim().to_lowercase();
        let mut markets: Vec<MarketRecord> = self
            .load_markets()?
            .into_iter()
            .filter(|m| needle.is_empty() || m.title.to_lowercase().contains(&needle))
            .collect();
        match sort {
            MarketSort::None => {}
            MarketSort::Recent => markets.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            MarketSort::Liquidity => {
                markets.sort_by(|a, b| b.liquidity_value().total_cmp(&a.liquidity_value()))
            }
        }
        Ok(markets)
    }

    // ── Title reservations ──────────────────────────────────────────

    pub fn pending_titles(&self) -> Result<Vec<PendingMarket>> {
        match self.storage.get(PENDING_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Record `title` as being created so other views can show it.
    pub fn reserve_title(&mut self, title: &str, now: DateTime<Utc>) -> Result<WriteOutcome> {
        let title = title.trim();
        if title.is_empty() {
            return Err(StoreError::InvalidData("cannot reserve an empty title".into()));
        }
        let mut pending = self.pending_titles()?;
        pending.push(PendingMarket {
            title: title.to_string(),
            created_at: now,
        });
        Ok(self.safe_set(PENDING_KEY, &pending))
    }

    /// Drop every reservation matching `title`. Returns how many were removed.
    pub fn release_title(&mut self, title: &str) -> Result<usize> {
        let title = title.trim();
        let mut pending = self.pending_titles()?;
        let before = pending.len();
        pending.retain(|p| p.title != title);
        let removed = before - pending.len();
        if removed == 0 {
            return Ok(0);
        }
        if pending.is_empty() {
            self.storage.remove(PENDING_KEY)?;
        } else {
            self.storage
                .set(PENDING_KEY, &serde_json::to_string(&pending)?)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MemoryStorage;

    fn store() -> MarketStore<MemoryStorage> {
        MarketStore::new(MemoryStorage::new(), StoreConfig { max_markets: 3 })
    }

    #[test]
    fn non_array_markets_become_empty() {
        let mut store = store();
        assert_eq!(
            store.safe_set(MARKETS_KEY, &serde_json::json!({"oops": true})),
            WriteOutcome::Written
        );
        assert_eq!(store.storage().get(MARKETS_KEY).unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn other_keys_are_written_verbatim() {
        let mut store = store();
        let value = vec![1, 2, 3, 4, 5];
        assert_eq!(store.safe_set("numbers", &value), WriteOutcome::Written);
        assert_eq!(
            store.storage().get("numbers").unwrap().as_deref(),
            Some("[1,2,3,4,5]")
        );
    }

    #[test]
    fn truncation_is_positional() {
        let mut store = store();
        store.safe_set(MARKETS_KEY, &serde_json::json!(["a", "b", "c", "d", "e"]));
        assert_eq!(
            store.storage().get(MARKETS_KEY).unwrap().as_deref(),
            Some(r#"["c","d","e"]"#)
        );
    }

    #[test]
    fn sort_names_parse() {
        assert_eq!("recent".parse::<MarketSort>(), Ok(MarketSort::Recent));
        assert_eq!("liquidity".parse::<MarketSort>(), Ok(MarketSort::Liquidity));
        assert_eq!("none".parse::<MarketSort>(), Ok(MarketSort::None));
        assert!("volume".parse::<MarketSort>().is_err());
    }
}
