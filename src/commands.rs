use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use binmark_sdk::{
    CancelToken, ChainClient, CreationEvent, MarketOrchestrator, PsbtSigner, SignerAccount,
};
use binmark_store::{CleanupReport, KeyValueStorage, MarketRecord, MarketSort, MarketStore};
use chrono::{DateTime, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::AppError;

pub const MAX_TITLE_CHARS: usize = 140;
pub const MAX_DESCRIPTION_CHARS: usize = 280;
pub const MIN_LIQUIDITY: f64 = 100.0;
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
const MAX_HORIZON_MONTHS: u32 = 12 * 5;

/// A market as entered by the user, before any chain work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub liquidity: String,
    /// `YYYY-MM-DD`
    pub end_date: String,
    /// `HH:MM`, UTC
    pub end_time: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl MarketDraft {
    pub fn ends_at(&self) -> Result<DateTime<Utc>, AppError> {
        let date = NaiveDate::parse_from_str(self.end_date.trim(), "%Y-%m-%d")
            .map_err(|_| AppError::validation("end date must be YYYY-MM-DD"))?;
        let time = NaiveTime::parse_from_str(self.end_time.trim(), "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(self.end_time.trim(), "%H:%M:%S"))
            .map_err(|_| AppError::validation("end time must be HH:MM"))?;
        Ok(date.and_time(time).and_utc())
    }
}

fn image_bytes(image_url: &str) -> Result<usize, AppError> {
    match image_url.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => BASE64
            .decode(data.trim())
            .map(|bytes| bytes.len())
            .map_err(|_| AppError::validation("image data is not valid base64")),
        // Remote URLs are not fetched.
        _ => Ok(0),
    }
}

/// Check a draft against the creation form rules and return it trimmed,
/// with empty and duplicate tags removed.
pub fn validate_draft(draft: &MarketDraft, now: DateTime<Utc>) -> Result<MarketDraft, AppError> {
    let title = draft.title.trim();
    if title.is_empty() || title.chars().count() > MAX_TITLE_CHARS {
        return Err(AppError::validation(format!(
            "title must be 1-{MAX_TITLE_CHARS} characters"
        )));
    }
    let description = draft.description.trim();
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(AppError::validation(format!(
            "description must be at most {MAX_DESCRIPTION_CHARS} characters"
        )));
    }

    let liquidity = draft.liquidity.trim();
    match liquidity.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= MIN_LIQUIDITY => {}
        Ok(_) => {
            return Err(AppError::validation(format!(
                "liquidity must be at least {MIN_LIQUIDITY}"
            )))
        }
        Err(_) => return Err(AppError::validation("liquidity must be a number")),
    }

    let ends_at = draft.ends_at()?;
    if ends_at <= now {
        return Err(AppError::validation("end date must be in the future"));
    }
    let horizon = now
        .checked_add_months(Months::new(MAX_HORIZON_MONTHS))
        .ok_or_else(|| AppError::validation("end date out of range"))?;
    if ends_at > horizon {
        return Err(AppError::validation(
            "end date must be within 5 years from now",
        ));
    }

    let image_url = match draft.image_url.as_deref().map(str::trim) {
        Some("") | None => None,
        Some(url) => {
            if image_bytes(url)? > MAX_IMAGE_BYTES {
                return Err(AppError::validation("image must be 5MB or smaller"));
            }
            Some(url.to_string())
        }
    };

    let mut seen = HashSet::new();
    let tags = draft
        .tags
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
        .map(str::to_string)
        .collect();

    Ok(MarketDraft {
        title: title.to_string(),
        description: description.to_string(),
        liquidity: liquidity.to_string(),
        end_date: draft.end_date.trim().to_string(),
        end_time: draft.end_time.trim().to_string(),
        tags,
        image_url,
    })
}

fn lock<S>(store: &Mutex<MarketStore<S>>) -> Result<MutexGuard<'_, MarketStore<S>>, AppError> {
    store.lock().map_err(|_| AppError::Lock)
}

fn release_reservation<S: KeyValueStorage>(store: &Mutex<MarketStore<S>>, title: &str) {
    match lock(store).and_then(|mut s| s.release_title(title).map_err(AppError::from)) {
        Ok(_) => {}
        Err(e) => log::warn!("failed to release reservation for {title:?}: {e}"),
    }
}

// ============================================================================
// Create
// ============================================================================

/// Validate, reserve the title, create both contracts, then persist the
/// market. A failed attempt leaves no record and releases its reservation.
pub async fn create_market<C, S, K>(
    orchestrator: &MarketOrchestrator<C, S>,
    store: &Mutex<MarketStore<K>>,
    account: &SignerAccount,
    draft: &MarketDraft,
    cancel: &CancelToken,
) -> Result<MarketRecord, AppError>
where
    C: ChainClient,
    S: PsbtSigner,
    K: KeyValueStorage,
{
    let draft = validate_draft(draft, Utc::now())?;

    {
        let mut store = lock(store)?;
        match store.reserve_title(&draft.title, Utc::now()) {
            Ok(outcome) if !outcome.is_durable() => {
                log::warn!("reservation for {:?} was not stored", draft.title)
            }
            Ok(_) => {}
            Err(e) => log::warn!("failed to reserve {:?}: {e}", draft.title),
        }
    }

    let creation = match orchestrator
        .create_market_with_cancel(account, &draft.title, cancel)
        .await
    {
        Ok(creation) => creation,
        Err(e) => {
            release_reservation(store, &draft.title);
            return Err(e.into());
        }
    };

    let record = MarketRecord {
        id: creation.market_number.to_string(),
        title: draft.title.clone(),
        description: draft.description,
        liquidity: draft.liquidity,
        end_date: draft.end_date,
        end_time: draft.end_time,
        tags: draft.tags,
        yes_txid: creation.yes_txid,
        no_txid: creation.no_txid,
        image_url: draft.image_url,
        created_at: Utc::now(),
    };

    let saved = lock(store).and_then(|mut s| {
        if s.find_market(&record.id)?.is_some() {
            log::warn!(
                "market number {} is already in use; both markets are kept",
                record.id
            );
        }
        Ok(s.append_market(record.clone())?)
    });
    release_reservation(store, &record.title);

    let outcome = match saved {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!(
                "market {} created on-chain but could not be stored (yes={} no={}): {e}",
                record.id,
                record.yes_txid,
                record.no_txid
            );
            return Err(AppError::Unsaved {
                id: record.id,
                yes_txid: record.yes_txid,
                no_txid: record.no_txid,
                source: Box::new(e),
            });
        }
    };
    if !outcome.is_durable() {
        log::error!(
            "market {} created on-chain but could not be stored (yes={} no={})",
            record.id,
            record.yes_txid,
            record.no_txid
        );
    }
    Ok(record)
}

/// Log progress events until the channel closes.
pub fn spawn_progress_logger(
    mut rx: broadcast::Receiver<CreationEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(CreationEvent::ContractCreated { side, txid, .. }) => {
                    log::info!("{side} contract created: {txid}")
                }
                Ok(CreationEvent::Waiting { delay, .. }) => {
                    log::info!("waiting {}s for the YES contract to propagate", delay.as_secs())
                }
                Ok(CreationEvent::PhaseChanged { phase, .. }) => log::debug!("phase: {phase}"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("progress logger skipped {n} events")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ============================================================================
// Queries
// ============================================================================

pub fn list_markets<K: KeyValueStorage>(
    store: &Mutex<MarketStore<K>>,
    query: &str,
    sort: MarketSort,
) -> Result<Vec<MarketRecord>, AppError> {
    Ok(lock(store)?.search_markets(query, sort)?)
}

pub fn market_detail<K: KeyValueStorage>(
    store: &Mutex<MarketStore<K>>,
    id: &str,
) -> Result<MarketRecord, AppError> {
    lock(store)?
        .find_market(id.trim())?
        .ok_or_else(|| AppError::NotFound(id.to_string()))
}

pub fn cleanup_storage<K: KeyValueStorage>(
    store: &Mutex<MarketStore<K>>,
) -> Result<CleanupReport, AppError> {
    Ok(lock(store)?.cleanup_storage())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn draft() -> MarketDraft {
        MarketDraft {
            title: "  Will it rain?  ".into(),
            description: "Weather".into(),
            liquidity: "100".into(),
            end_date: "2025-06-02".into(),
            end_time: "09:30".into(),
            tags: vec!["weather".into(), " Weather ".into(), "".into(), "rain".into()],
            image_url: Some("".into()),
        }
    }

    #[test]
    fn valid_draft_is_normalized() {
        let valid = validate_draft(&draft(), now()).unwrap();
        assert_eq!(valid.title, "Will it rain?");
        assert_eq!(valid.tags, vec!["weather".to_string(), "rain".to_string()]);
        assert_eq!(valid.image_url, None);
    }

    #[test]
    fn title_and_description_limits() {
        let mut d = draft();
        d.title = "   ".into();
        assert!(validate_draft(&d, now()).is_err());
        d.title = "x".repeat(141);
        assert!(validate_draft(&d, now()).is_err());
        d.title = "x".repeat(140);
        assert!(validate_draft(&d, now()).is_ok());
        d.description = "y".repeat(281);
        assert!(validate_draft(&d, now()).is_err());
    }

    #[test]
    fn liquidity_must_be_at_least_100() {
        let mut d = draft();
        d.liquidity = "99.99".into();
        assert!(validate_draft(&d, now()).is_err());
        d.liquidity = "abc".into();
        assert!(validate_draft(&d, now()).is_err());
        d.liquidity = "NaN".into();
        assert!(validate_draft(&d, now()).is_err());
    }

    #[test]
    fn end_must_be_future_and_within_five_years() {
        let mut d = draft();
        d.end_date = "2025-06-01".into();
        d.end_time = "12:00".into();
        assert!(validate_draft(&d, now()).is_err());
        d.end_date = "2030-06-01".into();
        assert!(validate_draft(&d, now()).is_ok());
        d.end_time = "12:01".into();
        assert!(validate_draft(&d, now()).is_err());
        d.end_date = "06/01/2026".into();
        assert!(validate_draft(&d, now()).is_err());
    }

    #[test]
    fn oversized_inline_image_is_rejected() {
        let mut d = draft();
        let big = BASE64.encode(vec![0u8; MAX_IMAGE_BYTES + 1]);
        d.image_url = Some(format!("data:image/png;base64,{big}"));
        assert!(validate_draft(&d, now()).is_err());

        let small = BASE64.encode([1u8, 2, 3]);
        d.image_url = Some(format!("data:image/png;base64,{small}"));
        assert!(validate_draft(&d, now()).is_ok());

        d.image_url = Some("https://example.com/cat.png".into());
        assert!(validate_draft(&d, now()).is_ok());
    }
}
