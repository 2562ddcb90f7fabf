use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use binmark_sdk::{ElectrumChainClient, Network};
use binmark_store::{FileStorage, MarketStore, PendingMarket};
use serde::Serialize;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::wallet::KeyVault;

const STORAGE_FILE: &str = "storage.json";

pub type SharedStore = Arc<Mutex<MarketStore<FileStorage>>>;

// ============================================================================
// Snapshot (printed by the CLI)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub network: String,
    pub is_mainnet: bool,
    pub electrum_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSnapshot {
    pub network_status: NetworkStatus,
    pub has_signing_key: bool,
    pub market_count: usize,
    pub pending_markets: Vec<PendingMarket>,
}

// ============================================================================
// App state manager
// ============================================================================

/// Owns the data directory, the persisted config and the market store of
/// the active network.
pub struct AppStateManager {
    data_dir: PathBuf,
    config: AppConfig,
    store: SharedStore,
}

impl AppStateManager {
    pub fn open(data_dir: PathBuf) -> Result<Self, AppError> {
        let config = AppConfig::load(&data_dir)?;
        let store = Self::open_store(&data_dir, &config)?;
        Ok(Self {
            data_dir,
            config,
            store,
        })
    }

    pub fn is_first_launch(&self) -> bool {
        !AppConfig::exists(&self.data_dir)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    /// Persist the network choice and switch to that network's store.
    pub fn set_network(&mut self, network: Network) -> Result<AppSnapshot, AppError> {
        self.config.network = network;
        self.config.save(&self.data_dir)?;
        self.store = Self::open_store(&self.data_dir, &self.config)?;
        log::info!("network set to {network}");
        self.snapshot()
    }

    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    pub fn vault(&self) -> KeyVault {
        KeyVault::new(&self.data_dir, self.config.network)
    }

    pub fn chain_client(&self) -> ElectrumChainClient {
        ElectrumChainClient::new(
            self.config.electrum_url(),
            self.config.network,
            self.config.fee_rate_sat_vb,
        )
    }

    pub fn network_status(&self) -> NetworkStatus {
        NetworkStatus {
            network: self.config.network.as_str().to_string(),
            is_mainnet: self.config.network.is_mainnet(),
            electrum_url: self.config.electrum_url().to_string(),
        }
    }

    pub fn snapshot(&self) -> Result<AppSnapshot, AppError> {
        let store = self.store.lock().map_err(|_| AppError::Lock)?;
        Ok(AppSnapshot {
            network_status: self.network_status(),
            has_signing_key: self.vault().exists(),
            market_count: store.load_markets()?.len(),
            pending_markets: store.pending_titles()?,
        })
    }

    fn open_store(data_dir: &Path, config: &AppConfig) -> Result<SharedStore, AppError> {
        let path = data_dir.join(config.network.as_str()).join(STORAGE_FILE);
        let storage = FileStorage::open(path, config.storage_quota_bytes)?;
        Ok(Arc::new(Mutex::new(MarketStore::new(
            storage,
            config.store_config(),
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_launch_until_network_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = AppStateManager::open(dir.path().to_path_buf()).unwrap();
        assert!(state.is_first_launch());

        let snapshot = state.set_network(Network::Regtest).unwrap();
        assert!(!state.is_first_launch());
        assert_eq!(snapshot.network_status.network, "regtest");
        assert_eq!(snapshot.market_count, 0);
        assert!(!snapshot.has_signing_key);

        let reopened = AppStateManager::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.network(), Network::Regtest);
    }

    #[test]
    fn stores_are_per_network() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = AppStateManager::open(dir.path().to_path_buf()).unwrap();
        state.set_network(Network::Regtest).unwrap();
        state
            .store()
            .lock()
            .unwrap()
            .reserve_title("regtest only", chrono::Utc::now())
            .unwrap();

        let snapshot = state.set_network(Network::Signet).unwrap();
        assert!(snapshot.pending_markets.is_empty());
        let snapshot = state.set_network(Network::Regtest).unwrap();
        assert_eq!(snapshot.pending_markets.len(), 1);
    }
}
