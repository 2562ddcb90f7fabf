use std::fs;
use std::path::Path;
use std::time::Duration;

use binmark_sdk::{ContractTemplate, Network, OrchestratorConfig};
use binmark_store::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const CONFIG_FILE: &str = "config.json";

/// User settings persisted in the data directory. Missing fields take
/// their defaults, so older files keep loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub network: Network,
    pub electrum_url: Option<String>,
    pub fee_rate_sat_vb: u64,
    pub propagation_delay_secs: u64,
    /// `null` waits for the signer indefinitely.
    pub sign_timeout_secs: Option<u64>,
    pub network_timeout_secs: Option<u64>,
    pub max_markets: usize,
    pub storage_quota_bytes: Option<usize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let orchestrator = OrchestratorConfig::default();
        Self {
            network: orchestrator.network,
            electrum_url: None,
            fee_rate_sat_vb: 2,
            propagation_delay_secs: orchestrator.propagation_delay.as_secs(),
            sign_timeout_secs: orchestrator.sign_timeout.map(|d| d.as_secs()),
            network_timeout_secs: orchestrator.network_timeout.map(|d| d.as_secs()),
            max_markets: StoreConfig::default().max_markets,
            storage_quota_bytes: None,
        }
    }
}

impl AppConfig {
    pub fn exists(dir: &Path) -> bool {
        dir.join(CONFIG_FILE).exists()
    }

    pub fn load(dir: &Path) -> Result<Self, AppError> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, dir: &Path) -> Result<(), AppError> {
        fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(CONFIG_FILE), json)?;
        Ok(())
    }

    pub fn electrum_url(&self) -> &str {
        self.electrum_url
            .as_deref()
            .unwrap_or_else(|| self.network.default_electrum_url())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            network: self.network,
            propagation_delay: Duration::from_secs(self.propagation_delay_secs),
            sign_timeout: self.sign_timeout_secs.map(Duration::from_secs),
            network_timeout: self.network_timeout_secs.map(Duration::from_secs),
            contract: ContractTemplate::default(),
            ..OrchestratorConfig::default()
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_markets: self.max_markets,
        }
    }
}
