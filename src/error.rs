use thiserror::Error;

use crate::wallet::VaultError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Sdk(#[from] binmark_sdk::Error),

    #[error(transparent)]
    Store(#[from] binmark_store::StoreError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("market {id} created on-chain (yes={yes_txid} no={no_txid}) but not stored: {source}")]
    Unsaved {
        id: String,
        yes_txid: String,
        no_txid: String,
        source: Box<AppError>,
    },

    #[error("market {0} not found")]
    NotFound(String),

    #[error("no signing key imported for {0}")]
    NoKey(String),

    #[error("state lock failed")]
    Lock,
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }
}
