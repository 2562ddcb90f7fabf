use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("PSBT error: {0}")]
    Psbt(String),

    #[error("finalize error: {0}")]
    Finalize(String),

    #[error("electrum error: {0}")]
    Electrum(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("address error: {0}")]
    Address(String),

    #[error("insufficient funds: need {needed} sats, have {available} sats")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("task join error: {0}")]
    Task(String),
}

impl Error {
    /// `true` for the signer-declined condition, which callers usually
    /// present as a cancellation rather than a fault.
    pub fn is_signing_failure(&self) -> bool {
        matches!(self, Error::SigningFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
