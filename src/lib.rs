pub mod commands;
pub mod config;
pub mod error;
pub mod state;
pub mod wallet;

pub use binmark_sdk::Network;
pub use config::AppConfig;
pub use error::AppError;
pub use state::{AppSnapshot, AppStateManager};

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,electrum_client=warn,rustls=warn";

/// Install the TLS crypto provider and the log subscriber. Call once at
/// startup, before any network access.
pub fn init() {
    // electrum-client pulls in rustls 0.23 which requires an explicit provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    // `try_init` also routes `log` records from the SDK and store.
    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("logging already initialized: {e}");
    }
}
