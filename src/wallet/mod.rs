mod vault;

pub use vault::{KeyVault, VaultError};
