pub mod chain;
pub mod contract;
pub mod error;
pub mod events;
pub mod market_id;
pub mod network;
pub mod orchestrator;
pub mod psbt;
pub mod signer;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bitcoin;

pub use chain::{
    ChainClient, DUST_LIMIT_SATS, ElectrumChainClient, Output, TxRequest, Utxo,
    build_unsigned_psbt,
};
pub use contract::{
    CallType, ContractId, ContractSpec, ContractTemplate, ContractType, MintMechanism,
    OpReturnMessage, PROTOCOL_TAG, Side,
};
pub use error::{Error, Result};
pub use events::{CreationEvent, CreationPhase};
pub use market_id::{MarketNumber, generate_random_market_number};
pub use network::Network;
pub use orchestrator::{
    CancelHandle, CancelToken, MarketCreation, MarketOrchestrator, OrchestratorConfig,
    PROPAGATION_DELAY, cancel_pair,
};
pub use psbt::{PendingTransaction, TxStage, decode_psbt, encode_psbt, finalize_inputs};
pub use signer::{KeySigner, PsbtSigner, SignResponse, SignerAccount};
