//! Progress notifications emitted while a market is being created.

use std::fmt;
use std::time::Duration;

use crate::contract::Side;
use crate::market_id::MarketNumber;
use crate::orchestrator::MarketCreation;

/// Where a creation attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationPhase {
    Idle,
    Building(Side),
    Signing(Side),
    Broadcasting(Side),
    Confirmed(Side),
    Waiting,
    Complete,
    Failed,
}

impl CreationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, CreationPhase::Complete | CreationPhase::Failed)
    }
}

impl fmt::Display for CreationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreationPhase::Idle => f.write_str("idle"),
            CreationPhase::Building(side) => write!(f, "building {side}"),
            CreationPhase::Signing(side) => write!(f, "signing {side}"),
            CreationPhase::Broadcasting(side) => write!(f, "broadcasting {side}"),
            CreationPhase::Confirmed(side) => write!(f, "{side} confirmed"),
            CreationPhase::Waiting => f.write_str("waiting"),
            CreationPhase::Complete => f.write_str("complete"),
            CreationPhase::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationEvent {
    Started {
        market_number: MarketNumber,
        title: String,
    },
    PhaseChanged {
        market_number: MarketNumber,
        phase: CreationPhase,
    },
    /// A contract transaction was accepted by the network.
    ContractCreated {
        market_number: MarketNumber,
        side: Side,
        txid: String,
    },
    Waiting {
        market_number: MarketNumber,
        yes_txid: String,
        delay: Duration,
    },
    Completed(MarketCreation),
    /// `yes_txid` is set when the YES contract is already on-chain.
    Failed {
        market_number: MarketNumber,
        phase: CreationPhase,
        yes_txid: Option<String>,
        error: String,
    },
}

impl CreationEvent {
    pub fn market_number(&self) -> &MarketNumber {
        match self {
            CreationEvent::Started { market_number, .. }
            | CreationEvent::PhaseChanged { market_number, .. }
            | CreationEvent::ContractCreated { market_number, .. }
            | CreationEvent::Waiting { market_number, .. }
            | CreationEvent::Failed { market_number, .. } => market_number,
            CreationEvent::Completed(creation) => &creation.market_number,
        }
    }
}
