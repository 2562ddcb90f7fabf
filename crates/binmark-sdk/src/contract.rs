//! Fungible-asset contract descriptors and the `OP_RETURN` messages that
//! carry them on-chain.

use std::fmt;

use bitcoin::ScriptBuf;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::{Builder, PushBytesBuf};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::market_id::MarketNumber;

/// Leading push of every message output so indexers can recognise it.
pub const PROTOCOL_TAG: &[u8] = b"GLITTR";

/// Outcome side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn ticker_prefix(self) -> char {
        match self {
            Side::Yes => 'Y',
            Side::No => 'N',
        }
    }

    pub fn ticker(self, market: &MarketNumber) -> String {
        format!("{}{}", self.ticker_prefix(), market)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Yes => f.write_str("YES"),
            Side::No => f.write_str("NO"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MintMechanism {
    /// Anyone may mint `amount_per_mint` units per call until the cap.
    FreeMint {
        #[serde(with = "amount_string")]
        amount_per_mint: u64,
    },
}

/// Immutable descriptor of a contract instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpec {
    ticker: String,
    divisibility: u8,
    live_time: u32,
    #[serde(with = "amount_string")]
    supply_cap: u64,
    mint_mechanism: MintMechanism,
}

impl ContractSpec {
    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn divisibility(&self) -> u8 {
        self.divisibility
    }

    pub fn live_time(&self) -> u32 {
        self.live_time
    }

    pub fn supply_cap(&self) -> u64 {
        self.supply_cap
    }

    pub fn mint_mechanism(&self) -> &MintMechanism {
        &self.mint_mechanism
    }
}

/// Parameters shared by both contracts of every market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractTemplate {
    pub supply_cap: u64,
    pub amount_per_mint: u64,
}

impl Default for ContractTemplate {
    fn default() -> Self {
        Self {
            supply_cap: 100_000,
            amount_per_mint: 10,
        }
    }
}

impl ContractTemplate {
    /// Derive the contract for one side of `market`. YES and NO differ only
    /// in their ticker.
    pub fn spec_for(&self, side: Side, market: &MarketNumber) -> ContractSpec {
        ContractSpec {
            ticker: side.ticker(market),
            divisibility: 0,
            live_time: 0,
            supply_cap: self.supply_cap,
            mint_mechanism: MintMechanism::FreeMint {
                amount_per_mint: self.amount_per_mint,
            },
        }
    }
}

/// On-chain location of an instantiated contract (`block:tx`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(u64, u32)", into = "(u64, u32)")]
pub struct ContractId {
    pub block: u64,
    pub tx: u32,
}

impl From<(u64, u32)> for ContractId {
    fn from((block, tx): (u64, u32)) -> Self {
        Self { block, tx }
    }
}

impl From<ContractId> for (u64, u32) {
    fn from(id: ContractId) -> Self {
        (id.block, id.tx)
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.tx)
    }
}

impl std::str::FromStr for ContractId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (block, tx) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("contract id must be block:tx, got {s:?}")))?;
        let block = block
            .parse()
            .map_err(|e| Error::InvalidInput(format!("bad contract block {block:?}: {e}")))?;
        let tx = tx
            .parse()
            .map_err(|e| Error::InvalidInput(format!("bad contract tx index {tx:?}: {e}")))?;
        Ok(Self { block, tx })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    Moa(ContractSpec),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// Mint into the output at index `pointer`.
    Mint { pointer: u32 },
}

/// Protocol message embedded in a transaction's `OP_RETURN` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpReturnMessage {
    ContractCreation { contract_type: ContractType },
    ContractCall { contract: ContractId, call_type: CallType },
}

impl OpReturnMessage {
    pub fn instantiate(spec: ContractSpec) -> Self {
        OpReturnMessage::ContractCreation {
            contract_type: ContractType::Moa(spec),
        }
    }

    pub fn mint(contract: ContractId, pointer: u32) -> Self {
        OpReturnMessage::ContractCall {
            contract,
            call_type: CallType::Mint { pointer },
        }
    }

    /// Ticker of the contract this message instantiates, if any.
    pub fn ticker(&self) -> Option<&str> {
        match self {
            OpReturnMessage::ContractCreation {
                contract_type: ContractType::Moa(spec),
            } => Some(spec.ticker()),
            OpReturnMessage::ContractCall { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidInput(format!("encode message: {e}")))
    }

    /// `OP_RETURN <tag> <json>`.
    pub fn to_script(&self) -> Result<ScriptBuf> {
        let tag = PushBytesBuf::try_from(PROTOCOL_TAG.to_vec())
            .map_err(|e| Error::Psbt(format!("protocol tag: {e}")))?;
        let payload = PushBytesBuf::try_from(self.to_json()?.into_bytes())
            .map_err(|e| Error::Psbt(format!("message too large for a single push: {e}")))?;
        Ok(Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(tag)
            .push_slice(payload)
            .into_script())
    }
}

/// Amounts travel as decimal strings in protocol messages.
mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market() -> MarketNumber {
        MarketNumber::from_u32(123_456).unwrap()
    }

    #[test]
    fn yes_and_no_differ_only_in_ticker() {
        let template = ContractTemplate::default();
        let yes = template.spec_for(Side::Yes, &market());
        let no = template.spec_for(Side::No, &market());
        assert_eq!(yes.ticker(), "Y123456");
        assert_eq!(no.ticker(), "N123456");
        assert_eq!(yes.supply_cap(), no.supply_cap());
        assert_eq!(yes.mint_mechanism(), no.mint_mechanism());
        assert_eq!(yes.divisibility(), 0);
        assert_eq!(yes.live_time(), 0);
    }

    #[test]
    fn instantiation_message_json_shape() {
        let spec = ContractTemplate::default().spec_for(Side::Yes, &market());
        let json: serde_json::Value =
            serde_json::from_str(&OpReturnMessage::instantiate(spec).to_json().unwrap()).unwrap();
        let moa = &json["contract_creation"]["contract_type"]["moa"];
        assert_eq!(moa["ticker"], "Y123456");
        assert_eq!(moa["supply_cap"], "100000");
        assert_eq!(moa["mint_mechanism"]["free_mint"]["amount_per_mint"], "10");
    }

    #[test]
    fn mint_message_json_shape() {
        let id: ContractId = "840000:12".parse().unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&OpReturnMessage::mint(id, 0).to_json().unwrap()).unwrap();
        assert_eq!(json["contract_call"]["contract"], serde_json::json!([840000, 12]));
        assert_eq!(json["contract_call"]["call_type"]["mint"]["pointer"], 0);
    }

    #[test]
    fn contract_id_rejects_garbage() {
        assert!("840000".parse::<ContractId>().is_err());
        assert!("a:1".parse::<ContractId>().is_err());
        assert_eq!("5:7".parse::<ContractId>().unwrap().to_string(), "5:7");
    }

    #[test]
    fn script_starts_with_op_return_and_tag() {
        let spec = ContractTemplate::default().spec_for(Side::No, &market());
        let script = OpReturnMessage::instantiate(spec).to_script().unwrap();
        assert!(script.is_op_return());
        let bytes = script.as_bytes();
        assert_eq!(&bytes[2..2 + PROTOCOL_TAG.len()], PROTOCOL_TAG);
    }
}
