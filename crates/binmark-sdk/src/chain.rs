use std::future::Future;

use bitcoin::absolute::LockTime;
use bitcoin::address::{AddressType, NetworkUnchecked};
use bitcoin::psbt::Psbt;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use crate::contract::OpReturnMessage;
use crate::error::{Error, Result};
use crate::network::Network;

/// Smallest output value relayed by default policy for segwit outputs.
pub const DUST_LIMIT_SATS: u64 = 546;

/// A payment output requested alongside the message output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub address: String,
    pub value: u64,
}

/// Everything a chain client needs to assemble an unsigned transaction:
/// the funding (and change) address, the protocol message, and any extra
/// recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub address: String,
    pub message: OpReturnMessage,
    pub outputs: Vec<Output>,
}

impl TxRequest {
    pub fn new(address: impl Into<String>, message: OpReturnMessage) -> Self {
        Self {
            address: address.into(),
            message,
            outputs: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: Output) -> Self {
        self.outputs.push(output);
        self
    }
}

/// A spendable output of the funding address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
}

/// Backend that builds unsigned transactions and relays signed ones.
pub trait ChainClient: Send + Sync {
    /// Build an unsigned PSBT funded by `request.address`.
    fn create_tx(&self, request: &TxRequest) -> impl Future<Output = Result<Psbt>> + Send;

    /// Broadcast a fully signed transaction and return its txid.
    fn broadcast_tx(&self, tx_hex: &str) -> impl Future<Output = Result<String>> + Send;
}

pub fn parse_address(address: &str, network: bitcoin::Network) -> Result<Address> {
    address
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| Error::Address(format!("{address}: {e}")))?
        .require_network(network)
        .map_err(|e| Error::Address(format!("{address}: {e}")))
}

/// Parse a funding address. Only P2WPKH inputs can be finalized here.
pub fn parse_p2wpkh_address(address: &str, network: bitcoin::Network) -> Result<Address> {
    let parsed = parse_address(address, network)?;
    match parsed.address_type() {
        Some(AddressType::P2wpkh) => Ok(parsed),
        _ => Err(Error::InvalidInput(format!(
            "{address} is not a P2WPKH payment address"
        ))),
    }
}

fn output_size(script: &Script) -> u64 {
    let len = script.len() as u64;
    let prefix = if len < 0xfd { 1 } else { 3 };
    8 + prefix + len
}

/// Virtual size of a P2WPKH-funded transaction, rounded up.
fn estimate_vsize(inputs: usize, outputs: &[TxOut], change: Option<&Script>) -> u64 {
    let mut vsize = 11 + 68 * inputs as u64;
    vsize += outputs.iter().map(|o| output_size(&o.script_pubkey)).sum::<u64>();
    if let Some(change) = change {
        vsize += output_size(change);
    }
    vsize
}

/// Assemble an unsigned PSBT: message output first, then the requested
/// recipients, then change back to `funding` when it clears the dust limit.
///
/// Coins are picked largest-first. Every input carries its `witness_utxo`
/// so a segwit signer can compute sighashes without the previous tx.
pub fn build_unsigned_psbt(
    funding: &Address,
    utxos: &[Utxo],
    request: &TxRequest,
    network: bitcoin::Network,
    fee_rate_sat_vb: u64,
) -> Result<Psbt> {
    let mut outputs = vec![TxOut {
        value: Amount::ZERO,
        script_pubkey: request.message.to_script()?,
    }];
    for out in &request.outputs {
        if out.value < DUST_LIMIT_SATS {
            return Err(Error::InvalidInput(format!(
                "output to {} is below the dust limit ({} < {DUST_LIMIT_SATS})",
                out.address, out.value
            )));
        }
        let address = parse_address(&out.address, network)?;
        outputs.push(TxOut {
            value: Amount::from_sat(out.value),
            script_pubkey: address.script_pubkey(),
        });
    }
    let target: u64 = request.outputs.iter().map(|o| o.value).sum();
    let change_script: ScriptBuf = funding.script_pubkey();

    let mut candidates: Vec<&Utxo> = utxos.iter().collect();
    candidates.sort_by(|a, b| b.value.cmp(&a.value));

    let mut selected: Vec<&Utxo> = Vec::new();
    let mut total = 0u64;
    let mut fee = 0u64;
    for utxo in candidates {
        selected.push(utxo);
        total += utxo.value;
        fee = estimate_vsize(selected.len(), &outputs, Some(&change_script)) * fee_rate_sat_vb;
        if total >= target + fee {
            break;
        }
    }
    if selected.is_empty() || total < target + fee {
        return Err(Error::InsufficientFunds {
            needed: target + fee.max(estimate_vsize(1, &outputs, None) * fee_rate_sat_vb),
            available: total,
        });
    }

    let change = total - target - fee;
    if change >= DUST_LIMIT_SATS {
        outputs.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: change_script.clone(),
        });
    }

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: selected
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    };

    let mut psbt = Psbt::from_unsigned_tx(tx).map_err(|e| Error::Psbt(e.to_string()))?;
    for (input, utxo) in psbt.inputs.iter_mut().zip(&selected) {
        input.witness_utxo = Some(TxOut {
            value: Amount::from_sat(utxo.value),
            script_pubkey: change_script.clone(),
        });
    }
    Ok(psbt)
}

/// Electrum-backed chain client.
///
/// `electrum_client::Client` is blocking, so every call runs on the tokio
/// blocking pool with a fresh connection.
pub struct ElectrumChainClient {
    electrum_url: String,
    network: Network,
    fee_rate_sat_vb: u64,
}

impl ElectrumChainClient {
    pub fn new(electrum_url: &str, network: Network, fee_rate_sat_vb: u64) -> Self {
        Self {
            electrum_url: electrum_url.to_string(),
            network,
            fee_rate_sat_vb: fee_rate_sat_vb.max(1),
        }
    }

    pub fn electrum_url(&self) -> &str {
        &self.electrum_url
    }

    pub fn network(&self) -> Network {
        self.network
    }
}

impl ChainClient for ElectrumChainClient {
    async fn create_tx(&self, request: &TxRequest) -> Result<Psbt> {
        let network = self.network.into_bitcoin();
        let funding = parse_p2wpkh_address(&request.address, network)?;
        let url = self.electrum_url.clone();
        let script = funding.script_pubkey();
        let utxos = tokio::task::spawn_blocking(move || list_unspent(&url, &script))
            .await
            .map_err(|e| Error::Task(e.to_string()))??;
        log::debug!("{} spendable outputs for {}", utxos.len(), request.address);
        build_unsigned_psbt(&funding, &utxos, request, network, self.fee_rate_sat_vb)
    }

    async fn broadcast_tx(&self, tx_hex: &str) -> Result<String> {
        let url = self.electrum_url.clone();
        let tx_hex = tx_hex.to_string();
        tokio::task::spawn_blocking(move || broadcast_raw(&url, tx_hex))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }
}

/// Electrum script hash = SHA256(scriptPubKey) with reversed byte order.
fn electrum_script_hash(script: &Script) -> String {
    use sha2::{Digest, Sha256};

    let mut hash = Sha256::digest(script.as_bytes()).to_vec();
    hash.reverse();
    hex::encode(&hash)
}

fn list_unspent(electrum_url: &str, script: &Script) -> Result<Vec<Utxo>> {
    use electrum_client::ElectrumApi;

    let client =
        electrum_client::Client::new(electrum_url).map_err(|e| Error::Electrum(e.to_string()))?;
    let resp = client
        .raw_call(
            "blockchain.scripthash.listunspent",
            [electrum_client::Param::String(electrum_script_hash(script))],
        )
        .map_err(|e| Error::Electrum(e.to_string()))?;

    let entries = resp
        .as_array()
        .ok_or_else(|| Error::Query("expected array response".into()))?;

    let mut utxos = Vec::with_capacity(entries.len());
    for entry in entries {
        let tx_hash = entry["tx_hash"]
            .as_str()
            .ok_or_else(|| Error::Query("missing tx_hash".into()))?;
        let tx_pos = entry["tx_pos"]
            .as_u64()
            .ok_or_else(|| Error::Query("missing tx_pos".into()))?;
        let value = entry["value"]
            .as_u64()
            .ok_or_else(|| Error::Query("missing value".into()))?;
        let txid: Txid = tx_hash
            .parse()
            .map_err(|e| Error::Query(format!("bad tx_hash: {e}")))?;
        let vout = u32::try_from(tx_pos).map_err(|_| Error::Query("tx_pos out of range".into()))?;
        utxos.push(Utxo {
            outpoint: OutPoint::new(txid, vout),
            value,
        });
    }
    Ok(utxos)
}

fn broadcast_raw(electrum_url: &str, tx_hex: String) -> Result<String> {
    use electrum_client::ElectrumApi;

    let client = electrum_client::Client::new(electrum_url)
        .map_err(|e| Error::BroadcastFailed(e.to_string()))?;
    let resp = client
        .raw_call(
            "blockchain.transaction.broadcast",
            [electrum_client::Param::String(tx_hex)],
        )
        .map_err(|e| Error::BroadcastFailed(e.to_string()))?;
    resp.as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::BroadcastFailed(format!("unexpected broadcast response: {resp}")))
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use super::*;
    use crate::contract::{ContractTemplate, Side};
    use crate::market_id::MarketNumber;
    use crate::testing::test_signer;

    fn request(address: &str) -> TxRequest {
        let market = MarketNumber::from_u32(654_321).unwrap();
        let spec = ContractTemplate::default().spec_for(Side::Yes, &market);
        TxRequest::new(address, OpReturnMessage::instantiate(spec))
    }

    fn utxo(tag: u8, value: u64) -> Utxo {
        Utxo {
            outpoint: OutPoint::new(Txid::from_byte_array([tag; 32]), 0),
            value,
        }
    }

    #[test]
    fn picks_largest_coin_and_returns_change() {
        let signer = test_signer(Network::Regtest);
        let funding = signer.address().clone();
        let req = request(&funding.to_string());
        let psbt = build_unsigned_psbt(
            &funding,
            &[utxo(1, 2_000), utxo(2, 50_000)],
            &req,
            bitcoin::Network::Regtest,
            2,
        )
        .unwrap();

        let tx = &psbt.unsigned_tx;
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output.txid, Txid::from_byte_array([2; 32]));
        assert!(tx.output[0].script_pubkey.is_op_return());
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[1].script_pubkey, funding.script_pubkey());
        assert!(psbt.inputs[0].witness_utxo.is_some());
    }

    #[test]
    fn insufficient_funds_is_reported() {
        let signer = test_signer(Network::Regtest);
        let funding = signer.address().clone();
        let req = request(&funding.to_string()).with_output(Output {
            address: funding.to_string(),
            value: 10_000,
        });
        let err = build_unsigned_psbt(&funding, &[utxo(1, 5_000)], &req, bitcoin::Network::Regtest, 1)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { available: 5_000, .. }));
    }

    #[test]
    fn dust_outputs_are_rejected() {
        let signer = test_signer(Network::Regtest);
        let funding = signer.address().clone();
        let req = request(&funding.to_string()).with_output(Output {
            address: funding.to_string(),
            value: 100,
        });
        let err = build_unsigned_psbt(&funding, &[utxo(1, 50_000)], &req, bitcoin::Network::Regtest, 1)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn p2wpkh_address_required() {
        let err = parse_p2wpkh_address("mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn", bitcoin::Network::Testnet)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_) | Error::Address(_)));

        let p2wsh = Address::p2wsh(&ScriptBuf::new(), bitcoin::Network::Regtest).to_string();
        let err = parse_p2wpkh_address(&p2wsh, bitcoin::Network::Regtest).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
