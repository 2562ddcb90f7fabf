//! PSBT encoding helpers and the per-transaction lifecycle used while a
//! contract is being created.

use bitcoin::Witness;
use bitcoin::psbt::Psbt;

use crate::contract::OpReturnMessage;
use crate::error::{Error, Result};

pub fn decode_psbt(psbt_hex: &str) -> Result<Psbt> {
    let bytes = hex::decode(psbt_hex.trim()).map_err(|e| Error::Psbt(format!("invalid hex: {e}")))?;
    Psbt::deserialize(&bytes).map_err(|e| Error::Psbt(e.to_string()))
}

pub fn encode_psbt(psbt: &Psbt) -> String {
    psbt.serialize_hex()
}

/// Finalize every P2WPKH input that carries exactly one partial signature.
///
/// Inputs that already have a final witness or script sig are left alone.
pub fn finalize_inputs(psbt: &mut Psbt) -> Result<()> {
    for (index, input) in psbt.inputs.iter_mut().enumerate() {
        if input.final_script_witness.is_some() || input.final_script_sig.is_some() {
            continue;
        }
        let utxo = input
            .witness_utxo
            .as_ref()
            .ok_or_else(|| Error::Finalize(format!("input {index} has no witness utxo")))?;
        if !utxo.script_pubkey.is_p2wpkh() {
            return Err(Error::Finalize(format!("input {index} is not P2WPKH")));
        }
        if input.partial_sigs.len() != 1 {
            return Err(Error::Finalize(format!(
                "input {index} has {} signatures, expected 1",
                input.partial_sigs.len()
            )));
        }
        let Some((pubkey, sig)) = input.partial_sigs.iter().next().map(|(k, s)| (*k, *s)) else {
            continue;
        };

        input.final_script_witness = Some(Witness::from_slice(&[sig.to_vec(), pubkey.to_bytes()]));
        input.partial_sigs.clear();
        input.sighash_type = None;
        input.redeem_script = None;
        input.witness_script = None;
        input.bip32_derivation.clear();
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    Unsigned,
    Signed,
    Finalized,
    Broadcast,
}

/// One transaction moving through build → sign → finalize → broadcast.
///
/// Each creation attempt owns its own `PendingTransaction`s, so two
/// attempts never observe each other's intermediate state.
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    message: OpReturnMessage,
    unsigned: Psbt,
    signed: Option<Psbt>,
    final_tx_hex: Option<String>,
    txid: Option<String>,
}

impl PendingTransaction {
    pub fn new(message: OpReturnMessage, unsigned: Psbt) -> Self {
        Self {
            message,
            unsigned,
            signed: None,
            final_tx_hex: None,
            txid: None,
        }
    }

    pub fn message(&self) -> &OpReturnMessage {
        &self.message
    }

    pub fn stage(&self) -> TxStage {
        if self.txid.is_some() {
            TxStage::Broadcast
        } else if self.final_tx_hex.is_some() {
            TxStage::Finalized
        } else if self.signed.is_some() {
            TxStage::Signed
        } else {
            TxStage::Unsigned
        }
    }

    pub fn unsigned_hex(&self) -> String {
        encode_psbt(&self.unsigned)
    }

    /// Accept the signer's PSBT. The signer may add signatures but must
    /// not change the transaction itself.
    pub fn attach_signed(&mut self, signed_hex: &str) -> Result<()> {
        if self.stage() != TxStage::Unsigned {
            return Err(Error::Psbt("transaction already signed".into()));
        }
        let signed = decode_psbt(signed_hex)?;
        if signed.unsigned_tx.compute_txid() != self.unsigned.unsigned_tx.compute_txid() {
            return Err(Error::Psbt("signer returned a different transaction".into()));
        }
        self.signed = Some(signed);
        Ok(())
    }

    /// Finalize all inputs and extract the network-serialized transaction.
    pub fn finalize(&mut self) -> Result<&str> {
        let mut psbt = match (&self.signed, &self.final_tx_hex) {
            (_, Some(_)) => return Err(Error::Finalize("transaction already finalized".into())),
            (None, None) => return Err(Error::Finalize("transaction is not signed".into())),
            (Some(signed), None) => signed.clone(),
        };
        finalize_inputs(&mut psbt)?;
        let tx = psbt.extract_tx_unchecked_fee_rate();
        let tx_hex = bitcoin::consensus::encode::serialize_hex(&tx);
        let stored = self.final_tx_hex.insert(tx_hex);
        Ok(stored.as_str())
    }

    pub fn final_tx_hex(&self) -> Option<&str> {
        self.final_tx_hex.as_deref()
    }

    pub fn record_broadcast(&mut self, txid: String) {
        self.txid = Some(txid);
    }

    pub fn txid(&self) -> Option<&str> {
        self.txid.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use bitcoin::{OutPoint, Txid};

    use super::*;
    use crate::chain::{TxRequest, Utxo, build_unsigned_psbt};
    use crate::contract::{ContractTemplate, Side};
    use crate::market_id::MarketNumber;
    use crate::network::Network;
    use crate::signer::KeySigner;
    use crate::testing::test_signer;

    fn pending(signer: &KeySigner) -> PendingTransaction {
        let market = MarketNumber::from_u32(123_456).unwrap();
        let message =
            OpReturnMessage::instantiate(ContractTemplate::default().spec_for(Side::No, &market));
        let request = TxRequest::new(signer.address().to_string(), message.clone());
        let utxo = Utxo {
            outpoint: OutPoint::new(Txid::from_byte_array([7; 32]), 1),
            value: 20_000,
        };
        let psbt = build_unsigned_psbt(
            signer.address(),
            &[utxo],
            &request,
            bitcoin::Network::Regtest,
            1,
        )
        .unwrap();
        PendingTransaction::new(message, psbt)
    }

    #[test]
    fn walks_every_stage() {
        let signer = test_signer(Network::Regtest);
        let mut tx = pending(&signer);
        assert_eq!(tx.stage(), TxStage::Unsigned);

        let mut psbt = decode_psbt(&tx.unsigned_hex()).unwrap();
        assert_eq!(signer.sign(&mut psbt).unwrap(), 1);
        tx.attach_signed(&encode_psbt(&psbt)).unwrap();
        assert_eq!(tx.stage(), TxStage::Signed);

        let hex = tx.finalize().unwrap().to_string();
        assert_eq!(tx.stage(), TxStage::Finalized);
        let raw: bitcoin::Transaction =
            bitcoin::consensus::encode::deserialize(&hex::decode(&hex).unwrap()).unwrap();
        assert_eq!(raw.input[0].witness.len(), 2);

        tx.record_broadcast("txN1".into());
        assert_eq!(tx.stage(), TxStage::Broadcast);
        assert_eq!(tx.txid(), Some("txN1"));
    }

    #[test]
    fn finalize_requires_signature() {
        let signer = test_signer(Network::Regtest);
        let mut tx = pending(&signer);
        assert!(matches!(tx.finalize(), Err(Error::Finalize(_))));

        // Unsigned PSBT passed back as if signed.
        tx.attach_signed(&tx.unsigned_hex()).unwrap();
        assert!(matches!(tx.finalize(), Err(Error::Finalize(_))));
    }

    #[test]
    fn rejects_a_swapped_transaction() {
        let signer = test_signer(Network::Regtest);
        let mut first = pending(&signer);
        let mut other = decode_psbt(&first.unsigned_hex()).unwrap();
        other.unsigned_tx.lock_time = bitcoin::absolute::LockTime::from_consensus(10);
        other.unsigned_tx.input[0].sequence = bitcoin::Sequence::ZERO;
        assert!(matches!(
            first.attach_signed(&encode_psbt(&other)),
            Err(Error::Psbt(_))
        ));
    }

    #[test]
    fn garbage_hex_is_a_psbt_error() {
        assert!(matches!(decode_psbt("zz"), Err(Error::Psbt(_))));
        assert!(matches!(decode_psbt("deadbeef"), Err(Error::Psbt(_))));
    }
}
