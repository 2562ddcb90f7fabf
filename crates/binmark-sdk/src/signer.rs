use std::future::Future;

use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Address, CompressedPublicKey, NetworkKind, PrivateKey, ecdsa};
use serde::{Deserialize, Serialize};

use crate::chain::parse_p2wpkh_address;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::psbt::{decode_psbt, encode_psbt, finalize_inputs};

/// The signer's reply. `None` means the user declined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResponse {
    pub signed_psbt_hex: Option<String>,
}

impl SignResponse {
    pub fn signed(psbt_hex: String) -> Self {
        Self {
            signed_psbt_hex: Some(psbt_hex),
        }
    }

    pub fn declined() -> Self {
        Self {
            signed_psbt_hex: None,
        }
    }
}

/// An external signing capability, typically a browser wallet.
///
/// The orchestrator always calls with `finalize = false` and
/// `broadcast = false`: finalization and relay stay under its control.
pub trait PsbtSigner: Send + Sync {
    fn sign_psbt(
        &self,
        psbt_hex: &str,
        finalize: bool,
        broadcast: bool,
    ) -> impl Future<Output = Result<SignResponse>> + Send;
}

/// The connected account: where funding comes from and where change goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerAccount {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl SignerAccount {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            public_key: None,
        }
    }

    /// Parse the payment address, requiring P2WPKH.
    pub fn payment_address(&self, network: Network) -> Result<Address> {
        parse_p2wpkh_address(&self.address, network.into_bitcoin())
    }
}

/// In-process P2WPKH signer over a single private key.
pub struct KeySigner {
    key: PrivateKey,
    public_key: bitcoin::PublicKey,
    address: Address,
    secp: Secp256k1<All>,
}

impl KeySigner {
    pub fn new(key: PrivateKey, network: Network) -> Result<Self> {
        if key.network != NetworkKind::from(network.into_bitcoin()) {
            return Err(Error::InvalidInput(format!(
                "key network does not match {network}"
            )));
        }
        let secp = Secp256k1::new();
        let compressed = CompressedPublicKey::from_private_key(&secp, &key)
            .map_err(|e| Error::InvalidInput(format!("key: {e}")))?;
        let address = Address::p2wpkh(&compressed, network.into_bitcoin());
        Ok(Self {
            key,
            public_key: bitcoin::PublicKey::new(compressed.0),
            address,
            secp,
        })
    }

    pub fn from_wif(wif: &str, network: Network) -> Result<Self> {
        let key = PrivateKey::from_wif(wif.trim())
            .map_err(|e| Error::InvalidInput(format!("WIF: {e}")))?;
        Self::new(key, network)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn account(&self) -> SignerAccount {
        SignerAccount {
            address: self.address.to_string(),
            public_key: Some(self.public_key.to_string()),
        }
    }

    /// Add a partial signature to every input spending our script.
    /// Returns the number of inputs signed.
    pub fn sign(&self, psbt: &mut Psbt) -> Result<usize> {
        let script_pubkey = self.address.script_pubkey();
        let mut cache = SighashCache::new(&psbt.unsigned_tx);
        let mut signed = 0;

        for (index, input) in psbt.inputs.iter_mut().enumerate() {
            let Some(utxo) = input.witness_utxo.as_ref() else {
                continue;
            };
            if utxo.script_pubkey != script_pubkey {
                continue;
            }
            let sighash = cache
                .p2wpkh_signature_hash(index, &utxo.script_pubkey, utxo.value, EcdsaSighashType::All)
                .map_err(|e| Error::SigningFailed(format!("sighash for input {index}: {e}")))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = self.secp.sign_ecdsa(&message, &self.key.inner);
            input.partial_sigs.insert(
                self.public_key,
                ecdsa::Signature {
                    signature,
                    sighash_type: EcdsaSighashType::All,
                },
            );
            signed += 1;
        }
        Ok(signed)
    }
}

impl PsbtSigner for KeySigner {
    async fn sign_psbt(&self, psbt_hex: &str, finalize: bool, broadcast: bool) -> Result<SignResponse> {
        if broadcast {
            return Err(Error::InvalidInput(
                "key signer cannot broadcast; relay through the chain client".into(),
            ));
        }
        let mut psbt = decode_psbt(psbt_hex)?;
        let signed = self.sign(&mut psbt)?;
        if signed == 0 {
            log::warn!("no inputs spend from {}", self.address);
            return Ok(SignResponse::declined());
        }
        if finalize {
            finalize_inputs(&mut psbt)?;
        }
        log::debug!("signed {signed} input(s)");
        Ok(SignResponse::signed(encode_psbt(&psbt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_signer;

    #[test]
    fn account_exposes_witness_address() {
        let signer = test_signer(Network::Regtest);
        let account = signer.account();
        assert!(account.address.starts_with("bcrt1q"));
        assert!(account.payment_address(Network::Regtest).is_ok());
        assert!(account.payment_address(Network::Mainnet).is_err());
    }

    #[test]
    fn rejects_key_for_other_network() {
        let signer = test_signer(Network::Mainnet);
        let wif = signer.key.to_wif();
        assert!(KeySigner::from_wif(&wif, Network::Mainnet).is_ok());
        assert!(matches!(
            KeySigner::from_wif(&wif, Network::Testnet),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_flag_is_refused() {
        let signer = test_signer(Network::Regtest);
        let err = signer.sign_psbt("00", false, true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
