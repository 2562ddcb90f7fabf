//! In-memory chain and signer doubles for exercising the orchestrator
//! without a wallet or an Electrum server.
//!
//! `FakeChain` builds real PSBTs from synthetic coins, so the signing and
//! finalization path is the production one.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{OutPoint, PrivateKey, Txid};
use tokio::time::Instant;

use crate::chain::{ChainClient, TxRequest, Utxo, build_unsigned_psbt, parse_p2wpkh_address};
use crate::error::{Error, Result};
use crate::network::Network;
use crate::signer::{KeySigner, PsbtSigner, SignResponse, SignerAccount};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

pub const TEST_SECRET: [u8; 32] = [0x11; 32];

pub fn test_signer(network: Network) -> KeySigner {
    let secret = SecretKey::from_slice(&TEST_SECRET).expect("valid secret");
    KeySigner::new(PrivateKey::new(secret, network.into_bitcoin()), network)
        .expect("network matches")
}

pub fn test_account(network: Network) -> SignerAccount {
    test_signer(network).account()
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BroadcastRecord {
    pub at: Instant,
    pub tx_hex: String,
    pub result: std::result::Result<String, String>,
}

/// Chain double. Broadcast results are scripted in order; once the script
/// runs out, broadcasts succeed with `tx1`, `tx2`, ...
pub struct FakeChain {
    network: Network,
    funding_sats: u64,
    fee_rate_sat_vb: u64,
    scripted: Mutex<VecDeque<std::result::Result<String, String>>>,
    requests: Mutex<Vec<TxRequest>>,
    broadcasts: Mutex<Vec<BroadcastRecord>>,
}

impl FakeChain {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            funding_sats: 100_000,
            fee_rate_sat_vb: 2,
            scripted: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_funding(mut self, sats: u64) -> Self {
        self.funding_sats = sats;
        self
    }

    pub fn with_txids<'a>(self, txids: impl IntoIterator<Item = &'a str>) -> Self {
        for txid in txids {
            self.push_result(Ok(txid.to_string()));
        }
        self
    }

    pub fn push_result(&self, result: std::result::Result<String, String>) {
        self.scripted.lock().expect("lock").push_back(result);
    }

    pub fn requests(&self) -> Vec<TxRequest> {
        self.requests.lock().expect("lock").clone()
    }

    pub fn broadcasts(&self) -> Vec<BroadcastRecord> {
        self.broadcasts.lock().expect("lock").clone()
    }

    pub fn successful_broadcasts(&self) -> Vec<BroadcastRecord> {
        self.broadcasts()
            .into_iter()
            .filter(|b| b.result.is_ok())
            .collect()
    }
}

impl ChainClient for FakeChain {
    async fn create_tx(&self, request: &TxRequest) -> Result<Psbt> {
        let network = self.network.into_bitcoin();
        let funding = parse_p2wpkh_address(&request.address, network)?;
        let n = {
            let mut requests = self.requests.lock().expect("lock");
            requests.push(request.clone());
            requests.len()
        };
        let utxo = Utxo {
            outpoint: OutPoint::new(Txid::from_byte_array([n as u8; 32]), 0),
            value: self.funding_sats,
        };
        build_unsigned_psbt(&funding, &[utxo], request, network, self.fee_rate_sat_vb)
    }

    async fn broadcast_tx(&self, tx_hex: &str) -> Result<String> {
        let mut broadcasts = self.broadcasts.lock().expect("lock");
        let result = self
            .scripted
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(format!("tx{}", broadcasts.len() + 1)));
        broadcasts.push(BroadcastRecord {
            at: Instant::now(),
            tx_hex: tx_hex.to_string(),
            result: result.clone(),
        });
        result.map_err(Error::BroadcastFailed)
    }
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerStep {
    Sign,
    Decline,
    Fail(String),
    /// Answers with this hex verbatim.
    Reply(String),
    /// Never answers.
    Hang,
}

/// Wraps a [`KeySigner`] and replays a script of behaviours, one per call.
/// Calls beyond the script sign normally.
pub struct ScriptedSigner {
    inner: KeySigner,
    script: Mutex<VecDeque<SignerStep>>,
    calls: AtomicUsize,
}

impl ScriptedSigner {
    pub fn new(inner: KeySigner) -> Self {
        Self {
            inner,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn then(self, step: SignerStep) -> Self {
        self.script.lock().expect("lock").push_back(step);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn account(&self) -> SignerAccount {
        self.inner.account()
    }
}

impl PsbtSigner for ScriptedSigner {
    async fn sign_psbt(&self, psbt_hex: &str, finalize: bool, broadcast: bool) -> Result<SignResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(SignerStep::Sign);
        match step {
            SignerStep::Sign => self.inner.sign_psbt(psbt_hex, finalize, broadcast).await,
            SignerStep::Decline => Ok(SignResponse::declined()),
            SignerStep::Fail(message) => Err(Error::Query(message)),
            SignerStep::Reply(hex) => Ok(SignResponse::signed(hex)),
            SignerStep::Hang => std::future::pending().await,
        }
    }
}
