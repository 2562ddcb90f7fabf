use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::chain::{ChainClient, DUST_LIMIT_SATS, Output, TxRequest};
use crate::contract::{ContractId, ContractTemplate, OpReturnMessage, Side};
use crate::error::{Error, Result};
use crate::events::{CreationEvent, CreationPhase};
use crate::market_id::MarketNumber;
use crate::network::Network;
use crate::psbt::PendingTransaction;
use crate::signer::{PsbtSigner, SignerAccount};

/// Minimum gap between the YES broadcast and the start of the NO
/// contract, so the YES transaction has propagated first.
pub const PROPAGATION_DELAY: Duration = Duration::from_secs(65);

/// Index of the first recipient output. Output 0 is the message.
const MINT_POINTER: u32 = 1;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub network: Network,
    pub propagation_delay: Duration,
    /// `None` waits for the signer indefinitely.
    pub sign_timeout: Option<Duration>,
    pub network_timeout: Option<Duration>,
    pub contract: ContractTemplate,
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            propagation_delay: PROPAGATION_DELAY,
            sign_timeout: Some(Duration::from_secs(300)),
            network_timeout: Some(Duration::from_secs(60)),
            contract: ContractTemplate::default(),
            event_capacity: 64,
        }
    }
}

/// Both contract txids of a freshly created market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketCreation {
    pub yes_txid: String,
    pub no_txid: String,
    pub market_number: MarketNumber,
}

// ── Cancellation ────────────────────────────────────────────────────

/// Caller side of a cancellation pair.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Observed by the orchestrator until the NO contract starts.
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled. Pends forever if the handle is dropped
    /// without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelToken(rx))
}

// ── Orchestrator ────────────────────────────────────────────────────

struct Attempt {
    market_number: MarketNumber,
    phase: CreationPhase,
    yes_txid: Option<String>,
}

/// Drives the two-phase YES/NO contract creation for a market.
///
/// Every call to [`create_market`](Self::create_market) owns its own
/// attempt state, so concurrent creations do not interfere.
pub struct MarketOrchestrator<C, S> {
    chain: C,
    signer: S,
    config: OrchestratorConfig,
    events: broadcast::Sender<CreationEvent>,
}

impl<C: ChainClient, S: PsbtSigner> MarketOrchestrator<C, S> {
    pub fn new(
        chain: C,
        signer: S,
        config: OrchestratorConfig,
    ) -> (Self, broadcast::Receiver<CreationEvent>) {
        let (events, rx) = broadcast::channel(config.event_capacity.max(1));
        (
            Self {
                chain,
                signer,
                config,
                events,
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CreationEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn signer(&self) -> &S {
        &self.signer
    }

    pub async fn create_market(&self, account: &SignerAccount, title: &str) -> Result<MarketCreation> {
        self.create_market_with_cancel(account, title, &CancelToken::never())
            .await
    }

    /// Create the YES contract, wait out the propagation delay, then
    /// create the NO contract.
    ///
    /// Cancelling before the YES broadcast aborts with nothing on-chain.
    /// Once the NO contract starts, the token is no longer observed.
    ///
    /// A failure after the YES broadcast leaves that contract on-chain;
    /// the `Failed` event carries its txid.
    pub async fn create_market_with_cancel(
        &self,
        account: &SignerAccount,
        title: &str,
        cancel: &CancelToken,
    ) -> Result<MarketCreation> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::InvalidInput("market title must not be empty".into()));
        }
        account.payment_address(self.config.network)?;

        let mut attempt = Attempt {
            market_number: MarketNumber::generate(),
            phase: CreationPhase::Idle,
            yes_txid: None,
        };
        log::info!("creating market {} for {title:?}", attempt.market_number);
        self.emit(CreationEvent::Started {
            market_number: attempt.market_number.clone(),
            title: title.to_string(),
        });

        match self.run(&mut attempt, account, cancel).await {
            Ok(creation) => {
                self.advance(&mut attempt, CreationPhase::Complete);
                log::info!(
                    "market {} created: yes={} no={}",
                    creation.market_number,
                    creation.yes_txid,
                    creation.no_txid
                );
                self.emit(CreationEvent::Completed(creation.clone()));
                Ok(creation)
            }
            Err(e) => {
                let failed_in = attempt.phase;
                match &attempt.yes_txid {
                    Some(yes_txid) => log::error!(
                        "market {}: NO contract not created ({failed_in}): {e}; YES contract {yes_txid} remains on-chain",
                        attempt.market_number
                    ),
                    None => log::error!(
                        "market {} failed during {failed_in}: {e}",
                        attempt.market_number
                    ),
                }
                self.advance(&mut attempt, CreationPhase::Failed);
                self.emit(CreationEvent::Failed {
                    market_number: attempt.market_number.clone(),
                    phase: failed_in,
                    yes_txid: attempt.yes_txid.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        attempt: &mut Attempt,
        account: &SignerAccount,
        cancel: &CancelToken,
    ) -> Result<MarketCreation> {
        let yes_txid = self
            .create_contract(attempt, account, Side::Yes, Some(cancel))
            .await?;
        attempt.yes_txid = Some(yes_txid.clone());
        self.emit(CreationEvent::ContractCreated {
            market_number: attempt.market_number.clone(),
            side: Side::Yes,
            txid: yes_txid.clone(),
        });

        self.advance(attempt, CreationPhase::Waiting);
        self.emit(CreationEvent::Waiting {
            market_number: attempt.market_number.clone(),
            yes_txid: yes_txid.clone(),
            delay: self.config.propagation_delay,
        });
        log::info!(
            "market {}: waiting {:?} before the NO contract",
            attempt.market_number,
            self.config.propagation_delay
        );
        tokio::select! {
            _ = tokio::time::sleep(self.config.propagation_delay) => {}
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }

        let no_txid = self
            .create_contract(attempt, account, Side::No, None)
            .await?;
        self.emit(CreationEvent::ContractCreated {
            market_number: attempt.market_number.clone(),
            side: Side::No,
            txid: no_txid.clone(),
        });

        Ok(MarketCreation {
            yes_txid,
            no_txid,
            market_number: attempt.market_number.clone(),
        })
    }

    async fn create_contract(
        &self,
        attempt: &mut Attempt,
        account: &SignerAccount,
        side: Side,
        cancel: Option<&CancelToken>,
    ) -> Result<String> {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        self.advance(attempt, CreationPhase::Building(side));
        let spec = self.config.contract.spec_for(side, &attempt.market_number);
        log::info!(
            "market {}: building {side} contract {}",
            attempt.market_number,
            spec.ticker()
        );
        let request = TxRequest::new(account.address.clone(), OpReturnMessage::instantiate(spec));
        let mut pending = until_cancelled(cancel, self.build(&request)).await?;

        self.advance(attempt, CreationPhase::Signing(side));
        until_cancelled(cancel, self.sign(&mut pending)).await?;

        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        self.advance(attempt, CreationPhase::Broadcasting(side));
        let txid = self.broadcast(&mut pending).await?;

        self.advance(attempt, CreationPhase::Confirmed(side));
        log::info!("market {}: {side} contract created: {txid}", attempt.market_number);
        Ok(txid)
    }

    /// Mint one allotment of an existing contract to the account.
    pub async fn mint(&self, account: &SignerAccount, contract: ContractId) -> Result<String> {
        account.payment_address(self.config.network)?;
        log::info!("minting {contract} to {}", account.address);

        let request = TxRequest::new(
            account.address.clone(),
            OpReturnMessage::mint(contract, MINT_POINTER),
        )
        .with_output(Output {
            address: account.address.clone(),
            value: DUST_LIMIT_SATS,
        });
        let mut pending = self.build(&request).await?;
        self.sign(&mut pending).await?;
        let txid = self.broadcast(&mut pending).await?;
        log::info!("mint of {contract} broadcast: {txid}");
        Ok(txid)
    }

    // ── Transaction steps ───────────────────────────────────────────

    async fn build(&self, request: &TxRequest) -> Result<PendingTransaction> {
        let psbt = timed(
            self.config.network_timeout,
            "transaction construction",
            self.chain.create_tx(request),
        )
        .await?;
        Ok(PendingTransaction::new(request.message.clone(), psbt))
    }

    async fn sign(&self, pending: &mut PendingTransaction) -> Result<()> {
        let unsigned = pending.unsigned_hex();
        let response = timed(self.config.sign_timeout, "signing", async {
            self.signer
                .sign_psbt(&unsigned, false, false)
                .await
                .map_err(|e| match e {
                    Error::SigningFailed(_) => e,
                    other => Error::SigningFailed(other.to_string()),
                })
        })
        .await?;
        let signed = response
            .signed_psbt_hex
            .ok_or_else(|| Error::SigningFailed("signer returned no signed transaction".into()))?;
        pending
            .attach_signed(&signed)
            .map_err(|e| Error::SigningFailed(format!("unusable signer reply: {e}")))
    }

    async fn broadcast(&self, pending: &mut PendingTransaction) -> Result<String> {
        let tx_hex = pending.finalize()?.to_string();
        let txid = timed(self.config.network_timeout, "broadcast", async {
            self.chain
                .broadcast_tx(&tx_hex)
                .await
                .map_err(|e| match e {
                    Error::BroadcastFailed(_) => e,
                    other => Error::BroadcastFailed(other.to_string()),
                })
        })
        .await?;
        pending.record_broadcast(txid.clone());
        Ok(txid)
    }

    fn advance(&self, attempt: &mut Attempt, phase: CreationPhase) {
        attempt.phase = phase;
        log::debug!("market {}: {phase}", attempt.market_number);
        self.emit(CreationEvent::PhaseChanged {
            market_number: attempt.market_number.clone(),
            phase,
        });
    }

    fn emit(&self, event: CreationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn timed<T>(
    limit: Option<Duration>,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(what.to_string()))?,
        None => fut.await,
    }
}

/// Race `fut` against `cancel`; a fired token wins ties.
async fn until_cancelled<T>(
    cancel: Option<&CancelToken>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match cancel {
        Some(cancel) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        },
        None => fut.await,
    }
}
