use std::time::Duration;

use binmark_sdk::bitcoin::{Address, ScriptBuf};
use binmark_sdk::testing::{FakeChain, ScriptedSigner, SignerStep, test_signer};
use binmark_sdk::{
    CallType, ContractId, CreationEvent, CreationPhase, Error, MarketOrchestrator, Network,
    OpReturnMessage, OrchestratorConfig, PROPAGATION_DELAY, Side, SignerAccount, cancel_pair,
};
use tokio::sync::broadcast;

const NET: Network = Network::Regtest;

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        network: NET,
        ..OrchestratorConfig::default()
    }
}

fn setup(
    chain: FakeChain,
    signer: ScriptedSigner,
) -> (
    MarketOrchestrator<FakeChain, ScriptedSigner>,
    broadcast::Receiver<CreationEvent>,
    SignerAccount,
) {
    let account = signer.account();
    let (orchestrator, rx) = MarketOrchestrator::new(chain, signer, config());
    (orchestrator, rx, account)
}

fn drain(rx: &mut broadcast::Receiver<CreationEvent>) -> Vec<CreationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn created(events: &[CreationEvent]) -> Vec<(Side, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            CreationEvent::ContractCreated { side, txid, .. } => Some((*side, txid.clone())),
            _ => None,
        })
        .collect()
}

// ==================== Creation ====================

#[tokio::test(start_paused = true)]
async fn creates_yes_then_no() {
    let chain = FakeChain::new(NET).with_txids(["txY1", "txN1"]);
    let signer = ScriptedSigner::new(test_signer(NET));
    let (orchestrator, mut rx, account) = setup(chain, signer);

    let creation = orchestrator
        .create_market(&account, "Will it rain?")
        .await
        .expect("market created");

    assert_eq!(creation.yes_txid, "txY1");
    assert_eq!(creation.no_txid, "txN1");
    let number = creation.market_number.to_string();
    assert_eq!(number.len(), 6);

    let requests = orchestrator.chain().requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].message.ticker(), Some(format!("Y{number}").as_str()));
    assert_eq!(requests[1].message.ticker(), Some(format!("N{number}").as_str()));
    assert!(requests.iter().all(|r| r.address == account.address));
    assert!(requests.iter().all(|r| r.outputs.is_empty()));

    let events = drain(&mut rx);
    assert_eq!(
        created(&events),
        vec![(Side::Yes, "txY1".to_string()), (Side::No, "txN1".to_string())]
    );
    assert!(matches!(events.first(), Some(CreationEvent::Started { title, .. }) if title == "Will it rain?"));
    assert!(matches!(events.last(), Some(CreationEvent::Completed(c)) if *c == creation));
    assert!(events.iter().all(|e| *e.market_number() == creation.market_number));
    assert_eq!(orchestrator.signer().calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn no_contract_waits_for_propagation() {
    let chain = FakeChain::new(NET).with_txids(["txY1", "txN1"]);
    let signer = ScriptedSigner::new(test_signer(NET));
    let (orchestrator, _rx, account) = setup(chain, signer);

    orchestrator
        .create_market(&account, "Will BTC close above 100k?")
        .await
        .unwrap();

    let broadcasts = orchestrator.chain().broadcasts();
    assert_eq!(broadcasts.len(), 2);
    assert!(broadcasts[1].at - broadcasts[0].at >= PROPAGATION_DELAY);
}

#[tokio::test(start_paused = true)]
async fn phases_follow_the_creation_order() {
    let chain = FakeChain::new(NET);
    let signer = ScriptedSigner::new(test_signer(NET));
    let (orchestrator, mut rx, account) = setup(chain, signer);

    orchestrator.create_market(&account, "Order").await.unwrap();

    let phases: Vec<CreationPhase> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            CreationEvent::PhaseChanged { phase, .. } => Some(phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            CreationPhase::Building(Side::Yes),
            CreationPhase::Signing(Side::Yes),
            CreationPhase::Broadcasting(Side::Yes),
            CreationPhase::Confirmed(Side::Yes),
            CreationPhase::Waiting,
            CreationPhase::Building(Side::No),
            CreationPhase::Signing(Side::No),
            CreationPhase::Broadcasting(Side::No),
            CreationPhase::Confirmed(Side::No),
            CreationPhase::Complete,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn broadcast_payload_is_a_signed_transaction() {
    let chain = FakeChain::new(NET);
    let signer = ScriptedSigner::new(test_signer(NET));
    let (orchestrator, _rx, account) = setup(chain, signer);

    orchestrator.create_market(&account, "Signed").await.unwrap();

    for record in orchestrator.chain().broadcasts() {
        let bytes = hex::decode(&record.tx_hex).unwrap();
        let tx: binmark_sdk::bitcoin::Transaction =
            binmark_sdk::bitcoin::consensus::encode::deserialize(&bytes).unwrap();
        assert!(tx.output[0].script_pubkey.is_op_return());
        assert!(tx.input.iter().all(|i| i.witness.len() == 2));
    }
}

// ==================== Failures ====================

#[tokio::test(start_paused = true)]
async fn declined_yes_signature_stops_before_broadcast() {
    let chain = FakeChain::new(NET);
    let signer = ScriptedSigner::new(test_signer(NET)).then(SignerStep::Decline);
    let (orchestrator, mut rx, account) = setup(chain, signer);

    let err = orchestrator.create_market(&account, "Declined").await.unwrap_err();
    assert!(matches!(err, Error::SigningFailed(_)));
    assert!(err.is_signing_failure());
    assert!(orchestrator.chain().broadcasts().is_empty());

    let events = drain(&mut rx);
    assert!(created(&events).is_empty());
    assert!(!events.iter().any(|e| matches!(e, CreationEvent::Waiting { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        CreationEvent::Failed { phase: CreationPhase::Signing(Side::Yes), yes_txid: None, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn signer_errors_become_signing_failures() {
    let chain = FakeChain::new(NET);
    let signer =
        ScriptedSigner::new(test_signer(NET)).then(SignerStep::Fail("wallet locked".into()));
    let (orchestrator, _rx, account) = setup(chain, signer);

    let err = orchestrator.create_market(&account, "Locked").await.unwrap_err();
    match err {
        Error::SigningFailed(message) => assert!(message.contains("wallet locked")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn undecodable_signer_reply_is_a_signing_failure() {
    let chain = FakeChain::new(NET);
    let signer = ScriptedSigner::new(test_signer(NET)).then(SignerStep::Reply("deadbeef".into()));
    let (orchestrator, _rx, account) = setup(chain, signer);

    let err = orchestrator.create_market(&account, "Garbled").await.unwrap_err();
    assert!(matches!(err, Error::SigningFailed(_)));
    assert!(err.is_signing_failure());
    assert!(orchestrator.chain().broadcasts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_no_broadcast_keeps_yes_observable() {
    let chain = FakeChain::new(NET);
    chain.push_result(Ok("txY1".into()));
    chain.push_result(Err("mempool conflict".into()));
    let signer = ScriptedSigner::new(test_signer(NET));
    let (orchestrator, mut rx, account) = setup(chain, signer);

    let err = orchestrator.create_market(&account, "Half").await.unwrap_err();
    assert!(matches!(err, Error::BroadcastFailed(_)));

    let events = drain(&mut rx);
    assert_eq!(created(&events), vec![(Side::Yes, "txY1".to_string())]);
    assert!(events.iter().any(|e| matches!(
        e,
        CreationEvent::Failed { phase: CreationPhase::Broadcasting(Side::No), yes_txid: Some(txid), .. }
            if txid == "txY1"
    )));
    assert_eq!(orchestrator.chain().successful_broadcasts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn underfunded_account_fails_while_building() {
    let chain = FakeChain::new(NET).with_funding(300);
    let signer = ScriptedSigner::new(test_signer(NET));
    let (orchestrator, _rx, account) = setup(chain, signer);

    let err = orchestrator.create_market(&account, "Broke").await.unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds { .. }));
    assert_eq!(orchestrator.signer().calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn hanging_signer_times_out() {
    let chain = FakeChain::new(NET);
    let signer = ScriptedSigner::new(test_signer(NET)).then(SignerStep::Hang);
    let (orchestrator, _rx, account) = setup(chain, signer);

    let err = orchestrator.create_market(&account, "Slow").await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(orchestrator.chain().broadcasts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_wait_skips_no_contract() {
    let chain = FakeChain::new(NET);
    let signer = ScriptedSigner::new(test_signer(NET));
    let (orchestrator, _rx, account) = setup(chain, signer);
    let mut watcher = orchestrator.subscribe();
    let (handle, token) = cancel_pair();

    let canceller = async move {
        while let Ok(event) = watcher.recv().await {
            if matches!(event, CreationEvent::Waiting { .. }) {
                handle.cancel();
                break;
            }
        }
    };
    let (result, ()) = tokio::join!(
        orchestrator.create_market_with_cancel(&account, "Cancelled", &token),
        canceller
    );

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(orchestrator.chain().requests().len(), 1);
    assert_eq!(orchestrator.chain().broadcasts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_start_broadcasts_nothing() {
    let chain = FakeChain::new(NET);
    let signer = ScriptedSigner::new(test_signer(NET));
    let (orchestrator, mut rx, account) = setup(chain, signer);
    let (handle, token) = cancel_pair();
    handle.cancel();

    let err = orchestrator
        .create_market_with_cancel(&account, "Too late", &token)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(orchestrator.chain().requests().is_empty());
    assert!(orchestrator.chain().broadcasts().is_empty());
    assert_eq!(orchestrator.signer().calls(), 0);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        CreationEvent::Failed { yes_txid: None, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn cancel_while_signing_yes_broadcasts_nothing() {
    let chain = FakeChain::new(NET);
    let signer = ScriptedSigner::new(test_signer(NET)).then(SignerStep::Hang);
    let (orchestrator, _rx, account) = setup(chain, signer);
    let mut watcher = orchestrator.subscribe();
    let (handle, token) = cancel_pair();

    let canceller = async move {
        while let Ok(event) = watcher.recv().await {
            if matches!(
                event,
                CreationEvent::PhaseChanged { phase: CreationPhase::Signing(Side::Yes), .. }
            ) {
                handle.cancel();
                break;
            }
        }
    };
    let (result, ()) = tokio::join!(
        orchestrator.create_market_with_cancel(&account, "Abort", &token),
        canceller
    );

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(orchestrator.signer().calls(), 1);
    assert!(orchestrator.chain().broadcasts().is_empty());
}

// ==================== Validation ====================

#[tokio::test]
async fn empty_title_is_rejected() {
    let chain = FakeChain::new(NET);
    let signer = ScriptedSigner::new(test_signer(NET));
    let (orchestrator, _rx, account) = setup(chain, signer);

    let err = orchestrator.create_market(&account, "   ").await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(orchestrator.chain().requests().is_empty());
}

#[tokio::test]
async fn account_without_witness_address_is_rejected() {
    let chain = FakeChain::new(NET);
    let signer = ScriptedSigner::new(test_signer(NET));
    let (orchestrator, _rx, _) = setup(chain, signer);

    let legacy = SignerAccount::new("mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn");
    let err = orchestrator.create_market(&legacy, "Legacy").await.unwrap_err();
    assert!(matches!(err, Error::Address(_) | Error::InvalidInput(_)));
}

#[tokio::test]
async fn script_hash_account_is_rejected_before_signing() {
    let chain = FakeChain::new(NET);
    let signer = ScriptedSigner::new(test_signer(NET));
    let (orchestrator, _rx, _) = setup(chain, signer);

    let p2wsh = Address::p2wsh(&ScriptBuf::new(), NET.into_bitcoin()).to_string();
    let account = SignerAccount::new(p2wsh);
    let err = orchestrator.create_market(&account, "Multisig").await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(orchestrator.signer().calls(), 0);
    assert!(orchestrator.chain().requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_attempts_are_independent() {
    let chain = FakeChain::new(NET);
    let signer = ScriptedSigner::new(test_signer(NET));
    let (orchestrator, _rx, account) = setup(chain, signer);

    let (a, b) = tokio::join!(
        orchestrator.create_market(&account, "First"),
        orchestrator.create_market(&account, "Second"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.yes_txid, b.yes_txid);
    assert_ne!(a.no_txid, b.no_txid);
    assert_eq!(orchestrator.chain().broadcasts().len(), 4);
}

// ==================== Minting ====================

#[tokio::test(start_paused = true)]
async fn mint_sends_dust_to_the_account() {
    let chain = FakeChain::new(NET).with_txids(["txM1"]);
    let signer = ScriptedSigner::new(test_signer(NET));
    let (orchestrator, _rx, account) = setup(chain, signer);
    let contract: ContractId = "840000:12".parse().unwrap();

    let txid = orchestrator.mint(&account, contract).await.unwrap();
    assert_eq!(txid, "txM1");

    let requests = orchestrator.chain().requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].outputs.len(), 1);
    assert_eq!(requests[0].outputs[0].value, 546);
    assert!(matches!(
        &requests[0].message,
        OpReturnMessage::ContractCall { contract: c, call_type: CallType::Mint { .. } } if *c == contract
    ));
}

#[test]
fn default_delay_is_sixty_five_seconds() {
    assert_eq!(PROPAGATION_DELAY, Duration::from_secs(65));
    assert_eq!(OrchestratorConfig::default().propagation_delay, PROPAGATION_DELAY);
}
