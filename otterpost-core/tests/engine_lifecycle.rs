/*
    Engine Lifecycle Tests

    Client lifecycle plus session binding against the in-memory factory:
    - silent restore vs. signature-required sign-in
    - rejected signatures stay signed out
    - identity switch stops the old session before the old client closes
    - routing waits for the initial load
*/

use std::sync::Arc;

use otterpost_core::config::Config;
use otterpost_core::core_client::{ClientState, InitOutcome, Route, WalletStatus};
use otterpost_core::core_protocol::memory::{InMemoryFactory, InMemoryNetwork, StaticSigner};
use otterpost_core::core_reputation::StaticReputationSource;
use otterpost_core::core_unread::MemoryKvStore;
use otterpost_core::model::ConsentState;
use otterpost_core::test_utils::{eventually, test_address, DEFAULT_TEST_TIMEOUT};
use otterpost_core::Engine;

fn engine_on(network: &InMemoryNetwork) -> Engine {
    Engine::new(
        Arc::new(InMemoryFactory::new(network.clone())),
        Arc::new(StaticReputationSource::new()),
        Arc::new(MemoryKvStore::new()),
        Config::default(),
    )
}

async fn wait_ready(engine: &Engine, wallet: &WalletStatus) -> bool {
    eventually(DEFAULT_TEST_TIMEOUT, || async { engine.route(wallet).await == Route::Ready }).await
}

#[tokio::test]
async fn test_first_sign_in_needs_signature() {
    let network = InMemoryNetwork::new();
    let me = test_address(1);
    let mut engine = engine_on(&network);

    assert_eq!(engine.resume(&me).await.unwrap(), ClientState::NeedsSignature);
    assert!(engine.session().is_none());
    assert_eq!(
        engine.route(&WalletStatus::Connected(me.clone())).await,
        Route::NeedsSignature
    );

    let outcome = engine.sign_in(&me, &StaticSigner::approving(me.clone())).await.unwrap();
    assert_eq!(outcome, InitOutcome::Ready);
    assert_eq!(engine.client_state(), ClientState::Ready);
    assert_eq!(engine.address(), Some(&me));
    assert!(network.has_open_handle(&me));
    assert!(wait_ready(&engine, &WalletStatus::Connected(me.clone())).await);
}

#[tokio::test]
async fn test_rejected_signature_starts_nothing() {
    let network = InMemoryNetwork::new();
    let me = test_address(1);
    let mut engine = engine_on(&network);

    let outcome = engine.sign_in(&me, &StaticSigner::rejecting(me.clone())).await.unwrap();
    assert_eq!(outcome, InitOutcome::SignatureRejected);
    assert_eq!(engine.client_state(), ClientState::NeedsSignature);
    assert!(engine.session().is_none());
    assert!(!network.has_open_handle(&me));
}

#[tokio::test]
async fn test_resume_restores_without_signature_after_disconnect() {
    let network = InMemoryNetwork::new();
    let me = test_address(1);
    let mut engine = engine_on(&network);
    engine.sign_in(&me, &StaticSigner::approving(me.clone())).await.unwrap();
    let first = engine.session().cloned().unwrap();

    engine.disconnect().await;
    assert!(!first.is_running());
    assert_eq!(engine.client_state(), ClientState::Disconnected);
    assert!(!network.has_open_handle(&me));
    assert_eq!(engine.route(&WalletStatus::Disconnected).await, Route::SignedOut);

    assert_eq!(engine.resume(&me).await.unwrap(), ClientState::Ready);
    assert!(engine.session().is_some_and(|s| s.is_running()));
    assert!(wait_ready(&engine, &WalletStatus::Connected(me.clone())).await);
}

#[tokio::test]
async fn test_resume_for_running_identity_keeps_session() {
    let network = InMemoryNetwork::new();
    let me = test_address(1);
    let mut engine = engine_on(&network);
    engine.sign_in(&me, &StaticSigner::approving(me.clone())).await.unwrap();
    let first = engine.session().cloned().unwrap();

    assert_eq!(engine.resume(&me).await.unwrap(), ClientState::Ready);
    assert!(first.is_running());
}

#[tokio::test]
async fn test_identity_switch_replaces_session_and_client() {
    let network = InMemoryNetwork::new();
    let alice = test_address(1);
    let bob = test_address(2);
    let mut engine = engine_on(&network);

    engine.sign_in(&alice, &StaticSigner::approving(alice.clone())).await.unwrap();
    let alice_session = engine.session().cloned().unwrap();
    assert!(wait_ready(&engine, &WalletStatus::Connected(alice.clone())).await);

    let outcome = engine.sign_in(&bob, &StaticSigner::approving(bob.clone())).await.unwrap();
    assert_eq!(outcome, InitOutcome::Ready);
    assert!(!alice_session.is_running());
    assert!(!network.has_open_handle(&alice));
    assert!(network.has_open_handle(&bob));
    assert_eq!(engine.address(), Some(&bob));

    // the new session sees bob's conversations only
    let bob_inbox = network.inbox_of(&bob).unwrap();
    let carol_inbox = network.register(&test_address(3));
    let dm = network.create_dm(&carol_inbox, &bob_inbox);
    let bob_session = engine.session().cloned().unwrap();
    let arrived = eventually(DEFAULT_TEST_TIMEOUT, || async {
        bob_session
            .conversations(ConsentState::Unknown)
            .await
            .map(|list| list.iter().any(|c| c.id == dm))
            .unwrap_or(false)
    })
    .await;
    assert!(arrived);
}

#[tokio::test]
async fn test_shutdown_is_terminal() {
    let network = InMemoryNetwork::new();
    let me = test_address(1);
    let mut engine = engine_on(&network);
    engine.sign_in(&me, &StaticSigner::approving(me.clone())).await.unwrap();
    let session = engine.session().cloned().unwrap();

    engine.shutdown().await;
    assert!(!session.is_running());
    assert!(engine.session().is_none());
    assert_eq!(engine.client_state(), ClientState::Closed);
    assert!(!network.has_open_handle(&me));
    assert_eq!(engine.route(&WalletStatus::Connected(me.clone())).await, Route::SignedOut);

    // nothing restarts a closed engine
    assert_eq!(engine.resume(&me).await.unwrap(), ClientState::Closed);
    assert!(engine.session().is_none());
}

#[tokio::test]
async fn test_route_pending_while_wallet_reconnects() {
    let network = InMemoryNetwork::new();
    let engine = engine_on(&network);
    assert_eq!(engine.route(&WalletStatus::Connecting).await, Route::Pending);
    assert_eq!(engine.route(&WalletStatus::Disconnected).await, Route::SignedOut);
}

#[tokio::test]
async fn test_route_pending_when_wallet_switches_before_client() {
    let network = InMemoryNetwork::new();
    let alice = test_address(1);
    let bob = test_address(2);
    let mut engine = engine_on(&network);
    engine.sign_in(&alice, &StaticSigner::approving(alice.clone())).await.unwrap();
    assert!(wait_ready(&engine, &WalletStatus::Connected(alice.clone())).await);

    // wallet already reports bob while alice's client is still up
    assert_eq!(engine.route(&WalletStatus::Connected(bob.clone())).await, Route::Pending);

    engine.sign_in(&bob, &StaticSigner::approving(bob.clone())).await.unwrap();
    assert!(wait_ready(&engine, &WalletStatus::Connected(bob)).await);
}
