//! Engine
//!
//! Top-level owner for a host application: one [`ClientManager`] plus at
//! most one running session bound to the ready client.
//!
//! Ordering on every identity change:
//!
//! 1. stop the session (streams unsubscribed, background work aborted)
//! 2. close the old client (storage handle released)
//! 3. build the client for the new identity
//! 4. start a fresh session
//!
//! Steps 2 and 3 live in [`ClientManager`]; the engine guarantees step 1
//! happens before either.

use super::handle::SessionHandle;
use super::session::{Session, SessionContext};
use crate::config::Config;
use crate::core_client::{route, ClientManager, ClientState, InitOutcome, LoadPhase, Route, WalletStatus};
use crate::core_protocol::{ClientFactory, Signer};
use crate::core_reputation::ReputationSource;
use crate::core_unread::KeyValueStore;
use crate::errors::{SyncError, SyncResult};
use crate::model::Address;
use crate::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct RunningSession {
    address: Address,
    handle: SessionHandle,
    task: JoinHandle<()>,
}

pub struct Engine {
    clients: Arc<ClientManager>,
    reputation: Arc<dyn ReputationSource>,
    store: Arc<dyn KeyValueStore>,
    config: Config,
    session: Option<RunningSession>,
}

impl Engine {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        reputation: Arc<dyn ReputationSource>,
        store: Arc<dyn KeyValueStore>,
        config: Config,
    ) -> Self {
        Self {
            clients: Arc::new(ClientManager::new(factory)),
            reputation,
            store,
            config,
            session: None,
        }
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn client_state(&self) -> ClientState {
        self.clients.state()
    }

    /// Handle to the running session, if a client is ready
    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref().map(|s| &s.handle)
    }

    pub fn address(&self) -> Option<&Address> {
        self.session.as_ref().map(|s| &s.address)
    }

    /// Try a silent restore for `address`; starts the session when it works
    ///
    /// Returns `NeedsSignature` when the host must call [`Engine::sign_in`].
    pub async fn resume(&mut self, address: &Address) -> SyncResult<ClientState> {
        self.stop_other_session(address).await;
        let state = self.clients.probe(address).await?;
        if state == ClientState::Ready {
            self.start_session(address)?;
        }
        Ok(state)
    }

    /// Build the client with a wallet signature; starts the session on success
    pub async fn sign_in(&mut self, address: &Address, signer: &dyn Signer) -> SyncResult<InitOutcome> {
        self.stop_other_session(address).await;
        let outcome = self.clients.initialize(address, signer).await?;
        if outcome == InitOutcome::Ready {
            self.start_session(address)?;
        }
        Ok(outcome)
    }

    /// Wallet disconnected
    pub async fn disconnect(&mut self) {
        self.stop_session().await;
        self.clients.disconnect();
    }

    /// Terminal shutdown
    pub async fn shutdown(&mut self) {
        self.stop_session().await;
        self.clients.close();
        info!("Engine shut down");
    }

    /// Block until the coordinator signals, then shut down
    pub async fn run_until_shutdown(&mut self, coordinator: &ShutdownCoordinator) {
        let signal = coordinator.wait_for_shutdown().await;
        info!(signal = ?signal, "Shutdown requested");
        self.shutdown().await;
        coordinator.complete().await;
    }

    /// Routing decision for the host UI
    pub async fn route(&self, wallet: &WalletStatus) -> Route {
        let phase = match self.session() {
            Some(handle) => handle.load_phase().await.unwrap_or_default(),
            None => LoadPhase::Idle,
        };
        route(wallet, self.clients.state(), self.clients.address().as_ref(), &phase)
    }

    fn start_session(&mut self, address: &Address) -> SyncResult<()> {
        if self
            .session
            .as_ref()
            .is_some_and(|s| &s.address == address && s.handle.is_running())
        {
            debug!(address = %address, "Session already running");
            return Ok(());
        }
        let backend = self.clients.client().ok_or(SyncError::NotReady)?;
        let context = SessionContext::new(backend, self.reputation.clone(), self.store.clone())
            .with_config(&self.config);
        let (handle, task) = Session::spawn(context);
        self.session = Some(RunningSession { address: address.clone(), handle, task });
        Ok(())
    }

    async fn stop_other_session(&mut self, address: &Address) {
        if self.session.as_ref().is_some_and(|s| &s.address != address) {
            self.stop_session().await;
        }
    }

    async fn stop_session(&mut self) {
        let Some(running) = self.session.take() else {
            return;
        };
        if let Err(e) = running.handle.shutdown().await {
            debug!(error = %e, "Session already stopped");
        }
        if let Err(e) = running.task.await {
            warn!(error = %e, "Session task ended abnormally");
        }
        info!(address = %running.address, "Session stopped for identity change");
    }
}
