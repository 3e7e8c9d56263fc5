/*
    lifecycle.rs - Client Lifecycle Manager

    Owns the single live protocol client for the signed-in identity.

    State machine:

        Uninitialized ──probe──► Probing ──► NeedsSignature
                                   │    └──► Initializing ──► Ready
        NeedsSignature ──initialize──► Initializing ──► Ready
        any ──disconnect──► Disconnected          any ──close──► Closed

    Rules:
    - `initialize` is a no-op while a probe or initialization is running,
      and once ready for the same address
    - silent restore is decided by `ClientFactory::can_restore`, which never
      opens the exclusive storage handle
    - the current client is closed synchronously before any new client is
      built (address change, disconnect, drop)
*/

use crate::core_protocol::{ClientFactory, Installation, MessagingBackend, ProtocolError, Signer};
use crate::errors::{SyncError, SyncResult};
use crate::metrics;
use crate::model::Address;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    /// Checking whether local state can be restored without a signature
    Probing,
    /// A wallet signature is required to build the client
    NeedsSignature,
    Initializing,
    Ready,
    /// Torn down after a wallet disconnect or address change
    Disconnected,
    /// Terminal
    Closed,
}

impl ClientState {
    pub fn in_progress(&self) -> bool {
        matches!(self, ClientState::Probing | ClientState::Initializing)
    }
}

/// Non-error outcomes of [`ClientManager::initialize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Ready,
    /// Another probe or initialization is running; nothing was done
    InProgress,
    /// The user declined to sign; stays unauthenticated
    SignatureRejected,
}

struct Inner {
    state: ClientState,
    address: Option<Address>,
    client: Option<Arc<dyn MessagingBackend>>,
    /// Bumped on every teardown; a build that finishes under an older
    /// generation is discarded
    generation: u64,
}

pub struct ClientManager {
    factory: Arc<dyn ClientFactory>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ClientState>,
}

impl ClientManager {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        let (state_tx, _) = watch::channel(ClientState::Uninitialized);
        Self {
            factory,
            inner: Mutex::new(Inner {
                state: ClientState::Uninitialized,
                address: None,
                client: None,
                generation: 0,
            }),
            state_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, inner: &mut Inner, state: ClientState) {
        if inner.state != state {
            debug!(from = ?inner.state, to = ?state, "Client state change");
        }
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Close the live client, if any; returns whether one was closed
    fn teardown(&self, inner: &mut Inner) -> bool {
        inner.generation += 1;
        match inner.client.take() {
            Some(client) => {
                client.close();
                info!(address = ?inner.address.as_ref().map(Address::as_str), "Client closed");
                true
            }
            None => false,
        }
    }

    pub fn state(&self) -> ClientState {
        self.lock().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    pub fn address(&self) -> Option<Address> {
        self.lock().address.clone()
    }

    /// The live client, only while `Ready`
    pub fn client(&self) -> Option<Arc<dyn MessagingBackend>> {
        let inner = self.lock();
        match inner.state {
            ClientState::Ready => inner.client.clone(),
            _ => None,
        }
    }

    /// Begin work for `address`: tears down a client for another address and
    /// supersedes a build still running for one.
    /// Returns the build generation, or `None` if nothing should be done.
    fn begin(&self, address: &Address, next: ClientState) -> Result<Option<u64>, InitOutcome> {
        let mut inner = self.lock();
        if inner.state == ClientState::Closed {
            return Ok(None);
        }
        if inner.state.in_progress() {
            if inner.address.as_ref() == Some(address) {
                return Err(InitOutcome::InProgress);
            }
            // the pending build's generation goes stale and `finish` discards it
            info!(address = %address, "Superseding client build for another identity");
        }
        if inner.state == ClientState::Ready && inner.address.as_ref() == Some(address) {
            return Err(InitOutcome::Ready);
        }
        if inner.address.as_ref() != Some(address) {
            self.teardown(&mut inner);
        }
        inner.address = Some(address.clone());
        self.set_state(&mut inner, next);
        Ok(Some(inner.generation))
    }

    /// Install a freshly built client unless a teardown happened meanwhile
    fn finish(&self, generation: u64, result: Result<Arc<dyn MessagingBackend>, ProtocolError>) -> SyncResult<InitOutcome> {
        let mut inner = self.lock();
        if inner.generation != generation {
            if let Ok(client) = result {
                client.close();
            }
            debug!("Discarding client built for a superseded identity");
            return Err(SyncError::NotReady);
        }
        match result {
            Ok(client) => {
                inner.client = Some(client);
                self.set_state(&mut inner, ClientState::Ready);
                info!(address = ?inner.address.as_ref().map(Address::as_str), "Client ready");
                Ok(InitOutcome::Ready)
            }
            Err(ProtocolError::SignatureRejected) => {
                self.set_state(&mut inner, ClientState::NeedsSignature);
                info!("Signature rejected; staying signed out");
                Ok(InitOutcome::SignatureRejected)
            }
            Err(e) => {
                self.set_state(&mut inner, ClientState::NeedsSignature);
                metrics::increment(metrics::CLIENT_INIT_FAILURES);
                let err = SyncError::from(e);
                warn!(error = %err, "Client initialization failed");
                Err(err)
            }
        }
    }

    /// Restore silently if local state allows, otherwise ask for a signature
    ///
    /// Returns the resulting state: `Ready` or `NeedsSignature`.
    pub async fn probe(&self, address: &Address) -> SyncResult<ClientState> {
        let generation = match self.begin(address, ClientState::Probing) {
            Ok(Some(generation)) => generation,
            Ok(None) => return Ok(ClientState::Closed),
            Err(_) => return Ok(self.state()),
        };

        let restorable = match self.factory.can_restore(address).await {
            Ok(restorable) => restorable,
            Err(e) => {
                warn!(error = %e, "Restore probe failed; asking for a signature");
                false
            }
        };

        if !restorable {
            let mut inner = self.lock();
            if inner.generation == generation {
                self.set_state(&mut inner, ClientState::NeedsSignature);
            }
            return Ok(inner.state);
        }

        {
            let mut inner = self.lock();
            if inner.generation != generation {
                return Err(SyncError::NotReady);
            }
            self.set_state(&mut inner, ClientState::Initializing);
        }
        let result = self.factory.restore(address).await;
        self.finish(generation, result)?;
        Ok(self.state())
    }

    /// Build the client for `address`, requesting a signature
    pub async fn initialize(&self, address: &Address, signer: &dyn Signer) -> SyncResult<InitOutcome> {
        let generation = match self.begin(address, ClientState::Initializing) {
            Ok(Some(generation)) => generation,
            Ok(None) => return Err(SyncError::NotReady),
            Err(outcome) => return Ok(outcome),
        };
        info!(address = %address, "Initializing client");
        let result = self.factory.create(address, signer).await;
        self.finish(generation, result)
    }

    /// Wallet disconnected: tear the client down synchronously
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        if inner.state == ClientState::Closed {
            return;
        }
        self.teardown(&mut inner);
        inner.address = None;
        self.set_state(&mut inner, ClientState::Disconnected);
    }

    /// Terminal teardown
    pub fn close(&self) {
        let mut inner = self.lock();
        self.teardown(&mut inner);
        inner.address = None;
        self.set_state(&mut inner, ClientState::Closed);
    }

    pub async fn installations(&self, address: &Address) -> SyncResult<Vec<Installation>> {
        Ok(self.factory.installations(address).await?)
    }

    /// Revoke installations so a resource-limited identity can sign in again
    pub async fn revoke_installations(
        &self,
        address: &Address,
        installation_ids: &[String],
        signer: &dyn Signer,
    ) -> SyncResult<()> {
        self.factory
            .revoke_installations(address, installation_ids, signer)
            .await?;
        info!(address = %address, revoked = installation_ids.len(), "Installations revoked");
        Ok(())
    }
}

impl Drop for ClientManager {
    fn drop(&mut self) {
        let mut inner = self.lock();
        self.teardown(&mut inner);
    }
}
