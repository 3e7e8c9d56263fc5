//! Readiness gate
//!
//! Routing and authentication decisions wait until wallet status, client
//! state and the session's load phase have all settled. Any indeterminate
//! input yields [`Route::Pending`], as does a client that still belongs to a
//! different address than the connected wallet.

use super::lifecycle::ClientState;
use crate::model::Address;

/// Wallet connection as reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletStatus {
    /// Still reconnecting after startup
    Connecting,
    Disconnected,
    Connected(Address),
}

/// Progress of the session's initial conversation load
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadPhase {
    #[default]
    Idle,
    Loading,
    Loaded,
    /// Load failed; `reload` retries
    Error(String),
}

impl LoadPhase {
    pub fn is_settled(&self) -> bool {
        matches!(self, LoadPhase::Loaded | LoadPhase::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Pending,
    SignedOut,
    NeedsSignature,
    Ready,
}

/// Combine the inputs into one routing decision
///
/// `client_address` is the identity the client was last built or probed
/// for. A client bound to another address is about to be replaced.
pub fn route(
    wallet: &WalletStatus,
    client: ClientState,
    client_address: Option<&Address>,
    phase: &LoadPhase,
) -> Route {
    match wallet {
        WalletStatus::Connecting => Route::Pending,
        WalletStatus::Disconnected => Route::SignedOut,
        WalletStatus::Connected(wallet_address) => match client {
            ClientState::Closed => Route::SignedOut,
            _ if client_address.is_some_and(|a| a != wallet_address) => Route::Pending,
            ClientState::NeedsSignature => Route::NeedsSignature,
            ClientState::Ready if phase.is_settled() => Route::Ready,
            ClientState::Ready
            | ClientState::Uninitialized
            | ClientState::Probing
            | ClientState::Initializing
            | ClientState::Disconnected => Route::Pending,
        },
    }
}

/// Holder for the latest value of each input
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    wallet: WalletStatus,
    client: ClientState,
    client_address: Option<Address>,
    phase: LoadPhase,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self {
            wallet: WalletStatus::Connecting,
            client: ClientState::Uninitialized,
            client_address: None,
            phase: LoadPhase::Idle,
        }
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_wallet(&mut self, wallet: WalletStatus) -> Route {
        self.wallet = wallet;
        self.route()
    }

    pub fn set_client(&mut self, client: ClientState, address: Option<Address>) -> Route {
        self.client = client;
        self.client_address = address;
        self.route()
    }

    pub fn set_phase(&mut self, phase: LoadPhase) -> Route {
        self.phase = phase;
        self.route()
    }

    pub fn route(&self) -> Route {
        route(&self.wallet, self.client, self.client_address.as_ref(), &self.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(n: u64) -> Address {
        Address::from_network(format!("0x{:040x}", n))
    }

    fn connected() -> WalletStatus {
        WalletStatus::Connected(address(1))
    }

    #[test]
    fn test_pending_until_every_input_settles() {
        let mut gate = ReadinessGate::new();
        assert_eq!(gate.route(), Route::Pending);
        assert_eq!(gate.set_wallet(connected()), Route::Pending);
        assert_eq!(gate.set_client(ClientState::Probing, Some(address(1))), Route::Pending);
        assert_eq!(gate.set_client(ClientState::Ready, Some(address(1))), Route::Pending);
        assert_eq!(gate.set_phase(LoadPhase::Loading), Route::Pending);
        assert_eq!(gate.set_phase(LoadPhase::Loaded), Route::Ready);
    }

    #[test]
    fn test_load_error_still_routes_in() {
        let phase = LoadPhase::Error("timeout".to_string());
        assert_eq!(route(&connected(), ClientState::Ready, None, &phase), Route::Ready);
    }

    #[test]
    fn test_signed_out_and_signature_routes() {
        assert_eq!(
            route(&WalletStatus::Disconnected, ClientState::Ready, None, &LoadPhase::Loaded),
            Route::SignedOut
        );
        assert_eq!(
            route(&connected(), ClientState::NeedsSignature, None, &LoadPhase::Idle),
            Route::NeedsSignature
        );
        assert_eq!(route(&connected(), ClientState::Closed, None, &LoadPhase::Idle), Route::SignedOut);
    }

    #[test]
    fn test_client_for_other_address_is_pending() {
        let other = address(2);
        assert_eq!(
            route(&connected(), ClientState::Ready, Some(&other), &LoadPhase::Loaded),
            Route::Pending
        );
        assert_eq!(
            route(&connected(), ClientState::NeedsSignature, Some(&other), &LoadPhase::Idle),
            Route::Pending
        );
        assert_eq!(
            route(&connected(), ClientState::Ready, Some(&address(1)), &LoadPhase::Loaded),
            Route::Ready
        );

        let mut gate = ReadinessGate::new();
        gate.set_wallet(connected());
        gate.set_phase(LoadPhase::Loaded);
        assert_eq!(gate.set_client(ClientState::Ready, Some(other)), Route::Pending);
        assert_eq!(gate.set_client(ClientState::Ready, Some(address(1))), Route::Ready);
    }
}
