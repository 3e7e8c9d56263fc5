//! Client lifecycle and the readiness gate

pub mod lifecycle;
pub mod readiness;

pub use lifecycle::{ClientManager, ClientState, InitOutcome};
pub use readiness::{route, LoadPhase, ReadinessGate, Route, WalletStatus};
