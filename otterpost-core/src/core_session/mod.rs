//! Session: the event loop that owns every store for a signed-in client,
//! plus the [`Engine`] that binds sessions to the client lifecycle.

pub mod engine;
pub mod events;
pub mod handle;
pub mod session;
pub mod subscription;
pub mod token;

pub use engine::Engine;
pub use events::{EventBroadcaster, SessionEvent};
pub use handle::{FocusedContact, SessionCommand, SessionHandle};
pub use session::{Session, SessionContext};
pub use subscription::{StreamKind, Subscription, SubscriptionSet};
pub use token::RequestGate;
