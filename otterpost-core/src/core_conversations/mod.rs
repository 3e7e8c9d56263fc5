//! Conversation previews: the canonical store and the batched loader

pub mod loader;
pub mod store;

pub use loader::{load_all, preview_one, LoadedConversations};
pub use store::{ConversationStore, Upsert};
