//! Inbox id → chain address resolution

pub mod resolver;

pub use resolver::IdentityResolver;
