//! Official-account webhook that relays triggered text messages to a
//! chat-completion API, with duplicate-delivery suppression and a small
//! persisted counter API.

pub mod cache;
pub mod config;
pub mod counter;
pub mod gateway;
pub mod observability;
pub mod providers;
pub mod security;
