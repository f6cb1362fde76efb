//! Core of the Telegram auto-forwarder.
//!
//! Framework-agnostic: the controller bot and the user-account protocol live
//! behind ports (traits) implemented in adapter crates.

pub mod admin;
pub mod autoforward;
pub mod config;
pub mod context;
pub mod control;
pub mod credentials;
pub mod delay;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod forwarder;
pub mod lifecycle;
pub mod logging;
pub mod messaging;
pub mod protocol;
pub mod registry;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
