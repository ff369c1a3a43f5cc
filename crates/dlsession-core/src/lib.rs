//! dlsession Core - single-resource download sessions
//!
//! This crate drives one HTTP(S) download from request to a complete file
//! on disk. It owns the session state machine, the destination writer and
//! a reqwest-backed transport, and talks to its presentation layer only
//! through the [`SessionHost`] and [`CredentialPrompt`] traits.

pub mod config;
mod error;
mod host;
mod session;
mod transport;
mod writer;

pub use config::SettingsStore;
pub use error::*;
pub use host::*;
pub use session::*;
pub use transport::*;
pub use writer::*;

pub use dlsession_types as types;
