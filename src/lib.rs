//! Vyper - VPN tunnel launcher
//!
//! Vyper keeps a small store of OpenVPN profiles and runs the system OpenVPN
//! client against one of them at a time, with optional per-session credentials
//! and privilege escalation.
//!
//! # Architecture
//!
//! - `config`: Settings file handling (TOML): appearance and client launch options
//! - `vpn`: Profile store and transient credentials
//! - `platform`: Privilege elevation and process signalling per OS
//! - `supervisor`: Client process supervision and the connection state machine
//!
//! # Usage
//!
//! ```bash
//! vyper import ~/Downloads/office.ovpn
//! vyper connect office.ovpn -u alice --ask-password
//! ```

pub mod config;
pub mod platform;
pub mod supervisor;
pub mod vpn;

pub use config::{ConfigStore, Settings};
pub use supervisor::{ConnectionState, ConnectionSupervisor, SupervisorError, SupervisorOptions};
pub use vpn::{CredentialBroker, Profile, ProfileStore};
