//! Profile storage and per-session credentials

pub mod credentials;
pub mod profiles;

pub use credentials::{CredentialBroker, EnvBinding};
pub use profiles::{Profile, ProfileImportError, ProfileStore};
