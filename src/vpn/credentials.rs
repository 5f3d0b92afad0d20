//! Transient credential handling for a single connection attempt
//!
//! Credentials are only ever held in memory. They reach the client process as
//! environment variables scoped to that child, never through argv where any user
//! could read them from the process list.

use secrecy::{ExposeSecret, SecretString};
use std::sync::Mutex;
use zeroize::Zeroize;

/// Child environment variable carrying the username
pub const USERNAME_VAR: &str = "OPENVPN_USERNAME";
/// Child environment variable carrying the password
pub const PASSWORD_VAR: &str = "OPENVPN_PASSWORD";

/// One environment variable destined for the client process
#[derive(Debug)]
pub struct EnvBinding {
    pub name: &'static str,
    pub value: SecretString,
}

impl EnvBinding {
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }
}

#[derive(Debug, Default)]
struct Credentials {
    username: Option<SecretString>,
    password: Option<SecretString>,
}

/// Trim `raw` into a secret, wiping the original buffer
fn into_secret(mut raw: String) -> Option<SecretString> {
    let trimmed = raw.trim();
    let secret = (!trimmed.is_empty()).then(|| SecretString::from(trimmed.to_owned()));
    raw.zeroize();
    secret
}

/// Holds at most one set of credentials until the launcher consumes them
#[derive(Debug, Default)]
pub struct CredentialBroker {
    slot: Mutex<Option<Credentials>>,
}

impl CredentialBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store credentials for the next connection attempt
    ///
    /// Values are trimmed; empty values count as not supplied. Replaces anything
    /// captured earlier.
    pub fn capture(&self, username: Option<String>, password: Option<String>) {
        let credentials = Credentials {
            username: username.and_then(into_secret),
            password: password.and_then(into_secret),
        };
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(credentials);
    }

    /// Whether credentials are waiting to be consumed
    pub fn is_loaded(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .is_some_and(|c| c.username.is_some() || c.password.is_some())
    }

    /// Take the captured credentials as environment bindings
    ///
    /// The broker is empty afterwards, so a second call yields nothing.
    pub fn consume_for_environment(&self) -> Vec<EnvBinding> {
        let taken = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        let Some(credentials) = taken else {
            return Vec::new();
        };

        let mut bindings = Vec::with_capacity(2);
        if let Some(value) = credentials.username {
            bindings.push(EnvBinding {
                name: USERNAME_VAR,
                value,
            });
        }
        if let Some(value) = credentials.password {
            bindings.push(EnvBinding {
                name: PASSWORD_VAR,
                value,
            });
        }
        bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(bindings: &[EnvBinding]) -> Vec<&'static str> {
        bindings.iter().map(|b| b.name).collect()
    }

    #[test]
    fn test_consume_yields_once() {
        let broker = CredentialBroker::new();
        broker.capture(Some("alice".into()), Some("hunter2".into()));
        assert!(broker.is_loaded());

        let first = broker.consume_for_environment();
        assert_eq!(names(&first), vec![USERNAME_VAR, PASSWORD_VAR]);
        assert_eq!(first[0].expose(), "alice");
        assert_eq!(first[1].expose(), "hunter2");

        assert!(!broker.is_loaded());
        assert!(broker.consume_for_environment().is_empty());
    }

    #[test]
    fn test_values_are_trimmed() {
        let broker = CredentialBroker::new();
        broker.capture(Some("  bob \n".into()), Some("\tpw ".into()));

        let bindings = broker.consume_for_environment();
        assert_eq!(bindings[0].expose(), "bob");
        assert_eq!(bindings[1].expose(), "pw");
    }

    #[test]
    fn test_empty_values_not_supplied() {
        let broker = CredentialBroker::new();
        broker.capture(Some("   ".into()), Some(String::new()));
        assert!(!broker.is_loaded());
        assert!(broker.consume_for_environment().is_empty());
    }

    #[test]
    fn test_partial_credentials() {
        let broker = CredentialBroker::new();
        broker.capture(Some("carol".into()), None);

        let bindings = broker.consume_for_environment();
        assert_eq!(names(&bindings), vec![USERNAME_VAR]);
    }

    #[test]
    fn test_capture_replaces_previous() {
        let broker = CredentialBroker::new();
        broker.capture(Some("old".into()), Some("old-pw".into()));
        broker.capture(Some("new".into()), None);

        let bindings = broker.consume_for_environment();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].expose(), "new");
    }

    #[test]
    fn test_debug_redacts_password() {
        let broker = CredentialBroker::new();
        broker.capture(Some("erin".into()), Some("s3cret-value".into()));
        let rendered = format!("{:?}", broker);
        assert!(!rendered.contains("s3cret-value"));

        let bindings = broker.consume_for_environment();
        let rendered = format!("{:?}", bindings);
        assert!(!rendered.contains("s3cret-value"));
    }
}
