//! Connection states and the notifications published on every transition

use std::fmt;

/// Why a connection attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Client exited with a nonzero status
    ExitCode(i32),
    /// Client was killed by a signal before reporting a status
    Signalled,
    /// Client could not be started
    Spawn(String),
    /// Waiting on the client failed
    Wait(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExitCode(code) => write!(f, "exit code {}", code),
            FailureReason::Signalled => f.write_str("terminated by signal"),
            FailureReason::Spawn(message) => write!(f, "spawn failed: {}", message),
            FailureReason::Wait(message) => write!(f, "wait failed: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Transient: always followed by `Disconnected`
    Failed(FailureReason),
}

impl ConnectionState {
    /// Resting states are the only ones a settled supervisor can sit in
    pub fn is_resting(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Connected)
    }

    /// A tunnel is starting, up, or being torn down
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("Disconnected"),
            ConnectionState::Connecting => f.write_str("Connecting"),
            ConnectionState::Connected => f.write_str("Connected"),
            ConnectionState::Disconnecting => f.write_str("Disconnecting"),
            ConnectionState::Failed(reason) => write!(f, "Failed ({})", reason),
        }
    }
}

/// Delivered to observers once per transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub state: ConnectionState,
    /// Tail of the client's output, attached to failures
    pub diagnostic: Option<String>,
}
