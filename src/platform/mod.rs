//! Platform-specific implementations
//!
//! Covers the two things that differ per OS when supervising the client: how the
//! client obtains elevated privileges, and how a graceful stop is requested.

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

use crate::config::ElevationKind;
use std::ffi::OsString;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Elevation strategy not available on this platform: {0}")]
    ElevationUnavailable(&'static str),
    #[error("Failed to signal process {pid}: {message}")]
    SignalError { pid: u32, message: String },
    #[error("Graceful termination not supported on this platform")]
    GracefulStopUnsupported,
}

/// Program and arguments to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl Launch {
    pub fn new(program: impl Into<OsString>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn into_command(self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(self.program);
        command.args(self.args);
        command
    }
}

/// Rewrites a client launch so it runs with the privileges it needs
pub trait Elevation: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Wrap `launch`; variables named in `preserved_env` must reach the client
    fn wrap(&self, launch: Launch, preserved_env: &[&str]) -> Launch;

    /// Interactive step to run in the foreground before the client starts
    ///
    /// The client runs in its own process group and cannot prompt on the terminal.
    fn preflight(&self) -> Option<Launch> {
        None
    }

    /// Command that kills process group `pgid` with elevated privileges
    fn privileged_kill(&self, _pgid: u32) -> Option<Launch> {
        None
    }
}

/// Outcome of signalling a whole process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKill {
    /// At least one member received the signal
    Signalled,
    /// No process is left in the group
    Gone,
    /// Members remain but belong to another user
    NotPermitted,
}

/// Runs the client as-is (already privileged, or privileges granted elsewhere)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoElevation;

impl Elevation for NoElevation {
    fn name(&self) -> &'static str {
        "none"
    }

    fn wrap(&self, launch: Launch, _preserved_env: &[&str]) -> Launch {
        launch
    }
}

/// Pick the elevation strategy for this platform
pub fn get_elevation(kind: ElevationKind) -> Result<Box<dyn Elevation>, PlatformError> {
    match kind {
        ElevationKind::None => Ok(Box::new(NoElevation)),
        ElevationKind::Sudo => sudo(),
        ElevationKind::Auto => {
            #[cfg(unix)]
            {
                if unix::is_root() {
                    Ok(Box::new(NoElevation))
                } else {
                    sudo()
                }
            }

            #[cfg(not(unix))]
            {
                Ok(Box::new(NoElevation))
            }
        }
    }
}

fn sudo() -> Result<Box<dyn Elevation>, PlatformError> {
    #[cfg(unix)]
    {
        Ok(Box::new(unix::SudoElevation::new()))
    }

    #[cfg(not(unix))]
    {
        Err(PlatformError::ElevationUnavailable("sudo"))
    }
}

/// Ask the client in process group `pid` to shut down cleanly
///
/// Clients are spawned as group leaders, so the pid doubles as the group id.
pub fn request_termination(pid: u32) -> Result<(), PlatformError> {
    #[cfg(unix)]
    {
        unix::send_sigterm(pid)
    }

    #[cfg(windows)]
    {
        windows::request_termination(pid)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        Err(PlatformError::GracefulStopUnsupported)
    }
}

/// Forcefully kill every process left in group `pgid`
pub fn kill_process_group(pgid: u32) -> Result<GroupKill, PlatformError> {
    #[cfg(unix)]
    {
        unix::kill_group(pgid)
    }

    #[cfg(not(unix))]
    {
        // no process groups; killing the client is all there is
        let _ = pgid;
        Ok(GroupKill::Gone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openvpn_launch() -> Launch {
        Launch::new("openvpn", vec!["/opt/vyper/vpns/office.ovpn".into()])
    }

    #[test]
    fn test_platform_error_display() {
        let err = PlatformError::ElevationUnavailable("sudo");
        assert_eq!(
            err.to_string(),
            "Elevation strategy not available on this platform: sudo"
        );

        let err = PlatformError::SignalError {
            pid: 42,
            message: "EPERM".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to signal process 42: EPERM");
    }

    #[test]
    fn test_no_elevation_passes_through() {
        let launch = openvpn_launch();
        let wrapped = NoElevation.wrap(launch.clone(), &["OPENVPN_USERNAME"]);
        assert_eq!(wrapped, launch);
        assert!(NoElevation.preflight().is_none());
        assert!(NoElevation.privileged_kill(4242).is_none());
    }

    #[test]
    fn test_get_elevation_none() {
        let elevation = get_elevation(ElevationKind::None).unwrap();
        assert_eq!(elevation.name(), "none");
    }

    #[cfg(unix)]
    #[test]
    fn test_get_elevation_sudo() {
        let elevation = get_elevation(ElevationKind::Sudo).unwrap();
        assert_eq!(elevation.name(), "sudo");
    }

    #[cfg(unix)]
    #[test]
    fn test_get_elevation_auto_matches_euid() {
        let elevation = get_elevation(ElevationKind::Auto).unwrap();
        let expected = if unix::is_root() { "none" } else { "sudo" };
        assert_eq!(elevation.name(), expected);
    }
}
