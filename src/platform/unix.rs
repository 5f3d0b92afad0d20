//! Unix (Linux, macOS) elevation and signalling

use super::{Elevation, GroupKill, Launch, PlatformError};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{geteuid, Pid};
use std::ffi::OsString;

/// Whether this process already runs as root
pub fn is_root() -> bool {
    geteuid().is_root()
}

/// Send SIGTERM to process group `pgid`
///
/// A group that is already gone counts as success.
pub fn send_sigterm(pgid: u32) -> Result<(), PlatformError> {
    match signal_group(pgid, Signal::SIGTERM)? {
        GroupKill::Signalled | GroupKill::Gone => Ok(()),
        GroupKill::NotPermitted => Err(PlatformError::SignalError {
            pid: pgid,
            message: Errno::EPERM.to_string(),
        }),
    }
}

/// Send SIGKILL to process group `pgid`
pub fn kill_group(pgid: u32) -> Result<GroupKill, PlatformError> {
    signal_group(pgid, Signal::SIGKILL)
}

fn signal_group(pgid: u32, signal: Signal) -> Result<GroupKill, PlatformError> {
    let raw = i32::try_from(pgid).map_err(|_| PlatformError::SignalError {
        pid: pgid,
        message: "pid out of range".to_string(),
    })?;
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(GroupKill::Signalled),
        Err(Errno::ESRCH) => Ok(GroupKill::Gone),
        Err(Errno::EPERM) => Ok(GroupKill::NotPermitted),
        Err(e) => Err(PlatformError::SignalError {
            pid: pgid,
            message: e.to_string(),
        }),
    }
}

/// Runs the client through `sudo`
///
/// sudo resets the environment, so credential variables are listed in
/// `--preserve-env` explicitly. The client cannot prompt from its own process
/// group, so the launch is non-interactive and relies on `preflight` having
/// cached the user's credentials.
#[derive(Debug, Clone)]
pub struct SudoElevation {
    program: OsString,
}

impl SudoElevation {
    pub fn new() -> Self {
        Self {
            program: OsString::from("sudo"),
        }
    }
}

impl Default for SudoElevation {
    fn default() -> Self {
        Self::new()
    }
}

impl Elevation for SudoElevation {
    fn name(&self) -> &'static str {
        "sudo"
    }

    fn wrap(&self, launch: Launch, preserved_env: &[&str]) -> Launch {
        let mut args = Vec::with_capacity(launch.args.len() + 4);
        args.push(OsString::from("-n"));
        if !preserved_env.is_empty() {
            args.push(OsString::from(format!(
                "--preserve-env={}",
                preserved_env.join(",")
            )));
        }
        args.push(OsString::from("--"));
        args.push(launch.program);
        args.extend(launch.args);
        Launch::new(self.program.clone(), args)
    }

    fn preflight(&self) -> Option<Launch> {
        Some(Launch::new(self.program.clone(), vec!["-v".into()]))
    }

    fn privileged_kill(&self, pgid: u32) -> Option<Launch> {
        Some(Launch::new(
            self.program.clone(),
            vec![
                "-n".into(),
                "kill".into(),
                "-KILL".into(),
                "--".into(),
                format!("-{}", pgid).into(),
            ],
        ))
    }
}
