//! Windows process control
//!
//! Console clients have no SIGTERM equivalent that can be delivered to a process
//! we do not share a console with, so the supervisor goes straight to a forceful
//! kill. Elevation comes from running Vyper itself as Administrator.

use super::PlatformError;

pub fn request_termination(_pid: u32) -> Result<(), PlatformError> {
    Err(PlatformError::GracefulStopUnsupported)
}
