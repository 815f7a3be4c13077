// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, fmt, io, process::Output};

pub type WbResult<T> = Result<T, WbError>;

/// Classification of failures raised by the harness itself, as opposed to
/// errors converted from collaborating crates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorEnum {
    /// The control plane rejected a device mapping.
    Map,
    /// Misuse of the pause/resume/reload protocol.
    InvalidState,
    /// A control message was rejected by its target.
    Control,
    /// A device could not be released because references remain.
    Busy,
    /// A volume request exceeded the physical device's capacity.
    InsufficientSpace,
    /// The cache layer could not be brought to a synchronized state.
    Quiesce,
    /// A wait on a paced transition or an explicit deadline expired.
    Timeout,
    /// A verification step observed state that contradicts expectations.
    Assertion,
}

#[derive(Debug)]
pub enum WbError {
    Msg(String),
    Harness(ErrorEnum, String),
    Command { cmd: String, output: Output },
    Dm(devicemapper::DmError),
    Io(io::Error),
    Nix(nix::Error),
}

impl WbError {
    /// The harness classification of this error, if it has one.
    pub fn kind(&self) -> Option<ErrorEnum> {
        match *self {
            WbError::Harness(kind, _) => Some(kind),
            _ => None,
        }
    }
}

impl fmt::Display for WbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            WbError::Msg(ref msg) => write!(f, "Error: {msg}"),
            WbError::Harness(kind, ref msg) => write!(f, "Harness error ({kind:?}): {msg}"),
            WbError::Command {
                ref cmd,
                ref output,
            } => {
                write!(
                    f,
                    "Command {} failed with status {}; stderr: {}",
                    cmd,
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                )
            }
            WbError::Dm(ref err) => write!(f, "DM error: {err}"),
            WbError::Io(ref err) => write!(f, "IO error: {err}"),
            WbError::Nix(ref err) => write!(f, "Nix error: {err}"),
        }
    }
}

impl Error for WbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            WbError::Msg(_) | WbError::Harness(_, _) | WbError::Command { .. } => None,
            WbError::Dm(ref err) => Some(err),
            WbError::Io(ref err) => Some(err),
            WbError::Nix(ref err) => Some(err),
        }
    }
}

impl From<devicemapper::DmError> for WbError {
    fn from(err: devicemapper::DmError) -> WbError {
        WbError::Dm(err)
    }
}

impl From<io::Error> for WbError {
    fn from(err: io::Error) -> WbError {
        WbError::Io(err)
    }
}

impl From<nix::Error> for WbError {
    fn from(err: nix::Error) -> WbError {
        WbError::Nix(err)
    }
}
