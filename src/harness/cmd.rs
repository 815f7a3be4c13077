// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Handles invoking external binaries.
// Binaries the harness depends on are looked up once in a fixed list of
// system directories rather than the PATH environment variable, which may
// not be set when tests run under init-like supervision. Load generators
// are invoked as caller-assembled commands and are not part of the
// required set.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Command,
    sync::LazyLock,
};

use crate::errors::{WbError, WbResult};

const BINARIES_PATHS: [&str; 4] = ["/usr/sbin", "/sbin", "/usr/bin", "/bin"];

/// Find the binary with the given name by looking in likely locations.
/// Return None if no binary was found.
fn find_binary(name: &str) -> Option<PathBuf> {
    BINARIES_PATHS
        .iter()
        .map(|pre| [pre, name].iter().collect::<PathBuf>())
        .find(|path| path.exists())
}

// These are the external binaries that the harness relies on.
const MKFS_XFS: &str = "mkfs.xfs";
const XFS_REPAIR: &str = "xfs_repair";
const UDEVADM: &str = "udevadm";
const DMESG: &str = "dmesg";

static BINARIES: LazyLock<HashMap<String, Option<PathBuf>>> = LazyLock::new(|| {
    [
        (MKFS_XFS.to_string(), find_binary(MKFS_XFS)),
        (XFS_REPAIR.to_string(), find_binary(XFS_REPAIR)),
        (UDEVADM.to_string(), find_binary(UDEVADM)),
        (DMESG.to_string(), find_binary(DMESG)),
    ]
    .into_iter()
    .collect()
});

/// Verify that all binaries that the harness might invoke are available at
/// some path. Return an error if any are missing. Required to be called on
/// harness initialization.
pub fn verify_binaries() -> WbResult<()> {
    let missing = BINARIES
        .iter()
        .filter(|(_, path)| path.is_none())
        .map(|(name, _)| name.to_owned())
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(WbError::Msg(format!(
            "executables not found: [{}]; looked in: [{}]",
            missing.join(", "),
            BINARIES_PATHS.join(", ")
        )))
    }
}

/// Invoke the specified command. Return an error if invoking the command
/// fails or if the command itself fails.
fn execute_cmd(cmd: &mut Command) -> WbResult<()> {
    match cmd.output() {
        Err(err) => Err(WbError::Msg(format!(
            "failed to execute command {cmd:?}: {err}"
        ))),
        Ok(output) => {
            if output.status.success() {
                Ok(())
            } else {
                Err(WbError::Command {
                    cmd: format!("{cmd:?}"),
                    output,
                })
            }
        }
    }
}

/// Get an absolute path for the executable with the given name.
/// Precondition: verify_binaries() has already been invoked.
fn get_executable(name: &str) -> &Path {
    BINARIES
        .get(name)
        .expect("name arguments are all constants defined with BINARIES, lookup can not fail")
        .as_ref()
        .expect("verify_binaries() was previously called and returned no error")
}

/// Run a caller-assembled command as a black box; used for external load
/// generators whose only contract is their exit status.
pub fn run(cmd: &mut Command) -> WbResult<()> {
    execute_cmd(cmd)
}

/// Create an XFS filesystem on devnode.
pub fn create_fs(devnode: &Path) -> WbResult<()> {
    execute_cmd(
        Command::new(get_executable(MKFS_XFS).as_os_str())
            .arg("-f")
            .arg("-q")
            .arg(devnode),
    )
}

/// Check the filesystem on devnode without modifying it.
pub fn xfs_repair(devnode: &Path) -> WbResult<()> {
    execute_cmd(
        Command::new(get_executable(XFS_REPAIR).as_os_str())
            .arg("-n")
            .arg(devnode),
    )
}

/// Call udevadm settle.
pub fn udev_settle() -> WbResult<()> {
    execute_cmd(Command::new(get_executable(UDEVADM).as_os_str()).arg("settle"))
}

/// Clear the kernel ring buffer before a run that provokes I/O errors, so
/// an operator reading dmesg afterwards sees only that run's complaints.
pub fn clear_kernel_log() -> WbResult<()> {
    execute_cmd(Command::new(get_executable(DMESG).as_os_str()).arg("-C"))
}

/// An fio invocation matching the original harness's mixed random workload;
/// runs in dir, which is expected to be a mount point.
pub fn fio_randrw(dir: &Path, size_mb: u64, runtime_secs: u64) -> Command {
    let mut cmd = Command::new("fio");
    cmd.arg("-name=test")
        .arg(format!("-size={size_mb}MB"))
        .arg("-direct=1")
        .arg("-rw=randrw")
        .arg(format!("-runtime={runtime_secs}"))
        .arg("-numjobs=4")
        .arg("-bs=4k")
        .current_dir(dir);
    cmd
}
