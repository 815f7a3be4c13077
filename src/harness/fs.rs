// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scoped filesystem mounts over harness devices.
//!
//! [`with_mount`] is the ordinary form: mount, run the body, run the
//! caller's pre-unmount hook, unmount, on every exit path. [`Mount`] is the
//! lower-level guard for scenarios that interleave other teardown between
//! the body and the unmount; its drop unmounts as a backstop but an
//! explicit [`Mount::unmount`] is how errors are surfaced.

use std::{
    fs::{create_dir_all, remove_dir},
    io::ErrorKind as IoErrorKind,
    path::{Path, PathBuf},
};

use nix::mount::{mount, umount, MsFlags};
use retry::{delay::Fixed, retry_with_index};

use crate::{
    errors::{ErrorEnum, WbError, WbResult},
    harness::guard::bracket,
};

/// A hook run after the body but before the unmount, on every exit path.
/// The last chance to quiesce or unwrap fault injection while the
/// filesystem is still mounted.
pub type PreUnmount<'a> = Option<Box<dyn FnOnce() -> WbResult<()> + 'a>>;

/// An XFS filesystem mounted at a mount point, unmounted when dropped.
#[derive(Debug)]
pub struct Mount {
    mount_pt: PathBuf,
    mounted: bool,
}

impl Mount {
    /// Mount the filesystem on devnode at mount_pt, creating the mount
    /// point if necessary.
    pub fn new(devnode: &Path, mount_pt: &Path) -> WbResult<Mount> {
        if let Err(err) = create_dir_all(mount_pt) {
            if err.kind() != IoErrorKind::AlreadyExists {
                return Err(From::from(err));
            }
        }

        mount(
            Some(devnode),
            mount_pt,
            Some("xfs"),
            MsFlags::empty(),
            None as Option<&str>,
        )?;

        debug!("mounted {} at {}", devnode.display(), mount_pt.display());
        Ok(Mount {
            mount_pt: mount_pt.to_owned(),
            mounted: true,
        })
    }

    pub fn mount_pt(&self) -> &Path {
        &self.mount_pt
    }

    fn unmount_retrying(&mut self) -> WbResult<()> {
        let result = retry_with_index(Fixed::from_millis(100).take(2), |i| {
            trace!("unmount attempt {} for {}", i, self.mount_pt.display());
            umount(&self.mount_pt)
        });
        result.map_err(|err| {
            WbError::Harness(
                ErrorEnum::Busy,
                format!("failed to unmount {}: {err}", self.mount_pt.display()),
            )
        })?;
        self.mounted = false;
        if let Err(err) = remove_dir(&self.mount_pt) {
            warn!(
                "could not remove mount point {}: {err}",
                self.mount_pt.display()
            );
        }
        Ok(())
    }

    /// Unmount now, surfacing any failure; the drop backstop becomes a
    /// no-op.
    pub fn unmount(mut self) -> WbResult<()> {
        self.unmount_retrying()
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        if let Err(err) = self.unmount_retrying() {
            warn!("unmount during unwind failed: {err}");
        }
    }
}

/// Mount the filesystem on devnode at mount_pt, run the body, and on all
/// exit paths run the pre-unmount hook and then unmount.
///
/// The body's error takes precedence over hook and unmount errors; a hook
/// or unmount failure after a successful body surfaces to the caller.
pub fn with_mount<T, B>(
    devnode: &Path,
    mount_pt: &Path,
    pre_unmount: PreUnmount<'_>,
    body: B,
) -> WbResult<T>
where
    B: FnOnce(&Path) -> WbResult<T>,
{
    let mnt = Mount::new(devnode, mount_pt)?;
    bracket(
        (mnt, pre_unmount),
        |(mnt, pre_unmount)| {
            let hook_result = match pre_unmount {
                Some(hook) => hook(),
                None => Ok(()),
            };
            match (hook_result, mnt.unmount()) {
                (Ok(()), Ok(())) => Ok(()),
                (Ok(()), Err(err)) => Err(err),
                (Err(err), Ok(())) => Err(err),
                (Err(err), Err(umount_err)) => {
                    warn!("unmount also failed after a failed pre-unmount hook: {umount_err}");
                    Err(err)
                }
            }
        },
        |(mnt, _)| body(mnt.mount_pt()),
    )
}
