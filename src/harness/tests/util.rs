// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{thread::sleep, time::Duration};

use nix::mount::{umount2, MntFlags};

use devicemapper::{DevId, DmOptions};

use crate::{
    errors::{WbError, WbResult},
    harness::{
        cmd::{udev_settle, verify_binaries},
        dm::{get_dm, get_dm_init},
        names::HARNESS_DM_PREFIX,
    },
};

/// Names of all harness-owned DM devices currently mapped.
pub fn harness_device_names() -> WbResult<Vec<String>> {
    Ok(get_dm_init()?
        .list_devices()?
        .iter()
        .map(|d| d.0.to_string())
        .filter(|n| n.starts_with(HARNESS_DM_PREFIX))
        .collect())
}

/// Attempt to remove all device mapper devices which match the harness
/// naming convention.
fn harness_devices_remove() -> WbResult<()> {
    /// One iteration of removing devicemapper devices
    fn one_iteration() -> WbResult<(bool, Vec<String>)> {
        let mut progress_made = false;
        let mut remain = Vec::new();

        for d in get_dm_init()?
            .list_devices()?
            .iter()
            .filter(|d| d.0.to_string().starts_with(HARNESS_DM_PREFIX))
        {
            match get_dm().device_remove(&DevId::Name(&d.0), DmOptions::default()) {
                Ok(_) => progress_made = true,
                Err(_) => remain.push(d.0.to_string()),
            }
        }

        // Suspended or referenced devices may need a moment; retry if no
        // progress was made at all.
        if !remain.is_empty() && !progress_made {
            sleep(Duration::from_secs(1));
        }

        Ok((progress_made, remain))
    }

    let mut result = one_iteration()?;
    let mut attempts = 0;
    while result.0 || (!result.1.is_empty() && attempts < 3) {
        attempts = if result.0 { 0 } else { attempts + 1 };
        result = one_iteration()?;
    }

    if result.1.is_empty() {
        Ok(())
    } else {
        Err(WbError::Msg(format!(
            "some harness DM devices remaining: {:?}",
            result.1
        )))
    }
}

/// Try and un-mount any filesystems whose mount point carries the harness
/// prefix, returning immediately on the first one we are unable to unmount.
fn harness_filesystems_unmount() -> WbResult<()> {
    let mountinfo = procfs::process::Process::myself()
        .and_then(|p| p.mountinfo())
        .map_err(|err| WbError::Msg(format!("failed to read mountinfo: {err}")))?;

    for mount in mountinfo
        .into_iter()
        .filter(|m| m.mount_point.to_string_lossy().contains("wbtest"))
    {
        umount2(&mount.mount_point, MntFlags::MNT_DETACH)?;
    }

    Ok(())
}

/// When a unit test panics it can leave the system in an inconsistent
/// state. This function tries to clean up by un-mounting any mounted file
/// systems which contain the string "wbtest" and then removing any device
/// mapper devices the harness created.
pub fn clean_up() -> WbResult<()> {
    if verify_binaries().is_ok() {
        if let Err(err) = udev_settle() {
            debug!("udev settle before cleanup failed: {err}");
        }
    }
    harness_filesystems_unmount()?;
    harness_devices_remove()
}
