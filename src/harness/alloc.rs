// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Planning of named extents on a physical device.
//!
//! Allocation hands out non-overlapping extents in request order starting at
//! offset 0. It is a planning step only; no virtual device is created until
//! the stack maps a table over a volume. A physical device must not be
//! shared between concurrently active stacks; nothing here locks it.

use std::{
    fs::File,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

use nix::ioctl_read;

use devicemapper::{devnode_to_devno, Bytes, Device, Sectors};

use crate::errors::{ErrorEnum, WbError, WbResult};

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Size of the block device open on `file`.
pub fn blkdev_size(file: &File) -> WbResult<Bytes> {
    let mut val: u64 = 0;

    match unsafe { blkgetsize64(file.as_raw_fd(), &mut val) } {
        Err(x) => Err(WbError::Nix(x)),
        Ok(_) => Ok(Bytes::from(val)),
    }
}

/// A named extent of a physical device. Immutable once allocated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    name: String,
    /// Device number of the owning physical device.
    pub device: Device,
    /// Device node of the owning physical device.
    pub devnode: PathBuf,
    /// First sector of the extent.
    pub start: Sectors,
    /// Length of the extent in sectors.
    pub length: Sectors,
}

impl Volume {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Allocates named volumes from one physical device.
#[derive(Debug)]
pub struct VolumeMgr {
    devnode: PathBuf,
    device: Device,
    capacity: Sectors,
    next: Sectors,
    volumes: Vec<Volume>,
}

impl VolumeMgr {
    /// Set up an allocator over the physical device at devnode, reading its
    /// capacity from the kernel.
    pub fn new(devnode: &Path) -> WbResult<VolumeMgr> {
        let devno = devnode_to_devno(devnode)?.ok_or_else(|| {
            WbError::Msg(format!(
                "path {} does not refer to a block device",
                devnode.display()
            ))
        })?;
        let capacity = blkdev_size(&File::open(devnode)?)?.sectors();
        Ok(VolumeMgr {
            devnode: devnode.to_owned(),
            device: Device::from(devno),
            capacity,
            next: Sectors(0),
            volumes: Vec::new(),
        })
    }

    /// An allocator with a caller-supplied capacity; used where no real
    /// device backs the plan.
    pub fn new_with_capacity(devnode: &Path, device: Device, capacity: Sectors) -> VolumeMgr {
        VolumeMgr {
            devnode: devnode.to_owned(),
            device,
            capacity,
            next: Sectors(0),
            volumes: Vec::new(),
        }
    }

    pub fn capacity(&self) -> Sectors {
        self.capacity
    }

    /// Sectors not yet assigned to any volume.
    pub fn available(&self) -> Sectors {
        self.capacity - self.next
    }

    /// Allocate the next extent of the given size under the given name.
    pub fn add_volume(&mut self, name: &str, size: Sectors) -> WbResult<&Volume> {
        if self.volumes.iter().any(|v| v.name == name) {
            return Err(WbError::Msg(format!(
                "volume name {name} already allocated on {}",
                self.devnode.display()
            )));
        }
        if size > self.available() {
            return Err(WbError::Harness(
                ErrorEnum::InsufficientSpace,
                format!(
                    "requested {} sectors for volume {} but only {} of {} remain on {}",
                    *size,
                    name,
                    *self.available(),
                    *self.capacity,
                    self.devnode.display()
                ),
            ));
        }
        let volume = Volume {
            name: name.to_owned(),
            device: self.device,
            devnode: self.devnode.clone(),
            start: self.next,
            length: size,
        };
        self.next = self.next + size;
        self.volumes.push(volume);
        Ok(self
            .volumes
            .last()
            .expect("a volume was pushed immediately above"))
    }

    /// Look up a previously allocated volume by name.
    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.name == name)
    }
}
