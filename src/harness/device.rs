// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A live, addressable device mapper device.
//!
//! The handle tracks the currently effective table, the table staged by a
//! reload, and the suspended flag, and enforces the protocol that keeps a
//! reload from ever reaching a live device: pause and resume must strictly
//! alternate, and a reload is accepted only while paused. The staged table
//! becomes effective on the resume that follows it.

use std::path::PathBuf;

use devicemapper::{
    DevId, Device, DeviceInfo, DmFlags, DmName, DmNameBuf, DmOptions, DmUuid, Sectors, TargetTable,
};

use crate::{
    errors::{ErrorEnum, WbError, WbResult},
    harness::{
        dm::{get_dm, DEVICEMAPPER_PATH},
        guard::protect_,
        table::WbTargetTable,
    },
};

#[derive(Debug)]
pub struct DevHandle {
    name: DmNameBuf,
    dev_info: Box<DeviceInfo>,
    /// The table serving I/O, or about to serve it once resumed.
    table: WbTargetTable,
    /// A table loaded into the inactive slot, effective on next resume.
    staged: Option<WbTargetTable>,
    suspended: bool,
}

impl DevHandle {
    /// Create a mapped device for the given table and bring it live.
    ///
    /// If the control plane rejects any step of creation, the half-made
    /// device is removed again before the error propagates.
    pub fn map(
        name: &DmName,
        uuid: Option<&DmUuid>,
        table: WbTargetTable,
    ) -> WbResult<DevHandle> {
        let dm = get_dm();
        let dev_info = dm
            .device_create(name, uuid, DmOptions::default())
            .map_err(|err| {
                WbError::Harness(
                    ErrorEnum::Map,
                    format!("control plane refused to create device {name}: {err}"),
                )
            })?;

        protect_(
            || {
                dm.device_remove(&DevId::Name(name), DmOptions::default())?;
                Ok(())
            },
            || {
                dm.table_load(
                    &DevId::Name(name),
                    &table.to_raw_table(),
                    DmOptions::default(),
                )
                .and_then(|_| dm.device_suspend(&DevId::Name(name), DmOptions::default()))
                .map_err(|err| {
                    WbError::Harness(
                        ErrorEnum::Map,
                        format!("control plane rejected the table for {name}: {err}"),
                    )
                })
            },
        )?;

        debug!("mapped device {name}");
        Ok(DevHandle {
            name: name.to_owned(),
            dev_info: Box::new(dev_info),
            table,
            staged: None,
            suspended: false,
        })
    }

    pub fn name(&self) -> &DmName {
        &self.name
    }

    /// Device number of this mapping, used when another table references it.
    pub fn device(&self) -> Device {
        self.dev_info.device()
    }

    pub fn devnode(&self) -> PathBuf {
        [DEVICEMAPPER_PATH, &self.name.to_string()]
            .iter()
            .collect()
    }

    /// The table currently effective, or effective on the next resume if a
    /// reload is staged.
    pub fn table(&self) -> &WbTargetTable {
        self.staged.as_ref().unwrap_or(&self.table)
    }

    pub fn size(&self) -> Sectors {
        self.table().size()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Stop serving I/O; incoming I/O queues until resume.
    pub fn pause(&mut self) -> WbResult<()> {
        if self.suspended {
            return Err(WbError::Harness(
                ErrorEnum::InvalidState,
                format!("device {} is already paused", self.name),
            ));
        }
        get_dm().device_suspend(
            &DevId::Name(&self.name),
            DmOptions::default().set_flags(DmFlags::DM_SUSPEND),
        )?;
        self.suspended = true;
        Ok(())
    }

    /// Resume serving I/O, promoting any staged table to effective.
    pub fn resume(&mut self) -> WbResult<()> {
        if !self.suspended {
            return Err(WbError::Harness(
                ErrorEnum::InvalidState,
                format!("device {} is not paused", self.name),
            ));
        }
        get_dm().device_suspend(&DevId::Name(&self.name), DmOptions::default())?;
        if let Some(staged) = self.staged.take() {
            self.table = staged;
        }
        self.suspended = false;
        Ok(())
    }

    /// Stage a replacement table; only valid while paused. The mapping
    /// switches atomically on the next resume.
    pub fn reload(&mut self, table: WbTargetTable) -> WbResult<()> {
        if !self.suspended {
            return Err(WbError::Harness(
                ErrorEnum::InvalidState,
                format!("device {} must be paused before a reload", self.name),
            ));
        }
        get_dm().table_load(
            &DevId::Name(&self.name),
            &table.to_raw_table(),
            DmOptions::default(),
        )?;
        self.staged = Some(table);
        Ok(())
    }

    /// Pause, run the body, resume; the shape every live reconfiguration
    /// takes. The body's error wins over a resume error.
    pub fn paused<T, B>(&mut self, body: B) -> WbResult<T>
    where
        B: FnOnce(&mut DevHandle) -> WbResult<T>,
    {
        self.pause()?;
        let result = body(self);
        match (result, self.resume()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(resume_err)) => {
                warn!(
                    "failed to resume {} after a failed reconfiguration: {resume_err}",
                    self.name
                );
                Err(err)
            }
        }
    }

    /// Send a control string to the target at the given sector of a live
    /// mapping; valid regardless of pause state.
    pub fn message(&self, sector: Sectors, msg: &str) -> WbResult<()> {
        get_dm()
            .target_msg(&DevId::Name(&self.name), Some(sector), msg)
            .map(drop)
            .map_err(|err| {
                WbError::Harness(
                    ErrorEnum::Control,
                    format!("target of {} rejected message \"{msg}\": {err}", self.name),
                )
            })
    }

    /// Read back the raw status lines of this mapping. Parsing is the
    /// consumer's business.
    pub fn status(&self) -> WbResult<Vec<String>> {
        let (_, status) =
            get_dm().table_status(&DevId::Name(&self.name), DmOptions::default())?;
        Ok(status.into_iter().map(|(_, _, _, params)| params).collect())
    }

    /// Read the table the kernel holds for this mapping.
    pub fn read_table(&self) -> WbResult<WbTargetTable> {
        let (_, raw) = get_dm().table_status(
            &DevId::Name(&self.name),
            DmOptions::default().set_flags(DmFlags::DM_STATUS_TABLE),
        )?;
        Ok(WbTargetTable::from_raw_table(&raw)?)
    }

    /// Release the mapping and its name. Fails while references to the
    /// device remain open.
    pub fn unmap(self) -> WbResult<()> {
        get_dm()
            .device_remove(&DevId::Name(&self.name), DmOptions::default())
            .map_err(|err| {
                WbError::Harness(
                    ErrorEnum::Busy,
                    format!("failed to unmap device {}: {err}", self.name),
                )
            })?;
        debug!("unmapped device {}", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use uuid::Uuid;

    use crate::harness::{
        alloc::VolumeMgr,
        names::{format_stack_ids, DeviceRole},
        table::linear_table,
        tests::loopbacked::{test_with_spec, DeviceLimits},
    };

    use super::*;

    /// A staged reload becomes visible to the kernel only on the resume
    /// that follows it; the live table is untouched while paused.
    fn test_reload_visibility(paths: &[&Path]) {
        assert!(!paths.is_empty());

        let mut mgr = VolumeMgr::new(paths[0]).unwrap();
        let first = mgr.add_volume("first", Sectors(256)).unwrap().clone();
        let second = mgr.add_volume("second", Sectors(256)).unwrap().clone();

        let (name, dm_uuid) = format_stack_ids(Uuid::new_v4(), DeviceRole::Backing);
        let mut dev = DevHandle::map(&name, Some(&dm_uuid), linear_table(&first)).unwrap();

        let before = dev.read_table().unwrap();
        assert_eq!(&before, dev.table());

        dev.pause().unwrap();
        let replacement = linear_table(&second);
        dev.reload(replacement.clone()).unwrap();
        assert_eq!(dev.read_table().unwrap(), before);

        dev.resume().unwrap();
        assert_eq!(dev.read_table().unwrap(), replacement);
        assert_eq!(dev.table(), &replacement);

        dev.unmap().unwrap();
    }

    /// Mapping a table the control plane rejects removes the half-made
    /// device again.
    fn test_map_failure_removes_device(paths: &[&Path]) {
        assert!(!paths.is_empty());

        let mut mgr = VolumeMgr::new(paths[0]).unwrap();
        let vol = mgr.add_volume("vol", Sectors(256)).unwrap().clone();

        // A linear mapping reaching past the end of the physical device is
        // rejected at table load.
        let mut bogus = vol.clone();
        bogus.start = mgr.capacity();
        let (name, dm_uuid) = format_stack_ids(Uuid::new_v4(), DeviceRole::Backing);
        let err = DevHandle::map(&name, Some(&dm_uuid), linear_table(&bogus)).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorEnum::Map));

        // The name is free again.
        let dev = DevHandle::map(&name, Some(&dm_uuid), linear_table(&vol)).unwrap();
        dev.unmap().unwrap();
    }

    #[test]
    fn loop_test_reload_visibility() {
        test_with_spec(&DeviceLimits::Exactly(1, None), test_reload_visibility);
    }

    #[test]
    fn loop_test_map_failure_removes_device() {
        test_with_spec(
            &DeviceLimits::Exactly(1, None),
            test_map_failure_removes_device,
        );
    }
}
