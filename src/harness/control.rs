// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Control-plane operations that bring the writeboost target to a known
//! state before assertions are made against it.

use devicemapper::Sectors;

use crate::{
    errors::{ErrorEnum, WbError, WbResult},
    harness::{
        device::DevHandle,
        status::{StatSelector, WriteboostStatus},
        table::SYNC_DATA_INTERVAL,
    },
};

/// Force the target to write back everything it is holding.
///
/// Sets the background sync interval to its minimum first: the sync daemon
/// must keep running while dirty caches drain, or dirty data submitted to
/// the RAM buffer after the drop starts would keep the drop from ever
/// completing. Both messages must be accepted.
pub fn force_flush(wb: &DevHandle) -> WbResult<()> {
    wb.message(Sectors(0), &format!("{SYNC_DATA_INTERVAL} 1"))
        .and_then(|_| wb.message(Sectors(0), "drop_caches"))
        .map_err(|err| {
            WbError::Harness(
                ErrorEnum::Quiesce,
                format!("failed to quiesce {}: {err}", wb.name()),
            )
        })
}

/// Flush the current RAM buffer by cycling the device through a
/// suspend/resume pair; acknowledged writes reach the cache device.
pub fn flush_ram_buffer(wb: &mut DevHandle) -> WbResult<()> {
    wb.paused(|_| Ok(()))
}

/// Flush the RAM buffer, then force everything dirty back to the backing
/// device.
pub fn drop_caches(wb: &mut DevHandle) -> WbResult<()> {
    flush_ram_buffer(wb)?;
    force_flush(wb)
}

/// Read the device's status. The writeboost target reports exactly one
/// status line.
pub fn read_status(wb: &DevHandle) -> WbResult<WriteboostStatus> {
    let lines = wb.status()?;
    let line = lines.first().ok_or_else(|| {
        WbError::Harness(
            ErrorEnum::Control,
            format!("device {} returned an empty status report", wb.name()),
        )
    })?;
    WriteboostStatus::parse(line)
}

/// Read one I/O classification counter; tests assert monotonic progress on
/// these across a forced flush.
pub fn measure_stat(wb: &DevHandle, selector: StatSelector) -> WbResult<u64> {
    Ok(read_status(wb)?.stat(selector))
}

/// The dirty cache block count; zero once a forced flush has drained the
/// device.
pub fn measure_dirty_blocks(wb: &DevHandle) -> WbResult<u64> {
    Ok(read_status(wb)?.nr_dirty_cache_blocks)
}
