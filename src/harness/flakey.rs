// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Fault injection against a live support device.
//!
//! Injection swaps the device's staged table for a flakey shim over the
//! same extent and resumes; the device's identity, and with it every
//! reference the top-level table holds to it, is untouched. I/O in flight
//! across the pause is queued by the control plane, not dropped. The shim
//! passes I/O for `up` seconds, fails everything for `down` seconds, and
//! cycles.
//!
//! Precondition for every caller: restore the original table before any
//! filesystem consistency check and before unmapping. The harness does not
//! detect a violation.

use std::ops::RangeInclusive;

use rand::RngExt;

use devicemapper::{FlakeyTargetParams, TargetLine, TargetParams};

use crate::{
    errors::{ErrorEnum, WbError, WbResult},
    harness::{
        device::DevHandle,
        table::{LayerParams, WbTargetTable},
    },
};

/// A cyclic availability schedule: pass I/O for `up` seconds, then fail
/// everything for `down` seconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FaultWindow {
    pub up: u32,
    pub down: u32,
}

impl FaultWindow {
    pub fn new(up: u32, down: u32) -> FaultWindow {
        FaultWindow { up, down }
    }

    /// A window with an up time drawn from the given range; the original
    /// harness randomizes the up time between repetitions so failures land
    /// at varied points of the workload.
    pub fn random(up: RangeInclusive<u32>, down: u32) -> FaultWindow {
        FaultWindow {
            up: rand::rng().random_range(up),
            down,
        }
    }
}

/// The flakey rendition of a support device's table: each linear layer is
/// replaced by a flakey layer over the identical extent with the given
/// schedule. Any non-linear layer is a usage error; only a device in its
/// normal state may be wrapped.
pub fn flakey_table(original: &WbTargetTable, window: FaultWindow) -> WbResult<WbTargetTable> {
    let lines = original
        .table
        .iter()
        .map(|line| match line.params {
            LayerParams::Linear(ref linear) => Ok(TargetLine::new(
                line.start,
                line.length,
                LayerParams::Flakey(FlakeyTargetParams::new(
                    linear.device,
                    linear.start_offset,
                    window.up,
                    window.down,
                    Vec::new(),
                )),
            )),
            ref other => Err(WbError::Harness(
                ErrorEnum::InvalidState,
                format!(
                    "only a linear layer can be wrapped for fault injection, found {}",
                    other.target_type()
                ),
            )),
        })
        .collect::<WbResult<Vec<_>>>()?;
    Ok(WbTargetTable::new(lines))
}

/// Swap the handle's live table for a flakey shim with the given window.
/// Returns the original table; the caller must hand it back to [`restore`]
/// before unmapping the device.
pub fn inject(handle: &mut DevHandle, window: FaultWindow) -> WbResult<WbTargetTable> {
    let original = handle.table().clone();
    let shim = flakey_table(&original, window)?;
    info!(
        "injecting faults on {}: up {}s, down {}s",
        handle.name(),
        window.up,
        window.down
    );
    handle.paused(|h| h.reload(shim))?;
    Ok(original)
}

/// Put the original table back under the same device identity.
pub fn restore(handle: &mut DevHandle, original: WbTargetTable) -> WbResult<()> {
    info!("restoring the original table of {}", handle.name());
    handle.paused(|h| h.reload(original))
}

#[cfg(test)]
mod tests {
    use devicemapper::{Device, LinearTargetParams, Sectors};

    use crate::{
        errors::ErrorEnum,
        harness::table::{Tunables, WriteboostTargetParams},
    };

    use super::*;

    fn linear(devno: u64, start: u64, length: u64) -> WbTargetTable {
        WbTargetTable::single(
            Sectors(length),
            LayerParams::Linear(LinearTargetParams::new(Device::from(devno), Sectors(start))),
        )
    }

    /// The shim covers the identical extent with the requested schedule.
    #[test]
    fn test_flakey_table_shape() {
        let original = linear(64768, 128, 2048);
        let shim = flakey_table(&original, FaultWindow::new(3, 1)).unwrap();

        assert_eq!(shim.table.len(), 1);
        let line = &shim.table[0];
        assert_eq!(line.start, Sectors(0));
        assert_eq!(line.length, Sectors(2048));
        match line.params {
            LayerParams::Flakey(ref flakey) => {
                assert_eq!(flakey.device, Device::from(64768));
                assert_eq!(flakey.start_offset, Sectors(128));
                assert_eq!(flakey.up_interval, 3);
                assert_eq!(flakey.down_interval, 1);
                assert!(flakey.feature_args.is_empty());
            }
            ref other => panic!("expected a flakey layer, found {other:?}"),
        }
    }

    /// Wrapping and then referring back to the retained original is
    /// identity-preserving at the table level.
    #[test]
    fn test_wrap_preserves_original() {
        let original = linear(64768, 0, 4096);
        let kept = original.clone();
        let _shim = flakey_table(&original, FaultWindow::new(5, 2)).unwrap();
        assert_eq!(original, kept);
    }

    /// A writeboost layer cannot be wrapped; faults go under the target,
    /// never over it.
    #[test]
    fn test_wrap_rejects_non_linear() {
        let table = WbTargetTable::single(
            Sectors(2048),
            LayerParams::Writeboost(WriteboostTargetParams::new(
                Device::from(64768),
                Device::from(64769),
                Tunables::new(),
            )),
        );
        let err = flakey_table(&table, FaultWindow::new(1, 1)).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorEnum::InvalidState));
    }

    /// Randomized windows stay within the requested bounds.
    #[test]
    fn test_random_window_bounds() {
        for _ in 0..50 {
            let window = FaultWindow::random(1..=3, 1);
            assert!((1..=3).contains(&window.up));
            assert_eq!(window.down, 1);
        }
    }
}
