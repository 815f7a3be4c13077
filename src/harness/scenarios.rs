// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end scenarios, runnable from the CLI against real devices and
//! from the loopbacked test fixtures.
//!
//! All of them need root, a writeboost-capable kernel, and exclusive use of
//! the two devices they are given.

use std::{env, path::Path};

use uuid::Uuid;

use devicemapper::{Sectors, IEC};

use crate::{
    errors::{ErrorEnum, WbError, WbResult},
    harness::{
        cmd, control,
        flakey::{self, FaultWindow},
        fs::{with_mount, Mount},
        stack::{StackSpec, StackVariant, DEFAULT_CACHE_SIZE},
        status::StatSelector,
        table::{Tunables, ALLOW_MIGRATE, ENABLE_MIGRATION_MODULATOR, SEGMENT_SIZE_ORDER},
        writing::PatternWriter,
    },
};

fn fresh_mount_pt() -> std::path::PathBuf {
    env::temp_dir().join(format!("wbtest-mnt-{}", Uuid::new_v4().simple()))
}

fn assert_scenario(condition: bool, msg: String) -> WbResult<()> {
    if condition {
        Ok(())
    } else {
        Err(WbError::Harness(ErrorEnum::Assertion, msg))
    }
}

/// Write many small files through a mounted filesystem, unmount, force a
/// flush, and require that no dirty cache block remains.
pub fn small_files(slow_dev: &Path, fast_dev: &Path, count: usize) -> WbResult<()> {
    let spec = StackSpec::new(StackVariant::Caching, slow_dev, fast_dev)
        .with_backing_size(Sectors(8 * IEC::Mi)) // 4 GiB
        .with_cache_size(DEFAULT_CACHE_SIZE);

    spec.activate(true, |_, wb| {
        cmd::create_fs(&wb.devnode())?;
        with_mount(&wb.devnode(), &fresh_mount_pt(), None, |mnt| {
            let payload = [0x5au8; 4096];
            for ix in 0..count {
                std::fs::write(mnt.join(format!("file-{ix:05}")), payload)?;
            }
            Ok(())
        })?;

        control::force_flush(wb)?;
        let dirty = control::measure_dirty_blocks(wb)?;
        assert_scenario(
            dirty == 0,
            format!("expected no dirty blocks after a forced flush, found {dirty}"),
        )
    })
}

/// Fill the cache with writes under a no-migration configuration, tear the
/// top level down, and reactivate with the migration modulator enabled.
/// Dropping the caches then replays the log onto the backing device; every
/// byte written in the first phase must read back in the second.
pub fn migration_replay(slow_dev: &Path, fast_dev: &Path) -> WbResult<()> {
    let spec = StackSpec::new(StackVariant::Caching, slow_dev, fast_dev)
        .with_backing_size(Sectors(32 * IEC::Ki)); // 16 MiB

    // A small segment size digs up code that assumes the default order.
    let base = Tunables::new().set(SEGMENT_SIZE_ORDER, 9);
    let writer = PatternWriter::new(37);
    let extent = Sectors(2048);

    spec.activate_support_devs(|support| {
        spec.cleanup_cache(support)?;

        let no_migrate = base
            .clone()
            .set(ENABLE_MIGRATION_MODULATOR, 0)
            .set(ALLOW_MIGRATE, 0);
        spec.activate_top_level_with(support, no_migrate, true, |_, wb| {
            writer.stamp(&wb.devnode(), Sectors(0), extent)
        })?;

        let replay = base
            .clone()
            .set(ENABLE_MIGRATION_MODULATOR, 1)
            .set(ALLOW_MIGRATE, 0);
        spec.activate_top_level_with(support, replay, true, |_, wb| {
            control::force_flush(wb)?;
            writer.verify(&wb.devnode(), Sectors(0), extent)
        })
    })
}

/// Write a pattern small enough to stay on the RAM buffer and read it
/// straight back; the buffer-hit read counter must have advanced.
pub fn rambuf_read(slow_dev: &Path, fast_dev: &Path) -> WbResult<()> {
    // Cache bigger than backing: no overwrite on the cache device occurs,
    // so reads have a chance to hit blocks still on the RAM buffer.
    let spec = StackSpec::new(StackVariant::Caching, slow_dev, fast_dev)
        .with_backing_size(Sectors(32 * IEC::Ki)) // 16 MiB
        .with_cache_size(Sectors(64 * IEC::Ki)); // 32 MiB

    let tunables = Tunables::new()
        .set(SEGMENT_SIZE_ORDER, 10)
        .set(ENABLE_MIGRATION_MODULATOR, 0)
        .set(ALLOW_MIGRATE, 0);

    spec.activate_support_devs(|support| {
        spec.cleanup_cache(support)?;
        spec.activate_top_level_with(support, tunables.clone(), true, |_, wb| {
            let buffer_read_hits = StatSelector {
                write: false,
                hit: true,
                on_buffer: true,
                fullsize: true,
            };
            let before = control::measure_stat(wb, buffer_read_hits)?;

            let writer = PatternWriter::new(31);
            writer.stamp(&wb.devnode(), Sectors(0), Sectors(40))?;
            writer.verify(&wb.devnode(), Sectors(0), Sectors(40))?;

            let after = control::measure_stat(wb, buffer_read_hits)?;
            assert_scenario(
                after > before,
                format!("expected RAM buffer read hits to advance, got {before} -> {after}"),
            )
        })
    })
}

/// Activate repeatedly and make a support device fail under load in each
/// round, alternating between the backing and the cache layer. The flakey
/// shim comes off before the unmount and before the consistency check, and
/// the round must end with a clean unmap.
pub fn device_failure(slow_dev: &Path, fast_dev: &Path, rounds: usize) -> WbResult<()> {
    // A small cache shortens each round.
    let spec = StackSpec::new(StackVariant::Caching, slow_dev, fast_dev)
        .with_cache_size(Sectors(32 * IEC::Ki)); // 16 MiB

    cmd::clear_kernel_log()?;

    spec.activate_support_devs(|support| {
        spec.cleanup_cache(support)?;

        for round in 0..rounds {
            spec.activate_top_level(support, true, |support, wb| {
                if round == 0 {
                    cmd::create_fs(&wb.devnode())?;
                }

                let mount = Mount::new(&wb.devnode(), &fresh_mount_pt())?;

                let (target, window) = if round % 2 == 0 {
                    (&mut support.backing, FaultWindow::random(1..=3, 1))
                } else {
                    (&mut support.cache, FaultWindow::random(3..=10, 1))
                };
                let original = flakey::inject(target, window)?;

                // The load generator is expected to fail under injected
                // faults; only the harness's own bookkeeping may error.
                if let Err(err) = cmd::run(&mut cmd::fio_randrw(mount.mount_pt(), 128, 30)) {
                    info!("load generation failed under injected faults: {err}");
                }

                let restored = flakey::restore(target, original);
                let unmounted = mount.unmount();
                restored.and(unmounted)?;

                cmd::xfs_repair(&wb.devnode())
            })?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use crate::harness::tests::loopbacked::{test_with_spec, DeviceLimits};

    use super::*;

    fn test_small_files(paths: &[&Path]) {
        assert!(paths.len() >= 2);
        small_files(paths[0], paths[1], 10_000).unwrap();
    }

    fn test_migration_replay(paths: &[&Path]) {
        assert!(paths.len() >= 2);
        migration_replay(paths[0], paths[1]).unwrap();
    }

    fn test_rambuf_read(paths: &[&Path]) {
        assert!(paths.len() >= 2);
        rambuf_read(paths[0], paths[1]).unwrap();
    }

    fn test_device_failure(paths: &[&Path]) {
        assert!(paths.len() >= 2);
        device_failure(paths[0], paths[1], 5).unwrap();
    }

    #[test]
    fn loop_test_small_files() {
        // Sparse loop files sized for the 4 GiB backing extent.
        test_with_spec(
            &DeviceLimits::Exactly(2, Some(Sectors(10 * IEC::Mi))),
            test_small_files,
        );
    }

    #[test]
    fn loop_test_migration_replay() {
        test_with_spec(&DeviceLimits::Exactly(2, None), test_migration_replay);
    }

    #[test]
    fn loop_test_rambuf_read() {
        test_with_spec(&DeviceLimits::Exactly(2, None), test_rambuf_read);
    }

    #[test]
    fn loop_test_device_failure() {
        test_with_spec(&DeviceLimits::Exactly(2, None), test_device_failure);
    }
}
