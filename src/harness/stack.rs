// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The stack activation protocol.
//!
//! A stack comes up bottom-up: volumes are planned on the physical devices,
//! the backing and cache support devices are mapped slow-device-first, and
//! the top-level device is mapped over them. It comes down in strict
//! reverse order on every exit path, driven by the guard primitives. Each
//! state-changing mutation is paced by a minimum wall-clock interval so the
//! harness never races asynchronous teardown inside the target.

use std::{
    path::{Path, PathBuf},
    thread::sleep,
    time::{Duration, Instant},
};

use devicemapper::{DmNameBuf, DmUuidBuf, LinearTargetParams, Sectors, IEC};
use uuid::Uuid;

use crate::{
    errors::WbResult,
    harness::{
        alloc::VolumeMgr,
        control,
        device::DevHandle,
        guard::{bracket, protect},
        names::{format_stack_ids, DeviceRole},
        table::{linear_table, LayerParams, Tunables, WbTargetTable, WriteboostTargetParams},
        writing::wipe_sectors,
    },
};

/// Default size of the cache extent.
pub const DEFAULT_CACHE_SIZE: Sectors = Sectors(2 * IEC::Mi); // 1 GiB

/// Minimum wall-clock time separating one state-changing mutation from the
/// next.
const MUTATION_PACE: Duration = Duration::from_secs(1);

const BACKING_VOL: &str = "backing";
const CACHE_VOL: &str = "cache";

/// Run the body, then wait out whatever remains of the pacing interval
/// before returning to the caller's next mutation.
fn ensure_elapsed<T, B>(minimum: Duration, body: B) -> WbResult<T>
where
    B: FnOnce() -> WbResult<T>,
{
    let start = Instant::now();
    let result = body();
    if let Some(remaining) = minimum.checked_sub(start.elapsed()) {
        trace!(
            "pacing: waiting {}ms before the next mutation",
            remaining.as_millis()
        );
        sleep(remaining);
    }
    result
}

/// Which top-level table a stack builds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StackVariant {
    /// The writeboost target over both support devices.
    Caching,
    /// A linear target over the backing device only; the control variant
    /// used for baselines. It has no cache behavior to quiesce.
    BackingOnly,
}

impl StackVariant {
    pub fn is_writeboost(self) -> bool {
        matches!(self, StackVariant::Caching)
    }
}

/// The two support devices of an activated stack, in mapping order.
#[derive(Debug)]
pub struct SupportDevs {
    pub backing: DevHandle,
    pub cache: DevHandle,
}

impl SupportDevs {
    /// Unmap in reverse mapping order. A failure on the cache device does
    /// not keep the backing device from being unmapped.
    fn teardown(self) -> WbResult<()> {
        let SupportDevs { backing, cache } = self;
        match (cache.unmap(), backing.unmap()) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), Ok(())) => Err(err),
            (Ok(()), Err(err)) => Err(err),
            (Err(err), Err(backing_err)) => {
                warn!("backing device unmap also failed: {backing_err}");
                Err(err)
            }
        }
    }
}

/// Everything needed to bring up one stack: the physical devices, the
/// extent sizes, the target variant and its construction tunables. One
/// spec maps to one run identity; activations of the same spec reuse the
/// same device names.
#[derive(Debug)]
pub struct StackSpec {
    variant: StackVariant,
    slow_devnode: PathBuf,
    fast_devnode: PathBuf,
    backing_size: Option<Sectors>,
    cache_size: Sectors,
    tunables: Tunables,
    run: Uuid,
}

impl StackSpec {
    pub fn new(variant: StackVariant, slow_devnode: &Path, fast_devnode: &Path) -> StackSpec {
        StackSpec {
            variant,
            slow_devnode: slow_devnode.to_owned(),
            fast_devnode: fast_devnode.to_owned(),
            backing_size: None,
            cache_size: DEFAULT_CACHE_SIZE,
            tunables: Tunables::new(),
            run: Uuid::new_v4(),
        }
    }

    /// Limit the backing extent; the default is the whole slow device.
    pub fn with_backing_size(mut self, size: Sectors) -> StackSpec {
        self.backing_size = Some(size);
        self
    }

    pub fn with_cache_size(mut self, size: Sectors) -> StackSpec {
        self.cache_size = size;
        self
    }

    /// Construction tunables applied to every top-level activation that
    /// does not override them.
    pub fn with_tunables(mut self, tunables: Tunables) -> StackSpec {
        self.tunables = tunables;
        self
    }

    pub fn variant(&self) -> StackVariant {
        self.variant
    }

    /// The DM identifiers this spec uses for the given role.
    pub fn device_ids(&self, role: DeviceRole) -> (DmNameBuf, DmUuidBuf) {
        format_stack_ids(self.run, role)
    }

    /// The top-level table for the current support devices.
    fn top_level_table(&self, support: &SupportDevs, tunables: &Tunables) -> WbTargetTable {
        let size = support.backing.size();
        match self.variant {
            StackVariant::Caching => WbTargetTable::single(
                size,
                LayerParams::Writeboost(WriteboostTargetParams::new(
                    support.backing.device(),
                    support.cache.device(),
                    tunables.clone(),
                )),
            ),
            StackVariant::BackingOnly => WbTargetTable::single(
                size,
                LayerParams::Linear(LinearTargetParams::new(
                    support.backing.device(),
                    Sectors(0),
                )),
            ),
        }
    }

    /// Allocate volumes and map the support devices, slow device first;
    /// the top-level params reference them positionally. The body runs
    /// with both devices live; they are unmapped in reverse order on every
    /// exit path.
    pub fn activate_support_devs<T, B>(&self, body: B) -> WbResult<T>
    where
        B: FnOnce(&mut SupportDevs) -> WbResult<T>,
    {
        let mut slow = VolumeMgr::new(&self.slow_devnode)?;
        let mut fast = VolumeMgr::new(&self.fast_devnode)?;
        let backing_size = self.backing_size.unwrap_or_else(|| slow.capacity());
        let backing_vol = slow.add_volume(BACKING_VOL, backing_size)?.clone();
        let cache_vol = fast.add_volume(CACHE_VOL, self.cache_size)?.clone();

        let (name, dm_uuid) = format_stack_ids(self.run, DeviceRole::Backing);
        let backing = DevHandle::map(&name, Some(&dm_uuid), linear_table(&backing_vol))?;

        let (name, dm_uuid) = format_stack_ids(self.run, DeviceRole::CacheStore);
        let (backing, cache) = protect(backing, DevHandle::unmap, |_| {
            DevHandle::map(&name, Some(&dm_uuid), linear_table(&cache_vol))
        })?;

        bracket(
            SupportDevs { backing, cache },
            SupportDevs::teardown,
            |support| ensure_elapsed(MUTATION_PACE, || body(support)),
        )
    }

    /// Map the top-level device over live support devices and run the body
    /// with the whole stack.
    ///
    /// With `force` set the body starts from a drained state: the target is
    /// quiesced immediately after the mapping comes up, and the RAM buffer
    /// is flushed again before teardown so no acknowledged write is lost
    /// when the device goes away.
    pub fn activate_top_level<T, B>(
        &self,
        support: &mut SupportDevs,
        force: bool,
        body: B,
    ) -> WbResult<T>
    where
        B: FnOnce(&mut SupportDevs, &mut DevHandle) -> WbResult<T>,
    {
        self.activate_top_level_with(support, self.tunables.clone(), force, body)
    }

    /// [`StackSpec::activate_top_level`] with the construction tunables
    /// replaced for this activation only; reactivation under different
    /// tunables is how migration replay is exercised.
    pub fn activate_top_level_with<T, B>(
        &self,
        support: &mut SupportDevs,
        tunables: Tunables,
        force: bool,
        body: B,
    ) -> WbResult<T>
    where
        B: FnOnce(&mut SupportDevs, &mut DevHandle) -> WbResult<T>,
    {
        let table = self.top_level_table(support, &tunables);
        let (name, dm_uuid) = format_stack_ids(self.run, DeviceRole::TopLevel);
        let wb = DevHandle::map(&name, Some(&dm_uuid), table)?;

        bracket(wb, DevHandle::unmap, |wb| {
            if force && self.variant.is_writeboost() {
                control::force_flush(wb)?;
            }
            let result = ensure_elapsed(MUTATION_PACE, || body(support, &mut *wb));
            let flushed = if force {
                control::flush_ram_buffer(wb)
            } else {
                Ok(())
            };
            match (result, flushed) {
                (Ok(value), Ok(())) => Ok(value),
                (Ok(_), Err(err)) => Err(err),
                (Err(err), Ok(())) => Err(err),
                (Err(err), Err(flush_err)) => {
                    warn!("RAM buffer flush also failed during unwind: {flush_err}");
                    Err(err)
                }
            }
        })
    }

    /// Invalidate any stale writeboost superblock left on the cache extent
    /// by an earlier run, so the next activation formats from scratch.
    pub fn cleanup_cache(&self, support: &SupportDevs) -> WbResult<()> {
        wipe_sectors(support.cache.devnode(), Sectors(0), Sectors(1))
    }

    /// Bring up the full stack, cache extent wiped, and run the body.
    pub fn activate<T, B>(&self, force: bool, body: B) -> WbResult<T>
    where
        B: FnOnce(&mut SupportDevs, &mut DevHandle) -> WbResult<T>,
    {
        self.activate_support_devs(|support| {
            self.cleanup_cache(support)?;
            self.activate_top_level(support, force, body)
        })
    }

    /// Write everything back and leave the cache clean. A no-op on the
    /// control variant, which has no caches to drop.
    pub fn drop_caches(&self, wb: &mut DevHandle) -> WbResult<()> {
        if !self.variant.is_writeboost() {
            return Ok(());
        }
        control::drop_caches(wb)
    }
}
