// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Table model for the device layers the harness maps.
//!
//! A support device's table is a single linear layer over an allocated
//! volume, temporarily replaced with a flakey layer while faults are being
//! injected. The top-level table is a single writeboost layer referencing
//! both support devices positionally, slow device first.

use std::{fmt, str::FromStr};

use itertools::Itertools;

use devicemapper::{
    DmError, DmResult, ErrorEnum, FlakeyTargetParams, LinearTargetParams, Sectors, TargetLine,
    TargetParams, TargetTable, TargetTypeBuf,
};

use crate::harness::alloc::Volume;

const LINEAR_TARGET_NAME: &str = "linear";
const FLAKEY_TARGET_NAME: &str = "flakey";
const WRITEBOOST_TARGET_NAME: &str = "writeboost";

/// Background writeback is throttled above this percentage of dirty blocks.
pub const WRITEBACK_THRESHOLD: &str = "writeback_threshold";
/// Upper bound on segments written back in one batch.
pub const NR_MAX_BATCHED_WRITEBACK: &str = "nr_max_batched_writeback";
/// Superblock record update period, in seconds.
pub const UPDATE_SB_RECORD_INTERVAL: &str = "update_sb_record_interval";
/// Period of the background metadata sync daemon, in seconds.
pub const SYNC_DATA_INTERVAL: &str = "sync_data_interval";
/// Reads longer than this many sectors bypass the cache.
pub const READ_CACHE_THRESHOLD: &str = "read_cache_threshold";
/// log2 of the segment size, in sectors.
pub const SEGMENT_SIZE_ORDER: &str = "segment_size_order";
/// Whether the modulator adjusts migration to device load.
pub const ENABLE_MIGRATION_MODULATOR: &str = "enable_migration_modulator";
/// Whether dirty segments may migrate to the backing device at all.
pub const ALLOW_MIGRATE: &str = "allow_migrate";

/// An ordered set of writeboost tunables.
///
/// Serialized in the control plane's count-prefixed form
/// `<count> <k1> <v1> <k2> <v2> ...` where the count is the number of
/// serialized words, twice the number of pairs. An empty set serializes to
/// nothing at all.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Tunables {
    pairs: Vec<(String, u64)>,
}

impl Tunables {
    pub fn new() -> Tunables {
        Tunables::default()
    }

    /// Set one tunable, replacing any earlier value and keeping first-set
    /// order otherwise.
    pub fn set(mut self, name: &str, value: u64) -> Tunables {
        match self.pairs.iter_mut().find(|(n, _)| n == name) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((name.to_owned(), value)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The count-prefixed argument vector, empty when no tunables are set.
    pub fn as_args(&self) -> Vec<String> {
        if self.pairs.is_empty() {
            return Vec::new();
        }
        let mut args = Vec::with_capacity(1 + 2 * self.pairs.len());
        args.push((self.pairs.len() * 2).to_string());
        for (name, value) in &self.pairs {
            args.push(name.clone());
            args.push(value.to_string());
        }
        args
    }

    /// Parse the count-prefixed form from a sequence of words.
    fn from_words(words: &[&str]) -> DmResult<Tunables> {
        if words.is_empty() {
            return Ok(Tunables::new());
        }
        let count = words[0].parse::<usize>().map_err(|_| {
            DmError::Dm(
                ErrorEnum::Invalid,
                format!("failed to parse tunable count from \"{}\"", words[0]),
            )
        })?;
        if count % 2 != 0 || words.len() != count + 1 {
            return Err(DmError::Dm(
                ErrorEnum::Invalid,
                format!(
                    "expected {} tunable words after the count, found {}",
                    count,
                    words.len() - 1
                ),
            ));
        }
        let mut tunables = Tunables::new();
        for (name, value) in words[1..].iter().tuples() {
            let value = value.parse::<u64>().map_err(|_| {
                DmError::Dm(
                    ErrorEnum::Invalid,
                    format!("failed to parse value for tunable {name} from \"{value}\""),
                )
            })?;
            tunables = tunables.set(name, value);
        }
        Ok(tunables)
    }
}

/// Struct representing params for a writeboost target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteboostTargetParams {
    /// The slow device written back to; positionally first.
    pub backing: devicemapper::Device,
    /// The fast device holding cache blocks; positionally second.
    pub cache: devicemapper::Device,
    /// Optional construction-time tunables.
    pub tunables: Tunables,
}

impl WriteboostTargetParams {
    pub fn new(
        backing: devicemapper::Device,
        cache: devicemapper::Device,
        tunables: Tunables,
    ) -> WriteboostTargetParams {
        WriteboostTargetParams {
            backing,
            cache,
            tunables,
        }
    }
}

impl fmt::Display for WriteboostTargetParams {
    /// Generate params to be passed to DM. The format of the params is:
    /// <backing dev> <cache dev> [<#tunable words> <k1> <v1> ...]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", WRITEBOOST_TARGET_NAME, self.param_str())
    }
}

impl FromStr for WriteboostTargetParams {
    type Err = DmError;

    fn from_str(s: &str) -> DmResult<WriteboostTargetParams> {
        let vals = s.split(' ').collect::<Vec<_>>();
        if vals.len() < 3 {
            let err_msg = format!(
                "expected at least 3 values in params string \"{}\", found {}",
                s,
                vals.len()
            );
            return Err(DmError::Dm(ErrorEnum::Invalid, err_msg));
        }

        if vals[0] != WRITEBOOST_TARGET_NAME {
            let err_msg = format!(
                "expected a writeboost target entry but found target type {}",
                vals[0]
            );
            return Err(DmError::Dm(ErrorEnum::Invalid, err_msg));
        }

        let backing = vals[1].parse::<devicemapper::Device>()?;
        let cache = vals[2].parse::<devicemapper::Device>()?;
        let tunables = Tunables::from_words(&vals[3..])?;

        Ok(WriteboostTargetParams::new(backing, cache, tunables))
    }
}

impl TargetParams for WriteboostTargetParams {
    fn param_str(&self) -> String {
        let mut params = vec![self.backing.to_string(), self.cache.to_string()];
        params.extend(self.tunables.as_args());
        params.join(" ")
    }

    fn target_type(&self) -> TargetTypeBuf {
        TargetTypeBuf::new(WRITEBOOST_TARGET_NAME.into()).expect("WRITEBOOST_TARGET_NAME is valid")
    }
}

/// Target params for any layer the harness maps.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LayerParams {
    /// A linear target; the normal table of a support device.
    Linear(LinearTargetParams),
    /// A flakey target; a support device's table while faults are injected.
    Flakey(FlakeyTargetParams),
    /// The writeboost target under test.
    Writeboost(WriteboostTargetParams),
}

impl fmt::Display for LayerParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LayerParams::Linear(ref linear) => linear.fmt(f),
            LayerParams::Flakey(ref flakey) => flakey.fmt(f),
            LayerParams::Writeboost(ref wb) => wb.fmt(f),
        }
    }
}

impl FromStr for LayerParams {
    type Err = DmError;

    fn from_str(s: &str) -> DmResult<LayerParams> {
        let target_type = s.splitn(2, ' ').next().ok_or_else(|| {
            DmError::Dm(
                ErrorEnum::Invalid,
                format!("target line string \"{s}\" did not contain any values"),
            )
        })?;
        match target_type {
            LINEAR_TARGET_NAME => Ok(LayerParams::Linear(s.parse::<LinearTargetParams>()?)),
            FLAKEY_TARGET_NAME => Ok(LayerParams::Flakey(s.parse::<FlakeyTargetParams>()?)),
            WRITEBOOST_TARGET_NAME => {
                Ok(LayerParams::Writeboost(s.parse::<WriteboostTargetParams>()?))
            }
            _ => Err(DmError::Dm(
                ErrorEnum::Invalid,
                format!("unexpected target type \"{target_type}\""),
            )),
        }
    }
}

impl TargetParams for LayerParams {
    fn param_str(&self) -> String {
        match *self {
            LayerParams::Linear(ref linear) => linear.param_str(),
            LayerParams::Flakey(ref flakey) => flakey.param_str(),
            LayerParams::Writeboost(ref wb) => wb.param_str(),
        }
    }

    fn target_type(&self) -> TargetTypeBuf {
        match *self {
            LayerParams::Linear(ref linear) => linear.target_type(),
            LayerParams::Flakey(ref flakey) => flakey.target_type(),
            LayerParams::Writeboost(ref wb) => wb.target_type(),
        }
    }
}

/// A target table for any device the harness maps.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WbTargetTable {
    /// The device's table
    pub table: Vec<TargetLine<LayerParams>>,
}

impl WbTargetTable {
    /// Make a new WbTargetTable from a suitable vec.
    pub fn new(table: Vec<TargetLine<LayerParams>>) -> WbTargetTable {
        WbTargetTable { table }
    }

    /// A one-line table starting at sector 0, the common case for every
    /// layer the harness builds.
    pub fn single(length: Sectors, params: LayerParams) -> WbTargetTable {
        WbTargetTable::new(vec![TargetLine::new(Sectors(0), length, params)])
    }

    /// Total sectors mapped by this table.
    pub fn size(&self) -> Sectors {
        self.table.iter().map(|l| l.length).sum()
    }
}

impl fmt::Display for WbTargetTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.table {
            writeln!(f, "{} {} {}", *line.start, *line.length, line.params)?;
        }
        Ok(())
    }
}

impl TargetTable for WbTargetTable {
    fn from_raw_table(table: &[(Sectors, Sectors, TargetTypeBuf, String)]) -> DmResult<WbTargetTable> {
        Ok(WbTargetTable {
            table: table
                .iter()
                .map(|x| -> DmResult<TargetLine<LayerParams>> {
                    Ok(TargetLine::new(
                        x.0,
                        x.1,
                        format!("{} {}", x.2, x.3).parse::<LayerParams>()?,
                    ))
                })
                .collect::<DmResult<Vec<_>>>()?,
        })
    }

    fn to_raw_table(&self) -> Vec<(Sectors, Sectors, TargetTypeBuf, String)> {
        self.table
            .iter()
            .map(|x| {
                (
                    x.start,
                    x.length,
                    x.params.target_type(),
                    x.params.param_str(),
                )
            })
            .collect::<Vec<_>>()
    }
}

/// The normal table of a support device: one linear layer over the volume.
pub fn linear_table(volume: &Volume) -> WbTargetTable {
    WbTargetTable::single(
        volume.length,
        LayerParams::Linear(LinearTargetParams::new(volume.device, volume.start)),
    )
}
