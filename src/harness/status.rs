// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Parsing of the writeboost target's status line.
//!
//! The kernel reports, in order: the cursor position, cache block and
//! segment counts, the current, last-flushed and last-written-back segment
//! ids, the dirty cache block count, sixteen I/O classification counters
//! indexed by (write, hit, on-buffer, fullsize), the partial flush count,
//! and the current tunables in the same count-prefixed form used on the
//! table line.

use itertools::Itertools;

use crate::errors::{ErrorEnum, WbError, WbResult};

const NR_STAT_COUNTERS: usize = 16;

/// Selects one of the sixteen I/O classification counters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatSelector {
    /// Write path rather than read path.
    pub write: bool,
    /// The block was found in the cache.
    pub hit: bool,
    /// The block was found on the RAM buffer.
    pub on_buffer: bool,
    /// The I/O covered a full cache block.
    pub fullsize: bool,
}

impl StatSelector {
    fn index(&self) -> usize {
        ((self.write as usize) << 3)
            | ((self.hit as usize) << 2)
            | ((self.on_buffer as usize) << 1)
            | (self.fullsize as usize)
    }
}

/// One parsed writeboost status report.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteboostStatus {
    pub cursor_pos: u64,
    pub nr_cache_blocks: u64,
    pub nr_segments: u64,
    pub current_id: u64,
    pub last_flushed_id: u64,
    pub last_writeback_id: u64,
    pub nr_dirty_cache_blocks: u64,
    stats: Vec<u64>,
    pub nr_partial_flushed: u64,
    pub tunables: Vec<(String, u64)>,
}

fn parse_field(vals: &[&str], ix: usize, name: &str) -> WbResult<u64> {
    vals.get(ix)
        .ok_or_else(|| {
            WbError::Harness(
                ErrorEnum::Control,
                format!("status report too short; missing field {name}"),
            )
        })?
        .parse::<u64>()
        .map_err(|_| {
            WbError::Harness(
                ErrorEnum::Control,
                format!("failed to parse status field {name} from \"{}\"", vals[ix]),
            )
        })
}

impl WriteboostStatus {
    /// Parse the params portion of a writeboost status line.
    pub fn parse(raw: &str) -> WbResult<WriteboostStatus> {
        let vals = raw.split_whitespace().collect::<Vec<_>>();

        let mut status = WriteboostStatus {
            cursor_pos: parse_field(&vals, 0, "cursor_pos")?,
            nr_cache_blocks: parse_field(&vals, 1, "nr_cache_blocks")?,
            nr_segments: parse_field(&vals, 2, "nr_segments")?,
            current_id: parse_field(&vals, 3, "current_id")?,
            last_flushed_id: parse_field(&vals, 4, "last_flushed_id")?,
            last_writeback_id: parse_field(&vals, 5, "last_writeback_id")?,
            nr_dirty_cache_blocks: parse_field(&vals, 6, "nr_dirty_cache_blocks")?,
            stats: Vec::with_capacity(NR_STAT_COUNTERS),
            nr_partial_flushed: 0,
            tunables: Vec::new(),
        };

        for ix in 0..NR_STAT_COUNTERS {
            status.stats.push(parse_field(&vals, 7 + ix, "stat")?);
        }
        status.nr_partial_flushed =
            parse_field(&vals, 7 + NR_STAT_COUNTERS, "nr_partial_flushed")?;

        let tunables_start = 8 + NR_STAT_COUNTERS;
        let nr_tunable_words = parse_field(&vals, tunables_start, "nr_tunable_words")? as usize;
        let words = &vals[tunables_start + 1..];
        if nr_tunable_words % 2 != 0 || words.len() != nr_tunable_words {
            return Err(WbError::Harness(
                ErrorEnum::Control,
                format!(
                    "expected {} tunable words at the end of the status report, found {}",
                    nr_tunable_words,
                    words.len()
                ),
            ));
        }
        for (name, value) in words.iter().tuples() {
            let value = value.parse::<u64>().map_err(|_| {
                WbError::Harness(
                    ErrorEnum::Control,
                    format!("failed to parse status tunable {name} from \"{value}\""),
                )
            })?;
            status.tunables.push(((*name).to_owned(), value));
        }

        Ok(status)
    }

    /// One I/O classification counter.
    pub fn stat(&self, selector: StatSelector) -> u64 {
        self.stats[selector.index()]
    }
}
