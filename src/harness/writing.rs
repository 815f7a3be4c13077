// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Functions to unify writing to devices.

use std::{
    fs::OpenOptions,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use devicemapper::{Sectors, SECTOR_SIZE};

use crate::errors::{ErrorEnum, WbError, WbResult};

/// A sector offset as a byte count for seeking.
fn byte_offset(offset: Sectors) -> WbResult<u64> {
    u64::try_from(*offset.bytes())
        .map_err(|_| WbError::Msg(format!("sector offset {} exceeds u64 bytes", *offset)))
}

/// Write buf at offset length times.
fn write_sectors<P: AsRef<Path>>(
    path: P,
    offset: Sectors,
    length: Sectors,
    buf: &[u8; SECTOR_SIZE],
) -> WbResult<()> {
    let mut f = OpenOptions::new().write(true).open(path)?;

    f.seek(SeekFrom::Start(byte_offset(offset)?))?;
    for _ in 0..*length {
        f.write_all(buf)?;
    }

    f.sync_all()?;
    Ok(())
}

/// Zero sectors at the given offset for length sectors.
pub fn wipe_sectors<P: AsRef<Path>>(path: P, offset: Sectors, length: Sectors) -> WbResult<()> {
    write_sectors(path, offset, length, &[0u8; SECTOR_SIZE])
}

/// Stamps a deterministic pattern over a device region and verifies it
/// byte-for-byte later, across deactivation and reactivation of the stack.
#[derive(Debug, Clone, Copy)]
pub struct PatternWriter {
    seed: u64,
}

impl PatternWriter {
    pub fn new(seed: u64) -> PatternWriter {
        PatternWriter { seed }
    }

    /// The pattern for one sector; a function of the seed and the sector's
    /// index so that misplaced writes are detected, not just lost ones.
    fn sector_pattern(&self, index: u64) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        let mut state = self.seed ^ index.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        for chunk in buf.chunks_mut(8) {
            // xorshift64; cheap and reproducible
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            chunk.copy_from_slice(&state.to_le_bytes()[..chunk.len()]);
        }
        buf
    }

    /// Write the pattern over `length` sectors starting at `offset`.
    pub fn stamp(&self, path: &Path, offset: Sectors, length: Sectors) -> WbResult<()> {
        for ix in 0..*length {
            write_sectors(
                path,
                offset + Sectors(ix),
                Sectors(1),
                &self.sector_pattern(ix),
            )?;
        }
        Ok(())
    }

    /// Re-read the region and fail on the first sector that differs from
    /// the stamped pattern.
    pub fn verify(&self, path: &Path, offset: Sectors, length: Sectors) -> WbResult<()> {
        let mut f = OpenOptions::new().read(true).open(path)?;
        f.seek(SeekFrom::Start(byte_offset(offset)?))?;

        let mut buf = [0u8; SECTOR_SIZE];
        for ix in 0..*length {
            f.read_exact(&mut buf)?;
            if buf != self.sector_pattern(ix) {
                return Err(WbError::Harness(
                    ErrorEnum::Assertion,
                    format!(
                        "pattern mismatch at sector {} of {}",
                        *offset + ix,
                        path.display()
                    ),
                ));
            }
        }
        Ok(())
    }
}
