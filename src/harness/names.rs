// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Functions for dealing with the harness's device mapper names.

use std::fmt::{self, Display};

use devicemapper::{DmNameBuf, DmUuidBuf};
use uuid::Uuid;

const FORMAT_VERSION: u16 = 1;

/// Prefix shared by every device the harness maps; teardown code uses it to
/// find leftovers after an aborted run.
pub const HARNESS_DM_PREFIX: &str = "wbtest-";

/// The role a DM device plays within one activated stack.
#[derive(Clone, Copy)]
pub enum DeviceRole {
    /// The slow support device the writeboost target writes back to.
    Backing,
    /// The fast support device holding the cache blocks.
    CacheStore,
    /// The top-level writeboost device handed to the test body.
    TopLevel,
}

impl Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DeviceRole::Backing => write!(f, "backing"),
            DeviceRole::CacheStore => write!(f, "cachestore"),
            DeviceRole::TopLevel => write!(f, "wb"),
        }
    }
}

/// Format a name & uuid for one device of a stack activation.
///
/// Prerequisite: len(format!("{}", FORMAT_VERSION))
///             + len("wbtest")                          6
///             + num_dashes                             3
///             + len(run uuid)                          32
///             + max(len(DeviceRole))                   10
///             < 128 (129 for UUID)
pub fn format_stack_ids(run: Uuid, role: DeviceRole) -> (DmNameBuf, DmUuidBuf) {
    let value = format!("wbtest-{}-{}-{}", FORMAT_VERSION, run.simple(), role);
    (
        DmNameBuf::new(value.clone()).expect("FORMAT_VERSION display length < 77"),
        DmUuidBuf::new(value).expect("FORMAT_VERSION display length < 78"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Names stay within the DM name limit and carry the harness prefix
    /// for every role.
    #[test]
    fn test_name_format() {
        let run = Uuid::new_v4();
        for role in [
            DeviceRole::Backing,
            DeviceRole::CacheStore,
            DeviceRole::TopLevel,
        ] {
            let (name, uuid) = format_stack_ids(run, role);
            assert!(name.to_string().starts_with(HARNESS_DM_PREFIX));
            assert_eq!(name.to_string(), uuid.to_string());
        }
    }

    /// Roles produce distinct names for the same run.
    #[test]
    fn test_roles_distinct() {
        let run = Uuid::new_v4();
        let (backing, _) = format_stack_ids(run, DeviceRole::Backing);
        let (cache, _) = format_stack_ids(run, DeviceRole::CacheStore);
        let (wb, _) = format_stack_ids(run, DeviceRole::TopLevel);
        assert_ne!(backing.to_string(), cache.to_string());
        assert_ne!(cache.to_string(), wb.to_string());
        assert_ne!(backing.to_string(), wb.to_string());
    }
}
