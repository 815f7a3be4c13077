// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Get ability to instantiate a devicemapper context.

use std::sync::OnceLock;

use devicemapper::{DmError, DM};

use crate::errors::{WbError, WbResult};

pub const DEVICEMAPPER_PATH: &str = "/dev/mapper";

static DM_CONTEXT: OnceLock<Result<DM, DmError>> = OnceLock::new();

/// Initialize the global devicemapper context if necessary and return it.
pub fn get_dm_init() -> WbResult<&'static DM> {
    match DM_CONTEXT.get_or_init(DM::new) {
        Ok(dm) => Ok(dm),
        Err(err) => Err(WbError::Msg(format!(
            "failed to initialize the devicemapper context: {err}"
        ))),
    }
}

/// Get the global devicemapper context.
///
/// Precondition: get_dm_init() has succeeded once during harness setup.
pub fn get_dm() -> &'static DM {
    get_dm_init().expect("get_dm_init() has already succeeded during harness setup")
}
