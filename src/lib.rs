// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Harness for exercising dm-writeboost device stacks under normal
//! operation, migration replay, and induced device failure.
//!
//! The harness composes a writeboost target over backing and cache support
//! devices, guarantees teardown on every exit path, and drives the target
//! through its control plane so tests can assert on a quiesced state.

#[macro_use]
extern crate log;

pub mod errors;
pub mod harness;

pub use crate::errors::{ErrorEnum, WbError, WbResult};
