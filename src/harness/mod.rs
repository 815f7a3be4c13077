// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub mod alloc;
pub mod cmd;
pub mod control;
pub mod device;
pub mod dm;
pub mod flakey;
pub mod fs;
pub mod guard;
pub mod names;
pub mod scenarios;
pub mod stack;
pub mod status;
pub mod table;
pub mod writing;

#[cfg(test)]
pub mod tests;

pub use self::{
    alloc::{Volume, VolumeMgr},
    device::DevHandle,
    flakey::FaultWindow,
    guard::{bracket, bracket_, protect, protect_},
    stack::{StackSpec, StackVariant, SupportDevs},
    status::WriteboostStatus,
    table::{Tunables, WbTargetTable},
};
