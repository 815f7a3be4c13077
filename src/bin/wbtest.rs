// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Run one end-to-end writeboost scenario against operator-supplied
//! devices. Both devices are used exclusively and their contents are
//! destroyed.

use std::{path::PathBuf, process::exit};

use clap::{Parser, Subcommand};

use wbtest::{
    harness::{cmd, dm::get_dm_init, scenarios},
    WbResult,
};

#[derive(Parser)]
#[command(name = "wbtest", about = "Exercise a dm-writeboost stack on real devices")]
struct Args {
    /// The slow block device the writeboost target writes back to
    #[arg(long)]
    slow_dev: PathBuf,
    /// The fast block device holding the cache
    #[arg(long)]
    fast_dev: PathBuf,
    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand)]
enum Scenario {
    /// Write many small files, force a flush, require zero dirty blocks
    SmallFiles {
        #[arg(long, default_value_t = 10_000)]
        count: usize,
    },
    /// Fill the cache without migration, then replay the log and verify
    MigrationReplay,
    /// Read back data still sitting on the RAM buffer
    RambufRead,
    /// Fail a support device under load, restore, and unmap cleanly
    DeviceFailure {
        #[arg(long, default_value_t = 5)]
        rounds: usize,
    },
}

fn run(args: &Args) -> WbResult<()> {
    cmd::verify_binaries()?;
    get_dm_init()?;
    match args.scenario {
        Scenario::SmallFiles { count } => {
            scenarios::small_files(&args.slow_dev, &args.fast_dev, count)
        }
        Scenario::MigrationReplay => scenarios::migration_replay(&args.slow_dev, &args.fast_dev),
        Scenario::RambufRead => scenarios::rambuf_read(&args.slow_dev, &args.fast_dev),
        Scenario::DeviceFailure { rounds } => {
            scenarios::device_failure(&args.slow_dev, &args.fast_dev, rounds)
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("wbtest: {err}");
        exit(1);
    }
}
