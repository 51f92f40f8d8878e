// SPDX-License-Identifier: Apache-2.0

mod api;
mod commands;
mod error;
mod formats;
mod iotools;
mod queue;

use commands::Command;
use structopt::StructOpt;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    commands::Main::from_args().execute()
}
