// SPDX-License-Identifier: Apache-2.0

use structopt::StructOpt;

mod append;

pub trait Command {
    fn execute(self) -> anyhow::Result<()>;
}

#[derive(StructOpt, Debug)]
#[structopt(about = "append filesystem layers to container images, registry to registry")]
pub enum Main {
    Append(append::Append),
}

impl Command for Main {
    fn execute(self) -> anyhow::Result<()> {
        match self {
            Self::Append(cmd) => cmd.execute(),
        }
    }
}
