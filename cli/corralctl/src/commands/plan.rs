//! Topology preview.

use anyhow::Result;
use clap::Args;

use corral_topology::describe;

use crate::output::print_single;

use super::{ClusterArgs, CommandContext};

/// Plan arguments.
#[derive(Debug, Args)]
pub struct PlanCommand {
    #[command(flatten)]
    cluster: ClusterArgs,
}

impl PlanCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let topology = describe(&self.cluster.spec(&ctx.env_name))?;
        print_single(&topology, ctx.format);
        Ok(())
    }
}
