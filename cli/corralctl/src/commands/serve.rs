//! Artifact depot command.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use corral_provisioner::depot::Depot;

use crate::output::print_info;

use super::CommandContext;

/// Depot arguments.
#[derive(Debug, Args)]
pub struct ServeCommand {
    /// Directory to serve.
    dir: PathBuf,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0:8000")]
    bind: SocketAddr,
}

impl ServeCommand {
    pub async fn run(self, _ctx: CommandContext) -> Result<()> {
        let depot = Depot::serve(&self.dir, self.bind).await?;
        print_info(&format!(
            "Serving {} at {}",
            self.dir.display(),
            depot.url()
        ));
        print_info("Press ctrl-c to stop");

        tokio::signal::ctrl_c().await?;
        depot.stop().await;
        Ok(())
    }
}
