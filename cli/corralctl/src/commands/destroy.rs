//! Tear-down command.

use anyhow::Result;
use clap::Args;

use crate::output::{print_info, print_success};

use super::CommandContext;

/// Tear-down arguments.
#[derive(Debug, Args)]
pub struct DestroyCommand {}

impl DestroyCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let backend = ctx.backend();
        match backend.load(&ctx.env_name).await? {
            Some(mut environment) => {
                backend.destroy(&mut environment).await?;
                print_success(&format!("Environment '{}' destroyed", ctx.env_name));
            }
            // Destroying what does not exist is not an error.
            None => print_info(&format!("No environment named '{}'", ctx.env_name)),
        }
        Ok(())
    }
}
