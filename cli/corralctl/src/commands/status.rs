//! Environment status.

use std::net::IpAddr;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{print_info, print_output, print_single, OutputFormat};

use super::CommandContext;

/// Status arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {}

/// Node row for the status table.
#[derive(Debug, Serialize, Tabled)]
struct NodeRow {
    #[tabled(rename = "Node")]
    name: String,

    #[tabled(rename = "Role")]
    role: String,

    #[tabled(rename = "Memory (MiB)")]
    memory_mib: u32,

    #[tabled(rename = "Address", display = "display_option")]
    address: Option<IpAddr>,
}

fn display_option(opt: &Option<IpAddr>) -> String {
    opt.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

impl StatusCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let backend = ctx.backend();
        let environment = backend
            .load(&ctx.env_name)
            .await?
            .ok_or_else(|| CliError::NoEnvironment(ctx.env_name.clone()))?;

        match ctx.format {
            OutputFormat::Table => {
                print_info(&format!(
                    "Environment '{}' created {}",
                    environment.name, environment.created_at
                ));
                let rows: Vec<NodeRow> = environment
                    .topology
                    .nodes
                    .iter()
                    .map(|node| NodeRow {
                        name: node.name.clone(),
                        role: node.role.as_str().to_string(),
                        memory_mib: node.memory_mib,
                        address: node.address,
                    })
                    .collect();
                print_output(&rows, ctx.format);
            }
            OutputFormat::Json => print_single(&environment, ctx.format),
        }
        Ok(())
    }
}
