use crate::config::Flags;
use crate::error::Error;
use crate::pipeline::InitNode;
use crate::remote::RemoteClient;
use crate::topology::{Architecture, Node};
use async_trait::async_trait;
use tracing::info;

/// Fills in the architecture of every node that doesn't have one yet.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArchitectureService;

#[async_trait]
impl InitNode for ArchitectureService {
    async fn init_node(
        &self,
        node: &mut Node,
        client: &RemoteClient,
        _flags: &Flags,
    ) -> anyhow::Result<()> {
        if node.architecture.is_some() {
            return Ok(());
        }
        if client.is_dry_run() {
            return Err(Error::configuration(format!(
                "can't detect the architecture of {} in dry-run mode; pass --architecture",
                node.name
            ))
            .into());
        }

        let machine = client.run("uname -m", None, true).await?;
        let architecture = Architecture::from_uname(&machine)?;
        info!(host = %node.name, %architecture, "Detected architecture");
        node.architecture = Some(architecture);
        Ok(())
    }
}
