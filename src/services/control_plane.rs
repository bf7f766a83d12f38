use crate::pipeline::{Context, InitCluster};
use crate::probe;
use async_trait::async_trait;
use tracing::info;

/// Blocks until the API server answers with at least one registered node.
#[derive(Clone, Copy, Debug, Default)]
pub struct ControlPlaneService;

#[async_trait]
impl InitCluster for ControlPlaneService {
    async fn init_cluster(&self, ctx: &Context<'_>) -> anyhow::Result<()> {
        let api = ctx.connect_api().await?;
        info!("Waiting for the control plane to respond");
        probe::wait_until_responsive(api.as_ref(), &ctx.deps.probe).await
    }
}
