use super::component::{self, Component, CERTS_DIR};
use crate::pipeline::{Context, OperateMachine};
use crate::pki::{CERT_FILE_MODE, KEY_FILE_MODE};
use crate::remote::RemoteClient;
use crate::topology::Node;
use async_trait::async_trait;
use tracing::info;

/// Distributes the cluster root.
///
/// Every machine gets the CA certificate. Control-plane machines also get the CA key, the
/// service-account keys, and an administrator certificate.
#[derive(Clone, Copy, Debug, Default)]
pub struct CaService;

#[async_trait]
impl OperateMachine for CaService {
    async fn init_machine(
        &self,
        node: &Node,
        client: &RemoteClient,
        ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        let ca = ctx.deps.kubernetes_ca()?;
        client
            .update_file(
                Component::ca_cert_path(),
                ca.cert_pem().as_bytes(),
                CERT_FILE_MODE,
            )
            .await?;
        if !node.is_control_plane {
            return Ok(());
        }

        info!(host = %node.name, "Uploading control-plane trust material");
        client
            .update_file(
                Component::ca_key_path(),
                ca.key_pem().as_bytes(),
                KEY_FILE_MODE,
            )
            .await?;

        let service_account = ctx.deps.service_account()?;
        client
            .update_file(
                Component::service_account_public_path(),
                service_account.public_key_pem().as_bytes(),
                CERT_FILE_MODE,
            )
            .await?;
        client
            .update_file(
                Component::service_account_private_path(),
                service_account.private_key_pem().as_bytes(),
                KEY_FILE_MODE,
            )
            .await?;

        let admin = ca.issue_client_certificate("admin", "system:masters")?;
        component::upload_pair(
            client,
            Component::cert_file("admin.crt"),
            Component::cert_file("admin.key"),
            &admin,
        )
        .await
    }

    async fn reset_machine(
        &self,
        _node: &Node,
        client: &RemoteClient,
        _ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        client.remove_directory(CERTS_DIR).await
    }
}
