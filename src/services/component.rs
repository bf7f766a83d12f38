//! Where Kubernetes components keep their files on a machine.

use crate::api;
use crate::pipeline::Context;
use crate::pki::{CertificatePair, CERT_FILE_MODE, KEY_FILE_MODE};
use crate::remote::RemoteClient;
use crate::topology::Node;
use std::path::{Path, PathBuf};
use tracing::info;

/// Trust material shared by every component.
pub const CERTS_DIR: &str = "/etc/kubernetes/pki";

/// Static pod manifests picked up by the kubelet.
pub const MANIFESTS_DIR: &str = "/etc/kubernetes/manifests";

const KUBECONFIGS_DIR: &str = "/var/lib";

pub const MANIFEST_FILE_MODE: u32 = 0o644;
pub const KUBECONFIG_FILE_MODE: u32 = 0o600;

/// A named Kubernetes component and the conventional locations of its files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Component {
    name: &'static str,
}

impl Component {
    pub const fn new(name: &'static str) -> Self {
        Component { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ca_cert_path() -> PathBuf {
        Path::new(CERTS_DIR).join("ca.crt")
    }

    pub fn ca_key_path() -> PathBuf {
        Path::new(CERTS_DIR).join("ca.key")
    }

    pub fn service_account_public_path() -> PathBuf {
        Path::new(CERTS_DIR).join("sa.pub")
    }

    pub fn service_account_private_path() -> PathBuf {
        Path::new(CERTS_DIR).join("sa.key")
    }

    /// `file` inside the certificates directory.
    pub fn cert_file(file: &str) -> PathBuf {
        Path::new(CERTS_DIR).join(file)
    }

    pub fn manifest_path(file: &str) -> PathBuf {
        Path::new(MANIFESTS_DIR).join(file)
    }

    pub fn cert_path(&self) -> PathBuf {
        Self::cert_file(&format!("{}.crt", self.name))
    }

    pub fn key_path(&self) -> PathBuf {
        Self::cert_file(&format!("{}.key", self.name))
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        Path::new(KUBECONFIGS_DIR).join(format!("{}.conf", self.name))
    }

    /// Issues a serving certificate for `node` and uploads it as `<name>.crt` and `<name>.key`.
    pub async fn upload_certificates(
        &self,
        common_name: &str,
        organization: &str,
        node: &Node,
        client: &RemoteClient,
        ctx: &Context<'_>,
        extra_alt_names: &[String],
    ) -> anyhow::Result<()> {
        info!(host = %node.name, component = self.name, "Uploading TLS certificates");
        let pair = ctx.deps.kubernetes_ca()?.issue_server_certificate(
            common_name,
            organization,
            node,
            extra_alt_names,
        )?;
        upload_pair(client, self.cert_path(), self.key_path(), &pair).await
    }

    pub async fn remove_certificates(&self, client: &RemoteClient) -> anyhow::Result<()> {
        client.remove_file(self.cert_path()).await?;
        client.remove_file(self.key_path()).await
    }

    /// Renders a kubeconfig that authenticates as `common_name` and uploads it to
    /// `/var/lib/<name>.conf`.
    pub async fn create_kubeconfig(
        &self,
        common_name: &str,
        organization: &str,
        node: &Node,
        client: &RemoteClient,
        ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        let ca = ctx.deps.kubernetes_ca()?;
        let credentials = ca.issue_server_certificate(common_name, organization, node, &[])?;
        let server = api::api_server_url(ctx.topology, ctx.flags)?;
        let kubeconfig = api::kubeconfig(&server, ca.cert_pem(), self.name, &credentials)?;
        client
            .update_file(
                self.kubeconfig_path(),
                kubeconfig.as_bytes(),
                KUBECONFIG_FILE_MODE,
            )
            .await
    }

    pub async fn remove_kubeconfig(&self, client: &RemoteClient) -> anyhow::Result<()> {
        client.remove_file(self.kubeconfig_path()).await
    }
}

/// Uploads a certificate and its key with their respective modes.
pub async fn upload_pair(
    client: &RemoteClient,
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    pair: &CertificatePair,
) -> anyhow::Result<()> {
    client
        .update_file(cert_path, pair.cert_pem.as_bytes(), CERT_FILE_MODE)
        .await?;
    client
        .update_file(key_path, pair.key_pem.as_bytes(), KEY_FILE_MODE)
        .await
}
