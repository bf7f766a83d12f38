use super::component::{Component, MANIFESTS_DIR};
use super::{cni, hyperkube};
use crate::pipeline::{Context, OperateMachine};
use crate::remote::RemoteClient;
use crate::topology::Node;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

const COMPONENT: Component = Component::new("kubelet");
const UNIT_PATH: &str = "/etc/systemd/system/kubelet.service";
const UNIT_FILE_MODE: u32 = 0o644;

const UNIT_TEMPLATE: &str = r#"[Unit]
Description=Kubernetes Kubelet Server
Requires=docker.service network-online.target
After=docker.service network-online.target

[Service]
ExecStartPre=/bin/mkdir -p /var/lib/kubelet
ExecStart={{ hyperkube_path }} kubelet \
    --allow-privileged=true \
    --authorization-mode=AlwaysAllow \
    --cgroup-driver=cgroupfs \
    --client-ca-file={{ client_ca_path }} \
    --cluster-dns={{ cluster_dns }} \
    --cluster-domain={{ cluster_domain }} \
    --cni-bin-dir={{ cni_bin_dir }} \
    --cni-conf-dir=/etc/cni/net.d \
    --container-runtime=docker \
{%- if feature_gates %}
    --feature-gates={{ feature_gates }} \
{%- endif %}
    --hairpin-mode=none \
    --hostname-override={{ node_name }} \
    --kubeconfig={{ kubeconfig_path }} \
    --network-plugin=cni \
    --pod-manifest-path={{ manifests_dir }} \
    --register-node=true \
    --tls-cert-file={{ cert_path }} \
    --tls-private-key-file={{ key_path }} \
    --v=2
Restart=always
StartLimitInterval=0
RestartSec=10
KillMode=process

[Install]
WantedBy=multi-user.target
"#;

#[derive(Debug, Serialize)]
struct Options {
    node_name: String,
    hyperkube_path: String,
    cni_bin_dir: &'static str,
    cluster_dns: String,
    cluster_domain: String,
    feature_gates: String,
    kubeconfig_path: PathBuf,
    manifests_dir: &'static str,
    cert_path: PathBuf,
    key_path: PathBuf,
    client_ca_path: PathBuf,
}

/// Runs the node agent on every machine as a systemd service.
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeletService;

#[async_trait]
impl OperateMachine for KubeletService {
    async fn init_machine(
        &self,
        node: &Node,
        client: &RemoteClient,
        ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        let kubernetes = &ctx.flags.kubernetes;
        let options = Options {
            node_name: node.name.clone(),
            hyperkube_path: hyperkube::binary_path(&kubernetes.version),
            cni_bin_dir: cni::BIN_DIR,
            cluster_dns: kubernetes.cluster_dns.clone(),
            cluster_domain: kubernetes.cluster_domain.clone(),
            feature_gates: kubernetes.feature_gates.join(","),
            kubeconfig_path: COMPONENT.kubeconfig_path(),
            manifests_dir: MANIFESTS_DIR,
            cert_path: COMPONENT.cert_path(),
            key_path: COMPONENT.key_path(),
            client_ca_path: Component::ca_cert_path(),
        };

        let identity = format!("system:node:{}", node.name);
        COMPONENT
            .upload_certificates(&identity, "system:nodes", node, client, ctx, &[])
            .await?;
        COMPONENT
            .create_kubeconfig(&identity, "system:nodes", node, client, ctx)
            .await?;

        info!(host = %node.name, "Installing kubelet service");
        client
            .render(UNIT_TEMPLATE, UNIT_PATH, &options, UNIT_FILE_MODE)
            .await?;
        client.run("sudo systemctl daemon-reload", None, false).await?;
        client.run("sudo systemctl enable kubelet", None, false).await?;
        client.run("sudo systemctl restart kubelet", None, false).await?;
        Ok(())
    }

    async fn reset_machine(
        &self,
        _node: &Node,
        client: &RemoteClient,
        _ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        client.run_best_effort("sudo systemctl stop kubelet").await;
        client.run_best_effort("sudo systemctl disable kubelet").await;
        client.remove_file(UNIT_PATH).await?;
        COMPONENT.remove_kubeconfig(client).await?;
        COMPONENT.remove_certificates(client).await
    }
}
