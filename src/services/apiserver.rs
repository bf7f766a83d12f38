use super::component::{self, Component, MANIFEST_FILE_MODE};
use super::etcd;
use crate::config::Flags;
use crate::pipeline::{Context, OperateMachine};
use crate::remote::RemoteClient;
use crate::topology::{Node, Topology};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

const COMPONENT: Component = Component::new("apiserver");
const MANIFEST_FILE: &str = "kube-apiserver.yaml";

const MANIFEST_TEMPLATE: &str = r#"apiVersion: v1
kind: Pod
metadata:
  annotations:
    scheduler.alpha.kubernetes.io/critical-pod: ""
  labels:
    component: kube-apiserver
    tier: control-plane
  name: {{ pod_name }}
  namespace: kube-system
spec:
  containers:
  - command:
    - /hyperkube
    - kube-apiserver
    - --advertise-address={{ advertise_address }}
    - --allow-privileged=true
    - --authorization-mode=Node,RBAC
    - --client-ca-file={{ ca_file }}
    - --enable-admission-plugins=NamespaceLifecycle,LimitRanger,ServiceAccount,DefaultStorageClass,DefaultTolerationSeconds,NodeRestriction,ResourceQuota
    - --enable-bootstrap-token-auth=true
    - --etcd-cafile={{ etcd_ca_file }}
    - --etcd-certfile={{ etcd_cert_file }}
    - --etcd-keyfile={{ etcd_key_file }}
    - --etcd-servers={{ etcd_endpoints }}
{%- if feature_gates %}
    - --feature-gates={{ feature_gates }}
{%- endif %}
    - --insecure-port=0
    - --kubelet-certificate-authority={{ ca_file }}
    - --kubelet-client-certificate={{ kubelet_cert_file }}
    - --kubelet-client-key={{ kubelet_key_file }}
    - --kubelet-preferred-address-types=InternalIP,ExternalIP,Hostname
    - --proxy-client-cert-file={{ proxy_cert_file }}
    - --proxy-client-key-file={{ proxy_key_file }}
    - --requestheader-allowed-names=
    - --requestheader-client-ca-file={{ ca_file }}
    - --requestheader-extra-headers-prefix=X-Remote-Extra-
    - --requestheader-group-headers=X-Remote-Group
    - --requestheader-username-headers=X-Remote-User
    - --secure-port={{ port }}
    - --service-account-key-file={{ service_account_file }}
    - --service-cluster-ip-range={{ service_cluster_ip_range }}
    - --tls-cert-file={{ cert_file }}
    - --tls-private-key-file={{ key_file }}
    image: {{ image }}
    livenessProbe:
      failureThreshold: 8
      httpGet:
        host: 127.0.0.1
        path: /healthz
        port: {{ port }}
        scheme: HTTPS
      initialDelaySeconds: 15
      timeoutSeconds: 15
    name: kube-apiserver
    resources:
      requests:
        cpu: 250m
    volumeMounts:
    - mountPath: {{ pki_dir }}
      name: k8s-certs
      readOnly: true
    - mountPath: /etc/ssl/certs
      name: ca-certs
      readOnly: true
  hostNetwork: true
  volumes:
  - hostPath:
      path: {{ pki_dir }}
      type: DirectoryOrCreate
    name: k8s-certs
  - hostPath:
      path: /etc/ssl/certs
      type: DirectoryOrCreate
    name: ca-certs
"#;

#[derive(Debug, Serialize)]
struct Options {
    pod_name: String,
    image: String,
    advertise_address: String,
    port: u16,
    pki_dir: &'static str,
    ca_file: PathBuf,
    cert_file: PathBuf,
    key_file: PathBuf,
    kubelet_cert_file: PathBuf,
    kubelet_key_file: PathBuf,
    proxy_cert_file: PathBuf,
    proxy_key_file: PathBuf,
    service_account_file: PathBuf,
    service_cluster_ip_range: String,
    feature_gates: String,
    etcd_endpoints: String,
    etcd_ca_file: PathBuf,
    etcd_cert_file: PathBuf,
    etcd_key_file: PathBuf,
}

fn kubelet_client_paths() -> (PathBuf, PathBuf) {
    (
        Component::cert_file("apiserver-kubelet-client.crt"),
        Component::cert_file("apiserver-kubelet-client.key"),
    )
}

fn front_proxy_paths() -> (PathBuf, PathBuf) {
    (
        Component::cert_file("front-proxy.crt"),
        Component::cert_file("front-proxy.key"),
    )
}

/// Names the API server answers to, besides the node's own address and name.
pub fn alt_names(topology: &Topology, flags: &Flags) -> anyhow::Result<Vec<String>> {
    let domain = &flags.kubernetes.cluster_domain;
    let mut names = vec![
        "127.0.0.1".to_owned(),
        flags.kubernetes.first_service_ip()?.to_string(),
        format!("kubernetes.default.svc.{domain}"),
        "kubernetes.default.svc".to_owned(),
        "kubernetes.default".to_owned(),
        "kubernetes".to_owned(),
    ];
    if let Some(ip) = topology.api_server_virtual_ip() {
        names.push(ip.to_string());
    }
    if let Some(name) = topology.api_server_dns_name() {
        names.push(name.to_owned());
    }
    Ok(names)
}

/// Runs the API server as a static pod on every control-plane machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct ApiServerService;

#[async_trait]
impl OperateMachine for ApiServerService {
    async fn init_machine(
        &self,
        node: &Node,
        client: &RemoteClient,
        ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        if !node.is_control_plane {
            return Ok(());
        }
        let flags = ctx.flags;
        let ca = ctx.deps.kubernetes_ca()?;

        let alt_names = alt_names(ctx.topology, flags)?;
        info!(host = %node.name, ?alt_names, "Creating API server certificates");
        COMPONENT
            .upload_certificates(
                "kubernetes",
                "Kubernetes API Server",
                node,
                client,
                ctx,
                &alt_names,
            )
            .await?;

        let (proxy_cert, proxy_key) = front_proxy_paths();
        let proxy = ca.issue_client_certificate("front-proxy-client", "Kubernetes Front Proxy")?;
        component::upload_pair(client, &proxy_cert, &proxy_key, &proxy).await?;

        let (kubelet_cert, kubelet_key) = kubelet_client_paths();
        let kubelet = ca.issue_client_certificate("kube-apiserver-kubelet-client", "system:masters")?;
        component::upload_pair(client, &kubelet_cert, &kubelet_key, &kubelet).await?;

        let options = Options {
            pod_name: format!("kube-apiserver-{}", node.name),
            image: flags
                .images
                .hyperkube(node.architecture()?, &flags.kubernetes.version),
            advertise_address: node.address.to_string(),
            port: flags.kubernetes.api_server_port,
            pki_dir: component::CERTS_DIR,
            ca_file: Component::ca_cert_path(),
            cert_file: COMPONENT.cert_path(),
            key_file: COMPONENT.key_path(),
            kubelet_cert_file: kubelet_cert,
            kubelet_key_file: kubelet_key,
            proxy_cert_file: proxy_cert,
            proxy_key_file: proxy_key,
            service_account_file: Component::service_account_public_path(),
            service_cluster_ip_range: flags.kubernetes.service_cluster_ip_range.clone(),
            feature_gates: flags.kubernetes.feature_gates.join(","),
            etcd_endpoints: etcd::client_endpoints(ctx.topology, flags),
            etcd_ca_file: etcd::client_ca_path(),
            etcd_cert_file: etcd::client_cert_path(),
            etcd_key_file: etcd::client_key_path(),
        };
        client
            .render(
                MANIFEST_TEMPLATE,
                Component::manifest_path(MANIFEST_FILE),
                &options,
                MANIFEST_FILE_MODE,
            )
            .await
    }

    async fn reset_machine(
        &self,
        node: &Node,
        client: &RemoteClient,
        _ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        if !node.is_control_plane {
            return Ok(());
        }
        client
            .remove_file(Component::manifest_path(MANIFEST_FILE))
            .await?;
        COMPONENT.remove_certificates(client).await?;
        let (proxy_cert, proxy_key) = front_proxy_paths();
        let (kubelet_cert, kubelet_key) = kubelet_client_paths();
        for path in [proxy_cert, proxy_key, kubelet_cert, kubelet_key] {
            client.remove_file(path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::fixtures::node;

    #[test]
    fn alt_names_cover_service_names_and_the_virtual_ip() {
        let topology = Topology::new(
            vec![node("m1", "10.0.0.1", true)],
            Some("10.0.0.100".parse().unwrap()),
            Some("k8s.example.com".to_owned()),
        );

        let names = alt_names(&topology, &Flags::default()).unwrap();

        assert_eq!(
            vec![
                "127.0.0.1",
                "10.71.0.1",
                "kubernetes.default.svc.cluster.local",
                "kubernetes.default.svc",
                "kubernetes.default",
                "kubernetes",
                "10.0.0.100",
                "k8s.example.com",
            ],
            names
        );
    }
}
