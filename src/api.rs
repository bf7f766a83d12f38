//! The declarative API of a running control plane.
//!
//! Cluster-scoped services talk to the API server through [ClusterApi] once the readiness probe
//! has succeeded. The production implementation authenticates with an administrator certificate
//! issued on the fly by the cluster CA.

use crate::config::Flags;
use crate::error::Error;
use crate::pki::{CertificateAuthority, CertificatePair};
use crate::template;
use crate::topology::Topology;
use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{Api, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::net::IpAddr;
use tracing::{debug, info};

/// Name of the cluster inside generated kubeconfig files.
pub const CLUSTER_NAME: &str = "kubernetes";

const KUBECONFIG_TEMPLATE: &str = r#"apiVersion: v1
kind: Config
clusters:
- name: {{ cluster }}
  cluster:
    server: {{ server }}
    certificate-authority-data: {{ ca_data }}
users:
- name: "{{ user }}"
  user:
    client-certificate-data: {{ cert_data }}
    client-key-data: {{ key_data }}
contexts:
- name: "{{ user }}@{{ cluster }}"
  context:
    cluster: {{ cluster }}
    user: "{{ user }}"
current-context: "{{ user }}@{{ cluster }}"
"#;

#[derive(Serialize)]
struct KubeconfigOptions<'a> {
    cluster: &'a str,
    server: &'a str,
    ca_data: String,
    user: &'a str,
    cert_data: String,
    key_data: String,
}

/// Renders a kubeconfig that authenticates as `user` with `credentials` against `server`.
///
/// All PEM material is embedded, base64 encoded.
pub fn kubeconfig(
    server: &str,
    ca_cert_pem: &str,
    user: &str,
    credentials: &CertificatePair,
) -> Result<String, Error> {
    template::render(
        KUBECONFIG_TEMPLATE,
        &KubeconfigOptions {
            cluster: CLUSTER_NAME,
            server,
            ca_data: STANDARD.encode(ca_cert_pem),
            user,
            cert_data: STANDARD.encode(&credentials.cert_pem),
            key_data: STANDARD.encode(&credentials.key_pem),
        },
    )
}

/// Returns the HTTPS URL of the API server, as seen by clients.
pub fn api_server_url(topology: &Topology, flags: &Flags) -> anyhow::Result<String> {
    let host = topology.api_server_address()?;
    let host = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(address)) => format!("[{address}]"),
        _ => host,
    };
    Ok(format!("https://{host}:{}", flags.kubernetes.api_server_port))
}

/// An object that cluster-scoped services create.
#[derive(Clone, Debug)]
pub enum ApiObject {
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    ConfigMap(ConfigMap),
    DaemonSet(DaemonSet),
    Deployment(Deployment),
    Service(Service),
}

impl ApiObject {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiObject::ServiceAccount(_) => "ServiceAccount",
            ApiObject::ClusterRole(_) => "ClusterRole",
            ApiObject::ClusterRoleBinding(_) => "ClusterRoleBinding",
            ApiObject::ConfigMap(_) => "ConfigMap",
            ApiObject::DaemonSet(_) => "DaemonSet",
            ApiObject::Deployment(_) => "Deployment",
            ApiObject::Service(_) => "Service",
        }
    }

    pub fn name(&self) -> Option<&str> {
        let metadata = match self {
            ApiObject::ServiceAccount(o) => &o.metadata,
            ApiObject::ClusterRole(o) => &o.metadata,
            ApiObject::ClusterRoleBinding(o) => &o.metadata,
            ApiObject::ConfigMap(o) => &o.metadata,
            ApiObject::DaemonSet(o) => &o.metadata,
            ApiObject::Deployment(o) => &o.metadata,
            ApiObject::Service(o) => &o.metadata,
        };
        metadata.name.as_deref()
    }
}

/// The operations Helix needs from a running API server.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Returns how many nodes have registered.
    async fn list_nodes(&self) -> anyhow::Result<usize>;

    /// Creates `object`, or replaces it if it already exists.
    async fn create_or_update(&self, object: ApiObject) -> anyhow::Result<()>;
}

/// Opens a [ClusterApi] to a cluster.
#[async_trait]
pub trait ConnectApi: Send + Sync {
    async fn connect(
        &self,
        topology: &Topology,
        ca: &CertificateAuthority,
        flags: &Flags,
    ) -> anyhow::Result<Box<dyn ClusterApi>>;
}

/// Production implementation of [ConnectApi], based on [kube].
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeConnector;

#[async_trait]
impl ConnectApi for KubeConnector {
    async fn connect(
        &self,
        topology: &Topology,
        ca: &CertificateAuthority,
        flags: &Flags,
    ) -> anyhow::Result<Box<dyn ClusterApi>> {
        let server = api_server_url(topology, flags)?;
        let admin = ca.issue_client_certificate("admin", "system:masters")?;
        let yaml = kubeconfig(&server, ca.cert_pem(), "admin", &admin)?;

        let kubeconfig = Kubeconfig::from_yaml(&yaml).context("invalid admin kubeconfig")?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("failed to configure the API client")?;
        let client = Client::try_from(config).context("failed to create the API client")?;
        debug!(%server, "Connected to the API server");
        Ok(Box::new(KubeApi { client }))
    }
}

/// Production implementation of [ClusterApi].
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
}

/// Namespace of everything Helix creates that isn't cluster scoped.
pub const SYSTEM_NAMESPACE: &str = "kube-system";

#[async_trait]
impl ClusterApi for KubeApi {
    async fn list_nodes(&self) -> anyhow::Result<usize> {
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        Ok(nodes.items.len())
    }

    async fn create_or_update(&self, object: ApiObject) -> anyhow::Result<()> {
        let client = self.client.clone();
        let result = match &object {
            ApiObject::ServiceAccount(o) => {
                create_or_replace(Api::namespaced(client, SYSTEM_NAMESPACE), o).await
            }
            ApiObject::ConfigMap(o) => {
                create_or_replace(Api::namespaced(client, SYSTEM_NAMESPACE), o).await
            }
            ApiObject::DaemonSet(o) => {
                create_or_replace(Api::namespaced(client, SYSTEM_NAMESPACE), o).await
            }
            ApiObject::Deployment(o) => {
                create_or_replace(Api::namespaced(client, SYSTEM_NAMESPACE), o).await
            }
            ApiObject::Service(o) => {
                create_or_replace(Api::namespaced(client, SYSTEM_NAMESPACE), o).await
            }
            ApiObject::ClusterRole(o) => create_or_replace(Api::all(client), o).await,
            ApiObject::ClusterRoleBinding(o) => create_or_replace(Api::all(client), o).await,
        };
        result.with_context(|| {
            format!(
                "failed to create or update {} {}",
                object.kind(),
                object.name().unwrap_or_default()
            )
        })
    }
}

async fn create_or_replace<K>(api: Api<K>, object: &K) -> anyhow::Result<()>
where
    K: Resource + Clone + Debug + DeserializeOwned + Serialize,
{
    let name = object
        .meta()
        .name
        .clone()
        .context("object has no name")?;
    match api.create(&PostParams::default(), object).await {
        Ok(_) => {
            info!(%name, "Created");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            api.replace(&name, &PostParams::default(), object).await?;
            info!(%name, "Updated");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
