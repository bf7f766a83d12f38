//! The service proxy, one agent per machine, installed through the API.

use super::addon::{
    apply, arch_selector, binding, config_map_volume, host_path_volume, metadata, mount,
    service_account, string_map, strings, ARCH_LABEL,
};
use crate::api::{self, ApiObject};
use crate::config::Flags;
use crate::pipeline::{Context, InitCluster};
use crate::template;
use crate::topology::Architecture;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, PodSpec, PodTemplateSpec, SecurityContext, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

const NAME: &str = "kube-proxy";
const NODE_PROXIER_ROLE: &str = "system:node-proxier";
const KUBECONFIG_KEY: &str = "kubeconfig.conf";
const CONFIG_DIR: &str = "/var/lib/kube-proxy";
const XTABLES_LOCK: &str = "/run/xtables.lock";

const KUBECONFIG_TEMPLATE: &str = r#"apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority: /var/run/secrets/kubernetes.io/serviceaccount/ca.crt
    server: {{ server }}
  name: default
contexts:
- context:
    cluster: default
    namespace: default
    user: default
  name: default
current-context: default
users:
- name: default
  user:
    tokenFile: /var/run/secrets/kubernetes.io/serviceaccount/token
"#;

#[derive(Serialize)]
struct KubeconfigOptions {
    server: String,
}

fn labels(architecture: Architecture) -> BTreeMap<String, String> {
    let mut labels = arch_selector(architecture);
    labels.insert("k8s-app".to_owned(), NAME.to_owned());
    labels
}

/// The proxy objects that don't depend on the machines. The proxy authenticates with its service
/// account token against `server`.
pub fn objects(server: &str) -> anyhow::Result<Vec<ApiObject>> {
    let kubeconfig = template::render(
        KUBECONFIG_TEMPLATE,
        &KubeconfigOptions {
            server: server.to_owned(),
        },
    )?;
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            labels: Some(string_map(&[("app", NAME)])),
            ..metadata(NAME, true)
        },
        data: Some(BTreeMap::from([(KUBECONFIG_KEY.to_owned(), kubeconfig)])),
        ..Default::default()
    };
    Ok(vec![
        service_account(NAME),
        ApiObject::ClusterRoleBinding(binding(metadata(NAME, false), NODE_PROXIER_ROLE, NAME)),
        ApiObject::ConfigMap(config_map),
    ])
}

/// The proxy agent for machines of `architecture`, running from the hyperkube image.
pub fn daemon_set(architecture: Architecture, flags: &Flags) -> DaemonSet {
    let labels = labels(architecture);
    let kubeconfig = format!("--kubeconfig={CONFIG_DIR}/{KUBECONFIG_KEY}");
    let proxy = Container {
        name: NAME.to_owned(),
        image: Some(
            flags
                .images
                .hyperkube(architecture, &flags.kubernetes.version),
        ),
        command: Some(strings(&[
            "/hyperkube",
            "kube-proxy",
            kubeconfig.as_str(),
            "--proxy-mode=iptables",
        ])),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            mount(NAME, CONFIG_DIR),
            VolumeMount {
                read_only: Some(true),
                ..mount("xtables-lock", XTABLES_LOCK)
            },
            mount("lib-modules", "/lib/modules"),
        ]),
        ..Default::default()
    };

    DaemonSet {
        metadata: ObjectMeta {
            labels: Some(labels.clone()),
            ..metadata(&format!("{NAME}-{architecture}"), true)
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".to_owned()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    host_network: Some(true),
                    node_selector: Some(arch_selector(architecture)),
                    service_account_name: Some(NAME.to_owned()),
                    containers: vec![proxy],
                    volumes: Some(vec![
                        config_map_volume(NAME, NAME, &[]),
                        host_path_volume("xtables-lock", XTABLES_LOCK, Some("FileOrCreate")),
                        host_path_volume("lib-modules", "/lib/modules", None),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Installs the service proxy: its account, its kubeconfig, and one agent per architecture.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProxyService;

#[async_trait]
impl InitCluster for ProxyService {
    async fn init_cluster(&self, ctx: &Context<'_>) -> anyhow::Result<()> {
        let server = api::api_server_url(ctx.topology, ctx.flags)?;
        let mut objects = objects(&server)?;
        for architecture in ctx.topology.architectures()? {
            objects.push(ApiObject::DaemonSet(daemon_set(architecture, ctx.flags)));
        }
        let api = ctx.connect_api().await?;
        info!(%server, "Installing the service proxy");
        apply(api.as_ref(), objects).await
    }
}
