//! The pod network overlay (flannel), installed through the API once the control plane answers.

use super::addon::{
    apply, arch_selector, binding, config_map_volume, host_path_volume, metadata, mount, rule,
    service_account, strings, ARCH_LABEL,
};
use crate::api::ApiObject;
use crate::config::Images;
use crate::pipeline::{Context, InitCluster};
use crate::topology::Architecture;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec,
    SecurityContext, Toleration,
};
use k8s_openapi::api::rbac::v1::ClusterRole;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;
use tracing::info;

/// Address range pods are allocated from. Node subnets are carved out of it by the controller
/// manager.
pub const POD_NETWORK_CIDR: &str = "10.244.0.0/16";

const NAME: &str = "flannel";

const CNI_CONF: &str = r#"{
  "name": "cbr0",
  "type": "flannel",
  "delegate": {
    "isDefaultGateway": true
  }
}
"#;

fn net_conf() -> String {
    format!(
        "{{\n  \"Network\": \"{POD_NETWORK_CIDR}\",\n  \"Backend\": {{\n    \"Type\": \"vxlan\"\n  }}\n}}\n"
    )
}

fn labels(architecture: Option<Architecture>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        ("tier".to_owned(), "node".to_owned()),
        ("app".to_owned(), NAME.to_owned()),
    ]);
    if let Some(architecture) = architecture {
        labels.insert(ARCH_LABEL.to_owned(), architecture.to_string());
    }
    labels
}

fn field_ref(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The flannel objects that don't depend on the machines.
pub fn objects() -> Vec<ApiObject> {
    let role = ClusterRole {
        metadata: metadata(NAME, false),
        rules: Some(vec![
            rule(&["pods"], &["get"]),
            rule(&["nodes"], &["list", "watch"]),
            rule(&["nodes/status"], &["patch"]),
        ]),
        ..Default::default()
    };
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            labels: Some(labels(None)),
            ..metadata(NAME, true)
        },
        data: Some(BTreeMap::from([
            ("cni-conf.json".to_owned(), CNI_CONF.to_owned()),
            ("net-conf.json".to_owned(), net_conf()),
        ])),
        ..Default::default()
    };
    vec![
        service_account(NAME),
        ApiObject::ClusterRole(role),
        ApiObject::ClusterRoleBinding(binding(metadata(NAME, false), NAME, NAME)),
        ApiObject::ConfigMap(config_map),
    ]
}

/// The flannel agent for machines of `architecture`.
pub fn daemon_set(architecture: Architecture, images: &Images) -> DaemonSet {
    let labels = labels(Some(architecture));
    let image = images.flannel(architecture);
    let config_mount = mount("flannel-cfg", "/etc/kube-flannel/");

    let install_cni = Container {
        name: "install-cni".to_owned(),
        image: Some(image.clone()),
        command: Some(strings(&["cp"])),
        args: Some(strings(&[
            "-f",
            "/etc/kube-flannel/cni-conf.json",
            "/etc/cni/net.d/10-flannel.conf",
        ])),
        volume_mounts: Some(vec![mount("cni", "/etc/cni/net.d"), config_mount.clone()]),
        ..Default::default()
    };
    let flanneld = Container {
        name: "kube-flannel".to_owned(),
        image: Some(image),
        command: Some(strings(&[
            "/opt/bin/flanneld",
            "--ip-masq",
            "--kube-subnet-mgr",
        ])),
        env: Some(vec![
            field_ref("POD_NAME", "metadata.name"),
            field_ref("POD_NAMESPACE", "metadata.namespace"),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![mount("run", "/run"), config_mount]),
        ..Default::default()
    };

    DaemonSet {
        metadata: ObjectMeta {
            labels: Some(labels.clone()),
            ..metadata(&format!("kube-flannel-ds-{architecture}"), true)
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    host_network: Some(true),
                    node_selector: Some(arch_selector(architecture)),
                    tolerations: Some(vec![Toleration {
                        key: Some("node-role.kubernetes.io/master".to_owned()),
                        operator: Some("Exists".to_owned()),
                        effect: Some("NoSchedule".to_owned()),
                        ..Default::default()
                    }]),
                    service_account_name: Some(NAME.to_owned()),
                    init_containers: Some(vec![install_cni]),
                    containers: vec![flanneld],
                    volumes: Some(vec![
                        host_path_volume("run", "/run", None),
                        host_path_volume("cni", "/etc/cni/net.d", None),
                        config_map_volume("flannel-cfg", NAME, &[]),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Installs the overlay: RBAC, configuration, and one agent per architecture in the cluster.
#[derive(Clone, Copy, Debug, Default)]
pub struct NetworkService;

#[async_trait]
impl InitCluster for NetworkService {
    async fn init_cluster(&self, ctx: &Context<'_>) -> anyhow::Result<()> {
        let api = ctx.connect_api().await?;
        info!("Installing the pod network");
        let mut objects = objects();
        for architecture in ctx.topology.architectures()? {
            objects.push(ApiObject::DaemonSet(daemon_set(
                architecture,
                &ctx.flags.images,
            )));
        }
        apply(api.as_ref(), objects).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Flags;

    #[test]
    fn objects_are_named_after_flannel() {
        let objects = objects();

        let kinds: Vec<_> = objects.iter().map(ApiObject::kind).collect();
        assert_eq!(
            vec!["ServiceAccount", "ClusterRole", "ClusterRoleBinding", "ConfigMap"],
            kinds
        );
        assert!(objects.iter().all(|o| o.name() == Some(NAME)));
    }

    #[test]
    fn net_conf_uses_the_pod_network() {
        assert!(net_conf().contains("\"Network\": \"10.244.0.0/16\""));
    }

    #[test]
    fn daemon_set_is_pinned_to_its_architecture() {
        let daemon_set = daemon_set(Architecture::Arm, &Flags::default().images);

        assert_eq!(
            Some("kube-flannel-ds-arm"),
            daemon_set.metadata.name.as_deref()
        );
        let pod = daemon_set.spec.unwrap().template.spec.unwrap();
        assert_eq!("arm", pod.node_selector.unwrap()[ARCH_LABEL]);
        assert_eq!(
            Some("quay.io/coreos/flannel:v0.9.1-arm".to_owned()),
            pod.containers[0].image
        );
    }
}
