//! Cluster DNS (CoreDNS), installed through the API and reachable at the configured cluster DNS
//! address.

use super::addon::{
    apply, binding, config_map_volume, metadata, mount, rule, service_account, string_map,
};
use crate::api::ApiObject;
use crate::config::Flags;
use crate::pipeline::{Context, InitCluster};
use crate::template;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::api::rbac::v1::ClusterRole;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

const NAME: &str = "coredns";
const ROLE: &str = "system:coredns";
const SERVICE_NAME: &str = "kube-dns";
const COREFILE_KEY: &str = "Corefile";
const REPLICAS: i32 = 2;

const COREFILE_TEMPLATE: &str = r#".:53 {
    errors
    health
    kubernetes {{ cluster_domain }} {{ service_range }} in-addr.arpa ip6.arpa {
        pods insecure
        upstream
        fallthrough in-addr.arpa ip6.arpa
    }
    prometheus :9153
    proxy . /etc/resolv.conf
    cache 30
}
"#;

#[derive(Serialize)]
struct CorefileOptions<'a> {
    cluster_domain: &'a str,
    service_range: &'a str,
}

fn corefile(flags: &Flags) -> anyhow::Result<String> {
    Ok(template::render(
        COREFILE_TEMPLATE,
        &CorefileOptions {
            cluster_domain: &flags.kubernetes.cluster_domain,
            service_range: &flags.kubernetes.service_cluster_ip_range,
        },
    )?)
}

fn selector() -> BTreeMap<String, String> {
    string_map(&[("k8s-app", NAME)])
}

fn container_port(name: &str, port: i32, protocol: &str) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_owned()),
        container_port: port,
        protocol: Some(protocol.to_owned()),
        ..Default::default()
    }
}

fn service_port(name: &str, port: i32, protocol: &str) -> ServicePort {
    ServicePort {
        name: Some(name.to_owned()),
        port,
        protocol: Some(protocol.to_owned()),
        ..Default::default()
    }
}

fn deployment(flags: &Flags) -> Deployment {
    let coredns = Container {
        name: NAME.to_owned(),
        image: Some(flags.images.coredns()),
        args: Some(vec!["-conf".to_owned(), format!("/etc/coredns/{COREFILE_KEY}")]),
        volume_mounts: Some(vec![mount("config-volume", "/etc/coredns")]),
        ports: Some(vec![
            container_port("dns", 53, "UDP"),
            container_port("dns-tcp", 53, "TCP"),
            container_port("metrics", 9153, "TCP"),
        ]),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/health".to_owned()),
                port: IntOrString::Int(8080),
                scheme: Some("HTTP".to_owned()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(60),
            timeout_seconds: Some(5),
            success_threshold: Some(1),
            failure_threshold: Some(5),
            ..Default::default()
        }),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            labels: Some(string_map(&[("k8s-app", NAME), ("kubernetes.io/name", "CoreDNS")])),
            ..metadata(NAME, true)
        },
        spec: Some(DeploymentSpec {
            replicas: Some(REPLICAS),
            selector: LabelSelector {
                match_labels: Some(selector()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_owned()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::Int(1)),
                    ..Default::default()
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![coredns],
                    dns_policy: Some("Default".to_owned()),
                    service_account_name: Some(NAME.to_owned()),
                    volumes: Some(vec![config_map_volume(
                        "config-volume",
                        NAME,
                        &[COREFILE_KEY],
                    )]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service(flags: &Flags) -> Service {
    Service {
        metadata: ObjectMeta {
            annotations: Some(string_map(&[("prometheus.io/scrape", "true")])),
            labels: Some(string_map(&[
                ("k8s-app", NAME),
                ("kubernetes.io/cluster-service", "true"),
                ("kubernetes.io/name", "CoreDNS"),
            ])),
            ..metadata(SERVICE_NAME, true)
        },
        spec: Some(ServiceSpec {
            selector: Some(selector()),
            cluster_ip: Some(flags.kubernetes.cluster_dns.clone()),
            ports: Some(vec![
                service_port("dns", 53, "UDP"),
                service_port("dns-tcp", 53, "TCP"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Every DNS object, in the order they are applied.
pub fn objects(flags: &Flags) -> anyhow::Result<Vec<ApiObject>> {
    let defaults_label = string_map(&[("kubernetes.io/bootstrapping", "rbac-defaults")]);
    let role = ClusterRole {
        metadata: ObjectMeta {
            labels: Some(defaults_label.clone()),
            ..metadata(ROLE, false)
        },
        rules: Some(vec![rule(
            &["endpoints", "services", "pods", "namespaces"],
            &["list", "watch"],
        )]),
        ..Default::default()
    };
    let role_binding = binding(
        ObjectMeta {
            annotations: Some(string_map(&[(
                "rbac.authorization.kubernetes.io/autoupdate",
                "true",
            )])),
            labels: Some(defaults_label),
            ..metadata(ROLE, false)
        },
        ROLE,
        NAME,
    );
    let config_map = ConfigMap {
        metadata: metadata(NAME, true),
        data: Some(BTreeMap::from([(COREFILE_KEY.to_owned(), corefile(flags)?)])),
        ..Default::default()
    };
    Ok(vec![
        service_account(NAME),
        ApiObject::ClusterRole(role),
        ApiObject::ClusterRoleBinding(role_binding),
        ApiObject::ConfigMap(config_map),
        ApiObject::Deployment(deployment(flags)),
        ApiObject::Service(service(flags)),
    ])
}

/// Installs cluster DNS. CoreDNS images are multi-architecture, so one deployment serves every
/// machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsService;

#[async_trait]
impl InitCluster for DnsService {
    async fn init_cluster(&self, ctx: &Context<'_>) -> anyhow::Result<()> {
        let objects = objects(ctx.flags)?;
        let api = ctx.connect_api().await?;
        info!(address = %ctx.flags.kubernetes.cluster_dns, "Installing cluster DNS");
        apply(api.as_ref(), objects).await
    }
}
