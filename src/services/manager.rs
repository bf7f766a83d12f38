//! The scheduler and the controller manager: control-plane static pods that reach the API server
//! through a kubeconfig of their own.

use super::component::{self, Component, MANIFEST_FILE_MODE};
use super::network;
use crate::pipeline::{Context, OperateMachine};
use crate::remote::RemoteClient;
use crate::topology::Node;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

const SCHEDULER_TEMPLATE: &str = r#"apiVersion: v1
kind: Pod
metadata:
  annotations:
    scheduler.alpha.kubernetes.io/critical-pod: ""
  labels:
    component: kube-scheduler
    tier: control-plane
  name: {{ pod_name }}
  namespace: kube-system
spec:
  containers:
  - command:
    - /hyperkube
    - kube-scheduler
    - --address=127.0.0.1
    - --leader-elect=true
    - --kubeconfig={{ kubeconfig_path }}
{%- if feature_gates %}
    - --feature-gates={{ feature_gates }}
{%- endif %}
    image: {{ image }}
    livenessProbe:
      failureThreshold: 8
      httpGet:
        host: 127.0.0.1
        path: /healthz
        port: 10251
        scheme: HTTP
      initialDelaySeconds: 15
      timeoutSeconds: 15
    name: kube-scheduler
    resources:
      requests:
        cpu: 100m
    volumeMounts:
    - mountPath: {{ kubeconfig_path }}
      name: kubeconfig
      readOnly: true
  hostNetwork: true
  volumes:
  - hostPath:
      path: {{ kubeconfig_path }}
      type: FileOrCreate
    name: kubeconfig
"#;

const CONTROLLER_MANAGER_TEMPLATE: &str = r#"apiVersion: v1
kind: Pod
metadata:
  annotations:
    scheduler.alpha.kubernetes.io/critical-pod: ""
  labels:
    component: kube-controller-manager
    tier: control-plane
  name: {{ pod_name }}
  namespace: kube-system
spec:
  containers:
  - command:
    - /hyperkube
    - kube-controller-manager
    - --address=127.0.0.1
    - --allocate-node-cidrs=true
    - --cluster-cidr={{ cluster_cidr }}
    - --cluster-signing-cert-file={{ ca_file }}
    - --cluster-signing-key-file={{ ca_key_file }}
    - --controllers=*,bootstrapsigner,tokencleaner
{%- if feature_gates %}
    - --feature-gates={{ feature_gates }}
{%- endif %}
    - --kubeconfig={{ kubeconfig_path }}
    - --leader-elect=true
    - --node-cidr-mask-size=24
    - --root-ca-file={{ ca_file }}
    - --service-account-private-key-file={{ service_account_key_file }}
    - --use-service-account-credentials=true
    image: {{ image }}
    livenessProbe:
      failureThreshold: 8
      httpGet:
        host: 127.0.0.1
        path: /healthz
        port: 10252
        scheme: HTTP
      initialDelaySeconds: 15
      timeoutSeconds: 15
    name: kube-controller-manager
    resources:
      requests:
        cpu: 200m
    volumeMounts:
    - mountPath: {{ pki_dir }}
      name: k8s-certs
      readOnly: true
    - mountPath: /etc/ssl/certs
      name: ca-certs
      readOnly: true
    - mountPath: {{ kubeconfig_path }}
      name: kubeconfig
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
  - hostPath:
      path: {{ kubeconfig_path }}
      type: FileOrCreate
    name: kubeconfig
"#;

#[derive(Debug, Serialize)]
struct Options {
    pod_name: String,
    image: String,
    feature_gates: String,
    cluster_cidr: &'static str,
    kubeconfig_path: PathBuf,
    pki_dir: &'static str,
    ca_file: PathBuf,
    ca_key_file: PathBuf,
    service_account_key_file: PathBuf,
}

/// Which of the two managers a [ManagerService] runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Manager {
    Scheduler,
    ControllerManager,
}

impl Manager {
    fn component(self) -> Component {
        match self {
            Manager::Scheduler => Component::new("scheduler"),
            Manager::ControllerManager => Component::new("controller-manager"),
        }
    }

    fn binary(self) -> &'static str {
        match self {
            Manager::Scheduler => "kube-scheduler",
            Manager::ControllerManager => "kube-controller-manager",
        }
    }

    fn template(self) -> &'static str {
        match self {
            Manager::Scheduler => SCHEDULER_TEMPLATE,
            Manager::ControllerManager => CONTROLLER_MANAGER_TEMPLATE,
        }
    }

    fn manifest_path(self) -> PathBuf {
        Component::manifest_path(&format!("{}.yaml", self.binary()))
    }
}

/// Runs a manager as a static pod on every control-plane machine.
#[derive(Clone, Copy, Debug)]
pub struct ManagerService {
    manager: Manager,
}

impl ManagerService {
    pub fn new(manager: Manager) -> Self {
        ManagerService { manager }
    }
}

#[async_trait]
impl OperateMachine for ManagerService {
    async fn init_machine(
        &self,
        node: &Node,
        client: &RemoteClient,
        ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        if !node.is_control_plane {
            return Ok(());
        }
        let manager = self.manager;
        let files = manager.component();
        let flags = ctx.flags;

        files
            .create_kubeconfig(
                &format!("system:{}", manager.binary()),
                "Kubernetes",
                node,
                client,
                ctx,
            )
            .await?;

        let options = Options {
            pod_name: format!("{}-{}", manager.binary(), node.name),
            image: flags
                .images
                .hyperkube(node.architecture()?, &flags.kubernetes.version),
            feature_gates: flags.kubernetes.feature_gates.join(","),
            cluster_cidr: network::POD_NETWORK_CIDR,
            kubeconfig_path: files.kubeconfig_path(),
            pki_dir: component::CERTS_DIR,
            ca_file: Component::ca_cert_path(),
            ca_key_file: Component::ca_key_path(),
            service_account_key_file: Component::service_account_private_path(),
        };
        info!(host = %node.name, "Creating {} manifest", manager.binary());
        client
            .render(
                manager.template(),
                manager.manifest_path(),
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
        client.remove_file(self.manager.manifest_path()).await?;
        self.manager.component().remove_kubeconfig(client).await
    }
}
