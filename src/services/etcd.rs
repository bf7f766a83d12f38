//! The consensus store, run as a static pod on every control-plane machine.
//!
//! etcd has its own root, separate from the cluster CA, persisted next to it in the local
//! configuration directory. Whether the members form a new cluster or join an existing one is
//! decided per run: if any control-plane machine already has a member data directory, the state
//! is `existing`.

use super::component::{self, Component, MANIFEST_FILE_MODE};
use crate::config::{ClusterState, Flags};
use crate::pipeline::{Context, InitNode, OperateMachine, Prepare};
use crate::pki::{CertificateAuthority, CERT_FILE_MODE};
use crate::remote::RemoteClient;
use crate::topology::{Node, Topology};
use anyhow::Context as _;
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::info;

pub const CERTS_DIR: &str = "/etc/kubernetes/pki/etcd";
pub const DATA_DIR: &str = "/var/lib/etcd";
pub const CA_NAME: &str = "etcd-ca";

const MANIFEST_FILE: &str = "etcd.yaml";
const ORGANIZATION: &str = "helix";
const TOKEN_LENGTH: usize = 16;

const MANIFEST_TEMPLATE: &str = r#"apiVersion: v1
kind: Pod
metadata:
  labels:
    component: etcd
    tier: control-plane
  name: {{ pod_name }}
  namespace: kube-system
spec:
  containers:
  - command:
    - etcd
    - --name={{ peer_name }}
    - --data-dir={{ data_dir }}
    - --listen-client-urls={{ client_url }}
    - --advertise-client-urls={{ client_url }}
    - --listen-peer-urls={{ peer_url }}
    - --initial-advertise-peer-urls={{ peer_url }}
    - --cert-file={{ client_cert_file }}
    - --key-file={{ client_key_file }}
    - --client-cert-auth
    - --trusted-ca-file={{ client_ca_file }}
    - --peer-cert-file={{ peer_cert_file }}
    - --peer-key-file={{ peer_key_file }}
    - --peer-client-cert-auth
    - --peer-trusted-ca-file={{ peer_ca_file }}
    - --initial-cluster={{ initial_cluster }}
    - --initial-cluster-token={{ initial_cluster_token }}
    - --initial-cluster-state={{ cluster_state }}
    image: {{ image }}
    livenessProbe:
      tcpSocket:
        port: {{ client_port }}
      initialDelaySeconds: 15
      timeoutSeconds: 15
    name: etcd
    volumeMounts:
    - mountPath: {{ data_dir }}
      name: etcd
    - mountPath: {{ certs_dir }}
      name: certs
      readOnly: true
  hostNetwork: true
  volumes:
  - hostPath:
      path: {{ data_dir }}
      type: DirectoryOrCreate
    name: etcd
  - hostPath:
      path: {{ certs_dir }}
    name: certs
"#;

pub fn client_cert_path() -> PathBuf {
    Path::new(CERTS_DIR).join("client.crt")
}

pub fn client_key_path() -> PathBuf {
    Path::new(CERTS_DIR).join("client.key")
}

pub fn client_ca_path() -> PathBuf {
    Path::new(CERTS_DIR).join("ca.crt")
}

fn peer_cert_path() -> PathBuf {
    Path::new(CERTS_DIR).join("peer.crt")
}

fn peer_key_path() -> PathBuf {
    Path::new(CERTS_DIR).join("peer.key")
}

fn peer_ca_path() -> PathBuf {
    Path::new(CERTS_DIR).join("peer-ca.crt")
}

fn url(address: IpAddr, port: u16) -> String {
    match address {
        IpAddr::V4(address) => format!("https://{address}:{port}"),
        IpAddr::V6(address) => format!("https://[{address}]:{port}"),
    }
}

/// The `--initial-cluster` value: `name=https://address:peer-port` for every control-plane
/// node, comma separated.
pub fn initial_cluster(topology: &Topology, flags: &Flags) -> String {
    topology
        .control_plane()
        .map(|n| format!("{}={}", n.name, url(n.address, flags.etcd.peer_port())))
        .collect::<Vec<_>>()
        .join(",")
}

/// The client URLs of every member, comma separated.
pub fn client_endpoints(topology: &Topology, flags: &Flags) -> String {
    topology
        .control_plane()
        .map(|n| url(n.address, flags.etcd.client_port()))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Serialize)]
struct Options {
    image: String,
    pod_name: String,
    peer_name: String,
    data_dir: &'static str,
    certs_dir: &'static str,
    client_url: String,
    peer_url: String,
    client_port: u16,
    client_cert_file: PathBuf,
    client_key_file: PathBuf,
    client_ca_file: PathBuf,
    peer_cert_file: PathBuf,
    peer_key_file: PathBuf,
    peer_ca_file: PathBuf,
    initial_cluster: String,
    initial_cluster_token: String,
    cluster_state: ClusterState,
}

// Set by prepare, read by every machine.
#[derive(Clone, Debug)]
struct Secrets {
    ca: CertificateAuthority,
    token: String,
}

#[derive(Debug, Default)]
pub struct EtcdService {
    secrets: Mutex<Option<Secrets>>,
    existing: AtomicBool,
}

impl EtcdService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the members bootstrap a new cluster or rejoin an existing one.
    ///
    /// An explicit `--etcd-cluster-state` wins over what was found on the machines.
    pub fn cluster_state(&self, flags: &Flags) -> ClusterState {
        match flags.etcd.cluster_state {
            Some(state) => state,
            None if self.existing.load(Ordering::SeqCst) => ClusterState::Existing,
            None => ClusterState::New,
        }
    }

    fn secrets(&self) -> anyhow::Result<Secrets> {
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .context("etcd was not prepared for init")
    }
}

#[async_trait]
impl Prepare for EtcdService {
    async fn prepare(&self, ctx: &Context<'_>, will_init: bool) -> anyhow::Result<()> {
        self.existing.store(false, Ordering::SeqCst);
        let mut secrets = self.secrets.lock().unwrap_or_else(PoisonError::into_inner);
        *secrets = None;
        if !will_init {
            return Ok(());
        }

        let conf_dir = ctx.deps.conf_dir()?;
        let ca = CertificateAuthority::load_or_create(
            CA_NAME,
            conf_dir.join("etcd-ca.crt"),
            conf_dir.join("etcd-ca.key"),
        )?;
        let token = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect();
        *secrets = Some(Secrets { ca, token });
        Ok(())
    }
}

#[async_trait]
impl InitNode for EtcdService {
    async fn init_node(
        &self,
        node: &mut Node,
        client: &RemoteClient,
        _flags: &Flags,
    ) -> anyhow::Result<()> {
        if !node.is_control_plane {
            return Ok(());
        }
        if client
            .directory_exists(Path::new(DATA_DIR).join("member"))
            .await?
        {
            info!(host = %node.name, "Found existing etcd member data");
            self.existing.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl OperateMachine for EtcdService {
    async fn init_machine(
        &self,
        node: &Node,
        client: &RemoteClient,
        ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        if !node.is_control_plane {
            return Ok(());
        }
        let Secrets { ca, token } = self.secrets()?;
        let flags = ctx.flags;

        info!(host = %node.name, "Uploading etcd certificates");
        let client_pair = ca.issue_server_certificate(&node.name, ORGANIZATION, node, &[])?;
        let peer_pair = ca.issue_server_certificate(&node.name, ORGANIZATION, node, &[])?;
        component::upload_pair(client, client_cert_path(), client_key_path(), &client_pair)
            .await?;
        client
            .update_file(client_ca_path(), ca.cert_pem().as_bytes(), CERT_FILE_MODE)
            .await?;
        component::upload_pair(client, peer_cert_path(), peer_key_path(), &peer_pair).await?;
        client
            .update_file(peer_ca_path(), ca.cert_pem().as_bytes(), CERT_FILE_MODE)
            .await?;

        let options = Options {
            image: flags.images.etcd(node.architecture()?),
            pod_name: format!("etcd-{}", node.name),
            peer_name: node.name.clone(),
            data_dir: DATA_DIR,
            certs_dir: CERTS_DIR,
            client_url: url(node.address, flags.etcd.client_port()),
            peer_url: url(node.address, flags.etcd.peer_port()),
            client_port: flags.etcd.client_port(),
            client_cert_file: client_cert_path(),
            client_key_file: client_key_path(),
            client_ca_file: client_ca_path(),
            peer_cert_file: peer_cert_path(),
            peer_key_file: peer_key_path(),
            peer_ca_file: peer_ca_path(),
            initial_cluster: initial_cluster(ctx.topology, flags),
            initial_cluster_token: token,
            cluster_state: self.cluster_state(flags),
        };
        info!(
            host = %node.name,
            state = %options.cluster_state,
            "Creating etcd manifest"
        );
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
        for path in [
            client_cert_path(),
            client_key_path(),
            client_ca_path(),
            peer_cert_path(),
            peer_key_path(),
            peer_ca_path(),
        ] {
            client.remove_file(path).await?;
        }
        client.remove_directory(DATA_DIR).await
    }
}
