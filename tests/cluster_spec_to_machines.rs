//! Drives Helix from a cluster specification file through a full `init` and `reset` against
//! simulated machines and a simulated API server.
//!
//! Only the public API is used, so the simulations here are deliberately simple: every command
//! succeeds, `uname -m` reports `x86_64`, and nothing is interpreted beyond recording it. The
//! crate's own unit tests cover the shell semantics; this file checks that the pieces line up.

use async_trait::async_trait;
use helix::api::{ApiObject, ClusterApi, ConnectApi};
use helix::config::{ClusterSpec, Flags};
use helix::pipeline::Collaborators;
use helix::pki::CertificateAuthority;
use helix::remote::{Dial, RemoteClient, Transport};
use helix::services;
use helix::topology::{Node, Resolve, Topology};
use std::collections::BTreeMap;
use std::io;
use std::net::IpAddr;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const SPEC: &str = "
ssh-user: admin
masters:
  - name: m1
    ip-address: 10.0.0.1
  - name: m2
    ip-address: 10.0.0.2
workers:
  - name: w1
    ip-address: 10.0.0.3
    ssh-user: ubuntu
api-server:
  virtual-ip: 10.0.0.100
";

// Every command sent to a machine, keyed by node name.
type CommandLog = Arc<Mutex<BTreeMap<String, Vec<String>>>>;

struct RecordingTransport {
    host: String,
    log: CommandLog,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn exec(&self, command: &str, _stdin: Option<&[u8]>) -> anyhow::Result<Output> {
        self.log
            .lock()
            .unwrap()
            .entry(self.host.clone())
            .or_default()
            .push(command.to_owned());
        let stdout = match command {
            "uname -m" => b"x86_64\n".to_vec(),
            _ => Vec::new(),
        };
        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout,
            stderr: Vec::new(),
        })
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingDialer {
    dialed: Mutex<Vec<Node>>,
    log: CommandLog,
}

impl RecordingDialer {
    fn commands(&self, host: &str) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Dial for RecordingDialer {
    async fn dial(&self, node: &Node, dry_run: bool) -> anyhow::Result<RemoteClient> {
        self.dialed.lock().unwrap().push(node.clone());
        let transport = RecordingTransport {
            host: node.name.clone(),
            log: self.log.clone(),
        };
        Ok(RemoteClient::new(Box::new(transport), node, dry_run))
    }
}

// Every name in the spec is pinned to an address, so DNS must never be consulted.
struct NoDns;

#[async_trait]
impl Resolve for NoDns {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unexpected lookup of {host}"),
        ))
    }

    async fn reverse_lookup(&self, address: IpAddr) -> io::Result<Vec<String>> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unexpected reverse lookup of {address}"),
        ))
    }
}

#[derive(Clone, Default)]
struct RecordingApi {
    objects: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl ClusterApi for RecordingApi {
    async fn list_nodes(&self) -> anyhow::Result<usize> {
        Ok(3)
    }

    async fn create_or_update(&self, object: ApiObject) -> anyhow::Result<()> {
        self.objects.lock().unwrap().push((
            object.kind().to_owned(),
            object.name().unwrap_or_default().to_owned(),
        ));
        Ok(())
    }
}

#[async_trait]
impl ConnectApi for RecordingApi {
    async fn connect(
        &self,
        _topology: &Topology,
        _ca: &CertificateAuthority,
        _flags: &Flags,
    ) -> anyhow::Result<Box<dyn ClusterApi>> {
        Ok(Box::new(self.clone()))
    }
}

fn flags_from_spec_file(dir: &TempDir) -> Flags {
    let path = dir.path().join("cluster.yaml");
    std::fs::write(&path, SPEC).unwrap();
    let mut flags = Flags {
        local_conf_dir: Some(dir.path().join("conf")),
        ..Flags::default()
    };
    flags
        .apply_cluster_spec(&ClusterSpec::from_file(&path).unwrap())
        .unwrap();
    flags
}

fn wrote(commands: &[String], path: &str) -> bool {
    let target = format!(" /dev/stdin {path}");
    commands
        .iter()
        .any(|c| c.starts_with("sudo install -m ") && c.ends_with(&target))
}

#[tokio::test]
async fn init_from_a_spec_file_reaches_every_machine() {
    let dir = TempDir::new().unwrap();
    let flags = flags_from_spec_file(&dir);
    let dialer = RecordingDialer::default();
    let api = RecordingApi::default();

    helix::init(
        flags,
        &services::pipeline(),
        Collaborators {
            resolver: &NoDns,
            dialer: &dialer,
            api: Arc::new(api.clone()),
        },
    )
    .await
    .unwrap();

    let mut dialed: Vec<_> = dialer
        .dialed
        .lock()
        .unwrap()
        .iter()
        .map(|n| (n.name.clone(), n.address.to_string(), n.is_control_plane))
        .collect();
    dialed.sort();
    assert_eq!(
        vec![
            ("m1".to_owned(), "10.0.0.1".to_owned(), true),
            ("m2".to_owned(), "10.0.0.2".to_owned(), true),
            ("w1".to_owned(), "10.0.0.3".to_owned(), false),
        ],
        dialed
    );

    for host in ["m1", "m2"] {
        let commands = dialer.commands(host);
        assert_eq!("uname -m", commands[0], "{host}");
        assert!(wrote(&commands, "/etc/kubernetes/manifests/etcd.yaml"), "{host}");
        assert!(wrote(&commands, "/etc/keepalived/keepalived.conf"), "{host}");
    }
    let worker = dialer.commands("w1");
    assert!(wrote(&worker, "/etc/systemd/system/hyperkube.service"));
    assert!(wrote(&worker, "/etc/systemd/system/cni-installer.service"));
    assert!(wrote(&worker, "/etc/systemd/system/kubelet.service"));
    assert!(!wrote(&worker, "/etc/kubernetes/manifests/etcd.yaml"));
    assert!(!wrote(&worker, "/etc/kubernetes/pki/ca.key"));

    let objects = api.objects.lock().unwrap().clone();
    assert!(objects.contains(&("DaemonSet".to_owned(), "kube-flannel-ds-amd64".to_owned())));
    assert!(objects.contains(&("DaemonSet".to_owned(), "kube-proxy-amd64".to_owned())));
    assert!(objects.contains(&("Service".to_owned(), "kube-dns".to_owned())));

    let conf = dir.path().join("conf");
    for file in ["kubernetes-ca.crt", "kubernetes-ca.key", "etcd-ca.crt", "etcd-ca.key"] {
        assert!(conf.join(file).is_file(), "{file}");
    }
}

#[tokio::test]
async fn reset_from_a_spec_file_leaves_the_local_directory_alone() {
    let dir = TempDir::new().unwrap();
    let flags = flags_from_spec_file(&dir);
    let dialer = RecordingDialer::default();

    helix::reset(
        flags,
        &services::pipeline(),
        Collaborators {
            resolver: &NoDns,
            dialer: &dialer,
            api: Arc::new(RecordingApi::default()),
        },
    )
    .await
    .unwrap();

    assert_eq!(3, dialer.dialed.lock().unwrap().len());
    assert!(dialer
        .commands("m1")
        .contains(&"sudo rm -rf /var/lib/etcd".to_owned()));
    assert!(!dir.path().join("conf").exists());
}

#[tokio::test]
async fn dry_run_dials_but_sends_nothing() {
    let dir = TempDir::new().unwrap();
    let mut flags = flags_from_spec_file(&dir);
    flags.dry_run = true;
    flags.architecture = Some("amd64".parse().unwrap());
    let dialer = RecordingDialer::default();
    let api = RecordingApi::default();

    helix::init(
        flags,
        &services::pipeline(),
        Collaborators {
            resolver: &NoDns,
            dialer: &dialer,
            api: Arc::new(api.clone()),
        },
    )
    .await
    .unwrap();

    assert_eq!(3, dialer.dialed.lock().unwrap().len());
    assert!(dialer.log.lock().unwrap().is_empty());
    assert!(api.objects.lock().unwrap().is_empty());
}

#[tokio::test]
async fn an_invalid_spec_is_rejected_before_anything_runs() {
    let spec = ClusterSpec::from_yaml(
        "
masters:
  - name: m1
    ip-address: 10.0.0.999
",
    )
    .unwrap();

    let error = Flags::default().apply_cluster_spec(&spec).unwrap_err();

    assert!(format!("{error:#}").contains("10.0.0.999"), "{error:#}");
}
