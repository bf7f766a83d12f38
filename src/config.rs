//! Settings collected from the command line and, optionally, a cluster specification file.

use crate::error::Error;
use crate::topology::Architecture;
use anyhow::Context;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Name of the directory, relative to the user's home, where trust material lives by default.
const CONFIG_DIR: &str = ".helix";

pub const DEFAULT_SSH_USER: &str = "pi";
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.10.1";
pub const DEFAULT_SERVICE_CLUSTER_IP_RANGE: &str = "10.71.0.0/16";
pub const DEFAULT_CLUSTER_DNS: &str = "10.71.0.10";
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;
pub const DEFAULT_ETCD_VERSION: &str = "3.2.17";
pub const DEFAULT_FLANNEL_VERSION: &str = "v0.9.1";
pub const DEFAULT_COREDNS_VERSION: &str = "1.1.1";

// A /30 still leaves two addresses for services.
const MAX_SERVICE_PREFIX: u8 = 30;

const ETCD_CLIENT_PORT: u16 = 2379;
const ETCD_PEER_PORT: u16 = 2380;

/// Returns the default local configuration directory, `$HOME/.helix`.
///
/// Returns [None] if the home directory can't be determined.
pub fn default_conf_dir() -> Option<PathBuf> {
    let mut path = home::home_dir()?;
    path.push(CONFIG_DIR);
    Some(path)
}

/// The `--initial-cluster-state` handed to etcd.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    #[default]
    New,
    Existing,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::New => "new",
            ClusterState::Existing => "existing",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ClusterState::New),
            "existing" => Ok(ClusterState::Existing),
            other => Err(Error::configuration(format!(
                "etcd cluster state must be 'new' or 'existing', not '{other}'"
            ))),
        }
    }
}

/// Everything a run needs to know that isn't discovered from the machines themselves.
#[derive(Clone, Debug, PartialEq)]
pub struct Flags {
    /// If set, remote commands are logged instead of executed.
    pub dry_run: bool,

    /// Local directory holding the persisted CA and service-account material.
    ///
    /// Required for `init`. `reset` never touches it.
    pub local_conf_dir: Option<PathBuf>,

    /// IP addresses or host names of all machines. Control-plane members may be repeated here.
    pub members: Vec<String>,

    /// Names pinned to fixed addresses, consulted before DNS. Filled from a [ClusterSpec].
    pub hosts: BTreeMap<String, IpAddr>,

    /// Architecture to assume for every machine. Skips detection when set.
    pub architecture: Option<Architecture>,

    pub ssh: SshFlags,
    pub control_plane: ControlPlaneFlags,
    pub etcd: EtcdFlags,
    pub kubernetes: KubernetesFlags,
    pub images: Images,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SshFlags {
    /// The user to log in as on every machine.
    pub user: String,

    /// Per-machine user names, keyed by member name. Takes precedence over [Self::user].
    pub users: BTreeMap<String, String>,
}

impl SshFlags {
    /// Returns the user to log in as on `host`.
    pub fn user_for(&self, host: &str) -> &str {
        self.users.get(host).map(String::as_str).unwrap_or(&self.user)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlPlaneFlags {
    /// IP addresses or host names of the machines forming the control plane.
    pub members: Vec<String>,

    /// Virtual IP address in front of the API servers, managed by keepalived.
    pub api_server_virtual_ip: Option<IpAddr>,

    /// DNS name of the API server.
    pub api_server_dns_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EtcdFlags {
    /// Forces the bootstrap state instead of probing the control plane for existing data.
    pub cluster_state: Option<ClusterState>,
}

impl EtcdFlags {
    pub fn client_port(&self) -> u16 {
        ETCD_CLIENT_PORT
    }

    pub fn peer_port(&self) -> u16 {
        ETCD_PEER_PORT
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KubernetesFlags {
    pub version: String,
    pub api_server_port: u16,
    pub service_cluster_ip_range: String,
    pub cluster_dns: String,
    pub cluster_domain: String,
    pub feature_gates: Vec<String>,
}

impl KubernetesFlags {
    /// Parses the service cluster IP range.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the range is not an IPv4 CIDR, or leaves no room for
    /// services beyond the API server's own address.
    pub fn service_network(&self) -> anyhow::Result<Ipv4Network> {
        let range = self.service_cluster_ip_range.trim();
        let invalid = || Error::configuration(format!("invalid IPv4 CIDR: '{range}'"));
        let network: Ipv4Network = range.parse().map_err(|_| invalid())?;
        if network.prefix() > MAX_SERVICE_PREFIX {
            return Err(invalid().into());
        }
        Ok(network)
    }

    /// Returns the first address of the service cluster IP range, which the API server's
    /// internal `kubernetes` service takes.
    pub fn first_service_ip(&self) -> anyhow::Result<Ipv4Addr> {
        let network = self.service_network()?;
        network.nth(1).ok_or_else(|| {
            Error::configuration(format!("{network} has no host addresses")).into()
        })
    }
}

/// Container image names, computed per architecture.
#[derive(Clone, Debug, PartialEq)]
pub struct Images {
    pub etcd_version: String,
    pub flannel_version: String,
    pub coredns_version: String,
}

impl Images {
    pub fn etcd(&self, architecture: Architecture) -> String {
        format!(
            "gcr.io/google-containers/etcd-{architecture}:{}",
            self.etcd_version
        )
    }

    pub fn flannel(&self, architecture: Architecture) -> String {
        format!(
            "quay.io/coreos/flannel:{}-{architecture}",
            self.flannel_version
        )
    }

    pub fn hyperkube(&self, architecture: Architecture, kubernetes_version: &str) -> String {
        format!("gcr.io/google-containers/hyperkube-{architecture}:{kubernetes_version}")
    }

    /// CoreDNS publishes one multi-architecture image.
    pub fn coredns(&self) -> String {
        format!("coredns/coredns:{}", self.coredns_version)
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            dry_run: false,
            local_conf_dir: None,
            members: Vec::new(),
            hosts: BTreeMap::new(),
            architecture: None,
            ssh: SshFlags {
                user: DEFAULT_SSH_USER.to_owned(),
                users: BTreeMap::new(),
            },
            control_plane: ControlPlaneFlags::default(),
            etcd: EtcdFlags::default(),
            kubernetes: KubernetesFlags {
                version: DEFAULT_KUBERNETES_VERSION.to_owned(),
                api_server_port: DEFAULT_API_SERVER_PORT,
                service_cluster_ip_range: DEFAULT_SERVICE_CLUSTER_IP_RANGE.to_owned(),
                cluster_dns: DEFAULT_CLUSTER_DNS.to_owned(),
                cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_owned(),
                feature_gates: Vec::new(),
            },
            images: Images {
                etcd_version: DEFAULT_ETCD_VERSION.to_owned(),
                flannel_version: DEFAULT_FLANNEL_VERSION.to_owned(),
                coredns_version: DEFAULT_COREDNS_VERSION.to_owned(),
            },
        }
    }
}

impl Flags {
    /// Normalizes member lists, fills blank settings with defaults, and validates the result.
    ///
    /// `will_init` distinguishes `init` from `reset`: only `init` needs a control plane and a
    /// local configuration directory.
    ///
    /// # Errors
    ///
    /// Returns [Error::Configuration] if required input is missing or malformed.
    pub fn setup_defaults(&mut self, will_init: bool) -> anyhow::Result<()> {
        normalize_list(&mut self.members);
        normalize_list(&mut self.control_plane.members);
        normalize_list(&mut self.kubernetes.feature_gates);
        if self
            .control_plane
            .api_server_dns_name
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            self.control_plane.api_server_dns_name = None;
        }

        let defaults = Flags::default();
        fill_blank(&mut self.ssh.user, defaults.ssh.user);
        fill_blank(&mut self.kubernetes.version, defaults.kubernetes.version);
        fill_blank(
            &mut self.kubernetes.service_cluster_ip_range,
            defaults.kubernetes.service_cluster_ip_range,
        );
        fill_blank(&mut self.kubernetes.cluster_dns, defaults.kubernetes.cluster_dns);
        fill_blank(
            &mut self.kubernetes.cluster_domain,
            defaults.kubernetes.cluster_domain,
        );
        fill_blank(&mut self.images.etcd_version, defaults.images.etcd_version);
        fill_blank(
            &mut self.images.flannel_version,
            defaults.images.flannel_version,
        );
        fill_blank(
            &mut self.images.coredns_version,
            defaults.images.coredns_version,
        );
        if self.kubernetes.api_server_port == 0 {
            self.kubernetes.api_server_port = defaults.kubernetes.api_server_port;
        }

        let control_plane = &self.control_plane;
        let discoverable = control_plane.api_server_virtual_ip.is_none()
            && control_plane.api_server_dns_name.is_some();
        if self.members.is_empty() && control_plane.members.is_empty() && !discoverable {
            return Err(Error::configuration("--members must be set").into());
        }
        if will_init {
            if self.local_conf_dir.is_none() {
                return Err(Error::configuration("--conf-dir must be set").into());
            }
            if control_plane.members.is_empty()
                && control_plane.api_server_virtual_ip.is_none()
                && control_plane.api_server_dns_name.is_none()
            {
                return Err(Error::configuration("no control-plane members specified").into());
            }
        }
        self.kubernetes
            .first_service_ip()
            .context("invalid service cluster IP range")?;
        Ok(())
    }

    /// Returns the local configuration directory.
    ///
    /// # Errors
    ///
    /// Returns [Error::Configuration] if it was never set.
    pub fn conf_dir(&self) -> anyhow::Result<&Path> {
        self.local_conf_dir
            .as_deref()
            .ok_or_else(|| Error::configuration("--conf-dir must be set").into())
    }

    /// Merges a [ClusterSpec] into these flags. Values already given on the command line win.
    pub fn apply_cluster_spec(&mut self, spec: &ClusterSpec) -> anyhow::Result<()> {
        spec.validate()?;

        if let Some(user) = &spec.ssh_user {
            self.ssh.user = user.clone();
        }
        for (node, control_plane) in spec
            .masters
            .iter()
            .map(|n| (n, true))
            .chain(spec.workers.iter().map(|n| (n, false)))
        {
            if let Some(address) = node.address()? {
                self.hosts.insert(node.name.clone(), address);
            }
            if let Some(user) = &node.ssh_user {
                self.ssh.users.insert(node.name.clone(), user.clone());
            }
            let list = match control_plane {
                true => &mut self.control_plane.members,
                false => &mut self.members,
            };
            if !list.contains(&node.name) {
                list.push(node.name.clone());
            }
        }

        if self.control_plane.api_server_virtual_ip.is_none() {
            if let Some(ip) = &spec.api_server.virtual_ip {
                self.control_plane.api_server_virtual_ip = Some(parse_ip(ip, "virtual IP")?);
            }
        }
        if self.control_plane.api_server_dns_name.is_none() {
            self.control_plane.api_server_dns_name = spec.api_server.dns_name.clone();
        }
        Ok(())
    }
}

/// The specification of a cluster, typically loaded from a YAML file.
///
/// ```yaml
/// ssh-user: pi
/// masters:
///   - name: m1
///     ip-address: 192.168.1.10
/// workers:
///   - name: w1
///     ssh-user: admin
/// api-server:
///   virtual-ip: 192.168.1.100
/// ```
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterSpec {
    /// Default SSH user for every node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,

    /// Control-plane nodes.
    #[serde(default)]
    pub masters: Vec<NodeSpec>,

    /// Worker nodes.
    #[serde(default)]
    pub workers: Vec<NodeSpec>,

    #[serde(default)]
    pub api_server: ApiServerSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiServerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeSpec {
    pub name: String,

    /// Pins the node to this address instead of resolving its name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Overrides [ClusterSpec::ssh_user] for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
}

impl ClusterSpec {
    /// Parses a cluster specification from YAML.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads and parses the cluster specification at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("failed to read cluster spec: {}", path.display()))?;
        Self::from_yaml(&yaml)
            .with_context(|| format!("failed to parse cluster spec: {}", path.display()))
    }

    /// Checks that every node has a name and that all addresses are IPs.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (role, nodes) in [("master", &self.masters), ("worker", &self.workers)] {
            for (i, node) in nodes.iter().enumerate() {
                node.validate()
                    .with_context(|| format!("validation failed for {role} {}", i + 1))?;
            }
        }
        if let Some(ip) = &self.api_server.virtual_ip {
            parse_ip(ip, "virtual IP").context("validation failed for api-server")?;
        }
        Ok(())
    }
}

impl NodeSpec {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::configuration("node name cannot be empty").into());
        }
        self.address()?;
        Ok(())
    }

    fn address(&self) -> anyhow::Result<Option<IpAddr>> {
        self.ip_address
            .as_deref()
            .map(|ip| parse_ip(ip, "IP address"))
            .transpose()
    }
}

fn parse_ip(ip: &str, what: &str) -> anyhow::Result<IpAddr> {
    ip.trim()
        .parse()
        .map_err(|_| Error::configuration(format!("invalid {what}: '{ip}'")).into())
}

/// Splits comma-separated entries, trims them, and drops blanks and duplicates (keeping order).
fn normalize_list(list: &mut Vec<String>) {
    let mut normalized: Vec<String> = Vec::with_capacity(list.len());
    for entry in list.iter().flat_map(|e| e.split(',')) {
        let entry = entry.trim();
        if !entry.is_empty() && !normalized.iter().any(|n| n == entry) {
            normalized.push(entry.to_owned());
        }
    }
    *list = normalized;
}

fn fill_blank(value: &mut String, default: String) {
    if value.trim().is_empty() {
        *value = default;
    }
}
