//! Machines, their roles, and the derived facts every service needs about the cluster's shape.

use crate::config::Flags;
use crate::error::Error;
use crate::parallel;
use anyhow::Context;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::{debug, info};

/// A CPU architecture that Helix knows how to pick container images for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Architecture {
    Amd64,
    Arm,
}

impl Architecture {
    /// Maps the output of `uname -m` to an [Architecture].
    ///
    /// # Errors
    ///
    /// Returns [Error::UnsupportedArchitecture] for anything other than `x86_64` or `armv7l`.
    pub fn from_uname(machine: &str) -> Result<Self, Error> {
        match machine.trim() {
            "x86_64" => Ok(Architecture::Amd64),
            "armv7l" => Ok(Architecture::Arm),
            other => Err(Error::UnsupportedArchitecture(other.to_owned())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm => "arm",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" => Ok(Architecture::Amd64),
            "arm" => Ok(Architecture::Arm),
            other => Err(Error::UnsupportedArchitecture(other.to_owned())),
        }
    }
}

/// A single machine of the cluster.
///
/// `address` is always a literal IP: names are resolved exactly once, when the [Topology] is
/// built. Only `architecture` changes afterward, and only during the per-node classification
/// phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub address: IpAddr,
    pub architecture: Option<Architecture>,
    pub is_control_plane: bool,
}

impl Node {
    /// Returns the detected architecture.
    ///
    /// # Errors
    ///
    /// Fails if detection hasn't run for this node yet. That indicates a service ordered before
    /// architecture detection.
    pub fn architecture(&self) -> anyhow::Result<Architecture> {
        self.architecture
            .with_context(|| format!("architecture of {} is not known yet", self.name))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Name resolution. Abstracted so tests don't depend on DNS.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Looks up all addresses of `host`.
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;

    /// Looks up the names that `address` maps back to, most preferred first.
    async fn reverse_lookup(&self, address: IpAddr) -> io::Result<Vec<String>>;
}

/// Production implementation of [Resolve]. Forward lookups go through the operating system's
/// resolver, reverse lookups query the name servers from the system configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        // lookup_host wants a port; it doesn't matter which.
        let addresses = tokio::net::lookup_host((host, 0)).await?;
        Ok(addresses.map(|a| a.ip()).collect())
    }

    async fn reverse_lookup(&self, address: IpAddr) -> io::Result<Vec<String>> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(io::Error::other)?;
        let names = resolver
            .reverse_lookup(address)
            .await
            .map_err(io::Error::other)?;
        Ok(names.iter().map(|name| name.to_string()).collect())
    }
}

/// Consults a fixed table of names before falling back to another resolver.
struct PinnedResolver<'a> {
    hosts: &'a BTreeMap<String, IpAddr>,
    inner: &'a dyn Resolve,
}

#[async_trait]
impl Resolve for PinnedResolver<'_> {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        match self.hosts.get(host) {
            Some(address) => Ok(vec![*address]),
            None => self.inner.lookup(host).await,
        }
    }

    async fn reverse_lookup(&self, address: IpAddr) -> io::Result<Vec<String>> {
        let pinned: Vec<String> = self
            .hosts
            .iter()
            .filter(|(_, a)| **a == address)
            .map(|(name, _)| name.clone())
            .collect();
        if pinned.is_empty() {
            self.inner.reverse_lookup(address).await
        } else {
            Ok(pinned)
        }
    }
}

/// Turns machine names into [Node]s.
///
/// Literal IP addresses are used as they are, and the node is named `node-<address>`. Anything
/// else is resolved through `resolver` and the first address returned is used. All lookups run
/// concurrently.
///
/// # Errors
///
/// Returns [Error::Resolution] if a lookup fails or yields no address.
pub async fn resolve(
    resolver: &dyn Resolve,
    names: &[String],
    is_control_plane: bool,
) -> anyhow::Result<Vec<Node>> {
    parallel::first_error(
        names
            .iter()
            .map(|name| resolve_one(resolver, name, is_control_plane)),
    )
    .await
}

async fn resolve_one(
    resolver: &dyn Resolve,
    name: &str,
    is_control_plane: bool,
) -> anyhow::Result<Node> {
    if let Ok(address) = name.parse::<IpAddr>() {
        return Ok(Node {
            name: format!("node-{address}"),
            address,
            architecture: None,
            is_control_plane,
        });
    }

    let addresses = resolver.lookup(name).await.map_err(|e| Error::Resolution {
        name: name.to_owned(),
        reason: e.to_string(),
    })?;
    let address = addresses.first().copied().ok_or_else(|| Error::Resolution {
        name: name.to_owned(),
        reason: "no addresses found".to_owned(),
    })?;
    debug!("resolved {name} to {address}");
    Ok(Node {
        name: name.to_owned(),
        address,
        architecture: None,
        is_control_plane,
    })
}

/// Finds the control-plane machines behind the API server's DNS name.
///
/// Every address `dns_name` resolves to becomes a control-plane node, named after the first label
/// of the first name its address maps back to. Reverse lookups run concurrently.
///
/// # Errors
///
/// Returns [Error::Resolution] if any lookup fails or comes back empty.
pub async fn discover_control_plane(
    resolver: &dyn Resolve,
    dns_name: &str,
) -> anyhow::Result<Vec<Node>> {
    let addresses = resolver
        .lookup(dns_name)
        .await
        .map_err(|e| Error::Resolution {
            name: dns_name.to_owned(),
            reason: e.to_string(),
        })?;
    if addresses.is_empty() {
        return Err(Error::Resolution {
            name: dns_name.to_owned(),
            reason: "no addresses found".to_owned(),
        }
        .into());
    }
    parallel::first_error(
        addresses
            .into_iter()
            .map(|address| discover_one(resolver, address)),
    )
    .await
}

async fn discover_one(resolver: &dyn Resolve, address: IpAddr) -> anyhow::Result<Node> {
    let unresolved = |reason: String| Error::Resolution {
        name: address.to_string(),
        reason,
    };
    let names = resolver
        .reverse_lookup(address)
        .await
        .map_err(|e| unresolved(e.to_string()))?;
    let name = names
        .first()
        .and_then(|name| name.split('.').next())
        .filter(|label| !label.is_empty())
        .ok_or_else(|| unresolved("no names found".to_owned()))?;
    info!(%name, %address, "Found control-plane member");
    Ok(Node {
        name: name.to_owned(),
        address,
        architecture: None,
        is_control_plane: true,
    })
}

/// Combines two lists of nodes into one, deduplicated by name and sorted by name.
///
/// When a name occurs in both lists, the entry from `control_plane` is kept.
pub fn merge(primary: Vec<Node>, control_plane: Vec<Node>) -> Vec<Node> {
    let mut nodes = BTreeMap::new();
    for node in primary.into_iter().chain(control_plane) {
        nodes.insert(node.name.clone(), node);
    }
    nodes.into_values().collect()
}

/// The full set of machines plus how clients reach the API server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Topology {
    nodes: Vec<Node>,
    api_server_virtual_ip: Option<IpAddr>,
    api_server_dns_name: Option<String>,
}

impl Topology {
    /// Builds a topology from already resolved nodes. The nodes are deduplicated and sorted.
    pub fn new(
        nodes: Vec<Node>,
        api_server_virtual_ip: Option<IpAddr>,
        api_server_dns_name: Option<String>,
    ) -> Self {
        Topology {
            nodes: merge(nodes, Vec::new()),
            api_server_virtual_ip,
            api_server_dns_name,
        }
    }

    /// Resolves the members and control-plane members named in `flags` into a topology.
    ///
    /// Names pinned in [Flags::hosts] skip DNS. Without control-plane members or a virtual IP,
    /// the control plane is discovered from the API server's DNS name. If [Flags::architecture]
    /// is set, every node gets that architecture up front.
    pub async fn resolve(resolver: &dyn Resolve, flags: &Flags) -> anyhow::Result<Self> {
        let resolver = PinnedResolver {
            hosts: &flags.hosts,
            inner: resolver,
        };
        let members = resolve(&resolver, &flags.members, false)
            .await
            .context("failed to resolve members")?;
        let mut control_plane = resolve(&resolver, &flags.control_plane.members, true)
            .await
            .context("failed to resolve control-plane members")?;
        if control_plane.is_empty() && flags.control_plane.api_server_virtual_ip.is_none() {
            if let Some(dns_name) = flags.control_plane.api_server_dns_name.as_deref() {
                control_plane = discover_control_plane(&resolver, dns_name)
                    .await
                    .with_context(|| {
                        format!("failed to discover the control plane behind {dns_name}")
                    })?;
            }
        }

        let mut topology = Topology {
            nodes: merge(members, control_plane),
            api_server_virtual_ip: flags.control_plane.api_server_virtual_ip,
            api_server_dns_name: flags.control_plane.api_server_dns_name.clone(),
        };
        if let Some(architecture) = flags.architecture {
            for node in topology.nodes_mut() {
                node.architecture = Some(architecture);
            }
        }
        Ok(topology)
    }

    /// All nodes, sorted by name.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    /// The control-plane nodes, in the same order as [Self::nodes].
    pub fn control_plane(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_control_plane)
    }

    /// Returns the position of `node` among the control-plane nodes, matching on name or address.
    ///
    /// Only used to derive stable priorities (e.g. which node starts out as the keepalived
    /// master). Returns [None] if `node` is not part of the control plane.
    pub fn control_plane_index(&self, node: &Node) -> Option<usize> {
        self.control_plane()
            .position(|n| n.name == node.name || n.address == node.address)
    }

    /// Returns every distinct architecture in the cluster.
    ///
    /// # Errors
    ///
    /// Fails if any node's architecture hasn't been detected yet.
    pub fn architectures(&self) -> anyhow::Result<BTreeSet<Architecture>> {
        self.nodes.iter().map(Node::architecture).collect()
    }

    pub fn api_server_virtual_ip(&self) -> Option<IpAddr> {
        self.api_server_virtual_ip
    }

    pub fn api_server_dns_name(&self) -> Option<&str> {
        self.api_server_dns_name.as_deref()
    }

    /// Returns the host that clients use to reach the API server: the virtual IP if one is
    /// configured, else the DNS name, else the first control-plane node's address.
    ///
    /// # Errors
    ///
    /// Returns [Error::Configuration] if none of those exist.
    pub fn api_server_address(&self) -> anyhow::Result<String> {
        if let Some(ip) = self.api_server_virtual_ip {
            return Ok(ip.to_string());
        }
        if let Some(name) = &self.api_server_dns_name {
            return Ok(name.clone());
        }
        self.control_plane()
            .next()
            .map(|n| n.address.to_string())
            .ok_or_else(|| Error::configuration("no control-plane nodes").into())
    }
}

#[cfg(test)]
pub mod fixtures {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // A resolver backed by fixed tables that counts how often it was asked.
    #[derive(Debug, Default)]
    pub struct StaticResolver {
        pub table: HashMap<String, Vec<IpAddr>>,
        pub reverse: HashMap<IpAddr, Vec<String>>,
        pub lookups: AtomicUsize,
    }

    impl StaticResolver {
        pub fn new<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
            let mut table: HashMap<String, Vec<IpAddr>> = HashMap::new();
            for (name, address) in entries {
                table
                    .entry(name.to_owned())
                    .or_default()
                    .push(address.parse().unwrap());
            }
            StaticResolver {
                table,
                ..Default::default()
            }
        }

        // Adds (address, name) entries for reverse lookups.
        pub fn with_names<'a>(
            mut self,
            entries: impl IntoIterator<Item = (&'a str, &'a str)>,
        ) -> Self {
            for (address, name) in entries {
                self.reverse
                    .entry(address.parse().unwrap())
                    .or_default()
                    .push(name.to_owned());
            }
            self
        }

        pub fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Resolve for StaticResolver {
        async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            match self.table.get(host) {
                Some(addresses) => Ok(addresses.clone()),
                None if host == "empty" => Ok(Vec::new()),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "no such host")),
            }
        }

        async fn reverse_lookup(&self, address: IpAddr) -> io::Result<Vec<String>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            match self.reverse.get(&address) {
                Some(names) => Ok(names.clone()),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "no PTR record")),
            }
        }
    }

    pub fn node(name: &str, address: &str, is_control_plane: bool) -> Node {
        Node {
            name: name.to_owned(),
            address: address.parse().unwrap(),
            architecture: None,
            is_control_plane,
        }
    }

    pub fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }
}
