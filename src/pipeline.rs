//! Sequencing of service units across the machines of a cluster.
//!
//! A run goes through these phases, strictly one after the other:
//!
//! 1. **Prepare**: every unit's [Prepare] handler, sequentially and in list order.
//! 2. **Dial**: a [RemoteClient] for every node, concurrently. A single failure ends the run.
//! 3. **Units**: for each unit in list order (reverse order for `reset`), its [InitNode] handler on
//!    every node concurrently, then its [OperateMachine] handler on every node concurrently, then
//!    its [InitCluster] (or [ResetCluster]) handler once.
//!
//! In dry-run mode, [InitCluster] and [ResetCluster] handlers are skipped.
//!
//! Within a fan-out, the first error collected wins once every node has finished. Work already
//! done on other nodes is not rolled back; runs are idempotent and meant to be repeated until they
//! succeed.
//!
//! Unit order is the only dependency mechanism. It lives in a single [Pipeline] value.

use crate::api::{ClusterApi, ConnectApi};
use crate::config::Flags;
use crate::parallel;
use crate::pki::{CertificateAuthority, ServiceAccountKeys};
use crate::probe::ProbeConfig;
use crate::remote::{Dial, RemoteClient};
use crate::topology::{Node, Resolve, Topology};
use anyhow::Context as _;
use async_trait::async_trait;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Common name of the cluster's root CA.
pub const KUBERNETES_CA_NAME: &str = "kubernetes-ca";

/// One-time setup of a unit, before any machine is contacted.
#[async_trait]
pub trait Prepare: Send + Sync {
    /// `will_init` is `false` for `reset`, so units can skip setup only `init` needs.
    async fn prepare(&self, ctx: &Context<'_>, will_init: bool) -> anyhow::Result<()>;
}

/// Read-only classification of a node, such as architecture detection.
///
/// The only phase allowed to change [Node] records.
#[async_trait]
pub trait InitNode: Send + Sync {
    async fn init_node(
        &self,
        node: &mut Node,
        client: &RemoteClient,
        flags: &Flags,
    ) -> anyhow::Result<()>;
}

/// Changes the state of a machine.
#[async_trait]
pub trait OperateMachine: Send + Sync {
    async fn init_machine(
        &self,
        node: &Node,
        client: &RemoteClient,
        ctx: &Context<'_>,
    ) -> anyhow::Result<()>;

    async fn reset_machine(
        &self,
        node: &Node,
        client: &RemoteClient,
        ctx: &Context<'_>,
    ) -> anyhow::Result<()>;
}

/// Cluster-wide work during `init`, run once.
#[async_trait]
pub trait InitCluster: Send + Sync {
    async fn init_cluster(&self, ctx: &Context<'_>) -> anyhow::Result<()>;
}

/// Cluster-wide work during `reset`, run once.
#[async_trait]
pub trait ResetCluster: Send + Sync {
    async fn reset_cluster(&self, ctx: &Context<'_>) -> anyhow::Result<()>;
}

/// A named service and the capabilities it has.
///
/// The runner checks which handlers are present; a unit without, say, an [OperateMachine] handler
/// is simply skipped in that phase.
#[derive(Clone)]
pub struct ServiceUnit {
    name: &'static str,
    preparer: Option<Arc<dyn Prepare>>,
    node_initializer: Option<Arc<dyn InitNode>>,
    machine_operator: Option<Arc<dyn OperateMachine>>,
    cluster_initializer: Option<Arc<dyn InitCluster>>,
    cluster_resetter: Option<Arc<dyn ResetCluster>>,
}

impl ServiceUnit {
    pub fn new(name: &'static str) -> Self {
        ServiceUnit {
            name,
            preparer: None,
            node_initializer: None,
            machine_operator: None,
            cluster_initializer: None,
            cluster_resetter: None,
        }
    }

    pub fn with_preparer(mut self, handler: Arc<dyn Prepare>) -> Self {
        self.preparer = Some(handler);
        self
    }

    pub fn with_node_initializer(mut self, handler: Arc<dyn InitNode>) -> Self {
        self.node_initializer = Some(handler);
        self
    }

    pub fn with_machine_operator(mut self, handler: Arc<dyn OperateMachine>) -> Self {
        self.machine_operator = Some(handler);
        self
    }

    pub fn with_cluster_initializer(mut self, handler: Arc<dyn InitCluster>) -> Self {
        self.cluster_initializer = Some(handler);
        self
    }

    pub fn with_cluster_resetter(mut self, handler: Arc<dyn ResetCluster>) -> Self {
        self.cluster_resetter = Some(handler);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ServiceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceUnit")
            .field("name", &self.name)
            .field("prepare", &self.preparer.is_some())
            .field("init_node", &self.node_initializer.is_some())
            .field("operate_machine", &self.machine_operator.is_some())
            .field("init_cluster", &self.cluster_initializer.is_some())
            .field("reset_cluster", &self.cluster_resetter.is_some())
            .finish()
    }
}

/// The ordered list of units that make up a cluster.
#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    units: Vec<ServiceUnit>,
}

/// Which way a run goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Init,
    Reset,
}

impl Pipeline {
    pub fn new(units: Vec<ServiceUnit>) -> Self {
        Pipeline { units }
    }

    pub fn units(&self) -> &[ServiceUnit] {
        &self.units
    }

    /// Runs every phase against `topology`.
    ///
    /// # Errors
    ///
    /// Stops at the first phase that fails and returns its first error, with context naming the
    /// unit and node.
    pub async fn run(
        &self,
        phase: Phase,
        topology: &mut Topology,
        deps: &Dependencies,
        flags: &Flags,
        dialer: &dyn Dial,
    ) -> anyhow::Result<()> {
        let will_init = phase == Phase::Init;
        let ctx = Context {
            topology,
            deps,
            flags,
        };
        for unit in &self.units {
            if let Some(preparer) = &unit.preparer {
                debug!(service = unit.name, "Preparing");
                preparer
                    .prepare(&ctx, will_init)
                    .await
                    .with_context(|| format!("failed to prepare {}", unit.name))?;
            }
        }

        let dials = topology.nodes().iter().map(|n| dialer.dial(n, flags.dry_run));
        let clients = parallel::first_error(dials)
            .await
            .context("failed to connect to all machines")?;

        let result = self
            .run_units(phase, topology, deps, flags, &clients)
            .await;

        for client in clients {
            let host = client.host_name().to_owned();
            if let Err(e) = client.close().await {
                warn!(%host, error = %e, "failed to close connection");
            }
        }
        result
    }

    async fn run_units(
        &self,
        phase: Phase,
        topology: &mut Topology,
        deps: &Dependencies,
        flags: &Flags,
        clients: &[RemoteClient],
    ) -> anyhow::Result<()> {
        let units: Vec<&ServiceUnit> = match phase {
            Phase::Init => self.units.iter().collect(),
            Phase::Reset => self.units.iter().rev().collect(),
        };

        for unit in units {
            let name = unit.name;

            if let Some(initializer) = &unit.node_initializer {
                debug!(service = name, "Classifying nodes");
                let nodes = topology.nodes_mut().iter_mut().zip(clients);
                parallel::first_error(nodes.map(|(node, client)| async move {
                    initializer
                        .init_node(node, client, flags)
                        .await
                        .with_context(|| format!("{name} failed on {}", node.name))
                }))
                .await?;
            }

            let ctx = Context {
                topology,
                deps,
                flags,
            };

            if let Some(operator) = &unit.machine_operator {
                match phase {
                    Phase::Init => info!(service = name, "Initializing machines"),
                    Phase::Reset => info!(service = name, "Resetting machines"),
                }
                let ctx = &ctx;
                let nodes = topology.nodes().iter().zip(clients);
                parallel::first_error(nodes.map(|(node, client)| async move {
                    let result = match phase {
                        Phase::Init => operator.init_machine(node, client, ctx).await,
                        Phase::Reset => operator.reset_machine(node, client, ctx).await,
                    };
                    result.with_context(|| format!("{name} failed on {}", node.name))
                }))
                .await?;
            }

            let has_cluster_handler = match phase {
                Phase::Init => unit.cluster_initializer.is_some(),
                Phase::Reset => unit.cluster_resetter.is_some(),
            };
            if flags.dry_run && has_cluster_handler {
                info!(service = name, "Dry run, not contacting the API server");
                continue;
            }
            match (phase, &unit.cluster_initializer, &unit.cluster_resetter) {
                (Phase::Init, Some(initializer), _) => {
                    info!(service = name, "Initializing cluster");
                    initializer
                        .init_cluster(&ctx)
                        .await
                        .with_context(|| format!("{name} failed to initialize the cluster"))?;
                }
                (Phase::Reset, _, Some(resetter)) => {
                    info!(service = name, "Resetting cluster");
                    resetter
                        .reset_cluster(&ctx)
                        .await
                        .with_context(|| format!("{name} failed to reset the cluster"))?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Shared, read-only values injected into every unit.
pub struct Dependencies {
    kubernetes_ca: Option<CertificateAuthority>,
    service_account: Option<ServiceAccountKeys>,
    conf_dir: Option<PathBuf>,
    api: Arc<dyn ConnectApi>,
    pub probe: ProbeConfig,
}

impl Dependencies {
    /// Creates the local configuration directory and loads, or creates, the root CA and the
    /// service-account keys inside it.
    pub fn for_init(flags: &Flags, api: Arc<dyn ConnectApi>) -> anyhow::Result<Self> {
        let conf_dir = flags.conf_dir()?;
        fs::create_dir_all(conf_dir)
            .with_context(|| format!("failed to create {}", conf_dir.display()))?;

        let kubernetes_ca = CertificateAuthority::load_or_create(
            KUBERNETES_CA_NAME,
            conf_dir.join("kubernetes-ca.crt"),
            conf_dir.join("kubernetes-ca.key"),
        )?;
        let service_account = ServiceAccountKeys::load_or_create(
            conf_dir.join("kubernetes-sa.pub"),
            conf_dir.join("kubernetes-sa.key"),
        )?;
        Ok(Dependencies {
            kubernetes_ca: Some(kubernetes_ca),
            service_account: Some(service_account),
            conf_dir: Some(conf_dir.to_owned()),
            api,
            probe: ProbeConfig::default(),
        })
    }

    /// Dependencies for `reset`, which never touches trust material.
    pub fn for_reset(api: Arc<dyn ConnectApi>) -> Self {
        Dependencies {
            kubernetes_ca: None,
            service_account: None,
            conf_dir: None,
            api,
            probe: ProbeConfig::default(),
        }
    }

    pub fn kubernetes_ca(&self) -> anyhow::Result<&CertificateAuthority> {
        self.kubernetes_ca
            .as_ref()
            .context("the cluster CA is only available during init")
    }

    pub fn service_account(&self) -> anyhow::Result<&ServiceAccountKeys> {
        self.service_account
            .as_ref()
            .context("the service-account keys are only available during init")
    }

    /// The local configuration directory, during `init`.
    pub fn conf_dir(&self) -> anyhow::Result<&std::path::Path> {
        self.conf_dir
            .as_deref()
            .context("the configuration directory is only available during init")
    }
}

/// Everything a handler can see about the run.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub topology: &'a Topology,
    pub deps: &'a Dependencies,
    pub flags: &'a Flags,
}

impl Context<'_> {
    /// Connects to the API server as the cluster administrator.
    pub async fn connect_api(&self) -> anyhow::Result<Box<dyn ClusterApi>> {
        let ca = self.deps.kubernetes_ca()?;
        self.deps.api.connect(self.topology, ca, self.flags).await
    }
}

/// The outside world a run depends on.
pub struct Collaborators<'a> {
    pub resolver: &'a dyn Resolve,
    pub dialer: &'a dyn Dial,
    pub api: Arc<dyn ConnectApi>,
}

/// Brings up the cluster described by `flags`.
pub async fn init(
    mut flags: Flags,
    pipeline: &Pipeline,
    collaborators: Collaborators<'_>,
) -> anyhow::Result<()> {
    flags.setup_defaults(true)?;
    let mut topology = Topology::resolve(collaborators.resolver, &flags).await?;
    let deps = Dependencies::for_init(&flags, collaborators.api)?;
    pipeline
        .run(
            Phase::Init,
            &mut topology,
            &deps,
            &flags,
            collaborators.dialer,
        )
        .await
}

/// Tears down the cluster described by `flags`.
pub async fn reset(
    mut flags: Flags,
    pipeline: &Pipeline,
    collaborators: Collaborators<'_>,
) -> anyhow::Result<()> {
    flags.setup_defaults(false)?;
    let mut topology = Topology::resolve(collaborators.resolver, &flags).await?;
    let deps = Dependencies::for_reset(collaborators.api);
    pipeline
        .run(
            Phase::Reset,
            &mut topology,
            &deps,
            &flags,
            collaborators.dialer,
        )
        .await
}
