use clap::{Args, Parser, Subcommand};
use helix::api::KubeConnector;
use helix::config::{
    self, ClusterSpec, ClusterState, ControlPlaneFlags, EtcdFlags, Flags, Images,
    KubernetesFlags, DEFAULT_API_SERVER_PORT, DEFAULT_CLUSTER_DNS, DEFAULT_CLUSTER_DOMAIN,
    DEFAULT_COREDNS_VERSION, DEFAULT_ETCD_VERSION, DEFAULT_FLANNEL_VERSION,
    DEFAULT_KUBERNETES_VERSION, DEFAULT_SERVICE_CLUSTER_IP_RANGE,
};
use helix::pipeline::Collaborators;
use helix::remote::openssh::SshDialer;
use helix::services;
use helix::topology::{Architecture, SystemResolver};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Bootstraps a highly available Kubernetes cluster over SSH.
#[derive(Debug, Parser)]
#[command(name = "helix")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install or update the cluster on every member.
    Init(ClusterArgs),

    /// Remove the cluster from every member.
    Reset(ClusterArgs),

    /// Print the version and exit.
    Version,
}

#[derive(Debug, Args)]
struct ClusterArgs {
    /// Local directory holding the cluster's root certificates and keys.
    #[arg(short = 'c', long)]
    conf_dir: Option<PathBuf>,

    /// Members of the cluster, by name or address, comma separated.
    #[arg(short = 'm', long, value_delimiter = ',')]
    members: Vec<String>,

    /// Control-plane members, comma separated.
    #[arg(long, value_delimiter = ',')]
    control_plane_members: Vec<String>,

    /// YAML file describing the members; merged with the other flags.
    #[arg(long)]
    cluster_spec: Option<PathBuf>,

    /// User to log in as [default: pi, or the cluster spec's ssh-user]
    #[arg(long)]
    ssh_user: Option<String>,

    /// Log what would be done instead of doing it.
    #[arg(long)]
    dry_run: bool,

    /// Address floated between the control-plane members.
    #[arg(long)]
    apiserver_virtual_ip: Option<IpAddr>,

    /// DNS name clients use for the API server.
    #[arg(long, env = "HELIX_K8S_API_DNS_NAME")]
    apiserver_dns_name: Option<String>,

    /// Force the etcd bootstrap state instead of detecting it.
    #[arg(long)]
    etcd_cluster_state: Option<ClusterState>,

    /// Architecture of every member; skips detection.
    #[arg(long)]
    architecture: Option<Architecture>,

    #[arg(long, default_value = DEFAULT_KUBERNETES_VERSION)]
    kubernetes_version: String,

    #[arg(long, default_value_t = DEFAULT_API_SERVER_PORT)]
    apiserver_port: u16,

    #[arg(long, default_value = DEFAULT_SERVICE_CLUSTER_IP_RANGE)]
    service_cluster_ip_range: String,

    #[arg(long, default_value = DEFAULT_CLUSTER_DNS)]
    cluster_dns: String,

    #[arg(long, default_value = DEFAULT_CLUSTER_DOMAIN)]
    cluster_domain: String,

    /// Kubernetes feature gates, comma separated.
    #[arg(long, value_delimiter = ',')]
    feature_gates: Vec<String>,

    #[arg(long, default_value = DEFAULT_ETCD_VERSION)]
    etcd_version: String,

    #[arg(long, default_value = DEFAULT_FLANNEL_VERSION)]
    flannel_version: String,

    #[arg(long, default_value = DEFAULT_COREDNS_VERSION)]
    coredns_version: String,
}

impl ClusterArgs {
    fn into_flags(self) -> anyhow::Result<Flags> {
        let mut flags = Flags {
            dry_run: self.dry_run,
            local_conf_dir: self.conf_dir.or_else(config::default_conf_dir),
            members: self.members,
            architecture: self.architecture,
            control_plane: ControlPlaneFlags {
                members: self.control_plane_members,
                api_server_virtual_ip: self.apiserver_virtual_ip,
                api_server_dns_name: self.apiserver_dns_name,
            },
            etcd: EtcdFlags {
                cluster_state: self.etcd_cluster_state,
            },
            kubernetes: KubernetesFlags {
                version: self.kubernetes_version,
                api_server_port: self.apiserver_port,
                service_cluster_ip_range: self.service_cluster_ip_range,
                cluster_dns: self.cluster_dns,
                cluster_domain: self.cluster_domain,
                feature_gates: self.feature_gates,
            },
            images: Images {
                etcd_version: self.etcd_version,
                flannel_version: self.flannel_version,
                coredns_version: self.coredns_version,
            },
            ..Flags::default()
        };
        if let Some(path) = self.cluster_spec {
            flags.apply_cluster_spec(&ClusterSpec::from_file(path)?)?;
        }
        if let Some(user) = self.ssh_user {
            flags.ssh.user = user;
        }
        Ok(flags)
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    let (args, will_init) = match command {
        Command::Init(args) => (args, true),
        Command::Reset(args) => (args, false),
        Command::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };
    let flags = args.into_flags()?;
    let dialer = SshDialer::new(flags.ssh.clone());
    let collaborators = Collaborators {
        resolver: &SystemResolver,
        dialer: &dialer,
        api: Arc::new(KubeConnector),
    };
    let pipeline = services::pipeline();
    if will_init {
        helix::init(flags, &pipeline, collaborators).await
    } else {
        helix::reset(flags, &pipeline, collaborators).await
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse().command).await {
        Ok(()) => {
            info!("Done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
