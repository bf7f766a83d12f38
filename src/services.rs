//! The units that make up a cluster, and the order they run in.

pub mod addon;
pub mod apiserver;
pub mod architecture;
pub mod ca;
pub mod cni;
pub mod component;
pub mod control_plane;
pub mod dns;
pub mod etcd;
pub mod hyperkube;
pub mod keepalived;
pub mod kubelet;
pub mod manager;
pub mod network;
pub mod proxy;

use crate::pipeline::{Pipeline, ServiceUnit};
use apiserver::ApiServerService;
use architecture::ArchitectureService;
use ca::CaService;
use cni::CniService;
use control_plane::ControlPlaneService;
use dns::DnsService;
use etcd::EtcdService;
use hyperkube::HyperkubeService;
use keepalived::KeepalivedService;
use kubelet::KubeletService;
use manager::{Manager, ManagerService};
use network::NetworkService;
use proxy::ProxyService;
use std::sync::Arc;

/// The default pipeline.
///
/// Order matters: architecture detection comes first because later units pick images by
/// architecture, trust material precedes everything that uses it, the kubelet runs the binary
/// and plugins installed just before it, and the cluster-scoped units run only after every
/// machine has its static pods.
pub fn pipeline() -> Pipeline {
    let etcd = Arc::new(EtcdService::new());
    Pipeline::new(vec![
        ServiceUnit::new("architecture").with_node_initializer(Arc::new(ArchitectureService)),
        ServiceUnit::new("ca").with_machine_operator(Arc::new(CaService)),
        ServiceUnit::new("keepalived").with_machine_operator(Arc::new(KeepalivedService)),
        ServiceUnit::new("hyperkube").with_machine_operator(Arc::new(HyperkubeService)),
        ServiceUnit::new("cni").with_machine_operator(Arc::new(CniService)),
        ServiceUnit::new("kubelet").with_machine_operator(Arc::new(KubeletService)),
        ServiceUnit::new("etcd")
            .with_preparer(etcd.clone())
            .with_node_initializer(etcd.clone())
            .with_machine_operator(etcd),
        ServiceUnit::new("apiserver").with_machine_operator(Arc::new(ApiServerService)),
        ServiceUnit::new("scheduler")
            .with_machine_operator(Arc::new(ManagerService::new(Manager::Scheduler))),
        ServiceUnit::new("controller-manager")
            .with_machine_operator(Arc::new(ManagerService::new(Manager::ControllerManager))),
        ServiceUnit::new("control-plane").with_cluster_initializer(Arc::new(ControlPlaneService)),
        ServiceUnit::new("network").with_cluster_initializer(Arc::new(NetworkService)),
        ServiceUnit::new("proxy").with_cluster_initializer(Arc::new(ProxyService)),
        ServiceUnit::new("dns").with_cluster_initializer(Arc::new(DnsService)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order() {
        let names: Vec<_> = pipeline().units().iter().map(ServiceUnit::name).collect();

        assert_eq!(
            vec![
                "architecture",
                "ca",
                "keepalived",
                "hyperkube",
                "cni",
                "kubelet",
                "etcd",
                "apiserver",
                "scheduler",
                "controller-manager",
                "control-plane",
                "network",
                "proxy",
                "dns",
            ],
            names
        );
    }
}
