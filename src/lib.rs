//! Bootstraps a highly available Kubernetes control plane on machines reachable over SSH.
//!
//! # Program flow
//!
//! This section is meant for developers working on Helix. Operators only need the `helix`
//! binary's `--help`.
//!
//! 1. The `helix` binary collects [config::Flags] from the command line and, optionally, a
//!    [config::ClusterSpec] file.
//!
//! 1. [init] (or [reset]) fills in defaults, validates the flags, and resolves every member into a
//!    [topology::Topology]. For `init`, it also loads or creates the cluster root CA and the
//!    service-account keys in the local configuration directory.
//!
//! 1. The [pipeline::Pipeline] built by [services::pipeline] runs: each unit prepares, every
//!    machine is dialed, and then each unit classifies nodes, changes machines, and finally acts on
//!    the cluster as a whole. See [pipeline] for the exact sequencing.
//!
//! Everything a unit does to a machine goes through a [remote::RemoteClient]. Trust material comes
//! from [pki]. Cluster-scoped units talk to the API server through [api], after [probe] has seen
//! it answer.

pub mod api;
pub mod config;
pub mod error;
pub mod parallel;
pub mod pipeline;
pub mod pki;
pub mod probe;
pub mod remote;
pub mod services;
pub mod template;
pub mod topology;

#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use pipeline::{init, reset};
