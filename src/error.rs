//! The categories of failure that Helix distinguishes.
//!
//! Functions throughout the crate return [anyhow::Result] and attach context as errors bubble up
//! through phases, nodes, and services. The root cause of a failure is always one of the [Error]
//! variants below, so callers that care about the category can recover it with
//! [anyhow::Error::downcast_ref].

use std::time::Duration;
use thiserror::Error;

/// A failure category, as reported to the operator.
#[derive(Debug, Error)]
pub enum Error {
    /// A machine name could not be turned into an address.
    #[error("failed to resolve '{name}': {reason}")]
    Resolution { name: String, reason: String },

    /// The remote shell handshake failed, even after retrying.
    #[error("failed to dial {host} ({address}) after {attempts} attempt(s): {reason}")]
    Dial {
        host: String,
        address: String,
        attempts: u32,
        reason: String,
    },

    /// A command or file operation failed on a live connection.
    #[error("remote command failed on {host}: {command}\n{stderr}")]
    RemoteExec {
        host: String,
        command: String,
        stderr: String,
    },

    /// Key generation, signing, or loading of trust material failed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// A machine reported a platform that Helix can't provision.
    #[error("unsupported architecture '{0}'")]
    UnsupportedArchitecture(String),

    /// A bounded wait ran out of time.
    #[error("{operation} did not complete within {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Required input is missing or malformed.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A template could not be parsed or expanded.
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
}

impl Error {
    /// Shorthand for [Error::Configuration].
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// Shorthand for [Error::Certificate].
    pub fn certificate(message: impl std::fmt::Display) -> Self {
        Error::Certificate(message.to_string())
    }
}
