//! Waiting for the API server to come up.

use crate::api::ClusterApi;
use crate::error::Error;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, info};

/// Bounds for [wait_until_responsive].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Give up after this long.
    pub timeout: Duration,

    /// Abandon a single request after this long.
    pub attempt_timeout: Duration,

    /// Pause between attempts.
    pub interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            timeout: Duration::from_secs(10 * 60),
            attempt_timeout: Duration::from_secs(15),
            interval: Duration::from_secs(1),
        }
    }
}

/// Polls the list of nodes until it is non-empty.
///
/// An API server may answer before any kubelet has registered, so an empty list counts as "not
/// ready yet", the same as a failed or timed-out request.
///
/// # Errors
///
/// Returns [Error::Timeout] once `config.timeout` has elapsed.
pub async fn wait_until_responsive(
    api: &dyn ClusterApi,
    config: &ProbeConfig,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + config.timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt_timeout = config.attempt_timeout.min(remaining);
        match time::timeout(attempt_timeout, api.list_nodes()).await {
            Ok(Ok(nodes)) if nodes > 0 => {
                info!(nodes, "Control plane is responsive");
                return Ok(());
            }
            Ok(Ok(_)) => debug!("API server answered, but no nodes have registered yet"),
            Ok(Err(e)) => debug!(error = %e, "API server not responding yet"),
            Err(_) => debug!("API server request timed out"),
        }

        if Instant::now() + config.interval >= deadline {
            return Err(Error::Timeout {
                operation: "waiting for the control plane",
                timeout: config.timeout,
            }
            .into());
        }
        time::sleep(config.interval).await;
    }
}
