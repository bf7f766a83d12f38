//! Runs commands on, and synchronizes files to, a single machine.
//!
//! A [RemoteClient] wraps a [Transport], which knows how to run one shell command on the machine.
//! Everything else (directories, files, templates, removals) is expressed as shell commands on top
//! of that. There is no content diffing: [RemoteClient::update_file] always rewrites the file and
//! reapplies its mode, so every `init` is a full re-push.

use crate::error::Error;
use crate::template;
use crate::topology::Node;
use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(feature = "openssh")]
pub mod openssh;

#[cfg(test)]
pub mod fixtures;

/// How many times the initial handshake with a machine is attempted.
pub const DIAL_ATTEMPTS: u32 = 3;

/// The upper bound of the random pause between two dial attempts.
const DIAL_BACKOFF_MILLIS: u64 = 100;

/// A live connection to one machine that can run shell commands.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs `command` through the remote shell, feeding it `stdin` if given, and waits for it to
    /// exit.
    ///
    /// Returns `Err` only if the command couldn't be run at all. A command that ran and failed
    /// is reported through the exit status of the returned [Output].
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> anyhow::Result<Output>;

    /// Shuts the connection down. Further calls to [Self::exec] fail.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Opens [RemoteClient]s to nodes.
#[async_trait]
pub trait Dial: Send + Sync {
    /// Connects to `node` and, on success, returns a client for it. With `dry_run`, the client
    /// logs commands instead of sending them.
    ///
    /// # Errors
    ///
    /// Returns [Error::Dial] if no connection could be established.
    async fn dial(&self, node: &Node, dry_run: bool) -> anyhow::Result<RemoteClient>;
}

/// Runs `connect` until it succeeds, at most [DIAL_ATTEMPTS] times, sleeping a random fraction of
/// a tenth of a second in between. Freshly booted machines often refuse the first handshake.
///
/// # Errors
///
/// Returns [Error::Dial] with the last failure once every attempt has failed.
pub async fn dial_with_retry<F, Fut, T>(node: &Node, mut connect: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match connect().await {
            Ok(connection) => return Ok(connection),
            Err(e) if attempt < DIAL_ATTEMPTS => {
                let pause = rand::thread_rng().gen_range(0..DIAL_BACKOFF_MILLIS);
                debug!(
                    host = %node.name,
                    attempt,
                    error = %e,
                    "dial failed, retrying in {pause}ms"
                );
                tokio::time::sleep(Duration::from_millis(pause)).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(Error::Dial {
                    host: node.name.clone(),
                    address: node.address.to_string(),
                    attempts: attempt,
                    reason: format!("{e:#}"),
                }
                .into())
            }
        }
    }
}

/// Executes commands on exactly one machine.
pub struct RemoteClient {
    transport: Box<dyn Transport>,
    host_name: String,
    address: String,
    dry_run: bool,
}

impl RemoteClient {
    pub fn new(transport: Box<dyn Transport>, node: &Node, dry_run: bool) -> Self {
        RemoteClient {
            transport,
            host_name: node.name.clone(),
            address: node.address.to_string(),
            dry_run,
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Runs `command` and returns its standard output, minus one trailing newline.
    ///
    /// In dry-run mode, the command is only logged and the output is empty. `quiet` keeps
    /// failures out of the error log; use it for probes that are expected to fail.
    ///
    /// # Errors
    ///
    /// Returns [Error::RemoteExec], carrying the command's stderr, if it couldn't be run or
    /// exited unsuccessfully.
    pub async fn run(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        quiet: bool,
    ) -> anyhow::Result<String> {
        let stdout = self.run_raw(command, stdin, quiet).await?;
        let mut stdout = String::from_utf8_lossy(&stdout).into_owned();
        if stdout.ends_with('\n') {
            stdout.pop();
        }
        Ok(stdout)
    }

    async fn run_raw(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        quiet: bool,
    ) -> anyhow::Result<Vec<u8>> {
        if self.dry_run {
            info!(host = %self.host_name, "Will run: {command}");
            return Ok(Vec::new());
        }
        debug!(host = %self.host_name, "Running: {command}");

        let fail = |stderr: String| {
            if !quiet {
                error!(host = %self.host_name, %command, %stderr, "remote command failed");
            }
            Error::RemoteExec {
                host: self.host_name.clone(),
                command: command.to_owned(),
                stderr,
            }
        };

        let output = match self.transport.exec(command, stdin).await {
            Ok(output) => output,
            Err(e) => return Err(fail(format!("{e:#}")).into()),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_owned();
            return Err(fail(stderr).into());
        }
        Ok(output.stdout)
    }

    /// Creates `path` and its parents if needed, then applies `mode` to it.
    pub async fn ensure_directory(&self, path: impl AsRef<Path>, mode: u32) -> anyhow::Result<()> {
        let path = quote(path.as_ref())?;
        self.run(
            &format!("sudo mkdir -p {path} && sudo chmod {mode:04o} {path}"),
            None,
            false,
        )
        .await
        .map(drop)
    }

    /// Makes sure the directory containing `path` exists, with mode `0755`.
    pub async fn ensure_directory_of(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        match path.as_ref().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                self.ensure_directory(parent, 0o755).await
            }
            _ => Ok(()),
        }
    }

    /// Writes `content` to `path`, replacing whatever was there, and applies `mode`.
    ///
    /// The parent directory is created first if it's missing. The file is created with its final
    /// mode, so keys are never readable by others, not even briefly.
    pub async fn update_file(
        &self,
        path: impl AsRef<Path>,
        content: &[u8],
        mode: u32,
    ) -> anyhow::Result<()> {
        let path = path.as_ref();
        self.ensure_directory_of(path).await?;
        let quoted = quote(path)?;
        self.run(
            &format!("sudo install -m {mode:04o} /dev/stdin {quoted}"),
            Some(content),
            false,
        )
        .await
        .with_context(|| format!("failed to update {} on {}", path.display(), self.host_name))
        .map(drop)
    }

    /// Returns the content of `path`.
    pub async fn read_file(&self, path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
        let path = quote(path.as_ref())?;
        self.run_raw(&format!("sudo cat {path}"), None, false).await
    }

    /// Reports whether `path` is an existing directory.
    pub async fn directory_exists(&self, path: impl AsRef<Path>) -> anyhow::Result<bool> {
        let path = quote(path.as_ref())?;
        let answer = self
            .run(
                &format!("sudo test -d {path} && echo yes || echo no"),
                None,
                true,
            )
            .await?;
        Ok(answer.trim() == "yes")
    }

    /// Expands the template `body` against `options` and writes the result to `path`.
    ///
    /// # Errors
    ///
    /// Template errors are returned before anything is sent to the machine.
    pub async fn render(
        &self,
        body: &str,
        path: impl AsRef<Path>,
        options: &impl Serialize,
        mode: u32,
    ) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = template::render(body, options)
            .with_context(|| format!("failed to render {}", path.display()))?;
        self.update_file(path, content.as_bytes(), mode).await
    }

    /// Removes `path`. A missing file is not an error.
    pub async fn remove_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = quote(path.as_ref())?;
        self.run(&format!("sudo rm -f {path}"), None, false)
            .await
            .map(drop)
    }

    /// Removes `path` and everything below it. A missing directory is not an error.
    pub async fn remove_directory(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = quote(path.as_ref())?;
        self.run(&format!("sudo rm -rf {path}"), None, false)
            .await
            .map(drop)
    }

    /// Runs `command` for its side effect, logging a failure as a warning instead of returning
    /// it. For teardown steps whose target may already be gone.
    pub async fn run_best_effort(&self, command: &str) {
        if let Err(e) = self.run(command, None, true).await {
            warn!(host = %self.host_name, error = %e, "ignoring failure of '{command}'");
        }
    }

    /// Closes the connection.
    pub async fn close(mut self) -> anyhow::Result<()> {
        self.transport
            .close()
            .await
            .with_context(|| format!("failed to close connection to {}", self.host_name))
    }
}

/// Quotes `path` for use in a shell command.
fn quote(path: &Path) -> anyhow::Result<String> {
    let path = path
        .to_str()
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))?;
    Ok(shlex::try_quote(path)
        .with_context(|| format!("path can't be quoted: {path}"))?
        .into_owned())
}

#[cfg(test)]
mod test;
