//! [Transport] and [Dial] implementations based on the [openssh] crate.
//!
//! Connections go through an OpenSSH control master, so the user's SSH configuration and agent are
//! honored. Unknown host keys are added to `known_hosts` on first contact.

use super::{dial_with_retry, Dial, RemoteClient, Transport};
use crate::config::SshFlags;
use crate::topology::Node;
use ::openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use anyhow::Context;
use async_trait::async_trait;
use std::net::IpAddr;
use std::process::Output;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Production implementation of [Transport].
pub struct SshTransport {
    /// [None] once the connection has been closed.
    session: Option<Session>,
}

impl SshTransport {
    /// Opens a multiplexed session as `user` to `address`.
    pub async fn connect(user: &str, address: IpAddr) -> anyhow::Result<Self> {
        let mut builder = SessionBuilder::default();
        builder
            .user(user.to_owned())
            .known_hosts_check(KnownHosts::Add);
        let session = builder.connect_mux(address.to_string()).await?;
        Ok(SshTransport {
            session: Some(session),
        })
    }

    fn session(&self) -> anyhow::Result<&Session> {
        self.session.as_ref().context("connection is closed")
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> anyhow::Result<Output> {
        let mut command = self.session()?.raw_command(command);
        let Some(input) = stdin else {
            return Ok(command.output().await?);
        };

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .await?;
        let mut child_stdin = child.stdin().take().context("stdin was not piped")?;
        child_stdin.write_all(input).await?;
        // Dropping stdin sends EOF, which `install` needs to finish.
        child_stdin.shutdown().await?;
        drop(child_stdin);
        Ok(child.wait_with_output().await?)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if let Some(session) = self.session.take() {
            session.close().await?;
        }
        Ok(())
    }
}

/// Production implementation of [Dial].
#[derive(Clone, Debug)]
pub struct SshDialer {
    ssh: SshFlags,
}

impl SshDialer {
    pub fn new(ssh: SshFlags) -> Self {
        SshDialer { ssh }
    }
}

#[async_trait]
impl Dial for SshDialer {
    async fn dial(&self, node: &Node, dry_run: bool) -> anyhow::Result<RemoteClient> {
        let user = self.ssh.user_for(&node.name);
        let transport = dial_with_retry(node, || SshTransport::connect(user, node.address)).await?;
        info!(host = %node.name, %user, "Connected");
        Ok(RemoteClient::new(Box::new(transport), node, dry_run))
    }
}
