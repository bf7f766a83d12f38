use crate::pipeline::{Context, OperateMachine};
use crate::remote::RemoteClient;
use crate::topology::Node;
use anyhow::Context as _;
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

const CONF_PATH: &str = "/etc/keepalived/keepalived.conf";
const CHECK_SCRIPT_PATH: &str = "/etc/keepalived/check_apiserver.sh";
const RESTART: &str = "sudo systemctl restart keepalived.service";

const CONF_FILE_MODE: u32 = 0o644;
const SCRIPT_FILE_MODE: u32 = 0o755;

const INTERFACE: &str = "eth0";
const AUTH_PASSWORD: &str = "helix";

const CONF_TEMPLATE: &str = r#"! Configuration File for keepalived
global_defs {
  router_id LVS_DEVEL
}

vrrp_script check_apiserver {
  script "{{ check_script }}"
  interval 3
  weight -2
  fall 10
  rise 2
}

vrrp_instance VI_1 {
  state {{ state }}
  interface {{ interface }}
  virtual_router_id 51
  priority {{ priority }}
  authentication {
      auth_type PASS
      auth_pass {{ auth_password }}
  }
  virtual_ipaddress {
    {{ virtual_ip }}
  }
  track_script {
      check_apiserver
  }
}
"#;

const CHECK_SCRIPT_TEMPLATE: &str = r#"#!/bin/sh

errorExit() {
  echo "*** $*" 1>&2
  exit 1
}

curl --silent --max-time 2 --insecure https://localhost:{{ port }}/ -o /dev/null || errorExit "Error GET https://localhost:{{ port }}/"
if ip addr | grep -q {{ virtual_ip }}; then
  curl --silent --max-time 2 --insecure https://{{ virtual_ip }}:{{ port }}/ -o /dev/null || errorExit "Error GET https://{{ virtual_ip }}:{{ port }}/"
fi
"#;

#[derive(Debug, Serialize)]
struct Options {
    virtual_ip: String,
    state: &'static str,
    interface: &'static str,
    priority: usize,
    auth_password: &'static str,
    check_script: &'static str,
    port: u16,
}

/// Floats the API server's virtual IP between control-plane machines.
///
/// Only runs when a virtual IP is configured. The first control-plane node starts as `MASTER`,
/// the rest as `BACKUP` with decreasing priority.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeepalivedService;

impl KeepalivedService {
    fn options(node: &Node, ctx: &Context<'_>) -> anyhow::Result<Option<Options>> {
        let Some(virtual_ip) = ctx.topology.api_server_virtual_ip() else {
            return Ok(None);
        };
        if !node.is_control_plane {
            return Ok(None);
        }
        let index = ctx
            .topology
            .control_plane_index(node)
            .with_context(|| format!("{} is not a control-plane member", node.name))?;
        Ok(Some(Options {
            virtual_ip: virtual_ip.to_string(),
            state: if index == 0 { "MASTER" } else { "BACKUP" },
            interface: INTERFACE,
            priority: 100usize.saturating_sub(index),
            auth_password: AUTH_PASSWORD,
            check_script: CHECK_SCRIPT_PATH,
            port: ctx.flags.kubernetes.api_server_port,
        }))
    }
}

#[async_trait]
impl OperateMachine for KeepalivedService {
    async fn init_machine(
        &self,
        node: &Node,
        client: &RemoteClient,
        ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        let Some(options) = Self::options(node, ctx)? else {
            return Ok(());
        };
        info!(
            host = %node.name,
            state = options.state,
            priority = options.priority,
            "Configuring keepalived"
        );
        client
            .render(CONF_TEMPLATE, CONF_PATH, &options, CONF_FILE_MODE)
            .await?;
        client
            .render(
                CHECK_SCRIPT_TEMPLATE,
                CHECK_SCRIPT_PATH,
                &options,
                SCRIPT_FILE_MODE,
            )
            .await?;
        client.run_best_effort(RESTART).await;
        Ok(())
    }

    async fn reset_machine(
        &self,
        node: &Node,
        client: &RemoteClient,
        ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        if Self::options(node, ctx)?.is_none() {
            return Ok(());
        }
        client.remove_file(CONF_PATH).await?;
        client.remove_file(CHECK_SCRIPT_PATH).await?;
        client.run_best_effort(RESTART).await;
        Ok(())
    }
}
