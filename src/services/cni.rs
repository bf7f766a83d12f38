use crate::pipeline::{Context, OperateMachine};
use crate::remote::RemoteClient;
use crate::topology::{Architecture, Node};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

const SERVICE_NAME: &str = "cni-installer";
const UNIT_PATH: &str = "/etc/systemd/system/cni-installer.service";
const UNIT_FILE_MODE: u32 = 0o644;

const PLUGINS_VERSION: &str = "v0.7.0";
const PLUGINS_ARCHIVE: &str = "/opt/cni-plugins-v0.7.0.tgz";

/// Where the network plugins are unpacked. The kubelet looks for them here.
pub const BIN_DIR: &str = "/opt/cni/bin";

const UNIT_TEMPLATE: &str = r#"[Unit]
Description=CNI Installer
Requires=docker.service network-online.target
After=docker.service network-online.target

[Service]
Type=oneshot
ExecStartPre=/bin/mkdir -p {{ bin_dir }}
ExecStartPre=/bin/sh -c "test -f {{ archive }} || wget -O {{ archive }} {{ url }}"
ExecStart=/bin/sh -c "test -e {{ bin_dir }}/loopback || tar -xvf {{ archive }} -C {{ bin_dir }}/"
Restart=no
RemainAfterExit=yes

[Install]
WantedBy=multi-user.target
"#;

#[derive(Debug, Serialize)]
struct Options {
    archive: &'static str,
    url: String,
    bin_dir: &'static str,
}

fn plugins_url(architecture: Architecture) -> String {
    format!(
        "https://github.com/containernetworking/plugins/releases/download/\
         {PLUGINS_VERSION}/cni-plugins-{architecture}-{PLUGINS_VERSION}.tgz"
    )
}

/// Downloads and unpacks the standard CNI plugins on every machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct CniService;

#[async_trait]
impl OperateMachine for CniService {
    async fn init_machine(
        &self,
        node: &Node,
        client: &RemoteClient,
        _ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        let options = Options {
            archive: PLUGINS_ARCHIVE,
            url: plugins_url(node.architecture()?),
            bin_dir: BIN_DIR,
        };

        info!(host = %node.name, "Installing CNI plugins");
        client
            .render(UNIT_TEMPLATE, UNIT_PATH, &options, UNIT_FILE_MODE)
            .await?;
        client.run("sudo systemctl daemon-reload", None, false).await?;
        client
            .run(&format!("sudo systemctl enable {SERVICE_NAME}"), None, false)
            .await?;
        client
            .run(&format!("sudo systemctl restart {SERVICE_NAME}"), None, false)
            .await?;
        Ok(())
    }

    async fn reset_machine(
        &self,
        _node: &Node,
        client: &RemoteClient,
        _ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        client
            .run_best_effort(&format!("sudo systemctl stop {SERVICE_NAME}"))
            .await;
        client
            .run_best_effort(&format!("sudo systemctl disable {SERVICE_NAME}"))
            .await;
        client.remove_file(UNIT_PATH).await?;
        client.remove_directory(BIN_DIR).await
    }
}
