use crate::pipeline::{Context, OperateMachine};
use crate::remote::RemoteClient;
use crate::topology::Node;
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

const SERVICE_NAME: &str = "hyperkube";
const UNIT_PATH: &str = "/etc/systemd/system/hyperkube.service";
const UNIT_FILE_MODE: u32 = 0o644;
const KUBECTL_PATH: &str = "/usr/local/bin/kubectl";

const UNIT_TEMPLATE: &str = r#"[Unit]
Description=Kubernetes Hyperkube Installer
Requires=docker.service network-online.target
After=docker.service network-online.target

[Service]
Type=oneshot
ExecStartPre=/bin/mkdir -p /usr/local/bin
ExecStartPre=/bin/sh -c "test -f {{ hyperkube_path }} || /usr/bin/docker run --rm -v /usr/local/bin:/usr/local/bin {{ image }} cp /hyperkube {{ hyperkube_path }}"
ExecStart=/bin/sh -c "test -e {{ kubectl_path }} || ln -sf {{ hyperkube_path }} {{ kubectl_path }}"
Restart=no
RemainAfterExit=yes

[Install]
WantedBy=multi-user.target
"#;

#[derive(Debug, Serialize)]
struct Options {
    image: String,
    hyperkube_path: String,
    kubectl_path: &'static str,
}

/// Where the binary for `kubernetes_version` lives. The kubelet runs it from here.
pub fn binary_path(kubernetes_version: &str) -> String {
    format!("/usr/local/bin/hyperkube-{kubernetes_version}")
}

/// Copies the hyperkube binary out of its image onto every machine and links `kubectl` to it.
///
/// The copy is done by a oneshot systemd unit so that it survives reboots and is skipped once
/// the versioned binary exists.
#[derive(Clone, Copy, Debug, Default)]
pub struct HyperkubeService;

#[async_trait]
impl OperateMachine for HyperkubeService {
    async fn init_machine(
        &self,
        node: &Node,
        client: &RemoteClient,
        ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        let version = &ctx.flags.kubernetes.version;
        let options = Options {
            image: ctx.flags.images.hyperkube(node.architecture()?, version),
            hyperkube_path: binary_path(version),
            kubectl_path: KUBECTL_PATH,
        };

        info!(host = %node.name, image = %options.image, "Installing hyperkube");
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
        ctx: &Context<'_>,
    ) -> anyhow::Result<()> {
        client
            .run_best_effort(&format!("sudo systemctl stop {SERVICE_NAME}"))
            .await;
        client
            .run_best_effort(&format!("sudo systemctl disable {SERVICE_NAME}"))
            .await;
        client.remove_file(UNIT_PATH).await?;
        client.remove_file(KUBECTL_PATH).await?;
        client
            .remove_file(binary_path(&ctx.flags.kubernetes.version))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fixtures::FakeApi;
    use crate::config::Flags;
    use crate::pipeline::Dependencies;
    use crate::remote::fixtures::FakeMachine;
    use crate::topology::fixtures::node;
    use crate::topology::{Architecture, Topology};
    use std::sync::Arc;

    fn arm_node() -> Node {
        let mut node = node("w1", "10.0.0.4", false);
        node.architecture = Some(Architecture::Arm);
        node
    }

    #[tokio::test]
    async fn installs_the_image_for_the_node_architecture() {
        let node = arm_node();
        let topology = Topology::new(vec![node.clone()], None, None);
        let deps = Dependencies::for_reset(Arc::new(FakeApi::default()));
        let flags = Flags::default();
        let ctx = Context {
            topology: &topology,
            deps: &deps,
            flags: &flags,
        };
        let machine = FakeMachine::new("armv7l");

        HyperkubeService
            .init_machine(&node, &machine.client(&node, false), &ctx)
            .await
            .unwrap();

        let (unit, mode) = machine.file(UNIT_PATH).unwrap();
        let unit = String::from_utf8(unit).unwrap();
        assert_eq!(UNIT_FILE_MODE, mode);
        assert!(unit.contains("Type=oneshot"));
        assert!(unit.contains(
            "test -f /usr/local/bin/hyperkube-v1.10.1 || /usr/bin/docker run --rm \
             -v /usr/local/bin:/usr/local/bin gcr.io/google-containers/hyperkube-arm:v1.10.1 \
             cp /hyperkube /usr/local/bin/hyperkube-v1.10.1"
        ));
        assert!(unit.contains(
            "test -e /usr/local/bin/kubectl || ln -sf /usr/local/bin/hyperkube-v1.10.1 \
             /usr/local/bin/kubectl"
        ));
        assert!(unit.contains("RemainAfterExit=yes"));
        let commands = machine.commands();
        assert!(commands.contains(&"sudo systemctl enable hyperkube".to_owned()));
        assert!(commands.contains(&"sudo systemctl restart hyperkube".to_owned()));
    }

    #[tokio::test]
    async fn needs_a_detected_architecture() {
        let node = node("w1", "10.0.0.4", false);
        let topology = Topology::new(vec![node.clone()], None, None);
        let deps = Dependencies::for_reset(Arc::new(FakeApi::default()));
        let flags = Flags::default();
        let ctx = Context {
            topology: &topology,
            deps: &deps,
            flags: &flags,
        };
        let machine = FakeMachine::new("x86_64");

        let result = HyperkubeService
            .init_machine(&node, &machine.client(&node, false), &ctx)
            .await;

        assert!(result.is_err());
        assert!(machine.commands().is_empty());
    }

    #[tokio::test]
    async fn reset_removes_the_unit_and_both_binaries() {
        let node = arm_node();
        let topology = Topology::new(vec![node.clone()], None, None);
        let deps = Dependencies::for_reset(Arc::new(FakeApi::default()));
        let flags = Flags::default();
        let ctx = Context {
            topology: &topology,
            deps: &deps,
            flags: &flags,
        };
        let machine = FakeMachine::new("armv7l");
        machine.fail_command("systemctl stop");
        let client = machine.client(&node, false);
        HyperkubeService
            .init_machine(&node, &client, &ctx)
            .await
            .unwrap();
        machine.add_dir("/usr/local/bin");
        machine
            .state()
            .files
            .insert(KUBECTL_PATH.into(), (Vec::new(), 0o755));

        HyperkubeService
            .reset_machine(&node, &client, &ctx)
            .await
            .unwrap();

        assert!(machine.file(UNIT_PATH).is_none());
        assert!(machine.file(KUBECTL_PATH).is_none());
        assert!(machine
            .commands()
            .contains(&"sudo rm -f /usr/local/bin/hyperkube-v1.10.1".to_owned()));
    }
}
