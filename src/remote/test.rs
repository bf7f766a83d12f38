use super::fixtures::*;
use super::*;
use crate::topology::fixtures::node;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

fn machine_and_client() -> (FakeMachine, RemoteClient) {
    let machine = FakeMachine::new("x86_64");
    let client = machine.client(&node("m1", "10.0.0.1", true), false);
    (machine, client)
}

mod run {
    use super::*;

    #[tokio::test]
    async fn trims_one_trailing_newline() {
        let (_machine, client) = machine_and_client();
        assert_eq!("x86_64", client.run("uname -m", None, false).await.unwrap());
        assert_eq!("a b", client.run("echo a b", None, false).await.unwrap());
    }

    #[tokio::test]
    async fn dry_run_executes_nothing() {
        let machine = FakeMachine::new("x86_64");
        let client = machine.client(&node("m1", "10.0.0.1", true), true);

        assert_eq!("", client.run("uname -m", None, false).await.unwrap());
        client.update_file("/etc/x", b"x", 0o644).await.unwrap();

        assert!(machine.commands().is_empty());
        assert_eq!(None, machine.file("/etc/x"));
    }

    #[tokio::test]
    async fn failure_carries_stderr() {
        let (machine, client) = machine_and_client();
        machine.fail_command("systemctl restart");

        let error = client
            .run("sudo systemctl restart kubelet", None, true)
            .await
            .unwrap_err();

        match error.downcast_ref::<Error>() {
            Some(Error::RemoteExec {
                host,
                command,
                stderr,
            }) => {
                assert_eq!("m1", host);
                assert_eq!("sudo systemctl restart kubelet", command);
                assert_eq!("injected failure", stderr);
            }
            x => panic!("expected a remote exec error, got {x:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_is_a_remote_exec_error() {
        let (machine, client) = machine_and_client();
        machine.state().closed = true;

        let error = client.run("true", None, true).await.unwrap_err();

        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::RemoteExec { .. })
        ));
    }

    #[tokio::test]
    async fn best_effort_swallows_failures() {
        let (machine, client) = machine_and_client();
        machine.fail_command("systemctl stop");

        client.run_best_effort("sudo systemctl stop kubelet").await;

        assert_eq!(vec!["sudo systemctl stop kubelet"], machine.commands());
    }
}

mod update_file {
    use super::*;

    #[tokio::test]
    async fn read_back_returns_exactly_what_was_written() {
        let (machine, client) = machine_and_client();
        let content = b"line one\nline two\n\xff\x00binary";

        client
            .update_file("/etc/kubernetes/pki/ca.key", content, 0o600)
            .await
            .unwrap();

        assert_eq!(
            content.to_vec(),
            client.read_file("/etc/kubernetes/pki/ca.key").await.unwrap()
        );
        assert_eq!(
            Some((content.to_vec(), 0o600)),
            machine.file("/etc/kubernetes/pki/ca.key")
        );
    }

    #[tokio::test]
    async fn writes_a_key_with_its_final_mode_in_one_command() {
        let (machine, client) = machine_and_client();
        machine.add_dir("/etc/kubernetes/pki");

        client
            .update_file("/etc/kubernetes/pki/ca.key", b"secret", 0o600)
            .await
            .unwrap();

        let writes: Vec<_> = machine
            .commands()
            .into_iter()
            .filter(|c| c.contains("ca.key"))
            .collect();
        assert_eq!(
            vec!["sudo install -m 0600 /dev/stdin /etc/kubernetes/pki/ca.key"],
            writes
        );
        assert!(!writes[0].contains("chmod"));
        assert_eq!(
            Some((b"secret".to_vec(), 0o600)),
            machine.file("/etc/kubernetes/pki/ca.key")
        );
    }

    #[tokio::test]
    async fn creates_missing_parents() {
        let (machine, client) = machine_and_client();

        client
            .update_file("/etc/keepalived/keepalived.conf", b"conf", 0o644)
            .await
            .unwrap();

        assert!(machine.has_dir("/etc/keepalived"));
        assert_eq!(Some(0o755), machine.state().dirs.get(Path::new("/etc/keepalived")).copied());
    }

    #[tokio::test]
    async fn overwrites_and_reapplies_the_mode() {
        let (machine, client) = machine_and_client();

        client.update_file("/etc/x", b"old", 0o644).await.unwrap();
        client.update_file("/etc/x", b"new", 0o755).await.unwrap();

        assert_eq!(Some((b"new".to_vec(), 0o755)), machine.file("/etc/x"));
    }

    #[tokio::test]
    async fn quotes_awkward_paths() {
        let (machine, client) = machine_and_client();

        client
            .update_file("/srv/with space/it's.conf", b"x", 0o644)
            .await
            .unwrap();

        assert!(machine.file("/srv/with space/it's.conf").is_some());
    }
}

mod ensure_directory {
    use super::*;

    #[tokio::test]
    async fn creates_and_applies_the_mode() {
        let (machine, client) = machine_and_client();

        client.ensure_directory("/var/lib/etcd", 0o700).await.unwrap();
        client.ensure_directory("/var/lib/etcd", 0o700).await.unwrap();

        assert_eq!(Some(0o700), machine.state().dirs.get(Path::new("/var/lib/etcd")).copied());
        assert!(machine.has_dir("/var/lib"));
        assert_eq!(
            vec![
                "sudo mkdir -p /var/lib/etcd && sudo chmod 0700 /var/lib/etcd";
                2
            ],
            machine.commands()
        );
    }
}

mod directory_exists {
    use super::*;

    #[tokio::test]
    async fn reports_presence() {
        let (machine, client) = machine_and_client();
        machine.add_dir("/var/lib/etcd/member");

        assert!(client.directory_exists("/var/lib/etcd/member").await.unwrap());
        assert!(!client.directory_exists("/var/lib/etcd/other").await.unwrap());
    }
}

mod render {
    use super::*;

    #[tokio::test]
    async fn writes_the_expanded_template() {
        let (machine, client) = machine_and_client();
        let options = BTreeMap::from([("name", "m1")]);

        client
            .render("name={{ name }}\n", "/etc/test.conf", &options, 0o644)
            .await
            .unwrap();

        assert_eq!(Some("name=m1\n".to_owned()), machine.file_string("/etc/test.conf"));
    }

    #[tokio::test]
    async fn template_errors_send_nothing() {
        let (machine, client) = machine_and_client();
        let options = BTreeMap::from([("name", "m1")]);

        let error = client
            .render("{% if %}", "/etc/test.conf", &options, 0o644)
            .await
            .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Template(_))
        ));
        assert!(machine.commands().is_empty());
    }
}

mod remove {
    use super::*;

    #[tokio::test]
    async fn missing_targets_are_not_errors() {
        let (_machine, client) = machine_and_client();

        client.remove_file("/etc/missing").await.unwrap();
        client.remove_directory("/var/lib/missing").await.unwrap();
    }

    #[tokio::test]
    async fn removes_directories_recursively() {
        let (machine, client) = machine_and_client();
        client.update_file("/var/lib/etcd/member/db", b"x", 0o600).await.unwrap();
        client.update_file("/etc/kubelet", b"x", 0o644).await.unwrap();

        client.remove_directory("/var/lib/etcd").await.unwrap();
        client.remove_file("/etc/kubelet").await.unwrap();

        assert!(!machine.has_dir("/var/lib/etcd"));
        assert!(!machine.has_dir("/var/lib/etcd/member"));
        assert!(machine.has_dir("/var/lib"));
        assert_eq!(None, machine.file("/var/lib/etcd/member/db"));
        assert_eq!(None, machine.file("/etc/kubelet"));
    }
}

mod close {
    use super::*;

    #[tokio::test]
    async fn closes_the_transport() {
        let (machine, client) = machine_and_client();

        client.close().await.unwrap();

        assert!(machine.is_closed());
    }
}

mod dial_with_retry {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_the_machine_answers() {
        let node = node("m1", "10.0.0.1", true);
        let attempts = AtomicU32::new(0);

        let answer = dial_with_retry(&node, || async {
            match attempts.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => anyhow::bail!("handshake failed"),
                _ => Ok("connected"),
            }
        })
        .await
        .unwrap();

        assert_eq!("connected", answer);
        assert_eq!(3, attempts.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let node = node("m1", "10.0.0.1", true);
        let attempts = AtomicU32::new(0);

        let error = dial_with_retry(&node, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("handshake failed"))
        })
        .await
        .unwrap_err();

        assert_eq!(DIAL_ATTEMPTS, attempts.load(Ordering::SeqCst));
        match error.downcast_ref::<Error>() {
            Some(Error::Dial {
                host,
                address,
                attempts,
                reason,
            }) => {
                assert_eq!("m1", host);
                assert_eq!("10.0.0.1", address);
                assert_eq!(3, *attempts);
                assert_eq!("handshake failed", reason);
            }
            x => panic!("expected a dial error, got {x:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fake_dialer_retries_unreachable_machines() {
        let mut dialer = FakeDialer::default();
        dialer.add_machine("m1", FakeMachine::new("x86_64"));
        dialer.set_unreachable("m1");

        let result = dialer.dial(&node("m1", "10.0.0.1", true), false).await;

        assert!(result.is_err());
        assert_eq!(DIAL_ATTEMPTS, dialer.attempts("m1"));
    }
}
