//! In-memory stand-ins for machines, for tests throughout the crate.
//!
//! [FakeMachine] understands just enough shell to serve [RemoteClient]: `&&`/`||` chains, `sudo`,
//! output redirection to `/dev/null`, and a handful of coreutils.

use super::*;
use std::collections::{BTreeMap, HashSet};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MachineState {
    // Path -> (content, mode).
    pub files: BTreeMap<PathBuf, (Vec<u8>, u32)>,

    // Path -> mode.
    pub dirs: BTreeMap<PathBuf, u32>,

    // Every command received, in order.
    pub commands: Vec<String>,

    // What `uname -m` prints.
    pub uname: String,

    // Commands containing any of these strings exit with status 1.
    pub failing: Vec<String>,

    pub closed: bool,
}

/// A machine whose file system and command log live in memory.
#[derive(Clone, Debug, Default)]
pub struct FakeMachine {
    state: Arc<Mutex<MachineState>>,
}

impl FakeMachine {
    pub fn new(uname: &str) -> Self {
        let machine = FakeMachine::default();
        machine.state().uname = uname.to_owned();
        machine
    }

    pub fn state(&self) -> MutexGuard<'_, MachineState> {
        self.state.lock().unwrap()
    }

    // Opens a new connection; a machine closed by an earlier run accepts commands again.
    pub fn transport(&self) -> Box<dyn Transport> {
        self.state().closed = false;
        Box::new(FakeTransport {
            state: self.state.clone(),
        })
    }

    pub fn client(&self, node: &Node, dry_run: bool) -> RemoteClient {
        RemoteClient::new(self.transport(), node, dry_run)
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<(Vec<u8>, u32)> {
        self.state().files.get(path.as_ref()).cloned()
    }

    pub fn file_string(&self, path: impl AsRef<Path>) -> Option<String> {
        self.file(path)
            .map(|(content, _)| String::from_utf8(content).unwrap())
    }

    pub fn has_dir(&self, path: impl AsRef<Path>) -> bool {
        self.state().dirs.contains_key(path.as_ref())
    }

    pub fn add_dir(&self, path: impl AsRef<Path>) {
        make_dirs(&mut self.state(), path.as_ref());
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn fail_command(&self, pattern: impl Into<String>) {
        self.state().failing.push(pattern.into());
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

struct FakeTransport {
    state: Arc<Mutex<MachineState>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> anyhow::Result<Output> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            anyhow::bail!("connection is closed");
        }
        state.commands.push(command.to_owned());
        if state.failing.iter().any(|pattern| command.contains(pattern)) {
            return Ok(output(1, Vec::new(), b"injected failure".to_vec()));
        }

        let tokens = shlex::split(command).unwrap();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut code = 0;
        let mut operator: Option<&str> = None;
        for segment in tokens.split_inclusive(|t| t == "&&" || t == "||") {
            let (words, next) = match segment.last().map(String::as_str) {
                Some(op @ ("&&" | "||")) => (&segment[..segment.len() - 1], Some(op)),
                _ => (segment, None),
            };
            let skip = match operator {
                Some("&&") => code != 0,
                Some("||") => code == 0,
                _ => false,
            };
            if !skip {
                code = run_one(&mut state, words, stdin, &mut stdout, &mut stderr);
            }
            operator = next;
        }
        Ok(output(code, stdout, stderr))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

fn output(code: i32, stdout: Vec<u8>, stderr: Vec<u8>) -> Output {
    Output {
        // The raw value is a wait status; the exit code lives in the second byte.
        status: ExitStatus::from_raw(code << 8),
        stdout,
        stderr,
    }
}

fn make_dirs(state: &mut MachineState, path: &Path) {
    for ancestor in path.ancestors().filter(|a| !a.as_os_str().is_empty()) {
        state.dirs.entry(ancestor.to_owned()).or_insert(0o755);
    }
}

// Runs a single simple command and returns its exit code.
fn run_one(
    state: &mut MachineState,
    words: &[String],
    stdin: Option<&[u8]>,
    stdout: &mut Vec<u8>,
    stderr: &mut Vec<u8>,
) -> i32 {
    let mut words: Vec<&str> = words.iter().map(String::as_str).collect();
    if words.first() == Some(&"sudo") {
        words.remove(0);
    }
    if let Some(i) = words.iter().position(|w| *w == ">") {
        words.drain(i..(i + 2).min(words.len()));
    }

    let mut fail = |message: String| {
        stderr.extend_from_slice(message.as_bytes());
        1
    };

    match words.as_slice() {
        ["true"] | ["systemctl", ..] => 0,
        ["mkdir", "-p", path] => {
            make_dirs(state, Path::new(path));
            0
        }
        ["chmod", mode, path] => {
            let mode = u32::from_str_radix(mode, 8).unwrap();
            let path = Path::new(path);
            if let Some((_, file_mode)) = state.files.get_mut(path) {
                *file_mode = mode;
                0
            } else if let Some(dir_mode) = state.dirs.get_mut(path) {
                *dir_mode = mode;
                0
            } else {
                fail(format!("chmod: cannot access '{}'", path.display()))
            }
        }
        ["install", "-m", mode, "/dev/stdin", path] => {
            let mode = u32::from_str_radix(mode, 8).unwrap();
            let path = Path::new(path);
            match path.parent() {
                Some(parent) if state.dirs.contains_key(parent) => {
                    let content = stdin.unwrap_or_default().to_vec();
                    state.files.insert(path.to_owned(), (content, mode));
                    0
                }
                _ => fail(format!(
                    "install: cannot create regular file '{}': No such file or directory",
                    path.display()
                )),
            }
        }
        ["cat", path] => match state.files.get(Path::new(path)) {
            Some((content, _)) => {
                stdout.extend_from_slice(content);
                0
            }
            None => fail(format!("cat: {path}: No such file or directory")),
        },
        ["rm", "-f", path] => {
            state.files.remove(Path::new(path));
            0
        }
        ["rm", "-rf", path] => {
            let path = Path::new(path);
            state.files.retain(|p, _| !p.starts_with(path));
            state.dirs.retain(|p, _| !p.starts_with(path));
            0
        }
        ["test", "-d", path] => i32::from(!state.dirs.contains_key(Path::new(path))),
        ["test", "-f", path] => i32::from(!state.files.contains_key(Path::new(path))),
        ["echo", rest @ ..] => {
            stdout.extend_from_slice(rest.join(" ").as_bytes());
            stdout.push(b'\n');
            0
        }
        ["uname", "-m"] => {
            stdout.extend_from_slice(state.uname.as_bytes());
            stdout.push(b'\n');
            0
        }
        other => fail(format!("{}: command not found", other.join(" "))),
    }
}

/// A [Dial] implementation handing out clients to [FakeMachine]s, keyed by node name.
#[derive(Debug, Default)]
pub struct FakeDialer {
    machines: BTreeMap<String, FakeMachine>,
    unreachable: HashSet<String>,
    attempts: Mutex<BTreeMap<String, u32>>,
}

impl FakeDialer {
    pub fn add_machine(&mut self, node_name: impl Into<String>, machine: FakeMachine) {
        self.machines.insert(node_name.into(), machine);
    }

    pub fn machine(&self, node_name: &str) -> &FakeMachine {
        &self.machines[node_name]
    }

    pub fn set_unreachable(&mut self, node_name: impl Into<String>) {
        self.unreachable.insert(node_name.into());
    }

    pub fn attempts(&self, node_name: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(node_name)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Dial for FakeDialer {
    async fn dial(&self, node: &Node, dry_run: bool) -> anyhow::Result<RemoteClient> {
        let transport = dial_with_retry(node, || async {
            *self
                .attempts
                .lock()
                .unwrap()
                .entry(node.name.clone())
                .or_default() += 1;
            if self.unreachable.contains(&node.name) {
                anyhow::bail!("connection refused");
            }
            match self.machines.get(&node.name) {
                Some(machine) => Ok(machine.transport()),
                None => anyhow::bail!("no such machine"),
            }
        })
        .await?;
        Ok(RemoteClient::new(transport, node, dry_run))
    }
}
