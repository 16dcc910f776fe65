//! In-memory `ContainerRuntime` for tests.
//!
//! Units are scripted per image with a [`Behavior`]. Output is encoded in
//! Docker's raw framing and decoded back through [`demux::frames`], so the
//! same wire path as a hijacked attach connection is exercised. Every call
//! is recorded for assertions on ordering and cleanup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

use super::client::{Attached, ContainerRuntime, ContainerSpec, Inspection};
use crate::demux::{self, Frame, StreamKind};
use crate::error::RuntimeError;

/// Exit code the engine reports for SIGKILL.
const KILLED_EXIT_CODE: i64 = 137;

/// How a unit of a given image behaves once started.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Frames written after start, in order.
    pub output: Vec<Frame>,
    /// Write everything read from stdin back as one stdout frame first.
    pub echo_stdin: bool,
    pub exit_code: i64,
    /// Exit as if OOM-killed.
    pub oom_killed: bool,
    /// Never exit on its own.
    pub hang: bool,
    /// Delay before the program exits.
    pub run_time: Option<Duration>,
    /// `create` registers the unit but never answers.
    pub create_hangs: bool,
    /// Operation that fails with an injected API error.
    pub fail_on: Option<&'static str>,
    /// Number of `remove` calls answered with a conflict before succeeding.
    pub remove_conflicts: usize,
}

impl Behavior {
    pub fn prints(stdout: &'static [u8]) -> Self {
        Self {
            output: vec![Frame::new(StreamKind::Stdout, stdout)],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Created,
    Running,
    Exited,
}

struct FakeUnit {
    spec: ContainerSpec,
    behavior: Behavior,
    status: Status,
    oom_killed: bool,
    remove_conflicts: usize,
    /// Engine side of the attached output channel.
    output: Option<DuplexStream>,
    /// Engine side of the attached stdin channel.
    stdin: Option<DuplexStream>,
    exit: watch::Sender<Option<i64>>,
}

#[derive(Default)]
struct State {
    units: HashMap<String, FakeUnit>,
    calls: Vec<(String, String)>,
    stdin_seen: HashMap<String, Vec<u8>>,
    created: Vec<ContainerSpec>,
}

#[derive(Clone, Default)]
pub struct FakeRuntime {
    behaviors: HashMap<String, Behavior>,
    state: Arc<Mutex<State>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, image: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(image.to_string(), behavior);
        self
    }

    /// `(operation, unit name)` for every call, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Operations issued against `name`, in order.
    pub fn calls_for(&self, name: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(_, n)| n == name)
            .map(|(op, _)| op)
            .collect()
    }

    /// Specs of every unit ever created.
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().created.clone()
    }

    /// Names of units that still exist.
    pub fn live_units(&self) -> Vec<String> {
        self.state.lock().unwrap().units.keys().cloned().collect()
    }

    /// Bytes the program of `name` received on stdin.
    pub fn stdin_seen(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().stdin_seen.get(name).cloned()
    }

    fn record(&self, op: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push((op.to_string(), name.to_string()));
    }

    fn injected(&self, op: &'static str, name: &str) -> Result<(), RuntimeError> {
        let state = self.state.lock().unwrap();
        let failing = state
            .units
            .get(name)
            .and_then(|u| u.behavior.fail_on)
            .is_some_and(|f| f == op);
        if failing {
            return Err(RuntimeError::api(op, "injected failure"));
        }
        Ok(())
    }

    /// Marks a unit exited and closes its output, as the engine does when
    /// the main process ends.
    fn finish(state: &Arc<Mutex<State>>, name: &str, code: i64, oom_killed: bool) {
        let mut state = state.lock().unwrap();
        if let Some(unit) = state.units.get_mut(name) {
            if unit.status == Status::Exited {
                return;
            }
            unit.status = Status::Exited;
            unit.oom_killed = oom_killed;
            unit.output = None;
            unit.stdin = None;
            unit.exit.send_replace(Some(code));
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record("create", &spec.name);
        let behavior = self.behaviors.get(&spec.image).cloned().unwrap_or_default();
        if behavior.fail_on == Some("create") {
            return Err(RuntimeError::api("create", "injected failure"));
        }
        let hangs = behavior.create_hangs;
        {
            let mut state = self.state.lock().unwrap();
            let (exit, _) = watch::channel(None);
            state.created.push(spec.clone());
            state.units.insert(
                spec.name.clone(),
                FakeUnit {
                    spec: spec.clone(),
                    remove_conflicts: behavior.remove_conflicts,
                    behavior,
                    status: Status::Created,
                    oom_killed: false,
                    output: None,
                    stdin: None,
                    exit,
                },
            );
        }
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(format!("id-{}", spec.name))
    }

    async fn attach(&self, name: &str) -> Result<Attached, RuntimeError> {
        self.record("attach", name);
        self.injected("attach", name)?;
        let (engine_out, client_out) = tokio::io::duplex(64 * 1024);
        let (client_in, engine_in) = tokio::io::duplex(64 * 1024);
        {
            let mut state = self.state.lock().unwrap();
            let unit = state
                .units
                .get_mut(name)
                .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
            unit.output = Some(engine_out);
            unit.stdin = Some(engine_in);
        }
        Ok(Attached {
            output: demux::frames(client_out),
            input: Box::pin(client_in),
        })
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("start", name);
        self.injected("start", name)?;
        let (behavior, output, stdin) = {
            let mut state = self.state.lock().unwrap();
            let unit = state
                .units
                .get_mut(name)
                .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
            unit.status = Status::Running;
            if unit.behavior.hang {
                // Keep both channels open until kill/remove
                return Ok(());
            }
            (unit.behavior.clone(), unit.output.take(), unit.stdin.take())
        };

        let state = Arc::clone(&self.state);
        let name = name.to_string();
        tokio::spawn(async move {
            let mut received = Vec::new();
            if let Some(mut stdin) = stdin {
                let _ = stdin.read_to_end(&mut received).await;
            }
            if let Some(mut output) = output {
                if behavior.echo_stdin && !received.is_empty() {
                    let frame = Frame::new(StreamKind::Stdout, received.clone());
                    let _ = output.write_all(&frame.encode()).await;
                }
                for frame in &behavior.output {
                    let _ = output.write_all(&frame.encode()).await;
                }
                let _ = output.shutdown().await;
            }
            state.lock().unwrap().stdin_seen.insert(name.clone(), received);
            if let Some(run_time) = behavior.run_time {
                tokio::time::sleep(run_time).await;
            }
            let code = if behavior.oom_killed {
                KILLED_EXIT_CODE
            } else {
                behavior.exit_code
            };
            FakeRuntime::finish(&state, &name, code, behavior.oom_killed);
        });
        Ok(())
    }

    async fn wait(&self, name: &str) -> Result<i64, RuntimeError> {
        self.record("wait", name);
        self.injected("wait", name)?;
        let mut exit = {
            let state = self.state.lock().unwrap();
            let unit = state
                .units
                .get(name)
                .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
            unit.exit.subscribe()
        };
        let code = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RuntimeError::NotFound(name.to_string()))?;
        Ok(code.unwrap_or_default())
    }

    async fn inspect(&self, name: &str) -> Result<Inspection, RuntimeError> {
        self.record("inspect", name);
        self.injected("inspect", name)?;
        let state = self.state.lock().unwrap();
        let unit = state
            .units
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        let inspection = Inspection {
            exit_code: *unit.exit.borrow(),
            oom_killed: unit.oom_killed,
        };
        Ok(inspection)
    }

    async fn kill(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("kill", name);
        let status = {
            let state = self.state.lock().unwrap();
            state
                .units
                .get(name)
                .map(|u| u.status)
                .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?
        };
        if status != Status::Running {
            return Err(RuntimeError::Conflict {
                name: name.to_string(),
                message: "container is not running".to_string(),
            });
        }
        FakeRuntime::finish(&self.state, name, KILLED_EXIT_CODE, false);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("remove", name);
        let mut state = self.state.lock().unwrap();
        let unit = state
            .units
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        if unit.remove_conflicts > 0 {
            unit.remove_conflicts -= 1;
            return Err(RuntimeError::Conflict {
                name: name.to_string(),
                message: "removal of container is already in progress".to_string(),
            });
        }
        if unit.behavior.fail_on == Some("remove") {
            return Err(RuntimeError::api("remove", "injected failure"));
        }
        state.units.remove(name);
        Ok(())
    }

    async fn list(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        let (key, value) = match label.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (label, None),
        };
        let state = self.state.lock().unwrap();
        Ok(state
            .units
            .values()
            .filter(|u| match (u.spec.labels.get(key), value) {
                (Some(actual), Some(wanted)) => actual == wanted,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .map(|u| u.spec.name.clone())
            .collect())
    }
}
