//! In-memory engine used by lifecycle and build tests.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cmd::CmdError;
use crate::error::EngineError;

use super::{BuildRequest, ContainerEngine, ContainerRecord, ContainerState, LogFollow, RunSpec};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: RunSpec,
    pub state: ContainerState,
    pub image_id: String,
    /// Output of every run so far, stamped when written.
    pub log: Vec<(DateTime<Utc>, String)>,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, FakeContainer>,
    /// tag -> (image id, labels)
    images: HashMap<String, (String, BTreeMap<String, String>)>,
    builds: Vec<BuildRequest>,
    calls: Vec<String>,
    log_lines: Vec<String>,
    fail_on: Vec<String>,
    exit_after_start: bool,
    next_image: u32,
}

/// Records every call and models container state transitions in memory.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image tag with a given id.
    pub fn add_image(&self, tag: &str, id: &str) {
        self.with(|s| {
            s.images
                .insert(tag.to_string(), (id.to_string(), BTreeMap::new()));
        });
    }

    pub fn set_image_label(&self, tag: &str, key: &str, value: &str) {
        self.with(|s| {
            if let Some((_, labels)) = s.images.get_mut(tag) {
                labels.insert(key.to_string(), value.to_string());
            }
        });
    }

    /// Lines a container prints each time it is run or started from now on.
    pub fn set_log_lines(&self, lines: &[&str]) {
        self.with(|s| s.log_lines = lines.iter().map(|l| l.to_string()).collect());
    }

    /// Make every call whose log entry starts with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) {
        self.with(|s| s.fail_on.push(prefix.to_string()));
    }

    /// Containers exit immediately after run/start.
    pub fn exit_after_start(&self) {
        self.with(|s| s.exit_after_start = true);
    }

    /// Put a container directly into a state, bypassing run.
    pub fn insert_container(&self, name: &str, image: &str, state: ContainerState) {
        self.with(|s| {
            let image_id = s
                .images
                .get(image)
                .map(|(id, _)| id.clone())
                .unwrap_or_else(|| format!("sha256:{}", image));
            s.containers.insert(
                name.to_string(),
                FakeContainer {
                    spec: RunSpec {
                        name: name.to_string(),
                        image: image.to_string(),
                        ..Default::default()
                    },
                    state,
                    image_id,
                    log: Vec::new(),
                },
            );
        });
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.with(|s| s.containers.get(name).cloned())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    /// Number of recorded calls whose entry starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.with(|s| s.calls.iter().filter(|c| c.starts_with(prefix)).count())
    }

    pub fn builds(&self) -> Vec<BuildRequest> {
        self.with(|s| s.builds.clone())
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Log the call and apply failure injection.
    fn record(&self, entry: String) -> Result<(), EngineError> {
        self.with(|s| {
            let fail = s.fail_on.iter().any(|p| entry.starts_with(p.as_str()));
            s.calls.push(entry.clone());
            if fail {
                Err(EngineError::Command(CmdError::Failed {
                    command: entry,
                    status: "exit code 125".to_string(),
                    stderr: "injected failure".to_string(),
                }))
            } else {
                Ok(())
            }
        })
    }

    fn emit_run_output(s: &State) -> Vec<(DateTime<Utc>, String)> {
        let now = Utc::now();
        s.log_lines.iter().map(|l| (now, l.clone())).collect()
    }

    fn started_state(s: &State) -> ContainerState {
        if s.exit_after_start {
            ContainerState::Exited
        } else {
            ContainerState::Running
        }
    }
}

impl ContainerEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    fn build(&self, request: &BuildRequest) -> Result<(), EngineError> {
        self.record(format!("build {}", request.tag))?;
        self.with(|s| {
            s.next_image += 1;
            let id = format!("sha256:built{}", s.next_image);
            s.images
                .insert(request.tag.clone(), (id, request.labels.clone()));
            s.builds.push(request.clone());
        });
        Ok(())
    }

    fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        Ok(self.with(|s| s.images.contains_key(image)))
    }

    fn image_id(&self, image: &str) -> Result<Option<String>, EngineError> {
        Ok(self.with(|s| s.images.get(image).map(|(id, _)| id.clone())))
    }

    fn image_label(&self, image: &str, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.with(|s| {
            s.images
                .get(image)
                .and_then(|(_, labels)| labels.get(key).cloned())
        }))
    }

    fn run(&self, spec: &RunSpec) -> Result<(), EngineError> {
        self.record(format!("run {}", spec.name))?;
        self.with(|s| {
            if s.containers.contains_key(&spec.name) {
                return Err(EngineError::Command(CmdError::Failed {
                    command: format!("run {}", spec.name),
                    status: "exit code 125".to_string(),
                    stderr: format!("the container name \"{}\" is already in use", spec.name),
                }));
            }
            let image_id = s
                .images
                .get(&spec.image)
                .map(|(id, _)| id.clone())
                .unwrap_or_else(|| format!("sha256:{}", spec.image));
            let state = Self::started_state(s);
            let log = Self::emit_run_output(s);
            s.containers.insert(
                spec.name.clone(),
                FakeContainer {
                    spec: spec.clone(),
                    state,
                    image_id,
                    log,
                },
            );
            Ok(())
        })
    }

    fn start(&self, name: &str) -> Result<(), EngineError> {
        self.record(format!("start {}", name))?;
        self.with(|s| {
            let state = Self::started_state(s);
            let output = Self::emit_run_output(s);
            match s.containers.get_mut(name) {
                Some(c) => {
                    c.state = state;
                    c.log.extend(output);
                    Ok(())
                }
                None => Err(EngineError::Command(CmdError::Failed {
                    command: format!("start {}", name),
                    status: "exit code 125".to_string(),
                    stderr: format!("no such container {}", name),
                })),
            }
        })
    }

    fn stop(&self, name: &str, timeout: Duration) -> Result<(), EngineError> {
        self.record(format!("stop {} {}", name, timeout.as_secs()))?;
        self.with(|s| {
            if let Some(c) = s.containers.get_mut(name) {
                c.state = ContainerState::Exited;
            }
        });
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), EngineError> {
        self.record(format!("remove {}", name))?;
        self.with(|s| s.containers.remove(name));
        Ok(())
    }

    fn inspect(&self, name: &str) -> Result<Option<ContainerRecord>, EngineError> {
        Ok(self.with(|s| {
            s.containers.get(name).map(|c| ContainerRecord {
                name: name.to_string(),
                state: c.state.clone(),
                image_id: Some(c.image_id.clone()),
                exit_code: None,
            })
        }))
    }

    fn list(&self, prefix: &str) -> Result<Vec<ContainerRecord>, EngineError> {
        self.record(format!("list {}", prefix))?;
        Ok(self.with(|s| {
            s.containers
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(name, c)| ContainerRecord {
                    name: name.clone(),
                    state: c.state.clone(),
                    image_id: Some(c.image_id.clone()),
                    exit_code: None,
                })
                .collect()
        }))
    }

    fn exec(&self, name: &str, command: &[String]) -> Result<String, EngineError> {
        self.record(format!("exec {} {}", name, command.join(" ")))?;
        Ok(String::new())
    }

    fn follow_logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<LogFollow, EngineError> {
        self.record(format!("logs {}", name))?;
        let text = self.with(|s| {
            let lines: Vec<&str> = s
                .containers
                .get(name)
                .map(|c| {
                    c.log
                        .iter()
                        .filter(|(at, _)| since.is_none_or(|since| *at >= since))
                        .map(|(_, line)| line.as_str())
                        .collect()
                })
                .unwrap_or_default();
            let mut text = lines.join("\n");
            if !text.is_empty() {
                text.push('\n');
            }
            text
        });
        Ok(LogFollow::new(vec![Box::new(Cursor::new(text.into_bytes()))], None))
    }
}
