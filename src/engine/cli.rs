//! Docker/Podman engine driven through the runtime's command line.

use std::process::{Command, Stdio};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info};

use crate::cmd::{Cmd, CmdError};
use crate::error::EngineError;

use super::{
    BuildRequest, ContainerEngine, ContainerRecord, ContainerState, LogFollow, Runtime, RunSpec,
};

/// Inspect format shared by podman and docker: state, image id, exit code.
const INSPECT_FORMAT: &str = "{{.State.Status}}\t{{.Image}}\t{{.State.ExitCode}}";

pub struct CliEngine {
    runtime: Runtime,
}

impl CliEngine {
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    /// Check that the runtime binary is on PATH.
    pub fn is_available(&self) -> bool {
        which::which(self.runtime.binary()).is_ok()
    }

    fn cmd(&self) -> Cmd<'static> {
        Cmd::new(self.runtime.binary())
    }

    /// User namespace flags so files written to bind mounts stay owned by the
    /// invoking user.
    fn userns_args(&self) -> Vec<String> {
        match self.runtime {
            Runtime::Podman => {
                // Rootless podman maps the container's uid 1000 back to us.
                if unsafe { libc::geteuid() } == 0 {
                    Vec::new()
                } else {
                    vec!["--userns=keep-id:uid=1000,gid=1000".to_string()]
                }
            }
            Runtime::Docker => Vec::new(),
        }
    }

    fn gpu_args(&self) -> Vec<String> {
        let device = match self.runtime {
            Runtime::Podman => vec!["--device".to_string(), "nvidia.com/gpu=all".to_string()],
            Runtime::Docker => vec!["--gpus".to_string(), "all".to_string()],
        };
        let mut args = device;
        args.extend([
            "-e".to_string(),
            "NVIDIA_VISIBLE_DEVICES=all".to_string(),
            "-e".to_string(),
            "NVIDIA_DRIVER_CAPABILITIES=all".to_string(),
        ]);
        args
    }

    /// Assemble `run -d ...` arguments for a spec.
    pub(crate) fn run_args(&self, spec: &RunSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        args.extend(self.userns_args());
        if spec.gpu {
            args.extend(self.gpu_args());
        }
        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(format!("127.0.0.1:{}:{}", port.host_port, port.container_port));
        }
        for mount in &spec.mounts {
            args.push("-v".to_string());
            args.push(mount.volume_arg());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("--name".to_string());
        args.push(spec.name.clone());
        if let Some(workdir) = &spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    pub(crate) fn build_args(&self, request: &BuildRequest) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "-f".to_string(),
            request.dockerfile.display().to_string(),
        ];
        for (key, value) in &request.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &request.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("-t".to_string());
        args.push(request.tag.clone());
        if request.no_cache {
            args.push("--no-cache".to_string());
        }
        if request.pull_always {
            args.push("--pull=always".to_string());
        }
        args.push(request.context.display().to_string());
        args
    }
}

fn is_missing(err: &CmdError) -> bool {
    err.stderr().is_some_and(|stderr| {
        let lower = stderr.to_ascii_lowercase();
        lower.contains("no such") || lower.contains("not known") || lower.contains("not found")
    })
}

fn parse_inspect_line(name: &str, line: &str) -> Result<ContainerRecord, EngineError> {
    let mut fields = line.split('\t');
    let state = fields
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::Parse(format!("empty inspect output for {}", name)))?;
    let image_id = fields
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let exit_code = fields.next().and_then(|s| s.trim().parse::<i32>().ok());
    Ok(ContainerRecord {
        name: name.to_string(),
        state: ContainerState::parse(state),
        image_id,
        exit_code,
    })
}

impl ContainerEngine for CliEngine {
    fn name(&self) -> &str {
        self.runtime.binary()
    }

    fn build(&self, request: &BuildRequest) -> Result<(), EngineError> {
        let args = self.build_args(request);
        info!(tag = %request.tag, "engine:build start");

        // Builds stream their output to the terminal; only the exit status matters here.
        let status = Command::new(self.runtime.binary())
            .args(&args)
            .status()
            .map_err(|source| CmdError::Spawn {
                command: format!("{} {}", self.runtime.binary(), args.join(" ")),
                source,
            })?;

        if !status.success() {
            return Err(CmdError::Failed {
                command: format!("{} {}", self.runtime.binary(), args.join(" ")),
                status: format!("exit code {}", status.code().unwrap_or(-1)),
                stderr: String::new(),
            }
            .into());
        }
        info!(tag = %request.tag, "engine:build done");
        Ok(())
    }

    fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        Ok(self
            .cmd()
            .args(["image", "inspect", "--format", "{{.Id}}", image])
            .run_as_check()?)
    }

    fn image_id(&self, image: &str) -> Result<Option<String>, EngineError> {
        match self
            .cmd()
            .args(["image", "inspect", "--format", "{{.Id}}", image])
            .run_and_capture_stdout()
        {
            Ok(id) if id.is_empty() => Ok(None),
            Ok(id) => Ok(Some(id)),
            Err(err) if is_missing(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn image_label(&self, image: &str, key: &str) -> Result<Option<String>, EngineError> {
        let format = format!("{{{{index .Config.Labels \"{}\"}}}}", key);
        match self
            .cmd()
            .args(["image", "inspect", "--format", &format, image])
            .run_and_capture_stdout()
        {
            Ok(value) if value.is_empty() || value == "<no value>" => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(err) if is_missing(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn run(&self, spec: &RunSpec) -> Result<(), EngineError> {
        let args = self.run_args(spec);
        info!(name = %spec.name, image = %spec.image, "engine:run");
        self.cmd().args(&args).run()?;
        Ok(())
    }

    fn start(&self, name: &str) -> Result<(), EngineError> {
        info!(name, "engine:start");
        self.cmd().args(["start", name]).run()?;
        Ok(())
    }

    fn stop(&self, name: &str, timeout: Duration) -> Result<(), EngineError> {
        info!(name, timeout_secs = timeout.as_secs(), "engine:stop");
        self.cmd()
            .args(["stop", "-t", &timeout.as_secs().to_string(), name])
            .run()?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), EngineError> {
        info!(name, "engine:remove");
        self.cmd().args(["rm", "-f", name]).run()?;
        Ok(())
    }

    fn inspect(&self, name: &str) -> Result<Option<ContainerRecord>, EngineError> {
        match self
            .cmd()
            .args(["container", "inspect", "--format", INSPECT_FORMAT, name])
            .run_and_capture_stdout()
        {
            Ok(out) => {
                let line = out.lines().next().unwrap_or_default();
                parse_inspect_line(name, line).map(Some)
            }
            Err(err) if is_missing(&err) => {
                debug!(name, "engine:inspect missing");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<ContainerRecord>, EngineError> {
        let filter = format!("name=^{}", prefix);
        let out = self
            .cmd()
            .args([
                "ps",
                "-a",
                "--filter",
                &filter,
                "--format",
                "{{.Names}}\t{{.State}}",
            ])
            .run_and_capture_stdout()?;

        Ok(out
            .lines()
            .filter_map(|line| {
                let (name, state) = line.split_once('\t')?;
                // Docker reports multiple names comma separated; podman one per row.
                let name = name.split(',').next()?.trim();
                name.starts_with(prefix).then(|| ContainerRecord {
                    name: name.to_string(),
                    state: ContainerState::parse(state),
                    image_id: None,
                    exit_code: None,
                })
            })
            .collect())
    }

    fn exec(&self, name: &str, command: &[String]) -> Result<String, EngineError> {
        Ok(self
            .cmd()
            .args(["exec", name])
            .args(command)
            .run_and_capture_stdout()?)
    }

    fn follow_logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<LogFollow, EngineError> {
        let args = logs_args(name, since);
        debug!(name, args = ?args, "engine:follow_logs");
        let mut child = Command::new(self.runtime.binary())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CmdError::Spawn {
                command: format!("{} {}", self.runtime.binary(), args.join(" ")),
                source,
            })?;

        // The container's stdout and stderr arrive on separate pipes.
        let mut sources: Vec<Box<dyn std::io::Read + Send>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            sources.push(Box::new(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            sources.push(Box::new(stderr));
        }
        Ok(LogFollow::new(sources, Some(child)))
    }
}

/// `logs -f`, limited to output from `since` on when given.
fn logs_args(name: &str, since: Option<DateTime<Utc>>) -> Vec<String> {
    let mut args = vec!["logs".to_string(), "-f".to_string()];
    if let Some(since) = since {
        args.push("--since".to_string());
        args.push(since.to_rfc3339_opts(SecondsFormat::Nanos, true));
    }
    args.push(name.to_string());
    args
}
