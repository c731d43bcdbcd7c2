//! Mounts, environment and command line for a task container.

use std::collections::BTreeMap;
use std::fs;
use std::net::TcpListener;
use std::path::Path;

use crate::engine::{Mount, PortMapping, Relabel, RunSpec};
use crate::images::ImageLayerSet;
use crate::project::Project;

use super::types::{StartOptions, Task, TaskMode};

pub const CONTAINER_WORKSPACE: &str = "/workspace";
pub const CONTAINER_HOME: &str = "/home/dev";
pub const WEB_CONTAINER_PORT: u16 = 7860;
pub const WEB_PORT_ATTEMPTS: u16 = 200;

const INIT_SCRIPT: &str = "gatebox-init";
const WEB_BACKENDS: [&str; 4] = ["codex", "claude", "copilot", "mistral"];
const DEFAULT_WEB_BACKEND: &str = "codex";

/// Agent config directories under `envs_dir`, shared by every task.
const SHARED_DIRS: [(&str, &str); 7] = [
    ("_codex-config", ".codex"),
    ("_claude-config", ".claude"),
    ("_vibe-config", ".vibe"),
    ("_opencode-config", ".config/opencode"),
    ("_opencode-data", ".local/share/opencode"),
    ("_gh-config", ".config/gh"),
    ("_glab-config", ".config/glab-cli"),
];

/// Host directories and passthrough settings the environment is built from.
pub struct HostContext<'a> {
    pub envs_dir: &'a Path,
    pub passthrough: &'a [String],
}

/// Create the workspace and shared config directories if missing.
pub fn prepare_host_dirs(project: &Project, task: &Task, envs_dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(&task.workspace)?;
    for (suffix, _) in SHARED_DIRS {
        fs::create_dir_all(envs_dir.join(suffix))?;
    }
    if let Some(dir) = project.ssh_host_dir.as_ref()
        && project.mounts_ssh()
    {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

pub fn mounts(project: &Project, task: &Task, envs_dir: &Path) -> Vec<Mount> {
    let mut mounts =
        vec![Mount::new(&task.workspace, CONTAINER_WORKSPACE).relabel(Relabel::Private)];

    for (suffix, target) in SHARED_DIRS {
        mounts.push(
            Mount::new(envs_dir.join(suffix), format!("{}/{}", CONTAINER_HOME, target))
                .relabel(Relabel::Shared),
        );
    }

    // Identity path: the workspace's origin points at the host path.
    if project.gate_path.exists() {
        let gate = gate_mount(project);
        mounts.push(if project.is_gatekeeping() {
            gate
        } else {
            gate.read_only()
        });
    }

    if project.mounts_ssh()
        && let Some(dir) = project.ssh_host_dir.as_ref()
        && dir.is_dir()
    {
        mounts.push(
            Mount::new(dir, format!("{}/.ssh", CONTAINER_HOME)).relabel(Relabel::Shared),
        );
    }

    mounts.extend(project.extra_mounts.iter().cloned());
    mounts
}

fn gate_mount(project: &Project) -> Mount {
    Mount::new(
        &project.gate_path,
        project.gate_path.to_string_lossy().into_owned(),
    )
    .relabel(Relabel::Shared)
}

/// Environment variables for the container. `lookup` reads the host env.
pub fn environment(
    project: &Project,
    task: &Task,
    mode: TaskMode,
    options: &StartOptions,
    passthrough: &[String],
    lookup: &dyn Fn(&str) -> Option<String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set = |k: &str, v: String| {
        env.insert(k.to_string(), v);
    };

    set("PROJECT_ID", project.id.clone());
    set("TASK_ID", task.task_id.clone());
    set("TASK_MODE", mode.to_string());
    set("REPO_ROOT", CONTAINER_WORKSPACE.to_string());
    set("GIT_BRANCH", project.default_branch.clone());
    set("HUMAN_GIT_NAME", project.human_name.clone());
    set("HUMAN_GIT_EMAIL", project.human_email.clone());
    set("CLAUDE_CONFIG_DIR", format!("{}/.claude", CONTAINER_HOME));

    let gate = project.gate_path.to_string_lossy().into_owned();
    if project.is_gatekeeping() {
        set("CODE_REPO", gate);
        if project.expose_external_remote
            && let Some(url) = project.upstream_url.as_ref()
        {
            set("EXTERNAL_REMOTE_URL", url.clone());
        }
    } else {
        if project.gate_path.exists() {
            set("CLONE_FROM", gate);
        }
        if let Some(url) = project.upstream_url.as_ref() {
            set("CODE_REPO", url.clone());
        }
    }

    if let Some(agent) = project.default_agent.as_ref() {
        set("DEFAULT_AGENT", agent.clone());
    }
    if let Some(preset) = options.preset.as_ref() {
        set("AGENT_PRESET", preset.clone());
    }
    match mode {
        TaskMode::Web => set(
            "GATEBOX_WEB_BACKEND",
            web_backend(options.backend.as_deref(), project.default_agent.as_deref()),
        ),
        TaskMode::Headless => {
            if let Some(prompt) = options.prompt.as_ref() {
                set("AGENT_PROMPT", prompt.clone());
            }
        }
        TaskMode::Cli => {}
    }

    for key in passthrough {
        if !env.contains_key(key)
            && let Some(value) = lookup(key)
        {
            env.insert(key.clone(), value);
        }
    }
    env
}

/// Explicit backend, then the project default, then `codex`. Unknown names
/// fall back to `codex`.
pub fn web_backend(explicit: Option<&str>, project_default: Option<&str>) -> String {
    let normalize = |s: Option<&str>| {
        s.map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
    };
    normalize(explicit)
        .or_else(|| normalize(project_default))
        .filter(|b| WEB_BACKENDS.contains(&b.as_str()))
        .unwrap_or_else(|| DEFAULT_WEB_BACKEND.to_string())
}

pub fn image_for(layers: &ImageLayerSet, mode: TaskMode) -> &str {
    match mode {
        TaskMode::Web => &layers.project_web,
        TaskMode::Cli | TaskMode::Headless => &layers.project_cli,
    }
}

pub fn container_command(mode: TaskMode) -> Vec<String> {
    let script = match mode {
        TaskMode::Cli => format!("{} && echo __CLI_READY__; tail -f /dev/null", INIT_SCRIPT),
        TaskMode::Web => format!("{} && exec gatebox-web", INIT_SCRIPT),
        TaskMode::Headless => format!("{} && exec gatebox-agent", INIT_SCRIPT),
    };
    vec!["bash".to_string(), "-lc".to_string(), script]
}

/// Assemble the full run spec for a task container.
pub fn run_spec(
    project: &Project,
    task: &Task,
    mode: TaskMode,
    options: &StartOptions,
    host: &HostContext<'_>,
    web_port: Option<u16>,
) -> RunSpec {
    let layers = ImageLayerSet::for_project(project);
    let mut labels = BTreeMap::new();
    labels.insert("gatebox.project".to_string(), project.id.clone());
    labels.insert("gatebox.task".to_string(), task.task_id.clone());
    labels.insert("gatebox.mode".to_string(), mode.to_string());

    RunSpec {
        name: super::types::container_name(&project.id, mode, &task.task_id),
        image: image_for(&layers, mode).to_string(),
        mounts: mounts(project, task, host.envs_dir),
        env: environment(
            project,
            task,
            mode,
            options,
            host.passthrough,
            &|k| std::env::var(k).ok(),
        ),
        ports: web_port
            .map(|host_port| PortMapping {
                host_port,
                container_port: WEB_CONTAINER_PORT,
            })
            .into_iter()
            .collect(),
        labels,
        gpu: project.gpu_enabled,
        workdir: Some(CONTAINER_WORKSPACE.to_string()),
        command: container_command(mode),
    }
}

/// First port from `base` upward that no task records and `is_free` accepts.
pub fn allocate_web_port(used: &[u16], base: u16, is_free: &dyn Fn(u16) -> bool) -> Option<u16> {
    (0..WEB_PORT_ATTEMPTS)
        .filter_map(|offset| base.checked_add(offset))
        .find(|port| !used.contains(port) && is_free(*port))
}

/// Whether the loopback port can be bound right now.
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
