//! Task lifecycle: create, start, stop, restart, delete, status, list.
//!
//! Every operation re-reads container state from the engine instead of
//! trusting metadata, so repeating a call converges on the same result.
//! Metadata is written only after the engine accepted a change.

pub mod environment;
pub mod store;
pub mod types;

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::Settings;
use crate::engine::{ContainerEngine, ContainerRecord, ContainerState};
use crate::error::{ConfigError, EngineError, TaskError};
use crate::git::GitClient;
use crate::images::{ImageLayerSet, freshness};
use crate::project::Project;
use crate::readiness::{self, ReadinessOutcome, ReadinessProfile};
use crate::sync::{self, SyncOptions, Synchronizer};

use environment::{HostContext, WEB_CONTAINER_PORT, WEB_PORT_ATTEMPTS};
use store::TaskStore;
pub use types::{
    DeleteReport, EffectiveStatus, LastState, StartOptions, StartOutcome, StartReport,
    StatusReport, Task, TaskMode, TaskPhase, TaskSummary, container_name, effective_status,
};

pub struct TaskManager<'a> {
    engine: &'a dyn ContainerEngine,
    git: &'a dyn GitClient,
    settings: &'a Settings,
}

impl<'a> TaskManager<'a> {
    pub fn new(
        engine: &'a dyn ContainerEngine,
        git: &'a dyn GitClient,
        settings: &'a Settings,
    ) -> Self {
        Self {
            engine,
            git,
            settings,
        }
    }

    /// Allocate the next id, create the workspace and drop the new-task marker.
    pub fn create_task(&self, project: &Project) -> Result<Task, TaskError> {
        let store = TaskStore::for_project(project);
        let task_id = store.next_id();
        let workspace = project.workspace_dir(&task_id);
        fs::create_dir_all(&workspace).map_err(|source| TaskError::Io {
            path: workspace.clone(),
            source,
        })?;
        sync::write_marker(&workspace).map_err(|source| TaskError::Io {
            path: sync::marker_path(&workspace),
            source,
        })?;

        let task = Task {
            project_id: project.id.clone(),
            task_id,
            workspace,
            mode: None,
            preset: None,
            backend: None,
            web_port: None,
            created_at: Utc::now(),
            last_state: LastState::Created,
            pending_reset: true,
        };
        store.save(&task)?;
        info!(project = %project.id, task_id = %task.task_id, "task: created");
        Ok(task)
    }

    pub fn load(&self, project: &Project, task_id: &str) -> Result<Task, TaskError> {
        TaskStore::for_project(project).load(task_id)
    }

    fn inspect(&self, task: &Task) -> Result<Option<ContainerRecord>, EngineError> {
        match task.container_name() {
            Some(name) => self.engine.inspect(&name),
            None => Ok(None),
        }
    }

    /// Bring the task's container to Running in `mode`.
    ///
    /// Returns once readiness is detected or timed out; the container keeps
    /// running either way. Log lines seen while waiting go to `sink`.
    pub fn start(
        &self,
        project: &Project,
        task_id: &str,
        mode: TaskMode,
        options: &StartOptions,
        sink: &mut dyn FnMut(&str),
    ) -> Result<StartReport, TaskError> {
        let store = TaskStore::for_project(project);
        let mut task = store.load(task_id)?;
        if let Some(existing) = task.mode
            && existing != mode
        {
            return Err(ConfigError::ModeMismatch {
                task_id: task_id.to_string(),
                existing: existing.to_string(),
                requested: mode.to_string(),
            }
            .into());
        }

        let name = container_name(&project.id, mode, task_id);
        let profile = self.settings.readiness_profile(mode)?;
        let current = self.engine.inspect(&name)?;
        info!(engine = self.engine.name(), project = %project.id, task_id, mode = %mode, phase = ?TaskPhase::of(current.as_ref()), "start: begin");

        let mut sync_result = None;
        // Output of earlier runs stays in the container's log.
        let mut logs_since = None;
        let outcome = match TaskPhase::of(current.as_ref()) {
            TaskPhase::Running if mode == TaskMode::Headless => {
                return Err(TaskError::AlreadyRunning {
                    task_id: task_id.to_string(),
                });
            }
            TaskPhase::Running => {
                info!(container = %name, "start: already running");
                return Ok(StartReport {
                    task_id: task_id.to_string(),
                    container_name: name,
                    mode,
                    outcome: StartOutcome::AlreadyRunning,
                    sync: None,
                    readiness: None,
                    web_port: task.web_port,
                });
            }
            TaskPhase::Stopped => {
                logs_since = Some(Utc::now());
                self.engine.start(&name)?;
                StartOutcome::Resumed
            }
            TaskPhase::NoContainer => {
                environment::prepare_host_dirs(project, &task, &self.settings.envs_dir).map_err(
                    |source| TaskError::Io {
                        path: task.workspace.clone(),
                        source,
                    },
                )?;

                let reset_mode = options.reset_mode.unwrap_or(self.settings.git_reset_mode);
                let result = Synchronizer::new(self.git).sync(
                    project,
                    &task.workspace,
                    SyncOptions { reset_mode },
                )?;
                for warning in &result.warnings {
                    warn!(task_id, "sync: {}", warning);
                }
                sync_result = Some(result);

                if mode == TaskMode::Web && task.web_port.is_none() {
                    task.web_port = Some(self.allocate_web_port()?);
                }
                let host = HostContext {
                    envs_dir: &self.settings.envs_dir,
                    passthrough: &self.settings.env_passthrough,
                };
                let spec = environment::run_spec(
                    project,
                    &task,
                    mode,
                    options,
                    &host,
                    task.web_port.filter(|_| mode == TaskMode::Web),
                );
                self.engine.run(&spec)?;
                StartOutcome::Created
            }
        };

        task.mode = Some(mode);
        if options.preset.is_some() {
            task.preset = options.preset.clone();
        }
        if mode == TaskMode::Web {
            task.backend = Some(environment::web_backend(
                options.backend.as_deref().or(task.backend.as_deref()),
                project.default_agent.as_deref(),
            ));
        }
        task.pending_reset = sync::has_marker(&task.workspace);
        task.last_state = LastState::Running;
        store.save(&task)?;

        let readiness = self.await_readiness(&name, &profile, logs_since, sink)?;
        info!(container = %name, ready_via = ?readiness.ready_via, elapsed_ms = readiness.elapsed.as_millis() as u64, "start: readiness");

        let after = self.engine.inspect(&name)?;
        let finished_cleanly = mode == TaskMode::Headless
            && after
                .as_ref()
                .is_some_and(|c| c.state == ContainerState::Exited && c.exit_code == Some(0));
        if !after.as_ref().is_some_and(|c| c.is_running()) && !finished_cleanly {
            task.last_state = LastState::Stopped;
            store.save(&task)?;
            let state = after
                .map(|c| c.state.to_string())
                .unwrap_or_else(|| "missing".to_string());
            return Err(EngineError::ExitedEarly { name, state }.into());
        }

        Ok(StartReport {
            task_id: task_id.to_string(),
            container_name: name,
            mode,
            outcome,
            sync: sync_result,
            readiness: Some(readiness),
            web_port: task.web_port,
        })
    }

    fn await_readiness(
        &self,
        name: &str,
        profile: &ReadinessProfile,
        since: Option<DateTime<Utc>>,
        sink: &mut dyn FnMut(&str),
    ) -> Result<ReadinessOutcome, TaskError> {
        if profile.markers.is_empty() {
            return Ok(readiness::await_ready(Vec::new(), profile, sink));
        }
        let mut follow = self.engine.follow_logs(name, since)?;
        let outcome = readiness::await_ready(follow.take_sources(), profile, sink);
        drop(follow);
        Ok(outcome)
    }

    fn allocate_web_port(&self) -> Result<u16, TaskError> {
        let used = store::used_web_ports(&self.settings.projects_state_dir());
        environment::allocate_web_port(&used, WEB_CONTAINER_PORT, &environment::port_is_free)
            .ok_or(TaskError::NoFreePort {
                first: WEB_CONTAINER_PORT,
                last: WEB_CONTAINER_PORT.saturating_add(WEB_PORT_ATTEMPTS - 1),
            })
    }

    /// Stop a running container, waiting up to `timeout` (project default otherwise).
    pub fn stop(
        &self,
        project: &Project,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), TaskError> {
        let store = TaskStore::for_project(project);
        let mut task = store.load(task_id)?;
        let not_running = || TaskError::NotRunning {
            task_id: task_id.to_string(),
        };
        let name = task.container_name().ok_or_else(not_running)?;
        if !self.engine.inspect(&name)?.is_some_and(|c| c.is_running()) {
            return Err(not_running());
        }

        let timeout =
            timeout.unwrap_or_else(|| Duration::from_secs(project.shutdown_timeout_secs));
        info!(container = %name, timeout_secs = timeout.as_secs(), "stop");
        self.engine.stop(&name, timeout)?;
        task.last_state = LastState::Stopped;
        store.save(&task)
    }

    /// Best-effort stop, then start again in the recorded mode.
    pub fn restart(
        &self,
        project: &Project,
        task_id: &str,
        sink: &mut dyn FnMut(&str),
    ) -> Result<StartReport, TaskError> {
        let task = self.load(project, task_id)?;
        let mode = task.mode.ok_or_else(|| TaskError::NeverStarted {
            task_id: task_id.to_string(),
        })?;

        match self.stop(project, task_id, None) {
            Ok(()) | Err(TaskError::NotRunning { .. }) => {}
            Err(e) => warn!(task_id, error = %e, "restart: stop failed, starting anyway"),
        }

        let options = StartOptions {
            preset: task.preset.clone(),
            backend: task.backend.clone(),
            ..Default::default()
        };
        self.start(project, task_id, mode, &options, sink)
    }

    /// Remove every trace of a task. Each step runs even if an earlier one
    /// failed; failures are collected in the report.
    pub fn delete(&self, project: &Project, task_id: &str) -> Result<DeleteReport, TaskError> {
        let store = TaskStore::for_project(project);
        let task = store.load(task_id)?;
        let mut report = DeleteReport {
            task_id: task_id.to_string(),
            ..Default::default()
        };

        for name in task.all_container_names() {
            match self.engine.inspect(&name) {
                Ok(None) => {}
                Ok(Some(_)) => match self.engine.remove(&name) {
                    Ok(()) => report.removed_containers.push(name),
                    Err(e) => report
                        .failures
                        .push(format!("remove container {}: {}", name, e)),
                },
                Err(e) => report
                    .failures
                    .push(format!("inspect container {}: {}", name, e)),
            }
        }

        match remove_dir_if_exists(&task.workspace) {
            Ok(()) => {
                report.workspace_removed = true;
                if let Some(parent) = task.workspace.parent() {
                    let _ = fs::remove_dir(parent);
                }
            }
            Err(e) => report.failures.push(format!(
                "remove workspace {}: {}",
                task.workspace.display(),
                e
            )),
        }

        match store.remove(task_id) {
            Ok(()) => report.metadata_removed = true,
            Err(e) => report.failures.push(format!("remove metadata: {}", e)),
        }

        for failure in &report.failures {
            warn!(task_id, "delete: {}", failure);
        }
        info!(project = %project.id, task_id, removed = report.removed_containers.len(), "task: deleted");
        Ok(report)
    }

    pub fn status(&self, project: &Project, task_id: &str) -> Result<StatusReport, TaskError> {
        let task = self.load(project, task_id)?;
        let container = self.inspect(&task)?;
        let phase = TaskPhase::of(container.as_ref());
        let status = effective_status(&task, container.as_ref());

        let image_id = container.as_ref().and_then(|c| c.image_id.clone());
        let image_stale = match (task.mode, image_id.as_deref()) {
            (Some(mode), Some(running_id)) => self.image_staleness(project, mode, running_id),
            _ => None,
        };

        Ok(StatusReport {
            container_name: task.container_name(),
            phase,
            effective_status: status,
            container_state: container.map(|c| c.state),
            image_id,
            image_stale,
            pending_reset: sync::has_marker(&task.workspace),
            task,
        })
    }

    /// Stale when the tag now points at another image, or when the tagged
    /// image was built from an older build context.
    fn image_staleness(&self, project: &Project, mode: TaskMode, running_id: &str) -> Option<bool> {
        let layers = ImageLayerSet::for_project(project);
        let tag = environment::image_for(&layers, mode);

        let retagged = match self.engine.image_id(tag) {
            Ok(Some(current)) => Some(current != running_id),
            Ok(None) => None,
            Err(e) => {
                warn!(image = tag, error = %e, "status: image lookup failed");
                None
            }
        };
        let outdated = freshness::build_context_hash(project)
            .ok()
            .and_then(|hash| freshness::is_image_stale(self.engine, tag, &hash).ok().flatten());

        match (retagged, outdated) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(false) || b.unwrap_or(false)),
        }
    }

    /// All tasks of a project with live status from one engine query.
    pub fn list(&self, project: &Project) -> Result<Vec<TaskSummary>, TaskError> {
        let tasks = TaskStore::for_project(project).list();
        let containers: HashMap<String, ContainerRecord> = self
            .engine
            .list(&format!("{}-", project.id))?
            .into_iter()
            // The prefix also matches projects named "{id}-something".
            .filter(|c| {
                types::parse_container_name(&c.name).is_some_and(|(owner, _, _)| owner == project.id)
            })
            .map(|c| (c.name.clone(), c))
            .collect();

        Ok(tasks
            .into_iter()
            .map(|task| {
                let container = task.container_name().and_then(|n| containers.get(&n));
                TaskSummary {
                    status: effective_status(&task, container),
                    pending_reset: sync::has_marker(&task.workspace),
                    task_id: task.task_id,
                    mode: task.mode,
                    web_port: task.web_port,
                    created_at: task.created_at,
                }
            })
            .collect())
    }

    /// Run a command inside the task's running container.
    pub fn exec(
        &self,
        project: &Project,
        task_id: &str,
        command: &[String],
    ) -> Result<String, TaskError> {
        let task = self.load(project, task_id)?;
        let not_running = || TaskError::NotRunning {
            task_id: task_id.to_string(),
        };
        let name = task.container_name().ok_or_else(not_running)?;
        if !self.engine.inspect(&name)?.is_some_and(|c| c.is_running()) {
            return Err(not_running());
        }
        Ok(self.engine.exec(&name, command)?)
    }
}

fn remove_dir_if_exists(path: &std::path::Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::git::fake::FakeGit;
    use crate::images::DOCKERFILES;
    use crate::project::SecurityMode;
    use crate::project::testing::project_in;
    use crate::readiness::ReadyVia;
    use crate::sync::SyncAction;

    const UPSTREAM: &str = "git@example.com:org/demo.git";

    struct Fixture {
        _tmp: tempfile::TempDir,
        project: Project,
        settings: Settings,
        engine: FakeEngine,
        git: FakeGit,
    }

    impl Fixture {
        fn new(mode: SecurityMode) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let project = project_in(tmp.path(), mode);
            let settings = Settings::rooted_at(tmp.path());
            let engine = FakeEngine::new();
            engine.add_image("demo:l2-cli", "sha256:cli1");
            engine.add_image("demo:l2-web", "sha256:web1");
            engine.set_log_lines(&["booting", "\x1b[32m__CLI_READY__\x1b[0m"]);
            let git = FakeGit::new();
            git.add_remote_repo(UPSTREAM, "main", "aaa");
            Self {
                _tmp: tmp,
                project,
                settings,
                engine,
                git,
            }
        }

        fn manager(&self) -> TaskManager<'_> {
            TaskManager::new(&self.engine, &self.git, &self.settings)
        }

        fn start(&self, task_id: &str, mode: TaskMode) -> Result<StartReport, TaskError> {
            self.manager()
                .start(&self.project, task_id, mode, &StartOptions::default(), &mut |_| {})
        }
    }

    #[test]
    fn test_fresh_task_start_to_running() {
        let fx = Fixture::new(SecurityMode::Online);
        fs::create_dir_all(&fx.project.build_dir).unwrap();
        for name in DOCKERFILES {
            fs::write(fx.project.build_dir.join(name), name).unwrap();
        }
        let hash = freshness::build_context_hash(&fx.project).unwrap();
        fx.engine
            .set_image_label("demo:l2-cli", freshness::CONTEXT_HASH_LABEL, &hash);

        let task = fx.manager().create_task(&fx.project).unwrap();
        assert_eq!(task.task_id, "1");
        assert!(sync::has_marker(&task.workspace));
        assert!(fx.engine.calls().is_empty());

        let mut seen = Vec::new();
        let report = fx
            .manager()
            .start(&fx.project, "1", TaskMode::Cli, &StartOptions::default(), &mut |l| {
                seen.push(l.to_string())
            })
            .unwrap();
        assert_eq!(report.outcome, StartOutcome::Created);
        assert_eq!(report.container_name, "demo-cli-1");
        assert!(matches!(
            report.sync.as_ref().unwrap().action,
            SyncAction::Cloned { .. }
        ));
        assert!(matches!(
            report.readiness.unwrap().ready_via,
            ReadyVia::Marker { .. }
        ));
        assert_eq!(seen, vec!["booting", "__CLI_READY__"]);
        assert!(!sync::has_marker(&task.workspace));

        let status = fx.manager().status(&fx.project, "1").unwrap();
        assert_eq!(status.phase, TaskPhase::Running);
        assert_eq!(status.effective_status, EffectiveStatus::Running);
        assert_eq!(status.image_stale, Some(false));
        assert!(!status.pending_reset);
        assert_eq!(status.task.mode, Some(TaskMode::Cli));

        fx.engine.add_image("demo:l2-cli", "sha256:cli2");
        let status = fx.manager().status(&fx.project, "1").unwrap();
        assert_eq!(status.image_stale, Some(true));
    }

    #[test]
    fn test_stop_then_start_resumes_without_sync() {
        let fx = Fixture::new(SecurityMode::Online);
        fx.manager().create_task(&fx.project).unwrap();
        fx.start("1", TaskMode::Cli).unwrap();
        fx.manager().stop(&fx.project, "1", None).unwrap();
        assert_eq!(fx.engine.count("stop demo-cli-1 10"), 1);
        assert_eq!(
            fx.manager().status(&fx.project, "1").unwrap().phase,
            TaskPhase::Stopped
        );

        let calls_before = fx.git.calls().len();
        let report = fx.start("1", TaskMode::Cli).unwrap();
        assert_eq!(report.outcome, StartOutcome::Resumed);
        assert!(report.sync.is_none());
        assert_eq!(fx.git.calls().len(), calls_before);
        assert_eq!(fx.git.calls_matching("clone").len(), 1);
        assert_eq!(fx.engine.count("run "), 1);
        assert_eq!(fx.engine.count("start demo-cli-1"), 1);
    }

    #[test]
    fn test_resume_waits_for_output_of_the_new_run() {
        let fx = Fixture::new(SecurityMode::Online);
        fx.manager().create_task(&fx.project).unwrap();
        fx.start("1", TaskMode::Cli).unwrap();
        fx.manager().stop(&fx.project, "1", None).unwrap();

        // The restarted process has not reached its ready line yet.
        fx.engine.set_log_lines(&["resuming"]);
        let mut seen = Vec::new();
        let report = fx
            .manager()
            .start(&fx.project, "1", TaskMode::Cli, &StartOptions::default(), &mut |l| {
                seen.push(l.to_string())
            })
            .unwrap();

        assert_eq!(report.outcome, StartOutcome::Resumed);
        assert_eq!(seen, vec!["resuming"]);
        assert_eq!(report.readiness.unwrap().ready_via, ReadyVia::StreamClosed);
    }

    #[test]
    fn test_stop_without_container_is_not_running() {
        let fx = Fixture::new(SecurityMode::Online);
        fx.manager().create_task(&fx.project).unwrap();
        let meta = TaskStore::for_project(&fx.project).path("1");
        let before = fs::read_to_string(&meta).unwrap();

        let err = fx.manager().stop(&fx.project, "1", None).unwrap_err();
        assert!(matches!(err, TaskError::NotRunning { .. }));
        assert!(err.is_state_mismatch());
        assert_eq!(fs::read_to_string(&meta).unwrap(), before);
        assert_eq!(fx.engine.count("stop"), 0);
    }

    #[test]
    fn test_start_is_idempotent() {
        let fx = Fixture::new(SecurityMode::Online);
        fx.manager().create_task(&fx.project).unwrap();
        fx.start("1", TaskMode::Cli).unwrap();
        let again = fx.start("1", TaskMode::Cli).unwrap();
        assert_eq!(again.outcome, StartOutcome::AlreadyRunning);
        assert_eq!(fx.engine.count("run "), 1);
        assert_eq!(fx.engine.count("start "), 0);
    }

    #[test]
    fn test_mode_mismatch_is_refused() {
        let fx = Fixture::new(SecurityMode::Online);
        fx.manager().create_task(&fx.project).unwrap();
        fx.start("1", TaskMode::Cli).unwrap();
        let err = fx.start("1", TaskMode::Web).unwrap_err();
        assert!(matches!(
            err,
            TaskError::Config(ConfigError::ModeMismatch { .. })
        ));
    }

    #[test]
    fn test_exited_early_is_reported() {
        let fx = Fixture::new(SecurityMode::Online);
        fx.engine.exit_after_start();
        fx.manager().create_task(&fx.project).unwrap();
        let err = fx.start("1", TaskMode::Cli).unwrap_err();
        assert!(matches!(
            err,
            TaskError::Engine(EngineError::ExitedEarly { .. })
        ));
        let task = fx.manager().load(&fx.project, "1").unwrap();
        assert_eq!(task.last_state, LastState::Stopped);
        assert_eq!(task.mode, Some(TaskMode::Cli));
    }

    #[test]
    fn test_failed_clone_keeps_marker_and_creates_nothing() {
        let fx = Fixture::new(SecurityMode::Online);
        fx.git.fail_on("clone");
        let task = fx.manager().create_task(&fx.project).unwrap();
        let err = fx.start("1", TaskMode::Cli).unwrap_err();
        assert!(matches!(err, TaskError::GitSync(_)));
        assert!(sync::has_marker(&task.workspace));
        assert_eq!(fx.engine.count("run "), 0);
        assert_eq!(fx.manager().load(&fx.project, "1").unwrap().mode, None);
    }

    #[test]
    fn test_headless_detaches_and_refuses_rerun_while_running() {
        let fx = Fixture::new(SecurityMode::Online);
        fx.manager().create_task(&fx.project).unwrap();
        let report = fx.start("1", TaskMode::Headless).unwrap();
        assert_eq!(report.readiness.unwrap().ready_via, ReadyVia::Timeout);
        assert_eq!(fx.engine.count("logs"), 0);

        let err = fx.start("1", TaskMode::Headless).unwrap_err();
        assert!(matches!(err, TaskError::AlreadyRunning { .. }));
    }

    #[test]
    fn test_web_start_records_port_and_backend() {
        let fx = Fixture::new(SecurityMode::Online);
        fx.engine.set_log_lines(&["LuskUI started on :7860"]);
        fx.manager().create_task(&fx.project).unwrap();
        fx.manager().create_task(&fx.project).unwrap();

        let first = fx.start("1", TaskMode::Web).unwrap();
        let second = fx.start("2", TaskMode::Web).unwrap();
        let (p1, p2) = (first.web_port.unwrap(), second.web_port.unwrap());
        assert!(p1 >= WEB_CONTAINER_PORT);
        assert_ne!(p1, p2);

        let spec = fx.engine.container("demo-web-1").unwrap().spec;
        assert_eq!(spec.ports[0].host_port, p1);
        let task = fx.manager().load(&fx.project, "1").unwrap();
        assert_eq!(task.backend.as_deref(), Some("codex"));
    }

    #[test]
    fn test_restart_requires_previous_start() {
        let fx = Fixture::new(SecurityMode::Online);
        fx.manager().create_task(&fx.project).unwrap();
        let err = fx
            .manager()
            .restart(&fx.project, "1", &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, TaskError::NeverStarted { .. }));
    }

    #[test]
    fn test_restart_continues_after_failed_stop() {
        let fx = Fixture::new(SecurityMode::Online);
        fx.manager().create_task(&fx.project).unwrap();
        fx.start("1", TaskMode::Cli).unwrap();
        fx.engine.fail_on("stop");

        let report = fx.manager().restart(&fx.project, "1", &mut |_| {}).unwrap();
        assert_eq!(report.outcome, StartOutcome::AlreadyRunning);
        assert_eq!(fx.engine.count("stop"), 1);
    }

    #[test]
    fn test_delete_removes_everything_and_collects_failures() {
        let fx = Fixture::new(SecurityMode::Online);
        let task = fx.manager().create_task(&fx.project).unwrap();
        fx.start("1", TaskMode::Cli).unwrap();
        fx.engine
            .insert_container("demo-web-1", "demo:l2-web", ContainerState::Exited);
        fx.engine.fail_on("remove demo-web-1");

        let report = fx.manager().delete(&fx.project, "1").unwrap();
        assert_eq!(report.removed_containers, vec!["demo-cli-1"]);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].contains("demo-web-1"));
        assert!(report.workspace_removed);
        assert!(report.metadata_removed);
        assert!(!task.workspace.exists());
        assert!(matches!(
            fx.manager().load(&fx.project, "1"),
            Err(TaskError::Config(ConfigError::UnknownTask { .. }))
        ));
    }

    #[test]
    fn test_list_uses_one_engine_query() {
        let fx = Fixture::new(SecurityMode::Online);
        for _ in 0..3 {
            fx.manager().create_task(&fx.project).unwrap();
        }
        fx.start("2", TaskMode::Cli).unwrap();

        let summaries = fx.manager().list(&fx.project).unwrap();
        assert_eq!(fx.engine.count("list"), 1);
        let statuses: Vec<_> = summaries.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                EffectiveStatus::Created,
                EffectiveStatus::Running,
                EffectiveStatus::Created
            ]
        );
        assert!(summaries[0].pending_reset);
        assert!(!summaries[1].pending_reset);
    }

    #[test]
    fn test_gatekeeping_start_requires_gate() {
        let fx = Fixture::new(SecurityMode::Gatekeeping);
        fx.manager().create_task(&fx.project).unwrap();
        let err = fx.start("1", TaskMode::Cli).unwrap_err();
        assert!(matches!(
            err,
            TaskError::Config(ConfigError::GateMissing { .. })
        ));
        assert_eq!(fx.engine.count("run "), 0);
    }

    #[test]
    fn test_gatekeeping_start_clones_from_gate_and_mounts_it() {
        let fx = Fixture::new(SecurityMode::Gatekeeping);
        crate::sync::gate::sync_gate(&fx.git, &fx.project, false).unwrap();
        fx.manager().create_task(&fx.project).unwrap();

        let report = fx.start("1", TaskMode::Cli).unwrap();
        assert_eq!(report.sync.unwrap().from, crate::sync::SyncSource::Gate);

        let spec = fx.engine.container("demo-cli-1").unwrap().spec;
        assert!(spec.mounts.iter().any(|m| m.host == fx.project.gate_path));
        assert!(!spec.env.values().any(|v| v == UPSTREAM));
    }

    #[test]
    fn test_exec_requires_running_container() {
        let fx = Fixture::new(SecurityMode::Online);
        fx.manager().create_task(&fx.project).unwrap();
        let cmd = vec!["git".to_string(), "status".to_string()];
        assert!(matches!(
            fx.manager().exec(&fx.project, "1", &cmd),
            Err(TaskError::NotRunning { .. })
        ));
        fx.start("1", TaskMode::Cli).unwrap();
        fx.manager().exec(&fx.project, "1", &cmd).unwrap();
        assert_eq!(fx.engine.count("exec demo-cli-1 git status"), 1);
    }
}
