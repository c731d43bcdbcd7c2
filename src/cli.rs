use crate::command;
use crate::images::BuildScope;
use crate::sync::GitResetMode;
use crate::tasks::TaskMode;
use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gatebox")]
#[command(about = "Ephemeral, gated container sandboxes for coding agents", long_about = None)]
#[command(version)]
struct Cli {
    /// More log detail in the log file (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, run and inspect task sandboxes
    #[command(subcommand)]
    Task(TaskCommands),

    /// Build the layered images of a project
    Build {
        /// Project id
        project: String,

        /// Which layers to build
        #[arg(long, value_enum, default_value_t = BuildScope::L2Only)]
        scope: BuildScope,

        /// Also build the dev image
        #[arg(long)]
        dev: bool,
    },

    /// Create or update the project's git gate (local mirror of upstream)
    GateSync {
        /// Project id
        project: String,

        /// Delete and re-clone the mirror
        #[arg(long)]
        force: bool,
    },

    /// Compare the git gate with upstream
    GateStatus {
        /// Project id
        project: String,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create a new task workspace (no container yet)
    New {
        /// Project id
        project: String,
    },

    /// Start a task container and wait until it is ready
    Start {
        /// Project id
        project: String,
        /// Task id
        task_id: String,

        /// How the container is driven
        #[arg(long, value_enum, default_value_t = TaskMode::Cli)]
        mode: TaskMode,

        /// Agent preset passed to the container
        #[arg(long)]
        preset: Option<String>,

        /// Agent backend for web mode (codex, claude, copilot, mistral)
        #[arg(long)]
        backend: Option<String>,

        /// Prompt for a headless agent
        #[arg(long)]
        prompt: Option<String>,

        /// What a resumed workspace does after fetching (overrides config)
        #[arg(long, value_enum)]
        reset: Option<GitResetMode>,
    },

    /// Stop a running task container
    Stop {
        /// Project id
        project: String,
        /// Task id
        task_id: String,

        /// Seconds to wait before killing (defaults to the project setting)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Stop (if running) and start again in the recorded mode
    Restart {
        /// Project id
        project: String,
        /// Task id
        task_id: String,
    },

    /// Remove a task's containers, workspace and metadata
    Delete {
        /// Project id
        project: String,
        /// Task id
        task_id: String,
    },

    /// Show container state, image freshness and pending reset of a task
    Status {
        /// Project id
        project: String,
        /// Task id
        task_id: String,
    },

    /// List all tasks of a project
    List {
        /// Project id
        project: String,
    },

    /// Run a command inside a running task container
    Exec {
        /// Project id
        project: String,
        /// Task id
        task_id: String,

        /// Command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

// --- Public Entry Point ---
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    crate::logger::init(log_level(cli.verbose))?;
    tracing::info!(args = ?std::env::args().collect::<Vec<_>>(), "gatebox start");

    let ctx = command::Context::load()?;
    match cli.command {
        Commands::Task(task) => match task {
            TaskCommands::New { project } => command::task::new(&ctx, &project),
            TaskCommands::Start {
                project,
                task_id,
                mode,
                preset,
                backend,
                prompt,
                reset,
            } => command::task::start(
                &ctx,
                &project,
                &task_id,
                mode,
                crate::tasks::StartOptions {
                    preset,
                    backend,
                    prompt,
                    reset_mode: reset,
                },
            ),
            TaskCommands::Stop {
                project,
                task_id,
                timeout,
            } => command::task::stop(&ctx, &project, &task_id, timeout),
            TaskCommands::Restart { project, task_id } => {
                command::task::restart(&ctx, &project, &task_id)
            }
            TaskCommands::Delete { project, task_id } => {
                command::task::delete(&ctx, &project, &task_id)
            }
            TaskCommands::Status { project, task_id } => {
                command::task::status(&ctx, &project, &task_id)
            }
            TaskCommands::List { project } => command::list::run(&ctx, &project),
            TaskCommands::Exec {
                project,
                task_id,
                command,
            } => command::task::exec(&ctx, &project, &task_id, &command),
        },
        Commands::Build {
            project,
            scope,
            dev,
        } => command::build::run(&ctx, &project, scope, dev),
        Commands::GateSync { project, force } => command::gate::sync(&ctx, &project, force),
        Commands::GateStatus { project } => command::gate::status(&ctx, &project),
    }
}
