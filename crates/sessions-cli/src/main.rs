use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;
mod util;

use commands::delegation::{run_complete, run_delegate};
use commands::hook::{run_pre_tool_use, run_session_start, run_user_prompt};
use commands::mode::{run_mode_set, run_mode_show};
use commands::status::run_status;
use commands::task::{run_task_bind, run_task_show, run_task_unbind};

#[derive(Parser)]
#[command(name = "sessions")]
#[command(about = "Workflow enforcement and context handoff for coding agents", long_about = None)]
struct Cli {
    /// Workspace root (defaults to the current directory).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Enable verbose logging to stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host hook entry points: JSON on stdin, JSON on stdout.
    Hook {
        #[command(subcommand)]
        command: HookCmd,
    },
    /// Show or set the session mode.
    Mode {
        #[command(subcommand)]
        command: ModeCmd,
    },
    /// Manage the task binding.
    Task {
        #[command(subcommand)]
        command: TaskCmd,
    },
    /// Hand a transcript off to a sub-agent: chunk it and raise the isolation flag.
    Delegate(DelegateArgs),
    /// Mark a delegation finished and release its isolation flag.
    Complete(CompleteArgs),
    /// Current mode, task binding, and delegation overview.
    Status,
}

#[derive(Subcommand)]
enum HookCmd {
    /// Gate a tool invocation. Exit code 2 signals a block to the host.
    PreToolUse,
    /// Scan submitted user text for mode trigger phrases.
    UserPrompt,
    /// Emit session-start context for prompt injection.
    SessionStart,
}

#[derive(Subcommand)]
enum ModeCmd {
    Show,
    Set(ModeSetArgs),
}

#[derive(Args)]
struct ModeSetArgs {
    /// Target mode: discussion or implementation.
    mode: String,
}

#[derive(Subcommand)]
enum TaskCmd {
    Bind(TaskBindArgs),
    Unbind,
    Show,
}

#[derive(Args)]
struct TaskBindArgs {
    /// Task identifier.
    #[arg(long)]
    task: String,
    /// Branch the task is pinned to.
    #[arg(long)]
    branch: String,
    /// Module the task may touch (repeatable).
    #[arg(long = "module")]
    modules: Vec<String>,
}

#[derive(Args)]
struct DelegateArgs {
    /// Agent kind receiving the handoff.
    #[arg(long)]
    agent: String,
}

#[derive(Args)]
struct CompleteArgs {
    /// Agent kind whose delegation finished.
    #[arg(long)]
    agent: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = match &cli.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Hook { command } => match command {
            HookCmd::PreToolUse => run_pre_tool_use(&workspace, cli.verbose),
            HookCmd::UserPrompt => run_user_prompt(&workspace, cli.verbose),
            HookCmd::SessionStart => run_session_start(&workspace, cli.verbose),
        },
        Commands::Mode { command } => match command {
            ModeCmd::Show => run_mode_show(&workspace),
            ModeCmd::Set(args) => run_mode_set(&workspace, &args.mode, cli.verbose),
        },
        Commands::Task { command } => match command {
            TaskCmd::Bind(args) => run_task_bind(&workspace, args, cli.verbose),
            TaskCmd::Unbind => run_task_unbind(&workspace, cli.verbose),
            TaskCmd::Show => run_task_show(&workspace),
        },
        Commands::Delegate(args) => run_delegate(&workspace, &args.agent, cli.verbose),
        Commands::Complete(args) => run_complete(&workspace, &args.agent, cli.verbose),
        Commands::Status => run_status(&workspace),
    }
}
