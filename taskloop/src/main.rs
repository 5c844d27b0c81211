//! `taskloop`: work through a Markdown TODO list with AI coding backends.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use taskloop::exit_codes;
use taskloop::io::backend::build_backends;
use taskloop::io::config::{FALLBACK_ORDER_ENV, RunConfig, load_config};
use taskloop::io::dod::{CommandValidator, ValidationRequest, Validator};
use taskloop::io::init::{InitOptions, TaskloopPaths, init_workspace};
use taskloop::io::interrupt::{CancelToken, install_ctrl_c};
use taskloop::logging;
use taskloop::looping::{LoopOptions, LoopStop, RunHalt, next_pending, run_loop};
use taskloop::step::{StepOutcome, StepResult};

#[derive(Parser)]
#[command(
    name = "taskloop",
    version,
    about = "Validated, resumable TODO-list execution with AI coding backends"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.taskloop/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Execute pending tasks until the list is done or a limit is hit.
    Run {
        /// TODO file relative to the workspace root.
        #[arg(long)]
        todo_file: Option<PathBuf>,
        /// Backend to try first (the rest keep their fallback order).
        #[arg(long)]
        backend: Option<String>,
        /// Per-call timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Stop after starting this many tasks.
        #[arg(long)]
        max_tasks: Option<u32>,
        /// Accept completions without running the DoD gate.
        #[arg(long)]
        skip_dod: bool,
        /// Do not echo agent output while it runs.
        #[arg(long)]
        no_stream: bool,
        /// Ignore saved run state and start a new run.
        #[arg(long)]
        fresh: bool,
    },
    /// Print the next pending task.
    Next {
        #[arg(long)]
        todo_file: Option<PathBuf>,
    },
    /// Validate the config, preflight every backend, and run the DoD checks once.
    Check,
}

fn main() {
    let cli = Cli::parse();
    let default_directive = match cli.command {
        Command::Run { .. } => "taskloop=info",
        _ => "warn",
    };
    logging::init(default_directive);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<RunHalt>() {
        Some(RunHalt::BackendsExhausted { .. }) => exit_codes::HALTED,
        Some(RunHalt::Interrupted { .. }) => exit_codes::INTERRUPTED,
        Some(RunHalt::Configuration(_)) | None => exit_codes::INVALID,
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run {
            todo_file,
            backend,
            timeout,
            max_tasks,
            skip_dod,
            no_stream,
            fresh,
        } => {
            let mut config = load_run_config(&root)?;
            if let Some(todo_file) = todo_file {
                config.todo_file = todo_file;
            }
            if let Some(timeout) = timeout {
                config.timeout_secs = timeout;
            }
            if no_stream {
                config.stream = false;
            }
            let env_order = env::var(FALLBACK_ORDER_ENV).ok();
            config
                .apply_backend_overrides(env_order.as_deref(), backend.as_deref())
                .map_err(|err| RunHalt::Configuration(format!("{err:#}")))?;
            config
                .validate()
                .map_err(|err| RunHalt::Configuration(format!("{err:#}")))?;
            cmd_run(
                &root,
                &config,
                &LoopOptions {
                    max_tasks,
                    skip_dod,
                    fresh,
                },
            )
        }
        Command::Next { todo_file } => {
            let mut config = load_run_config(&root)?;
            if let Some(todo_file) = todo_file {
                config.todo_file = todo_file;
            }
            cmd_next(&root, &config)
        }
        Command::Check => cmd_check(&root),
    }
}

fn load_run_config(root: &Path) -> Result<RunConfig> {
    let paths = TaskloopPaths::new(root);
    load_config(&paths.config_path).map_err(|err| RunHalt::Configuration(format!("{err:#}")).into())
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("initialized {}", paths.taskloop_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, config: &RunConfig, options: &LoopOptions) -> Result<i32> {
    let token = CancelToken::new();
    install_ctrl_c(token.clone())?;
    let backends =
        build_backends(config).map_err(|err| RunHalt::Configuration(format!("{err:#}")))?;
    let validator = CommandValidator::new(root, &config.dod, config.output_limit_bytes);
    debug!(order = %config.fallback_order.join(","), "starting run");

    let outcome = run_loop(root, config, backends, &validator, token, options, print_step)?;

    println!(
        "run {}: {} done, {} escalated, {} failed",
        outcome.run_id,
        outcome.done.len(),
        outcome.escalated.len(),
        outcome.failed.len()
    );
    if let LoopStop::MaxTasksReached { max_tasks } = outcome.stop {
        println!("stopped after {max_tasks} task(s); run again to continue");
    }
    if outcome.has_unfinished() {
        return Ok(exit_codes::INCOMPLETE);
    }
    Ok(exit_codes::OK)
}

fn print_step(step: &StepOutcome) {
    let what = match &step.result {
        StepResult::Done { backend } => format!("done via {backend}"),
        StepResult::Retry { attempt } => format!("retrying (attempt {})", attempt + 1),
        StepResult::NewApproach { approach } => format!("new approach ({})", approach + 1),
        StepResult::Escalated => "escalated".to_string(),
        StepResult::Failed => "failed".to_string(),
    };
    println!("task {} attempt {}: {what}", step.task_id, step.attempt_number);
}

fn cmd_next(root: &Path, config: &RunConfig) -> Result<i32> {
    match next_pending(root, config)? {
        Some(item) => {
            println!("{}: {}", item.id, item.description);
            Ok(exit_codes::OK)
        }
        None => Ok(exit_codes::COMPLETE),
    }
}

fn cmd_check(root: &Path) -> Result<i32> {
    let mut config = load_run_config(root)?;
    let env_order = env::var(FALLBACK_ORDER_ENV).ok();
    config
        .apply_backend_overrides(env_order.as_deref(), None)
        .map_err(|err| RunHalt::Configuration(format!("{err:#}")))?;
    config
        .validate()
        .map_err(|err| RunHalt::Configuration(format!("{err:#}")))?;

    let backends =
        build_backends(&config).map_err(|err| RunHalt::Configuration(format!("{err:#}")))?;
    let mut usable = 0usize;
    for backend in &backends {
        match backend.preflight() {
            Ok(()) => {
                usable += 1;
                println!("{}: ok", backend.name());
            }
            Err(reason) => println!("{}: unavailable ({reason})", backend.name()),
        }
    }
    if usable == 0 {
        return Err(RunHalt::Configuration("no usable backend".to_string()).into());
    }

    let paths = TaskloopPaths::new(root);
    let log_path = paths.logs_dir.join("dod.log");
    let validator = CommandValidator::new(root, &config.dod, config.output_limit_bytes);
    let token = CancelToken::new();
    let result = validator.validate(&ValidationRequest {
        workdir: root,
        task_id: "check",
        backend: "none",
        log_path: &log_path,
        token: &token,
    })?;
    if result.passed {
        println!("dod: ok ({} checks)", result.checks_run.len());
        return Ok(exit_codes::OK);
    }
    println!("dod: failed\n{}", result.failure_context().trim_end());
    Ok(exit_codes::INCOMPLETE)
}
