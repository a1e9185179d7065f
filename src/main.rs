// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Foreman main entry point - CLI and daemons.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;

use foreman::config::{self, CliOptions, ResolvedConfig};
use foreman::process::shutdown_signal;
use foreman::queue::{QueueItem, QueueStatus, QueueStore};
use foreman::router::{route, Intent};
use foreman::supervisor::{
    ping_socket, run_supervisor, ExecutableLauncher, ProcessSpec, SupervisorClient, SupervisorRun,
    SupervisorSettings,
};
use foreman::telemetry::{init_telemetry, TelemetryConfig};
use foreman::worker::{BackgroundWorker, CycleOutcome};

/// Foreman version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Foreman - route prompts into isolated container jobs.
#[derive(Parser)]
#[command(name = "foreman")]
#[command(author, version, about = "Route prompts into isolated container jobs", long_about = None)]
struct Cli {
    /// State directory (default: ~/.foreman)
    #[arg(long, global = true, env = "FOREMAN_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Container runtime binary
    #[arg(long, global = true, env = "FOREMAN_RUNTIME")]
    runtime: Option<String>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands for foreman.
#[derive(Subcommand)]
enum Commands {
    /// Add a prompt to the queue
    Enqueue {
        /// Prompt text
        #[arg(required = true, trailing_var_arg = true)]
        prompt: Vec<String>,
        /// Print the queued item as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show queued, running and finished items
    Queue {
        /// Print items as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show how a prompt would be routed
    Route {
        #[arg(required = true, trailing_var_arg = true)]
        prompt: Vec<String>,
    },

    /// Run the background worker
    Worker {
        /// Process at most one item and exit
        #[arg(long)]
        once: bool,
        /// Poll interval in milliseconds
        #[arg(long)]
        poll_interval_ms: Option<u64>,
        /// Concurrent jobs per batch (0 = unbounded)
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Process supervisor daemon
    Supervisor {
        #[command(subcommand)]
        action: SupervisorAction,
    },

    /// Manage supervised processes (starts the supervisor if needed)
    Proc {
        #[command(subcommand)]
        action: ProcAction,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Initialize a new configuration file
    Init,

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum SupervisorAction {
    /// Run the supervisor in the foreground
    Run,
    /// Check whether a supervisor is answering
    Ping,
}

#[derive(Subcommand)]
enum ProcAction {
    /// Start a named process
    Start {
        name: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
        /// Working directory
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Extra environment, KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
    },
    /// Stop a named process
    Stop {
        name: String,
        /// Grace period before SIGKILL
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Show process liveness
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print the persisted session
    Session,
}

/// Config subcommand actions.
#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let daemon = matches!(
        cli.command,
        Commands::Worker { once: false, .. }
            | Commands::Supervisor {
                action: SupervisorAction::Run
            }
    );
    let telemetry = if daemon {
        TelemetryConfig::daemon(cli.verbose, cli.debug)
    } else {
        TelemetryConfig::from_verbosity(cli.verbose, cli.debug)
    };
    let _guard = init_telemetry(&telemetry)?;

    let cli_options = CliOptions {
        state_dir: cli.state_dir.clone(),
        runtime: cli.runtime.clone(),
        ..Default::default()
    };

    handle_command(cli.command, cli_options).await
}

fn load(cli_options: CliOptions) -> anyhow::Result<ResolvedConfig> {
    let cwd = std::env::current_dir()?;
    let workspace_root = config::find_workspace_root(&cwd).unwrap_or(cwd);
    config::load_config(&workspace_root, cli_options).context("loading configuration")
}

fn open_store(config: &ResolvedConfig) -> QueueStore {
    QueueStore::new(config.state_paths()).with_history_limit(config.queue.history_limit)
}

async fn handle_command(command: Commands, mut cli_options: CliOptions) -> anyhow::Result<()> {
    match command {
        Commands::Enqueue { prompt, json } => {
            let config = load(cli_options)?;
            let item = open_store(&config).enqueue(&prompt.join(" "))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&item)?);
            } else {
                println!("{} {}", "Queued".green().bold(), item.id);
            }
        }
        Commands::Queue { json } => {
            let config = load(cli_options)?;
            let store = open_store(&config);
            let items = store.list();
            if json {
                let payload = serde_json::json!({ "runState": store.run_state(), "items": items });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_queue(&items);
            }
        }
        Commands::Route { prompt } => {
            let intent = route(&prompt.join(" "));
            match &intent {
                Intent::ExplicitIssueKeys { keys } => {
                    println!("{} {}", "explicit".cyan().bold(), keys.join(", "))
                }
                Intent::ImplicitQuery { kind } => println!("{} {}", "query".cyan().bold(), kind),
                Intent::Unrecognized => println!("{}", "unrecognized".yellow().bold()),
            }
        }
        Commands::Worker {
            once,
            poll_interval_ms,
            concurrency,
        } => {
            cli_options.poll_interval_ms = poll_interval_ms;
            cli_options.batch_concurrency = concurrency;
            let config = load(cli_options)?;
            let worker = BackgroundWorker::from_config(&config);
            if once {
                print_outcome(&worker.run_once().await?);
            } else {
                worker.run(shutdown_signal()).await?;
            }
        }
        Commands::Supervisor { action } => {
            let config = load(cli_options)?;
            let paths = config.state_paths();
            let settings = SupervisorSettings::from(&config);
            match action {
                SupervisorAction::Run => match run_supervisor(&paths, settings, shutdown_signal()).await? {
                    SupervisorRun::Served => {}
                    SupervisorRun::AlreadyRunning { pid } => {
                        println!("Supervisor already running (pid {pid})");
                    }
                },
                SupervisorAction::Ping => {
                    let reply = ping_socket(&paths, settings.request_timeout)
                        .await
                        .context("supervisor is not running")?;
                    println!("{} pid {}", "alive".green().bold(), reply.pid);
                }
            }
        }
        Commands::Proc { action } => {
            let config = load(cli_options)?;
            handle_proc(&config, action).await?;
        }
        Commands::Config { action } => match action {
            Some(ConfigAction::Show) | None => {
                let config = load(cli_options)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        },
        Commands::Init => {
            let workspace_root = std::env::current_dir()?;
            let path = config::init_config(&workspace_root, None)?;
            println!("Created config file: {}", path.display());
        }
        Commands::Version => {
            println!("foreman {}", VERSION);
        }
    }
    Ok(())
}

async fn handle_proc(config: &ResolvedConfig, action: ProcAction) -> anyhow::Result<()> {
    let paths = config.state_paths();
    let settings = SupervisorSettings::from(config);
    let launcher = ExecutableLauncher::current()?;
    let client = SupervisorClient::ensure_running(&paths, &settings, &launcher).await?;

    match action {
        ProcAction::Start {
            name,
            command,
            cwd,
            env,
        } => {
            let Some((program, args)) = command.split_first() else {
                anyhow::bail!("missing command");
            };
            let spec = ProcessSpec {
                name,
                command: program.clone(),
                args: args.to_vec(),
                cwd,
                env: env.into_iter().collect::<BTreeMap<_, _>>(),
            };
            let record = client.start(&spec).await?;
            println!(
                "{} {} (pid {})",
                "Started".green().bold(),
                record.name,
                record.pid
            );
            println!("  stdout: {}", record.out_log_path.display());
            println!("  stderr: {}", record.err_log_path.display());
        }
        ProcAction::Stop { name, timeout_ms } => {
            let stopped = client.stop(&name, timeout_ms.map(Duration::from_millis)).await?;
            if stopped {
                println!("{} {}", "Stopped".green().bold(), name);
            } else {
                println!("{} {} was not running", "Removed".yellow().bold(), name);
            }
        }
        ProcAction::Status { json } => {
            let status = client.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else if status.is_empty() {
                println!("{}", "No supervised processes".dimmed());
            } else {
                for row in status {
                    let state = if row.running {
                        "running".green()
                    } else {
                        "exited".red()
                    };
                    println!("{:<24} {:>8} {}", row.name, row.pid, state);
                }
            }
        }
        ProcAction::Session => {
            let session = client.read_session().await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
    }
    Ok(())
}

fn print_queue(items: &[QueueItem]) {
    if items.is_empty() {
        println!("{}", "Queue is empty".dimmed());
        return;
    }
    for item in items {
        let status = match item.status {
            QueueStatus::Queued => item.status.as_str().normal(),
            QueueStatus::Processing => item.status.as_str().cyan().bold(),
            QueueStatus::Done => item.status.as_str().green(),
            QueueStatus::Failed => item.status.as_str().red(),
        };
        let prompt: String = item.prompt.chars().take(60).collect();
        println!("{} {:<10} {}", item.id.dimmed(), status, prompt);
        if let Some(error) = &item.error {
            println!("    {}", error.red());
        }
    }
}

fn print_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Idle => println!("{}", "Nothing to do".dimmed()),
        CycleOutcome::Done { id, .. } if outcome.is_indeterminate() => {
            println!("{} {} (outcome indeterminate)", "Done".yellow().bold(), id)
        }
        CycleOutcome::Done { id, .. } => println!("{} {}", "Done".green().bold(), id),
        CycleOutcome::Failed { id, error } => {
            println!("{} {}: {}", "Failed".red().bold(), id, error)
        }
    }
}
