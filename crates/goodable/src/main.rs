use std::env;
use std::fs;
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context as _};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use directories::BaseDirs;
use goodable::client::Client;
use goodable::{config_store, daemon, hooks};
use goodable_core::config::DEFAULT_BIND_ADDR;
use goodable_core::paths::{compute_paths, GoodablePaths, PathInputs};
use goodable_protocol::{ActRequest, ApprovePlanRequest};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "goodable",
    version,
    about = "Goodable: run coding agents with human-approved tool use and plans"
)]
struct Cli {
    #[arg(long, global = true, value_name = "DIR", env = "GOODABLE_DIR")]
    goodable_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "URL", env = "GOODABLE_URL")]
    server_url: Option<String>,

    #[arg(long, global = true, env = "GOODABLE_LOG", value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server in the foreground.
    Server {
        /// Address to listen on, e.g. 127.0.0.1:8787 or :8787.
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },
    /// Start a request in a project.
    Act {
        project: String,
        instruction: Vec<String>,
        #[arg(long)]
        cli: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Have the agent plan first and wait for approval.
        #[arg(long)]
        plan: bool,
        #[arg(long, value_name = "MODE")]
        permission_mode: Option<String>,
    },
    Request {
        #[command(subcommand)]
        command: RequestCommand,
    },
    Permission {
        #[command(subcommand)]
        command: PermissionCommand,
    },
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },
    /// Stop a running request.
    Interrupt { project: String, request_id: String },
    /// Report whether the server is reachable.
    Status,
    Version,
    Completion {
        #[command(subcommand)]
        command: CompletionCommand,
    },
    #[command(hide = true)]
    Hook {
        #[command(subcommand)]
        command: HookCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RequestCommand {
    List { project: String },
    Show { project: String, request_id: String },
}

#[derive(Subcommand, Debug)]
enum PermissionCommand {
    List {
        project: String,
    },
    Respond {
        permission_id: String,
        #[arg(long, conflicts_with = "deny")]
        approve: bool,
        #[arg(long)]
        deny: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PlanCommand {
    Approve {
        project: String,
        request_id: String,
        /// Send the plan back with a change instead of approving it as is.
        #[arg(long, conflicts_with = "reject")]
        modification: Option<String>,
        #[arg(long)]
        reject: bool,
    },
}

#[derive(Subcommand, Debug)]
enum HookCommand {
    PreToolUse,
}

#[derive(Subcommand, Debug)]
enum CompletionCommand {
    Bash,
    Fish,
    Powershell,
    Zsh,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = resolve_paths(cli.goodable_dir.as_ref())?;
    // Hook stdout/stderr belong to the agent CLI.
    let enable_stderr_logging = !matches!(cli.command, Command::Hook { .. });
    let config_level = config_store::load(&paths)
        .await
        .ok()
        .and_then(|cfg| cfg.log_level)
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty());
    init_logging(
        &paths,
        cli.log_level.as_deref(),
        config_level,
        enable_stderr_logging,
    )?;

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "goodable starting");

    dispatch(cli.command, &paths, cli.server_url.as_deref()).await
}

fn resolve_paths(goodable_dir_override: Option<&PathBuf>) -> anyhow::Result<GoodablePaths> {
    let base_dirs = BaseDirs::new().ok_or_else(|| anyhow!("could not determine home directory"))?;
    let home_dir = base_dirs.home_dir().to_path_buf();

    let xdg_config_home = match env::var_os("XDG_CONFIG_HOME") {
        Some(v) => Some(PathBuf::from(v)),
        None => Some(base_dirs.config_dir().to_path_buf()),
    };

    let goodable_dir_override = goodable_dir_override
        .cloned()
        .or_else(|| env::var_os("GOODABLE_DIR").map(PathBuf::from));

    Ok(compute_paths(PathInputs {
        home_dir,
        xdg_config_home,
        goodable_dir_override,
    }))
}

fn init_logging(
    paths: &GoodablePaths,
    log_level: Option<&str>,
    config_level: Option<String>,
    enable_stderr_logging: bool,
) -> anyhow::Result<()> {
    let dir_ok = fs::create_dir_all(&paths.base_dir).is_ok();

    let env_level = env::var("RUST_LOG").ok();
    let level = log_level
        .map(str::to_owned)
        .or_else(|| env::var("GOODABLE_LOG").ok())
        .or(env_level)
        .or(config_level)
        .unwrap_or_else(|| "info".to_owned());

    let filter = EnvFilter::try_new(level).context("parse log level")?;

    let file_layer = if dir_ok {
        tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::NEVER)
            .filename_prefix("goodable")
            .filename_suffix("log")
            .build(&paths.base_dir)
            .ok()
            .map(|file_appender| {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(file_appender)
            })
    } else {
        None
    };

    if enable_stderr_logging {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_writer(io::stderr);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();
    }

    Ok(())
}

async fn dispatch(
    command: Command,
    paths: &GoodablePaths,
    server_url: Option<&str>,
) -> anyhow::Result<()> {
    match command {
        Command::Server { bind } => daemon::run_foreground(paths, bind).await,
        Command::Status => status(server_url).await,
        Command::Version => version(),
        Command::Completion { command } => completion(command),
        Command::Hook { command } => match command {
            HookCommand::PreToolUse => hooks::handle_pre_tool_use(server_url).await,
        },
        Command::Act {
            project,
            instruction,
            cli,
            model,
            plan,
            permission_mode,
        } => {
            let instruction = instruction.join(" ");
            if instruction.trim().is_empty() {
                return Err(anyhow!("instruction is required"));
            }
            let resp = client(server_url)?
                .act(
                    &project,
                    &ActRequest {
                        instruction,
                        cli_preference: cli,
                        model,
                        plan_mode: plan,
                        permission_mode,
                    },
                )
                .await?;
            println!("{}", resp.request_id);
            Ok(())
        }
        Command::Request { command } => match command {
            RequestCommand::List { project } => {
                let resp = client(server_url)?.request_list(&project).await?;
                if resp.requests.is_empty() {
                    println!("No requests");
                    return Ok(());
                }
                for r in resp.requests {
                    println!("{}\t{}\t{}", r.id, r.status, r.instruction);
                }
                Ok(())
            }
            RequestCommand::Show {
                project,
                request_id,
            } => {
                let r = client(server_url)?
                    .request_show(&project, &request_id)
                    .await?;
                println!("{}\t{}\t{}\t{}", r.id, r.status, r.cli_preference, r.permission_mode);
                if let Some(session_id) = r.session_id.as_deref() {
                    println!("session\t{session_id}");
                }
                if let Some(message) = r.error_message.as_deref() {
                    println!("error\t{message}");
                }
                Ok(())
            }
        },
        Command::Permission { command } => dispatch_permission(command, server_url).await,
        Command::Plan { command } => match command {
            PlanCommand::Approve {
                project,
                request_id,
                modification,
                reject,
            } => {
                let approve = !reject && modification.is_none();
                let resp = client(server_url)?
                    .approve_plan(
                        &project,
                        &ApprovePlanRequest {
                            request_id,
                            approve,
                            modification,
                        },
                    )
                    .await?;
                println!("{}\t{}", resp.request_id, resp.status);
                Ok(())
            }
        },
        Command::Interrupt {
            project,
            request_id,
        } => {
            let resp = client(server_url)?.interrupt(&project, &request_id).await?;
            if resp.interrupted {
                println!("interrupted");
            } else {
                println!("scheduled");
            }
            Ok(())
        }
    }
}

async fn dispatch_permission(
    command: PermissionCommand,
    server_url: Option<&str>,
) -> anyhow::Result<()> {
    match command {
        PermissionCommand::List { project } => {
            let resp = client(server_url)?.permission_list(&project).await?;
            if resp.permissions.is_empty() {
                println!("No pending permissions");
                return Ok(());
            }
            for p in resp.permissions {
                println!(
                    "{}\t{}\t{}\t{}",
                    p.id, p.request_id, p.tool_name, p.input_preview
                );
            }
            Ok(())
        }
        PermissionCommand::Respond {
            permission_id,
            approve,
            deny,
        } => {
            if approve == deny {
                return Err(anyhow!("pass exactly one of --approve or --deny"));
            }
            client(server_url)?
                .permission_confirm(&permission_id, approve)
                .await?;
            println!("ok");
            Ok(())
        }
    }
}

fn client(server_url: Option<&str>) -> anyhow::Result<Client> {
    let fallback = format!("http://{DEFAULT_BIND_ADDR}");
    Client::new(server_url.unwrap_or(&fallback))
}

async fn status(server_url: Option<&str>) -> anyhow::Result<()> {
    let client = client(server_url)?;
    match client.health().await {
        Ok(health) => println!("running\tversion={}", health.version),
        Err(err) => {
            tracing::debug!(error = %format!("{err:#}"), "health check failed");
            println!("stopped");
        }
    }
    Ok(())
}

fn version() -> anyhow::Result<()> {
    println!("{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn completion(command: CompletionCommand) -> anyhow::Result<()> {
    let shell = match command {
        CompletionCommand::Bash => Shell::Bash,
        CompletionCommand::Fish => Shell::Fish,
        CompletionCommand::Powershell => Shell::PowerShell,
        CompletionCommand::Zsh => Shell::Zsh,
    };

    let mut cmd = Cli::command();
    let mut buf = Vec::new();
    generate(shell, &mut cmd, "goodable", &mut buf);
    match io::stdout().write_all(&buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err).context("write completion script to stdout"),
    }
}
