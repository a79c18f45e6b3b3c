use clap::{Parser, Subcommand};
use cligate::request::{Actor, ExecutionRequest, Role};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "cligate")]
#[command(about = "Gate a command-line tool behind a whitelist, rate limits and an audit trail", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config.json and an example commands.json).
    Init {
        /// Config file path (default: CLIGATE_CONFIG_PATH or ~/.cligate/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway (HTTP + WebSocket control plane).
    Serve {
        /// Config file path (default: CLIGATE_CONFIG_PATH or ~/.cligate/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// WebSocket and HTTP port (default from config or 15151)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Load the config and registry, report problems, and list permitted commands.
    Check {
        /// Config file path (default: CLIGATE_CONFIG_PATH or ~/.cligate/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run one request through the full pipeline in-process and print the response as JSON.
    Run {
        /// Config file path (default: CLIGATE_CONFIG_PATH or ~/.cligate/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Actor id recorded in the audit trail.
        #[arg(long, default_value = "local")]
        actor: String,

        /// Actor role: viewer, operator or admin.
        #[arg(long, default_value = "viewer")]
        role: Role,

        /// Registered command name.
        command: String,

        /// Arguments appended after the command's fixed arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Audit trail tools.
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Re-hash the audit log and report the first broken line, if any.
    Verify {
        /// Config file path (default: CLIGATE_CONFIG_PATH or ~/.cligate/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Audit log to verify (default: audit.path from config)
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("cligate {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Check { config }) => {
            if let Err(e) = run_check(config) {
                log::error!("check failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run {
            config,
            actor,
            role,
            command,
            args,
        }) => match run_once(config, Actor::new(actor, role), command, args).await {
            Ok(true) => {}
            Ok(false) => std::process::exit(2),
            Err(e) => {
                log::error!("run failed: {:#}", e);
                std::process::exit(1);
            }
        },
        Some(Commands::Audit {
            action: AuditAction::Verify { config, file },
        }) => {
            if let Err(e) = run_audit_verify(config, file) {
                log::error!("audit verify failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(cligate::config::default_config_path);
    let dir = cligate::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_serve(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = cligate::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting gateway on {}:{}",
        config.gateway.bind,
        config.gateway.port
    );
    cligate::gateway::run_gateway(config, path).await
}

fn run_check(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = cligate::config::load_config(config_path)?;
    let deny = cligate::validator::DenyList::from_config(&config.validator);
    let registry = cligate::registry::load_registry(&config, &path, &deny)?;
    println!("config: {}", path.display());
    println!(
        "audit log: {}",
        cligate::config::resolve_audit_path(&config, &path).display()
    );
    println!("deny patterns: {:?}", deny.patterns());
    println!("{} command(s):", registry.len());
    for spec in registry.iter() {
        println!(
            "  {:<20} min role {:<8} timeout {:>6}ms{}  {} {}",
            spec.name,
            spec.min_role,
            spec.timeout.as_millis(),
            if spec.streaming { " streaming" } else { "" },
            spec.binary,
            spec.fixed_args.join(" ")
        );
    }
    Ok(())
}

/// Returns whether the command completed successfully.
async fn run_once(
    config_path: Option<PathBuf>,
    actor: Actor,
    command: String,
    args: Vec<String>,
) -> anyhow::Result<bool> {
    let (config, path) = cligate::config::load_config(config_path)?;
    let gate = cligate::gate::CommandGate::from_config(&config, &path).await?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let result = gate
        .execute(ExecutionRequest::new(actor, command, args), &cancel, None)
        .await;
    on_ctrl_c.abort();
    gate.shutdown().await;

    let response = result.to_response();
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(response.ok)
}

fn run_audit_verify(config_path: Option<PathBuf>, file: Option<PathBuf>) -> anyhow::Result<()> {
    let file = match file {
        Some(f) => f,
        None => {
            let (config, path) = cligate::config::load_config(config_path)?;
            cligate::config::resolve_audit_path(&config, &path)
        }
    };
    let report = cligate::audit::verify_chain(&file)
        .map_err(|e| anyhow::anyhow!("{}: {}", file.display(), e))?;
    match report.tip {
        Some(tip) => println!(
            "{}: {} event(s), chain intact, last seq {} hash {}",
            file.display(),
            report.events,
            tip.seq,
            tip.hash
        ),
        None => println!("{}: empty", file.display()),
    }
    Ok(())
}
