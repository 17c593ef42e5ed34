//! Operator tool: manages processes in the SQLite registry and sends process
//! commands to devices.
//!
//! ```bash
//! greenbeectl process start "Estufa 3"
//! greenbeectl command iniciar --retain
//! greenbeectl process list
//! greenbeectl process end 1
//! ```

use std::{error::Error, path::PathBuf, process};

use clap::{Parser, Subcommand, ValueEnum};
use greenbee::{
    config::Config,
    core::{
        model::{Process, ProcessId},
        protocol::ProcessCommand,
        publisher::send_process_command,
        registry::{ProcessAdmin, SqliteRegistry},
    },
    logger::LoggerManager,
    print_error, print_info,
};
use greenbee_mqtt::Session;
use time::format_description::well_known::Rfc3339;

#[derive(Parser, Debug)]
#[command(name = "greenbeectl")]
#[command(about = "Administration tool for the greenbee service", long_about = None)]
struct Args {
    /// Configuration file; `GREENBEE_CONFIG` or built-in defaults otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite registry path, overrides `[registry] path`
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage processes
    Process {
        #[command(subcommand)]
        action: ProcessAction,
    },
    /// Publish a process command to the devices
    Command {
        #[arg(value_enum)]
        command: CommandArg,

        /// Keep the command on the broker for devices connecting later
        #[arg(long)]
        retain: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ProcessAction {
    /// Create a new active process
    Start { name: String },
    /// Mark a process as ended
    End { id: ProcessId },
    /// List every process
    List,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum CommandArg {
    Iniciar,
    Finalizar,
}

impl From<CommandArg> for ProcessCommand {
    fn from(arg: CommandArg) -> Self {
        match arg {
            CommandArg::Iniciar => ProcessCommand::Start,
            CommandArg::Finalizar => ProcessCommand::Finish,
        }
    }
}

fn load_config(args: &Args) -> Config {
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None if std::env::var_os(greenbee::config::CONFIG_ENV).is_some() => Config::new(),
        None => Ok(Config::default()),
    };
    let mut cfg = loaded.unwrap_or_else(|e| {
        print_error!("{}", e);
        process::exit(1);
    });
    if let Some(db) = &args.db {
        cfg.registry.path = db.clone();
    }
    cfg.logger.level = if args.verbose { "debug" } else { "warn" }.to_string();
    cfg
}

fn describe(process: &Process) -> String {
    let started = process
        .started_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| process.started_at.to_string());
    let ended = match process.ended_at {
        Some(at) => at.format(&Rfc3339).unwrap_or_else(|_| at.to_string()),
        None => "active".to_string(),
    };
    format!("{:>5}  {:<24}  {:<30}  {}", process.id, process.name, started, ended)
}

type CtlResult = Result<(), Box<dyn Error + Send + Sync>>;

async fn run_process(cfg: &Config, action: ProcessAction) -> CtlResult {
    let registry = SqliteRegistry::open(&cfg.registry.path)?;
    match action {
        ProcessAction::Start { name } => {
            let process = registry.create_process(&name).await?;
            print_info!("Created process {} ('{}')", process.id, process.name);
        }
        ProcessAction::End { id } => {
            let process = registry.end_process(id).await?;
            print_info!("Ended process {} ('{}')", process.id, process.name);
        }
        ProcessAction::List => {
            println!("{:>5}  {:<24}  {:<30}  {}", "ID", "NAME", "STARTED", "ENDED");
            for process in registry.list_processes().await? {
                println!("{}", describe(&process));
            }
        }
    }
    Ok(())
}

async fn run_command(cfg: &Config, command: ProcessCommand, retain: bool) -> CtlResult {
    let mut session = Session::connect(&cfg.transport.with_client_suffix("ctl")).await?;
    let sent = send_process_command(&session.handle(), &cfg.topics, command, retain).await;
    session.disconnect().await?;
    sent?;
    print_info!("Sent '{}' on {}", command, cfg.topics.process);
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let cfg = load_config(&args);
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    if let Err(e) = logger_manager.init() {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    }

    let result = match args.command {
        Commands::Process { action } => run_process(&cfg, action).await,
        Commands::Command { command, retain } => run_command(&cfg, command.into(), retain).await,
    };
    if let Err(e) = result {
        print_error!("{}", e);
        process::exit(1);
    }
}
