//! vaultkeep - log on to CyberArk PasswordVault once and stay logged on.
//!
//! Without a subcommand this runs the full flow: reuse or refresh the
//! session token, (re)start the keepalive watchdog, and refresh the SSH key.

mod commands;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vaultkeep_core::config::Config;
use vaultkeep_core::keepalive::WatchdogArgs;
use vaultkeep_core::utils::create_private_dir;

/// Diagnostic log in the install root
const LOG_FILE: &str = "vaultkeep.log";

#[derive(Parser)]
#[command(name = "vaultkeep")]
#[command(author, version, about = "Log on to CyberArk once and keep the session alive", long_about = None)]
struct Cli {
    /// Vault host (overrides config)
    #[arg(long)]
    endpoint: Option<String>,

    /// Vault username (overrides config and VAULTKEEP_USERNAME)
    #[arg(long)]
    username: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log on if needed, start the keepalive and refresh the SSH key (default)
    Up {
        /// Store the password in the OS keychain after a successful logon
        #[arg(long)]
        save_password: bool,
    },

    /// Authenticate and store a fresh session token
    Login {
        /// Store the password in the OS keychain after a successful logon
        #[arg(long)]
        save_password: bool,
    },

    /// Check whether the stored session token is still accepted
    Check,

    /// Stop the keepalive, log off and delete the session token
    Logoff {
        /// Also remove the saved password from the OS keychain
        #[arg(long)]
        forget_password: bool,
    },

    /// Download the SSH key if the cached one is missing or stale
    SshKey {
        /// Download even if the cached key is still fresh
        #[arg(long)]
        force: bool,
    },

    /// Manage the keepalive watchdog
    Keepalive {
        #[command(subcommand)]
        action: KeepaliveAction,
    },
}

#[derive(Subcommand)]
enum KeepaliveAction {
    /// (Re)start the watchdog with a fresh hard timeout
    Start,
    /// Stop the running watchdog
    Stop,
    /// Show whether a watchdog is running
    Status,
    /// Watchdog process entry point
    #[command(hide = true)]
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    endpoint: String,
    /// RFC 3339 timestamp at which the watchdog exits
    #[arg(long, value_parser = parse_deadline)]
    deadline: DateTime<Utc>,
    #[arg(long)]
    min_interval: u64,
    #[arg(long)]
    max_interval: u64,
    #[arg(long)]
    token_path: PathBuf,
    #[arg(long)]
    log_path: PathBuf,
    #[arg(long)]
    pid_path: PathBuf,
    #[arg(long)]
    verify_ssl: bool,
}

impl From<RunArgs> for WatchdogArgs {
    fn from(args: RunArgs) -> Self {
        WatchdogArgs {
            endpoint: args.endpoint,
            deadline: args.deadline,
            min_interval: args.min_interval,
            max_interval: args.max_interval,
            token_path: args.token_path,
            log_path: args.log_path,
            pid_path: args.pid_path,
            verify_ssl: args.verify_ssl,
        }
    }
}

fn parse_deadline(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|d| d.with_timezone(&Utc))
}

/// Initialize the tracing subscriber, writing to a file in the install root.
///
/// Use RUST_LOG to control the level (e.g. RUST_LOG=vaultkeep_core=debug).
/// The returned guard flushes the writer when dropped.
fn init_tracing(root: &Path) -> Option<WorkerGuard> {
    if let Err(e) = create_private_dir(root) {
        eprintln!("Warning: logging disabled, cannot create {}: {}", root.display(), e);
        return None;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let appender = tracing_appender::rolling::never(root, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
    Some(guard)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let root = match Config::install_root() {
        Ok(root) => root,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let _guard = init_tracing(&root);
    info!(version = env!("CARGO_PKG_VERSION"), "vaultkeep starting");

    let result = match cli.command {
        Some(Commands::Keepalive {
            action: KeepaliveAction::Run(args),
        }) => commands::keepalive_run(args.into()).await,
        command => dispatch(command, cli.endpoint, cli.username).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(
    command: Option<Commands>,
    endpoint: Option<String>,
    username: Option<String>,
) -> anyhow::Result<ExitCode> {
    let mut config = Config::load()?;
    config.apply_overrides(endpoint, username);

    match command.unwrap_or(Commands::Up {
        save_password: false,
    }) {
        Commands::Up { save_password } => commands::up(&config, save_password).await,
        Commands::Login { save_password } => commands::login(&config, save_password).await,
        Commands::Check => commands::check(&config).await,
        Commands::Logoff { forget_password } => commands::logoff(&config, forget_password).await,
        Commands::SshKey { force } => commands::ssh_key(&config, force).await,
        Commands::Keepalive { action } => match action {
            KeepaliveAction::Start => commands::keepalive_start(&config).await,
            KeepaliveAction::Stop => commands::keepalive_stop(&config),
            KeepaliveAction::Status => commands::keepalive_status(&config),
            KeepaliveAction::Run(args) => commands::keepalive_run(args.into()).await,
        },
    }
}
