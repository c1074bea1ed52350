//! Command implementations.
//!
//! Each returns the process exit code; hard errors propagate as `anyhow`.

use std::ffi::OsString;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use vaultkeep_core::auth::{CredentialStore, KeyringPrompt, TokenState};
use vaultkeep_core::config::Config;
use vaultkeep_core::keepalive::{run_from_args, stop_requested, KeepaliveLog, ProcessLauncher};
use vaultkeep_core::utils::format_hours;
use vaultkeep_core::{ApiClient, AuthSession, SshKeyCache, WatchdogArgs};

/// Arguments that put the re-executed binary into watchdog mode
const WATCHDOG_SUBCOMMAND: [&str; 2] = ["keepalive", "run"];

fn open_session(config: &Config) -> Result<(AuthSession, ApiClient)> {
    let api = ApiClient::new(&config.endpoint, config.verify_ssl)
        .context("Failed to create API client")?;
    let launcher =
        ProcessLauncher::current_exe(WATCHDOG_SUBCOMMAND.iter().map(OsString::from).collect())?;
    let session = AuthSession::new(
        config,
        Arc::new(api.clone()),
        Box::new(KeyringPrompt),
        Box::new(launcher),
    )
    .context("Invalid keepalive configuration")?;
    Ok((session, api))
}

/// Persist the username that just authenticated, leaving the rest of the
/// stored config alone.
fn remember_username(config: &Config) {
    let Some(username) = config.username.clone() else {
        return;
    };
    let result = Config::load_from(config.root()).and_then(|mut stored| {
        if stored.username.as_deref() == Some(username.as_str()) {
            return Ok(());
        }
        stored.username = Some(username);
        stored.save()
    });
    if let Err(e) = result {
        warn!(error = %format!("{:#}", e), "Failed to save username");
    }
}

async fn authenticate(session: &mut AuthSession, config: &Config, save_password: bool) -> bool {
    match session.authenticate(save_password).await {
        Ok(()) => {
            remember_username(config);
            println!("Authenticated as {}", session.username().unwrap_or_default());
            true
        }
        Err(e) => {
            eprintln!("Authentication failed: {}", e);
            false
        }
    }
}

async fn refresh_ssh_key(
    config: &Config,
    api: &ApiClient,
    session: &AuthSession,
    force: bool,
) -> bool {
    let cache = SshKeyCache::new(config.ssh_key_path(), config.ssh.key_max_age_hours);
    let Some(token) = session.token_store().load() else {
        eprintln!("No session token, cannot download SSH key");
        return false;
    };
    let client = api.with_token(token);

    let ok = if force {
        cache.refresh(&client).await
    } else {
        cache.ensure_fresh(&client).await
    };
    if ok {
        println!("SSH key ready: {}", cache.key_path().display());
    } else {
        eprintln!("Failed to refresh SSH key (see {})", config.root().display());
    }
    ok
}

/// Default flow: reuse or obtain a token, restart the keepalive, refresh
/// the SSH key on the default endpoint.
pub async fn up(config: &Config, save_password: bool) -> Result<ExitCode> {
    let (mut session, api) = open_session(config)?;

    if session.is_valid().await {
        println!("Session token still valid");
    } else if !authenticate(&mut session, config, save_password).await {
        return Ok(ExitCode::FAILURE);
    }

    let handle = session.start_keepalive()?;
    println!(
        "Keepalive running (PID {}) for {}",
        handle.pid,
        format_hours(config.keepalive.hard_timeout())
    );

    if config.is_default_endpoint() {
        if !refresh_ssh_key(config, &api, &session, false).await {
            return Ok(ExitCode::FAILURE);
        }
    } else {
        debug!(endpoint = %config.endpoint, "Skipping SSH key for non-default endpoint");
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn login(config: &Config, save_password: bool) -> Result<ExitCode> {
    let (mut session, _) = open_session(config)?;
    if authenticate(&mut session, config, save_password).await {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

pub async fn check(config: &Config) -> Result<ExitCode> {
    let (session, _) = open_session(config)?;
    match session.token_store().read() {
        TokenState::Missing => {
            println!("No session token");
            return Ok(ExitCode::FAILURE);
        }
        TokenState::Empty => {
            println!("Session token file is empty");
            return Ok(ExitCode::FAILURE);
        }
        TokenState::Present(_) => {}
    }

    if session.is_valid().await {
        println!("Session token valid");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Session token expired or rejected");
        Ok(ExitCode::FAILURE)
    }
}

pub async fn logoff(config: &Config, forget_password: bool) -> Result<ExitCode> {
    let (mut session, _) = open_session(config)?;
    session.logoff().await?;
    println!("Logged off");

    if forget_password {
        if let Some(username) = session.username() {
            match CredentialStore::delete(username) {
                Ok(()) => println!("Removed saved password for {}", username),
                Err(e) => warn!(error = %format!("{:#}", e), "Failed to remove saved password"),
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn ssh_key(config: &Config, force: bool) -> Result<ExitCode> {
    let cache = SshKeyCache::new(config.ssh_key_path(), config.ssh.key_max_age_hours);
    if !force && cache.is_fresh() {
        println!("SSH key still valid: {}", cache.key_path().display());
        return Ok(ExitCode::SUCCESS);
    }

    let (mut session, api) = open_session(config)?;
    if let Err(e) = session.check_and_refresh().await {
        eprintln!("Authentication failed: {}", e);
        return Ok(ExitCode::FAILURE);
    }
    remember_username(config);

    if refresh_ssh_key(config, &api, &session, force).await {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

pub async fn keepalive_start(config: &Config) -> Result<ExitCode> {
    let (mut session, _) = open_session(config)?;
    if let Err(e) = session.check_and_refresh().await {
        eprintln!("Authentication failed: {}", e);
        return Ok(ExitCode::FAILURE);
    }

    let handle = session.start_keepalive()?;
    println!(
        "Keepalive running (PID {}) for {}",
        handle.pid,
        format_hours(config.keepalive.hard_timeout())
    );
    Ok(ExitCode::SUCCESS)
}

pub fn keepalive_stop(config: &Config) -> Result<ExitCode> {
    let (mut session, _) = open_session(config)?;
    match session.stop_keepalive() {
        Some(pid) => println!("Stopped keepalive (PID {})", pid),
        None => println!("No keepalive running"),
    }
    Ok(ExitCode::SUCCESS)
}

pub fn keepalive_status(config: &Config) -> Result<ExitCode> {
    let (mut session, _) = open_session(config)?;
    let log = KeepaliveLog::new(config.keepalive_log_path());

    let code = match session.keepalive_status() {
        Some(handle) => {
            println!("Keepalive running (PID {})", handle.pid);
            ExitCode::SUCCESS
        }
        None => {
            println!("No keepalive running");
            ExitCode::FAILURE
        }
    };
    if let Some(line) = log.last_line() {
        println!("Last log entry: {}", line);
    }
    Ok(code)
}

/// Body of the detached watchdog process
pub async fn keepalive_run(args: WatchdogArgs) -> Result<ExitCode> {
    let report = run_from_args(args, stop_requested()).await?;
    Ok(ExitCode::from(report.reason.exit_code()))
}
