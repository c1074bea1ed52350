use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::api::SessionApi;
use crate::config::{Config, ConfigError, KeepaliveConfig};
use crate::keepalive::{LaunchError, WatchdogArgs, WatchdogHandle, WatchdogLauncher};

use super::credentials::SecretSource;
use super::error::AuthError;
use super::token::TokenStore;

/// Lifecycle of the interactive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    /// A refresh failed. Terminal: the host process should exit.
    Failed,
}

/// Authentication state plus ownership of the keepalive watchdog.
///
/// Tokens go through the [`TokenStore`] so the watchdog process sees every
/// re-authentication on its next cycle.
pub struct AuthSession {
    username: Option<String>,
    endpoint: String,
    verify_ssl: bool,
    keepalive: KeepaliveConfig,
    log_path: PathBuf,
    pid_path: PathBuf,
    store: TokenStore,
    api: Arc<dyn SessionApi>,
    secrets: Box<dyn SecretSource>,
    launcher: Box<dyn WatchdogLauncher>,
    watchdog: Option<WatchdogHandle>,
    state: SessionState,
}

impl AuthSession {
    /// Adopts a watchdog left running by an earlier process, if any.
    pub fn new(
        config: &Config,
        api: Arc<dyn SessionApi>,
        secrets: Box<dyn SecretSource>,
        launcher: Box<dyn WatchdogLauncher>,
    ) -> Result<Self, ConfigError> {
        config.keepalive.validate()?;

        let pid_path = config.keepalive_pid_path();
        let watchdog = launcher.find_running(&pid_path);
        if let Some(ref handle) = watchdog {
            debug!(pid = handle.pid, "Adopted running keepalive");
        }

        Ok(Self {
            username: config.username.clone(),
            endpoint: config.endpoint.clone(),
            verify_ssl: config.verify_ssl,
            keepalive: config.keepalive,
            log_path: config.keepalive_log_path(),
            pid_path,
            store: TokenStore::new(config.token_path()),
            api,
            secrets,
            launcher,
            watchdog,
            state: SessionState::Unauthenticated,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.store
    }

    /// Whether the stored token is accepted by the vault right now.
    /// Never changes state.
    pub async fn is_valid(&self) -> bool {
        match self.store.load() {
            Some(token) => self.api.probe(&token).await,
            None => false,
        }
    }

    /// Log on with the configured username. No retry on failure.
    pub async fn authenticate(&mut self, save_password: bool) -> Result<(), AuthError> {
        if self.state == SessionState::Failed {
            return Err(AuthError::SessionFailed);
        }

        let refreshing = self.state == SessionState::Refreshing;
        if !refreshing {
            self.state = SessionState::Authenticating;
        }

        match self.logon(save_password).await {
            Ok(()) => {
                self.state = SessionState::Authenticated;
                Ok(())
            }
            Err(e) => {
                if !refreshing {
                    self.state = SessionState::Unauthenticated;
                }
                Err(e)
            }
        }
    }

    async fn logon(&self, save_password: bool) -> Result<(), AuthError> {
        let username = self.username.as_deref().ok_or(AuthError::NoUsername)?;
        let password = self
            .secrets
            .password(username)
            .map_err(|e| AuthError::Secret(e.to_string()))?;

        info!(username, endpoint = %self.endpoint, "Authenticating");
        let token = self.api.logon(username, &password).await?;
        self.store.save(&token).map_err(AuthError::TokenStore)?;
        info!(username, "Authentication successful");

        if save_password {
            if let Err(e) = self.secrets.remember(username, &password) {
                warn!(error = %e, "Could not save password");
            }
        }
        Ok(())
    }

    /// Probe the stored token and log on again if the vault rejects it.
    /// Call before every sensitive operation.
    pub async fn check_and_refresh(&mut self) -> Result<(), AuthError> {
        if self.state == SessionState::Failed {
            return Err(AuthError::SessionFailed);
        }

        if self.is_valid().await {
            self.state = SessionState::Authenticated;
            return Ok(());
        }

        info!("Session expired, re-authenticating");
        self.state = SessionState::Refreshing;
        match self.authenticate(false).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "Re-authentication failed");
                self.state = SessionState::Failed;
                if let Err(e) = self.store.clear() {
                    warn!(error = %e, "Failed to clear dead token");
                }
                Err(e)
            }
        }
    }

    /// (Re)start the keepalive watchdog, stopping any owned one first.
    pub fn start_keepalive(&mut self) -> Result<&WatchdogHandle, LaunchError> {
        self.stop_keepalive();

        let deadline =
            Utc::now() + chrono::Duration::seconds(self.keepalive.hard_timeout_seconds() as i64);
        let args = WatchdogArgs {
            endpoint: self.endpoint.clone(),
            deadline,
            min_interval: self.keepalive.min_seconds,
            max_interval: self.keepalive.max_seconds,
            token_path: self.store.path().to_path_buf(),
            log_path: self.log_path.clone(),
            pid_path: self.pid_path.clone(),
            verify_ssl: self.verify_ssl,
        };

        let handle = self.launcher.launch(&args)?;
        info!(pid = handle.pid, %deadline, "Keepalive started");
        Ok(self.watchdog.insert(handle))
    }

    /// Best-effort stop of the owned watchdog. Returns the PID that was
    /// signalled, if one was owned. Errors are logged, never returned.
    pub fn stop_keepalive(&mut self) -> Option<u32> {
        let handle = self.watchdog.take()?;
        match self.launcher.terminate(&handle) {
            Ok(()) => info!(pid = handle.pid, "Keepalive stopped"),
            Err(e) => warn!(pid = handle.pid, error = %e, "Could not stop keepalive"),
        }
        Some(handle.pid)
    }

    /// The owned watchdog if it is still running. A dead one is released.
    pub fn keepalive_status(&mut self) -> Option<&WatchdogHandle> {
        let dead = self
            .watchdog
            .as_ref()
            .is_some_and(|handle| !self.launcher.is_alive(handle));
        if dead {
            debug!("Keepalive no longer running");
            self.watchdog = None;
        }
        self.watchdog.as_ref()
    }

    /// End the session: stop the keepalive, log off server-side, delete the
    /// token. Only a failure to delete the token is an error.
    pub async fn logoff(&mut self) -> Result<(), AuthError> {
        self.stop_keepalive();

        if let Some(token) = self.store.load() {
            if let Err(e) = self.api.logoff(&token).await {
                warn!(error = %e, "Server logoff failed");
            }
        }

        self.store.clear().map_err(AuthError::TokenStore)?;
        self.state = SessionState::Unauthenticated;
        info!("Logged off");
        Ok(())
    }
}
