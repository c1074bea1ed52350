//! Core library for vaultkeep.
//!
//! vaultkeep logs an operator on to a CyberArk PasswordVault REST API once
//! and then keeps that session alive unattended. This crate holds everything
//! except the command-line front end:
//!
//! - [`api`]: REST client for logon, probe, logoff and SSH key retrieval
//! - [`auth`]: token persistence, credential lookup and the session state machine
//! - [`keepalive`]: the detached watchdog loop, its audit log and process control
//! - [`cache`]: the time-boxed SSH key cache
//! - [`config`]: on-disk configuration and install-root paths

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod keepalive;
pub mod utils;

pub use api::{ApiClient, ApiError, SessionApi, SshKeySource};
pub use auth::{AuthError, AuthSession, SessionState, Token, TokenStore};
pub use cache::SshKeyCache;
pub use config::{Config, KeepaliveConfig};
pub use keepalive::{ExitReason, Watchdog, WatchdogArgs, WatchdogHandle};
