//! REST API client module for CyberArk PasswordVault.
//!
//! This module provides the `ApiClient` for the handful of calls the
//! session lifecycle needs: RADIUS logon, a cheap authenticated probe,
//! logoff, and retrieval of the MFA-caching SSH key.
//!
//! The vault issues an opaque session token that is sent verbatim in the
//! `Authorization` header (no `Bearer` prefix).

pub mod client;
pub mod error;

pub use client::{ApiClient, SessionApi, SshKeySource};
pub use error::ApiError;
